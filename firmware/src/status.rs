//! Shared status storage for the firmware target.
//!
//! Tasks that own a peripheral publish its readiness here; the boot services
//! read the flags back while the system state machine waits on them. Only
//! atomics are used so any task may update a flag without a critical section.

use core::fmt;

use portable_atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

/// Set once the RTC holds a valid calendar time.
static RTC_READY: AtomicBool = AtomicBool::new(false);
/// Number of time-set requests applied to the RTC.
static RTC_UPDATES: AtomicU32 = AtomicU32::new(0);
/// Set once the CAN peripheral is configured.
static CAN_READY: AtomicBool = AtomicBool::new(false);
/// Set once the balancing driver acknowledged its init request.
static BALANCING_READY: AtomicBool = AtomicBool::new(false);
/// Balancing policy currently applied (0 == none, 1 == enabled, 2 == disabled).
static BALANCING_POLICY: AtomicU8 = AtomicU8::new(POLICY_NONE);
/// Completed measurement cycles since boot.
static MEASUREMENT_CYCLES: AtomicU32 = AtomicU32::new(0);
/// Set once the insulation monitor accepted its init request.
static IMD_READY: AtomicBool = AtomicBool::new(false);
/// Set once the BMS state machine reports running.
static BMS_RUNNING: AtomicBool = AtomicBool::new(false);
/// Console lines rejected since boot.
static CONSOLE_ERRORS: AtomicU32 = AtomicU32::new(0);

const POLICY_NONE: u8 = 0;

/// Marks whether the RTC holds a valid time.
pub fn set_rtc_ready(ready: bool) {
    RTC_READY.store(ready, Ordering::Release);
}

pub fn rtc_ready() -> bool {
    RTC_READY.load(Ordering::Acquire)
}

/// Counts an applied time-set request and marks the RTC ready.
pub fn record_rtc_update() {
    RTC_UPDATES.fetch_add(1, Ordering::Relaxed);
    set_rtc_ready(true);
}

pub fn set_can_ready(ready: bool) {
    CAN_READY.store(ready, Ordering::Release);
}

pub fn set_balancing_ready(ready: bool) {
    BALANCING_READY.store(ready, Ordering::Release);
}

pub fn balancing_ready() -> bool {
    BALANCING_READY.load(Ordering::Acquire)
}

/// Records the policy code the balancing driver applied.
pub fn record_balancing_policy(code: u8) {
    BALANCING_POLICY.store(code, Ordering::Release);
}

/// Returns the applied policy code, if any policy was applied yet.
pub fn balancing_policy() -> Option<u8> {
    match BALANCING_POLICY.load(Ordering::Acquire) {
        POLICY_NONE => None,
        code => Some(code),
    }
}

/// Counts a finished measurement cycle.
pub fn record_measurement_cycle() {
    MEASUREMENT_CYCLES.fetch_add(1, Ordering::Relaxed);
}

pub fn measurement_cycles() -> u32 {
    MEASUREMENT_CYCLES.load(Ordering::Relaxed)
}

pub fn set_imd_ready(ready: bool) {
    IMD_READY.store(ready, Ordering::Release);
}

pub fn set_bms_running(running: bool) {
    BMS_RUNNING.store(running, Ordering::Release);
}

pub fn bms_running() -> bool {
    BMS_RUNNING.load(Ordering::Acquire)
}

pub fn record_console_error() {
    CONSOLE_ERRORS.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time copy of every flag, logged on system state changes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Snapshot {
    pub rtc_ready: bool,
    pub rtc_updates: u32,
    pub can_ready: bool,
    pub balancing_ready: bool,
    pub balancing_policy: Option<u8>,
    pub measurement_cycles: u32,
    pub imd_ready: bool,
    pub bms_running: bool,
    pub console_errors: u32,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        rtc_ready: rtc_ready(),
        rtc_updates: RTC_UPDATES.load(Ordering::Relaxed),
        can_ready: CAN_READY.load(Ordering::Acquire),
        balancing_ready: balancing_ready(),
        balancing_policy: balancing_policy(),
        measurement_cycles: measurement_cycles(),
        imd_ready: IMD_READY.load(Ordering::Acquire),
        bms_running: bms_running(),
        console_errors: CONSOLE_ERRORS.load(Ordering::Relaxed),
    }
}

const fn flag(set: bool) -> &'static str {
    if set { "up" } else { "down" }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rtc={} (updates {}) can={} balancing={}",
            flag(self.rtc_ready),
            self.rtc_updates,
            flag(self.can_ready),
            flag(self.balancing_ready),
        )?;
        match self.balancing_policy {
            Some(code) => write!(f, " policy={code}")?,
            None => f.write_str(" policy=none")?,
        }
        write!(
            f,
            " cycles={} imd={} bms={} console-errors={}",
            self.measurement_cycles,
            flag(self.imd_ready),
            flag(self.bms_running),
            self.console_errors,
        )
    }
}

/// Serializes tests that touch the global flags.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Clears every flag.
#[cfg(test)]
pub fn reset() {
    RTC_READY.store(false, Ordering::Relaxed);
    RTC_UPDATES.store(0, Ordering::Relaxed);
    CAN_READY.store(false, Ordering::Relaxed);
    BALANCING_READY.store(false, Ordering::Relaxed);
    BALANCING_POLICY.store(POLICY_NONE, Ordering::Relaxed);
    MEASUREMENT_CYCLES.store(0, Ordering::Relaxed);
    IMD_READY.store(false, Ordering::Relaxed);
    BMS_RUNNING.store(false, Ordering::Relaxed);
    CONSOLE_ERRORS.store(0, Ordering::Relaxed);
}
