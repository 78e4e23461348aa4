//! Supervisor for the hardware safety companion (system basis chip).
//!
//! The companion resets the MCU if its watchdog is not serviced and keeps a
//! fault error counter that must be drained before the safety path may be
//! released. Initialization walks through phase-1 setup, the two-part fault
//! counter reset, and the safety-path self-test, each with a bounded retry
//! budget. Once running, the machine services the watchdog on a fixed
//! countdown.
//!
//! `Running` never moves to `Error`: a failed watchdog refresh after
//! initialization is ignored here and left to the companion's own reset
//! behaviour.

use core::fmt;
use core::time::Duration;

use crate::fsm::{
    FsmCore, HierarchicalState, LONG_DWELL, Machine, Mailbox, RequestStatus, SHORT_DWELL,
    StateMachine, Transition,
};
use crate::time::duration_to_millis;

/// Attempts allowed per initialization step after the first failure.
pub const SBC_RETRY_BUDGET: u8 = 3;

/// Initialization steps, in execution order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SbcInitStep {
    Entry,
    ResetFaultCounterPart1,
    ResetFaultCounterPart2,
    SafetyPathCheck,
}

impl fmt::Display for SbcInitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SbcInitStep::Entry => "entry",
            SbcInitStep::ResetFaultCounterPart1 => "reset-fault-counter-1",
            SbcInitStep::ResetFaultCounterPart2 => "reset-fault-counter-2",
            SbcInitStep::SafetyPathCheck => "safety-path-check",
        };
        f.write_str(label)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SbcState {
    Uninitialized,
    Initialization(SbcInitStep),
    Running,
    /// Initialization gave up in the contained step.
    Error(SbcInitStep),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SbcTopState {
    Uninitialized,
    Initialization,
    Running,
    Error,
}

impl HierarchicalState for SbcState {
    type Top = SbcTopState;

    fn top(self) -> SbcTopState {
        match self {
            SbcState::Uninitialized => SbcTopState::Uninitialized,
            SbcState::Initialization(_) => SbcTopState::Initialization,
            SbcState::Running => SbcTopState::Running,
            SbcState::Error(_) => SbcTopState::Error,
        }
    }

    fn entry(self) -> Self {
        match self {
            SbcState::Initialization(_) => SbcState::Initialization(SbcInitStep::Entry),
            other => other,
        }
    }
}

impl fmt::Display for SbcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SbcState::Uninitialized => f.write_str("uninitialized"),
            SbcState::Initialization(step) => write!(f, "initialization/{step}"),
            SbcState::Running => f.write_str("running"),
            SbcState::Error(step) => write!(f, "error/{step}"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SbcRequest {
    Init,
}

impl SbcRequest {
    pub const RAW_INIT: u8 = 1;
}

/// Request rules of the supervisor.
pub struct SbcMachine;

impl Machine for SbcMachine {
    type State = SbcState;
    type Request = SbcRequest;

    const INITIAL: SbcState = SbcState::Uninitialized;

    fn check_request(
        current: SbcState,
        pending: Option<SbcRequest>,
        request: SbcRequest,
    ) -> RequestStatus {
        if pending.is_some() {
            return RequestStatus::RequestPending;
        }

        match request {
            SbcRequest::Init if current == SbcState::Uninitialized => RequestStatus::Ok,
            SbcRequest::Init => RequestStatus::AlreadyInitialized,
        }
    }

    fn decode_request(raw: u8) -> Option<SbcRequest> {
        match raw {
            SbcRequest::RAW_INIT => Some(SbcRequest::Init),
            _ => None,
        }
    }
}

pub type SbcMailbox = Mailbox<SbcMachine>;

/// Failure reported by the companion driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompanionError {
    /// The bus transfer to the companion failed.
    Communication,
    /// The companion answered but reported a failure.
    Rejected,
}

impl fmt::Display for CompanionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompanionError::Communication => f.write_str("companion communication failed"),
            CompanionError::Rejected => f.write_str("companion rejected the operation"),
        }
    }
}

/// Driver seam for the safety companion chip.
pub trait SafetyCompanion {
    /// Runs the phase-1 configuration that must happen right after reset.
    fn init_phase1(&mut self) -> Result<(), CompanionError>;

    /// Number of good watchdog refreshes that drain the fault error counter.
    fn fault_counter_refreshes_required(&mut self) -> Result<u8, CompanionError>;

    /// Returns `true` once the fault error counter reads zero.
    fn fault_counter_cleared(&mut self) -> Result<bool, CompanionError>;

    /// Exercises the safety output path and checks it reacts.
    fn check_safety_path(&mut self) -> Result<(), CompanionError>;

    /// Services the companion watchdog.
    fn trigger_watchdog(&mut self) -> Result<(), CompanionError>;

    /// Samples the ignition / wake input, when the board routes it.
    fn ignition_active(&mut self) -> Option<bool> {
        None
    }
}

/// Supervisor tuning.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SbcConfig {
    /// Period of the task that triggers the supervisor.
    pub task_period: Duration,
    /// Interval between watchdog refreshes.
    pub watchdog_period: Duration,
    pub retry_budget: u8,
}

impl SbcConfig {
    /// Watchdog period expressed in supervisor triggers (at least one).
    #[must_use]
    pub fn watchdog_period_ticks(&self) -> u16 {
        let task = duration_to_millis(self.task_period).max(1);
        let ticks = duration_to_millis(self.watchdog_period) / task;
        u16::try_from(ticks).unwrap_or(u16::MAX).max(1)
    }
}

impl Default for SbcConfig {
    fn default() -> Self {
        Self {
            task_period: Duration::from_millis(10),
            watchdog_period: Duration::from_millis(100),
            retry_budget: SBC_RETRY_BUDGET,
        }
    }
}

/// Reloading countdown that paces watchdog refreshes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WatchdogCountdown {
    period: u16,
    remaining: u16,
}

impl WatchdogCountdown {
    #[must_use]
    pub const fn new(period: u16) -> Self {
        Self {
            period,
            remaining: period,
        }
    }

    /// Advances one tick; returns `true` on the tick where the countdown reloads.
    pub fn tick(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.remaining = self.period;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub const fn remaining(&self) -> u16 {
        self.remaining
    }
}

/// Safety companion supervisor instance.
pub struct Sbc<'a, C: SafetyCompanion> {
    core: FsmCore<'a, SbcMachine>,
    companion: C,
    config: SbcConfig,
    watchdog: WatchdogCountdown,
    step_failures: u8,
    required_refreshes: u8,
    refreshes_remaining: u8,
    watchdog_triggers: u32,
    ignition: Option<bool>,
}

impl<'a, C: SafetyCompanion> Sbc<'a, C> {
    pub fn new(mailbox: &'a SbcMailbox, companion: C, config: SbcConfig) -> Self {
        Self {
            core: FsmCore::new(mailbox),
            companion,
            watchdog: WatchdogCountdown::new(config.watchdog_period_ticks()),
            config,
            step_failures: 0,
            required_refreshes: 0,
            refreshes_remaining: 0,
            watchdog_triggers: 0,
            ignition: None,
        }
    }

    pub fn mailbox(&self) -> &'a SbcMailbox {
        self.core.mailbox()
    }

    pub fn companion(&self) -> &C {
        &self.companion
    }

    pub fn companion_mut(&mut self) -> &mut C {
        &mut self.companion
    }

    /// Last sampled ignition level. Not yet used for shutdown sequencing.
    pub fn ignition(&self) -> Option<bool> {
        self.ignition
    }

    /// Watchdog refreshes issued while running.
    pub fn watchdog_triggers(&self) -> u32 {
        self.watchdog_triggers
    }

    pub fn retry_counter(&self) -> u32 {
        self.core.retry_counter()
    }

    fn advance(&mut self, next: SbcState) -> Transition<SbcState> {
        self.step_failures = 0;
        Transition::to(next, SHORT_DWELL)
    }

    /// Retries `step` until the budget is spent, then parks in `Error(step)`.
    fn retry_or_fail(&mut self, step: SbcInitStep, retry: SbcState) -> Transition<SbcState> {
        self.core.record_retry();
        if self.step_failures >= self.config.retry_budget {
            Transition::to(SbcState::Error(step), LONG_DWELL)
        } else {
            self.step_failures += 1;
            Transition::to(retry, SHORT_DWELL)
        }
    }

    fn process_initialization(&mut self, step: SbcInitStep) -> Transition<SbcState> {
        match step {
            SbcInitStep::Entry => match self.companion.init_phase1() {
                Ok(()) => self.advance(SbcState::Initialization(
                    SbcInitStep::ResetFaultCounterPart1,
                )),
                Err(_) => self.retry_or_fail(step, SbcState::Initialization(step)),
            },
            SbcInitStep::ResetFaultCounterPart1 => {
                match self.companion.fault_counter_refreshes_required() {
                    Ok(refreshes) => {
                        self.required_refreshes = refreshes;
                        self.refreshes_remaining = refreshes;
                        self.advance(SbcState::Initialization(
                            SbcInitStep::ResetFaultCounterPart2,
                        ))
                    }
                    Err(_) => self.retry_or_fail(step, SbcState::Initialization(step)),
                }
            }
            SbcInitStep::ResetFaultCounterPart2 => self.drain_fault_counter(),
            SbcInitStep::SafetyPathCheck => match self.companion.check_safety_path() {
                Ok(()) => {
                    self.watchdog = WatchdogCountdown::new(self.config.watchdog_period_ticks());
                    self.advance(SbcState::Running)
                }
                Err(_) => self.retry_or_fail(step, SbcState::Initialization(step)),
            },
        }
    }

    /// Refreshes the watchdog once per period until the counter should be
    /// drained, then verifies it.
    fn drain_fault_counter(&mut self) -> Transition<SbcState> {
        let step = SbcInitStep::ResetFaultCounterPart2;
        let period = self.config.watchdog_period_ticks();

        if self.refreshes_remaining > 0 {
            if self.companion.trigger_watchdog().is_err() {
                self.refreshes_remaining = self.required_refreshes;
                return self.retry_or_fail(step, SbcState::Initialization(step));
            }
            self.refreshes_remaining -= 1;
            return Transition::to(SbcState::Initialization(step), period);
        }

        match self.companion.fault_counter_cleared() {
            Ok(true) => self.advance(SbcState::Initialization(SbcInitStep::SafetyPathCheck)),
            Ok(false) | Err(_) => {
                self.refreshes_remaining = self.required_refreshes;
                self.retry_or_fail(step, SbcState::Initialization(step))
            }
        }
    }

    fn process_running(&mut self) -> Transition<SbcState> {
        if self.watchdog.tick() {
            self.watchdog_triggers = self.watchdog_triggers.wrapping_add(1);
            let _ = self.companion.trigger_watchdog();
        }
        self.ignition = self.companion.ignition_active();
        Transition::to(SbcState::Running, SHORT_DWELL)
    }
}

impl<'a, C: SafetyCompanion> StateMachine<'a> for Sbc<'a, C> {
    type Machine = SbcMachine;

    fn core(&self) -> &FsmCore<'a, SbcMachine> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FsmCore<'a, SbcMachine> {
        &mut self.core
    }

    fn process(&mut self, state: SbcState, request: Option<SbcRequest>) -> Transition<SbcState> {
        match state {
            SbcState::Uninitialized => match request {
                Some(SbcRequest::Init) => {
                    self.core.reset_counters();
                    self.step_failures = 0;
                    Transition::to(SbcState::Initialization(SbcInitStep::Entry), SHORT_DWELL)
                }
                None => Transition::to(state, SHORT_DWELL),
            },
            SbcState::Initialization(step) => self.process_initialization(step),
            SbcState::Running => self.process_running(),
            SbcState::Error(_) => Transition::to(state, LONG_DWELL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_fires_only_on_reload() {
        let mut countdown = WatchdogCountdown::new(3);
        let fired: [bool; 7] = core::array::from_fn(|_| countdown.tick());
        assert_eq!(fired, [false, false, true, false, false, true, false]);
        assert_eq!(countdown.remaining(), 2);
    }

    #[test]
    fn single_tick_period_fires_every_tick() {
        let mut countdown = WatchdogCountdown::new(1);
        assert!(countdown.tick());
        assert!(countdown.tick());
    }

    #[test]
    fn watchdog_period_ticks_from_config() {
        let config = SbcConfig::default();
        assert_eq!(config.watchdog_period_ticks(), 10);

        let fast = SbcConfig {
            watchdog_period: Duration::from_millis(1),
            ..SbcConfig::default()
        };
        assert_eq!(fast.watchdog_period_ticks(), 1);
    }

    #[test]
    fn second_init_request_reports_already_initialized() {
        assert_eq!(
            SbcMachine::check_request(
                SbcState::Initialization(SbcInitStep::Entry),
                None,
                SbcRequest::Init
            ),
            RequestStatus::AlreadyInitialized
        );
        assert_eq!(
            SbcMachine::check_request(SbcState::Uninitialized, Some(SbcRequest::Init), SbcRequest::Init),
            RequestStatus::RequestPending
        );
        assert_eq!(SbcMachine::decode_request(7), None);
    }
}
