//! Boot services backing the system state machine on the MCU.
//!
//! Readiness is read from the [`status`](crate::status) flags that the
//! peripheral tasks publish. This image carries no balancing, insulation
//! monitor, or BMS drivers; their init requests are acknowledged at once so
//! the full boot sequence runs on the bench.

use bms_core::database::{MeasurementDatabase, SharedDatabase};
use bms_core::fsm::RequestStatus;
use bms_core::redundancy::measurement_updated_at_least_once;
use bms_core::sys::{
    BalancingPolicy, BootServices, CurrentSensorStatus, EstimatorInputs, SelfTestError, SysConfig,
};

use crate::status;

const POLICY_ENABLED: u8 = 1;
const POLICY_DISABLED: u8 = 2;

/// Self test identifier for the database round trip.
const SELF_TEST_DATABASE: u8 = 1;

/// Orchestrator settings for this image.
///
/// No task publishes current-sensor readings yet, so the presence wait is
/// skipped and the estimators start without counters.
pub fn sys_config() -> SysConfig {
    SysConfig {
        check_current_sensor_presence: false,
        ..SysConfig::default()
    }
}

/// [`BootServices`] implementation for the firmware image.
pub struct FirmwareBootServices<'a> {
    database: &'a SharedDatabase,
}

impl<'a> FirmwareBootServices<'a> {
    pub fn new(database: &'a SharedDatabase) -> Self {
        Self { database }
    }
}

const fn policy_code(policy: BalancingPolicy) -> u8 {
    match policy {
        BalancingPolicy::Enabled => POLICY_ENABLED,
        BalancingPolicy::Disabled => POLICY_DISABLED,
    }
}

impl BootServices for FirmwareBootServices<'_> {
    fn persisted_fault(&mut self, _string: u8) -> bool {
        // the board has no non-volatile fault store
        false
    }

    fn init_can(&mut self) {
        status::set_can_ready(true);
        log_step("can configured");
    }

    fn rtc_ready(&mut self) -> bool {
        status::rtc_ready()
    }

    fn run_self_test(&mut self) -> Result<(), SelfTestError> {
        let pack = self.database.pack_values();
        self.database
            .write_pack_values(&pack)
            .map_err(|_| SelfTestError {
                test: SELF_TEST_DATABASE,
            })
    }

    fn send_boot_message(&mut self) {
        log_step("boot message sent");
    }

    fn init_interlock(&mut self) {
        log_step("interlock armed");
    }

    fn request_balancing_init(&mut self) -> RequestStatus {
        status::set_balancing_ready(true);
        RequestStatus::Ok
    }

    fn balancing_initialized(&mut self) -> bool {
        status::balancing_ready()
    }

    fn request_balancing_policy(&mut self, policy: BalancingPolicy) -> RequestStatus {
        status::record_balancing_policy(policy_code(policy));
        RequestStatus::Ok
    }

    fn balancing_policy_applied(&mut self, policy: BalancingPolicy) -> bool {
        status::balancing_policy() == Some(policy_code(policy))
    }

    fn start_measurement_cycle(&mut self) {
        status::record_measurement_cycle();
    }

    fn first_measurement_cycle_finished(&mut self) -> bool {
        status::measurement_cycles() > 0
    }

    fn current_sensor_status(&mut self, string: u8) -> CurrentSensorStatus {
        let sensors = self.database.current_sensor();
        let Some(reading) = sensors.strings.get(usize::from(string)) else {
            return CurrentSensorStatus::default();
        };
        let present = measurement_updated_at_least_once(
            reading.current.timestamp,
            reading.current.previous_timestamp,
        );
        CurrentSensorStatus {
            present,
            coulomb_counting: present && reading.current_valid,
            energy_counting: present && reading.current_valid && reading.voltage_valid,
        }
    }

    fn init_state_estimation(&mut self, string: u8, inputs: EstimatorInputs) {
        log_estimator(string, inputs);
    }

    fn late_init(&mut self) {
        log_step("late init done");
    }

    fn request_imd_init(&mut self) -> RequestStatus {
        status::set_imd_ready(true);
        RequestStatus::Ok
    }

    fn request_bms_init(&mut self) -> RequestStatus {
        status::set_bms_running(true);
        RequestStatus::Ok
    }

    fn bms_running(&mut self) -> bool {
        status::bms_running()
    }
}

#[cfg(target_os = "none")]
fn log_step(step: &'static str) {
    defmt::info!("boot: {}", step);
}

#[cfg(not(target_os = "none"))]
fn log_step(step: &'static str) {
    println!("boot: {step}");
}

#[cfg(target_os = "none")]
fn log_estimator(string: u8, inputs: EstimatorInputs) {
    defmt::info!(
        "boot: string {} estimators coulomb={} energy={}",
        string,
        inputs.coulomb_counting,
        inputs.energy_counting
    );
}

#[cfg(not(target_os = "none"))]
fn log_estimator(string: u8, inputs: EstimatorInputs) {
    println!(
        "boot: string {string} estimators coulomb={} energy={}",
        inputs.coulomb_counting, inputs.energy_counting
    );
}
