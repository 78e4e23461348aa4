//! Simulated collaborators around the control core.

use std::cell::RefCell;
use std::collections::VecDeque;

use bms_core::config::{CELLS_PER_STRING, STRING_COUNT};
use bms_core::database::{
    CellMask, CellTemperatureBlock, CellVoltageBlock, CurrentSensorString, MeasurementSource,
    SharedDatabase,
};
use bms_core::fsm::RequestStatus;
use bms_core::rtc::{TimeSetError, TimeSetQueue, TimeSetRequest};
use bms_core::sbc::{CompanionError, SafetyCompanion};
use bms_core::sys::{
    BalancingPolicy, BootServices, CurrentSensorStatus, EstimatorInputs, SelfTestError,
};
use bms_core::time::Tick;

/// Nominal cell voltage in millivolts.
pub const CELL_MV: i16 = 3_650;
/// Nominal cell temperature in tenths of a degree.
pub const CELL_DDEG_C: i16 = 251;
/// Offset of the redundant path against the base path, within tolerance.
const REDUNDANT_OFFSET_MV: i16 = 4;
/// Discharge current per string in milliamperes.
pub const STRING_CURRENT_MA: i32 = 12_000;

/// Both cell-measurement paths plus the current sensors.
#[derive(Debug, Default)]
pub struct SimAfe {
    /// Source that stopped publishing.
    pub stale: Option<MeasurementSource>,
    /// Cells of string 0 flagged invalid by both sources.
    pub invalid_cells: u8,
    pub current_sensor_present: bool,
    pub cycles: u32,
}

impl SimAfe {
    pub fn new(current_sensor_present: bool) -> Self {
        Self {
            current_sensor_present,
            ..Self::default()
        }
    }

    /// Publishes one measurement cycle stamped at `now`.
    pub fn publish(&mut self, database: &SharedDatabase, now: Tick) {
        self.cycles += 1;
        for source in MeasurementSource::ALL {
            if self.stale == Some(source) {
                continue;
            }
            let offset = match source {
                MeasurementSource::Base => 0,
                MeasurementSource::Redundant => REDUNDANT_OFFSET_MV,
            };
            database.publish_cell_voltages(source, self.voltages(offset), now);
            database.publish_cell_temperatures(source, self.temperatures(), now);
        }

        if !self.current_sensor_present {
            return;
        }
        let string_voltage_mv = i32::from(CELL_MV) * i32::try_from(CELLS_PER_STRING).unwrap_or(0);
        for string in 0..STRING_COUNT {
            let reading = CurrentSensorString {
                current_ma: STRING_CURRENT_MA,
                current_valid: true,
                string_voltage_mv,
                voltage_valid: true,
                ..CurrentSensorString::default()
            };
            database.publish_current_sensor(u8::try_from(string).unwrap_or(u8::MAX), reading, now);
        }
    }

    fn voltages(&self, offset: i16) -> CellVoltageBlock {
        let mut block = CellVoltageBlock::default();
        for readings in &mut block.strings {
            readings.values = [CELL_MV + offset; CELLS_PER_STRING];
            readings.invalid = CellMask::EMPTY;
        }
        for cell in 0..usize::from(self.invalid_cells).min(CELLS_PER_STRING) {
            block.strings[0].invalid.insert(cell);
        }
        block
    }

    fn temperatures(&self) -> CellTemperatureBlock {
        let mut block = CellTemperatureBlock::default();
        for readings in &mut block.strings {
            readings.values.fill(CELL_DDEG_C);
            readings.invalid = CellMask::EMPTY;
        }
        block
    }
}

/// Safety companion that answers over a perfect bus unless told to fail.
#[derive(Debug)]
pub struct SimCompanion {
    /// Phase-1 attempts still to fail.
    pub phase1_failures: u32,
    refreshes_required: u8,
    refreshes: u8,
    pub ignition: bool,
}

impl SimCompanion {
    pub fn new() -> Self {
        Self {
            phase1_failures: 0,
            refreshes_required: 2,
            refreshes: 0,
            ignition: true,
        }
    }
}

impl Default for SimCompanion {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyCompanion for SimCompanion {
    fn init_phase1(&mut self) -> Result<(), CompanionError> {
        if self.phase1_failures > 0 {
            self.phase1_failures -= 1;
            return Err(CompanionError::Communication);
        }
        Ok(())
    }

    fn fault_counter_refreshes_required(&mut self) -> Result<u8, CompanionError> {
        self.refreshes = 0;
        Ok(self.refreshes_required)
    }

    fn fault_counter_cleared(&mut self) -> Result<bool, CompanionError> {
        Ok(self.refreshes >= self.refreshes_required)
    }

    fn check_safety_path(&mut self) -> Result<(), CompanionError> {
        Ok(())
    }

    fn trigger_watchdog(&mut self) -> Result<(), CompanionError> {
        self.refreshes = self.refreshes.saturating_add(1);
        Ok(())
    }

    fn ignition_active(&mut self) -> Option<bool> {
        Some(self.ignition)
    }
}

/// Boot collaborators that acknowledge immediately.
#[derive(Debug, Default)]
pub struct SimServices {
    pub rtc_ready: bool,
    pub current_sensor_present: bool,
    balancing_initialized: bool,
    balancing_policy: Option<BalancingPolicy>,
    measuring: bool,
    bms_running: bool,
    pub estimators: Vec<(u8, EstimatorInputs)>,
}

impl SimServices {
    pub fn new(rtc_ready: bool, current_sensor_present: bool) -> Self {
        Self {
            rtc_ready,
            current_sensor_present,
            ..Self::default()
        }
    }
}

impl BootServices for SimServices {
    fn persisted_fault(&mut self, _string: u8) -> bool {
        false
    }

    fn init_can(&mut self) {}

    fn rtc_ready(&mut self) -> bool {
        self.rtc_ready
    }

    fn run_self_test(&mut self) -> Result<(), SelfTestError> {
        Ok(())
    }

    fn send_boot_message(&mut self) {}

    fn init_interlock(&mut self) {}

    fn request_balancing_init(&mut self) -> RequestStatus {
        self.balancing_initialized = true;
        RequestStatus::Ok
    }

    fn balancing_initialized(&mut self) -> bool {
        self.balancing_initialized
    }

    fn request_balancing_policy(&mut self, policy: BalancingPolicy) -> RequestStatus {
        self.balancing_policy = Some(policy);
        RequestStatus::Ok
    }

    fn balancing_policy_applied(&mut self, policy: BalancingPolicy) -> bool {
        self.balancing_policy == Some(policy)
    }

    fn start_measurement_cycle(&mut self) {
        self.measuring = true;
    }

    fn first_measurement_cycle_finished(&mut self) -> bool {
        self.measuring
    }

    fn current_sensor_status(&mut self, _string: u8) -> CurrentSensorStatus {
        CurrentSensorStatus {
            present: self.current_sensor_present,
            coulomb_counting: self.current_sensor_present,
            energy_counting: self.current_sensor_present,
        }
    }

    fn init_state_estimation(&mut self, string: u8, inputs: EstimatorInputs) {
        self.estimators.push((string, inputs));
    }

    fn late_init(&mut self) {}

    fn request_imd_init(&mut self) -> RequestStatus {
        RequestStatus::Ok
    }

    fn request_bms_init(&mut self) -> RequestStatus {
        self.bms_running = true;
        RequestStatus::Ok
    }

    fn bms_running(&mut self) -> bool {
        self.bms_running
    }
}

/// Bounded hand-off drained by the simulated RTC once per step.
#[derive(Debug)]
pub struct SimRtcQueue {
    capacity: usize,
    pending: RefCell<VecDeque<TimeSetRequest>>,
}

impl SimRtcQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: RefCell::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn pop(&self) -> Option<TimeSetRequest> {
        self.pending.borrow_mut().pop_front()
    }
}

impl TimeSetQueue for SimRtcQueue {
    fn try_submit(&self, request: TimeSetRequest) -> Result<(), TimeSetError> {
        let mut pending = self.pending.borrow_mut();
        if pending.len() >= self.capacity {
            return Err(TimeSetError::QueueFull);
        }
        pending.push_back(request);
        Ok(())
    }
}
