use bms_core::config::{CELLS_PER_STRING, TEMP_SENSORS_PER_STRING};
use bms_core::database::{
    CellMask, CellTemperatureBlock, CellVoltageBlock, CurrentSensorString, MeasurementDatabase,
    MeasurementSource, SharedDatabase, ValidatedCellVoltages,
};
use bms_core::diag::{DiagEvent, DiagId, DiagScope, DiagnosisLog};
use bms_core::redundancy::{MeasurementStatus, RedundancyValidator, ValidatorConfig};
use bms_core::time::{ManualClock, Tick, TickSource};

const NOMINAL_MV: i16 = 3_600;
/// 25.0 degrees in tenths.
const NOMINAL_DDEG: i16 = 250;

#[test]
fn five_invalid_cells_are_replaced_by_the_string_average() {
    let rig = Rig::new(1_000);
    let mut validator = rig.validator();
    let block = voltages(alternating, &[0, 1, 2, 3, 4]);
    rig.publish_both(&block);

    assert_eq!(validator.validate_afe_measurement(), MeasurementStatus::Ok);

    let validated = rig.database.validated_cell_voltages();
    let string = &validated.strings[0];
    assert!(string.valid);
    assert_eq!(string.missing.count(), 5);
    // eleven measured cells average to 3610 mV
    assert_eq!(&string.values[..5], &[3_610; 5]);
    assert_eq!(string.summary.average, 3_610);
    assert_eq!(string.summary.min, 3_600);
    assert_eq!(string.summary.max, 3_620);
    assert!(validated.strings[1].valid);
    assert!(
        !rig.diag
            .is_active(DiagId::CellVoltageInvalidCells, DiagScope::String(0))
    );
}

#[test]
fn six_invalid_cells_invalidate_the_string() {
    let rig = Rig::new(1_000);
    let mut validator = rig.validator();
    rig.publish_both(&voltages(alternating, &[0, 1, 2, 3, 4, 5]));

    validator.validate_afe_measurement();

    let validated = rig.database.validated_cell_voltages();
    assert!(!validated.strings[0].valid);
    assert_eq!(validated.strings[0].missing.count(), 6);
    assert!(validated.strings[1].valid);
    assert!(
        rig.diag
            .is_active(DiagId::CellVoltageInvalidCells, DiagScope::String(0))
    );
    assert_eq!(
        rig.diag.latest_for(DiagId::CellVoltageInvalidCells, DiagScope::String(0)),
        Some(6)
    );
}

#[test]
fn second_call_without_new_data_changes_nothing() {
    let rig = Rig::new(1_000);
    let mut validator = rig.validator();
    rig.publish_both(&voltages(|_| NOMINAL_MV, &[]));

    assert_eq!(validator.validate_afe_measurement(), MeasurementStatus::Ok);
    let first = rig.database.validated_cell_voltages();

    rig.clock.advance(10);
    assert_eq!(validator.validate_afe_measurement(), MeasurementStatus::NotOk);
    assert_eq!(rig.database.validated_cell_voltages(), first);

    rig.clock.advance(10);
    rig.publish_both(&voltages(|_| NOMINAL_MV + 5, &[]));
    assert_eq!(validator.validate_afe_measurement(), MeasurementStatus::Ok);
    let third = rig.database.validated_cell_voltages();
    assert_eq!(third.strings[0].values, [NOMINAL_MV + 5; CELLS_PER_STRING]);
    assert_eq!(third.header.previous_timestamp, first.header.timestamp);
}

#[test]
fn nothing_published_yet_is_not_ok() {
    let rig = Rig::new(1_000);
    let mut validator = rig.validator();
    validator.initialize().expect("database accepts writes");

    assert_eq!(validator.validate_afe_measurement(), MeasurementStatus::NotOk);
    assert_eq!(
        rig.database.validated_cell_voltages(),
        ValidatedCellVoltages::default()
    );
    assert!(rig.diag.is_empty());
}

#[test]
fn stale_base_falls_back_to_redundant_source() {
    let rig = Rig::new(1_000);
    let mut validator = rig.validator();
    rig.publish_both(&voltages(|_| NOMINAL_MV, &[]));
    validator.validate_afe_measurement();

    rig.clock.advance(300);
    let redundant = voltages(|_| NOMINAL_MV + 40, &[]);
    rig.database
        .publish_cell_voltages(MeasurementSource::Redundant, redundant, rig.clock.now());

    assert_eq!(validator.validate_afe_measurement(), MeasurementStatus::Ok);
    assert!(
        rig.diag
            .is_active(DiagId::CellVoltageBaseTimeout, DiagScope::String(0))
    );
    assert!(
        !rig.diag
            .is_active(DiagId::CellVoltageRedundantTimeout, DiagScope::String(0))
    );

    let validated = rig.database.validated_cell_voltages();
    assert!(validated.strings[0].valid);
    assert_eq!(validated.strings[0].values, [NOMINAL_MV + 40; CELLS_PER_STRING]);

    // fresh base data clears the timeout again
    rig.clock.advance(10);
    rig.publish_both(&voltages(|_| NOMINAL_MV, &[]));
    validator.validate_afe_measurement();
    assert!(!rig.diag.any_active());
}

#[test]
fn source_that_never_reported_is_not_faulted() {
    let rig = Rig::new(1_000);
    let mut validator = rig.validator();
    rig.database.publish_cell_voltages(
        MeasurementSource::Base,
        voltages(|_| NOMINAL_MV, &[]),
        rig.clock.now(),
    );

    assert_eq!(validator.validate_afe_measurement(), MeasurementStatus::Ok);
    assert_eq!(
        rig.diag
            .count(DiagId::CellVoltageRedundantTimeout, DiagEvent::NotOk),
        0
    );
    assert!(rig.database.validated_cell_voltages().strings[0].valid);
}

#[test]
fn disagreeing_sources_raise_a_mismatch() {
    let rig = Rig::new(1_000);
    let mut validator = rig.validator();
    let base = voltages(|_| NOMINAL_MV, &[]);
    let mut redundant = base;
    redundant.strings[1].values[7] = NOMINAL_MV + 200;
    rig.database
        .publish_cell_voltages(MeasurementSource::Base, base, rig.clock.now());
    rig.database
        .publish_cell_voltages(MeasurementSource::Redundant, redundant, rig.clock.now());

    validator.validate_afe_measurement();

    assert!(
        rig.diag
            .is_active(DiagId::CellVoltageRedundancyMismatch, DiagScope::String(1))
    );
    assert!(
        !rig.diag
            .is_active(DiagId::CellVoltageRedundancyMismatch, DiagScope::String(0))
    );
    let validated = rig.database.validated_cell_voltages();
    assert!(validated.strings[1].missing.contains(7));
    assert_eq!(validated.strings[1].values[7], NOMINAL_MV);
}

#[test]
fn freshness_survives_tick_rollover() {
    let rig = Rig::new(u32::MAX - 50);
    let mut validator = rig.validator();
    rig.publish_both(&voltages(|_| NOMINAL_MV, &[]));

    rig.clock.advance(100);
    assert!(rig.clock.now().as_millis() < 100);
    rig.clock.advance(10);
    rig.database.publish_cell_voltages(
        MeasurementSource::Redundant,
        voltages(|_| NOMINAL_MV, &[]),
        rig.clock.now(),
    );

    assert_eq!(validator.validate_afe_measurement(), MeasurementStatus::Ok);
    assert!(!rig.diag.any_active());
}

#[test]
fn pack_values_follow_plausible_strings() {
    let rig = Rig::new(1_000);
    let mut validator = rig.validator();
    rig.publish_both(&voltages(|_| NOMINAL_MV, &[]));
    validator.validate_afe_measurement();

    let cell_sum = i32::from(NOMINAL_MV) * 16;
    rig.database.publish_current_sensor(
        0,
        sensor_reading(10_000, cell_sum + 50),
        rig.clock.now(),
    );
    rig.database.publish_current_sensor(
        1,
        sensor_reading(-2_000, cell_sum + 2_400),
        rig.clock.now(),
    );

    assert_eq!(validator.validate_pack_measurement(), MeasurementStatus::Ok);

    let pack = rig.database.pack_values();
    assert!(pack.strings[0].voltage_valid);
    assert_eq!(pack.strings[0].voltage_mv, cell_sum + 50);
    assert!(!pack.strings[1].voltage_valid);
    assert!(
        rig.diag
            .is_active(DiagId::StringVoltagePlausibility, DiagScope::String(1))
    );
    assert!(pack.pack_current_valid);
    assert_eq!(pack.pack_current_ma, 8_000);
    assert!(pack.pack_voltage_valid);
    assert_eq!(pack.pack_voltage_mv, cell_sum + 50);

    rig.clock.advance(10);
    assert_eq!(validator.validate_pack_measurement(), MeasurementStatus::NotOk);
    assert_eq!(rig.database.pack_values(), pack);
}

#[test]
fn missing_sensor_voltage_uses_cell_sum() {
    let rig = Rig::new(1_000);
    let mut validator = rig.validator();
    rig.publish_both(&voltages(|_| NOMINAL_MV, &[]));
    validator.validate_afe_measurement();

    let mut reading = sensor_reading(1_000, 0);
    reading.voltage_valid = false;
    rig.database.publish_current_sensor(0, reading, rig.clock.now());
    rig.database
        .publish_current_sensor(1, sensor_reading(1_000, 57_600), rig.clock.now());

    validator.validate_pack_measurement();

    let pack = rig.database.pack_values();
    assert!(pack.strings[0].voltage_valid);
    assert_eq!(pack.strings[0].voltage_mv, 57_600);
    assert_eq!(pack.pack_current_ma, 2_000);
}

#[test]
fn stale_current_sensor_invalidates_pack_current() {
    let rig = Rig::new(1_000);
    let mut validator = rig.validator();
    rig.database
        .publish_current_sensor(0, sensor_reading(5_000, 57_600), rig.clock.now());
    rig.database
        .publish_current_sensor(1, sensor_reading(5_000, 57_600), rig.clock.now());
    validator.validate_pack_measurement();

    rig.clock.advance(301);
    rig.database
        .publish_current_sensor(1, sensor_reading(5_000, 57_600), rig.clock.now());
    validator.validate_pack_measurement();

    let pack = rig.database.pack_values();
    assert!(!pack.strings[0].current_valid);
    assert!(pack.strings[1].current_valid);
    assert!(!pack.pack_current_valid);
    assert_eq!(pack.pack_current_ma, 5_000);
    assert!(
        rig.diag
            .is_active(DiagId::CurrentMeasurementTimeout, DiagScope::String(0))
    );
}

#[test]
fn missing_temperature_sensors_are_replaced_by_the_string_average() {
    let rig = Rig::new(1_000);
    let mut validator = rig.validator();
    // 25.0 and 26.0 degrees alternating, first two sensors of string 0 broken
    rig.publish_temperatures_both(&temperatures(
        |sensor| if sensor % 2 == 0 { NOMINAL_DDEG } else { NOMINAL_DDEG + 10 },
        &[0, 1],
    ));

    assert_eq!(validator.validate_afe_measurement(), MeasurementStatus::Ok);

    let validated = rig.database.validated_cell_temperatures();
    let string = &validated.strings[0];
    assert!(string.valid);
    assert_eq!(string.missing.count(), 2);
    assert_eq!(&string.values[..2], &[255, 255]);
    assert_eq!(string.summary.min, 250);
    assert_eq!(string.summary.max, 260);
    assert_eq!(string.summary.average, 255);
    assert!(validated.strings[1].valid);
    assert!(!rig.diag.any_active());
    // voltages were never published and stay untouched
    assert_eq!(
        rig.database.validated_cell_voltages(),
        ValidatedCellVoltages::default()
    );
}

#[test]
fn six_missing_temperature_sensors_invalidate_the_string() {
    let rig = Rig::new(1_000);
    let mut validator = rig.validator();
    rig.publish_temperatures_both(&temperatures(|_| NOMINAL_DDEG, &[0, 1, 2, 3, 4, 5]));

    validator.validate_afe_measurement();

    let validated = rig.database.validated_cell_temperatures();
    assert!(!validated.strings[0].valid);
    assert_eq!(validated.strings[0].values[0], 0);
    assert!(validated.strings[1].valid);
    assert!(
        rig.diag
            .is_active(DiagId::CellTemperatureInvalidCells, DiagScope::String(0))
    );
    assert_eq!(
        rig.diag
            .latest_for(DiagId::CellTemperatureInvalidCells, DiagScope::String(0)),
        Some(6)
    );
    assert!(
        !rig.diag
            .is_active(DiagId::CellVoltageInvalidCells, DiagScope::String(0))
    );
}

#[test]
fn temperature_sources_are_compared_with_their_own_tolerance() {
    let rig = Rig::new(1_000);
    let mut validator = rig.validator();
    let base = temperatures(|_| NOMINAL_DDEG, &[]);
    let mut redundant = base;
    // 2.0 degrees apart is accepted, 4.0 degrees is not
    redundant.strings[1].values[2] = NOMINAL_DDEG + 20;
    redundant.strings[1].values[3] = NOMINAL_DDEG + 40;
    rig.database
        .publish_cell_temperatures(MeasurementSource::Base, base, rig.clock.now());
    rig.database
        .publish_cell_temperatures(MeasurementSource::Redundant, redundant, rig.clock.now());

    validator.validate_afe_measurement();

    assert!(
        rig.diag
            .is_active(DiagId::CellTemperatureRedundancyMismatch, DiagScope::String(1))
    );
    assert!(
        !rig.diag
            .is_active(DiagId::CellVoltageRedundancyMismatch, DiagScope::String(1))
    );
    let validated = rig.database.validated_cell_temperatures();
    let string = &validated.strings[1];
    assert!(string.valid);
    assert!(!string.missing.contains(2));
    assert!(string.missing.contains(3));
    assert_eq!(string.values[2], NOMINAL_DDEG);
    assert_eq!(string.values[3], NOMINAL_DDEG);
}

#[test]
fn stale_temperature_source_is_faulted_per_string() {
    let rig = Rig::new(1_000);
    let mut validator = rig.validator();
    rig.publish_temperatures_both(&temperatures(|_| NOMINAL_DDEG, &[]));
    validator.validate_afe_measurement();

    rig.clock.advance(260);
    rig.database.publish_cell_temperatures(
        MeasurementSource::Redundant,
        temperatures(|_| NOMINAL_DDEG + 5, &[]),
        rig.clock.now(),
    );

    assert_eq!(validator.validate_afe_measurement(), MeasurementStatus::Ok);
    for string in 0..2 {
        assert!(
            rig.diag
                .is_active(DiagId::CellTemperatureBaseTimeout, DiagScope::String(string))
        );
        assert!(
            !rig.diag
                .is_active(DiagId::CellTemperatureRedundantTimeout, DiagScope::String(string))
        );
    }
    assert!(
        !rig.diag
            .is_active(DiagId::CellVoltageBaseTimeout, DiagScope::String(0))
    );
    let validated = rig.database.validated_cell_temperatures();
    assert_eq!(validated.strings[0].values, [NOMINAL_DDEG + 5; TEMP_SENSORS_PER_STRING]);
}

#[test]
fn new_temperatures_alone_are_fused() {
    let rig = Rig::new(1_000);
    let mut validator = rig.validator();
    rig.publish_both(&voltages(|_| NOMINAL_MV, &[]));
    rig.publish_temperatures_both(&temperatures(|_| NOMINAL_DDEG, &[]));
    assert_eq!(validator.validate_afe_measurement(), MeasurementStatus::Ok);
    let first_voltages = rig.database.validated_cell_voltages();

    rig.clock.advance(10);
    rig.publish_temperatures_both(&temperatures(|_| NOMINAL_DDEG + 3, &[]));
    assert_eq!(validator.validate_afe_measurement(), MeasurementStatus::Ok);

    assert_eq!(rig.database.validated_cell_voltages(), first_voltages);
    let validated = rig.database.validated_cell_temperatures();
    assert_eq!(validated.strings[0].values, [NOMINAL_DDEG + 3; TEMP_SENSORS_PER_STRING]);

    rig.clock.advance(10);
    assert_eq!(validator.validate_afe_measurement(), MeasurementStatus::NotOk);
    assert_eq!(rig.database.validated_cell_temperatures(), validated);
}

struct Rig {
    database: SharedDatabase,
    diag: DiagnosisLog<64>,
    clock: ManualClock,
}

impl Rig {
    fn new(start: u32) -> Self {
        Self {
            database: SharedDatabase::new(),
            diag: DiagnosisLog::new(),
            clock: ManualClock::new(start),
        }
    }

    fn validator(
        &self,
    ) -> RedundancyValidator<&SharedDatabase, &DiagnosisLog<64>, &ManualClock> {
        RedundancyValidator::new(
            &self.database,
            &self.diag,
            &self.clock,
            ValidatorConfig::default(),
        )
    }

    fn publish_both(&self, block: &CellVoltageBlock) {
        let now: Tick = self.clock.now();
        for source in MeasurementSource::ALL {
            self.database.publish_cell_voltages(source, *block, now);
        }
    }
}

impl Rig {
    fn publish_temperatures_both(&self, block: &CellTemperatureBlock) {
        let now: Tick = self.clock.now();
        for source in MeasurementSource::ALL {
            self.database.publish_cell_temperatures(source, *block, now);
        }
    }
}

trait LatestContext {
    fn latest_for(&self, id: DiagId, scope: DiagScope) -> Option<u32>;
}

impl<const N: usize> LatestContext for DiagnosisLog<N> {
    fn latest_for(&self, id: DiagId, scope: DiagScope) -> Option<u32> {
        self.records()
            .iter()
            .rev()
            .find(|record| record.id == id && record.scope == scope)
            .map(|record| record.context)
    }
}

/// 3600 mV on even cells and 3620 mV on odd cells.
fn alternating(cell: usize) -> i16 {
    if cell % 2 == 0 { NOMINAL_MV } else { NOMINAL_MV + 20 }
}

/// Same readings on every string, with `invalid` cells flagged on string 0.
fn voltages(value: impl Fn(usize) -> i16, invalid: &[usize]) -> CellVoltageBlock {
    let mut block = CellVoltageBlock::default();
    for readings in &mut block.strings {
        for (cell, slot) in readings.values.iter_mut().enumerate() {
            *slot = value(cell);
        }
        readings.invalid = CellMask::EMPTY;
    }
    for &cell in invalid {
        block.strings[0].invalid.insert(cell);
    }
    block
}

/// Same readings on every string, with `invalid` sensors flagged on string 0.
fn temperatures(value: impl Fn(usize) -> i16, invalid: &[usize]) -> CellTemperatureBlock {
    let mut block = CellTemperatureBlock::default();
    for readings in &mut block.strings {
        for (sensor, slot) in readings.values.iter_mut().enumerate() {
            *slot = value(sensor);
        }
        readings.invalid = CellMask::EMPTY;
    }
    for &sensor in invalid {
        block.strings[0].invalid.insert(sensor);
    }
    block
}

fn sensor_reading(current_ma: i32, string_voltage_mv: i32) -> CurrentSensorString {
    CurrentSensorString {
        current_ma,
        current_valid: true,
        string_voltage_mv,
        voltage_valid: true,
        ..CurrentSensorString::default()
    }
}
