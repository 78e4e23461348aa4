//! Cross-validation of the redundant measurement paths.
//!
//! Two independent front ends measure every cell. Each validator call checks
//! that both sources are fresh, fuses them cell by cell, and publishes one
//! validated block per signal. Strings with a handful of missing cells are
//! kept usable by substituting the string average; beyond
//! [`ValidatorConfig::max_missing_cells`] the string is marked invalid.
//!
//! The validator keeps no state between calls apart from the timestamps of
//! the inputs it last fused, which lets it skip calls without new data.

use core::fmt;
use core::time::Duration;

use crate::config::{STRING_COUNT, strings};
use crate::database::{
    BlockHeader, CellBlock, CellMask, DatabaseError, MeasurementDatabase, MeasurementSource,
    PackValues, StringReadings, StringSummary, ValidatedBlock, ValidatedCellTemperatures,
    ValidatedCellVoltages, ValidatedString,
};
use crate::diag::{DiagEvent, DiagId, DiagScope, DiagnosisSink};
use crate::time::{Tick, TickSource, is_within};

/// Result of a freshness check or a validator call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MeasurementStatus {
    Ok,
    NotOk,
}

impl MeasurementStatus {
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, MeasurementStatus::Ok)
    }
}

impl fmt::Display for MeasurementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementStatus::Ok => f.write_str("ok"),
            MeasurementStatus::NotOk => f.write_str("not-ok"),
        }
    }
}

/// Returns `false` only for a signal that was never written since boot.
#[must_use]
pub const fn measurement_updated_at_least_once(timestamp: Tick, previous_timestamp: Tick) -> bool {
    !(timestamp.is_zero() && previous_timestamp.is_zero())
}

/// Checks that a signal was written at least once and is at most `interval` old.
///
/// The age is measured from the latest write (`timestamp`), never from
/// `previous_timestamp`, which only tells a never-written signal apart. An
/// age of exactly `interval` is still fresh. The age is computed with
/// wrapping subtraction, so a timestamp taken just before the tick counter
/// rolled over is still judged correctly.
#[must_use]
pub fn measurement_updated_recently(
    now: Tick,
    timestamp: Tick,
    previous_timestamp: Tick,
    interval: Duration,
) -> MeasurementStatus {
    if measurement_updated_at_least_once(timestamp, previous_timestamp)
        && is_within(now, timestamp, interval)
    {
        MeasurementStatus::Ok
    } else {
        MeasurementStatus::NotOk
    }
}

/// Validator tuning.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ValidatorConfig {
    /// Maximum age of cell voltage and temperature blocks.
    pub cell_measurement_timeout: Duration,
    /// Maximum age of current-sensor current and string voltage.
    pub current_sensor_timeout: Duration,
    /// Largest accepted base/redundant difference, in millivolts.
    pub cell_voltage_tolerance_mv: i16,
    /// Largest accepted base/redundant difference, in tenths of a degree.
    pub cell_temperature_tolerance_ddegc: i16,
    /// Largest accepted difference between the current-sensor string voltage
    /// and the sum of validated cell voltages, in millivolts.
    pub string_voltage_tolerance_mv: i32,
    /// Missing cells a string may have and still be reported valid.
    pub max_missing_cells: u32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            cell_measurement_timeout: Duration::from_millis(250),
            current_sensor_timeout: Duration::from_millis(300),
            cell_voltage_tolerance_mv: 25,
            cell_temperature_tolerance_ddegc: 30,
            string_voltage_tolerance_mv: 1_000,
            max_missing_cells: 5,
        }
    }
}

/// Fault identifiers of one cell signal.
struct CellSignal {
    base_timeout: DiagId,
    redundant_timeout: DiagId,
    mismatch: DiagId,
    invalid_cells: DiagId,
}

const CELL_VOLTAGE: CellSignal = CellSignal {
    base_timeout: DiagId::CellVoltageBaseTimeout,
    redundant_timeout: DiagId::CellVoltageRedundantTimeout,
    mismatch: DiagId::CellVoltageRedundancyMismatch,
    invalid_cells: DiagId::CellVoltageInvalidCells,
};

const CELL_TEMPERATURE: CellSignal = CellSignal {
    base_timeout: DiagId::CellTemperatureBaseTimeout,
    redundant_timeout: DiagId::CellTemperatureRedundantTimeout,
    mismatch: DiagId::CellTemperatureRedundancyMismatch,
    invalid_cells: DiagId::CellTemperatureInvalidCells,
};

/// Outcome of fusing one string.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FusedString<const N: usize> {
    pub string: ValidatedString<N>,
    /// Cells where both sources were valid but disagreed.
    pub mismatches: CellMask,
}

/// Fuses one string from the readings of the sources that are fresh.
///
/// Agreeing cells take the base value; a cell valid in one source only takes
/// that source's value. Cells without an acceptable value are replaced by
/// the string average unless more than `max_missing` are affected, in which
/// case the string is marked invalid and the gaps are left at zero.
#[must_use]
pub fn fuse_string<const N: usize>(
    base: Option<&StringReadings<N>>,
    redundant: Option<&StringReadings<N>>,
    tolerance: i16,
    max_missing: u32,
) -> FusedString<N> {
    let mut values = [0; N];
    let mut missing = CellMask::EMPTY;
    let mut mismatches = CellMask::EMPTY;

    for (cell, value) in values.iter_mut().enumerate() {
        let base_value = base.and_then(|readings| readings.valid_value(cell));
        let redundant_value = redundant.and_then(|readings| readings.valid_value(cell));

        match (base_value, redundant_value) {
            (Some(base_value), Some(redundant_value)) => {
                if base_value.abs_diff(redundant_value) <= tolerance.unsigned_abs() {
                    *value = base_value;
                } else {
                    mismatches.insert(cell);
                    missing.insert(cell);
                }
            }
            (Some(only), None) | (None, Some(only)) => *value = only,
            (None, None) => missing.insert(cell),
        }
    }

    let measured = summarize(&values, missing);
    let valid = measured.is_some() && missing.count() <= max_missing;

    let summary = match measured {
        Some(summary) if valid => {
            for (cell, value) in values.iter_mut().enumerate() {
                if missing.contains(cell) {
                    *value = summary.average;
                }
            }
            summarize(&values, CellMask::EMPTY).unwrap_or(summary)
        }
        Some(summary) => summary,
        None => StringSummary::default(),
    };

    FusedString {
        string: ValidatedString {
            values,
            missing,
            valid,
            summary,
        },
        mismatches,
    }
}

/// Minimum, maximum, and average over the cells not in `excluded`.
fn summarize<const N: usize>(values: &[i16; N], excluded: CellMask) -> Option<StringSummary> {
    let mut summary: Option<StringSummary> = None;
    let mut sum: i32 = 0;
    let mut count: i32 = 0;

    for (cell, &value) in values.iter().enumerate() {
        if excluded.contains(cell) {
            continue;
        }
        let index = u8::try_from(cell).unwrap_or(u8::MAX);
        sum += i32::from(value);
        count += 1;

        let current = summary.get_or_insert(StringSummary {
            min: value,
            max: value,
            average: value,
            min_cell: index,
            max_cell: index,
        });
        if value < current.min {
            current.min = value;
            current.min_cell = index;
        }
        if value > current.max {
            current.max = value;
            current.max_cell = index;
        }
    }

    let mut summary = summary?;
    // the mean of i16 values always fits in i16
    summary.average = i16::try_from(sum / count).unwrap_or(summary.min);
    Some(summary)
}

/// Input timestamps consumed by the last fusing call.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
struct LastSeen {
    cell_voltages: [Tick; 2],
    cell_temperatures: [Tick; 2],
    currents: [Tick; STRING_COUNT],
    string_voltages: [Tick; STRING_COUNT],
}

fn event_for(ok: bool) -> DiagEvent {
    if ok { DiagEvent::Ok } else { DiagEvent::NotOk }
}

/// Redundancy validator bound to its collaborators.
pub struct RedundancyValidator<DB, D, T>
where
    DB: MeasurementDatabase,
    D: DiagnosisSink,
    T: TickSource,
{
    database: DB,
    diag: D,
    clock: T,
    config: ValidatorConfig,
    last_seen: LastSeen,
}

impl<DB, D, T> RedundancyValidator<DB, D, T>
where
    DB: MeasurementDatabase,
    D: DiagnosisSink,
    T: TickSource,
{
    pub fn new(database: DB, diag: D, clock: T, config: ValidatorConfig) -> Self {
        Self {
            database,
            diag,
            clock,
            config,
            last_seen: LastSeen::default(),
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Publishes empty, invalid validated blocks and forgets consumed inputs.
    pub fn initialize(&mut self) -> Result<(), DatabaseError> {
        self.last_seen = LastSeen::default();
        self.database
            .write_validated_cell_voltages(&ValidatedCellVoltages::default())?;
        self.database
            .write_validated_cell_temperatures(&ValidatedCellTemperatures::default())?;
        self.database.write_pack_values(&PackValues::default())
    }

    /// Validates and fuses the cell voltage and temperature blocks.
    ///
    /// Freshness is reported on every call. Fusion only runs for a signal
    /// whose sources produced a new block since the last call; when neither
    /// signal has new data the call returns [`MeasurementStatus::NotOk`]
    /// and the validated blocks stay untouched.
    pub fn validate_afe_measurement(&mut self) -> MeasurementStatus {
        let now = self.clock.now();
        let voltages = MeasurementSource::ALL.map(|source| self.database.cell_voltages(source));
        let temperatures =
            MeasurementSource::ALL.map(|source| self.database.cell_temperatures(source));

        let voltage_fresh = self.check_sources(now, &voltages, &CELL_VOLTAGE);
        let temperature_fresh = self.check_sources(now, &temperatures, &CELL_TEMPERATURE);

        let voltage_stamps = voltages.map(|block| block.header.timestamp);
        let temperature_stamps = temperatures.map(|block| block.header.timestamp);
        let new_voltages = voltage_stamps != self.last_seen.cell_voltages;
        let new_temperatures = temperature_stamps != self.last_seen.cell_temperatures;

        if !new_voltages && !new_temperatures {
            return MeasurementStatus::NotOk;
        }

        let mut status = MeasurementStatus::Ok;

        if new_voltages {
            self.last_seen.cell_voltages = voltage_stamps;
            let header = self.database.validated_cell_voltages().header;
            let block = self.fuse_block(
                now,
                header,
                &voltages,
                voltage_fresh,
                self.config.cell_voltage_tolerance_mv,
                &CELL_VOLTAGE,
            );
            if self.database.write_validated_cell_voltages(&block).is_err() {
                status = MeasurementStatus::NotOk;
            }
        }

        if new_temperatures {
            self.last_seen.cell_temperatures = temperature_stamps;
            let header = self.database.validated_cell_temperatures().header;
            let block = self.fuse_block(
                now,
                header,
                &temperatures,
                temperature_fresh,
                self.config.cell_temperature_tolerance_ddegc,
                &CELL_TEMPERATURE,
            );
            if self.database.write_validated_cell_temperatures(&block).is_err() {
                status = MeasurementStatus::NotOk;
            }
        }

        status
    }

    /// Validates current-sensor data and derives the pack values.
    ///
    /// The string voltage is cross-checked against the sum of the validated
    /// cell voltages; when the sensor has no usable voltage the cell sum is
    /// used instead.
    pub fn validate_pack_measurement(&mut self) -> MeasurementStatus {
        let now = self.clock.now();
        let sensor = self.database.current_sensor();
        let cells = self.database.validated_cell_voltages();
        let timeout = self.config.current_sensor_timeout;

        let mut currents = [Tick::ZERO; STRING_COUNT];
        let mut string_voltages = [Tick::ZERO; STRING_COUNT];
        let mut current_fresh = [false; STRING_COUNT];
        let mut voltage_fresh = [false; STRING_COUNT];

        for string in strings() {
            let index = usize::from(string);
            let reading = &sensor.strings[index];
            currents[index] = reading.current.timestamp;
            string_voltages[index] = reading.voltage.timestamp;
            current_fresh[index] = self.check_freshness(
                now,
                reading.current,
                timeout,
                DiagId::CurrentMeasurementTimeout,
                DiagScope::String(string),
            );
            voltage_fresh[index] = self.check_freshness(
                now,
                reading.voltage,
                timeout,
                DiagId::StringVoltageMeasurementTimeout,
                DiagScope::String(string),
            );
        }

        if currents == self.last_seen.currents && string_voltages == self.last_seen.string_voltages
        {
            return MeasurementStatus::NotOk;
        }
        self.last_seen.currents = currents;
        self.last_seen.string_voltages = string_voltages;

        let mut header = self.database.pack_values().header;
        header.stamp(now);
        let mut pack = PackValues {
            header,
            ..PackValues::default()
        };

        for string in strings() {
            let index = usize::from(string);
            let reading = &sensor.strings[index];
            let validated = &cells.strings[index];
            let values = &mut pack.strings[index];

            values.current_valid = current_fresh[index] && reading.current_valid;
            if values.current_valid {
                values.current_ma = reading.current_ma;
            }

            let cell_sum = validated
                .valid
                .then(|| validated.values.iter().copied().map(i32::from).sum::<i32>());

            match (voltage_fresh[index] && reading.voltage_valid, cell_sum) {
                (true, Some(cell_sum)) => {
                    let deviation = reading.string_voltage_mv.abs_diff(cell_sum);
                    let plausible =
                        deviation <= self.config.string_voltage_tolerance_mv.unsigned_abs();
                    self.report(
                        DiagId::StringVoltagePlausibility,
                        event_for(plausible),
                        DiagScope::String(string),
                        deviation,
                    );
                    values.voltage_valid = plausible;
                    if plausible {
                        values.voltage_mv = reading.string_voltage_mv;
                    }
                }
                (true, None) => {
                    values.voltage_mv = reading.string_voltage_mv;
                    values.voltage_valid = true;
                }
                (false, Some(cell_sum)) => {
                    values.voltage_mv = cell_sum;
                    values.voltage_valid = true;
                }
                (false, None) => {}
            }
        }

        pack.pack_current_valid = pack.strings.iter().all(|values| values.current_valid);
        pack.pack_current_ma = pack
            .strings
            .iter()
            .filter(|values| values.current_valid)
            .map(|values| values.current_ma)
            .sum();

        let mut voltage_sum: i64 = 0;
        let mut voltage_count: i64 = 0;
        for values in pack.strings.iter().filter(|values| values.voltage_valid) {
            voltage_sum += i64::from(values.voltage_mv);
            voltage_count += 1;
        }
        if voltage_count > 0 {
            pack.pack_voltage_mv = i32::try_from(voltage_sum / voltage_count).unwrap_or(i32::MAX);
            pack.pack_voltage_valid = true;
        }

        match self.database.write_pack_values(&pack) {
            Ok(()) => MeasurementStatus::Ok,
            Err(_) => MeasurementStatus::NotOk,
        }
    }

    /// Checks both sources of one signal, returning which ones are usable.
    fn check_sources<const N: usize>(
        &self,
        now: Tick,
        blocks: &[CellBlock<N>; 2],
        signal: &CellSignal,
    ) -> [bool; 2] {
        let timeout = self.config.cell_measurement_timeout;
        let [base, redundant] = blocks;
        [
            self.check_freshness_all(now, base.header, timeout, signal.base_timeout),
            self.check_freshness_all(now, redundant.header, timeout, signal.redundant_timeout),
        ]
    }

    fn check_freshness_all(
        &self,
        now: Tick,
        header: BlockHeader,
        timeout: Duration,
        id: DiagId,
    ) -> bool {
        let mut fresh = true;
        for string in strings() {
            fresh &= self.check_freshness(now, header, timeout, id, DiagScope::String(string));
        }
        fresh
    }

    /// Reports the freshness of one signal and returns whether it is usable.
    ///
    /// A signal that never produced data is not usable but is not reported
    /// either; the producer may simply not have started yet.
    fn check_freshness(
        &self,
        now: Tick,
        header: BlockHeader,
        timeout: Duration,
        id: DiagId,
        scope: DiagScope,
    ) -> bool {
        if !measurement_updated_at_least_once(header.timestamp, header.previous_timestamp) {
            return false;
        }
        let status =
            measurement_updated_recently(now, header.timestamp, header.previous_timestamp, timeout);
        self.report(id, event_for(status.is_ok()), scope, now.wrapping_since(header.timestamp));
        status.is_ok()
    }

    fn fuse_block<const N: usize>(
        &self,
        now: Tick,
        mut header: BlockHeader,
        sources: &[CellBlock<N>; 2],
        fresh: [bool; 2],
        tolerance: i16,
        signal: &CellSignal,
    ) -> ValidatedBlock<N> {
        header.stamp(now);
        let mut block = ValidatedBlock {
            header,
            ..ValidatedBlock::default()
        };
        let [base, redundant] = sources;
        let [base_fresh, redundant_fresh] = fresh;

        for string in strings() {
            let index = usize::from(string);
            let fused = fuse_string(
                base_fresh.then_some(&base.strings[index]),
                redundant_fresh.then_some(&redundant.strings[index]),
                tolerance,
                self.config.max_missing_cells,
            );

            let scope = DiagScope::String(string);
            self.report(
                signal.mismatch,
                event_for(fused.mismatches.is_empty()),
                scope,
                fused.mismatches.bits(),
            );
            self.report(
                signal.invalid_cells,
                event_for(fused.string.valid),
                scope,
                fused.string.missing.count(),
            );
            block.strings[index] = fused.string;
        }

        block
    }

    fn report(&self, id: DiagId, event: DiagEvent, scope: DiagScope, context: u32) {
        // scopes come from the configured string range; a refusal leaves nothing to undo
        let _ = self.diag.report_fault(id, event, scope, context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u32) -> Tick {
        Tick::from_millis(millis)
    }

    #[test]
    fn at_least_once_is_false_only_for_two_zeros() {
        assert!(!measurement_updated_at_least_once(ms(0), ms(0)));
        assert!(measurement_updated_at_least_once(ms(70), ms(60)));
        assert!(measurement_updated_at_least_once(ms(60), ms(10)));
        assert!(measurement_updated_at_least_once(ms(0), ms(10)));
        assert!(measurement_updated_at_least_once(ms(10), ms(0)));
    }

    #[test]
    fn recently_includes_the_interval_boundary() {
        let interval = Duration::from_millis(100);
        assert_eq!(
            measurement_updated_recently(ms(100), ms(50), ms(0), interval),
            MeasurementStatus::Ok
        );
        assert_eq!(
            measurement_updated_recently(ms(150), ms(50), ms(0), interval),
            MeasurementStatus::Ok
        );
        assert_eq!(
            measurement_updated_recently(ms(151), ms(50), ms(0), interval),
            MeasurementStatus::NotOk
        );
    }

    #[test]
    fn age_is_measured_from_the_latest_write() {
        let interval = Duration::from_millis(150);
        // 140 ms since the latest write, 300 ms since the one before it
        assert_eq!(
            measurement_updated_recently(ms(340), ms(200), ms(40), interval),
            MeasurementStatus::Ok
        );
        assert_eq!(
            measurement_updated_recently(ms(351), ms(200), ms(40), interval),
            MeasurementStatus::NotOk
        );
    }

    #[test]
    fn recently_survives_tick_rollover() {
        let interval = Duration::from_millis(100);
        assert_eq!(
            measurement_updated_recently(ms(50), ms(u32::MAX), ms(0), interval),
            MeasurementStatus::Ok
        );
        assert_eq!(
            measurement_updated_recently(ms(u32::MAX), ms(50), ms(0), interval),
            MeasurementStatus::NotOk
        );
    }

    #[test]
    fn never_updated_signal_is_not_recent() {
        assert_eq!(
            measurement_updated_recently(ms(0), ms(0), ms(0), Duration::from_millis(100)),
            MeasurementStatus::NotOk
        );
    }

    fn readings(values: [i16; 4]) -> StringReadings<4> {
        StringReadings {
            values,
            invalid: CellMask::EMPTY,
        }
    }

    #[test]
    fn agreeing_cells_take_the_base_value() {
        let base = readings([3_600, 3_610, 3_620, 3_630]);
        let redundant = readings([3_605, 3_600, 3_625, 3_640]);

        let fused = fuse_string(Some(&base), Some(&redundant), 10, 1);

        assert_eq!(fused.string.values, base.values);
        assert!(fused.string.valid);
        assert!(fused.mismatches.is_empty());
        assert_eq!(fused.string.summary.min, 3_600);
        assert_eq!(fused.string.summary.max_cell, 3);
    }

    #[test]
    fn single_valid_source_is_accepted() {
        let mut base = readings([3_600, 3_610, 3_620, 3_630]);
        base.invalid.insert(1);
        let mut redundant = readings([0, 3_612, 0, 0]);
        redundant.invalid = CellMask::all(4);
        redundant.invalid.remove(1);

        let fused = fuse_string(Some(&base), Some(&redundant), 10, 0);

        assert_eq!(fused.string.values, [3_600, 3_612, 3_620, 3_630]);
        assert!(fused.string.missing.is_empty());
        assert!(fused.string.valid);
    }

    #[test]
    fn mismatching_cell_is_substituted() {
        let base = readings([3_600, 3_700, 3_600, 3_600]);
        let redundant = readings([3_600, 3_500, 3_600, 3_600]);

        let fused = fuse_string(Some(&base), Some(&redundant), 10, 1);

        assert!(fused.mismatches.contains(1));
        assert!(fused.string.missing.contains(1));
        assert!(fused.string.valid);
        assert_eq!(fused.string.values[1], 3_600);
    }

    #[test]
    fn no_source_leaves_string_invalid() {
        let fused = fuse_string::<4>(None, None, 10, 5);

        assert!(!fused.string.valid);
        assert_eq!(fused.string.missing.count(), 4);
        assert_eq!(fused.string.summary, StringSummary::default());
    }

    #[test]
    fn summary_tracks_extreme_cells() {
        let summary = summarize(&[10, -5, 30, 5], CellMask::EMPTY).expect("cells present");
        assert_eq!(summary.min, -5);
        assert_eq!(summary.min_cell, 1);
        assert_eq!(summary.max, 30);
        assert_eq!(summary.max_cell, 2);
        assert_eq!(summary.average, 10);
    }
}
