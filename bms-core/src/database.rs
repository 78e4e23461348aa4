//! Measurement database collaborator.
//!
//! Producers publish timestamped snapshots; consumers copy whole blocks out.
//! Every block carries a [`BlockHeader`] whose timestamps are set by the
//! producer and used downstream to judge freshness.

use core::cell::RefCell;
use core::fmt;

use critical_section::Mutex;

use crate::config::{CELLS_PER_STRING, STRING_COUNT, TEMP_SENSORS_PER_STRING};
use crate::time::Tick;

/// Producer timestamps attached to a block.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockHeader {
    pub timestamp: Tick,
    pub previous_timestamp: Tick,
}

impl BlockHeader {
    /// Records a new write at `now`, shifting the old timestamp back.
    pub fn stamp(&mut self, now: Tick) {
        self.previous_timestamp = self.timestamp;
        self.timestamp = now;
    }
}

/// Bit set of cell indices within one string.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CellMask(u32);

impl CellMask {
    pub const EMPTY: Self = Self(0);

    /// Mask with the first `cells` bits set.
    #[must_use]
    pub const fn all(cells: usize) -> Self {
        if cells >= 32 {
            Self(u32::MAX)
        } else {
            Self((1 << cells) - 1)
        }
    }

    #[must_use]
    pub const fn contains(self, cell: usize) -> bool {
        cell < 32 && self.0 & (1 << cell) != 0
    }

    pub fn insert(&mut self, cell: usize) {
        assert!(cell < 32, "cell index {cell} outside mask");
        self.0 |= 1 << cell;
    }

    pub fn remove(&mut self, cell: usize) {
        assert!(cell < 32, "cell index {cell} outside mask");
        self.0 &= !(1 << cell);
    }

    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

/// Raw per-cell values of one string plus the producer's invalid flags.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StringReadings<const N: usize> {
    pub values: [i16; N],
    pub invalid: CellMask,
}

impl<const N: usize> Default for StringReadings<N> {
    fn default() -> Self {
        Self {
            values: [0; N],
            invalid: CellMask::all(N),
        }
    }
}

impl<const N: usize> StringReadings<N> {
    /// Returns the value of `cell` when the producer marked it valid.
    #[must_use]
    pub fn valid_value(&self, cell: usize) -> Option<i16> {
        (!self.invalid.contains(cell)).then(|| self.values[cell])
    }
}

/// Snapshot of one measurement source for every string.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CellBlock<const N: usize> {
    pub header: BlockHeader,
    pub strings: [StringReadings<N>; STRING_COUNT],
}

impl<const N: usize> Default for CellBlock<N> {
    fn default() -> Self {
        Self {
            header: BlockHeader::default(),
            strings: [StringReadings::default(); STRING_COUNT],
        }
    }
}

/// Cell voltages in millivolts.
pub type CellVoltageBlock = CellBlock<CELLS_PER_STRING>;
/// Cell temperatures in tenths of a degree Celsius.
pub type CellTemperatureBlock = CellBlock<TEMP_SENSORS_PER_STRING>;

/// Minimum, maximum, and average over a string's validated values.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StringSummary {
    pub min: i16,
    pub max: i16,
    pub average: i16,
    pub min_cell: u8,
    pub max_cell: u8,
}

/// Fused values of one string.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ValidatedString<const N: usize> {
    pub values: [i16; N],
    /// Cells for which neither source produced an acceptable value.
    pub missing: CellMask,
    /// `false` once too many cells are missing for the string to be trusted.
    pub valid: bool,
    pub summary: StringSummary,
}

impl<const N: usize> Default for ValidatedString<N> {
    fn default() -> Self {
        Self {
            values: [0; N],
            missing: CellMask::all(N),
            valid: false,
            summary: StringSummary::default(),
        }
    }
}

/// Authoritative fused dataset written by the redundancy validator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ValidatedBlock<const N: usize> {
    pub header: BlockHeader,
    pub strings: [ValidatedString<N>; STRING_COUNT],
}

impl<const N: usize> Default for ValidatedBlock<N> {
    fn default() -> Self {
        Self {
            header: BlockHeader::default(),
            strings: [ValidatedString::default(); STRING_COUNT],
        }
    }
}

pub type ValidatedCellVoltages = ValidatedBlock<CELLS_PER_STRING>;
pub type ValidatedCellTemperatures = ValidatedBlock<TEMP_SENSORS_PER_STRING>;

/// One string as reported by its current sensor.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CurrentSensorString {
    pub current_ma: i32,
    pub current_valid: bool,
    pub current: BlockHeader,
    pub string_voltage_mv: i32,
    pub voltage_valid: bool,
    pub voltage: BlockHeader,
}

/// Current-sensor readings for every string.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CurrentSensorBlock {
    pub strings: [CurrentSensorString; STRING_COUNT],
}

/// Validated current and voltage of one string.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StringPackValues {
    pub current_ma: i32,
    pub current_valid: bool,
    pub voltage_mv: i32,
    pub voltage_valid: bool,
}

/// Validated pack-level values.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PackValues {
    pub header: BlockHeader,
    pub strings: [StringPackValues; STRING_COUNT],
    pub pack_current_ma: i32,
    pub pack_current_valid: bool,
    pub pack_voltage_mv: i32,
    pub pack_voltage_valid: bool,
}

/// Which of the two independent measurement paths produced a block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MeasurementSource {
    Base,
    Redundant,
}

impl MeasurementSource {
    pub const ALL: [MeasurementSource; 2] = [MeasurementSource::Base, MeasurementSource::Redundant];

    const fn index(self) -> usize {
        match self {
            MeasurementSource::Base => 0,
            MeasurementSource::Redundant => 1,
        }
    }
}

/// Failure reported by the database collaborator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DatabaseError {
    /// The backing store refused the write.
    WriteRejected,
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseError::WriteRejected => f.write_str("database write rejected"),
        }
    }
}

/// Typed block access used by the redundancy validator.
pub trait MeasurementDatabase {
    fn cell_voltages(&self, source: MeasurementSource) -> CellVoltageBlock;
    fn cell_temperatures(&self, source: MeasurementSource) -> CellTemperatureBlock;
    fn current_sensor(&self) -> CurrentSensorBlock;
    fn validated_cell_voltages(&self) -> ValidatedCellVoltages;
    fn validated_cell_temperatures(&self) -> ValidatedCellTemperatures;
    fn pack_values(&self) -> PackValues;

    fn write_validated_cell_voltages(
        &self,
        block: &ValidatedCellVoltages,
    ) -> Result<(), DatabaseError>;
    fn write_validated_cell_temperatures(
        &self,
        block: &ValidatedCellTemperatures,
    ) -> Result<(), DatabaseError>;
    fn write_pack_values(&self, block: &PackValues) -> Result<(), DatabaseError>;
}

impl<T> MeasurementDatabase for &T
where
    T: MeasurementDatabase + ?Sized,
{
    fn cell_voltages(&self, source: MeasurementSource) -> CellVoltageBlock {
        (**self).cell_voltages(source)
    }

    fn cell_temperatures(&self, source: MeasurementSource) -> CellTemperatureBlock {
        (**self).cell_temperatures(source)
    }

    fn current_sensor(&self) -> CurrentSensorBlock {
        (**self).current_sensor()
    }

    fn validated_cell_voltages(&self) -> ValidatedCellVoltages {
        (**self).validated_cell_voltages()
    }

    fn validated_cell_temperatures(&self) -> ValidatedCellTemperatures {
        (**self).validated_cell_temperatures()
    }

    fn pack_values(&self) -> PackValues {
        (**self).pack_values()
    }

    fn write_validated_cell_voltages(
        &self,
        block: &ValidatedCellVoltages,
    ) -> Result<(), DatabaseError> {
        (**self).write_validated_cell_voltages(block)
    }

    fn write_validated_cell_temperatures(
        &self,
        block: &ValidatedCellTemperatures,
    ) -> Result<(), DatabaseError> {
        (**self).write_validated_cell_temperatures(block)
    }

    fn write_pack_values(&self, block: &PackValues) -> Result<(), DatabaseError> {
        (**self).write_pack_values(block)
    }
}

#[derive(Default)]
struct Tables {
    cell_voltages: [CellVoltageBlock; 2],
    cell_temperatures: [CellTemperatureBlock; 2],
    current_sensor: CurrentSensorBlock,
    validated_cell_voltages: ValidatedCellVoltages,
    validated_cell_temperatures: ValidatedCellTemperatures,
    pack_values: PackValues,
}

/// In-memory database shared between tasks behind a critical section.
pub struct SharedDatabase {
    tables: Mutex<RefCell<Option<Tables>>>,
}

impl SharedDatabase {
    /// Creates an empty database; tables are allocated on first access.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tables: Mutex::new(RefCell::new(None)),
        }
    }

    fn with_tables<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        critical_section::with(|cs| {
            let mut tables = self.tables.borrow_ref_mut(cs);
            f(tables.get_or_insert_with(Tables::default))
        })
    }

    /// Publishes a cell-voltage snapshot from `source`, stamping it at `now`.
    pub fn publish_cell_voltages(
        &self,
        source: MeasurementSource,
        mut block: CellVoltageBlock,
        now: Tick,
    ) {
        self.with_tables(|tables| {
            let slot = &mut tables.cell_voltages[source.index()];
            block.header = slot.header;
            block.header.stamp(now);
            *slot = block;
        });
    }

    /// Publishes a cell-temperature snapshot from `source`, stamping it at `now`.
    pub fn publish_cell_temperatures(
        &self,
        source: MeasurementSource,
        mut block: CellTemperatureBlock,
        now: Tick,
    ) {
        self.with_tables(|tables| {
            let slot = &mut tables.cell_temperatures[source.index()];
            block.header = slot.header;
            block.header.stamp(now);
            *slot = block;
        });
    }

    /// Publishes one string's current-sensor reading, stamping both signals at `now`.
    pub fn publish_current_sensor(&self, string: u8, mut reading: CurrentSensorString, now: Tick) {
        self.with_tables(|tables| {
            let slot = &mut tables.current_sensor.strings[usize::from(string)];
            reading.current = slot.current;
            reading.current.stamp(now);
            reading.voltage = slot.voltage;
            reading.voltage.stamp(now);
            *slot = reading;
        });
    }
}

impl Default for SharedDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasurementDatabase for SharedDatabase {
    fn cell_voltages(&self, source: MeasurementSource) -> CellVoltageBlock {
        self.with_tables(|tables| tables.cell_voltages[source.index()])
    }

    fn cell_temperatures(&self, source: MeasurementSource) -> CellTemperatureBlock {
        self.with_tables(|tables| tables.cell_temperatures[source.index()])
    }

    fn current_sensor(&self) -> CurrentSensorBlock {
        self.with_tables(|tables| tables.current_sensor)
    }

    fn validated_cell_voltages(&self) -> ValidatedCellVoltages {
        self.with_tables(|tables| tables.validated_cell_voltages)
    }

    fn validated_cell_temperatures(&self) -> ValidatedCellTemperatures {
        self.with_tables(|tables| tables.validated_cell_temperatures)
    }

    fn pack_values(&self) -> PackValues {
        self.with_tables(|tables| tables.pack_values)
    }

    fn write_validated_cell_voltages(
        &self,
        block: &ValidatedCellVoltages,
    ) -> Result<(), DatabaseError> {
        self.with_tables(|tables| tables.validated_cell_voltages = *block);
        Ok(())
    }

    fn write_validated_cell_temperatures(
        &self,
        block: &ValidatedCellTemperatures,
    ) -> Result<(), DatabaseError> {
        self.with_tables(|tables| tables.validated_cell_temperatures = *block);
        Ok(())
    }

    fn write_pack_values(&self, block: &PackValues) -> Result<(), DatabaseError> {
        self.with_tables(|tables| tables.pack_values = *block);
        Ok(())
    }
}
