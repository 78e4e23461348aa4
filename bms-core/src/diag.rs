//! Diagnosis collaborator interface and an in-memory fault log.
//!
//! Severity, debounce counts, and the system-level reaction to a fault are
//! owned by the diagnosis subsystem. The control core only reports what it
//! observed through [`DiagnosisSink::report_fault`]; [`DiagnosisLog`] is the
//! ring-buffered implementation shared by the firmware and the host tests.

use core::cell::RefCell;
use core::fmt;

use critical_section::Mutex;
use heapless::{HistoryBuf, Vec};

use crate::config::STRING_COUNT;

/// Faults this core can raise.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiagId {
    /// A fatal error was persisted before the last reset.
    PersistedFatalError,
    CellVoltageBaseTimeout,
    CellVoltageRedundantTimeout,
    CellTemperatureBaseTimeout,
    CellTemperatureRedundantTimeout,
    CurrentMeasurementTimeout,
    StringVoltageMeasurementTimeout,
    /// Base and redundant cell voltages disagree beyond the tolerance.
    CellVoltageRedundancyMismatch,
    CellTemperatureRedundancyMismatch,
    /// More cells than allowed lack a validated value.
    CellVoltageInvalidCells,
    CellTemperatureInvalidCells,
    /// Current-sensor string voltage disagrees with the cell voltage sum.
    StringVoltagePlausibility,
}

/// Number of distinct [`DiagId`] variants.
pub const DIAG_ID_COUNT: usize = 12;

impl DiagId {
    pub const ALL: [DiagId; DIAG_ID_COUNT] = [
        DiagId::PersistedFatalError,
        DiagId::CellVoltageBaseTimeout,
        DiagId::CellVoltageRedundantTimeout,
        DiagId::CellTemperatureBaseTimeout,
        DiagId::CellTemperatureRedundantTimeout,
        DiagId::CurrentMeasurementTimeout,
        DiagId::StringVoltageMeasurementTimeout,
        DiagId::CellVoltageRedundancyMismatch,
        DiagId::CellTemperatureRedundancyMismatch,
        DiagId::CellVoltageInvalidCells,
        DiagId::CellTemperatureInvalidCells,
        DiagId::StringVoltagePlausibility,
    ];

    /// Deterministic index used for status lookups.
    #[must_use]
    pub const fn as_index(self) -> usize {
        match self {
            DiagId::PersistedFatalError => 0,
            DiagId::CellVoltageBaseTimeout => 1,
            DiagId::CellVoltageRedundantTimeout => 2,
            DiagId::CellTemperatureBaseTimeout => 3,
            DiagId::CellTemperatureRedundantTimeout => 4,
            DiagId::CurrentMeasurementTimeout => 5,
            DiagId::StringVoltageMeasurementTimeout => 6,
            DiagId::CellVoltageRedundancyMismatch => 7,
            DiagId::CellTemperatureRedundancyMismatch => 8,
            DiagId::CellVoltageInvalidCells => 9,
            DiagId::CellTemperatureInvalidCells => 10,
            DiagId::StringVoltagePlausibility => 11,
        }
    }

    /// Short label used by log output.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            DiagId::PersistedFatalError => "persisted-fatal-error",
            DiagId::CellVoltageBaseTimeout => "cell-voltage-base-timeout",
            DiagId::CellVoltageRedundantTimeout => "cell-voltage-redundant-timeout",
            DiagId::CellTemperatureBaseTimeout => "cell-temperature-base-timeout",
            DiagId::CellTemperatureRedundantTimeout => "cell-temperature-redundant-timeout",
            DiagId::CurrentMeasurementTimeout => "current-measurement-timeout",
            DiagId::StringVoltageMeasurementTimeout => "string-voltage-measurement-timeout",
            DiagId::CellVoltageRedundancyMismatch => "cell-voltage-redundancy-mismatch",
            DiagId::CellTemperatureRedundancyMismatch => "cell-temperature-redundancy-mismatch",
            DiagId::CellVoltageInvalidCells => "cell-voltage-invalid-cells",
            DiagId::CellTemperatureInvalidCells => "cell-temperature-invalid-cells",
            DiagId::StringVoltagePlausibility => "string-voltage-plausibility",
        }
    }
}

impl fmt::Display for DiagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Observation reported for a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiagEvent {
    Ok,
    NotOk,
    Reset,
}

/// Part of the system a fault report applies to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiagScope {
    System,
    String(u8),
}

impl DiagScope {
    fn slot(self) -> Option<usize> {
        match self {
            DiagScope::System => Some(0),
            DiagScope::String(string) if usize::from(string) < STRING_COUNT => {
                Some(usize::from(string) + 1)
            }
            DiagScope::String(_) => None,
        }
    }

    fn from_slot(slot: usize) -> Self {
        match slot.checked_sub(1).and_then(|string| u8::try_from(string).ok()) {
            Some(string) => DiagScope::String(string),
            None => DiagScope::System,
        }
    }
}

impl fmt::Display for DiagScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagScope::System => f.write_str("system"),
            DiagScope::String(string) => write!(f, "string{string}"),
        }
    }
}

/// Reasons the diagnosis collaborator may refuse a report.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiagError {
    /// The scope names a string this system does not have.
    InvalidScope(DiagScope),
}

impl fmt::Display for DiagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagError::InvalidScope(scope) => write!(f, "invalid diagnosis scope {scope}"),
        }
    }
}

/// Fault reporting seam consumed by the state machines and the validator.
pub trait DiagnosisSink {
    /// Reports an observation for `id` within `scope`.
    fn report_fault(
        &self,
        id: DiagId,
        event: DiagEvent,
        scope: DiagScope,
        context: u32,
    ) -> Result<(), DiagError>;
}

impl<T> DiagnosisSink for &T
where
    T: DiagnosisSink + ?Sized,
{
    fn report_fault(
        &self,
        id: DiagId,
        event: DiagEvent,
        scope: DiagScope,
        context: u32,
    ) -> Result<(), DiagError> {
        (**self).report_fault(id, event, scope, context)
    }
}

/// A single accepted fault report.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FaultRecord {
    pub sequence: u32,
    pub id: DiagId,
    pub event: DiagEvent,
    pub scope: DiagScope,
    pub context: u32,
}

const SCOPE_SLOTS: usize = STRING_COUNT + 1;

/// Upper bound on simultaneously latched faults.
pub const MAX_ACTIVE_FAULTS: usize = DIAG_ID_COUNT * SCOPE_SLOTS;

struct LogState<const N: usize> {
    history: HistoryBuf<FaultRecord, N>,
    active: [[bool; SCOPE_SLOTS]; DIAG_ID_COUNT],
    next_sequence: u32,
}

/// Diagnosis sink that keeps the latched fault status and a history of the
/// reports that changed it.
///
/// Repeated reports that leave the status unchanged are counted but not
/// stored, so a raised fault stays in the history while the signal keeps
/// being reported every cycle.
pub struct DiagnosisLog<const N: usize = 32> {
    state: Mutex<RefCell<LogState<N>>>,
}

impl<const N: usize> DiagnosisLog<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(LogState {
                history: HistoryBuf::new(),
                active: [[false; SCOPE_SLOTS]; DIAG_ID_COUNT],
                next_sequence: 0,
            })),
        }
    }

    /// Returns `true` while the last observation for `id`/`scope` was NOT_OK.
    #[must_use]
    pub fn is_active(&self, id: DiagId, scope: DiagScope) -> bool {
        let Some(slot) = scope.slot() else {
            return false;
        };
        critical_section::with(|cs| self.state.borrow_ref(cs).active[id.as_index()][slot])
    }

    /// Returns `true` when any fault is latched.
    #[must_use]
    pub fn any_active(&self) -> bool {
        critical_section::with(|cs| {
            self.state
                .borrow_ref(cs)
                .active
                .iter()
                .any(|scopes| scopes.iter().any(|active| *active))
        })
    }

    /// Lists every latched fault with its scope.
    #[must_use]
    pub fn active_faults(&self) -> Vec<(DiagId, DiagScope), MAX_ACTIVE_FAULTS> {
        critical_section::with(|cs| {
            let state = self.state.borrow_ref(cs);
            let mut active = Vec::new();
            for id in DiagId::ALL {
                for (slot, latched) in state.active[id.as_index()].iter().enumerate() {
                    if *latched {
                        // one entry per id and slot fits by construction
                        let _ = active.push((id, DiagScope::from_slot(slot)));
                    }
                }
            }
            active
        })
    }

    /// Returns the most recent report.
    #[must_use]
    pub fn latest(&self) -> Option<FaultRecord> {
        critical_section::with(|cs| self.state.borrow_ref(cs).history.recent().copied())
    }

    /// Number of reports currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.state.borrow_ref(cs).history.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of reports accepted since boot, including evicted ones.
    #[must_use]
    pub fn total_reports(&self) -> u32 {
        critical_section::with(|cs| self.state.borrow_ref(cs).next_sequence)
    }

    /// Copies the retained reports, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<FaultRecord, N> {
        critical_section::with(|cs| {
            let state = self.state.borrow_ref(cs);
            let mut records = Vec::new();
            for record in state.history.oldest_ordered() {
                // capacity matches the ring
                let _ = records.push(*record);
            }
            records
        })
    }

    /// Counts retained status changes matching `id` and `event`.
    #[must_use]
    pub fn count(&self, id: DiagId, event: DiagEvent) -> usize {
        critical_section::with(|cs| {
            self.state
                .borrow_ref(cs)
                .history
                .oldest_ordered()
                .filter(|record| record.id == id && record.event == event)
                .count()
        })
    }
}

impl<const N: usize> Default for DiagnosisLog<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DiagnosisSink for DiagnosisLog<N> {
    fn report_fault(
        &self,
        id: DiagId,
        event: DiagEvent,
        scope: DiagScope,
        context: u32,
    ) -> Result<(), DiagError> {
        let slot = scope.slot().ok_or(DiagError::InvalidScope(scope))?;

        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let sequence = state.next_sequence;
            state.next_sequence = sequence.wrapping_add(1);

            let active = matches!(event, DiagEvent::NotOk);
            let latched = &mut state.active[id.as_index()][slot];
            if *latched == active {
                return;
            }
            *latched = active;
            state.history.write(FaultRecord {
                sequence,
                id,
                event,
                scope,
                context,
            });
        });

        Ok(())
    }
}
