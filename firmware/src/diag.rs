//! Diagnosis sink that logs latched fault changes.
//!
//! The validator reports every signal on every cycle, so only reports that
//! flip the latched status of a fault reach the log.

use bms_core::diag::{DiagError, DiagEvent, DiagId, DiagScope, DiagnosisLog, DiagnosisSink};
use portable_atomic::{AtomicU32, Ordering};

pub struct LoggingDiagnosis<'a, const N: usize> {
    log: &'a DiagnosisLog<N>,
    changes: AtomicU32,
}

impl<'a, const N: usize> LoggingDiagnosis<'a, N> {
    pub const fn new(log: &'a DiagnosisLog<N>) -> Self {
        Self {
            log,
            changes: AtomicU32::new(0),
        }
    }

    /// Number of reports that raised or cleared a fault.
    pub fn changes(&self) -> u32 {
        self.changes.load(Ordering::Relaxed)
    }
}

impl<const N: usize> DiagnosisSink for LoggingDiagnosis<'_, N> {
    fn report_fault(
        &self,
        id: DiagId,
        event: DiagEvent,
        scope: DiagScope,
        context: u32,
    ) -> Result<(), DiagError> {
        let was_active = self.log.is_active(id, scope);
        if let Err(error) = self.log.report_fault(id, event, scope, context) {
            log_rejected(error);
            return Err(error);
        }

        let active = self.log.is_active(id, scope);
        if active != was_active {
            self.changes.fetch_add(1, Ordering::Relaxed);
            log_fault_change(id, scope, active, context);
        }
        Ok(())
    }
}

#[cfg(target_os = "none")]
fn log_fault_change(id: DiagId, scope: DiagScope, active: bool, context: u32) {
    if active {
        defmt::warn!(
            "diag: {} raised on {} context={}",
            id.label(),
            defmt::Display2Format(&scope),
            context
        );
    } else {
        defmt::info!(
            "diag: {} cleared on {}",
            id.label(),
            defmt::Display2Format(&scope)
        );
    }
}

#[cfg(not(target_os = "none"))]
fn log_fault_change(id: DiagId, scope: DiagScope, active: bool, context: u32) {
    if active {
        println!("diag: {id} raised on {scope} context={context}");
    } else {
        println!("diag: {id} cleared on {scope}");
    }
}

#[cfg(target_os = "none")]
fn log_rejected(error: DiagError) {
    defmt::error!("diag: report rejected: {}", defmt::Display2Format(&error));
}

#[cfg(not(target_os = "none"))]
fn log_rejected(error: DiagError) {
    println!("diag: report rejected: {error}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_status_flips_count_as_changes() {
        let log = DiagnosisLog::<8>::new();
        let sink = LoggingDiagnosis::new(&log);
        let scope = DiagScope::String(0);

        for _ in 0..3 {
            sink.report_fault(DiagId::CellVoltageBaseTimeout, DiagEvent::Ok, scope, 0)
                .unwrap();
        }
        assert_eq!(sink.changes(), 0);

        sink.report_fault(DiagId::CellVoltageBaseTimeout, DiagEvent::NotOk, scope, 260)
            .unwrap();
        sink.report_fault(DiagId::CellVoltageBaseTimeout, DiagEvent::NotOk, scope, 270)
            .unwrap();
        assert_eq!(sink.changes(), 1);
        assert!(log.is_active(DiagId::CellVoltageBaseTimeout, scope));

        sink.report_fault(DiagId::CellVoltageBaseTimeout, DiagEvent::Ok, scope, 0)
            .unwrap();
        assert_eq!(sink.changes(), 2);
        assert_eq!(log.total_reports(), 6);
    }

    #[test]
    fn rejected_scope_is_passed_through() {
        let log = DiagnosisLog::<8>::new();
        let sink = LoggingDiagnosis::new(&log);
        let scope = DiagScope::String(42);

        assert_eq!(
            sink.report_fault(DiagId::CellVoltageInvalidCells, DiagEvent::NotOk, scope, 1),
            Err(DiagError::InvalidScope(scope))
        );
        assert!(log.is_empty());
        assert_eq!(sink.changes(), 0);
    }
}
