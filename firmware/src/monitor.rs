//! Detects and logs state changes of the safety state machines.

use core::fmt::Display;

use bms_core::fsm::HierarchicalState;

/// A change between two consecutive observations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Change<S> {
    /// The top-level state changed.
    State { from: S, to: S },
    /// Only the substate within the same top-level state changed.
    Substate { from: S, to: S },
}

/// Remembers the last state seen for one machine.
pub struct StateMonitor<S> {
    name: &'static str,
    last: S,
}

impl<S> StateMonitor<S>
where
    S: HierarchicalState + Display,
{
    pub const fn new(name: &'static str, initial: S) -> Self {
        Self {
            name,
            last: initial,
        }
    }

    /// Records `state` and logs it when it differs from the last observation.
    pub fn observe(&mut self, state: S) -> Option<Change<S>> {
        if state == self.last {
            return None;
        }

        let from = self.last;
        self.last = state;
        let change = if from.top() == state.top() {
            Change::Substate { from, to: state }
        } else {
            Change::State { from, to: state }
        };
        log_change(self.name, change);
        Some(change)
    }
}

#[cfg(target_os = "none")]
fn log_change<S: Display>(name: &'static str, change: Change<S>) {
    match change {
        Change::State { from, to } => defmt::info!(
            "{}: state {} -> {}",
            name,
            defmt::Display2Format(&from),
            defmt::Display2Format(&to)
        ),
        Change::Substate { from, to } => defmt::debug!(
            "{}: substate {} -> {}",
            name,
            defmt::Display2Format(&from),
            defmt::Display2Format(&to)
        ),
    }
}

#[cfg(not(target_os = "none"))]
fn log_change<S: Display>(name: &'static str, change: Change<S>) {
    match change {
        Change::State { from, to } => println!("{name}: state {from} -> {to}"),
        Change::Substate { from, to } => println!("{name}: substate {from} -> {to}"),
    }
}

#[cfg(test)]
mod tests {
    use bms_core::sbc::{SbcInitStep, SbcState};

    use super::*;

    #[test]
    fn distinguishes_state_and_substate_changes() {
        let mut monitor = StateMonitor::new("sbc", SbcState::Uninitialized);
        assert_eq!(monitor.observe(SbcState::Uninitialized), None);

        let entry = SbcState::Initialization(SbcInitStep::Entry);
        assert_eq!(
            monitor.observe(entry),
            Some(Change::State {
                from: SbcState::Uninitialized,
                to: entry,
            })
        );

        let part1 = SbcState::Initialization(SbcInitStep::ResetFaultCounterPart1);
        assert_eq!(
            monitor.observe(part1),
            Some(Change::Substate {
                from: entry,
                to: part1,
            })
        );
        assert_eq!(monitor.observe(part1), None);
    }
}
