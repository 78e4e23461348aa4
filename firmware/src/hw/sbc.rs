//! GPIO-level driver for the system basis chip.
//!
//! The companion exposes a toggled watchdog input, an error pin that stays
//! asserted while its fault error counter is non-zero, a feedback line from
//! the safety output, and the ignition wake input.

use bms_core::sbc::{CompanionError, SafetyCompanion};
use embassy_stm32::gpio::{Input, Level, Output};

/// Good refreshes the chip needs to walk its fault error counter down to zero.
const FAULT_COUNTER_REFRESHES: u8 = 6;

pub struct GpioCompanion<'d> {
    watchdog: Output<'d>,
    error: Input<'d>,
    safety_feedback: Input<'d>,
    safety_enable: Output<'d>,
    ignition: Input<'d>,
}

impl<'d> GpioCompanion<'d> {
    pub fn new(
        watchdog: Output<'d>,
        error: Input<'d>,
        safety_feedback: Input<'d>,
        safety_enable: Output<'d>,
        ignition: Input<'d>,
    ) -> Self {
        Self {
            watchdog,
            error,
            safety_feedback,
            safety_enable,
            ignition,
        }
    }
}

impl SafetyCompanion for GpioCompanion<'_> {
    fn init_phase1(&mut self) -> Result<(), CompanionError> {
        self.watchdog.set_level(Level::Low);
        self.safety_enable.set_low();
        // the feedback line idles high only while the chip is powered
        if self.safety_feedback.is_high() {
            Ok(())
        } else {
            Err(CompanionError::Communication)
        }
    }

    fn fault_counter_refreshes_required(&mut self) -> Result<u8, CompanionError> {
        if self.error.is_high() {
            Ok(FAULT_COUNTER_REFRESHES)
        } else {
            Ok(0)
        }
    }

    fn fault_counter_cleared(&mut self) -> Result<bool, CompanionError> {
        Ok(self.error.is_low())
    }

    fn check_safety_path(&mut self) -> Result<(), CompanionError> {
        self.safety_enable.set_high();
        let released = self.safety_feedback.is_low();
        self.safety_enable.set_low();
        let restored = self.safety_feedback.is_high();

        if released && restored {
            Ok(())
        } else {
            Err(CompanionError::Rejected)
        }
    }

    fn trigger_watchdog(&mut self) -> Result<(), CompanionError> {
        self.watchdog.toggle();
        Ok(())
    }

    fn ignition_active(&mut self) -> Option<bool> {
        Some(self.ignition.is_high())
    }
}
