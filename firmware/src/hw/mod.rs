//! Board-level drivers for the STM32G0 controller.

#![cfg(target_os = "none")]

pub mod sbc;
