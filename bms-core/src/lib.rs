#![no_std]

// Safety control core of the battery management system.
//
// The state machines, the redundancy validator, and the collaborator seams
// live here without touching the Rust standard library so the same logic runs
// on the MCU image and under host tests.

pub mod config;
pub mod database;
pub mod diag;
pub mod fsm;
pub mod redundancy;
pub mod rtc;
pub mod sbc;
pub mod sys;
pub mod time;
