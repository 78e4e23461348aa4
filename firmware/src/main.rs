#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate panic_halt;

#[cfg(any(target_os = "none", test))]
mod diag;
#[cfg(any(target_os = "none", test))]
mod monitor;
#[cfg(any(target_os = "none", test))]
mod queue;
#[cfg(any(target_os = "none", test))]
mod services;
#[cfg(any(target_os = "none", test))]
mod status;

#[cfg(target_os = "none")]
mod hw;
#[cfg(target_os = "none")]
mod runtime;

#[cfg(not(target_os = "none"))]
fn main() {}
