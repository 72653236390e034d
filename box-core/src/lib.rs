#![no_std]

// Shared logic for the behavior box.
//
// Everything here stays portable across the MCU firmware and the host emulator
// by avoiding the standard library and allocation. Hardware, serial ports and
// time sources are reached through the traits in `hardware`, `telemetry` and
// `clock`.

pub mod alarms;
pub mod analog;
pub mod buffer;
pub mod clock;
pub mod command;
pub mod config;
pub mod digital;
pub mod hardware;
pub mod machines;
pub mod protocol;
pub mod queue;
pub mod sampler;
pub mod scheduler;
pub mod telemetry;
