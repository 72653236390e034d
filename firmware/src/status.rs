#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Shared status storage for the firmware target.
//!
//! The scheduler publishes the running machine's start time here so the
//! sampler and the input tasks can stamp samples and edges with the same
//! machine-relative clock. Drop counters feed the periodic defmt summary.

use box_core::digital::InputLine;
use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Monotonic millisecond at which the running machine was initialized.
static MACHINE_STARTED_MS: AtomicU64 = AtomicU64::new(0);
/// Set once the host has sent a `T` line.
static CLOCK_SYNCED: AtomicBool = AtomicBool::new(false);
/// Output lines discarded because a transmit channel was full.
static DROPPED_LINES: AtomicU32 = AtomicU32::new(0);
/// Input or sampler events discarded because the event channel was full.
static DROPPED_EVENTS: AtomicU32 = AtomicU32::new(0);
/// Sampler ticks that took a full period or longer.
static SAMPLER_OVERRUNS: AtomicU32 = AtomicU32::new(0);
/// Live logical level of each sensor, written by the input tasks.
static INPUT_ACTIVE: [AtomicBool; InputLine::COUNT] =
    [AtomicBool::new(false), AtomicBool::new(false), AtomicBool::new(false)];

pub fn publish_machine_start(started_ms: u64) {
    MACHINE_STARTED_MS.store(started_ms, Ordering::Release);
}

/// Milliseconds since the running machine started, saturating at `u32::MAX`.
pub fn machine_elapsed_ms(now_ms: u64) -> u32 {
    let started = MACHINE_STARTED_MS.load(Ordering::Acquire);
    u32::try_from(now_ms.saturating_sub(started)).unwrap_or(u32::MAX)
}

pub fn set_clock_synced(synced: bool) {
    CLOCK_SYNCED.store(synced, Ordering::Relaxed);
}

pub fn clock_synced() -> bool {
    CLOCK_SYNCED.load(Ordering::Relaxed)
}

pub fn record_dropped_line() -> u32 {
    DROPPED_LINES.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

pub fn record_dropped_event() -> u32 {
    DROPPED_EVENTS.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

pub fn record_sampler_overrun() -> u32 {
    SAMPLER_OVERRUNS.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

pub fn record_input_level(line: InputLine, active: bool) {
    INPUT_ACTIVE[line.index()].store(active, Ordering::Release);
}

pub fn input_active(line: InputLine) -> bool {
    INPUT_ACTIVE[line.index()].load(Ordering::Acquire)
}

/// Counters reported by the periodic status log.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatusSnapshot {
    pub clock_synced: bool,
    pub dropped_lines: u32,
    pub dropped_events: u32,
    pub sampler_overruns: u32,
}

pub fn snapshot() -> StatusSnapshot {
    StatusSnapshot {
        clock_synced: clock_synced(),
        dropped_lines: DROPPED_LINES.load(Ordering::Relaxed),
        dropped_events: DROPPED_EVENTS.load(Ordering::Relaxed),
        sampler_overruns: SAMPLER_OVERRUNS.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_follows_the_published_start() {
        publish_machine_start(1_000);
        assert_eq!(machine_elapsed_ms(1_250), 250);
        // a stale start later than now clamps to zero
        assert_eq!(machine_elapsed_ms(900), 0);
        publish_machine_start(0);
        assert_eq!(machine_elapsed_ms(u64::MAX), u32::MAX);
    }

    #[test]
    fn input_levels_are_tracked_per_line() {
        record_input_level(InputLine::Nosepoke2, true);
        assert!(input_active(InputLine::Nosepoke2));
        assert!(!input_active(InputLine::Lick));
        record_input_level(InputLine::Nosepoke2, false);
        assert!(!input_active(InputLine::Nosepoke2));
    }
}
