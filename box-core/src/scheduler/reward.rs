//! Non-blocking water reward delivery.

use core::time::Duration;

use crate::clock::Instant;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Idle,
    Open { until: Instant },
    Gap { until: Instant },
}

/// What the valve driver must do after a poll.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RewardStep {
    Idle,
    Busy,
    CloseValve,
    /// One pulse completed its closed gap; `more` asks for the valve to open
    /// again.
    PulseDelivered { more: bool },
}

/// Pulse train of `open` then `gap` repeated once per pulse.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RewardDispenser {
    remaining: u8,
    phase: Phase,
}

impl RewardDispenser {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            remaining: 0,
            phase: Phase::Idle,
        }
    }

    /// Arms `pulses` pulses starting at `now`. Returns `true` when the valve
    /// must open immediately.
    pub fn start(&mut self, pulses: u8, now: Instant, open: Duration) -> bool {
        self.remaining = pulses;
        if pulses == 0 {
            self.phase = Phase::Idle;
            return false;
        }
        self.phase = Phase::Open { until: now + open };
        true
    }

    pub fn poll(&mut self, now: Instant, open: Duration, gap: Duration) -> RewardStep {
        match self.phase {
            Phase::Idle => RewardStep::Idle,
            Phase::Open { until } if now >= until => {
                self.phase = Phase::Gap { until: now + gap };
                RewardStep::CloseValve
            }
            Phase::Gap { until } if now >= until => {
                self.remaining = self.remaining.saturating_sub(1);
                if self.remaining > 0 {
                    self.phase = Phase::Open { until: now + open };
                    RewardStep::PulseDelivered { more: true }
                } else {
                    self.phase = Phase::Idle;
                    RewardStep::PulseDelivered { more: false }
                }
            }
            Phase::Open { .. } | Phase::Gap { .. } => RewardStep::Busy,
        }
    }

    #[must_use]
    pub const fn is_busy(&self) -> bool {
        !matches!(self.phase, Phase::Idle)
    }
}

impl Default for RewardDispenser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPEN: Duration = Duration::from_millis(18);
    const GAP: Duration = Duration::from_millis(20);

    #[test]
    fn two_pulses_follow_open_then_gap() {
        let mut dispenser = RewardDispenser::new();
        assert!(dispenser.start(2, Instant::ZERO, OPEN));
        assert!(dispenser.is_busy());

        let at = Instant::from_millis;
        assert_eq!(dispenser.poll(at(10), OPEN, GAP), RewardStep::Busy);
        assert_eq!(dispenser.poll(at(18), OPEN, GAP), RewardStep::CloseValve);
        assert_eq!(dispenser.poll(at(37), OPEN, GAP), RewardStep::Busy);
        assert_eq!(
            dispenser.poll(at(38), OPEN, GAP),
            RewardStep::PulseDelivered { more: true }
        );
        assert_eq!(dispenser.poll(at(56), OPEN, GAP), RewardStep::CloseValve);
        assert_eq!(
            dispenser.poll(at(76), OPEN, GAP),
            RewardStep::PulseDelivered { more: false }
        );
        assert!(!dispenser.is_busy());
        assert_eq!(dispenser.poll(at(90), OPEN, GAP), RewardStep::Idle);
    }

    #[test]
    fn zero_pulses_never_open() {
        let mut dispenser = RewardDispenser::new();
        assert!(!dispenser.start(0, Instant::ZERO, OPEN));
        assert!(!dispenser.is_busy());
    }
}
