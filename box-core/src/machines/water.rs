//! Free water sessions: a random pause, a short tone, and two pulses for a
//! lick inside the response window.

use crate::digital::InputLine;
use crate::hardware::BoxIo;
use crate::scheduler::SchedulerContext;
use crate::telemetry::{DailyIntakeLine, SerialSink};

use super::{BodyStep, LICK_WINDOW_MS, SessionBody, Timer, random_delay, report_summary, take_lick};

/// Which intake counter closes the session.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaterQuota {
    /// Ends on its own once the daily intake reaches the daily quota.
    Daily,
    /// Runs until stopped.
    Weekly,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Top,
    Pause(Timer),
    Tone(Timer),
    Window(Timer),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WaterSession {
    quota: WaterQuota,
    phase: Phase,
}

impl WaterSession {
    #[must_use]
    pub const fn new(quota: WaterQuota) -> Self {
        Self {
            quota,
            phase: Phase::Top,
        }
    }

    fn close<S, const RQ: usize, const TQ: usize>(&self, ctx: &mut SchedulerContext<S, RQ, TQ>)
    where
        S: SerialSink + Clone,
    {
        match self.quota {
            WaterQuota::Daily => {
                ctx.write_line(&DailyIntakeLine(ctx.daily_intake()));
                ctx.reset_daily_intake();
                report_summary(ctx, ctx.config.daily_quota);
            }
            WaterQuota::Weekly => {
                report_summary(ctx, ctx.config.weekly_quota);
                ctx.reset_weekly_intake();
            }
        }
    }
}

impl SessionBody for WaterSession {
    fn open<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        _ctx: &mut SchedulerContext<S, RQ, TQ>,
        _io: &mut IO,
    ) where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        self.phase = Phase::Top;
    }

    fn run<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        io: &mut IO,
    ) -> BodyStep
    where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        let now = ctx.now();
        match self.phase {
            Phase::Top => {
                if ctx.stop_requested() {
                    self.close(ctx);
                    return BodyStep::Stopped;
                }
                if self.quota == WaterQuota::Daily && ctx.daily_intake() >= ctx.config.daily_quota {
                    self.close(ctx);
                    ctx.stage_upcoming_non_session();
                    return BodyStep::Stopped;
                }
                self.phase = Phase::Pause(random_delay(ctx, 1_000, 3_000));
            }
            Phase::Pause(mut timer) => {
                self.phase = if timer.expired(now) {
                    ctx.tone_on(io);
                    Phase::Tone(Timer::millis(250))
                } else {
                    Phase::Pause(timer)
                };
            }
            Phase::Tone(mut timer) => {
                self.phase = if timer.expired(now) {
                    ctx.tone_off(io);
                    io.inputs().clear(InputLine::Lick);
                    Phase::Window(Timer::millis(LICK_WINDOW_MS))
                } else {
                    Phase::Tone(timer)
                };
            }
            Phase::Window(mut timer) => {
                if take_lick(io) {
                    ctx.give_reward(io, 2);
                    self.phase = Phase::Top;
                } else if timer.closed(now) {
                    self.phase = Phase::Top;
                } else {
                    self.phase = Phase::Window(timer);
                }
            }
        }
        BodyStep::Continue
    }
}
