//! Lick shaping stages: tone cued water after a long random pause, with
//! stage advancement once enough rewards were collected.

use crate::digital::InputLine;
use crate::hardware::BoxIo;
use crate::scheduler::SchedulerContext;
use crate::telemetry::{ReportEvent, SerialSink};

use super::{
    BodyStep, LICK_WINDOW_MS, SOUND_CUE_CODE, SessionBody, Timer, clear_nosepokes,
    nosepoke_latched, random_delay, report_summary, set_cameras, take_lick, uptime_ms,
};

const PAUSE_MIN_MS: u64 = 10_000;
const PAUSE_MAX_MS: u64 = 30_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum TrainPhase {
    Top,
    Pause(Timer),
    Window(Timer),
    Resolve,
}

/// Tone and lick window after each pause. A nosepoke during the pause plays
/// the cue and opens the window early. Advances the stage after more than
/// twenty rewards.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LickTrain {
    rewards: u32,
    phase: TrainPhase,
}

impl LickTrain {
    pub const ADVANCE_AFTER: u32 = 20;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            rewards: 0,
            phase: TrainPhase::Top,
        }
    }

    #[must_use]
    pub const fn rewards(&self) -> u32 {
        self.rewards
    }

    fn open_window<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        io: &mut IO,
    ) where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        io.inputs().clear(InputLine::Lick);
        ctx.tone_on(io);
        self.phase = TrainPhase::Window(Timer::millis(LICK_WINDOW_MS));
    }
}

impl Default for LickTrain {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBody for LickTrain {
    fn open<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        io: &mut IO,
    ) where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        self.rewards = 0;
        set_cameras(ctx, io, true);
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
            TrainPhase::Top => {
                if ctx.stop_requested() {
                    report_summary(ctx, self.rewards);
                    set_cameras(ctx, io, false);
                    return BodyStep::Stopped;
                }
                self.phase = TrainPhase::Pause(random_delay(ctx, PAUSE_MIN_MS, PAUSE_MAX_MS));
            }
            TrainPhase::Pause(mut timer) => {
                // licks during the pause are discarded
                take_lick(io);
                if nosepoke_latched(io) {
                    clear_nosepokes(io);
                    ctx.report(ReportEvent::Custom(SOUND_CUE_CODE), 1);
                    self.open_window(ctx, io);
                } else if timer.closed(now) {
                    self.open_window(ctx, io);
                } else {
                    self.phase = TrainPhase::Pause(timer);
                }
            }
            TrainPhase::Window(mut timer) => {
                if take_lick(io) {
                    ctx.tone_off(io);
                    ctx.give_reward(io, 1);
                    self.rewards += 1;
                    self.phase = TrainPhase::Resolve;
                } else if timer.closed(now) {
                    self.phase = TrainPhase::Resolve;
                } else {
                    self.phase = TrainPhase::Window(timer);
                }
            }
            TrainPhase::Resolve => {
                ctx.report_at(ReportEvent::CueCycleComplete, 1, uptime_ms(now));
                ctx.tone_off(io);
                if self.rewards > Self::ADVANCE_AFTER {
                    report_summary(ctx, self.rewards);
                    ctx.advance_stage(true);
                    ctx.end_current_machine();
                    return BodyStep::Ended;
                }
                self.phase = TrainPhase::Top;
            }
        }
        BodyStep::Continue
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum TestPhase {
    Top,
    Pause(Timer),
    Cue { timer: Timer, reward: bool },
    OpenWindow,
    Window(Timer),
    Resolve,
}

/// Like [`LickTrain`], but a lick during the pause is itself rewarded after a
/// half second tone, and the reward count starts past the advancement
/// threshold.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LickTest {
    rewards: u32,
    phase: TestPhase,
}

impl LickTest {
    pub const ADVANCE_AFTER: u32 = 100;
    const INITIAL_COUNT: u32 = 101;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            rewards: Self::INITIAL_COUNT,
            phase: TestPhase::Top,
        }
    }
}

impl Default for LickTest {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBody for LickTest {
    fn open<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        io: &mut IO,
    ) where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        set_cameras(ctx, io, true);
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
            TestPhase::Top => {
                if ctx.stop_requested() {
                    report_summary(ctx, self.rewards);
                    set_cameras(ctx, io, false);
                    return BodyStep::Stopped;
                }
                self.phase = TestPhase::Pause(random_delay(ctx, PAUSE_MIN_MS, PAUSE_MAX_MS));
            }
            TestPhase::Pause(mut timer) => {
                if take_lick(io) {
                    ctx.report(ReportEvent::LickReported, 1);
                    ctx.tone_on(io);
                    self.phase = TestPhase::Cue {
                        timer: Timer::millis(500),
                        reward: true,
                    };
                } else if nosepoke_latched(io) {
                    clear_nosepokes(io);
                    ctx.tone_on(io);
                    self.phase = TestPhase::Cue {
                        timer: Timer::millis(500),
                        reward: false,
                    };
                } else if timer.closed(now) {
                    self.phase = TestPhase::OpenWindow;
                } else {
                    self.phase = TestPhase::Pause(timer);
                }
            }
            TestPhase::Cue { mut timer, reward } => {
                if timer.expired(now) {
                    ctx.tone_off(io);
                    if reward {
                        ctx.give_reward(io, 1);
                        self.rewards += 1;
                    }
                    self.phase = TestPhase::OpenWindow;
                } else {
                    self.phase = TestPhase::Cue { timer, reward };
                }
            }
            TestPhase::OpenWindow => {
                ctx.tone_on(io);
                self.phase = TestPhase::Window(Timer::millis(LICK_WINDOW_MS));
            }
            TestPhase::Window(mut timer) => {
                if take_lick(io) {
                    ctx.tone_off(io);
                    ctx.give_reward(io, 1);
                    self.rewards += 1;
                    self.phase = TestPhase::Resolve;
                } else if timer.closed(now) {
                    self.phase = TestPhase::Resolve;
                } else {
                    self.phase = TestPhase::Window(timer);
                }
            }
            TestPhase::Resolve => {
                ctx.tone_off(io);
                io.inputs().clear(InputLine::Lick);
                if self.rewards > Self::ADVANCE_AFTER {
                    report_summary(ctx, self.rewards);
                    ctx.advance_stage(true);
                    ctx.end_current_machine();
                    return BodyStep::Ended;
                }
                self.phase = TestPhase::Top;
            }
        }
        BodyStep::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedIo;
    use crate::machines::testing::{Lines, context, run_until};
    use crate::machines::{Session, TransitionRequest};
    use crate::protocol::{ProtocolTable, StageEntry, StateId};

    #[test]
    fn lick_train_advances_after_enough_rewards() {
        let sink = Lines::default();
        let mut ctx = context(&sink);
        ctx.table = ProtocolTable::standard().with_stage(
            0,
            1,
            StageEntry::new(StateId::LickTest, StateId::DoNothing),
        );
        let mut io = SimulatedIo::new();
        let mut session = Session::new(LickTrain::new());

        let last = run_until(
            &mut session,
            &mut ctx,
            &mut io,
            30 * 60_000,
            |_, _, request| request == TransitionRequest::Finished,
            |_, io| {
                if io.tone_duty() > 0 {
                    io.activate(InputLine::Lick, 0);
                    io.release(InputLine::Lick, 0);
                }
            },
        );

        assert_eq!(last, TransitionRequest::Finished);
        assert_eq!(session.body().rewards(), LickTrain::ADVANCE_AFTER + 1);
        assert_eq!(ctx.current_stage(), 1);
        assert_eq!(ctx.registers.current_state, StateId::LickTest);
        assert_eq!(sink.events(89), 21);
        // advancing stages skips the end slot and the protocol change
        assert_eq!(sink.events(72), 0);
    }

    #[test]
    fn lick_test_advances_on_first_reward() {
        let sink = Lines::default();
        let mut ctx = context(&sink);
        let mut io = SimulatedIo::new();
        let mut session = Session::new(LickTest::new());

        let last = run_until(
            &mut session,
            &mut ctx,
            &mut io,
            60_000,
            |_, _, request| request == TransitionRequest::Finished,
            |ms, io| {
                if ms == 2_000 {
                    io.activate(InputLine::Lick, 0);
                }
            },
        );

        assert_eq!(last, TransitionRequest::Finished);
        assert_eq!(sink.events(26), 1);
        assert!(sink.count_prefix("63,102,") == 1);
        assert_eq!(ctx.daily_intake(), 1);
    }
}
