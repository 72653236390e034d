//! Nosepoke stages: a poke into either port starts a tone, and a lick in the
//! following window is rewarded, always or with a fixed probability.

use rand::Rng;

use crate::hardware::BoxIo;
use crate::scheduler::SchedulerContext;
use crate::telemetry::{ReportEvent, SerialSink};

use super::{
    BodyStep, LICK_WINDOW_MS, SOUND_CUE_CODE, SessionBody, Timer, nosepoke_latched,
    random_delay, report_nosepokes, report_summary, set_cameras, take_lick, uptime_ms,
};

/// How a nosepoke reward stage ends once it collected enough rewards.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Completion {
    /// Advance to the next stage's session machine.
    AdvanceStage,
    /// Bump the stage while it is below `below`, then go to the non-session
    /// machine of the resulting stage.
    NonSession { below: u8 },
}

/// Parameters of the poke, tone, lick family.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NosepokeRewardConfig {
    /// Chance in percent that a lick in the window is rewarded.
    pub reward_percent: u8,
    /// Give one pulse right after the tone, before the window opens.
    pub priming_reward: bool,
    /// Report every lick in the window with 26.
    pub report_licks: bool,
    /// Camera lights on for the session and off at stop.
    pub cameras: bool,
    pub initial_count: u32,
    pub complete_after: u32,
    pub completion: Completion,
}

impl NosepokeRewardConfig {
    pub const ONE_SOUND: Self = Self {
        reward_percent: 100,
        priming_reward: false,
        report_licks: false,
        cameras: true,
        initial_count: 0,
        complete_after: 200,
        completion: Completion::AdvanceStage,
    };
    pub const PROB70: Self = Self {
        reward_percent: 70,
        ..Self::ONE_SOUND
    };
    pub const PROB40: Self = Self {
        reward_percent: 40,
        report_licks: true,
        ..Self::ONE_SOUND
    };
    pub const REWARD_NON_SESSION: Self = Self {
        reward_percent: 100,
        priming_reward: true,
        report_licks: false,
        cameras: false,
        initial_count: 201,
        complete_after: 200,
        completion: Completion::NonSession { below: 3 },
    };

    /// Whether a lick is paid given a uniform draw in `0..100`.
    ///
    /// The draw must be strictly above `100 - reward_percent`, so a 70%
    /// stage pays on 69 of 100 draws.
    #[must_use]
    pub const fn pays(&self, draw: u8) -> bool {
        self.reward_percent >= 100 || draw > 100 - self.reward_percent
    }
}

/// Bumps the current protocol's stage while it is below `below`.
fn bump_stage_below<S, const RQ: usize, const TQ: usize>(
    ctx: &mut SchedulerContext<S, RQ, TQ>,
    below: u8,
) where
    S: SerialSink + Clone,
{
    let protocol = ctx.registers.current_protocol;
    let stage = ctx.stages.get(protocol);
    if stage < below {
        ctx.stages.set(protocol, stage + 1);
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum RewardPhase {
    Top,
    Cue(Timer),
    OpenWindow,
    Window(Timer),
    Resolve { rewarded: bool },
}

/// Poke, half second tone, lick window with a probabilistic reward.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NosepokeReward {
    config: NosepokeRewardConfig,
    rewards: u32,
    phase: RewardPhase,
}

impl NosepokeReward {
    #[must_use]
    pub const fn new(config: NosepokeRewardConfig) -> Self {
        Self {
            config,
            rewards: config.initial_count,
            phase: RewardPhase::Top,
        }
    }

    #[must_use]
    pub const fn rewards(&self) -> u32 {
        self.rewards
    }

    fn complete<S, const RQ: usize, const TQ: usize>(
        &self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
    ) -> BodyStep
    where
        S: SerialSink + Clone,
    {
        report_summary(ctx, self.rewards);
        match self.config.completion {
            Completion::AdvanceStage => ctx.advance_stage(true),
            Completion::NonSession { below } => {
                bump_stage_below(ctx, below);
                ctx.stage_current_non_session();
            }
        }
        ctx.end_current_machine();
        BodyStep::Ended
    }
}

impl SessionBody for NosepokeReward {
    fn open<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        io: &mut IO,
    ) where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        set_cameras(ctx, io, self.config.cameras);
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
            RewardPhase::Top => {
                if ctx.stop_requested() {
                    report_summary(ctx, self.rewards);
                    if self.config.cameras {
                        set_cameras(ctx, io, false);
                    }
                    return BodyStep::Stopped;
                }
                if nosepoke_latched(io) {
                    let when = ctx.elapsed_ms();
                    report_nosepokes(ctx, io, when);
                    ctx.tone_on(io);
                    self.phase = RewardPhase::Cue(Timer::millis(500));
                } else if self.rewards > self.config.complete_after {
                    return self.complete(ctx);
                }
            }
            RewardPhase::Cue(mut timer) => {
                if timer.expired(now) {
                    ctx.tone_off(io);
                    if self.config.priming_reward {
                        ctx.give_reward(io, 1);
                    }
                    self.phase = RewardPhase::OpenWindow;
                } else {
                    self.phase = RewardPhase::Cue(timer);
                }
            }
            RewardPhase::OpenWindow => {
                self.phase = RewardPhase::Window(Timer::millis(LICK_WINDOW_MS));
            }
            RewardPhase::Window(mut timer) => {
                if take_lick(io) {
                    if self.config.report_licks {
                        ctx.report(ReportEvent::LickReported, 1);
                    }
                    let draw = ctx.rng().gen_range(0..100);
                    let rewarded = self.config.pays(draw);
                    if rewarded {
                        ctx.give_reward(io, 1);
                        self.rewards += 1;
                    }
                    self.phase = RewardPhase::Resolve { rewarded };
                } else if timer.closed(now) {
                    self.phase = RewardPhase::Resolve { rewarded: false };
                } else {
                    self.phase = RewardPhase::Window(timer);
                }
            }
            RewardPhase::Resolve { rewarded } => {
                if !rewarded {
                    ctx.report(ReportEvent::NoReward, 1);
                }
                self.phase = RewardPhase::Top;
            }
        }
        BodyStep::Continue
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum NonSessionPhase {
    Top,
    Pause(Timer),
    Delay(Timer),
    Window(Timer),
    Resolve,
}

/// Out of session pokes: after a random pause, a poke plays the cue and a
/// delayed tone, and a lick in the window is rewarded. Moves to the next
/// stage's non-session machine after enough pokes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NosepokeNonSession {
    pokes: u32,
    rewards: u32,
    phase: NonSessionPhase,
}

impl NosepokeNonSession {
    pub const COMPLETE_AFTER: u32 = 100;
    const STAGE_BELOW: u8 = 2;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            pokes: 0,
            rewards: 0,
            phase: NonSessionPhase::Top,
        }
    }

    #[must_use]
    pub const fn pokes(&self) -> u32 {
        self.pokes
    }
}

impl Default for NosepokeNonSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBody for NosepokeNonSession {
    fn open<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        _ctx: &mut SchedulerContext<S, RQ, TQ>,
        _io: &mut IO,
    ) where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        self.phase = NonSessionPhase::Top;
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
            NonSessionPhase::Top => {
                if ctx.stop_requested() {
                    report_summary(ctx, self.pokes);
                    return BodyStep::Stopped;
                }
                self.phase = NonSessionPhase::Pause(random_delay(ctx, 10_000, 30_000));
            }
            NonSessionPhase::Pause(mut timer) => {
                if nosepoke_latched(io) {
                    let when = ctx.elapsed_ms();
                    report_nosepokes(ctx, io, when);
                    ctx.report(ReportEvent::Custom(SOUND_CUE_CODE), 1);
                    self.pokes += 1;
                    self.phase = NonSessionPhase::Delay(Timer::millis(350));
                } else if timer.closed(now) {
                    self.phase = NonSessionPhase::Resolve;
                } else {
                    self.phase = NonSessionPhase::Pause(timer);
                }
            }
            NonSessionPhase::Delay(mut timer) => {
                if timer.expired(now) {
                    ctx.tone_on(io);
                    self.phase = NonSessionPhase::Window(Timer::millis(LICK_WINDOW_MS));
                } else {
                    self.phase = NonSessionPhase::Delay(timer);
                }
            }
            NonSessionPhase::Window(mut timer) => {
                if take_lick(io) {
                    ctx.report(ReportEvent::LickReported, 1);
                    ctx.tone_off(io);
                    ctx.give_reward(io, 1);
                    self.rewards += 1;
                    self.phase = NonSessionPhase::Resolve;
                } else if timer.closed(now) {
                    self.phase = NonSessionPhase::Resolve;
                } else {
                    self.phase = NonSessionPhase::Window(timer);
                }
            }
            NonSessionPhase::Resolve => {
                ctx.tone_off(io);
                ctx.report_at(ReportEvent::CueCycleComplete, 1, uptime_ms(now));
                if self.pokes > Self::COMPLETE_AFTER {
                    report_summary(ctx, self.pokes);
                    bump_stage_below(ctx, Self::STAGE_BELOW);
                    ctx.stage_current_non_session();
                    ctx.end_current_machine();
                    return BodyStep::Ended;
                }
                self.phase = NonSessionPhase::Top;
            }
        }
        BodyStep::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digital::InputLine;
    use crate::hardware::SimulatedIo;
    use crate::machines::testing::{Lines, context, run_until};
    use crate::machines::{Session, TransitionRequest};

    #[test]
    fn reward_draw_thresholds() {
        let prob70 = NosepokeRewardConfig::PROB70;
        assert!(!prob70.pays(30));
        assert!(prob70.pays(31));
        assert_eq!((0..100).filter(|draw| prob70.pays(*draw)).count(), 69);
        assert_eq!(
            (0..100)
                .filter(|draw| NosepokeRewardConfig::PROB40.pays(*draw))
                .count(),
            39
        );
        assert!(NosepokeRewardConfig::ONE_SOUND.pays(0));
    }

    #[test]
    fn poke_then_lick_is_rewarded() {
        let sink = Lines::default();
        let mut ctx = context(&sink);
        let mut io = SimulatedIo::new();
        let mut session = Session::new(NosepokeReward::new(NosepokeRewardConfig::ONE_SOUND));

        run_until(
            &mut session,
            &mut ctx,
            &mut io,
            3_000,
            |_, _, _| false,
            |ms, io| match ms {
                100 => {
                    io.activate(InputLine::Nosepoke2, 0);
                }
                150 => {
                    io.release(InputLine::Nosepoke2, 0);
                }
                900 => {
                    io.activate(InputLine::Lick, 0);
                }
                _ => {}
            },
        );

        assert_eq!(session.body().rewards(), 1);
        assert_eq!(sink.count_prefix("81,2,"), 1);
        assert_eq!(sink.events(86), 0);
        assert!(io.tone_duty() == 0);
    }

    #[test]
    fn missed_window_reports_no_reward() {
        let sink = Lines::default();
        let mut ctx = context(&sink);
        let mut io = SimulatedIo::new();
        let mut session = Session::new(NosepokeReward::new(NosepokeRewardConfig::PROB40));

        run_until(
            &mut session,
            &mut ctx,
            &mut io,
            7_000,
            |_, _, _| false,
            |ms, io| {
                if ms == 100 {
                    io.activate(InputLine::Nosepoke1, 0);
                }
            },
        );

        assert_eq!(session.body().rewards(), 0);
        assert_eq!(sink.events(86), 1);
    }

    #[test]
    fn reward_non_session_completes_immediately() {
        let sink = Lines::default();
        let mut ctx = context(&sink);
        let mut io = SimulatedIo::new();
        let mut session = Session::new(NosepokeReward::new(
            NosepokeRewardConfig::REWARD_NON_SESSION,
        ));

        let last = run_until(
            &mut session,
            &mut ctx,
            &mut io,
            100,
            |_, _, request| request == TransitionRequest::Finished,
            |_, _| {},
        );
        assert_eq!(last, TransitionRequest::Finished);
        assert_eq!(ctx.current_stage(), 1);
        assert_eq!(sink.count_prefix("63,201,"), 1);
    }

    #[test]
    fn non_session_counts_pokes() {
        let sink = Lines::default();
        let mut ctx = context(&sink);
        let mut io = SimulatedIo::new();
        let mut session = Session::new(NosepokeNonSession::new());

        run_until(
            &mut session,
            &mut ctx,
            &mut io,
            40_000,
            |_, _, _| false,
            |ms, io| {
                if ms == 5_000 {
                    io.activate(InputLine::Nosepoke1, 0);
                }
            },
        );
        assert_eq!(session.body().pokes(), 1);
        assert_eq!(sink.events(SOUND_CUE_CODE), 1);
    }
}
