//! Two-port probabilistic block task.
//!
//! Each block draws a reward probability per port. Usually the two are
//! complementary (`p2 = 100 - p1`); with `unstructured_percent` chance the
//! second port gets an independent draw instead. A poke picks the port, a
//! tone cues the lick window, and a lick is paid with the chosen port's
//! probability. After `min_block_trials` licked trials every trial may end
//! the block with `switch_percent` chance. The session stops itself after
//! `session_limit_ms`.

use rand::Rng;
use rand::seq::SliceRandom;

use crate::digital::InputLine;
use crate::hardware::BoxIo;
use crate::scheduler::SchedulerContext;
use crate::telemetry::{ReportEvent, SerialSink, TrialEvent, TrialOutcome, TrialSummary};

use super::{
    BodyStep, LICK_WINDOW_MS, SessionBody, Timer, nosepoke_latched, report_nosepokes,
    report_summary, take_lick,
};

/// Reward probabilities a port can be assigned, in percent.
pub const PORT_PROBABILITIES: [u8; 6] = [20, 30, 40, 60, 70, 80];

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockTaskConfig {
    pub unstructured_percent: u8,
    pub session_limit_ms: u64,
    pub min_block_trials: u32,
    pub switch_percent: u8,
}

impl BlockTaskConfig {
    pub const STANDARD: Self = Self {
        unstructured_percent: 16,
        session_limit_ms: 40 * 60 * 1_000,
        min_block_trials: 100,
        switch_percent: 2,
    };
}

impl Default for BlockTaskConfig {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Draws the port probabilities of a new block.
pub fn draw_block_probabilities<R: Rng + ?Sized>(rng: &mut R, unstructured_percent: u8) -> [u8; 2] {
    let first = PORT_PROBABILITIES.choose(rng).copied().unwrap_or(50);
    let second = if rng.gen_range(0..100) < unstructured_percent {
        PORT_PROBABILITIES.choose(rng).copied().unwrap_or(50)
    } else {
        100 - first
    };
    [first, second]
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Trial {
    port: u8,
    percent: u8,
    started_epoch_ms: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Response {
    licked: bool,
    rewarded: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    NewBlock,
    Top,
    Cue { trial: Trial, timer: Timer },
    Window { trial: Trial, timer: Timer },
    Resolve { trial: Trial, response: Response },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockTask {
    config: BlockTaskConfig,
    probabilities: [u8; 2],
    trials: u32,
    rewards: u32,
    block_started_epoch_ms: u64,
    phase: Phase,
}

impl BlockTask {
    #[must_use]
    pub const fn new(config: BlockTaskConfig) -> Self {
        Self {
            config,
            probabilities: [0; 2],
            trials: 0,
            rewards: 0,
            block_started_epoch_ms: 0,
            phase: Phase::NewBlock,
        }
    }

    #[must_use]
    pub const fn probabilities(&self) -> [u8; 2] {
        self.probabilities
    }

    #[must_use]
    pub const fn trials(&self) -> u32 {
        self.trials
    }

    #[must_use]
    pub const fn rewards(&self) -> u32 {
        self.rewards
    }

    fn start_block<S, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
    ) where
        S: SerialSink + Clone,
    {
        self.block_started_epoch_ms = ctx.epoch_millis();
        ctx.session.block_id += 1;
        self.trials = 0;
        self.rewards = 0;
        self.probabilities = draw_block_probabilities(ctx.rng(), self.config.unstructured_percent);
        for (port, percent) in (1..).zip(self.probabilities) {
            // the time column carries the probability
            ctx.report_at(ReportEvent::BlockProbability, port, u32::from(percent));
        }
    }

    fn report_block<S, const RQ: usize, const TQ: usize>(&self, ctx: &mut SchedulerContext<S, RQ, TQ>)
    where
        S: SerialSink + Clone,
    {
        ctx.report(
            ReportEvent::BlockTrialCount,
            i32::try_from(self.trials).unwrap_or(i32::MAX),
        );
        ctx.report(
            ReportEvent::BlockNumber,
            i32::try_from(ctx.session.block_id).unwrap_or(i32::MAX),
        );
    }

    fn summarize<S, const RQ: usize, const TQ: usize>(
        &self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        trial: Trial,
        response: Response,
    ) where
        S: SerialSink + Clone,
    {
        let session_start = ctx.session.started_epoch_ms.unwrap_or(0);
        let relative = |epoch_ms: u64| {
            u32::try_from(epoch_ms.saturating_sub(session_start)).unwrap_or(u32::MAX)
        };
        let (event, outcome) = match response {
            Response { licked: false, .. } => (TrialEvent::Missed, TrialOutcome::NoResponse),
            Response { rewarded: true, .. } => (TrialEvent::Completed, TrialOutcome::Rewarded),
            Response { rewarded: false, .. } => {
                (TrialEvent::Completed, TrialOutcome::Unrewarded)
            }
        };
        ctx.report_trial(TrialSummary {
            event,
            port1_prob: self.probabilities[0],
            port2_prob: self.probabilities[1],
            chosen_port: trial.port,
            outcome,
            trial_id: self.trials,
            block_id: ctx.session.block_id,
            unstructured_prob: self.config.unstructured_percent,
            session_start_epoch_ms: session_start,
            block_start_rel_ms: relative(self.block_started_epoch_ms),
            trial_start_rel_ms: relative(trial.started_epoch_ms),
            trial_end_rel_ms: relative(ctx.epoch_millis()),
        });
    }
}

impl SessionBody for BlockTask {
    fn open<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        _io: &mut IO,
    ) where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        if ctx.session.started_epoch_ms.is_none() {
            ctx.session.started_epoch_ms = Some(ctx.epoch_millis());
        }
        self.phase = Phase::NewBlock;
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
            Phase::NewBlock => {
                self.start_block(ctx);
                self.phase = Phase::Top;
            }
            Phase::Top => {
                let started = ctx.session.started_epoch_ms.unwrap_or(0);
                if ctx.epoch_millis().saturating_sub(started) >= self.config.session_limit_ms {
                    ctx.request_stop();
                }
                if ctx.stop_requested() {
                    self.report_block(ctx);
                    report_summary(ctx, self.rewards);
                    return BodyStep::Stopped;
                }
                if nosepoke_latched(io) {
                    let port = if io.inputs().is_on(InputLine::Nosepoke1) { 1 } else { 2 };
                    let trial = Trial {
                        port,
                        percent: self.probabilities[usize::from(port - 1)],
                        started_epoch_ms: ctx.epoch_millis(),
                    };
                    let when = ctx.elapsed_ms();
                    report_nosepokes(ctx, io, when);
                    ctx.report(ReportEvent::RewardProbability, i32::from(trial.percent));
                    ctx.tone_on(io);
                    self.phase = Phase::Cue {
                        trial,
                        timer: Timer::millis(500),
                    };
                }
            }
            Phase::Cue { trial, mut timer } => {
                self.phase = if timer.expired(now) {
                    ctx.tone_off(io);
                    Phase::Window {
                        trial,
                        timer: Timer::millis(LICK_WINDOW_MS),
                    }
                } else {
                    Phase::Cue { trial, timer }
                };
            }
            Phase::Window { trial, mut timer } => {
                if ctx.stop_requested() {
                    self.phase = Phase::Resolve {
                        trial,
                        response: Response {
                            licked: false,
                            rewarded: false,
                        },
                    };
                } else if take_lick(io) {
                    self.trials += 1;
                    let rewarded = ctx.rng().gen_range(0..100) < trial.percent;
                    if rewarded {
                        ctx.give_reward(io, 1);
                        self.rewards += 1;
                    } else {
                        ctx.report(ReportEvent::UnrewardedLick, 0);
                    }
                    self.phase = Phase::Resolve {
                        trial,
                        response: Response {
                            licked: true,
                            rewarded,
                        },
                    };
                } else if timer.closed(now) {
                    self.phase = Phase::Resolve {
                        trial,
                        response: Response {
                            licked: false,
                            rewarded: false,
                        },
                    };
                } else {
                    self.phase = Phase::Window { trial, timer };
                }
            }
            Phase::Resolve { trial, response } => {
                if !response.licked {
                    ctx.report(ReportEvent::MissedLick, 0);
                }
                if !response.rewarded {
                    ctx.report(ReportEvent::NoReward, 1);
                }
                self.summarize(ctx, trial, response);

                let switch = self.trials >= self.config.min_block_trials
                    && ctx.rng().gen_range(0..100) < self.config.switch_percent;
                if switch {
                    self.report_block(ctx);
                    self.phase = Phase::NewBlock;
                } else {
                    self.phase = Phase::Top;
                }
            }
        }
        BodyStep::Continue
    }
}
