//! Behavioral protocol bodies.
//!
//! Every [`StateId`] maps to one body type implementing [`StateMachine`]. A
//! body never blocks: each call to `step` does a bounded amount of work and
//! records where it stopped in its own phase enum, so the runner can service
//! alarms, rewards and housekeeping between steps. Waits are [`Timer`]s
//! checked against the context clock.
//!
//! Bodies that open a training session are wrapped in [`Session`], which runs
//! the start slot, initializes the machine, and on a stop request ends the
//! machine, runs the end slot and ends the protocol.

use core::time::Duration;

use rand::Rng;

use crate::clock::Instant;
use crate::digital::{InputLine, OutputLine};
use crate::hardware::BoxIo;
use crate::protocol::StateId;
use crate::scheduler::{SchedulerContext, Slot};
use crate::telemetry::{ReportEvent, SerialSink};

pub mod block;
pub mod lick;
pub mod lights;
pub mod nosepoke;
pub mod session_params;
pub mod water;

pub use block::{BlockTask, BlockTaskConfig};
pub use lick::{LickTest, LickTrain};
pub use lights::{BlinkLightsToneWater, DoNothing, HouseLights, LightsOnToneWater};
pub use nosepoke::{NosepokeNonSession, NosepokeReward, NosepokeRewardConfig};
pub use session_params::ReadSessionParams;
pub use water::{WaterQuota, WaterSession};

/// Length of the response window after a cue.
pub const LICK_WINDOW_MS: u64 = 5_000;
/// Report code of the short cue sound played on a nosepoke.
pub const SOUND_CUE_CODE: i32 = 122;

/// What a body asks of the runner after one step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransitionRequest {
    Continue,
    /// Run the machine in this slot, then step this body again.
    Inject(Slot),
    /// The body returned; the runner starts whatever is current.
    Finished,
}

/// A protocol body driven one step per scheduler tick.
pub trait StateMachine {
    fn step<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        io: &mut IO,
    ) -> TransitionRequest
    where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized;
}

/// Result of one step of a [`SessionBody`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BodyStep {
    Continue,
    /// The body saw the stop request and wrote its closing reports.
    Stopped,
    /// The body committed its own transition and returns without the end
    /// slot or a protocol change.
    Ended,
}

/// Loop part of a session body, run between the start and end slots.
pub trait SessionBody {
    /// Runs once, right after the machine was initialized.
    fn open<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        io: &mut IO,
    ) where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized;

    fn run<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        io: &mut IO,
    ) -> BodyStep
    where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SessionPhase {
    Starting,
    Opening,
    Running,
    Closing,
    Done,
}

/// Start slot, initialize, body loop, then end machine, end slot and end
/// protocol.
#[derive(Clone, Debug)]
pub struct Session<B> {
    body: B,
    phase: SessionPhase,
}

impl<B> Session<B> {
    pub const fn new(body: B) -> Self {
        Self {
            body,
            phase: SessionPhase::Starting,
        }
    }

    pub const fn body(&self) -> &B {
        &self.body
    }
}

impl<B: SessionBody> StateMachine for Session<B> {
    fn step<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        io: &mut IO,
    ) -> TransitionRequest
    where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        match self.phase {
            SessionPhase::Starting => {
                self.phase = SessionPhase::Opening;
                TransitionRequest::Inject(Slot::Start)
            }
            SessionPhase::Opening => {
                ctx.initialize_machine(io);
                self.body.open(ctx, io);
                self.phase = SessionPhase::Running;
                TransitionRequest::Continue
            }
            SessionPhase::Running => match self.body.run(ctx, io) {
                BodyStep::Continue => TransitionRequest::Continue,
                BodyStep::Stopped => {
                    ctx.end_current_machine();
                    self.phase = SessionPhase::Closing;
                    TransitionRequest::Inject(Slot::End)
                }
                BodyStep::Ended => {
                    self.phase = SessionPhase::Done;
                    TransitionRequest::Finished
                }
            },
            SessionPhase::Closing => {
                ctx.end_current_protocol();
                self.phase = SessionPhase::Done;
                TransitionRequest::Finished
            }
            SessionPhase::Done => TransitionRequest::Finished,
        }
    }
}

/// Wait that starts counting the first time it is polled.
///
/// Starting lazily lets a body schedule a wait right after a reward: the
/// runner does not step the body until the reward finishes, so the wait
/// begins when the valve has closed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Timer {
    duration: Duration,
    until: Option<Instant>,
}

impl Timer {
    #[must_use]
    pub const fn millis(ms: u64) -> Self {
        Self {
            duration: Duration::from_millis(ms),
            until: None,
        }
    }

    /// `true` once `duration` has fully elapsed.
    pub fn expired(&mut self, now: Instant) -> bool {
        now >= self.deadline(now)
    }

    /// `true` once the window is strictly past its duration, matching a
    /// `while elapsed <= duration` response window.
    pub fn closed(&mut self, now: Instant) -> bool {
        now > self.deadline(now)
    }

    fn deadline(&mut self, now: Instant) -> Instant {
        *self.until.get_or_insert(now + self.duration)
    }
}

/// Uniform draw in `[low, high)` milliseconds.
pub fn random_delay<S, const RQ: usize, const TQ: usize>(
    ctx: &mut SchedulerContext<S, RQ, TQ>,
    low: u64,
    high: u64,
) -> Timer
where
    S: SerialSink + Clone,
{
    Timer::millis(ctx.rng().gen_range(low..high))
}

/// Whether either nosepoke latch is set.
pub fn nosepoke_latched<IO: BoxIo + ?Sized>(io: &IO) -> bool {
    io.inputs().is_on(InputLine::Nosepoke1) || io.inputs().is_on(InputLine::Nosepoke2)
}

pub fn clear_nosepokes<IO: BoxIo + ?Sized>(io: &IO) {
    io.inputs().clear(InputLine::Nosepoke1);
    io.inputs().clear(InputLine::Nosepoke2);
}

/// Takes the lick latch if it is set.
pub fn take_lick<IO: BoxIo + ?Sized>(io: &IO) -> bool {
    if io.inputs().is_on(InputLine::Lick) {
        io.inputs().clear(InputLine::Lick);
        true
    } else {
        false
    }
}

/// Reports 81 for every nosepoke held right now and clears both latches.
pub fn report_nosepokes<S, IO, const RQ: usize, const TQ: usize>(
    ctx: &mut SchedulerContext<S, RQ, TQ>,
    io: &IO,
    when_ms: u32,
) where
    S: SerialSink + Clone,
    IO: BoxIo + ?Sized,
{
    for (port, line) in [(1, InputLine::Nosepoke1), (2, InputLine::Nosepoke2)] {
        if io.read_input(line) {
            ctx.report_at(ReportEvent::NosepokeChoice, port, when_ms);
        }
    }
    clear_nosepokes(io);
}

/// Turns both side camera lights on or off.
pub fn set_cameras<S, IO, const RQ: usize, const TQ: usize>(
    ctx: &mut SchedulerContext<S, RQ, TQ>,
    io: &mut IO,
    on: bool,
) where
    S: SerialSink + Clone,
    IO: BoxIo + ?Sized,
{
    ctx.set_outputs(io, &OutputLine::CAMERA_LIGHTS, on);
}

/// Reports the session summary (63) for `count`.
pub fn report_summary<S, const RQ: usize, const TQ: usize>(
    ctx: &mut SchedulerContext<S, RQ, TQ>,
    count: u32,
) where
    S: SerialSink + Clone,
{
    ctx.report(
        ReportEvent::SessionSummary,
        i32::try_from(count).unwrap_or(i32::MAX),
    );
}

/// Monotonic milliseconds truncated to the report time column.
#[must_use]
pub fn uptime_ms(now: Instant) -> u32 {
    u32::try_from(now.as_millis()).unwrap_or(u32::MAX)
}

/// One live body instance.
#[derive(Clone, Debug)]
pub enum Machine {
    Idle(DoNothing),
    HouseLights(HouseLights),
    LightsOnToneWater(LightsOnToneWater),
    BlinkLights(BlinkLightsToneWater),
    Water(Session<WaterSession>),
    LickTrain(Session<LickTrain>),
    LickTest(Session<LickTest>),
    NosepokeNonSession(Session<NosepokeNonSession>),
    NosepokeReward(Session<NosepokeReward>),
    Block(Session<BlockTask>),
    ReadParams(Session<ReadSessionParams>),
}

impl StateMachine for Machine {
    fn step<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        io: &mut IO,
    ) -> TransitionRequest
    where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        match self {
            Machine::Idle(body) => body.step(ctx, io),
            Machine::HouseLights(body) => body.step(ctx, io),
            Machine::LightsOnToneWater(body) => body.step(ctx, io),
            Machine::BlinkLights(body) => body.step(ctx, io),
            Machine::Water(body) => body.step(ctx, io),
            Machine::LickTrain(body) => body.step(ctx, io),
            Machine::LickTest(body) => body.step(ctx, io),
            Machine::NosepokeNonSession(body) => body.step(ctx, io),
            Machine::NosepokeReward(body) => body.step(ctx, io),
            Machine::Block(body) => body.step(ctx, io),
            Machine::ReadParams(body) => body.step(ctx, io),
        }
    }
}

/// Maps each [`StateId`] to a fresh body instance.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MachineRegistry {
    pub block_task: BlockTaskConfig,
    pub nosepoke_1sound: NosepokeRewardConfig,
    pub nosepoke_prob70: NosepokeRewardConfig,
    pub nosepoke_prob40: NosepokeRewardConfig,
    pub nosepoke_reward_non_session: NosepokeRewardConfig,
}

impl MachineRegistry {
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            block_task: BlockTaskConfig::STANDARD,
            nosepoke_1sound: NosepokeRewardConfig::ONE_SOUND,
            nosepoke_prob70: NosepokeRewardConfig::PROB70,
            nosepoke_prob40: NosepokeRewardConfig::PROB40,
            nosepoke_reward_non_session: NosepokeRewardConfig::REWARD_NON_SESSION,
        }
    }

    #[must_use]
    pub fn instantiate(&self, state: StateId) -> Machine {
        match state {
            StateId::DailyWater => Machine::Water(Session::new(WaterSession::new(WaterQuota::Daily))),
            StateId::WeeklyWater => {
                Machine::Water(Session::new(WaterSession::new(WaterQuota::Weekly)))
            }
            StateId::HouseLightsOn => Machine::HouseLights(HouseLights::new(true)),
            StateId::HouseLightsOff => Machine::HouseLights(HouseLights::new(false)),
            StateId::HouseLightsOnToneWater => Machine::LightsOnToneWater(LightsOnToneWater::new()),
            StateId::BlinkLightsToneWater => Machine::BlinkLights(BlinkLightsToneWater::new()),
            StateId::NosepokeNonSession => {
                Machine::NosepokeNonSession(Session::new(NosepokeNonSession::new()))
            }
            StateId::LickTest => Machine::LickTest(Session::new(LickTest::new())),
            StateId::LickTrain => Machine::LickTrain(Session::new(LickTrain::new())),
            StateId::NosepokeRewardNonSession => Machine::NosepokeReward(Session::new(
                NosepokeReward::new(self.nosepoke_reward_non_session),
            )),
            StateId::Nosepoke1sound => {
                Machine::NosepokeReward(Session::new(NosepokeReward::new(self.nosepoke_1sound)))
            }
            StateId::NosepokeProb70 => {
                Machine::NosepokeReward(Session::new(NosepokeReward::new(self.nosepoke_prob70)))
            }
            StateId::NosepokeProb40 => {
                Machine::NosepokeReward(Session::new(NosepokeReward::new(self.nosepoke_prob40)))
            }
            StateId::NosepokeImpure => Machine::Block(Session::new(BlockTask::new(self.block_task))),
            StateId::ReadSessionParams => {
                Machine::ReadParams(Session::new(ReadSessionParams::new()))
            }
            StateId::DoNothing => Machine::Idle(DoNothing::new()),
        }
    }
}

impl Default for MachineRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers for stepping a single body against a simulated box.

    use core::cell::RefCell;

    use crate::clock::{Instant, MonotonicClock};
    use crate::config::BoxConfig;
    use crate::hardware::SimulatedIo;
    use crate::scheduler::SchedulerContext;
    use crate::telemetry::{LineBuffer, SerialPort, SerialSink};

    use super::{StateMachine, TransitionRequest};

    #[derive(Default)]
    pub struct Lines {
        pub lines: RefCell<heapless::Vec<LineBuffer, 512>>,
    }

    impl SerialSink for Lines {
        fn write_line(&self, port: SerialPort, line: &str) {
            if port == SerialPort::Primary {
                let mut copy = LineBuffer::new();
                let _ = copy.push_str(line);
                let _ = self.lines.borrow_mut().push(copy);
            }
        }
    }

    impl Lines {
        /// Report lines whose event column equals `code`.
        pub fn events(&self, code: i32) -> usize {
            self.lines
                .borrow()
                .iter()
                .filter(|line| {
                    line.split(',')
                        .next()
                        .and_then(|field| field.parse::<i32>().ok())
                        == Some(code)
                })
                .count()
        }

        pub fn count_prefix(&self, prefix: &str) -> usize {
            self.lines
                .borrow()
                .iter()
                .filter(|line| line.starts_with(prefix))
                .count()
        }

        pub fn has(&self, text: &str) -> bool {
            self.lines.borrow().iter().any(|line| line.as_str() == text)
        }
    }

    pub struct StillClock;

    impl MonotonicClock for StillClock {
        fn now(&self) -> Instant {
            Instant::ZERO
        }
    }

    pub type TestContext<'a> = SchedulerContext<&'a Lines, 256, 64>;

    pub fn context(sink: &Lines) -> TestContext<'_> {
        SchedulerContext::new(BoxConfig::default(), sink, 11)
    }

    /// Advances time by one millisecond per step, servicing rewards the way
    /// the runner does, until `until` returns true or `limit_ms` passes.
    /// Returns the last request.
    pub fn run_until<M: StateMachine>(
        machine: &mut M,
        ctx: &mut TestContext<'_>,
        io: &mut SimulatedIo,
        limit_ms: u64,
        mut until: impl FnMut(&TestContext<'_>, &SimulatedIo, TransitionRequest) -> bool,
        mut stimulus: impl FnMut(u64, &mut SimulatedIo),
    ) -> TransitionRequest {
        let start = ctx.now().as_millis();
        let mut last = TransitionRequest::Continue;
        for ms in start..start + limit_ms {
            ctx.set_now(Instant::from_millis(ms));
            stimulus(ms, io);
            if ctx.service_reward(io) {
                continue;
            }
            last = machine.step(ctx, io);
            ctx.housekeeping(&StillClock);
            if until(ctx, io, last) {
                break;
            }
        }
        last
    }
}
