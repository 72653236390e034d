//! Cooperative driver around [`SchedulerContext`].
//!
//! The runner owns a small stack of machine frames. The bottom frame is the
//! host machine named by `current_state`; start/end slots and utility alarms
//! push frames on top of it. One tick polls due alarms, advances a running
//! reward, steps the top frame unless a reward is in progress, and finishes
//! with housekeeping.

use heapless::Vec;

use crate::alarms::MAX_ALARMS;
use crate::analog::MAX_ANALOG_CHANNELS;
use crate::clock::MonotonicClock;
use crate::command::{self, Command, ParseError};
use crate::config::BoxConfig;
use crate::digital::InputEdge;
use crate::hardware::BoxIo;
use crate::machines::lights::apply_house_lights;
use crate::machines::{Machine, MachineRegistry, StateMachine, TransitionRequest};
use crate::protocol::StateId;
use crate::sampler::SamplerEvent;
use crate::telemetry::{ChannelListLine, Diagnostic, ReportEvent, SerialPort, SerialSink, emit};

use super::{Dispatch, SchedulerContext, dispatch_alarm};
use crate::queue::{REPORT_QUEUE_CAPACITY, TRIAL_QUEUE_CAPACITY};

/// Injected machines that may run on top of the host machine at once.
pub const MAX_INJECTION_DEPTH: usize = 2;
const FRAME_CAPACITY: usize = MAX_INJECTION_DEPTH + 1;

/// Something that happened outside the scheduler task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BoxEvent {
    Input(InputEdge),
    Sampler(SamplerEvent),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum FrameKind {
    Host,
    Slot,
    Utility,
}

#[derive(Clone, Debug)]
struct Frame {
    state: StateId,
    /// Machine to make current again when this frame returns.
    resume: StateId,
    kind: FrameKind,
    machine: Machine,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Booting,
    AwaitingSync,
    Running,
}

pub struct BehaviorBox<
    S,
    const RQ: usize = REPORT_QUEUE_CAPACITY,
    const TQ: usize = TRIAL_QUEUE_CAPACITY,
> {
    ctx: SchedulerContext<S, RQ, TQ>,
    registry: MachineRegistry,
    frames: Vec<Frame, FRAME_CAPACITY>,
    analog_codes: Vec<i32, MAX_ANALOG_CHANNELS>,
    phase: Phase,
}

impl<S, const RQ: usize, const TQ: usize> BehaviorBox<S, RQ, TQ>
where
    S: SerialSink + Clone,
{
    #[must_use]
    pub fn new(config: BoxConfig, sink: S, seed: u64) -> Self {
        Self {
            ctx: SchedulerContext::new(config, sink, seed),
            registry: MachineRegistry::standard(),
            frames: Vec::new(),
            analog_codes: Vec::new(),
            phase: Phase::Booting,
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: MachineRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub const fn context(&self) -> &SchedulerContext<S, RQ, TQ> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut SchedulerContext<S, RQ, TQ> {
        &mut self.ctx
    }

    #[must_use]
    pub const fn current_state(&self) -> StateId {
        self.ctx.registers.current_state
    }

    /// Machines on the frame stack, host included.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    /// Announces the boot machine and waits for the first `T` command.
    /// Analog channel codes are listed once the clock is known.
    pub fn start<IO: BoxIo + ?Sized>(&mut self, io: &mut IO, analog_codes: &[i32]) {
        self.analog_codes.clear();
        for code in analog_codes.iter().take(MAX_ANALOG_CHANNELS) {
            let _ = self.analog_codes.push(*code);
        }
        self.ctx
            .diagnose(&Diagnostic::StartingMachine(self.ctx.registers.current_state));
        if self.ctx.wall.is_synced() {
            self.finish_setup(io);
        } else {
            self.ctx.diagnose(&Diagnostic::WaitingForTimeSync);
            self.phase = Phase::AwaitingSync;
        }
    }

    fn finish_setup<IO: BoxIo + ?Sized>(&mut self, io: &mut IO) {
        if !self.analog_codes.is_empty() {
            emit(
                self.ctx.sink(),
                SerialPort::Analog,
                &ChannelListLine(&self.analog_codes),
            );
        }

        let seconds = self.ctx.wall.civil(self.ctx.now()).seconds_of_day();
        if let Some(state) = self
            .ctx
            .alarms
            .house_lights()
            .initial_state(u64::from(seconds))
        {
            self.ctx.diagnose(&Diagnostic::InitialHouseLights(state));
            apply_house_lights(&mut self.ctx, io, state == StateId::HouseLightsOn);
            self.ctx.mark_lights_applied();
        }
        self.phase = Phase::Running;
    }

    /// Applies one inbound command line. Malformed lines are returned as
    /// errors and change nothing.
    pub fn handle_line<'a, IO: BoxIo + ?Sized>(
        &mut self,
        io: &mut IO,
        line: &'a str,
    ) -> Result<Command, ParseError<'a>> {
        let command = command::parse(line)?;
        match command {
            Command::SetTime(unix_seconds) => {
                self.ctx.sync_clock(unix_seconds);
                if self.phase == Phase::AwaitingSync {
                    self.ctx.diagnose(&Diagnostic::TimeSynced);
                    self.finish_setup(io);
                }
            }
            Command::Alarm => {}
            Command::Globals => self.ctx.write_globals(),
            Command::SessionParams(params) => {
                // out of range values were already diagnosed
                let _ = self.ctx.restore_session(params);
            }
        }
        Ok(command)
    }

    /// Turns an edge or sampler result into report records.
    pub fn ingest<IO: BoxIo + ?Sized>(&mut self, io: &mut IO, event: BoxEvent) {
        match event {
            BoxEvent::Input(edge) => {
                if edge.is_reported() {
                    let code = self.ctx.config.input_code(edge.line);
                    self.ctx
                        .report_at(ReportEvent::Custom(code), i32::from(edge.active), edge.when_ms);
                }
            }
            BoxEvent::Sampler(SamplerEvent::TriggerFired {
                code,
                value,
                when_ms,
            }) => self.ctx.report_at(ReportEvent::Custom(code), value, when_ms),
            BoxEvent::Sampler(SamplerEvent::GpioEcho {
                code,
                level,
                when_ms,
            }) => match self.ctx.config.output_for_code(code) {
                Some(line) => {
                    self.ctx.set_output(io, line, level);
                }
                None => self
                    .ctx
                    .report_at(ReportEvent::Custom(code), i32::from(level), when_ms),
            },
            BoxEvent::Sampler(SamplerEvent::SavingStarted { who, when_ms }) => {
                self.ctx.report_at(ReportEvent::SavingStarted, who, when_ms);
            }
            BoxEvent::Sampler(SamplerEvent::SavingStopped { who, when_ms }) => {
                self.ctx.report_at(ReportEvent::SavingStopped, who, when_ms);
            }
        }
    }

    /// One scheduler iteration.
    pub fn tick<C, IO>(&mut self, clock: &C, io: &mut IO)
    where
        C: MonotonicClock + ?Sized,
        IO: BoxIo + ?Sized,
    {
        self.ctx.set_now(clock.now());
        if self.phase == Phase::Running {
            self.ensure_host();
            // injected machines run to completion before alarms are serviced
            if self.frames.len() <= 1 {
                self.poll_alarms();
            }
            if !self.ctx.service_reward(io) {
                self.step_top(io);
            }
        }
        self.ctx.housekeeping(clock);
    }

    fn ensure_host(&mut self) {
        if self.frames.is_empty() {
            let state = self.ctx.registers.current_state;
            let _ = self.frames.push(Frame {
                state,
                resume: state,
                kind: FrameKind::Host,
                machine: self.registry.instantiate(state),
            });
        }
    }

    fn poll_alarms(&mut self) {
        if !self.ctx.wall.is_synced() {
            return;
        }
        let unix = self.ctx.unix_now();
        for _ in 0..MAX_ALARMS {
            let resume = self.ctx.registers.current_state;
            let Some(alarm) = self.ctx.alarms.poll_due(unix) else {
                break;
            };
            if let Dispatch::RunUtility(state) = dispatch_alarm(&mut self.ctx, &alarm) {
                self.inject(state, resume, FrameKind::Utility);
            }
        }
    }

    /// Pushes a frame for `state`, which `begin_injection` already made
    /// current. No-op machines and a full stack restore `resume` at once.
    fn inject(&mut self, state: StateId, resume: StateId, kind: FrameKind) {
        if state.is_no_op() {
            self.ctx.finish_injection(state, resume);
            return;
        }
        let frame = Frame {
            state,
            resume,
            kind,
            machine: self.registry.instantiate(state),
        };
        if self.frames.push(frame).is_err() {
            self.ctx.diagnose(&Diagnostic::InjectionDepth(state));
            self.ctx.finish_injection(state, resume);
        }
    }

    fn step_top<IO: BoxIo + ?Sized>(&mut self, io: &mut IO) {
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        match frame.machine.step(&mut self.ctx, io) {
            TransitionRequest::Continue => {}
            TransitionRequest::Inject(slot) => {
                let resume = self.ctx.registers.current_state;
                let state = self.ctx.take_slot(slot);
                self.ctx.begin_injection(state);
                self.inject(state, resume, FrameKind::Slot);
            }
            TransitionRequest::Finished => self.pop_frame(),
        }
    }

    fn pop_frame(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        match frame.kind {
            // the next tick starts whatever the host committed as current
            FrameKind::Host => {}
            FrameKind::Slot => self.ctx.finish_injection(frame.state, frame.resume),
            FrameKind::Utility => {
                self.ctx.finish_injection(frame.state, frame.resume);
                let interrupted_host = self
                    .frames
                    .last()
                    .is_some_and(|below| below.kind == FrameKind::Host);
                if interrupted_host {
                    self.ctx.rearm_after_utility();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::{AlarmKind, AlarmTime};
    use crate::clock::Instant;
    use crate::digital::InputLine;
    use crate::hardware::SimulatedIo;
    use crate::machines::testing::{Lines, StillClock};
    use crate::scheduler::Slot;
    use core::cell::Cell;

    struct StepClock(Cell<Instant>);

    impl MonotonicClock for StepClock {
        fn now(&self) -> Instant {
            self.0.get()
        }
    }

    // 2023-11-14 22:13:20 UTC
    const NIGHT: u64 = 1_700_000_000;

    fn running(sink: &Lines) -> (BehaviorBox<&Lines, 256, 64>, SimulatedIo) {
        let mut runner = BehaviorBox::new(BoxConfig::default(), sink, 1);
        let mut io = SimulatedIo::new();
        runner.start(&mut io, &[18]);
        (runner, io)
    }

    fn run_for(
        runner: &mut BehaviorBox<&Lines, 256, 64>,
        io: &mut SimulatedIo,
        clock: &StepClock,
        millis: u64,
    ) {
        for _ in 0..millis {
            let next = clock.0.get().as_millis() + 1;
            clock.0.set(Instant::from_millis(next));
            runner.tick(clock, io);
        }
    }

    #[test]
    fn waits_for_time_sync() {
        let sink = Lines::default();
        let (mut runner, mut io) = running(&sink);
        assert!(!runner.is_running());
        assert_eq!(sink.count_prefix("I,Waiting for time sync"), 1);

        runner.tick(&StillClock, &mut io);
        assert_eq!(runner.depth(), 0);

        runner.handle_line(&mut io, "T1700000000").ok();
        assert!(runner.is_running());
        runner.tick(&StillClock, &mut io);
        assert_eq!(runner.depth(), 1);
        assert_eq!(runner.current_state(), StateId::DoNothing);
    }

    #[test]
    fn malformed_lines_change_nothing() {
        let sink = Lines::default();
        let (mut runner, mut io) = running(&sink);
        assert!(runner.handle_line(&mut io, "Tabc").is_err());
        assert!(runner.handle_line(&mut io, "Q1").is_err());
        assert!(!runner.is_running());
        assert_eq!(runner.handle_line(&mut io, "A,anything"), Ok(Command::Alarm));
    }

    #[test]
    fn input_edges_become_reports() {
        let sink = Lines::default();
        let (mut runner, mut io) = running(&sink);
        let edge = io.activate(InputLine::Lick, 40);
        runner.ingest(&mut io, BoxEvent::Input(edge));
        let edge = io.activate(InputLine::Nosepoke1, 41);
        runner.ingest(&mut io, BoxEvent::Input(edge));
        runner.ingest(
            &mut io,
            BoxEvent::Sampler(SamplerEvent::SavingStarted { who: 18, when_ms: 42 }),
        );
        runner.tick(&StillClock, &mut io);

        // lick edges are not reported, only their effect on a body is
        assert_eq!(sink.count_prefix("25,"), 0);
        assert_eq!(sink.count_prefix("21,1,15,0,41,"), 1);
        assert_eq!(sink.count_prefix("99,18,15,0,42,"), 1);
    }

    #[test]
    fn slots_run_nested_and_restore_the_host() {
        let sink = Lines::default();
        let (mut runner, mut io) = running(&sink);
        runner.handle_line(&mut io, "T1700000000").ok();
        let clock = StepClock(Cell::new(Instant::ZERO));

        {
            let ctx = runner.context_mut();
            ctx.registers.current_state = StateId::WeeklyWater;
            ctx.registers.next_state = StateId::DoNothing;
            ctx.set_slot(Slot::Start, StateId::HouseLightsOnToneWater);
        }
        run_for(&mut runner, &mut io, &clock, 3);
        assert_eq!(runner.depth(), 2);
        assert_eq!(runner.current_state(), StateId::HouseLightsOnToneWater);

        run_for(&mut runner, &mut io, &clock, 2_000);
        assert_eq!(runner.depth(), 1);
        assert_eq!(runner.current_state(), StateId::WeeklyWater);
        assert_eq!(runner.context().slot(Slot::Start), StateId::DoNothing);
    }

    #[test]
    fn alarms_wait_for_an_injected_slot_to_finish() {
        let sink = Lines::default();
        let (mut runner, mut io) = running(&sink);
        runner.handle_line(&mut io, "T1700000000").ok();
        runner
            .context_mut()
            .alarms
            .set_daily(
                AlarmTime::new(22, 13, 21),
                AlarmKind::Disable,
                None,
                StateId::DoNothing,
                StateId::DoNothing,
                StateId::DoNothing,
            )
            .ok();
        runner.context_mut().alarms.arm(NIGHT);
        let clock = StepClock(Cell::new(Instant::ZERO));

        {
            let ctx = runner.context_mut();
            ctx.registers.current_state = StateId::WeeklyWater;
            ctx.registers.next_state = StateId::DoNothing;
            ctx.set_slot(Slot::Start, StateId::HouseLightsOnToneWater);
        }
        run_for(&mut runner, &mut io, &clock, 1_100);
        assert_eq!(runner.depth(), 2);
        assert_eq!(runner.current_state(), StateId::HouseLightsOnToneWater);
        assert_eq!(runner.context().alarms.last_fired(), None);

        run_for(&mut runner, &mut io, &clock, 900);
        assert_eq!(runner.depth(), 1);
        assert_eq!(runner.context().alarms.last_fired(), Some(0));
    }

    #[test]
    fn utility_alarm_restarts_the_host() {
        let sink = Lines::default();
        let (mut runner, mut io) = running(&sink);
        runner.handle_line(&mut io, "T1700000000").ok();
        runner
            .context_mut()
            .alarms
            .set_daily(
                AlarmTime::new(22, 13, 21),
                AlarmKind::Utility,
                None,
                StateId::HouseLightsOn,
                StateId::DoNothing,
                StateId::DoNothing,
            )
            .ok();
        runner.context_mut().alarms.arm(NIGHT);
        let clock = StepClock(Cell::new(Instant::ZERO));

        run_for(&mut runner, &mut io, &clock, 1_500);
        // lights on, DoNothing ended and restarted
        assert!(!io.output_level(crate::digital::OutputLine::HouseRed));
        assert_eq!(runner.current_state(), StateId::DoNothing);
        assert_eq!(sink.events(72), 1);
        assert!(!runner.context().stop_requested());
    }
}
