//! Cooperative session scheduler.
//!
//! [`SchedulerContext`] owns every piece of state the protocol bodies and the
//! alarm dispatcher share: the current/previous/next registers, the stop
//! request, the start/end injection slots, the record queues and the water
//! intake. Bodies receive it by `&mut` on every step, so there are no globals
//! and tests can build a context around a recording sink.

use core::fmt;
use core::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::alarms::{AlarmTable, install_default_alarms};
use crate::clock::{Instant, MonotonicClock, WallClock};
use crate::command::SessionParams;
use crate::config::BoxConfig;
use crate::digital::OutputLine;
use crate::hardware::BoxIo;
use crate::protocol::{ProtocolTable, StageCounters, StateId};
use crate::queue::{
    BoundedQueue, REPORT_BACKLOG_THRESHOLD, REPORT_QUEUE_CAPACITY, TRIAL_BACKLOG_THRESHOLD,
    TRIAL_QUEUE_CAPACITY,
};
use crate::telemetry::{
    Diagnostic, GlobalParameters, QueueKind, ReportEvent, ReportRecord, SerialPort, SerialSink,
    TrialSummary, emit, emit_diagnostic,
};

pub mod dispatch;
pub mod reward;
pub mod runner;

pub use dispatch::{Dispatch, dispatch_alarm};
pub use reward::{RewardDispenser, RewardStep};
pub use runner::{BehaviorBox, BoxEvent, MAX_INJECTION_DEPTH};

/// Which injection slot a body asks the runner to execute.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Slot {
    Start,
    End,
}

/// Scheduler errors that are turned into diagnostics where they occur.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScheduleError {
    ProtocolOutOfRange(u8),
    StageOutOfRange(u8),
    InjectionStackFull(StateId),
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::ProtocolOutOfRange(protocol) => {
                write!(f, "protocol {protocol} out of range")
            }
            ScheduleError::StageOutOfRange(stage) => write!(f, "stage {stage} out of range"),
            ScheduleError::InjectionStackFull(state) => {
                write!(f, "no room to inject {state}")
            }
        }
    }
}

/// Current, previous and next machine and protocol.
///
/// `None` protocols mean "not staged yet".
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Registers {
    pub previous_state: StateId,
    pub current_state: StateId,
    pub next_state: StateId,
    pub previous_protocol: Option<u8>,
    pub current_protocol: u8,
    pub next_protocol: Option<u8>,
}

impl Registers {
    /// Registers at power-up: the non-session machine of protocol 0, stage 0.
    #[must_use]
    pub fn at_boot(table: &ProtocolTable, stages: &StageCounters) -> Self {
        Self {
            previous_state: StateId::DoNothing,
            current_state: table.non_session(0, stages.get(0)),
            next_state: StateId::DoNothing,
            previous_protocol: None,
            current_protocol: 0,
            next_protocol: None,
        }
    }
}

/// Per-session memory of the block task that outlives one body instance.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SessionMemory {
    pub started_epoch_ms: Option<u64>,
    pub block_id: u32,
}

/// Shared scheduler state.
pub struct SchedulerContext<
    S,
    const RQ: usize = REPORT_QUEUE_CAPACITY,
    const TQ: usize = TRIAL_QUEUE_CAPACITY,
> {
    pub config: BoxConfig,
    pub registers: Registers,
    pub stages: StageCounters,
    pub table: ProtocolTable,
    pub wall: WallClock,
    pub alarms: AlarmTable,
    pub session: SessionMemory,
    stop: bool,
    start_slot: StateId,
    end_slot: StateId,
    reports: BoundedQueue<ReportRecord, RQ, S>,
    trials: BoundedQueue<TrialSummary, TQ, S>,
    sink: S,
    daily_intake: u32,
    weekly_intake: u32,
    reward: RewardDispenser,
    rng: ChaCha8Rng,
    now: Instant,
    machine_started: Instant,
    heartbeat_at: u64,
    lights_applied: bool,
    params_restored: bool,
}

impl<S, const RQ: usize, const TQ: usize> SchedulerContext<S, RQ, TQ>
where
    S: SerialSink + Clone,
{
    #[must_use]
    pub fn new(config: BoxConfig, sink: S, seed: u64) -> Self {
        let table = ProtocolTable::standard();
        let stages = StageCounters::new();
        let mut reports = BoundedQueue::new(QueueKind::Report);
        reports.set_sink(sink.clone());
        let mut trials = BoundedQueue::new(QueueKind::TrialSummary);
        trials.set_sink(sink.clone());

        Self {
            config,
            registers: Registers::at_boot(&table, &stages),
            stages,
            table,
            wall: WallClock::new(),
            alarms: AlarmTable::new(),
            session: SessionMemory::default(),
            stop: false,
            start_slot: StateId::DoNothing,
            end_slot: StateId::DoNothing,
            reports,
            trials,
            sink,
            daily_intake: 0,
            weekly_intake: 0,
            reward: RewardDispenser::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            now: Instant::ZERO,
            machine_started: Instant::ZERO,
            heartbeat_at: 0,
            lights_applied: false,
            params_restored: false,
        }
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn diagnose(&self, diagnostic: &Diagnostic) {
        emit_diagnostic(&self.sink, diagnostic);
    }

    /// Writes a line straight to the primary port, bypassing the queues.
    pub fn write_line<D: fmt::Display + ?Sized>(&self, line: &D) {
        emit(&self.sink, SerialPort::Primary, line);
    }

    // ---- time ----

    #[must_use]
    pub const fn now(&self) -> Instant {
        self.now
    }

    pub fn set_now(&mut self, now: Instant) {
        self.now = now;
    }

    /// Milliseconds since the running machine was initialized.
    #[must_use]
    pub fn elapsed_ms(&self) -> u32 {
        self.now.millis_since(self.machine_started)
    }

    #[must_use]
    pub const fn machine_started(&self) -> Instant {
        self.machine_started
    }

    #[must_use]
    pub fn unix_now(&self) -> u64 {
        self.wall.unix_seconds(self.now)
    }

    #[must_use]
    pub fn epoch_millis(&self) -> u64 {
        self.wall.epoch_millis(self.now)
    }

    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    // ---- stop flag and slots ----

    #[must_use]
    pub const fn stop_requested(&self) -> bool {
        self.stop
    }

    pub fn request_stop(&mut self) {
        self.stop = true;
    }

    #[must_use]
    pub const fn slot(&self, slot: Slot) -> StateId {
        match slot {
            Slot::Start => self.start_slot,
            Slot::End => self.end_slot,
        }
    }

    pub fn set_slot(&mut self, slot: Slot, state: StateId) {
        match slot {
            Slot::Start => self.start_slot = state,
            Slot::End => self.end_slot = state,
        }
    }

    /// Returns the slot's machine and resets the slot to the no-op, so each
    /// injected machine runs at most once per transition.
    pub fn take_slot(&mut self, slot: Slot) -> StateId {
        let state = self.slot(slot);
        self.set_slot(slot, StateId::DoNothing);
        state
    }

    // ---- intake ----

    #[must_use]
    pub const fn daily_intake(&self) -> u32 {
        self.daily_intake
    }

    #[must_use]
    pub const fn weekly_intake(&self) -> u32 {
        self.weekly_intake
    }

    pub fn set_intake(&mut self, daily: u32, weekly: u32) {
        self.daily_intake = daily;
        self.weekly_intake = weekly;
    }

    pub fn reset_daily_intake(&mut self) {
        self.daily_intake = 0;
    }

    pub fn reset_weekly_intake(&mut self) {
        self.weekly_intake = 0;
    }

    #[must_use]
    pub fn current_stage(&self) -> u8 {
        self.stages.get(self.registers.current_protocol)
    }

    #[must_use]
    pub const fn lights_applied(&self) -> bool {
        self.lights_applied
    }

    pub fn mark_lights_applied(&mut self) {
        self.lights_applied = true;
    }

    // ---- records ----

    /// Queues a report record stamped with the running machine's elapsed time.
    pub fn report(&mut self, event: ReportEvent, value: i32) {
        self.report_at(event, value, self.elapsed_ms());
    }

    /// Queues a report record with an explicit time column. A full queue has
    /// already emitted its diagnostic, so the record is simply dropped.
    pub fn report_at(&mut self, event: ReportEvent, value: i32, elapsed_ms: u32) {
        let record = ReportRecord {
            event,
            value,
            state: self.registers.current_state,
            protocol: self.registers.current_protocol,
            elapsed_ms,
            wall_clock: self.unix_now(),
            daily_intake: self.daily_intake,
            weekly_intake: self.weekly_intake,
        };
        let _ = self.reports.enqueue(record);
    }

    pub fn report_trial(&mut self, summary: TrialSummary) {
        let _ = self.trials.enqueue(summary);
    }

    #[must_use]
    pub fn pending_reports(&self) -> usize {
        self.reports.count()
    }

    #[must_use]
    pub fn pending_trials(&self) -> usize {
        self.trials.count()
    }

    #[must_use]
    pub fn report_overflows(&self) -> u32 {
        self.reports.overflow_count()
    }

    // ---- outputs ----

    /// Drives `line` into logical state `on`, then reports the read-back
    /// state. A read-back that disagrees is reported as is.
    pub fn set_output<IO: BoxIo + ?Sized>(&mut self, io: &mut IO, line: OutputLine, on: bool) -> bool {
        io.write_output(line, self.config.drive_level(line, on));
        let actual = self.config.logical_level(line, io.read_output(line));
        if actual != on {
            self.diagnose(&Diagnostic::OutputMismatch {
                line,
                on,
                now: self.unix_now(),
            });
        }
        let code = self.config.output_code(line);
        self.report(ReportEvent::Custom(code), i32::from(actual));
        actual
    }

    pub fn output_on<IO: BoxIo + ?Sized>(&mut self, io: &mut IO, line: OutputLine) {
        self.set_output(io, line, true);
    }

    pub fn output_off<IO: BoxIo + ?Sized>(&mut self, io: &mut IO, line: OutputLine) {
        self.set_output(io, line, false);
    }

    pub fn set_outputs<IO: BoxIo + ?Sized>(&mut self, io: &mut IO, lines: &[OutputLine], on: bool) {
        for line in lines {
            self.set_output(io, *line, on);
        }
    }

    pub fn tone_on<IO: BoxIo + ?Sized>(&mut self, io: &mut IO) {
        io.set_tone(self.config.tone_duty_percent);
        self.report(ReportEvent::Custom(self.config.tone_code), 1);
    }

    pub fn tone_off<IO: BoxIo + ?Sized>(&mut self, io: &mut IO) {
        io.set_tone(0);
        self.report(ReportEvent::Custom(self.config.tone_code), 0);
    }

    // ---- lifecycle ----

    /// Clears the stop request and every latched input, restarts the machine
    /// clock and reports 61.
    pub fn initialize_machine<IO: BoxIo + ?Sized>(&mut self, io: &mut IO) {
        self.stop = false;
        io.inputs().clear_all();
        io.clear_analog_triggers();
        self.machine_started = self.now;
        self.report(ReportEvent::MachineInitialized, 1);
    }

    /// Reports 62 and commits the staged next machine.
    pub fn end_current_machine(&mut self) {
        self.report(ReportEvent::MachineEnded, 1);
        self.registers.current_state = self.registers.next_state;
    }

    /// Reports 72 and commits the staged next protocol.
    pub fn end_current_protocol(&mut self) {
        self.report(ReportEvent::ProtocolEnded, 1);
        if let Some(protocol) = self.registers.next_protocol {
            self.registers.current_protocol = protocol;
        }
    }

    /// Moves the current protocol to its next stage when that stage exists
    /// and has a session machine. With `change`, also stages a transition to
    /// the session machine of the resulting stage.
    pub fn advance_stage(&mut self, change: bool) {
        let protocol = self.registers.current_protocol;
        let stage = self.stages.get(protocol);
        if let Some(next) = stage.checked_add(1)
            && usize::from(next) < self.table.stage_count()
            && !self.table.session(protocol, next).is_no_op()
        {
            self.stages.set(protocol, next);
        }

        if change {
            self.registers.previous_state = self.registers.current_state;
            self.registers.previous_protocol = Some(protocol);
            self.registers.next_protocol = Some(protocol);
            self.registers.next_state = self.table.session(protocol, self.stages.get(protocol));
        }
    }

    /// Stages the non-session machine of the protocol owning the alarm after
    /// the last one that fired.
    pub fn stage_upcoming_non_session(&mut self) {
        self.registers.previous_state = self.registers.current_state;
        self.registers.previous_protocol = Some(self.registers.current_protocol);
        let protocol = self
            .alarms
            .upcoming()
            .and_then(|alarm| alarm.protocol)
            .unwrap_or(self.registers.current_protocol);
        self.registers.next_protocol = Some(protocol);
        self.registers.next_state = self.table.non_session(protocol, self.stages.get(protocol));
    }

    /// Stages the non-session machine of the current protocol and stage.
    pub fn stage_current_non_session(&mut self) {
        self.registers.previous_state = self.registers.current_state;
        let protocol = self.registers.current_protocol;
        self.registers.next_protocol = Some(protocol);
        self.registers.next_state = self.table.non_session(protocol, self.stages.get(protocol));
    }

    /// Makes `state` current for the duration of an injected run.
    pub fn begin_injection(&mut self, state: StateId) {
        self.registers.previous_state = self.registers.current_state;
        self.registers.current_state = state;
    }

    /// Restores `resume` as current after an injected run of `state`.
    pub fn finish_injection(&mut self, state: StateId, resume: StateId) {
        self.registers.current_state = resume;
        self.registers.previous_state = state;
    }

    /// Restarts the interrupted machine after a utility alarm. The utility
    /// consumed the stop flag when it initialized, so it is raised again.
    pub fn rearm_after_utility(&mut self) {
        self.stop = true;
        self.registers.next_state = self.registers.current_state;
        self.registers.next_protocol = Some(self.registers.current_protocol);
    }

    // ---- reward ----

    /// Reports 51 and opens the valve for the first of `pulses` pulses.
    /// Bodies are not stepped again until the train completes with 52.
    pub fn give_reward<IO: BoxIo + ?Sized>(&mut self, io: &mut IO, pulses: u8) {
        self.report(ReportEvent::RewardStarted, i32::from(pulses));
        let open = Duration::from_millis(u64::from(self.config.reward_pulse_ms));
        if self.reward.start(pulses, self.now, open) {
            self.output_on(io, OutputLine::Water);
        } else {
            self.report(ReportEvent::RewardFinished, 0);
        }
    }

    /// Advances the pulse train. Returns `true` while a reward is in progress.
    pub fn service_reward<IO: BoxIo + ?Sized>(&mut self, io: &mut IO) -> bool {
        let open = Duration::from_millis(u64::from(self.config.reward_pulse_ms));
        let gap = Duration::from_millis(u64::from(self.config.reward_gap_ms));
        loop {
            match self.reward.poll(self.now, open, gap) {
                RewardStep::Idle => return false,
                RewardStep::Busy => return true,
                RewardStep::CloseValve => self.output_off(io, OutputLine::Water),
                RewardStep::PulseDelivered { more } => {
                    self.daily_intake = self.daily_intake.saturating_add(1);
                    self.weekly_intake = self.weekly_intake.saturating_add(1);
                    if more {
                        self.output_on(io, OutputLine::Water);
                    } else {
                        self.report(ReportEvent::RewardFinished, 0);
                        return false;
                    }
                }
            }
        }
    }

    #[must_use]
    pub const fn reward_busy(&self) -> bool {
        self.reward.is_busy()
    }

    // ---- housekeeping ----

    /// Hourly heartbeat, backlog health checks, then a time-boxed drain of
    /// report records followed by trial summaries.
    pub fn housekeeping<C: MonotonicClock + ?Sized>(&mut self, clock: &C) {
        let unix = self.unix_now();
        if unix.saturating_sub(self.heartbeat_at) >= self.config.heartbeat_secs {
            self.report(ReportEvent::Heartbeat, 97);
            self.heartbeat_at = unix;
        }

        if self.reports.count() > REPORT_BACKLOG_THRESHOLD {
            self.diagnose(&Diagnostic::QueueBacklog {
                queue: QueueKind::Report,
                threshold: REPORT_BACKLOG_THRESHOLD,
            });
        }
        if self.trials.count() > TRIAL_BACKLOG_THRESHOLD {
            self.diagnose(&Diagnostic::QueueBacklog {
                queue: QueueKind::TrialSummary,
                threshold: TRIAL_BACKLOG_THRESHOLD,
            });
        }

        let budget = Duration::from_millis(u64::from(self.config.housekeeping_budget_ms));
        let started = clock.now();
        let spent = || clock.now().saturating_duration_since(started);

        while !self.reports.is_empty() && spent() < budget {
            if let Ok(record) = self.reports.dequeue() {
                emit(&self.sink, SerialPort::Primary, &record);
            }
        }
        while !self.trials.is_empty() && spent() < budget {
            if let Ok(summary) = self.trials.dequeue() {
                emit(&self.sink, SerialPort::Primary, &summary);
            }
        }

        if spent() > budget {
            self.diagnose(&Diagnostic::HousekeepingOverrun);
        }
    }

    /// Writes the `G,` persistence line.
    pub fn write_globals(&self) {
        self.write_line(&GlobalParameters {
            protocol: self.registers.current_protocol,
            stage: self.current_stage(),
            daily_intake: self.daily_intake,
            weekly_intake: self.weekly_intake,
        });
    }

    /// Emits the array-bound diagnostic when `index` does not fit `len`.
    /// Returns `true` when the index is usable.
    pub fn check_array_size(&self, name: &'static str, len: usize, index: usize) -> bool {
        if index < len {
            return true;
        }
        self.diagnose(&Diagnostic::IndexOutOfBound {
            name,
            len,
            index,
            state: self.registers.current_state,
            now: self.unix_now(),
        });
        false
    }

    // ---- host commands ----

    /// Anchors the wall clock, echoes it, resets the heartbeat and arms the
    /// alarms against the new time.
    pub fn sync_clock(&mut self, unix_seconds: u64) {
        self.diagnose(&Diagnostic::SettingTime);
        self.wall.sync(unix_seconds, self.now);
        self.diagnose(&Diagnostic::ClockEcho(self.wall.civil(self.now)));
        self.heartbeat_at = unix_seconds;
        self.alarms.arm(unix_seconds);
    }

    /// Registers the standard alarm schedule, reporting capacity failures.
    pub fn install_default_alarms(&mut self) {
        install_default_alarms(&mut self.alarms, &self.sink);
    }

    /// Applies session parameters sent back by the host.
    pub fn restore_session(&mut self, params: SessionParams) -> Result<(), ScheduleError> {
        let protocols = self.table.protocol_count();
        if !self.check_array_size("trainingProtocol", protocols, usize::from(params.protocol)) {
            return Err(ScheduleError::ProtocolOutOfRange(params.protocol));
        }
        if !self.check_array_size("currentStage", self.table.stage_count(), usize::from(params.stage)) {
            return Err(ScheduleError::StageOutOfRange(params.stage));
        }
        self.registers.current_protocol = params.protocol;
        self.stages.set(params.protocol, params.stage);
        self.set_intake(params.daily_intake, params.weekly_intake);
        self.params_restored = true;
        Ok(())
    }

    /// Returns and clears the "parameters restored" flag.
    pub fn take_params_restored(&mut self) -> bool {
        core::mem::take(&mut self.params_restored)
    }

    /// Forgets the block task's session start so the next session starts a
    /// fresh time limit and block count.
    pub fn reset_session(&mut self) {
        self.session = SessionMemory::default();
    }
}
