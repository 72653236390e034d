//! Telemetry records, diagnostics and the serial line protocol.
//!
//! Everything the box tells the host computer is an ASCII line. Report and
//! trial-summary records are comma separated and queued; diagnostics are
//! prefixed with `I,` or `E,` and written straight to the sink; the analog
//! port carries `A,`, `P,`, `V,` and `W,` lines.

use core::fmt::{self, Write as _};

use heapless::String;

use crate::clock::CivilTime;
use crate::digital::OutputLine;
use crate::protocol::StateId;

/// Longest line the box emits; longer output is truncated.
pub const MAX_LINE_LEN: usize = 192;

/// Fixed-capacity buffer used to format one outgoing line.
pub type LineBuffer = String<MAX_LINE_LEN>;

/// Serial port a line is destined for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SerialPort {
    /// Event records and diagnostics.
    Primary,
    /// Raw analog frames and saving-window markers.
    Analog,
}

/// Destination for outgoing lines.
///
/// Takes `&self` so a sink can be shared between the scheduler, its queues and
/// the sampler. Implementations append the line terminator.
pub trait SerialSink {
    fn write_line(&self, port: SerialPort, line: &str);
}

impl<S: SerialSink + ?Sized> SerialSink for &S {
    fn write_line(&self, port: SerialPort, line: &str) {
        (**self).write_line(port, line);
    }
}

/// Sink that discards every line.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullSink;

impl SerialSink for NullSink {
    fn write_line(&self, _: SerialPort, _: &str) {}
}

/// Formats `value` into a line buffer and hands it to `sink`.
pub fn emit<S, D>(sink: &S, port: SerialPort, value: &D)
where
    S: SerialSink + ?Sized,
    D: fmt::Display + ?Sized,
{
    let mut line = LineBuffer::new();
    // Output past MAX_LINE_LEN is dropped; the prefix is still useful.
    let _ = write!(line, "{value}");
    sink.write_line(port, line.as_str());
}

/// Emits a diagnostic on the port it belongs to.
pub fn emit_diagnostic<S: SerialSink + ?Sized>(sink: &S, diagnostic: &Diagnostic) {
    emit(sink, diagnostic.port(), diagnostic);
}

/// Event type carried in the first column of a report record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReportEvent {
    LickReported,
    RewardStarted,
    RewardFinished,
    MachineInitialized,
    MachineEnded,
    SessionSummary,
    TrainingAlarm,
    ProtocolEnded,
    NosepokeChoice,
    BlockProbability,
    NoReward,
    RewardProbability,
    CueCycleComplete,
    Heartbeat,
    SavingStopped,
    SavingStarted,
    BlockTrialCount,
    BlockNumber,
    UnrewardedLick,
    MissedLick,
    /// Hardware line events use the line's report code.
    Custom(i32),
}

impl ReportEvent {
    const LICK_REPORTED: i32 = 26;
    const REWARD_STARTED: i32 = 51;
    const REWARD_FINISHED: i32 = 52;
    const MACHINE_INITIALIZED: i32 = 61;
    const MACHINE_ENDED: i32 = 62;
    const SESSION_SUMMARY: i32 = 63;
    const TRAINING_ALARM: i32 = 71;
    const PROTOCOL_ENDED: i32 = 72;
    const NOSEPOKE_CHOICE: i32 = 81;
    const BLOCK_PROBABILITY: i32 = 83;
    const NO_REWARD: i32 = 86;
    const REWARD_PROBABILITY: i32 = 88;
    const CUE_CYCLE_COMPLETE: i32 = 89;
    const HEARTBEAT: i32 = 97;
    const SAVING_STOPPED: i32 = 98;
    const SAVING_STARTED: i32 = 99;
    const BLOCK_TRIAL_COUNT: i32 = 111;
    const BLOCK_NUMBER: i32 = 121;
    const UNREWARDED_LICK: i32 = -51;
    const MISSED_LICK: i32 = -52;

    /// Encodes the event into its wire code.
    #[must_use]
    pub const fn to_raw(self) -> i32 {
        match self {
            ReportEvent::LickReported => Self::LICK_REPORTED,
            ReportEvent::RewardStarted => Self::REWARD_STARTED,
            ReportEvent::RewardFinished => Self::REWARD_FINISHED,
            ReportEvent::MachineInitialized => Self::MACHINE_INITIALIZED,
            ReportEvent::MachineEnded => Self::MACHINE_ENDED,
            ReportEvent::SessionSummary => Self::SESSION_SUMMARY,
            ReportEvent::TrainingAlarm => Self::TRAINING_ALARM,
            ReportEvent::ProtocolEnded => Self::PROTOCOL_ENDED,
            ReportEvent::NosepokeChoice => Self::NOSEPOKE_CHOICE,
            ReportEvent::BlockProbability => Self::BLOCK_PROBABILITY,
            ReportEvent::NoReward => Self::NO_REWARD,
            ReportEvent::RewardProbability => Self::REWARD_PROBABILITY,
            ReportEvent::CueCycleComplete => Self::CUE_CYCLE_COMPLETE,
            ReportEvent::Heartbeat => Self::HEARTBEAT,
            ReportEvent::SavingStopped => Self::SAVING_STOPPED,
            ReportEvent::SavingStarted => Self::SAVING_STARTED,
            ReportEvent::BlockTrialCount => Self::BLOCK_TRIAL_COUNT,
            ReportEvent::BlockNumber => Self::BLOCK_NUMBER,
            ReportEvent::UnrewardedLick => Self::UNREWARDED_LICK,
            ReportEvent::MissedLick => Self::MISSED_LICK,
            ReportEvent::Custom(code) => code,
        }
    }

    /// Decodes a wire code, falling back to [`ReportEvent::Custom`].
    #[must_use]
    pub const fn from_raw(code: i32) -> Self {
        match code {
            Self::LICK_REPORTED => ReportEvent::LickReported,
            Self::REWARD_STARTED => ReportEvent::RewardStarted,
            Self::REWARD_FINISHED => ReportEvent::RewardFinished,
            Self::MACHINE_INITIALIZED => ReportEvent::MachineInitialized,
            Self::MACHINE_ENDED => ReportEvent::MachineEnded,
            Self::SESSION_SUMMARY => ReportEvent::SessionSummary,
            Self::TRAINING_ALARM => ReportEvent::TrainingAlarm,
            Self::PROTOCOL_ENDED => ReportEvent::ProtocolEnded,
            Self::NOSEPOKE_CHOICE => ReportEvent::NosepokeChoice,
            Self::BLOCK_PROBABILITY => ReportEvent::BlockProbability,
            Self::NO_REWARD => ReportEvent::NoReward,
            Self::REWARD_PROBABILITY => ReportEvent::RewardProbability,
            Self::CUE_CYCLE_COMPLETE => ReportEvent::CueCycleComplete,
            Self::HEARTBEAT => ReportEvent::Heartbeat,
            Self::SAVING_STOPPED => ReportEvent::SavingStopped,
            Self::SAVING_STARTED => ReportEvent::SavingStarted,
            Self::BLOCK_TRIAL_COUNT => ReportEvent::BlockTrialCount,
            Self::BLOCK_NUMBER => ReportEvent::BlockNumber,
            Self::UNREWARDED_LICK => ReportEvent::UnrewardedLick,
            Self::MISSED_LICK => ReportEvent::MissedLick,
            other => ReportEvent::Custom(other),
        }
    }
}

/// Snapshot of one event, taken when it is reported.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReportRecord {
    pub event: ReportEvent,
    pub value: i32,
    pub state: StateId,
    pub protocol: u8,
    /// Milliseconds since the running machine was initialized.
    pub elapsed_ms: u32,
    /// Wall clock in Unix seconds.
    pub wall_clock: u64,
    pub daily_intake: u32,
    pub weekly_intake: u32,
}

impl fmt::Display for ReportRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{}",
            self.event.to_raw(),
            self.value,
            self.state.as_index(),
            self.protocol,
            self.elapsed_ms,
            self.wall_clock,
            self.daily_intake,
            self.weekly_intake
        )
    }
}

/// Event code of a trial summary.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrialEvent {
    /// The animal licked inside the response window.
    Completed,
    /// The response window closed without a lick.
    Missed,
}

impl TrialEvent {
    #[must_use]
    pub const fn to_raw(self) -> i32 {
        match self {
            TrialEvent::Completed => 200,
            TrialEvent::Missed => 201,
        }
    }
}

/// Reward outcome of a trial.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrialOutcome {
    Rewarded,
    Unrewarded,
    NoResponse,
}

impl TrialOutcome {
    #[must_use]
    pub const fn to_raw(self) -> i8 {
        match self {
            TrialOutcome::Rewarded => 1,
            TrialOutcome::Unrewarded => 0,
            TrialOutcome::NoResponse => -1,
        }
    }
}

/// One line per completed or missed trial of a block task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TrialSummary {
    pub event: TrialEvent,
    pub port1_prob: u8,
    pub port2_prob: u8,
    pub chosen_port: u8,
    pub outcome: TrialOutcome,
    pub trial_id: u32,
    pub block_id: u32,
    pub unstructured_prob: u8,
    pub session_start_epoch_ms: u64,
    pub block_start_rel_ms: u32,
    pub trial_start_rel_ms: u32,
    pub trial_end_rel_ms: u32,
}

impl fmt::Display for TrialSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            self.event.to_raw(),
            self.port1_prob,
            self.port2_prob,
            self.chosen_port,
            self.outcome.to_raw(),
            self.trial_id,
            self.block_id,
            self.unstructured_prob,
            self.session_start_epoch_ms,
            self.block_start_rel_ms,
            self.trial_start_rel_ms,
            self.trial_end_rel_ms
        )
    }
}

/// Which of the two record queues a diagnostic refers to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueueKind {
    Report,
    TrialSummary,
}

impl QueueKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            QueueKind::Report => "Report queue",
            QueueKind::TrialSummary => "Trial summary queue",
        }
    }

    const fn lower_label(self) -> &'static str {
        match self {
            QueueKind::Report => "report queue",
            QueueKind::TrialSummary => "trial summary queue",
        }
    }
}

/// Every `I,` and `E,` line the box can produce.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Diagnostic {
    SettingTime,
    ClockEcho(CivilTime),
    WaitingForTimeSync,
    TimeSynced,
    StartingMachine(StateId),
    InitialHouseLights(StateId),
    QueueFull(QueueKind),
    QueueEmpty(QueueKind),
    QueueBacklog { queue: QueueKind, threshold: usize },
    HousekeepingOverrun,
    SamplerOverrun { micros: u32 },
    OutputMismatch { line: OutputLine, on: bool, now: u64 },
    AlarmTableFull,
    AlarmCapacityHint,
    TriggerTimesOutOfBound,
    TriggerCapacity { channel: &'static str },
    IndexOutOfBound {
        name: &'static str,
        len: usize,
        index: usize,
        state: StateId,
        now: u64,
    },
    InjectionDepth(StateId),
}

impl Diagnostic {
    /// Returns `true` for `E,` lines.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        !matches!(
            self,
            Diagnostic::SettingTime
                | Diagnostic::ClockEcho(_)
                | Diagnostic::WaitingForTimeSync
                | Diagnostic::TimeSynced
                | Diagnostic::StartingMachine(_)
                | Diagnostic::InitialHouseLights(_)
        )
    }

    /// Port the diagnostic is written to. Sampler overruns travel with the
    /// analog stream that caused them.
    #[must_use]
    pub const fn port(&self) -> SerialPort {
        match self {
            Diagnostic::SamplerOverrun { .. } => SerialPort::Analog,
            _ => SerialPort::Primary,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_error() { "E," } else { "I," })?;
        match self {
            Diagnostic::SettingTime => f.write_str("Setting time ..."),
            Diagnostic::ClockEcho(civil) => write!(f, "{civil}"),
            Diagnostic::WaitingForTimeSync => f.write_str(
                "Waiting for time sync message from master R-Pi (e.g. T1506298500)",
            ),
            Diagnostic::TimeSynced => f.write_str("Box time is synced with NTP. Continue ..."),
            Diagnostic::StartingMachine(state) => {
                write!(f, "The starting state machine is: {state}")
            }
            Diagnostic::InitialHouseLights(state) => {
                write!(f, "The initial house light status: {state}")
            }
            Diagnostic::QueueFull(queue) => {
                write!(f, "{} is full. Cannot write to queue.", queue.label())
            }
            Diagnostic::QueueEmpty(queue) => write!(
                f,
                "Can NOT pop item from {} because queue is empty.",
                queue.lower_label()
            ),
            Diagnostic::QueueBacklog { queue, threshold } => {
                write!(f, "{} size > {threshold}.", queue.label())
            }
            Diagnostic::HousekeepingOverrun => {
                f.write_str("Sending queue data took more than set time.")
            }
            Diagnostic::SamplerOverrun { micros } => write!(f, "Analog Error > 1ms: {micros}"),
            Diagnostic::OutputMismatch { line, on, now } => write!(
                f,
                "Different write and read DO values in {} , pin and now() are: {},{now}",
                if *on { "on()" } else { "off()" },
                line.name()
            ),
            Diagnostic::AlarmTableFull => f.write_str("Total number of alarms exceeds."),
            Diagnostic::AlarmCapacityHint => {
                f.write_str("Change the alarm table capacity to register more alarms.")
            }
            Diagnostic::TriggerTimesOutOfBound => {
                f.write_str("Analog trigger event times is called out of bound.")
            }
            Diagnostic::TriggerCapacity { channel } => {
                write!(f, "Analog trigger capacity reached on {channel}.")
            }
            Diagnostic::IndexOutOfBound {
                name,
                len,
                index,
                state,
                now,
            } => write!(
                f,
                "Array {name} index out of bound {index}>{len} in SM {state}, Now(s): {now}"
            ),
            Diagnostic::InjectionDepth(state) => {
                write!(f, "Cannot run {state}: injected machine stack is full.")
            }
        }
    }
}

/// `G,<protocol>,<stage>,<daily>,<weekly>` persistence dump.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GlobalParameters {
    pub protocol: u8,
    pub stage: u8,
    pub daily_intake: u32,
    pub weekly_intake: u32,
}

impl fmt::Display for GlobalParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "G,{},{},{},{}",
            self.protocol, self.stage, self.daily_intake, self.weekly_intake
        )
    }
}

/// `D,<intake>` line emitted when a daily water session resets the intake.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DailyIntakeLine(pub u32);

impl fmt::Display for DailyIntakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D,{}", self.0)
    }
}

/// Saving-window markers on the analog port.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SavingMarker {
    Started,
    Stopped,
}

impl fmt::Display for SavingMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SavingMarker::Started => f.write_str("V,"),
            SavingMarker::Stopped => f.write_str("W,"),
        }
    }
}

/// `P,<code>,...` enumeration of analog channels, sent once at startup.
pub struct ChannelListLine<'a>(pub &'a [i32]);

impl fmt::Display for ChannelListLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_char('P')?;
        for code in self.0 {
            write!(f, ",{code}")?;
        }
        Ok(())
    }
}

/// Request for the host to send stored session parameters.
pub const SESSION_PARAMS_REQUEST: &str = "S";
