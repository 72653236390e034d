#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Bounded channels between the firmware tasks.
//!
//! Inputs and the sampler produce [`BoxEvent`]s for the scheduler, the UART
//! receiver produces command lines, and every formatted output line goes to
//! one of two transmit channels, one per serial port.

use box_core::scheduler::BoxEvent;
use box_core::telemetry::LineBuffer;
use embassy_sync::channel::{Channel, Receiver, Sender};
use heapless::String;

#[cfg(not(target_os = "none"))]
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

#[cfg(target_os = "none")]
pub type BoxMutex = CriticalSectionRawMutex;
#[cfg(not(target_os = "none"))]
pub type BoxMutex = NoopRawMutex;

/// Longest inbound command line, excluding the terminator.
pub const COMMAND_LINE_LEN: usize = 64;
pub const COMMAND_QUEUE_DEPTH: usize = 4;
pub const EVENT_QUEUE_DEPTH: usize = 32;
pub const PRIMARY_TX_DEPTH: usize = 32;
/// Analog frames arrive every millisecond; a few must fit while the UART drains.
pub const ANALOG_TX_DEPTH: usize = 16;

pub type CommandLine = String<COMMAND_LINE_LEN>;

pub type CommandChannel = Channel<BoxMutex, CommandLine, COMMAND_QUEUE_DEPTH>;
pub type CommandSender<'a> = Sender<'a, BoxMutex, CommandLine, COMMAND_QUEUE_DEPTH>;
pub type CommandReceiver<'a> = Receiver<'a, BoxMutex, CommandLine, COMMAND_QUEUE_DEPTH>;

pub type EventChannel = Channel<BoxMutex, BoxEvent, EVENT_QUEUE_DEPTH>;
pub type EventSender<'a> = Sender<'a, BoxMutex, BoxEvent, EVENT_QUEUE_DEPTH>;
pub type EventReceiver<'a> = Receiver<'a, BoxMutex, BoxEvent, EVENT_QUEUE_DEPTH>;

pub type PrimaryTxChannel = Channel<BoxMutex, LineBuffer, PRIMARY_TX_DEPTH>;
pub type AnalogTxChannel = Channel<BoxMutex, LineBuffer, ANALOG_TX_DEPTH>;

/// Every channel shared by the tasks.
pub struct BoxChannels {
    pub commands: CommandChannel,
    pub events: EventChannel,
    pub primary_tx: PrimaryTxChannel,
    pub analog_tx: AnalogTxChannel,
}

impl BoxChannels {
    pub const fn new() -> Self {
        Self {
            commands: Channel::new(),
            events: Channel::new(),
            primary_tx: Channel::new(),
            analog_tx: Channel::new(),
        }
    }

    pub fn command_sender(&self) -> CommandSender<'_> {
        self.commands.sender()
    }

    pub fn command_receiver(&self) -> CommandReceiver<'_> {
        self.commands.receiver()
    }

    pub fn event_sender(&self) -> EventSender<'_> {
        self.events.sender()
    }

    pub fn event_receiver(&self) -> EventReceiver<'_> {
        self.events.receiver()
    }
}

/// Assembles bytes from the host into command lines.
///
/// `\r` and `\n` both terminate a line; empty lines are skipped. A line that
/// outgrows [`COMMAND_LINE_LEN`] is discarded up to its terminator.
#[derive(Debug, Default)]
pub struct LineAssembler {
    line: CommandLine,
    overflowed: bool,
}

/// Outcome of feeding one byte to a [`LineAssembler`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LineEvent {
    Pending,
    Complete(CommandLine),
    /// A line was dropped because it did not fit.
    Overflow,
}

impl LineAssembler {
    pub const fn new() -> Self {
        Self {
            line: String::new(),
            overflowed: false,
        }
    }

    pub fn push(&mut self, byte: u8) -> LineEvent {
        if byte == b'\r' || byte == b'\n' {
            let overflowed = core::mem::take(&mut self.overflowed);
            let line = core::mem::take(&mut self.line);
            return if overflowed {
                LineEvent::Overflow
            } else if line.is_empty() {
                LineEvent::Pending
            } else {
                LineEvent::Complete(line)
            };
        }
        if self.overflowed || !byte.is_ascii() {
            return LineEvent::Pending;
        }
        if self.line.push(char::from(byte)).is_err() {
            self.overflowed = true;
            self.line.clear();
        }
        LineEvent::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(assembler: &mut LineAssembler, bytes: &[u8]) -> Vec<LineEvent> {
        bytes
            .iter()
            .map(|byte| assembler.push(*byte))
            .filter(|event| *event != LineEvent::Pending)
            .collect()
    }

    #[test]
    fn splits_on_either_terminator() {
        let mut assembler = LineAssembler::new();
        let events = feed(&mut assembler, b"T1506298500\r\nG\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], LineEvent::Complete("T1506298500".try_into().unwrap()));
        assert_eq!(events[1], LineEvent::Complete("G".try_into().unwrap()));
    }

    #[test]
    fn overlong_lines_are_dropped_whole() {
        let mut assembler = LineAssembler::new();
        let mut bytes = vec![b'S'; COMMAND_LINE_LEN + 8];
        bytes.push(b'\n');
        bytes.extend_from_slice(b"G\n");
        let events = feed(&mut assembler, &bytes);
        assert_eq!(events[0], LineEvent::Overflow);
        assert_eq!(events[1], LineEvent::Complete("G".try_into().unwrap()));
    }
}
