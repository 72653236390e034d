#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Serial sink backed by the transmit channels, plus defmt/host log helpers.
//!
//! Every line the core formats is copied into a [`LineBuffer`] and handed to
//! the UART task for its port. `E,` diagnostics are mirrored to defmt so they
//! show up on the debug probe even when no host is listening.

use box_core::telemetry::{LineBuffer, SerialPort, SerialSink};

use crate::channels::{AnalogTxChannel, PrimaryTxChannel};
use crate::status;

/// [`SerialSink`] that queues lines for the UART transmit tasks.
#[derive(Clone, Copy)]
pub struct UartSink {
    primary: &'static PrimaryTxChannel,
    analog: &'static AnalogTxChannel,
}

impl UartSink {
    pub const fn new(primary: &'static PrimaryTxChannel, analog: &'static AnalogTxChannel) -> Self {
        Self { primary, analog }
    }
}

impl SerialSink for UartSink {
    fn write_line(&self, port: SerialPort, line: &str) {
        if line.starts_with("E,") {
            log_error_line(line);
        }

        let mut buffer = LineBuffer::new();
        if buffer.push_str(line).is_err() {
            log_truncated(line.len());
            return;
        }

        let sent = match port {
            SerialPort::Primary => self.primary.try_send(buffer).is_ok(),
            SerialPort::Analog => self.analog.try_send(buffer).is_ok(),
        };
        if !sent {
            let dropped = status::record_dropped_line();
            log_dropped_line(port, dropped);
        }
    }
}

const fn port_label(port: SerialPort) -> &'static str {
    match port {
        SerialPort::Primary => "primary",
        SerialPort::Analog => "analog",
    }
}

#[cfg(target_os = "none")]
fn log_error_line(line: &str) {
    defmt::warn!("box: {=str}", line);
}

#[cfg(not(target_os = "none"))]
fn log_error_line(line: &str) {
    println!("box: {line}");
}

#[cfg(target_os = "none")]
fn log_dropped_line(port: SerialPort, total: u32) {
    // analog drops are only logged every thousandth time
    if port == SerialPort::Primary || total % 1_000 == 1 {
        defmt::warn!("uart:{=str} tx full, {=u32} lines dropped", port_label(port), total);
    }
}

#[cfg(not(target_os = "none"))]
fn log_dropped_line(port: SerialPort, total: u32) {
    if port == SerialPort::Primary || total % 1_000 == 1 {
        println!("uart:{} tx full, {total} lines dropped", port_label(port));
    }
}

#[cfg(target_os = "none")]
fn log_truncated(len: usize) {
    defmt::warn!("uart: dropping {=usize}-byte line", len);
}

#[cfg(not(target_os = "none"))]
fn log_truncated(len: usize) {
    println!("uart: dropping {len}-byte line");
}

/// Lifecycle message, `info!` on the target.
#[cfg(target_os = "none")]
pub fn log_info(message: &str) {
    defmt::info!("{=str}", message);
}

#[cfg(not(target_os = "none"))]
pub fn log_info(message: &str) {
    println!("{message}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::channel::Channel;

    use crate::channels::PRIMARY_TX_DEPTH;

    fn sink() -> UartSink {
        let primary: &'static PrimaryTxChannel = Box::leak(Box::new(Channel::new()));
        let analog: &'static AnalogTxChannel = Box::leak(Box::new(Channel::new()));
        UartSink::new(primary, analog)
    }

    #[test]
    fn lines_land_on_their_port() {
        let sink = sink();
        sink.write_line(SerialPort::Primary, "21,1,15,0,41,0,0,0");
        sink.write_line(SerialPort::Analog, "A,41,2048");

        let primary = sink.primary.try_receive().expect("primary line");
        assert_eq!(primary.as_str(), "21,1,15,0,41,0,0,0");
        let analog = sink.analog.try_receive().expect("analog line");
        assert_eq!(analog.as_str(), "A,41,2048");
        assert!(sink.primary.try_receive().is_err());
    }

    #[test]
    fn full_channel_counts_the_drop() {
        let sink = sink();
        for _ in 0..PRIMARY_TX_DEPTH {
            sink.write_line(SerialPort::Primary, "97,97,15,0,0,0,0,0");
        }
        let before = status::snapshot().dropped_lines;
        sink.write_line(SerialPort::Primary, "97,97,15,0,0,0,0,0");
        assert!(status::snapshot().dropped_lines > before);
        assert_eq!(sink.primary.len(), PRIMARY_TX_DEPTH);
    }
}
