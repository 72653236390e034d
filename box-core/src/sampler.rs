//! Fixed-period analog sampler and the box-wide saving window.
//!
//! [`AnalogSampler::tick`] runs in interrupt context once per millisecond. It
//! never touches the record queues; everything the scheduler must report is
//! returned as [`SamplerEvent`]s and forwarded by message passing.

use core::fmt;

use heapless::Vec;

use crate::analog::{AnalogBank, Crossing, MAX_ANALOG_CHANNELS, SavingEdge};
use crate::buffer::ANALOG_BUFFER_LEN;
use crate::config::AdcScale;
use crate::telemetry::{Diagnostic, SavingMarker, SerialPort, SerialSink, emit, emit_diagnostic};

/// Sampler period.
pub const SAMPLER_PERIOD_US: u32 = 1_000;
/// Saving stays on this long after it starts unless an OFF edge is seen.
pub const SAVING_HOLD_MS: u64 = 10_000;
/// Saving stops this long after an OFF edge unless a new ON edge arrives.
pub const SAVING_GRACE_MS: u64 = 2_000;
/// Events retained per tick; extra events are counted and dropped.
pub const SAMPLER_EVENT_CAPACITY: usize = 16;

/// Something the scheduler must record on behalf of the sampler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SamplerEvent {
    /// A trigger fired; `value` is its signed threshold.
    TriggerFired { code: i32, value: i32, when_ms: u32 },
    /// A fired trigger drove its GPIO echo pin.
    GpioEcho { code: i32, level: bool, when_ms: u32 },
    SavingStarted { who: i32, when_ms: u32 },
    SavingStopped { who: i32, when_ms: u32 },
}

/// `A,<elapsed>,<bin>...` frame for the analog port.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnalogFrame {
    pub elapsed_ms: u32,
    pub bins: Vec<u16, MAX_ANALOG_CHANNELS>,
}

impl fmt::Display for AnalogFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A,{}", self.elapsed_ms)?;
        for bin in &self.bins {
            write!(f, ",{bin}")?;
        }
        Ok(())
    }
}

/// Everything one tick produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SamplerOutput {
    pub frame: AnalogFrame,
    pub events: Vec<SamplerEvent, SAMPLER_EVENT_CAPACITY>,
    pub dropped: usize,
}

impl SamplerOutput {
    fn push(&mut self, event: SamplerEvent) {
        if self.events.push(event).is_err() {
            self.dropped += 1;
        }
    }

    /// Writes the frame, then any saving markers, to the analog port.
    pub fn write_analog<S: SerialSink + ?Sized>(&self, sink: &S) {
        emit(sink, SerialPort::Analog, &self.frame);
        for event in &self.events {
            match event {
                SamplerEvent::SavingStarted { .. } => {
                    emit(sink, SerialPort::Analog, &SavingMarker::Started);
                }
                SamplerEvent::SavingStopped { .. } => {
                    emit(sink, SerialPort::Analog, &SavingMarker::Stopped);
                }
                _ => {}
            }
        }
    }
}

/// Box-wide saving window shared by every channel with a saving trigger.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SavingWindow {
    on_pending: bool,
    off_pending: bool,
    who: i32,
    active: bool,
    hold_since: Option<u64>,
    grace_since: Option<u64>,
}

/// Transition of the saving window on one tick.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SavingTransition {
    Started { who: i32 },
    Stopped { who: i32 },
}

impl SavingWindow {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            on_pending: false,
            off_pending: false,
            who: 0,
            active: false,
            hold_since: None,
            grace_since: None,
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Report code of the channel that opened the window.
    #[must_use]
    pub const fn who(&self) -> i32 {
        self.who
    }

    /// Latches an ON edge from channel `who`.
    pub fn on_edge(&mut self, who: i32) {
        self.on_pending = true;
        self.off_pending = false;
        self.who = who;
    }

    pub fn off_edge(&mut self) {
        self.off_pending = true;
        self.on_pending = false;
    }

    /// Advances the window to `now_ms` and applies pending edges.
    pub fn step(&mut self, now_ms: u64) -> Option<SavingTransition> {
        let mut started = None;
        if self.on_pending && !self.active {
            started = Some(SavingTransition::Started { who: self.who });
            self.on_pending = false;
            self.active = true;
            self.hold_since = None;
            self.grace_since = None;
        }

        if !self.active {
            return started;
        }

        let hold_since = *self.hold_since.get_or_insert(now_ms);
        if now_ms.saturating_sub(hold_since) >= SAVING_HOLD_MS && !self.off_pending {
            return Some(self.stop());
        }

        if self.off_pending && self.grace_since.is_none() {
            self.grace_since = Some(now_ms);
        }
        if let Some(grace_since) = self.grace_since {
            let in_grace = now_ms.saturating_sub(grace_since);
            if in_grace > SAVING_GRACE_MS {
                return Some(self.stop());
            }
            if self.on_pending {
                // Signal came back before the grace ran out: restart the hold.
                self.on_pending = false;
                self.off_pending = false;
                self.hold_since = None;
                self.grace_since = None;
            }
        }
        started
    }

    fn stop(&mut self) -> SavingTransition {
        self.active = false;
        self.on_pending = false;
        self.off_pending = false;
        SavingTransition::Stopped { who: self.who }
    }
}

/// Owns every analog channel and runs the per-tick algorithm.
pub struct AnalogSampler<const N: usize = ANALOG_BUFFER_LEN> {
    bank: AnalogBank<N>,
    window: SavingWindow,
}

impl<const N: usize> AnalogSampler<N> {
    #[must_use]
    pub const fn new(adc: AdcScale) -> Self {
        Self {
            bank: AnalogBank::new(adc),
            window: SavingWindow::new(),
        }
    }

    #[must_use]
    pub const fn bank(&self) -> &AnalogBank<N> {
        &self.bank
    }

    pub fn bank_mut(&mut self) -> &mut AnalogBank<N> {
        &mut self.bank
    }

    #[must_use]
    pub const fn window(&self) -> &SavingWindow {
        &self.window
    }

    /// Processes one sample per channel.
    ///
    /// `elapsed_ms` is time since the running machine started and stamps
    /// frames and events; `now_ms` is monotonic time for the saving window.
    /// Missing readings leave the channel's buffer untouched.
    pub fn tick(&mut self, elapsed_ms: u32, now_ms: u64, readings: &[u16]) -> SamplerOutput {
        let mut output = SamplerOutput {
            frame: AnalogFrame {
                elapsed_ms,
                bins: Vec::new(),
            },
            events: Vec::new(),
            dropped: 0,
        };

        for (channel, reading) in self.bank.channels_mut().iter_mut().zip(readings) {
            channel.record_sample(*reading);
            // Channel count never exceeds the frame capacity.
            let _ = output.frame.bins.push(*reading);
        }

        if self.bank.enabled_triggers() > 0 {
            for channel in self.bank.channels_mut() {
                let bin = i32::from(channel.latest());
                let noise = channel.noise_bin();
                let code = channel.code();
                let gpio = channel.gpio_code();
                for trigger in channel.triggers_mut().iter_mut().filter(|t| t.activated) {
                    if trigger.observe(bin, noise, elapsed_ms) != Crossing::Fired {
                        continue;
                    }
                    output.push(SamplerEvent::TriggerFired {
                        code,
                        value: trigger.report_value(),
                        when_ms: elapsed_ms,
                    });
                    if let (Some(level), Some(gpio)) = (trigger.echo(), gpio) {
                        output.push(SamplerEvent::GpioEcho {
                            code: gpio,
                            level,
                            when_ms: elapsed_ms,
                        });
                    }
                }
            }
        }

        for channel in self.bank.channels_mut() {
            let bin = i32::from(channel.latest());
            let noise = channel.noise_bin();
            let code = channel.code();
            let Some(saving) = channel.saving_mut() else {
                continue;
            };
            match saving.observe(bin, noise) {
                SavingEdge::On => {
                    channel.set_saving_triggered(true);
                    self.window.on_edge(code);
                    // First channel to open the window wins.
                    break;
                }
                SavingEdge::Off => {
                    channel.set_saving_triggered(false);
                    self.window.off_edge();
                }
                SavingEdge::None => {}
            }
        }

        match self.window.step(now_ms) {
            Some(SavingTransition::Started { who }) => output.push(SamplerEvent::SavingStarted {
                who,
                when_ms: elapsed_ms,
            }),
            Some(SavingTransition::Stopped { who }) => output.push(SamplerEvent::SavingStopped {
                who,
                when_ms: elapsed_ms,
            }),
            None => {}
        }

        output
    }
}

/// Emits the overrun diagnostic when a tick took a full period or longer.
pub fn check_overrun<S: SerialSink + ?Sized>(sink: &S, elapsed_us: u32) -> bool {
    if elapsed_us >= SAMPLER_PERIOD_US {
        emit_diagnostic(sink, &Diagnostic::SamplerOverrun { micros: elapsed_us });
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analog::{SaveMode, TriggerDirection};
    use crate::telemetry::NullSink;

    fn sampler() -> AnalogSampler<8> {
        let mut sampler = AnalogSampler::new(AdcScale::default());
        sampler
            .bank_mut()
            .add_channel("LeverAI", 18, 0.0)
            .expect("channel slot");
        sampler
    }

    #[test]
    fn frame_renders_each_channel() {
        let mut sampler = sampler();
        let output = sampler.tick(12, 12, &[640]);
        let mut line: heapless::String<32> = heapless::String::new();
        core::fmt::write(&mut line, format_args!("{}", output.frame)).expect("format frame");
        assert_eq!(line.as_str(), "A,12,640");
        assert!(output.events.is_empty());
    }

    #[test]
    fn fired_trigger_reports_and_echoes() {
        let mut sampler = sampler();
        let bank = sampler.bank_mut();
        bank.enable_trigger(&NullSink, 0, TriggerDirection::Rising, 0.5, SaveMode::NoSave)
            .expect("enable");
        bank.set_gpio_echo(0, 22, true, TriggerDirection::Rising, 0.5)
            .expect("echo");
        let threshold = bank.adc().volts_to_bin(0.5);

        assert!(sampler.tick(0, 0, &[0]).events.is_empty());
        let output = sampler.tick(1, 1, &[4_000]);
        assert_eq!(
            output.events.as_slice(),
            &[
                SamplerEvent::TriggerFired {
                    code: 18,
                    value: threshold,
                    when_ms: 1
                },
                SamplerEvent::GpioEcho {
                    code: 22,
                    level: true,
                    when_ms: 1
                },
            ]
        );
        assert!(sampler.bank().is_on(0, TriggerDirection::Rising, 0.5));
    }

    #[test]
    fn grace_period_stops_saving_after_off_edge() {
        let mut window = SavingWindow::new();
        window.on_edge(18);
        assert_eq!(window.step(0), Some(SavingTransition::Started { who: 18 }));

        window.off_edge();
        assert_eq!(window.step(3_000), None);
        assert_eq!(window.step(5_000), None);
        assert_eq!(
            window.step(5_001),
            Some(SavingTransition::Stopped { who: 18 })
        );
    }

    #[test]
    fn new_on_edge_within_grace_restarts_hold() {
        let mut window = SavingWindow::new();
        window.on_edge(18);
        window.step(0);
        window.off_edge();
        window.step(1_000);
        window.on_edge(18);
        assert_eq!(window.step(1_500), None);

        // The hold timer restarts on the next tick.
        assert_eq!(window.step(1_501), None);
        assert_eq!(window.step(11_000), None);
        assert_eq!(
            window.step(11_501),
            Some(SavingTransition::Stopped { who: 18 })
        );
    }

    #[test]
    fn overrun_is_reported_at_one_millisecond() {
        struct Count(core::cell::Cell<usize>);
        impl SerialSink for Count {
            fn write_line(&self, port: SerialPort, _: &str) {
                assert_eq!(port, SerialPort::Analog);
                self.0.set(self.0.get() + 1);
            }
        }

        let sink = Count(core::cell::Cell::new(0));
        assert!(!check_overrun(&sink, 999));
        assert!(check_overrun(&sink, 1_000));
        assert_eq!(sink.0.get(), 1);
    }
}
