//! Analog input channels and their edge triggers.
//!
//! Triggers are identified by direction and threshold in ADC counts. A trigger
//! is created the first time it is enabled and afterwards only toggled
//! between activated and deactivated.

use core::fmt;

use heapless::Vec;

use crate::buffer::{ANALOG_BUFFER_LEN, AnalogCircularBuffer};
use crate::config::AdcScale;
use crate::telemetry::{Diagnostic, SerialSink, emit_diagnostic};

/// Analog channels the sampler can service.
pub const MAX_ANALOG_CHANNELS: usize = 4;
/// Triggers per channel.
pub const MAX_TRIGGERS_PER_CHANNEL: usize = 16;
/// Box-wide cap on simultaneously enabled triggers.
pub const MAX_ENABLED_TRIGGERS: usize = MAX_TRIGGERS_PER_CHANNEL * MAX_ANALOG_CHANNELS;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TriggerDirection {
    Rising,
    Falling,
}

/// Errors raised by trigger management.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TriggerError {
    /// The channel already holds its maximum number of triggers.
    ChannelFull,
    /// No trigger with this direction and threshold exists.
    NotFound,
    /// Event history only holds three entries.
    HistoryIndex,
    UnknownChannel,
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerError::ChannelFull => f.write_str("trigger capacity reached"),
            TriggerError::NotFound => f.write_str("no such trigger"),
            TriggerError::HistoryIndex => f.write_str("trigger history index out of bound"),
            TriggerError::UnknownChannel => f.write_str("no such analog channel"),
        }
    }
}

/// Whether an enabled trigger also gates data saving.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SaveMode {
    Save,
    NoSave,
}

/// Hysteresis edge detector on one channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AnalogTrigger {
    pub direction: TriggerDirection,
    pub threshold_bin: i32,
    pub triggered: bool,
    pub activated: bool,
    event_times: [u32; 3],
    armed: bool,
    /// Level written to the channel's GPIO echo pin when this trigger fires.
    echo: Option<bool>,
    echo_value: bool,
}

/// Outcome of feeding one sample to a trigger.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Crossing {
    None,
    Armed,
    Fired,
}

impl AnalogTrigger {
    #[must_use]
    pub const fn new(direction: TriggerDirection, threshold_bin: i32) -> Self {
        Self {
            direction,
            threshold_bin,
            triggered: false,
            activated: true,
            event_times: [0; 3],
            armed: false,
            echo: None,
            echo_value: false,
        }
    }

    #[must_use]
    pub fn matches(&self, direction: TriggerDirection, threshold_bin: i32) -> bool {
        self.direction == direction && self.threshold_bin == threshold_bin
    }

    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.armed
    }

    #[must_use]
    pub const fn echo(&self) -> Option<bool> {
        self.echo
    }

    /// Runs the arm/fire automaton for one sample.
    pub fn observe(&mut self, bin: i32, noise_bin: i32, when_ms: u32) -> Crossing {
        let (fire, arm) = match self.direction {
            TriggerDirection::Rising => (
                bin > self.threshold_bin + noise_bin,
                bin < self.threshold_bin - noise_bin,
            ),
            TriggerDirection::Falling => (
                bin < self.threshold_bin - noise_bin,
                bin > self.threshold_bin + noise_bin,
            ),
        };

        if self.armed {
            if fire {
                self.triggered = true;
                self.armed = false;
                self.event_times = [when_ms, self.event_times[0], self.event_times[1]];
                return Crossing::Fired;
            }
        } else if arm {
            self.armed = true;
            return Crossing::Armed;
        }
        Crossing::None
    }

    /// Report value of a firing: the threshold, negated for falling edges.
    #[must_use]
    pub const fn report_value(&self) -> i32 {
        match self.direction {
            TriggerDirection::Rising => self.threshold_bin,
            TriggerDirection::Falling => -self.threshold_bin,
        }
    }

    #[must_use]
    pub fn event_time(&self, idx: usize) -> Option<u32> {
        self.event_times.get(idx).copied()
    }
}

/// Threshold and hysteresis flags of a channel's saving trigger.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SavingTrigger {
    pub direction: TriggerDirection,
    pub threshold_bin: i32,
    on_armed: bool,
    off_armed: bool,
}

/// Saving-edge outcome for one sample.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SavingEdge {
    None,
    On,
    Off,
}

impl SavingTrigger {
    #[must_use]
    pub const fn new(direction: TriggerDirection, threshold_bin: i32) -> Self {
        Self {
            direction,
            threshold_bin,
            on_armed: false,
            off_armed: false,
        }
    }

    /// Evaluates the ON detector, then the OFF detector. An ON edge
    /// short-circuits the OFF check for this sample.
    pub fn observe(&mut self, bin: i32, noise_bin: i32) -> SavingEdge {
        let above = bin > self.threshold_bin + noise_bin;
        let below = bin < self.threshold_bin - noise_bin;
        let (on_edge, off_edge) = match self.direction {
            TriggerDirection::Rising => (above, below),
            TriggerDirection::Falling => (below, above),
        };

        if self.on_armed {
            if on_edge {
                self.on_armed = false;
                return SavingEdge::On;
            }
        } else if off_edge {
            self.on_armed = true;
        }

        let mut edge = SavingEdge::None;
        if self.off_armed {
            if off_edge {
                self.off_armed = false;
                edge = SavingEdge::Off;
            }
        } else if on_edge {
            self.off_armed = true;
        }
        edge
    }
}

/// One analog input with its sample history and triggers.
pub struct AnalogChannel<const N: usize = ANALOG_BUFFER_LEN> {
    name: &'static str,
    code: i32,
    noise_bin: i32,
    buffer: AnalogCircularBuffer<N>,
    triggers: Vec<AnalogTrigger, MAX_TRIGGERS_PER_CHANNEL>,
    saving: Option<SavingTrigger>,
    saving_triggered: bool,
    gpio_code: Option<i32>,
    latest: u16,
}

impl<const N: usize> AnalogChannel<N> {
    #[must_use]
    pub const fn new(name: &'static str, code: i32, noise_bin: i32) -> Self {
        Self {
            name,
            code,
            noise_bin,
            buffer: AnalogCircularBuffer::new(),
            triggers: Vec::new(),
            saving: None,
            saving_triggered: false,
            gpio_code: None,
            latest: 0,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Report code (the original board pin number).
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.code
    }

    #[must_use]
    pub const fn noise_bin(&self) -> i32 {
        self.noise_bin
    }

    #[must_use]
    pub const fn latest(&self) -> u16 {
        self.latest
    }

    #[must_use]
    pub const fn gpio_code(&self) -> Option<i32> {
        self.gpio_code
    }

    pub fn buffer_mut(&mut self) -> &mut AnalogCircularBuffer<N> {
        &mut self.buffer
    }

    #[must_use]
    pub fn triggers(&self) -> &[AnalogTrigger] {
        &self.triggers
    }

    pub(crate) fn record_sample(&mut self, bin: u16) {
        self.latest = bin;
        self.buffer.write(bin);
    }

    pub(crate) fn triggers_mut(&mut self) -> &mut [AnalogTrigger] {
        &mut self.triggers
    }

    pub(crate) fn saving_mut(&mut self) -> Option<&mut SavingTrigger> {
        self.saving.as_mut()
    }

    pub(crate) fn set_saving_triggered(&mut self, triggered: bool) {
        self.saving_triggered = triggered;
    }

    #[must_use]
    pub const fn is_saving(&self) -> bool {
        self.saving.is_some()
    }

    #[must_use]
    pub const fn saving_triggered(&self) -> bool {
        self.saving_triggered
    }

    fn find(&self, direction: TriggerDirection, bin: i32) -> Option<usize> {
        self.triggers
            .iter()
            .position(|trigger| trigger.matches(direction, bin))
    }

    /// Activates or adds a trigger. Returns `true` when the enabled count
    /// grew.
    fn enable(
        &mut self,
        direction: TriggerDirection,
        bin: i32,
        save: SaveMode,
    ) -> Result<bool, TriggerError> {
        let newly_enabled = if let Some(idx) = self.find(direction, bin) {
            let trigger = &mut self.triggers[idx];
            let was_active = trigger.activated;
            trigger.activated = true;
            !was_active
        } else {
            self.triggers
                .push(AnalogTrigger::new(direction, bin))
                .map_err(|_| TriggerError::ChannelFull)?;
            true
        };

        if save == SaveMode::Save {
            self.saving = Some(SavingTrigger::new(direction, bin));
        }
        Ok(newly_enabled)
    }

    /// Deactivates a trigger and detaches saving from it. Returns `true` when
    /// the enabled count shrank.
    fn disable(&mut self, direction: TriggerDirection, bin: i32) -> Result<bool, TriggerError> {
        let idx = self.find(direction, bin).ok_or(TriggerError::NotFound)?;
        let trigger = &mut self.triggers[idx];
        let was_active = trigger.activated;
        trigger.activated = false;

        if self
            .saving
            .is_some_and(|saving| saving.direction == direction && saving.threshold_bin == bin)
        {
            self.saving = None;
        }
        Ok(was_active)
    }

    fn enable_all(&mut self) -> usize {
        let mut enabled = 0;
        for trigger in self.triggers.iter_mut().filter(|t| !t.activated) {
            trigger.activated = true;
            enabled += 1;
        }
        enabled
    }

    fn disable_all(&mut self) -> usize {
        let mut disabled = 0;
        for trigger in self.triggers.iter_mut().filter(|t| t.activated) {
            trigger.activated = false;
            disabled += 1;
        }
        self.saving = None;
        disabled
    }

    fn set_gpio_echo(
        &mut self,
        gpio_code: i32,
        value: bool,
        direction: TriggerDirection,
        bin: i32,
    ) -> Result<(), TriggerError> {
        self.gpio_code = Some(gpio_code);
        for trigger in &mut self.triggers {
            if trigger.echo_value == value {
                trigger.echo = None;
            }
        }
        let idx = self.find(direction, bin).ok_or(TriggerError::NotFound)?;
        let trigger = &mut self.triggers[idx];
        trigger.echo = Some(value);
        trigger.echo_value = value;
        Ok(())
    }

    fn clear_triggered(&mut self) {
        for trigger in &mut self.triggers {
            trigger.triggered = false;
        }
    }
}

/// Every analog channel plus the box-wide enabled-trigger count.
pub struct AnalogBank<const N: usize = ANALOG_BUFFER_LEN> {
    channels: Vec<AnalogChannel<N>, MAX_ANALOG_CHANNELS>,
    adc: AdcScale,
    enabled: usize,
}

impl<const N: usize> AnalogBank<N> {
    #[must_use]
    pub const fn new(adc: AdcScale) -> Self {
        Self {
            channels: Vec::new(),
            adc,
            enabled: 0,
        }
    }

    /// Registers a channel and returns its index.
    pub fn add_channel(
        &mut self,
        name: &'static str,
        code: i32,
        noise_volts: f32,
    ) -> Result<usize, TriggerError> {
        let noise_bin = self.adc.volts_to_bin(noise_volts);
        self.channels
            .push(AnalogChannel::new(name, code, noise_bin))
            .map_err(|_| TriggerError::UnknownChannel)?;
        Ok(self.channels.len() - 1)
    }

    #[must_use]
    pub fn channels(&self) -> &[AnalogChannel<N>] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [AnalogChannel<N>] {
        &mut self.channels
    }

    #[must_use]
    pub fn channel(&self, idx: usize) -> Option<&AnalogChannel<N>> {
        self.channels.get(idx)
    }

    #[must_use]
    pub const fn adc(&self) -> AdcScale {
        self.adc
    }

    #[must_use]
    pub const fn enabled_triggers(&self) -> usize {
        self.enabled
    }

    /// Report codes of every channel, for the startup `P,` line.
    #[must_use]
    pub fn channel_codes(&self) -> Vec<i32, MAX_ANALOG_CHANNELS> {
        self.channels.iter().map(AnalogChannel::code).collect()
    }

    fn channel_mut(&mut self, idx: usize) -> Result<&mut AnalogChannel<N>, TriggerError> {
        self.channels.get_mut(idx).ok_or(TriggerError::UnknownChannel)
    }

    /// Activates the trigger, adding it if the channel has room. A full
    /// channel is reported on `sink`.
    pub fn enable_trigger<S: SerialSink + ?Sized>(
        &mut self,
        sink: &S,
        channel: usize,
        direction: TriggerDirection,
        volts: f32,
        save: SaveMode,
    ) -> Result<(), TriggerError> {
        let bin = self.adc.volts_to_bin(volts);
        let target = self.channel_mut(channel)?;
        match target.enable(direction, bin, save) {
            Ok(added) => {
                if added {
                    self.enabled = (self.enabled + 1).min(MAX_ENABLED_TRIGGERS);
                }
                Ok(())
            }
            Err(TriggerError::ChannelFull) => {
                emit_diagnostic(
                    sink,
                    &Diagnostic::TriggerCapacity {
                        channel: target.name(),
                    },
                );
                Err(TriggerError::ChannelFull)
            }
            Err(error) => Err(error),
        }
    }

    pub fn disable_trigger(
        &mut self,
        channel: usize,
        direction: TriggerDirection,
        volts: f32,
    ) -> Result<(), TriggerError> {
        let bin = self.adc.volts_to_bin(volts);
        if self.channel_mut(channel)?.disable(direction, bin)? {
            self.enabled = self.enabled.saturating_sub(1);
        }
        Ok(())
    }

    pub fn enable_all(&mut self, channel: usize) -> Result<(), TriggerError> {
        let added = self.channel_mut(channel)?.enable_all();
        self.enabled = (self.enabled + added).min(MAX_ENABLED_TRIGGERS);
        Ok(())
    }

    /// Deactivates every trigger on the channel and turns saving off.
    pub fn disable_all(&mut self, channel: usize) -> Result<(), TriggerError> {
        let removed = self.channel_mut(channel)?.disable_all();
        self.enabled = self.enabled.saturating_sub(removed);
        Ok(())
    }

    /// Routes trigger `(direction, volts)` to the GPIO pin `gpio_code`,
    /// releasing any other trigger that echoed the same level.
    pub fn set_gpio_echo(
        &mut self,
        channel: usize,
        gpio_code: i32,
        value: bool,
        direction: TriggerDirection,
        volts: f32,
    ) -> Result<(), TriggerError> {
        let bin = self.adc.volts_to_bin(volts);
        self.channel_mut(channel)?
            .set_gpio_echo(gpio_code, value, direction, bin)
    }

    fn trigger(
        &self,
        channel: usize,
        direction: TriggerDirection,
        volts: f32,
    ) -> Result<&AnalogTrigger, TriggerError> {
        let bin = self.adc.volts_to_bin(volts);
        let channel = self.channels.get(channel).ok_or(TriggerError::UnknownChannel)?;
        channel
            .triggers
            .iter()
            .find(|trigger| trigger.matches(direction, bin))
            .ok_or(TriggerError::NotFound)
    }

    /// Whether the trigger has fired since it was last cleared.
    #[must_use]
    pub fn is_on(&self, channel: usize, direction: TriggerDirection, volts: f32) -> bool {
        self.trigger(channel, direction, volts)
            .is_ok_and(|trigger| trigger.triggered)
    }

    pub fn clear(
        &mut self,
        channel: usize,
        direction: TriggerDirection,
        volts: f32,
    ) -> Result<(), TriggerError> {
        let bin = self.adc.volts_to_bin(volts);
        let channel = self.channel_mut(channel)?;
        let trigger = channel
            .triggers
            .iter_mut()
            .find(|trigger| trigger.matches(direction, bin))
            .ok_or(TriggerError::NotFound)?;
        trigger.triggered = false;
        Ok(())
    }

    /// Firing time `idx` (0 is the most recent). Indices past 2 are rejected.
    pub fn trigger_time<S: SerialSink + ?Sized>(
        &self,
        sink: &S,
        idx: usize,
        channel: usize,
        direction: TriggerDirection,
        volts: f32,
    ) -> Result<u32, TriggerError> {
        if idx > 2 {
            emit_diagnostic(sink, &Diagnostic::TriggerTimesOutOfBound);
            return Err(TriggerError::HistoryIndex);
        }
        let trigger = self.trigger(channel, direction, volts)?;
        Ok(trigger.event_time(idx).unwrap_or(0))
    }

    /// Clears the fired flag on every trigger of every channel.
    pub fn clear_all_triggered(&mut self) {
        for channel in &mut self.channels {
            channel.clear_triggered();
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;

    use super::*;
    use crate::telemetry::{LineBuffer, NullSink, SerialPort};

    #[derive(Default)]
    struct Lines(RefCell<heapless::Vec<(SerialPort, LineBuffer), 4>>);

    impl SerialSink for Lines {
        fn write_line(&self, port: SerialPort, line: &str) {
            let mut owned = LineBuffer::new();
            owned.push_str(line).expect("line fits");
            self.0.borrow_mut().push((port, owned)).expect("sink capacity");
        }
    }

    impl Lines {
        fn only(&self) -> (SerialPort, LineBuffer) {
            let lines = self.0.borrow();
            assert_eq!(lines.len(), 1, "expected exactly one line");
            lines[0].clone()
        }
    }

    fn bank() -> AnalogBank<8> {
        let mut bank = AnalogBank::new(AdcScale::default());
        bank.add_channel("LeverAI", 18, 0.02).expect("channel slot");
        bank
    }

    #[test]
    fn rising_trigger_fires_once_per_excursion() {
        let mut trigger = AnalogTrigger::new(TriggerDirection::Rising, 100);
        let noise = 10;

        let outcomes: Vec<Crossing, 8> = [95, 89, 95, 105, 111, 130, 120, 111]
            .iter()
            .zip(0..)
            .map(|(bin, when)| trigger.observe(*bin, noise, when))
            .collect();

        assert_eq!(
            outcomes.as_slice(),
            &[
                Crossing::None,
                Crossing::Armed,
                Crossing::None,
                Crossing::None,
                Crossing::Fired,
                Crossing::None,
                Crossing::None,
                Crossing::None,
            ]
        );
        assert!(trigger.triggered);
        assert_eq!(trigger.event_time(0), Some(4));
    }

    #[test]
    fn oscillation_inside_band_never_fires() {
        let mut trigger = AnalogTrigger::new(TriggerDirection::Rising, 100);
        trigger.observe(50, 10, 0);
        for (when, bin) in (1..).zip([91, 109, 90, 110, 100, 95].iter().cycle().take(60)) {
            assert_ne!(trigger.observe(*bin, 10, when), Crossing::Fired);
        }
        assert!(!trigger.triggered);
    }

    #[test]
    fn falling_trigger_reports_negated_threshold() {
        let mut trigger = AnalogTrigger::new(TriggerDirection::Falling, 200);
        assert_eq!(trigger.observe(250, 5, 0), Crossing::Armed);
        assert_eq!(trigger.observe(190, 5, 1), Crossing::Fired);
        assert_eq!(trigger.report_value(), -200);
    }

    #[test]
    fn enabling_existing_trigger_reactivates_it() {
        let mut bank = bank();
        bank.enable_trigger(&NullSink, 0, TriggerDirection::Rising, 0.05, SaveMode::Save)
            .expect("enable");
        bank.disable_trigger(0, TriggerDirection::Rising, 0.05)
            .expect("disable");
        assert_eq!(bank.enabled_triggers(), 0);
        assert!(!bank.channels()[0].is_saving());

        bank.enable_trigger(&NullSink, 0, TriggerDirection::Rising, 0.05, SaveMode::NoSave)
            .expect("re-enable");
        assert_eq!(bank.channels()[0].triggers().len(), 1);
        assert_eq!(bank.enabled_triggers(), 1);
        assert!(!bank.channels()[0].is_saving());
    }

    #[test]
    fn channel_rejects_seventeenth_trigger() {
        let mut bank = bank();
        for step in 0..16_u8 {
            let volts = 0.1 * f32::from(step + 1);
            bank.enable_trigger(&NullSink, 0, TriggerDirection::Rising, volts, SaveMode::NoSave)
                .expect("room for trigger");
        }
        let sink = Lines::default();
        assert_eq!(
            bank.enable_trigger(&sink, 0, TriggerDirection::Falling, 0.1, SaveMode::NoSave),
            Err(TriggerError::ChannelFull)
        );
        assert_eq!(bank.enabled_triggers(), 16);
        let (port, line) = sink.only();
        assert_eq!(port, SerialPort::Primary);
        assert_eq!(line.as_str(), "E,Analog trigger capacity reached on LeverAI.");

        bank.disable_all(0).expect("disable all");
        assert_eq!(bank.enabled_triggers(), 0);
        bank.enable_all(0).expect("enable all");
        assert_eq!(bank.enabled_triggers(), 16);
    }

    #[test]
    fn gpio_echo_moves_between_triggers() {
        let mut bank = bank();
        bank.enable_trigger(&NullSink, 0, TriggerDirection::Rising, 0.5, SaveMode::NoSave)
            .expect("enable rising");
        bank.enable_trigger(&NullSink, 0, TriggerDirection::Falling, 0.2, SaveMode::NoSave)
            .expect("enable falling");

        bank.set_gpio_echo(0, 22, true, TriggerDirection::Rising, 0.5)
            .expect("echo rising");
        bank.set_gpio_echo(0, 22, true, TriggerDirection::Falling, 0.2)
            .expect("echo falling");

        let triggers = bank.channels()[0].triggers();
        assert_eq!(triggers[0].echo(), None);
        assert_eq!(triggers[1].echo(), Some(true));
        assert_eq!(bank.channels()[0].gpio_code(), Some(22));
    }

    #[test]
    fn trigger_history_index_is_bounded() {
        let mut bank = bank();
        bank.enable_trigger(&NullSink, 0, TriggerDirection::Rising, 0.5, SaveMode::NoSave)
            .expect("enable");
        let sink = Lines::default();
        assert_eq!(
            bank.trigger_time(&sink, 3, 0, TriggerDirection::Rising, 0.5),
            Err(TriggerError::HistoryIndex)
        );
        let (port, line) = sink.only();
        assert_eq!(port, SerialPort::Primary);
        assert_eq!(
            line.as_str(),
            "E,Analog trigger event times is called out of bound."
        );

        assert_eq!(
            bank.trigger_time(&sink, 0, 0, TriggerDirection::Rising, 0.5),
            Ok(0)
        );
        assert_eq!(sink.0.borrow().len(), 1);
    }
}
