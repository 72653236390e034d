//! Hardware seam between the scheduler and the box's pins.
//!
//! The scheduler only ever drives the box through [`BoxIo`]. The firmware
//! implements it over embassy GPIO and PWM; [`SimulatedIo`] implements it in
//! memory for the emulator and for tests.

use crate::digital::{InputBank, InputEdge, InputLine, OutputLine};

/// Pin-level access to the box.
pub trait BoxIo {
    /// Drives the electrical level of `line`.
    fn write_output(&mut self, line: OutputLine, level: bool);

    /// Reads back the electrical level of `line`.
    fn read_output(&self, line: OutputLine) -> bool;

    /// Whether the sensor on `line` is active right now, polarity applied.
    fn read_input(&self, line: InputLine) -> bool;

    /// Sets the speaker PWM duty; zero silences it.
    fn set_tone(&mut self, duty_percent: u8);

    /// Latched digital inputs written by the edge handlers.
    fn inputs(&self) -> &InputBank;

    /// Clears every latched analog trigger.
    fn clear_analog_triggers(&mut self);
}

impl<T: BoxIo + ?Sized> BoxIo for &mut T {
    fn write_output(&mut self, line: OutputLine, level: bool) {
        (**self).write_output(line, level);
    }

    fn read_output(&self, line: OutputLine) -> bool {
        (**self).read_output(line)
    }

    fn read_input(&self, line: InputLine) -> bool {
        (**self).read_input(line)
    }

    fn set_tone(&mut self, duty_percent: u8) {
        (**self).set_tone(duty_percent);
    }

    fn inputs(&self) -> &InputBank {
        (**self).inputs()
    }

    fn clear_analog_triggers(&mut self) {
        (**self).clear_analog_triggers();
    }
}

/// In-memory box used by the emulator and by scenario tests.
pub struct SimulatedIo {
    outputs: [bool; OutputLine::COUNT],
    stuck: [Option<bool>; OutputLine::COUNT],
    active: [bool; InputLine::COUNT],
    tone: u8,
    inputs: InputBank,
    analog_clears: u32,
    output_writes: u32,
}

impl SimulatedIo {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            outputs: [false; OutputLine::COUNT],
            stuck: [None; OutputLine::COUNT],
            active: [false; InputLine::COUNT],
            tone: 0,
            inputs: InputBank::new(),
            analog_clears: 0,
            output_writes: 0,
        }
    }

    /// Moves the sensor on `line` into `active` and runs the edge handler.
    ///
    /// The GPIO echo follows the sensor the same way the firmware's edge
    /// interrupt drives it.
    pub fn set_input(&mut self, line: InputLine, active: bool, when_ms: u32) -> InputEdge {
        self.active[line.index()] = active;
        let raw_level = active != line.active_low();
        let edge = self.inputs.on_edge(line, raw_level, when_ms);
        self.outputs[OutputLine::GpioOut.index()] = edge.echo_level();
        edge
    }

    pub fn activate(&mut self, line: InputLine, when_ms: u32) -> InputEdge {
        self.set_input(line, true, when_ms)
    }

    pub fn release(&mut self, line: InputLine, when_ms: u32) -> InputEdge {
        self.set_input(line, false, when_ms)
    }

    /// Pins `line` so read-back returns `level` whatever is written.
    pub fn stick_output(&mut self, line: OutputLine, level: Option<bool>) {
        self.stuck[line.index()] = level;
    }

    /// Last electrical level written to `line`.
    #[must_use]
    pub const fn output_level(&self, line: OutputLine) -> bool {
        self.outputs[line.index()]
    }

    #[must_use]
    pub const fn tone_duty(&self) -> u8 {
        self.tone
    }

    #[must_use]
    pub const fn analog_clears(&self) -> u32 {
        self.analog_clears
    }

    #[must_use]
    pub const fn output_writes(&self) -> u32 {
        self.output_writes
    }
}

impl Default for SimulatedIo {
    fn default() -> Self {
        Self::new()
    }
}

impl BoxIo for SimulatedIo {
    fn write_output(&mut self, line: OutputLine, level: bool) {
        self.outputs[line.index()] = level;
        self.output_writes = self.output_writes.wrapping_add(1);
    }

    fn read_output(&self, line: OutputLine) -> bool {
        self.stuck[line.index()].unwrap_or(self.outputs[line.index()])
    }

    fn read_input(&self, line: InputLine) -> bool {
        self.active[line.index()]
    }

    fn set_tone(&mut self, duty_percent: u8) {
        self.tone = duty_percent;
    }

    fn inputs(&self) -> &InputBank {
        &self.inputs
    }

    fn clear_analog_triggers(&mut self) {
        self.analog_clears = self.analog_clears.wrapping_add(1);
    }
}
