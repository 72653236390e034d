//! Digital input latches and output line identities.
//!
//! Inputs are written from edge interrupts and read from the scheduler, so
//! every latch field is a single atomic. Clearing a latch is one store.

use portable_atomic::{AtomicBool, AtomicU32, Ordering};

/// Sensor inputs wired to the box.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum InputLine {
    Nosepoke1,
    Nosepoke2,
    Lick,
}

impl InputLine {
    pub const COUNT: usize = 3;
    pub const ALL: [InputLine; Self::COUNT] =
        [InputLine::Nosepoke1, InputLine::Nosepoke2, InputLine::Lick];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            InputLine::Nosepoke1 => 0,
            InputLine::Nosepoke2 => 1,
            InputLine::Lick => 2,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            InputLine::Nosepoke1 => "Nosepoke1DI",
            InputLine::Nosepoke2 => "Nosepoke2DI",
            InputLine::Lick => "LickDI",
        }
    }

    /// Nosepoke beams read low while broken.
    #[must_use]
    pub const fn active_low(self) -> bool {
        matches!(self, InputLine::Nosepoke1 | InputLine::Nosepoke2)
    }

    /// Lick edges are too frequent to report individually.
    #[must_use]
    pub const fn reports_edges(self) -> bool {
        !matches!(self, InputLine::Lick)
    }
}

/// Driven outputs of the box.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum OutputLine {
    HouseRed,
    HouseGreen,
    HouseBlue,
    CamLeft,
    CamRight,
    Water,
    IrLight,
    /// Echo of sensor activity to the host computer.
    GpioOut,
}

impl OutputLine {
    pub const COUNT: usize = 8;
    pub const ALL: [OutputLine; Self::COUNT] = [
        OutputLine::HouseRed,
        OutputLine::HouseGreen,
        OutputLine::HouseBlue,
        OutputLine::CamLeft,
        OutputLine::CamRight,
        OutputLine::Water,
        OutputLine::IrLight,
        OutputLine::GpioOut,
    ];
    pub const HOUSE_LIGHTS: [OutputLine; 3] =
        [OutputLine::HouseRed, OutputLine::HouseGreen, OutputLine::HouseBlue];
    pub const CAMERA_LIGHTS: [OutputLine; 2] = [OutputLine::CamLeft, OutputLine::CamRight];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            OutputLine::HouseRed => 0,
            OutputLine::HouseGreen => 1,
            OutputLine::HouseBlue => 2,
            OutputLine::CamLeft => 3,
            OutputLine::CamRight => 4,
            OutputLine::Water => 5,
            OutputLine::IrLight => 6,
            OutputLine::GpioOut => 7,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            OutputLine::HouseRed => "HouseRedDO",
            OutputLine::HouseGreen => "HouseGreenDO",
            OutputLine::HouseBlue => "HouseBlueDO",
            OutputLine::CamLeft => "CamLeftDO",
            OutputLine::CamRight => "CamRightDO",
            OutputLine::Water => "WaterDO",
            OutputLine::IrLight => "IRLightDO",
            OutputLine::GpioOut => "GPIOOutDO",
        }
    }
}

/// Latched logical value and last three activation times of one input.
pub struct InputLatch {
    value: AtomicBool,
    times: [AtomicU32; 3],
}

impl InputLatch {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicBool::new(false),
            times: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    #[must_use]
    pub fn is_on(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.value.store(false, Ordering::Release);
    }

    /// Activation time `idx` (0 is the most recent) in machine-relative
    /// milliseconds.
    #[must_use]
    pub fn event_time(&self, idx: usize) -> Option<u32> {
        self.times.get(idx).map(|time| time.load(Ordering::Acquire))
    }

    fn latch(&self, active: bool, when_ms: u32) {
        self.value.store(active, Ordering::Release);
        if active {
            let older = self.times[1].load(Ordering::Relaxed);
            self.times[2].store(older, Ordering::Relaxed);
            let newer = self.times[0].load(Ordering::Relaxed);
            self.times[1].store(newer, Ordering::Relaxed);
            self.times[0].store(when_ms, Ordering::Release);
        }
    }
}

impl Default for InputLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one input edge, handed from the interrupt side to the scheduler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InputEdge {
    pub line: InputLine,
    /// Logical value after the edge.
    pub active: bool,
    /// Machine-relative time of the edge.
    pub when_ms: u32,
}

impl InputEdge {
    /// Level to drive on the host-facing GPIO echo.
    #[must_use]
    pub const fn echo_level(&self) -> bool {
        self.active
    }

    #[must_use]
    pub const fn is_reported(&self) -> bool {
        self.line.reports_edges()
    }
}

/// Latches for every [`InputLine`].
pub struct InputBank {
    latches: [InputLatch; InputLine::COUNT],
}

impl InputBank {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            latches: [InputLatch::new(), InputLatch::new(), InputLatch::new()],
        }
    }

    #[must_use]
    pub const fn latch(&self, line: InputLine) -> &InputLatch {
        &self.latches[line.index()]
    }

    /// Interrupt-side edge handler. `raw_level` is the electrical pin level.
    pub fn on_edge(&self, line: InputLine, raw_level: bool, when_ms: u32) -> InputEdge {
        let active = raw_level != line.active_low();
        self.latch(line).latch(active, when_ms);
        InputEdge {
            line,
            active,
            when_ms,
        }
    }

    #[must_use]
    pub fn is_on(&self, line: InputLine) -> bool {
        self.latch(line).is_on()
    }

    pub fn clear(&self, line: InputLine) {
        self.latch(line).clear();
    }

    pub fn clear_all(&self) {
        for latch in &self.latches {
            latch.clear();
        }
    }

    #[must_use]
    pub fn event_time(&self, line: InputLine, idx: usize) -> Option<u32> {
        self.latch(line).event_time(idx)
    }
}

impl Default for InputBank {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nosepoke_is_active_low() {
        let bank = InputBank::new();

        let edge = bank.on_edge(InputLine::Nosepoke1, false, 40);
        assert!(edge.active);
        assert!(edge.is_reported());
        assert!(bank.is_on(InputLine::Nosepoke1));

        let edge = bank.on_edge(InputLine::Nosepoke1, true, 55);
        assert!(!edge.active);
        assert!(!edge.echo_level());
        assert!(!bank.is_on(InputLine::Nosepoke1));
    }

    #[test]
    fn lick_is_active_high_and_unreported() {
        let bank = InputBank::new();
        let edge = bank.on_edge(InputLine::Lick, true, 10);
        assert!(edge.active);
        assert!(!edge.is_reported());

        bank.clear(InputLine::Lick);
        assert!(!bank.is_on(InputLine::Lick));
    }

    #[test]
    fn activations_shift_event_history() {
        let bank = InputBank::new();
        for (when, level) in [(10, true), (12, false), (20, true), (30, true)] {
            bank.on_edge(InputLine::Lick, level, when);
        }

        assert_eq!(bank.event_time(InputLine::Lick, 0), Some(30));
        assert_eq!(bank.event_time(InputLine::Lick, 1), Some(20));
        assert_eq!(bank.event_time(InputLine::Lick, 2), Some(10));
        assert_eq!(bank.event_time(InputLine::Lick, 3), None);
    }
}
