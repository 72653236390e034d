//! Board-level settings shared by the firmware and the emulator.

use crate::digital::{InputLine, OutputLine};

/// Duration of one water valve pulse.
pub const DEFAULT_REWARD_PULSE_MS: u32 = 18;
/// Valve closed time between pulses.
pub const DEFAULT_REWARD_GAP_MS: u32 = 20;
pub const DEFAULT_DAILY_QUOTA: u32 = 2_000;
pub const DEFAULT_WEEKLY_QUOTA: u32 = 10_500;
/// Time budget for draining queues in one housekeeping pass.
pub const DEFAULT_HOUSEKEEPING_BUDGET_MS: u32 = 5;
/// Interval between heartbeat reports.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 3_600;
/// PWM duty used for audio cues.
pub const DEFAULT_TONE_DUTY_PERCENT: u8 = 50;

/// ADC resolution and reference voltage.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AdcScale {
    pub bits: u8,
    pub vref_volts: f32,
}

impl AdcScale {
    #[must_use]
    pub const fn new(bits: u8, vref_volts: f32) -> Self {
        Self { bits, vref_volts }
    }

    /// Converts a voltage to ADC counts, truncating toward zero.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn volts_to_bin(&self, volts: f32) -> i32 {
        let full_scale = f32::from(1_u16 << self.bits.min(15));
        (volts / self.vref_volts * full_scale) as i32
    }

    /// Converts ADC counts back to volts.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn bin_to_volts(&self, bin: i32) -> f32 {
        let full_scale = f32::from(1_u16 << self.bits.min(15));
        bin as f32 / full_scale * self.vref_volts
    }
}

impl Default for AdcScale {
    fn default() -> Self {
        Self::new(13, 3.3)
    }
}

/// Per-line report codes and timing defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct BoxConfig {
    pub input_codes: [i32; InputLine::COUNT],
    pub output_codes: [i32; OutputLine::COUNT],
    /// Outputs whose electrical level is the inverse of their logical state.
    pub output_inverted: [bool; OutputLine::COUNT],
    pub tone_code: i32,
    pub tone_duty_percent: u8,
    pub adc: AdcScale,
    pub reward_pulse_ms: u32,
    pub reward_gap_ms: u32,
    pub daily_quota: u32,
    pub weekly_quota: u32,
    pub housekeeping_budget_ms: u32,
    pub heartbeat_secs: u64,
}

impl BoxConfig {
    #[must_use]
    pub const fn input_code(&self, line: InputLine) -> i32 {
        self.input_codes[line.index()]
    }

    #[must_use]
    pub const fn output_code(&self, line: OutputLine) -> i32 {
        self.output_codes[line.index()]
    }

    #[must_use]
    pub const fn is_inverted(&self, line: OutputLine) -> bool {
        self.output_inverted[line.index()]
    }

    /// First output line wired to report code `code`.
    #[must_use]
    pub fn output_for_code(&self, code: i32) -> Option<OutputLine> {
        OutputLine::ALL
            .into_iter()
            .find(|line| self.output_code(*line) == code)
    }

    /// Electrical level that puts `line` into logical state `on`.
    #[must_use]
    pub const fn drive_level(&self, line: OutputLine, on: bool) -> bool {
        on != self.is_inverted(line)
    }

    /// Logical state read back from electrical level `level`.
    #[must_use]
    pub const fn logical_level(&self, line: OutputLine, level: bool) -> bool {
        level != self.is_inverted(line)
    }
}

impl Default for BoxConfig {
    fn default() -> Self {
        Self {
            input_codes: [21, 20, 25],
            output_codes: [3, 4, 5, 2, 2, 7, 6, 22],
            output_inverted: [true, true, true, true, true, true, true, false],
            tone_code: 23,
            tone_duty_percent: DEFAULT_TONE_DUTY_PERCENT,
            adc: AdcScale::default(),
            reward_pulse_ms: DEFAULT_REWARD_PULSE_MS,
            reward_gap_ms: DEFAULT_REWARD_GAP_MS,
            daily_quota: DEFAULT_DAILY_QUOTA,
            weekly_quota: DEFAULT_WEEKLY_QUOTA,
            housekeeping_budget_ms: DEFAULT_HOUSEKEEPING_BUDGET_MS,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volts_convert_to_bins() {
        let adc = AdcScale::default();
        assert_eq!(adc.volts_to_bin(0.0), 0);
        assert_eq!(adc.volts_to_bin(3.3), 8_192);
        assert_eq!(adc.volts_to_bin(0.05), 124);
    }

    #[test]
    fn inverted_outputs_drive_low_when_on() {
        let config = BoxConfig::default();
        assert!(!config.drive_level(OutputLine::Water, true));
        assert!(config.drive_level(OutputLine::GpioOut, true));
        assert!(config.logical_level(OutputLine::HouseRed, false));
        assert_eq!(config.output_code(OutputLine::CamRight), 2);
        assert_eq!(config.input_code(InputLine::Nosepoke2), 20);
        assert_eq!(config.output_for_code(22), Some(OutputLine::GpioOut));
        assert_eq!(config.output_for_code(2), Some(OutputLine::CamLeft));
        assert_eq!(config.output_for_code(99), None);
    }
}
