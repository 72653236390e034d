#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Board wiring for the STM32G0B1 behavior box.
//!
//! Pin map (all outputs push-pull):
//!
//! | line         | pin  | notes                      |
//! |--------------|------|----------------------------|
//! | HouseRedDO   | PA4  | active low                 |
//! | HouseGreenDO | PA5  | active low                 |
//! | HouseBlueDO  | PA6  | active low                 |
//! | CamLeftDO    | PA7  | active low                 |
//! | CamRightDO   | PB3  | active low                 |
//! | WaterDO      | PB8  | active low                 |
//! | IRLightDO    | PB5  | active low                 |
//! | GPIOOutDO    | PB6  | echo to the host computer  |
//! | speaker      | PB4  | TIM3 CH1 PWM               |
//! | Nosepoke1DI  | PA8  | EXTI8, pull-up             |
//! | Nosepoke2DI  | PA15 | EXTI15, pull-up            |
//! | LickDI       | PB9  | EXTI9, pull-down           |
//! | LeverAI      | PA0  | ADC1 IN0                   |
//! | host UART    | PA9/PA10 | USART1, primary port   |
//! | analog UART  | PB0/PB1  | USART5, TX only        |

#[cfg(target_os = "none")]
pub mod io;

use box_core::config::{AdcScale, BoxConfig};

/// Primary serial port speed.
pub const HOST_UART_BAUD: u32 = 115_200;
/// The analog stream carries a frame every millisecond.
pub const ANALOG_UART_BAUD: u32 = 921_600;
/// Speaker PWM carrier.
pub const TONE_HZ: u32 = 4_000;

/// Seed for the protocol RNG until the host provides wall time.
pub const RNG_SEED: u64 = 0x5EED_B0C5;

/// One wired analog input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnalogInput {
    pub name: &'static str,
    pub code: i32,
    pub noise_volts: f32,
}

/// Analog inputs in ADC scan order.
pub const ANALOG_INPUTS: [AnalogInput; 1] = [AnalogInput {
    name: "LeverAI",
    code: 18,
    noise_volts: 0.02,
}];

/// The G0 ADC is 12 bits against a 3.3 V reference.
pub const BOARD_ADC: AdcScale = AdcScale::new(12, 3.3);

/// Report codes and timing for this board.
#[must_use]
pub fn board_config() -> BoxConfig {
    BoxConfig {
        adc: BOARD_ADC,
        ..BoxConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use box_core::digital::OutputLine;

    #[test]
    fn board_keeps_the_standard_codes() {
        let config = board_config();
        assert_eq!(config.output_code(OutputLine::Water), 7);
        assert!(config.is_inverted(OutputLine::Water));
        assert!(!config.is_inverted(OutputLine::GpioOut));
        assert_eq!(config.adc.volts_to_bin(3.3), 4_096);
    }
}
