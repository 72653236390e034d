//! [`BoxIo`] over embassy GPIO and the speaker PWM.

#![cfg(target_os = "none")]

use core::cell::RefCell;

use box_core::digital::{InputBank, InputLine, OutputLine};
use box_core::hardware::BoxIo;
use embassy_stm32::gpio::{Level, Output, Speed};
use embassy_stm32::peripherals::TIM3;
use embassy_stm32::timer::simple_pwm::SimplePwm;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::runtime::SAMPLER;
use crate::status;

/// Latches written by the EXTI tasks and read by the scheduler.
pub static INPUTS: InputBank = InputBank::new();

/// The host-facing echo pin is driven both by input edges and by the
/// scheduler, so it lives outside [`BoardIo`].
pub static GPIO_ECHO: Mutex<CriticalSectionRawMutex, RefCell<Option<Output<'static>>>> =
    Mutex::new(RefCell::new(None));

/// Drives the echo pin if it has been installed.
pub fn write_echo(level: bool) {
    GPIO_ECHO.lock(|echo| {
        if let Some(pin) = echo.borrow_mut().as_mut() {
            pin.set_level(Level::from(level));
        }
    });
}

fn read_echo() -> bool {
    GPIO_ECHO.lock(|echo| {
        echo.borrow()
            .as_ref()
            .is_some_and(Output::is_set_high)
    })
}

/// Outputs other than the echo, indexed by [`OutputLine::index`].
pub type DrivenOutputs = [Output<'static>; OutputLine::COUNT - 1];

pub struct BoardIo {
    outputs: DrivenOutputs,
    tone: SimplePwm<'static, TIM3>,
}

impl BoardIo {
    pub fn new(outputs: DrivenOutputs, echo: Output<'static>, tone: SimplePwm<'static, TIM3>) -> Self {
        GPIO_ECHO.lock(|slot| slot.replace(Some(echo)));
        let mut io = Self { outputs, tone };
        io.set_tone(0);
        io
    }

    /// Builds a pin in its electrical idle state.
    pub fn idle_output<P: embassy_stm32::gpio::Pin>(
        pin: embassy_stm32::Peri<'static, P>,
        idle_high: bool,
    ) -> Output<'static> {
        Output::new(pin, Level::from(idle_high), Speed::Low)
    }
}

impl BoxIo for BoardIo {
    fn write_output(&mut self, line: OutputLine, level: bool) {
        match self.outputs.get_mut(line.index()) {
            Some(pin) => pin.set_level(Level::from(level)),
            None => write_echo(level),
        }
    }

    fn read_output(&self, line: OutputLine) -> bool {
        match self.outputs.get(line.index()) {
            Some(pin) => pin.is_set_high(),
            None => read_echo(),
        }
    }

    fn read_input(&self, line: InputLine) -> bool {
        status::input_active(line)
    }

    fn set_tone(&mut self, duty_percent: u8) {
        let mut channel = self.tone.ch1();
        if duty_percent == 0 {
            channel.disable();
        } else {
            channel.set_duty_cycle_percent(duty_percent.min(100));
            channel.enable();
        }
    }

    fn inputs(&self) -> &InputBank {
        &INPUTS
    }

    fn clear_analog_triggers(&mut self) {
        SAMPLER.lock(|sampler| sampler.borrow_mut().bank_mut().clear_all_triggered());
    }
}
