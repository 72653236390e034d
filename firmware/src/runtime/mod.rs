use core::cell::RefCell;

use box_core::config::BoxConfig;
use box_core::digital::{InputLine, OutputLine};
use box_core::sampler::AnalogSampler;
use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_stm32 as hal;
use embassy_stm32::adc::{Adc, AdcChannel};
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::gpio::{OutputType, Pull};
use embassy_stm32::time::hz;
use embassy_stm32::timer::low_level::CountingMode;
use embassy_stm32::timer::simple_pwm::{PwmPin, SimplePwm};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::channels::BoxChannels;
use crate::hw::io::BoardIo;
use crate::hw::{ANALOG_INPUTS, BOARD_ADC, TONE_HZ, board_config};
use crate::telemetry::{UartSink, log_info};

mod input_task;
mod sampler_task;
mod scheduler_task;
mod uart_task;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

pub(crate) static CHANNELS: BoxChannels = BoxChannels::new();

/// Analog channels, their triggers and the saving window. Locked by the
/// sampler tick and by the scheduler when it clears triggers.
pub(crate) static SAMPLER: Mutex<CriticalSectionRawMutex, RefCell<AnalogSampler>> =
    Mutex::new(RefCell::new(AnalogSampler::new(BOARD_ADC)));

fn sink() -> UartSink {
    UartSink::new(&CHANNELS.primary_tx, &CHANNELS.analog_tx)
}

fn register_analog_inputs() {
    SAMPLER.lock(|sampler| {
        let mut sampler = sampler.borrow_mut();
        for input in ANALOG_INPUTS {
            if sampler
                .bank_mut()
                .add_channel(input.name, input.code, input.noise_volts)
                .is_err()
            {
                defmt::warn!("analog: no slot for {=str}", input.name);
            }
        }
    });
}

#[embassy_executor::main]
pub async fn main(spawner: Spawner) {
    let config = hal::Config::default();
    let hal::Peripherals {
        PA0,
        PA4,
        PA5,
        PA6,
        PA7,
        PA8,
        PA9,
        PA10,
        PA15,
        PB0,
        PB1,
        PB3,
        PB4,
        PB5,
        PB6,
        PB8,
        PB9,
        EXTI8,
        EXTI9,
        EXTI15,
        ADC1,
        TIM3,
        USART1,
        USART5,
        ..
    } = hal::init(config);

    let board: BoxConfig = board_config();
    let idle = |line: OutputLine| board.drive_level(line, false);

    let outputs = [
        BoardIo::idle_output(PA4, idle(OutputLine::HouseRed)),
        BoardIo::idle_output(PA5, idle(OutputLine::HouseGreen)),
        BoardIo::idle_output(PA6, idle(OutputLine::HouseBlue)),
        BoardIo::idle_output(PA7, idle(OutputLine::CamLeft)),
        BoardIo::idle_output(PB3, idle(OutputLine::CamRight)),
        BoardIo::idle_output(PB8, idle(OutputLine::Water)),
        BoardIo::idle_output(PB5, idle(OutputLine::IrLight)),
    ];
    let echo = BoardIo::idle_output(PB6, idle(OutputLine::GpioOut));
    let tone = SimplePwm::new(
        TIM3,
        Some(PwmPin::new(PB4, OutputType::PushPull)),
        None,
        None,
        None,
        hz(TONE_HZ),
        CountingMode::EdgeAlignedUp,
    );
    let io = BoardIo::new(outputs, echo, tone);

    register_analog_inputs();
    let adc = Adc::new(ADC1);
    let lever = PA0.degrade_adc();

    log_info("behavior box firmware starting");

    spawner
        .spawn(uart_task::host(USART1, PA9, PA10))
        .expect("failed to spawn host UART task");
    spawner
        .spawn(uart_task::analog(USART5, PB0, PB1))
        .expect("failed to spawn analog UART task");
    spawner
        .spawn(input_task::run(
            InputLine::Nosepoke1,
            ExtiInput::new(PA8, EXTI8, Pull::Up),
        ))
        .expect("failed to spawn nosepoke 1 task");
    spawner
        .spawn(input_task::run(
            InputLine::Nosepoke2,
            ExtiInput::new(PA15, EXTI15, Pull::Up),
        ))
        .expect("failed to spawn nosepoke 2 task");
    spawner
        .spawn(input_task::run(
            InputLine::Lick,
            ExtiInput::new(PB9, EXTI9, Pull::Down),
        ))
        .expect("failed to spawn lick task");
    spawner
        .spawn(sampler_task::run(adc, lever, sink()))
        .expect("failed to spawn sampler task");
    spawner
        .spawn(scheduler_task::run(io, board, sink()))
        .expect("failed to spawn scheduler task");

    core::future::pending::<()>().await;
}
