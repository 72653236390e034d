use box_core::telemetry::LineBuffer;
use embassy_futures::join::join;
use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_stm32::usart::{
    BufferedUart, BufferedUartTx, Config as UartConfig, DataBits, Parity, StopBits,
};
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer};
use embedded_io_async::{Read, Write};
use static_cell::StaticCell;

use super::CHANNELS;
use crate::channels::{BoxMutex, LineAssembler, LineEvent};
use crate::hw::{ANALOG_UART_BAUD, HOST_UART_BAUD};

const HOST_TX_BUFFER: usize = 1_024;
const HOST_RX_BUFFER: usize = 128;
const ANALOG_TX_BUFFER: usize = 512;
// USART5 is used transmit-only but the driver still wants an RX ring.
const ANALOG_RX_BUFFER: usize = 8;
const LINE_END: &[u8] = b"\r\n";

static HOST_TX: StaticCell<[u8; HOST_TX_BUFFER]> = StaticCell::new();
static HOST_RX: StaticCell<[u8; HOST_RX_BUFFER]> = StaticCell::new();
static ANALOG_TX: StaticCell<[u8; ANALOG_TX_BUFFER]> = StaticCell::new();
static ANALOG_RX: StaticCell<[u8; ANALOG_RX_BUFFER]> = StaticCell::new();

embassy_stm32::bind_interrupts!(struct HostIrqs {
    USART1 => embassy_stm32::usart::BufferedInterruptHandler<hal::peripherals::USART1>;
});

embassy_stm32::bind_interrupts!(struct AnalogIrqs {
    USART3_4_5_6_LPUART1 => embassy_stm32::usart::BufferedInterruptHandler<hal::peripherals::USART5>;
});

fn uart_config(baudrate: u32) -> UartConfig {
    let mut config = UartConfig::default();
    config.baudrate = baudrate;
    config.data_bits = DataBits::DataBits8;
    config.stop_bits = StopBits::STOP1;
    config.parity = Parity::ParityNone;
    config
}

/// Writes queued lines, each followed by `\r\n`.
async fn drain<const N: usize>(
    lines: &'static Channel<BoxMutex, LineBuffer, N>,
    tx: &mut BufferedUartTx<'static>,
    label: &'static str,
) {
    loop {
        let line = lines.receive().await;
        let written = match tx.write_all(line.as_bytes()).await {
            Ok(()) => tx.write_all(LINE_END).await,
            Err(error) => Err(error),
        };
        if written.is_err() {
            defmt::warn!("uart:{=str} write error", label);
            Timer::after(Duration::from_millis(5)).await;
        }
    }
}

/// Primary port: event records out, host commands in.
#[embassy_executor::task]
pub async fn host(
    usart: Peri<'static, hal::peripherals::USART1>,
    tx_pin: Peri<'static, hal::peripherals::PA9>,
    rx_pin: Peri<'static, hal::peripherals::PA10>,
) -> ! {
    let uart = match BufferedUart::new(
        usart,
        rx_pin,
        tx_pin,
        HOST_TX.init([0; HOST_TX_BUFFER]),
        HOST_RX.init([0; HOST_RX_BUFFER]),
        HostIrqs,
        uart_config(HOST_UART_BAUD),
    ) {
        Ok(uart) => uart,
        Err(_) => {
            defmt::error!("uart:host failed to initialize");
            loop {
                core::future::pending::<()>().await;
            }
        }
    };
    let (mut tx, mut rx) = uart.split();
    let commands = CHANNELS.command_sender();

    let outbound = drain(&CHANNELS.primary_tx, &mut tx, "host");
    let inbound = async {
        let mut assembler = LineAssembler::new();
        let mut chunk = [0_u8; 32];
        loop {
            match rx.read(&mut chunk).await {
                Ok(count) => {
                    for byte in &chunk[..count] {
                        match assembler.push(*byte) {
                            LineEvent::Complete(line) => commands.send(line).await,
                            LineEvent::Overflow => defmt::warn!("uart:host dropped an overlong line"),
                            LineEvent::Pending => {}
                        }
                    }
                }
                Err(_) => {
                    defmt::warn!("uart:host read error");
                    Timer::after(Duration::from_millis(5)).await;
                }
            }
        }
    };

    join(outbound, inbound).await;
    loop {
        core::future::pending::<()>().await;
    }
}

/// Analog port: frames and saving markers only.
#[embassy_executor::task]
pub async fn analog(
    usart: Peri<'static, hal::peripherals::USART5>,
    tx_pin: Peri<'static, hal::peripherals::PB0>,
    rx_pin: Peri<'static, hal::peripherals::PB1>,
) -> ! {
    let uart = match BufferedUart::new(
        usart,
        rx_pin,
        tx_pin,
        ANALOG_TX.init([0; ANALOG_TX_BUFFER]),
        ANALOG_RX.init([0; ANALOG_RX_BUFFER]),
        AnalogIrqs,
        uart_config(ANALOG_UART_BAUD),
    ) {
        Ok(uart) => uart,
        Err(_) => {
            defmt::error!("uart:analog failed to initialize");
            loop {
                core::future::pending::<()>().await;
            }
        }
    };
    let (mut tx, _rx) = uart.split();
    drain(&CHANNELS.analog_tx, &mut tx, "analog").await;
    loop {
        core::future::pending::<()>().await;
    }
}
