use box_core::digital::InputLine;
use box_core::scheduler::BoxEvent;
use embassy_stm32::exti::ExtiInput;
use embassy_time::Instant;

use super::CHANNELS;
use crate::hw::io::{INPUTS, write_echo};
use crate::status;

/// Latches one sensor line on every edge and forwards reported edges.
#[embassy_executor::task(pool_size = 3)]
pub async fn run(line: InputLine, mut pin: ExtiInput<'static>) -> ! {
    let events = CHANNELS.event_sender();
    status::record_input_level(line, pin.is_high() != line.active_low());
    defmt::info!("input: watching {=str}", line.name());

    loop {
        pin.wait_for_any_edge().await;
        let now_ms = Instant::now().as_millis();
        let edge = INPUTS.on_edge(line, pin.is_high(), status::machine_elapsed_ms(now_ms));
        status::record_input_level(line, edge.active);
        write_echo(edge.echo_level());

        if edge.is_reported() && events.try_send(BoxEvent::Input(edge)).is_err() {
            let dropped = status::record_dropped_event();
            defmt::warn!("input: event queue full, {=u32} dropped", dropped);
        }
    }
}
