use box_core::sampler::{SAMPLER_PERIOD_US, check_overrun};
use box_core::scheduler::BoxEvent;
use embassy_stm32::adc::{Adc, AnyAdcChannel};
use embassy_stm32::peripherals::ADC1;
use embassy_time::{Duration, Instant, Ticker};

use super::{CHANNELS, SAMPLER};
use crate::status;
use crate::telemetry::UartSink;

/// 1 kHz analog sampler.
///
/// Reads every channel, runs the trigger and saving logic under the sampler
/// lock, streams the frame to the analog port and hands events to the
/// scheduler. Nothing here touches the record queues.
#[embassy_executor::task]
pub async fn run(mut adc: Adc<'static, ADC1>, mut lever: AnyAdcChannel<ADC1>, sink: UartSink) -> ! {
    let events = CHANNELS.event_sender();
    let mut ticker = Ticker::every(Duration::from_micros(u64::from(SAMPLER_PERIOD_US)));
    defmt::info!("sampler: running every {=u32}us", SAMPLER_PERIOD_US);

    loop {
        ticker.next().await;
        let started = Instant::now();
        let now_ms = started.as_millis();
        let readings = [adc.blocking_read(&mut lever)];

        let elapsed_ms = status::machine_elapsed_ms(now_ms);
        let output = SAMPLER.lock(|sampler| sampler.borrow_mut().tick(elapsed_ms, now_ms, &readings));
        output.write_analog(&sink);

        for event in &output.events {
            if events.try_send(BoxEvent::Sampler(*event)).is_err() {
                let dropped = status::record_dropped_event();
                defmt::warn!("sampler: event queue full, {=u32} dropped", dropped);
            }
        }
        if output.dropped > 0 {
            defmt::warn!("sampler: {=usize} events over the per-tick limit", output.dropped);
        }

        let took_us = u32::try_from(started.elapsed().as_micros()).unwrap_or(u32::MAX);
        if check_overrun(&sink, took_us) {
            status::record_sampler_overrun();
        }
    }
}
