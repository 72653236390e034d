use box_core::clock::{Instant as BoxInstant, MonotonicClock};
use box_core::config::BoxConfig;
use box_core::scheduler::BehaviorBox;
use embassy_time::{Duration, Instant, Ticker};

use super::{CHANNELS, SAMPLER};
use crate::hw::RNG_SEED;
use crate::hw::io::BoardIo;
use crate::status;
use crate::telemetry::UartSink;

/// Record queues are sized for the G0's RAM rather than the host default.
const REPORT_CAPACITY: usize = 512;
const TRIAL_CAPACITY: usize = 64;
/// Ticks between status summaries on the debug probe.
const STATUS_EVERY_TICKS: u32 = 60_000;

type Runner = BehaviorBox<UartSink, REPORT_CAPACITY, TRIAL_CAPACITY>;

/// Embassy's monotonic timer as the core clock.
struct EmbassyClock;

impl MonotonicClock for EmbassyClock {
    fn now(&self) -> BoxInstant {
        BoxInstant::from_micros(Instant::now().as_micros())
    }
}

#[embassy_executor::task]
pub async fn run(mut io: BoardIo, config: BoxConfig, sink: UartSink) -> ! {
    let mut runner = Runner::new(config, sink, RNG_SEED);
    runner.context_mut().install_default_alarms();

    let codes = SAMPLER.lock(|sampler| sampler.borrow().bank().channel_codes());
    runner.start(&mut io, &codes);

    let commands = CHANNELS.command_receiver();
    let events = CHANNELS.event_receiver();
    let mut ticker = Ticker::every(Duration::from_millis(1));
    let mut last_state = runner.current_state();
    let mut ticks = 0_u32;

    loop {
        while let Ok(line) = commands.try_receive() {
            if let Err(error) = runner.handle_line(&mut io, &line) {
                defmt::warn!(
                    "scheduler: ignored host line {=str}: {}",
                    line.as_str(),
                    defmt::Display2Format(&error)
                );
            }
        }
        while let Ok(event) = events.try_receive() {
            runner.ingest(&mut io, event);
        }

        runner.tick(&EmbassyClock, &mut io);

        let ctx = runner.context();
        status::publish_machine_start(ctx.machine_started().as_millis());
        if ctx.wall.is_synced() && !status::clock_synced() {
            status::set_clock_synced(true);
            defmt::info!("scheduler: clock synced, unix={=u64}", ctx.unix_now());
        }

        let state = runner.current_state();
        if state != last_state {
            defmt::info!(
                "scheduler: {} -> {}",
                defmt::Display2Format(&last_state),
                defmt::Display2Format(&state)
            );
            last_state = state;
        }

        ticks = ticks.wrapping_add(1);
        if ticks % STATUS_EVERY_TICKS == 0 {
            let snapshot = status::snapshot();
            defmt::info!(
                "status: synced={=bool} dropped_lines={=u32} dropped_events={=u32} overruns={=u32} reports_lost={=u32}",
                snapshot.clock_synced,
                snapshot.dropped_lines,
                snapshot.dropped_events,
                snapshot.sampler_overruns,
                ctx.report_overflows()
            );
        }

        ticker.next().await;
    }
}
