use std::cell::{Cell, RefCell};

use box_core::clock::{Instant, MonotonicClock};
use box_core::config::BoxConfig;
use box_core::hardware::SimulatedIo;
use box_core::protocol::{ProtocolTable, StageEntry, StateId};
use box_core::scheduler::{BehaviorBox, SchedulerContext};
use box_core::telemetry::{SerialPort, SerialSink};

/// 2024-01-01 00:00:00 UTC
const NEW_YEAR: u64 = 1_704_067_200;

fn at(hour: u64, minute: u64, second: u64) -> u64 {
    NEW_YEAR + hour * 3_600 + minute * 60 + second
}

#[derive(Default)]
struct Recorder {
    lines: RefCell<Vec<(SerialPort, String)>>,
}

impl SerialSink for Recorder {
    fn write_line(&self, port: SerialPort, line: &str) {
        self.lines.borrow_mut().push((port, line.to_owned()));
    }
}

impl Recorder {
    fn primary(&self) -> Vec<String> {
        self.lines
            .borrow()
            .iter()
            .filter(|(port, _)| *port == SerialPort::Primary)
            .map(|(_, line)| line.clone())
            .collect()
    }

    fn events(&self, code: i32) -> usize {
        self.primary()
            .iter()
            .filter(|line| {
                line.split(',')
                    .next()
                    .and_then(|field| field.parse::<i32>().ok())
                    == Some(code)
            })
            .count()
    }
}

struct TestClock(Cell<Instant>);

impl MonotonicClock for TestClock {
    fn now(&self) -> Instant {
        self.0.get()
    }
}

type Runner<'a> = BehaviorBox<&'a Recorder, 1_024, 128>;

fn boot(sink: &Recorder, unix_seconds: u64) -> (Runner<'_>, SimulatedIo, TestClock) {
    let mut runner = Runner::new(BoxConfig::default(), sink, 42);
    let mut io = SimulatedIo::new();
    runner.context_mut().install_default_alarms();
    runner.start(&mut io, &[18]);
    let line = format!("T{unix_seconds}");
    runner
        .handle_line(&mut io, &line)
        .expect("time sync parses");
    (runner, io, TestClock(Cell::new(Instant::ZERO)))
}

fn run_for(runner: &mut Runner<'_>, io: &mut SimulatedIo, clock: &TestClock, millis: u64) {
    for _ in 0..millis {
        let next = clock.0.get().as_millis() + 1;
        clock.0.set(Instant::from_millis(next));
        runner.tick(clock, io);
    }
}

#[test]
fn boot_prints_lights_and_channel_list() {
    let sink = Recorder::default();
    let (_runner, _io, _clock) = boot(&sink, at(18, 59, 0));

    let lines = sink.lines.borrow();
    assert!(lines.contains(&(SerialPort::Analog, "P,18".to_owned())));
    assert!(
        lines
            .iter()
            .any(|(_, line)| line.starts_with("I,") && line.contains("HouseLightsOff")),
        "evening boot should pick the lights-off machine"
    );
}

#[test]
fn training_alarm_starts_the_session_machine() {
    let sink = Recorder::default();
    let (mut runner, mut io, clock) = boot(&sink, at(18, 59, 58));

    run_for(&mut runner, &mut io, &clock, 1_500);
    assert_eq!(runner.current_state(), StateId::DoNothing);
    assert_eq!(sink.events(71), 0);

    run_for(&mut runner, &mut io, &clock, 1_000);
    assert_eq!(sink.events(71), 1);
    assert_eq!(sink.events(72), 1);
    // the start slot runs first
    assert_eq!(runner.current_state(), StateId::BlinkLightsToneWater);
    assert_eq!(runner.depth(), 2);

    run_for(&mut runner, &mut io, &clock, 15_000);
    assert_eq!(runner.current_state(), StateId::NosepokeImpure);
    assert_eq!(runner.depth(), 1);
    assert_eq!(sink.events(83), 2, "one probability line per port");
    assert_eq!(runner.context().session.block_id, 1);
}

#[test]
fn disable_alarm_closes_a_running_session() {
    let sink = Recorder::default();
    let (mut runner, mut io, clock) = boot(&sink, at(19, 39, 50));
    runner.context_mut().registers.current_state = StateId::NosepokeImpure;

    run_for(&mut runner, &mut io, &clock, 5_000);
    assert_eq!(runner.current_state(), StateId::NosepokeImpure);

    run_for(&mut runner, &mut io, &clock, 6_000);
    assert_eq!(sink.events(111), 1);
    assert_eq!(sink.events(121), 1);
    assert_eq!(sink.events(63), 1);
    assert_eq!(sink.events(72), 1);
    assert_eq!(runner.current_state(), StateId::DoNothing);
}

#[test]
fn disable_alarm_leaves_the_idle_machine_alone() {
    let sink = Recorder::default();
    let (mut runner, mut io, clock) = boot(&sink, at(19, 39, 58));

    run_for(&mut runner, &mut io, &clock, 4_000);
    assert_eq!(runner.current_state(), StateId::DoNothing);
    assert_eq!(sink.events(62), 0);
    assert!(!runner.context().stop_requested());
}

#[test]
fn globals_and_session_params_round_trip_through_the_host() {
    let sink = Recorder::default();
    let (mut runner, mut io, _clock) = boot(&sink, at(12, 0, 0));

    runner
        .handle_line(&mut io, "S0,2,150,700")
        .expect("session params parse");
    runner.handle_line(&mut io, "G").expect("globals parse");
    assert!(sink.primary().contains(&"G,0,2,150,700".to_owned()));
}

#[test]
fn stage_advance_is_idempotent_at_the_last_stage() {
    let mut ctx: SchedulerContext<_, 16, 4> =
        SchedulerContext::new(BoxConfig::default(), box_core::telemetry::NullSink, 0);
    ctx.table = ProtocolTable::standard().with_stage(
        0,
        1,
        StageEntry::new(StateId::Nosepoke1sound, StateId::DoNothing),
    );

    ctx.advance_stage(true);
    assert_eq!(ctx.current_stage(), 1);
    assert_eq!(ctx.registers.next_state, StateId::Nosepoke1sound);

    for _ in 0..3 {
        ctx.advance_stage(true);
        assert_eq!(ctx.current_stage(), 1);
        assert_eq!(ctx.registers.next_state, StateId::Nosepoke1sound);
    }
}

#[test]
fn report_queue_rejects_the_record_past_capacity() {
    use box_core::telemetry::ReportEvent;

    let sink = Recorder::default();
    let mut ctx: SchedulerContext<&Recorder, 3_000, 4> =
        SchedulerContext::new(BoxConfig::default(), &sink, 0);

    for value in 0..3_000 {
        ctx.report(ReportEvent::Heartbeat, value);
    }
    assert_eq!(ctx.report_overflows(), 0);
    assert!(sink.primary().is_empty());

    ctx.report(ReportEvent::Heartbeat, 3_000);
    assert_eq!(ctx.pending_reports(), 3_000);
    assert_eq!(ctx.report_overflows(), 1);
    let lines = sink.primary();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("E,") && lines[0].contains("is full"));

    // A frozen clock never exhausts the housekeeping budget.
    let clock = TestClock(Cell::new(Instant::ZERO));
    ctx.housekeeping(&clock);
    assert_eq!(ctx.pending_reports(), 0);

    let drained: Vec<i32> = sink
        .primary()
        .iter()
        .filter(|line| !line.starts_with("E,"))
        .map(|line| {
            line.split(',')
                .nth(1)
                .and_then(|field| field.parse().ok())
                .expect("record value column")
        })
        .collect();
    assert_eq!(drained, (0..3_000).collect::<Vec<i32>>());
}
