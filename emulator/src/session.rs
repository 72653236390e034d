use std::cell::{Cell, RefCell};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use box_core::analog::{SaveMode, TriggerDirection};
use box_core::clock::{Instant, MonotonicClock};
use box_core::config::BoxConfig;
use box_core::digital::{InputLine, OutputLine};
use box_core::hardware::{BoxIo, SimulatedIo};
use box_core::sampler::AnalogSampler;
use box_core::scheduler::{BehaviorBox, BoxEvent};
use box_core::telemetry::{SerialPort, SerialSink};

/// Report queue sized like the firmware's rather than the 3000-record default.
const REPORT_CAPACITY: usize = 1_024;
const TRIAL_CAPACITY: usize = 256;
/// Press length when `poke1`/`poke2`/`lick` get no duration.
const DEFAULT_PRESS: Duration = Duration::from_millis(100);
const RNG_SEED: u64 = 7;
/// Emulated lever channel, matching the board's only analog input.
const LEVER_CODE: i32 = 18;

pub const HELP_TOPICS: &[(&str, &str)] = &[
    ("run", "run <duration>              - advance emulated time (e.g. 250ms, 5s, 2m, 1h)"),
    ("sync", "sync [unix-seconds]         - send the T line (defaults to the host clock)"),
    ("poke1", "poke1 [duration]            - break nosepoke 1 for a while"),
    ("poke2", "poke2 [duration]            - break nosepoke 2 for a while"),
    ("lick", "lick [duration]             - touch the lick spout for a while"),
    ("lever", "lever <volts>               - set the lever channel voltage"),
    (
        "trigger",
        "trigger <rising|falling> <volts> [save] - arm a lever trigger",
    ),
    ("status", "status                      - show the scheduler registers"),
    ("host", "T… / G / S… / A…            - raw host lines are passed straight through"),
    ("help", "help [topic]                - show help for a command"),
];

/// Emulated monotonic time, advanced one millisecond per scheduler tick.
#[derive(Debug, Default)]
pub struct VirtualClock(Cell<Instant>);

impl VirtualClock {
    fn advance(&self) -> Instant {
        let next = Instant::from_millis(self.0.get().as_millis() + 1);
        self.0.set(next);
        next
    }
}

impl MonotonicClock for VirtualClock {
    fn now(&self) -> Instant {
        self.0.get()
    }
}

/// Collects every line the box writes until the session drains it.
#[derive(Clone, Debug, Default)]
pub struct HostSink {
    lines: Rc<RefCell<Vec<(SerialPort, String)>>>,
}

impl HostSink {
    fn drain(&self) -> Vec<(SerialPort, String)> {
        self.lines.borrow_mut().drain(..).collect()
    }
}

impl SerialSink for HostSink {
    fn write_line(&self, port: SerialPort, line: &str) {
        self.lines.borrow_mut().push((port, line.to_owned()));
    }
}

/// One line of emulator output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Output {
    /// Written by the box on one of its serial ports.
    Box { port: SerialPort, line: String },
    /// Emulator chatter: acknowledgements, status, errors.
    Note(String),
}

impl Output {
    pub fn text(&self) -> &str {
        match self {
            Output::Box { line, .. } => line,
            Output::Note(note) => note,
        }
    }
}

pub struct Session {
    runner: Box<BehaviorBox<HostSink, REPORT_CAPACITY, TRIAL_CAPACITY>>,
    io: SimulatedIo,
    sampler: AnalogSampler,
    clock: VirtualClock,
    sink: HostSink,
    lever_volts: f32,
    analog_clears: u32,
    show_frames: bool,
    transcript: Option<TranscriptLogger>,
}

impl Session {
    pub fn new(show_frames: bool, transcript: Option<&Path>) -> io::Result<Self> {
        let sink = HostSink::default();
        let config = BoxConfig::default();
        let mut sampler = AnalogSampler::new(config.adc);
        sampler
            .bank_mut()
            .add_channel("LeverAI", LEVER_CODE, 0.02)
            .map_err(|error| io::Error::other(error.to_string()))?;

        let mut runner = Box::new(BehaviorBox::new(config, sink.clone(), RNG_SEED));
        runner.context_mut().install_default_alarms();
        let mut io = SimulatedIo::new();
        runner.start(&mut io, &sampler.bank().channel_codes());

        let transcript = transcript.map(TranscriptLogger::create).transpose()?;

        Ok(Self {
            runner,
            io,
            sampler,
            clock: VirtualClock::default(),
            sink,
            lever_volts: 0.0,
            analog_clears: 0,
            show_frames,
            transcript,
        })
    }

    /// Lines produced so far, typically the boot banner.
    pub fn take_output(&mut self) -> io::Result<Vec<Output>> {
        self.collect(Vec::new())
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<Output>> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Ok(Vec::new());
        };
        let rest: Vec<&str> = words.collect();

        let notes = match head {
            "help" => help(rest.first().copied()),
            "run" => match rest.first().map(|value| parse_duration(value)) {
                Some(Ok(duration)) => {
                    self.run_for(duration);
                    Vec::new()
                }
                Some(Err(error)) => vec![error],
                None => vec!["run needs a duration".to_owned()],
            },
            "sync" => self.sync(rest.first().copied()),
            "poke1" => self.press(InputLine::Nosepoke1, rest.first().copied()),
            "poke2" => self.press(InputLine::Nosepoke2, rest.first().copied()),
            "lick" => self.press(InputLine::Lick, rest.first().copied()),
            "lever" => self.set_lever(rest.first().copied()),
            "trigger" => self.arm_trigger(&rest),
            "status" => vec![self.status()],
            _ if head.starts_with(['T', 'A', 'G', 'S']) => self.pass_through(line),
            _ => vec![format!("Unknown command `{head}`; type `help`")],
        };
        if let Some(transcript) = self.transcript.as_mut() {
            transcript.command(self.clock.now(), line)?;
        }
        self.collect(notes)
    }

    fn collect(&mut self, notes: Vec<String>) -> io::Result<Vec<Output>> {
        let mut output: Vec<Output> = self
            .sink
            .drain()
            .into_iter()
            .filter(|(port, line)| {
                self.show_frames || *port == SerialPort::Primary || !line.starts_with("A,")
            })
            .map(|(port, line)| Output::Box { port, line })
            .collect();
        output.extend(notes.into_iter().map(Output::Note));

        if let Some(transcript) = self.transcript.as_mut() {
            for item in &output {
                transcript.line(self.clock.now(), item.text())?;
            }
        }
        Ok(output)
    }

    fn pass_through(&mut self, line: &str) -> Vec<String> {
        match self.runner.handle_line(&mut self.io, line) {
            Ok(_) => Vec::new(),
            Err(error) => vec![format!("box ignored `{line}`: {error}")],
        }
    }

    fn sync(&mut self, value: Option<&str>) -> Vec<String> {
        let unix = match value {
            Some(text) => match text.parse::<u64>() {
                Ok(unix) => unix,
                Err(_) => return vec![format!("`{text}` is not a unix timestamp")],
            },
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |elapsed| elapsed.as_secs()),
        };
        self.pass_through(&format!("T{unix}"))
    }

    fn press(&mut self, line: InputLine, value: Option<&str>) -> Vec<String> {
        let duration = match value.map(parse_duration) {
            Some(Ok(duration)) => duration,
            Some(Err(error)) => return vec![error],
            None => DEFAULT_PRESS,
        };
        let edge = self.io.activate(line, self.elapsed_ms());
        self.runner.ingest(&mut self.io, BoxEvent::Input(edge));
        self.run_for(duration);
        let edge = self.io.release(line, self.elapsed_ms());
        self.runner.ingest(&mut self.io, BoxEvent::Input(edge));
        // one more tick flushes the release report
        self.run_for(Duration::from_millis(1));
        Vec::new()
    }

    fn set_lever(&mut self, value: Option<&str>) -> Vec<String> {
        match value.map(str::parse::<f32>) {
            Some(Ok(volts)) => {
                self.lever_volts = volts;
                Vec::new()
            }
            _ => vec!["lever needs a voltage".to_owned()],
        }
    }

    fn arm_trigger(&mut self, args: &[&str]) -> Vec<String> {
        let direction = match args.first().copied() {
            Some("rising") => TriggerDirection::Rising,
            Some("falling") => TriggerDirection::Falling,
            _ => return vec!["trigger needs `rising` or `falling`".to_owned()],
        };
        let Some(Ok(volts)) = args.get(1).map(|value| value.parse::<f32>()) else {
            return vec!["trigger needs a threshold voltage".to_owned()];
        };
        let save = if args.get(2) == Some(&"save") {
            SaveMode::Save
        } else {
            SaveMode::NoSave
        };
        match self.sampler.bank_mut().enable_trigger(&self.sink, 0, direction, volts, save) {
            Ok(()) => Vec::new(),
            Err(error) => vec![format!("trigger rejected: {error}")],
        }
    }

    fn elapsed_ms(&self) -> u32 {
        self.clock.now().millis_since(self.runner.context().machine_started())
    }

    fn lever_reading(&self) -> u16 {
        let bin = self.sampler.bank().adc().volts_to_bin(self.lever_volts);
        u16::try_from(bin.max(0)).unwrap_or(u16::MAX)
    }

    /// Advances emulated time one millisecond at a time: sampler first, then
    /// the scheduler, the way the firmware interleaves them.
    pub fn run_for(&mut self, duration: Duration) {
        let steps = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        for _ in 0..steps {
            let now = self.clock.advance();
            let reading = self.lever_reading();
            let elapsed = self.elapsed_ms();
            let output = self.sampler.tick(elapsed, now.as_millis(), &[reading]);
            output.write_analog(&self.sink);
            for event in output.events {
                self.runner.ingest(&mut self.io, BoxEvent::Sampler(event));
            }

            self.runner.tick(&self.clock, &mut self.io);

            if self.io.analog_clears() != self.analog_clears {
                self.analog_clears = self.io.analog_clears();
                self.sampler.bank_mut().clear_all_triggered();
            }
        }
    }

    pub fn status(&self) -> String {
        let ctx = self.runner.context();
        let lights_on = ctx
            .config
            .logical_level(OutputLine::HouseRed, self.io.read_output(OutputLine::HouseRed));
        format!(
            "state={} depth={} protocol={} stage={} daily={} weekly={} lights={} synced={} t=+{:.3}s",
            self.runner.current_state(),
            self.runner.depth(),
            ctx.registers.current_protocol,
            ctx.current_stage(),
            ctx.daily_intake(),
            ctx.weekly_intake(),
            if lights_on { "on" } else { "off" },
            if ctx.wall.is_synced() { "yes" } else { "no" },
            Duration::from_millis(self.clock.now().as_millis()).as_secs_f64(),
        )
    }
}

fn help(topic: Option<&str>) -> Vec<String> {
    match topic {
        Some(topic) => HELP_TOPICS
            .iter()
            .find(|(name, _)| *name == topic)
            .map_or_else(
                || vec![format!("No help for `{topic}`")],
                |(_, text)| vec![(*text).to_owned()],
            ),
        None => HELP_TOPICS.iter().map(|(_, text)| (*text).to_owned()).collect(),
    }
}

/// Parses `250ms`, `5s`, `2m`, `1h` or a bare millisecond count.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("`{text}` is not a duration"))?;
    let millis = match unit {
        "" | "ms" => Some(value),
        "s" => value.checked_mul(1_000),
        "m" => value.checked_mul(60_000),
        "h" => value.checked_mul(3_600_000),
        _ => return Err(format!("unknown unit in `{text}`")),
    };
    millis
        .map(Duration::from_millis)
        .ok_or_else(|| format!("`{text}` is too long"))
}

/// Mirrors the session to a file, one line per output with emulated time.
struct TranscriptLogger {
    writer: BufWriter<File>,
}

impl TranscriptLogger {
    fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "# behavior box emulator transcript")?;
        Ok(Self { writer })
    }

    fn command(&mut self, at: Instant, line: &str) -> io::Result<()> {
        writeln!(self.writer, "[{:>10}] > {line}", at.as_millis())?;
        self.writer.flush()
    }

    fn line(&mut self, at: Instant, line: &str) -> io::Result<()> {
        writeln!(self.writer, "[{:>10}]   {line}", at.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 2024-01-01 12:00:00 UTC
    const NOON: u64 = 1_704_110_400;

    fn box_lines(output: &[Output]) -> Vec<&str> {
        output
            .iter()
            .filter_map(|item| match item {
                Output::Box {
                    port: SerialPort::Primary,
                    line,
                } => Some(line.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn durations_accept_common_units() {
        assert_eq!(parse_duration("250"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("5s"), Ok(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3_600)));
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn boot_waits_for_sync_then_lights_up() {
        let mut session = Session::new(false, None).expect("session");
        let boot = session.take_output().expect("boot output");
        assert!(
            box_lines(&boot)
                .iter()
                .any(|line| line.starts_with("I,Waiting for time sync"))
        );

        let synced = session.handle_command(&format!("sync {NOON}")).expect("sync");
        let lines = box_lines(&synced);
        assert!(lines.iter().any(|line| line.contains("HouseLightsOn")));
        session.run_for(Duration::from_millis(10));
        assert!(session.status().contains("lights=on"));
        assert!(session.status().contains("synced=yes"));
    }

    #[test]
    fn nosepokes_are_reported_and_licks_are_not() {
        let mut session = Session::new(false, None).expect("session");
        session.handle_command(&format!("sync {NOON}")).expect("sync");
        session.take_output().expect("drain");

        let poke = session.handle_command("poke2 50ms").expect("poke");
        let lines = box_lines(&poke);
        assert!(lines.iter().any(|line| line.starts_with("20,1,")));
        assert!(lines.iter().any(|line| line.starts_with("20,0,")));

        let lick = session.handle_command("lick 50ms").expect("lick");
        assert!(!box_lines(&lick).iter().any(|line| line.starts_with("25,")));
    }

    #[test]
    fn saving_trigger_marks_the_analog_stream() {
        let mut session = Session::new(false, None).expect("session");
        session
            .handle_command("trigger rising 1.0 save")
            .expect("arm trigger");
        session.run_for(Duration::from_millis(5));
        session.handle_command("lever 2.0").expect("lever");
        let output = session.handle_command("run 20").expect("run");

        assert!(output.contains(&Output::Box {
            port: SerialPort::Analog,
            line: "V,".to_owned(),
        }));
        assert!(
            !output
                .iter()
                .any(|item| item.text().starts_with("A,")),
            "frames are hidden unless asked for"
        );
        assert!(box_lines(&output).iter().any(|line| line.starts_with("99,18,")));
    }

    #[test]
    fn unknown_commands_are_explained() {
        let mut session = Session::new(false, None).expect("session");
        session.take_output().expect("boot output");
        let output = session.handle_command("dance").expect("dance");
        assert!(matches!(&output[..], [Output::Note(note)] if note.contains("Unknown command")));
    }
}
