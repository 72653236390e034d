mod session;

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use box_core::telemetry::SerialPort;
use crossterm::style::Stylize;
use session::{Output, Session};

/// Command-line switches.
#[derive(Debug, Default)]
struct Options {
    plain: bool,
    frames: bool,
    transcript: Option<PathBuf>,
}

fn main() -> io::Result<()> {
    let options = parse_options().unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("Usage: behavior-box-emulator [--plain] [--frames] [--transcript <path>]");
        process::exit(2);
    });

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut session = Session::new(options.frames, options.transcript.as_deref())?;
    let mut line = String::new();

    writeln!(
        writer,
        "Behavior box emulator ready. Type `help` for commands or `exit` to quit."
    )?;
    print_output(&mut writer, &session.take_output()?, options.plain)?;

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        let output = session.handle_command(trimmed)?;
        print_output(&mut writer, &output, options.plain)?;
    }

    Ok(())
}

fn print_output<W: Write>(writer: &mut W, output: &[Output], plain: bool) -> io::Result<()> {
    for item in output {
        match item {
            Output::Note(note) => writeln!(writer, "{note}")?,
            Output::Box { port, line } if plain => {
                writeln!(writer, "{}{line}", port_prefix(*port))?;
            }
            Output::Box { port, line } => {
                let prefix = port_prefix(*port);
                if line.starts_with("E,") {
                    writeln!(writer, "{prefix}{}", line.as_str().red())?;
                } else if line.starts_with("I,") {
                    writeln!(writer, "{prefix}{}", line.as_str().cyan())?;
                } else if *port == SerialPort::Analog {
                    writeln!(writer, "{prefix}{}", line.as_str().dark_grey())?;
                } else {
                    writeln!(writer, "{prefix}{line}")?;
                }
            }
        }
    }
    Ok(())
}

const fn port_prefix(port: SerialPort) -> &'static str {
    match port {
        SerialPort::Primary => "",
        SerialPort::Analog => "~ ",
    }
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn parse_options() -> Result<Options, String> {
    let mut options = Options::default();
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--plain" => options.plain = true,
            "--frames" => options.frames = true,
            "--transcript" => {
                let path = args
                    .next()
                    .ok_or_else(|| "Expected a path after --transcript".to_string())?;
                options.transcript = Some(PathBuf::from(path));
            }
            other => {
                if let Some(path) = other.strip_prefix("--transcript=") {
                    options.transcript = Some(PathBuf::from(path));
                } else {
                    return Err(format!("Unknown argument `{other}`"));
                }
            }
        }
    }
    Ok(options)
}
