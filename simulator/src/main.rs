mod command;
mod plant;
mod session;

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use command::{Command, parse_command};
use session::{Profile, Session};

struct Options {
    profile: Profile,
    transcript: Option<PathBuf>,
}

fn main() -> io::Result<()> {
    let options = parse_options().unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!(
            "Usage: bms-simulator [--profile <nominal|cold-rtc|no-current-sensor>] [--transcript <path>]"
        );
        process::exit(2);
    });

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut session = Session::new(options.profile, options.transcript.as_deref())?;
    let mut line = String::new();

    writeln!(
        writer,
        "BMS simulator ready. Type `help` for commands or `exit` to quit."
    )?;

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

        let terminate = parse_command(trimmed) == Ok(Command::Exit);
        for response in session.handle_command(trimmed)? {
            writeln!(writer, "{response}")?;
        }
        if terminate {
            break;
        }
    }

    Ok(())
}

fn parse_options() -> Result<Options, String> {
    let mut options = Options {
        profile: Profile::Nominal,
        transcript: None,
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some(value) = arg.strip_prefix("--profile=") {
            options.profile = Profile::from_tag(value)?;
        } else if arg == "--profile" {
            let value = args.next().ok_or("Expected value after --profile")?;
            options.profile = Profile::from_tag(&value)?;
        } else if arg == "--transcript" {
            let value = args.next().ok_or("Expected path after --transcript")?;
            options.transcript = Some(PathBuf::from(value));
        } else {
            options.profile = Profile::from_tag(&arg)?;
        }
    }
    Ok(options)
}
