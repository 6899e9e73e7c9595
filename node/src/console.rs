//! Line based stand-in for the push button and the potentiometer.
//!
//! An empty line (or `press`) is a falling edge of the button, a number sets the analog
//! input level.

use std::{fmt, io::BufRead, thread};

use tokio::sync::mpsc::{self, Receiver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Press,
    SetInput(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown command '{}', expected an empty line, 'press' or an input level",
            self.0
        )
    }
}

impl std::error::Error for UnknownCommand {}

pub fn parse_line(line: &str) -> Result<Command, UnknownCommand> {
    match line.trim() {
        "" | "p" | "press" => Ok(Command::Press),
        other => other
            .parse()
            .map(Command::SetInput)
            .map_err(|_| UnknownCommand(other.into())),
    }
}

/// Read stdin on a dedicated thread. The channel closes when stdin does.
pub fn spawn() -> std::io::Result<Receiver<Command>> {
    let (sender, receiver) = mpsc::channel(8);

    thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        log::error!("Could not read the console: {e}");
                        break;
                    }
                };

                match parse_line(&line) {
                    Ok(command) => {
                        if sender.blocking_send(command).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("{e}"),
                }
            }
            log::debug!("Console closed");
        })?;

    Ok(receiver)
}
