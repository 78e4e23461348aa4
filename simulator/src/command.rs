//! Console grammar of the simulator.

use std::fmt;

use winnow::ascii::{dec_uint, space1};
use winnow::combinator::{alt, opt, preceded};
use winnow::error::ContextError;
use winnow::prelude::*;
use winnow::token::rest;

/// Measurement source the `stale` command freezes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StaleTarget {
    Base,
    Redundant,
    /// Both sources publish again.
    None,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command<'a> {
    /// Advance the scheduler by this many task periods.
    Step(u32),
    Status,
    Diag,
    /// Full console line, handed to the RTC time-set path unchanged.
    Time(&'a str),
    /// Fail the next `n` companion phase-1 attempts.
    FailSbc(u32),
    Stale(StaleTarget),
    /// Flag this many cells of string 0 invalid in both sources.
    CellsInvalid(u8),
    Help(Option<&'a str>),
    Exit,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommandError {
    pub offset: usize,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognised input at column {}", self.offset + 1)
    }
}

pub const HELP_TOPICS: &[(&str, &str)] = &[
    ("step", "step [n]                 - advance n task periods (default 1)"),
    ("status", "status                   - show state machines and pack values"),
    ("diag", "diag                     - list latched faults and recent reports"),
    ("time", "time YYYY-MM-DDTHH:MM:SS - set the real-time clock"),
    ("fail", "fail sbc <n>             - fail the next n companion init attempts"),
    ("stale", "stale <base|redundant|none> - stop one measurement source"),
    ("cells", "cells invalid <n>        - flag n cells of string 0 invalid"),
    ("help", "help [topic]             - show help for a command"),
    ("exit", "exit                     - leave the simulator"),
];

/// Parses one trimmed console line.
pub fn parse_command(line: &str) -> Result<Command<'_>, CommandError> {
    command
        .parse(line.trim())
        .map_err(|error| CommandError {
            offset: error.offset(),
        })
}

fn command<'a>(input: &mut &'a str) -> Result<Command<'a>, ContextError> {
    alt((
        step,
        "status".value(Command::Status),
        "diag".value(Command::Diag),
        time,
        fail_sbc,
        stale,
        cells_invalid,
        help,
        alt(("exit", "quit")).value(Command::Exit),
    ))
    .parse_next(input)
}

fn step<'a>(input: &mut &'a str) -> Result<Command<'a>, ContextError> {
    preceded("step", opt(preceded(space1, dec_uint)))
        .map(|count: Option<u32>| Command::Step(count.unwrap_or(1)))
        .parse_next(input)
}

fn time<'a>(input: &mut &'a str) -> Result<Command<'a>, ContextError> {
    let line = *input;
    ("time", space1, rest)
        .map(|_| Command::Time(line))
        .parse_next(input)
}

fn fail_sbc<'a>(input: &mut &'a str) -> Result<Command<'a>, ContextError> {
    preceded(("fail", space1, "sbc", space1), dec_uint)
        .map(Command::FailSbc)
        .parse_next(input)
}

fn stale<'a>(input: &mut &'a str) -> Result<Command<'a>, ContextError> {
    preceded(
        ("stale", space1),
        alt((
            "base".value(StaleTarget::Base),
            "redundant".value(StaleTarget::Redundant),
            "none".value(StaleTarget::None),
        )),
    )
    .map(Command::Stale)
    .parse_next(input)
}

fn cells_invalid<'a>(input: &mut &'a str) -> Result<Command<'a>, ContextError> {
    preceded(("cells", space1, "invalid", space1), dec_uint)
        .map(Command::CellsInvalid)
        .parse_next(input)
}

fn help<'a>(input: &mut &'a str) -> Result<Command<'a>, ContextError> {
    preceded("help", opt(preceded(space1, rest)))
        .map(|topic: Option<&'a str>| Command::Help(topic.filter(|topic| !topic.is_empty())))
        .parse_next(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_command() {
        assert_eq!(parse_command("step"), Ok(Command::Step(1)));
        assert_eq!(parse_command("step 25"), Ok(Command::Step(25)));
        assert_eq!(parse_command("status"), Ok(Command::Status));
        assert_eq!(parse_command("diag"), Ok(Command::Diag));
        assert_eq!(
            parse_command("time 2026-10-18T12:00:00"),
            Ok(Command::Time("time 2026-10-18T12:00:00"))
        );
        assert_eq!(parse_command("fail sbc 4"), Ok(Command::FailSbc(4)));
        assert_eq!(
            parse_command("stale redundant"),
            Ok(Command::Stale(StaleTarget::Redundant))
        );
        assert_eq!(parse_command("cells invalid 6"), Ok(Command::CellsInvalid(6)));
        assert_eq!(parse_command("help"), Ok(Command::Help(None)));
        assert_eq!(parse_command("help stale"), Ok(Command::Help(Some("stale"))));
        assert_eq!(parse_command("  exit "), Ok(Command::Exit));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse_command("step 3x").is_err());
        assert!(parse_command("stale both").is_err());
        assert!(parse_command("cells invalid 300").is_err());
        assert!(parse_command("reboot").is_err());
    }
}
