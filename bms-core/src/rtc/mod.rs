//! Time-set requests for the real-time clock.
//!
//! An operator sets the clock from the debug console with
//! `time YYYY-MM-DDTHH:MM:SS`. The console task assembles the line, parses it
//! here, and hands the request to the RTC task through a [`TimeSetQueue`].
//! The hand-off never blocks: when the queue is full the request is dropped
//! and the caller is told so.

use core::fmt;
use core::str;

use heapless::Vec;
use winnow::ascii::space1;
use winnow::combinator::preceded;
use winnow::error::ContextError;
use winnow::prelude::*;
use winnow::token::{one_of, take_while};

/// Maximum number of bytes accepted on a console line (excluding terminator).
pub const MAX_LINE_LEN: usize = 48;

/// Calendar date and wall-clock time to load into the RTC.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimeSetRequest {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// Field that failed range validation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimeField {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

impl fmt::Display for TimeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TimeField::Year => "year",
            TimeField::Month => "month",
            TimeField::Day => "day",
            TimeField::Hour => "hour",
            TimeField::Minute => "minute",
            TimeField::Second => "second",
        };
        f.write_str(label)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimeSetError {
    /// The text is not `YYYY-MM-DDTHH:MM:SS`.
    Syntax,
    OutOfRange(TimeField),
    /// The RTC task has not drained the previous requests yet.
    QueueFull,
}

impl fmt::Display for TimeSetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSetError::Syntax => f.write_str("expected YYYY-MM-DDTHH:MM:SS"),
            TimeSetError::OutOfRange(field) => write!(f, "{field} out of range"),
            TimeSetError::QueueFull => f.write_str("time-set queue full"),
        }
    }
}

/// Earliest year the RTC calendar can hold.
pub const MIN_YEAR: u16 = 2000;
/// Latest year the RTC calendar can hold.
pub const MAX_YEAR: u16 = 2099;

const fn is_leap_year(year: u16) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

const fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        2 if is_leap_year(year) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

impl TimeSetRequest {
    /// Parses and range-checks a timestamp.
    pub fn parse(text: &str) -> Result<Self, TimeSetError> {
        timestamp
            .parse(text.trim())
            .map_err(|_| TimeSetError::Syntax)?
            .validate()
    }

    /// Checks every field against the calendar.
    pub fn validate(self) -> Result<Self, TimeSetError> {
        if !(MIN_YEAR..=MAX_YEAR).contains(&self.year) {
            return Err(TimeSetError::OutOfRange(TimeField::Year));
        }
        if !(1..=12).contains(&self.month) {
            return Err(TimeSetError::OutOfRange(TimeField::Month));
        }
        if self.day == 0 || self.day > days_in_month(self.year, self.month) {
            return Err(TimeSetError::OutOfRange(TimeField::Day));
        }
        if self.hour > 23 {
            return Err(TimeSetError::OutOfRange(TimeField::Hour));
        }
        if self.minute > 59 {
            return Err(TimeSetError::OutOfRange(TimeField::Minute));
        }
        if self.second > 59 {
            return Err(TimeSetError::OutOfRange(TimeField::Second));
        }
        Ok(self)
    }

    /// ISO weekday of the date, 1 = Monday through 7 = Sunday.
    #[must_use]
    pub fn weekday(&self) -> u8 {
        const OFFSETS: [u16; 12] = [0, 3, 2, 5, 0, 3, 5, 1, 4, 6, 2, 4];
        let year = if self.month < 3 {
            self.year.saturating_sub(1)
        } else {
            self.year
        };
        let index = usize::from(self.month.clamp(1, 12) - 1);
        let sum = year + year / 4 - year / 100 + year / 400 + OFFSETS[index] + u16::from(self.day);
        match sum % 7 {
            0 => 7,
            // remainder is below 7
            day => u8::try_from(day).unwrap_or(7),
        }
    }
}

impl fmt::Display for TimeSetRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Fixed-width decimal field.
fn digits<'a>(count: usize) -> impl Parser<&'a str, u16, ContextError> {
    take_while(count, |c: char| c.is_ascii_digit()).map(|digits: &str| {
        digits
            .bytes()
            .fold(0u16, |value, digit| value * 10 + u16::from(digit - b'0'))
    })
}

/// Two-digit field narrowed to `u8`.
fn pair<'a>() -> impl Parser<&'a str, u8, ContextError> {
    // two decimal digits never exceed 99
    digits(2).map(|value| u8::try_from(value).unwrap_or(u8::MAX))
}

fn timestamp(input: &mut &str) -> Result<TimeSetRequest, ContextError> {
    let (year, _, month, _, day, _, hour, _, minute, _, second) = (
        digits(4),
        '-',
        pair(),
        '-',
        pair(),
        one_of(['T', ' ']),
        pair(),
        ':',
        pair(),
        ':',
        pair(),
    )
        .parse_next(input)?;

    Ok(TimeSetRequest {
        year,
        month,
        day,
        hour,
        minute,
        second,
    })
}

/// Parses a console line of the form `time <timestamp>`.
pub fn parse_time_command(line: &str) -> Result<TimeSetRequest, TimeSetError> {
    preceded(("time", space1), timestamp)
        .parse(line.trim())
        .map_err(|_| TimeSetError::Syntax)?
        .validate()
}

/// Non-blocking hand-off to the RTC task.
pub trait TimeSetQueue {
    /// Queues `request` without waiting; a full queue yields
    /// [`TimeSetError::QueueFull`].
    fn try_submit(&self, request: TimeSetRequest) -> Result<(), TimeSetError>;
}

impl<T> TimeSetQueue for &T
where
    T: TimeSetQueue + ?Sized,
{
    fn try_submit(&self, request: TimeSetRequest) -> Result<(), TimeSetError> {
        (**self).try_submit(request)
    }
}

/// Errors surfaced while assembling console lines.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConsoleError {
    InvalidUtf8,
    LineOverflow,
    TimeSet(TimeSetError),
}

impl From<TimeSetError> for ConsoleError {
    fn from(error: TimeSetError) -> Self {
        Self::TimeSet(error)
    }
}

impl fmt::Display for ConsoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleError::InvalidUtf8 => f.write_str("line is not valid UTF-8"),
            ConsoleError::LineOverflow => f.write_str("line too long"),
            ConsoleError::TimeSet(error) => write!(f, "{error}"),
        }
    }
}

/// Line-oriented debug console that forwards time-set commands.
pub struct ConsoleSession<Q> {
    queue: Q,
    buffer: Vec<u8, MAX_LINE_LEN>,
}

impl<Q> ConsoleSession<Q>
where
    Q: TimeSetQueue,
{
    pub const fn new(queue: Q) -> Self {
        Self {
            queue,
            buffer: Vec::new(),
        }
    }

    /// Feeds a single byte. A line terminator parses and submits the line.
    ///
    /// Returns the submitted request when a complete line was accepted.
    pub fn ingest(&mut self, byte: u8) -> Result<Option<TimeSetRequest>, ConsoleError> {
        match byte {
            b'\r' | b'\n' => self.process_line(),
            0x08 | 0x7f => {
                self.buffer.pop();
                Ok(None)
            }
            value => {
                if self.buffer.push(value).is_err() {
                    self.buffer.clear();
                    return Err(ConsoleError::LineOverflow);
                }
                Ok(None)
            }
        }
    }

    fn process_line(&mut self) -> Result<Option<TimeSetRequest>, ConsoleError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let result = str::from_utf8(self.buffer.as_slice())
            .map_err(|_| ConsoleError::InvalidUtf8)
            .and_then(|line| parse_time_command(line).map_err(ConsoleError::from));
        self.buffer.clear();

        let request = result?;
        self.queue.try_submit(request)?;
        Ok(Some(request))
    }
}
