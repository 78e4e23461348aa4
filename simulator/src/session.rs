use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant as HostInstant};

use bms_core::database::{MeasurementDatabase, MeasurementSource, SharedDatabase};
use bms_core::diag::{DiagId, DiagScope, DiagnosisLog};
use bms_core::fsm::{RequestStatus, StateMachine};
use bms_core::redundancy::{RedundancyValidator, ValidatorConfig};
use bms_core::rtc::{ConsoleSession, TimeSetRequest};
use bms_core::sbc::{Sbc, SbcConfig, SbcMailbox, SbcState};
use bms_core::sys::{Sys, SysConfig, SysMailbox, SysRequest, SysState};
use bms_core::time::{ManualClock, TickSource, duration_to_millis};

use crate::command::{Command, HELP_TOPICS, StaleTarget, parse_command};
use crate::plant::{SimAfe, SimCompanion, SimRtcQueue, SimServices};

const DIAG_DEPTH: usize = 64;
const RTC_QUEUE_DEPTH: usize = 2;
/// Reports shown by `diag`.
const RECENT_REPORTS: usize = 8;
/// Tick counter value at power-up; zero would read as "never written".
const BOOT_TICK_MS: u32 = 1;

/// Initial collaborator behaviour.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Profile {
    /// Every collaborator is healthy and the RTC holds a valid time.
    Nominal,
    /// The RTC lost its time; boot waits for a `time` command.
    ColdRtc,
    /// No current sensor answers; boot times out in pre-running.
    NoCurrentSensor,
}

impl Profile {
    pub fn from_tag(tag: &str) -> Result<Self, String> {
        if tag.eq_ignore_ascii_case("nominal") {
            Ok(Self::Nominal)
        } else if tag.eq_ignore_ascii_case("cold-rtc") {
            Ok(Self::ColdRtc)
        } else if tag.eq_ignore_ascii_case("no-current-sensor") {
            Ok(Self::NoCurrentSensor)
        } else {
            Err(format!("Unknown profile `{tag}`"))
        }
    }

    const fn rtc_ready(self) -> bool {
        !matches!(self, Profile::ColdRtc)
    }

    const fn current_sensor_present(self) -> bool {
        !matches!(self, Profile::NoCurrentSensor)
    }
}

/// Shared state the machines borrow for the whole run.
struct World {
    sys_mailbox: SysMailbox,
    sbc_mailbox: SbcMailbox,
    database: SharedDatabase,
    diag: DiagnosisLog<DIAG_DEPTH>,
    clock: ManualClock,
    rtc_queue: SimRtcQueue,
}

type SimDiag = &'static DiagnosisLog<DIAG_DEPTH>;
type SimClock = &'static ManualClock;

pub struct Session {
    world: &'static World,
    sys: Sys<'static, SimServices, SimDiag, SimClock>,
    sbc: Sbc<'static, SimCompanion>,
    validator: RedundancyValidator<&'static SharedDatabase, SimDiag, SimClock>,
    console: ConsoleSession<&'static SimRtcQueue>,
    afe: SimAfe,
    rtc_time: Option<TimeSetRequest>,
    period_ms: u32,
    transcript: Option<TranscriptLogger>,
    started_at: HostInstant,
}

impl Session {
    pub fn new(profile: Profile, transcript: Option<&Path>) -> io::Result<Self> {
        let world: &'static World = Box::leak(Box::new(World {
            sys_mailbox: SysMailbox::new(),
            sbc_mailbox: SbcMailbox::new(),
            database: SharedDatabase::new(),
            diag: DiagnosisLog::new(),
            clock: ManualClock::new(BOOT_TICK_MS),
            rtc_queue: SimRtcQueue::new(RTC_QUEUE_DEPTH),
        }));

        let config = SysConfig::default();
        let period_ms = duration_to_millis(config.task_period);
        let sys = Sys::new(
            &world.sys_mailbox,
            &world.sbc_mailbox,
            SimServices::new(profile.rtc_ready(), profile.current_sensor_present()),
            &world.diag,
            &world.clock,
            config,
        );
        let sbc = Sbc::new(&world.sbc_mailbox, SimCompanion::new(), SbcConfig::default());
        let mut validator = RedundancyValidator::new(
            &world.database,
            &world.diag,
            &world.clock,
            ValidatorConfig::default(),
        );
        validator
            .initialize()
            .map_err(|error| io::Error::other(error.to_string()))?;

        let transcript = transcript.map(TranscriptLogger::new).transpose()?;

        Ok(Self {
            world,
            sys,
            sbc,
            validator,
            console: ConsoleSession::new(&world.rtc_queue),
            afe: SimAfe::new(profile.current_sensor_present()),
            rtc_time: None,
            period_ms,
            transcript,
            started_at: HostInstant::now(),
        })
    }

    pub fn sys_state(&self) -> SysState {
        self.sys.state()
    }

    pub fn sbc_state(&self) -> SbcState {
        self.sbc.state()
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let elapsed = self.started_at.elapsed();
        self.record(elapsed, TranscriptRole::Host, trimmed)?;

        let lines = match parse_command(trimmed) {
            Ok(Command::Step(count)) => self.step(count),
            Ok(Command::Status) => self.status(),
            Ok(Command::Diag) => self.diag(),
            Ok(Command::Time(line)) => self.set_time(line),
            Ok(Command::FailSbc(count)) => self.fail_sbc(count),
            Ok(Command::Stale(target)) => self.stale(target),
            Ok(Command::CellsInvalid(count)) => self.cells_invalid(count),
            Ok(Command::Help(topic)) => help(topic),
            Ok(Command::Exit) => vec!["Session closed.".to_string()],
            Err(error) => vec![format!("ERR syntax {error}")],
        };

        for line in &lines {
            self.record(elapsed, TranscriptRole::Simulator, line)?;
        }
        Ok(lines)
    }

    fn step(&mut self, count: u32) -> Vec<String> {
        let mut lines = Vec::new();
        for _ in 0..count {
            self.step_once(&mut lines);
        }
        lines.push(format!(
            "t={}ms sys={} sbc={}",
            self.world.clock.now().as_millis(),
            self.sys.state(),
            self.sbc.state()
        ));
        lines
    }

    /// One task period: RTC, measurement, the two machines, then validation.
    fn step_once(&mut self, lines: &mut Vec<String>) {
        let world = self.world;
        world.clock.advance(self.period_ms);
        let now = world.clock.now();

        while let Some(request) = world.rtc_queue.pop() {
            self.rtc_time = Some(request);
            self.sys.services_mut().rtc_ready = true;
            lines.push(format!("t={}ms rtc: time set to {request}", now.as_millis()));
        }

        if self.sys.state() == SysState::Uninitialized && !self.init_requested() {
            let status = world.sys_mailbox.set_state_request(SysRequest::Init);
            if status != RequestStatus::Ok {
                lines.push(format!("sys: init request rejected ({status})"));
            }
        }

        let faults_before = world.diag.active_faults();
        let sys_before = self.sys.state();
        let sbc_before = self.sbc.state();

        self.afe.publish(&world.database, now);
        self.sys.trigger();
        self.sbc.trigger();
        // outcome is reported through the diagnosis log
        let _ = self.validator.validate_afe_measurement();
        let _ = self.validator.validate_pack_measurement();

        let at = now.as_millis();
        if self.sys.state() != sys_before {
            lines.push(format!("t={at}ms sys: {sys_before} -> {}", self.sys.state()));
        }
        if self.sbc.state() != sbc_before {
            lines.push(format!("t={at}ms sbc: {sbc_before} -> {}", self.sbc.state()));
        }
        let faults_after = world.diag.active_faults();
        for (id, scope) in newly_latched(&faults_after, &faults_before) {
            lines.push(format!("t={at}ms diag: {id} raised on {scope}"));
        }
        for (id, scope) in newly_latched(&faults_before, &faults_after) {
            lines.push(format!("t={at}ms diag: {id} cleared on {scope}"));
        }
    }

    fn init_requested(&self) -> bool {
        self.world.sys_mailbox.pending_request().is_some()
    }

    fn status(&self) -> Vec<String> {
        let world = self.world;
        let mut lines = vec![
            format!("time: {}ms", world.clock.now().as_millis()),
            format!(
                "sys: {} (previous {})",
                self.sys.state(),
                world.sys_mailbox.previous_state()
            ),
            format!(
                "sbc: {} (previous {}) watchdog-refreshes={} ignition={}",
                self.sbc.state(),
                world.sbc_mailbox.previous_state(),
                self.sbc.watchdog_triggers(),
                describe_ignition(self.sbc.ignition())
            ),
            format!(
                "rtc: {}",
                self.rtc_time
                    .map_or_else(|| "not set".to_string(), |time| time.to_string())
            ),
        ];

        let voltages = world.database.validated_cell_voltages();
        for (string, fused) in voltages.strings.iter().enumerate() {
            lines.push(format!(
                "string{string}: valid={} missing={} min={}mV max={}mV avg={}mV",
                fused.valid,
                fused.missing.count(),
                fused.summary.min,
                fused.summary.max,
                fused.summary.average
            ));
        }

        let pack = world.database.pack_values();
        lines.push(format!(
            "pack: current={}mA ({}) voltage={}mV ({})",
            pack.pack_current_ma,
            validity(pack.pack_current_valid),
            pack.pack_voltage_mv,
            validity(pack.pack_voltage_valid)
        ));
        lines
    }

    fn diag(&self) -> Vec<String> {
        let log = &self.world.diag;
        let mut lines = Vec::new();
        let active = log.active_faults();
        if active.is_empty() {
            lines.push("no latched faults".to_string());
        } else {
            for (id, scope) in &active {
                lines.push(format!("active: {id} on {scope}"));
            }
        }

        let records = log.records();
        let skip = records.len().saturating_sub(RECENT_REPORTS);
        for record in records.iter().skip(skip) {
            lines.push(format!(
                "#{} {} {:?} {} context={}",
                record.sequence, record.id, record.event, record.scope, record.context
            ));
        }
        lines.push(format!("reports since boot: {}", log.total_reports()));
        lines
    }

    fn set_time(&mut self, line: &str) -> Vec<String> {
        let mut outcome = Ok(None);
        for byte in line.bytes().chain([b'\n']) {
            outcome = self.console.ingest(byte);
            if outcome.is_err() {
                break;
            }
        }
        match outcome {
            Ok(Some(request)) => vec![format!("OK time-set queued {request}")],
            Ok(None) => Vec::new(),
            Err(error) => vec![format!("ERR time {error}")],
        }
    }

    fn fail_sbc(&mut self, count: u32) -> Vec<String> {
        self.sbc.companion_mut().phase1_failures = count;
        let mut lines = vec![format!("OK next {count} companion init attempts fail")];
        if self.sbc.state() != SbcState::Uninitialized {
            lines.push("note: the supervisor already left its uninitialized state".to_string());
        }
        lines
    }

    fn stale(&mut self, target: StaleTarget) -> Vec<String> {
        self.afe.stale = match target {
            StaleTarget::Base => Some(MeasurementSource::Base),
            StaleTarget::Redundant => Some(MeasurementSource::Redundant),
            StaleTarget::None => None,
        };
        vec![format!("OK stale source: {}", describe_stale(self.afe.stale))]
    }

    fn cells_invalid(&mut self, count: u8) -> Vec<String> {
        self.afe.invalid_cells = count;
        vec![format!("OK string0 cells flagged invalid: {count}")]
    }

    fn record(&mut self, elapsed: Duration, role: TranscriptRole, line: &str) -> io::Result<()> {
        match self.transcript.as_mut() {
            Some(transcript) => transcript.append_line(elapsed, role, line),
            None => Ok(()),
        }
    }
}

fn help(topic: Option<&str>) -> Vec<String> {
    let mut lines = Vec::new();
    match topic {
        Some(target) => {
            if let Some((_, detail)) = HELP_TOPICS
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(target))
            {
                lines.push((*detail).to_string());
            } else {
                lines.push(format!("No help available for `{target}`."));
                lines.push(format!("Available topics: {}", help_topic_list()));
            }
        }
        None => {
            lines.push("Available commands:".to_string());
            for (_, detail) in HELP_TOPICS {
                lines.push(format!("  {detail}"));
            }
            lines.push("Type `help <topic>` for a specific command.".to_string());
        }
    }
    lines
}

fn help_topic_list() -> String {
    HELP_TOPICS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_ignition(ignition: Option<bool>) -> &'static str {
    match ignition {
        Some(true) => "on",
        Some(false) => "off",
        None => "unknown",
    }
}

fn describe_stale(stale: Option<MeasurementSource>) -> &'static str {
    match stale {
        Some(MeasurementSource::Base) => "base",
        Some(MeasurementSource::Redundant) => "redundant",
        None => "none",
    }
}

fn validity(valid: bool) -> &'static str {
    if valid { "valid" } else { "invalid" }
}

/// Faults latched in `now` but not in `earlier`.
fn newly_latched<'a>(
    now: &'a [(DiagId, DiagScope)],
    earlier: &'a [(DiagId, DiagScope)],
) -> impl Iterator<Item = &'a (DiagId, DiagScope)> + 'a {
    now.iter().filter(|fault| !earlier.contains(fault))
}

struct TranscriptLogger {
    writer: BufWriter<std::fs::File>,
}

impl TranscriptLogger {
    fn new(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut logger = Self {
            writer: BufWriter::new(file),
        };
        writeln!(logger.writer, "BMS simulator transcript")?;
        Ok(logger)
    }

    fn append_line(
        &mut self,
        elapsed: Duration,
        role: TranscriptRole,
        line: &str,
    ) -> io::Result<()> {
        writeln!(
            self.writer,
            "[{:>8.3}s] {} {}",
            elapsed.as_secs_f64(),
            role.prefix(),
            line
        )?;
        self.writer.flush()
    }
}

#[derive(Clone, Copy)]
enum TranscriptRole {
    Host,
    Simulator,
}

impl TranscriptRole {
    fn prefix(self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Simulator => "SIM <",
        }
    }
}
