//! System orchestrator: boots every other subsystem in order.
//!
//! Each bounded wait is measured with a [`Stopwatch`] against the wrapping
//! tick counter, so the configured budgets are wall-clock durations that do
//! not depend on how often the orchestrator is triggered. Any exhausted wait
//! parks the machine in [`SysState::Error`] with the step that gave up.

use core::fmt;
use core::time::Duration;

use crate::config::strings;
use crate::diag::{DiagEvent, DiagId, DiagScope, DiagnosisSink};
use crate::fsm::{
    FsmCore, HierarchicalState, LONG_DWELL, Machine, Mailbox, RequestStatus, SHORT_DWELL,
    StateMachine, Transition,
};
use crate::sbc::{SbcMailbox, SbcRequest, SbcState};
use crate::time::{Stopwatch, TickSource};

/// Substates of [`SysState::Initialization`], in execution order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InitStep {
    /// Reports fault flags that were persisted before the last reset.
    PersistedFaultCheck,
    SbcInitRequest,
    SbcWaitRunning,
    CanInit,
    RtcWaitReady,
    SelfTest,
    BootMessage,
}

/// Substates of [`SysState::PreRunning`], in execution order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PreRunStep {
    InterlockInit,
    BalancingInitRequest,
    BalancingInitWait,
    BalancingPolicyRequest,
    BalancingPolicyWait,
    MeasurementStart,
    MeasurementWait,
    CurrentSensorPresence,
    LateInit,
    ImdInit,
    BmsInitRequest,
    BmsInitWait,
}

/// Why the orchestrator parked in [`SysState::Error`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SysErrorCause {
    SbcTimeout,
    RtcTimeout,
    SelfTestFailed,
    BalancingInitTimeout,
    BalancingPolicyTimeout,
    MeasurementTimeout,
    CurrentSensorTimeout,
    ImdInitFailed,
    BmsInitTimeout,
    /// Another component asked for the error state.
    Requested,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SysState {
    Uninitialized,
    Initialization(InitStep),
    PreRunning(PreRunStep),
    Running,
    Error(SysErrorCause),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SysTopState {
    Uninitialized,
    Initialization,
    PreRunning,
    Running,
    Error,
}

impl HierarchicalState for SysState {
    type Top = SysTopState;

    fn top(self) -> SysTopState {
        match self {
            SysState::Uninitialized => SysTopState::Uninitialized,
            SysState::Initialization(_) => SysTopState::Initialization,
            SysState::PreRunning(_) => SysTopState::PreRunning,
            SysState::Running => SysTopState::Running,
            SysState::Error(_) => SysTopState::Error,
        }
    }

    fn entry(self) -> Self {
        match self {
            SysState::Initialization(_) => SysState::Initialization(InitStep::PersistedFaultCheck),
            SysState::PreRunning(_) => SysState::PreRunning(PreRunStep::InterlockInit),
            other => other,
        }
    }
}

impl fmt::Display for InitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InitStep::PersistedFaultCheck => "persisted-fault-check",
            InitStep::SbcInitRequest => "sbc-init-request",
            InitStep::SbcWaitRunning => "sbc-wait-running",
            InitStep::CanInit => "can-init",
            InitStep::RtcWaitReady => "rtc-wait-ready",
            InitStep::SelfTest => "self-test",
            InitStep::BootMessage => "boot-message",
        };
        f.write_str(label)
    }
}

impl fmt::Display for PreRunStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PreRunStep::InterlockInit => "interlock-init",
            PreRunStep::BalancingInitRequest => "balancing-init-request",
            PreRunStep::BalancingInitWait => "balancing-init-wait",
            PreRunStep::BalancingPolicyRequest => "balancing-policy-request",
            PreRunStep::BalancingPolicyWait => "balancing-policy-wait",
            PreRunStep::MeasurementStart => "measurement-start",
            PreRunStep::MeasurementWait => "measurement-wait",
            PreRunStep::CurrentSensorPresence => "current-sensor-presence",
            PreRunStep::LateInit => "late-init",
            PreRunStep::ImdInit => "imd-init",
            PreRunStep::BmsInitRequest => "bms-init-request",
            PreRunStep::BmsInitWait => "bms-init-wait",
        };
        f.write_str(label)
    }
}

impl fmt::Display for SysErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SysErrorCause::SbcTimeout => "sbc-timeout",
            SysErrorCause::RtcTimeout => "rtc-timeout",
            SysErrorCause::SelfTestFailed => "self-test-failed",
            SysErrorCause::BalancingInitTimeout => "balancing-init-timeout",
            SysErrorCause::BalancingPolicyTimeout => "balancing-policy-timeout",
            SysErrorCause::MeasurementTimeout => "measurement-timeout",
            SysErrorCause::CurrentSensorTimeout => "current-sensor-timeout",
            SysErrorCause::ImdInitFailed => "imd-init-failed",
            SysErrorCause::BmsInitTimeout => "bms-init-timeout",
            SysErrorCause::Requested => "requested",
        };
        f.write_str(label)
    }
}

impl fmt::Display for SysState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SysState::Uninitialized => f.write_str("uninitialized"),
            SysState::Initialization(step) => write!(f, "initialization/{step}"),
            SysState::PreRunning(step) => write!(f, "pre-running/{step}"),
            SysState::Running => f.write_str("running"),
            SysState::Error(cause) => write!(f, "error/{cause}"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SysRequest {
    Init,
    /// Moves an initializing, pre-running or running system to
    /// `Error(Requested)`.
    Error,
}

impl SysRequest {
    pub const RAW_INIT: u8 = 1;
    pub const RAW_ERROR: u8 = 2;
}

/// Request rules of the orchestrator.
pub struct SysMachine;

impl Machine for SysMachine {
    type State = SysState;
    type Request = SysRequest;

    const INITIAL: SysState = SysState::Uninitialized;

    fn check_request(
        current: SysState,
        pending: Option<SysRequest>,
        request: SysRequest,
    ) -> RequestStatus {
        match request {
            SysRequest::Init => {
                if pending.is_some() {
                    RequestStatus::RequestPending
                } else if current == SysState::Uninitialized {
                    RequestStatus::Ok
                } else {
                    RequestStatus::AlreadyInitialized
                }
            }
            SysRequest::Error => {
                if matches!(current, SysState::Uninitialized | SysState::Error(_)) {
                    RequestStatus::IllegalRequest
                } else if pending.is_some() {
                    RequestStatus::RequestPending
                } else {
                    RequestStatus::Ok
                }
            }
        }
    }

    fn decode_request(raw: u8) -> Option<SysRequest> {
        match raw {
            SysRequest::RAW_INIT => Some(SysRequest::Init),
            SysRequest::RAW_ERROR => Some(SysRequest::Error),
            _ => None,
        }
    }
}

pub type SysMailbox = Mailbox<SysMachine>;

/// Global balancing mode applied during pre-running.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BalancingPolicy {
    Enabled,
    Disabled,
}

impl fmt::Display for BalancingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancingPolicy::Enabled => f.write_str("enabled"),
            BalancingPolicy::Disabled => f.write_str("disabled"),
        }
    }
}

/// What a current sensor reported about itself for one string.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CurrentSensorStatus {
    pub present: bool,
    pub coulomb_counting: bool,
    pub energy_counting: bool,
}

/// Inputs available to the per-string state estimators.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EstimatorInputs {
    pub coulomb_counting: bool,
    pub energy_counting: bool,
}

/// A built-in self test reported a failure.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SelfTestError {
    pub test: u8,
}

impl fmt::Display for SelfTestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "built-in self test {} failed", self.test)
    }
}

/// Subsystems the orchestrator brings up.
pub trait BootServices {
    /// Returns `true` when a fatal fault was persisted for `string`.
    fn persisted_fault(&mut self, string: u8) -> bool;

    fn init_can(&mut self);

    fn rtc_ready(&mut self) -> bool;

    fn run_self_test(&mut self) -> Result<(), SelfTestError>;

    fn send_boot_message(&mut self);

    fn init_interlock(&mut self);

    fn request_balancing_init(&mut self) -> RequestStatus;

    fn balancing_initialized(&mut self) -> bool;

    fn request_balancing_policy(&mut self, policy: BalancingPolicy) -> RequestStatus;

    fn balancing_policy_applied(&mut self, policy: BalancingPolicy) -> bool;

    fn start_measurement_cycle(&mut self);

    fn first_measurement_cycle_finished(&mut self) -> bool;

    fn current_sensor_status(&mut self, string: u8) -> CurrentSensorStatus;

    /// Initializes state-of-charge, -energy and -health tracking for `string`.
    fn init_state_estimation(&mut self, string: u8, inputs: EstimatorInputs);

    /// Remaining initialization with no ordering constraints.
    fn late_init(&mut self);

    fn request_imd_init(&mut self) -> RequestStatus;

    fn request_bms_init(&mut self) -> RequestStatus;

    fn bms_running(&mut self) -> bool;
}

/// Orchestrator tuning.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SysConfig {
    /// Period of the task that triggers the orchestrator.
    pub task_period: Duration,
    pub sbc_init_timeout: Duration,
    pub rtc_init_timeout: Duration,
    pub balancing_init_timeout: Duration,
    pub balancing_policy_timeout: Duration,
    pub measurement_cycle_timeout: Duration,
    pub current_sensor_presence_timeout: Duration,
    pub bms_init_timeout: Duration,
    /// Waits for every string's current sensor before estimator setup.
    pub check_current_sensor_presence: bool,
    pub balancing_policy: BalancingPolicy,
    /// Insulation monitor initialization attempts before giving up.
    pub imd_init_attempts: u8,
}

impl Default for SysConfig {
    fn default() -> Self {
        Self {
            task_period: Duration::from_millis(10),
            sbc_init_timeout: Duration::from_millis(1_000),
            rtc_init_timeout: Duration::from_millis(1_000),
            balancing_init_timeout: Duration::from_millis(1_000),
            balancing_policy_timeout: Duration::from_millis(1_000),
            measurement_cycle_timeout: Duration::from_millis(5_000),
            current_sensor_presence_timeout: Duration::from_millis(1_000),
            bms_init_timeout: Duration::from_millis(1_000),
            check_current_sensor_presence: true,
            balancing_policy: BalancingPolicy::Disabled,
            imd_init_attempts: 3,
        }
    }
}

/// System orchestrator instance.
pub struct Sys<'a, B, D, T>
where
    B: BootServices,
    D: DiagnosisSink,
    T: TickSource,
{
    core: FsmCore<'a, SysMachine>,
    sbc: &'a SbcMailbox,
    services: B,
    diag: D,
    clock: T,
    config: SysConfig,
    wait: Stopwatch,
    imd_attempts: u8,
}

impl<'a, B, D, T> Sys<'a, B, D, T>
where
    B: BootServices,
    D: DiagnosisSink,
    T: TickSource,
{
    pub fn new(
        mailbox: &'a SysMailbox,
        sbc: &'a SbcMailbox,
        services: B,
        diag: D,
        clock: T,
        config: SysConfig,
    ) -> Self {
        Self {
            core: FsmCore::new(mailbox),
            sbc,
            services,
            diag,
            clock,
            config,
            wait: Stopwatch::new(),
            imd_attempts: 0,
        }
    }

    pub fn mailbox(&self) -> &'a SysMailbox {
        self.core.mailbox()
    }

    pub fn config(&self) -> &SysConfig {
        &self.config
    }

    pub fn services(&self) -> &B {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut B {
        &mut self.services
    }

    pub fn retry_counter(&self) -> u32 {
        self.core.retry_counter()
    }

    /// Moves to the next step and restarts the wait stopwatch.
    fn advance(&mut self, next: SysState) -> Transition<SysState> {
        self.wait.reset();
        Transition::to(next, SHORT_DWELL)
    }

    /// Polls a bounded wait in `state`.
    fn await_step(
        &mut self,
        state: SysState,
        done: bool,
        next: SysState,
        budget: Duration,
        cause: SysErrorCause,
    ) -> Transition<SysState> {
        if done {
            return self.advance(next);
        }

        if self.wait.exceeded(self.clock.now(), budget) {
            self.wait.reset();
            Transition::to(SysState::Error(cause), LONG_DWELL)
        } else {
            Transition::to(state, SHORT_DWELL)
        }
    }

    fn report_persisted_faults(&mut self) {
        for string in strings() {
            if self.services.persisted_fault(string) {
                // the diagnosis sink owns the reaction; a refused report changes nothing here
                let _ = self.diag.report_fault(
                    DiagId::PersistedFatalError,
                    DiagEvent::NotOk,
                    DiagScope::String(string),
                    0,
                );
            }
        }
    }

    fn process_initialization(&mut self, step: InitStep) -> Transition<SysState> {
        let state = SysState::Initialization(step);
        match step {
            InitStep::PersistedFaultCheck => {
                self.report_persisted_faults();
                self.advance(SysState::Initialization(InitStep::SbcInitRequest))
            }
            InitStep::SbcInitRequest => {
                let _ = self.sbc.set_state_request(SbcRequest::Init);
                self.advance(SysState::Initialization(InitStep::SbcWaitRunning))
            }
            InitStep::SbcWaitRunning => {
                let done = self.sbc.state() == SbcState::Running;
                self.await_step(
                    state,
                    done,
                    SysState::Initialization(InitStep::CanInit),
                    self.config.sbc_init_timeout,
                    SysErrorCause::SbcTimeout,
                )
            }
            InitStep::CanInit => {
                self.services.init_can();
                self.advance(SysState::Initialization(InitStep::RtcWaitReady))
            }
            InitStep::RtcWaitReady => {
                let done = self.services.rtc_ready();
                self.await_step(
                    state,
                    done,
                    SysState::Initialization(InitStep::SelfTest),
                    self.config.rtc_init_timeout,
                    SysErrorCause::RtcTimeout,
                )
            }
            InitStep::SelfTest => match self.services.run_self_test() {
                Ok(()) => self.advance(SysState::Initialization(InitStep::BootMessage)),
                Err(_) => Transition::to(SysState::Error(SysErrorCause::SelfTestFailed), LONG_DWELL),
            },
            InitStep::BootMessage => {
                self.services.send_boot_message();
                self.advance(SysState::PreRunning(PreRunStep::InterlockInit))
            }
        }
    }

    fn process_pre_running(&mut self, step: PreRunStep) -> Transition<SysState> {
        let state = SysState::PreRunning(step);
        let policy = self.config.balancing_policy;
        match step {
            PreRunStep::InterlockInit => {
                self.services.init_interlock();
                self.advance(SysState::PreRunning(PreRunStep::BalancingInitRequest))
            }
            PreRunStep::BalancingInitRequest => {
                let _ = self.services.request_balancing_init();
                self.advance(SysState::PreRunning(PreRunStep::BalancingInitWait))
            }
            PreRunStep::BalancingInitWait => {
                let done = self.services.balancing_initialized();
                self.await_step(
                    state,
                    done,
                    SysState::PreRunning(PreRunStep::BalancingPolicyRequest),
                    self.config.balancing_init_timeout,
                    SysErrorCause::BalancingInitTimeout,
                )
            }
            PreRunStep::BalancingPolicyRequest => {
                let _ = self.services.request_balancing_policy(policy);
                self.advance(SysState::PreRunning(PreRunStep::BalancingPolicyWait))
            }
            PreRunStep::BalancingPolicyWait => {
                let done = self.services.balancing_policy_applied(policy);
                self.await_step(
                    state,
                    done,
                    SysState::PreRunning(PreRunStep::MeasurementStart),
                    self.config.balancing_policy_timeout,
                    SysErrorCause::BalancingPolicyTimeout,
                )
            }
            PreRunStep::MeasurementStart => {
                self.services.start_measurement_cycle();
                self.advance(SysState::PreRunning(PreRunStep::MeasurementWait))
            }
            PreRunStep::MeasurementWait => {
                let done = self.services.first_measurement_cycle_finished();
                self.await_step(
                    state,
                    done,
                    SysState::PreRunning(PreRunStep::CurrentSensorPresence),
                    self.config.measurement_cycle_timeout,
                    SysErrorCause::MeasurementTimeout,
                )
            }
            PreRunStep::CurrentSensorPresence => self.check_current_sensors(state),
            PreRunStep::LateInit => {
                self.services.late_init();
                self.imd_attempts = 0;
                self.advance(SysState::PreRunning(PreRunStep::ImdInit))
            }
            PreRunStep::ImdInit => {
                if self.services.request_imd_init().is_ok() {
                    return self.advance(SysState::PreRunning(PreRunStep::BmsInitRequest));
                }
                self.core.record_retry();
                self.imd_attempts = self.imd_attempts.saturating_add(1);
                if self.imd_attempts >= self.config.imd_init_attempts {
                    Transition::to(SysState::Error(SysErrorCause::ImdInitFailed), LONG_DWELL)
                } else {
                    Transition::to(state, SHORT_DWELL)
                }
            }
            PreRunStep::BmsInitRequest => {
                let _ = self.services.request_bms_init();
                self.advance(SysState::PreRunning(PreRunStep::BmsInitWait))
            }
            PreRunStep::BmsInitWait => {
                let done = self.services.bms_running();
                self.await_step(
                    state,
                    done,
                    SysState::Running,
                    self.config.bms_init_timeout,
                    SysErrorCause::BmsInitTimeout,
                )
            }
        }
    }

    /// Waits for every current sensor, then seeds the estimators with the
    /// counters each sensor provides.
    fn check_current_sensors(&mut self, state: SysState) -> Transition<SysState> {
        let next = SysState::PreRunning(PreRunStep::LateInit);

        if !self.config.check_current_sensor_presence {
            for string in strings() {
                self.services
                    .init_state_estimation(string, EstimatorInputs::default());
            }
            return self.advance(next);
        }

        let all_present = strings().all(|string| self.services.current_sensor_status(string).present);
        if all_present {
            for string in strings() {
                let status = self.services.current_sensor_status(string);
                let inputs = EstimatorInputs {
                    coulomb_counting: status.coulomb_counting,
                    energy_counting: status.energy_counting,
                };
                self.services.init_state_estimation(string, inputs);
            }
        }

        self.await_step(
            state,
            all_present,
            next,
            self.config.current_sensor_presence_timeout,
            SysErrorCause::CurrentSensorTimeout,
        )
    }
}

impl<'a, B, D, T> StateMachine<'a> for Sys<'a, B, D, T>
where
    B: BootServices,
    D: DiagnosisSink,
    T: TickSource,
{
    type Machine = SysMachine;

    fn core(&self) -> &FsmCore<'a, SysMachine> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FsmCore<'a, SysMachine> {
        &mut self.core
    }

    fn process(&mut self, state: SysState, request: Option<SysRequest>) -> Transition<SysState> {
        // an error already parked keeps the cause that put it there
        if request == Some(SysRequest::Error)
            && !matches!(state, SysState::Uninitialized | SysState::Error(_))
        {
            self.wait.reset();
            return Transition::to(SysState::Error(SysErrorCause::Requested), LONG_DWELL);
        }

        match state {
            SysState::Uninitialized => match request {
                Some(SysRequest::Init) => {
                    self.core.reset_counters();
                    self.wait.reset();
                    Transition::to(
                        SysState::Initialization(InitStep::PersistedFaultCheck),
                        SHORT_DWELL,
                    )
                }
                _ => Transition::to(state, SHORT_DWELL),
            },
            SysState::Initialization(step) => self.process_initialization(step),
            SysState::PreRunning(step) => self.process_pre_running(step),
            SysState::Running | SysState::Error(_) => Transition::to(state, LONG_DWELL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_request_rules() {
        let initializing = SysState::Initialization(InitStep::CanInit);

        assert_eq!(
            SysMachine::check_request(SysState::Uninitialized, None, SysRequest::Init),
            RequestStatus::Ok
        );
        assert_eq!(
            SysMachine::check_request(
                SysState::Uninitialized,
                Some(SysRequest::Init),
                SysRequest::Init
            ),
            RequestStatus::RequestPending
        );
        assert_eq!(
            SysMachine::check_request(initializing, None, SysRequest::Init),
            RequestStatus::AlreadyInitialized
        );
    }

    #[test]
    fn error_request_needs_an_initialized_machine() {
        assert_eq!(
            SysMachine::check_request(SysState::Uninitialized, None, SysRequest::Error),
            RequestStatus::IllegalRequest
        );
        assert_eq!(
            SysMachine::check_request(SysState::Running, None, SysRequest::Error),
            RequestStatus::Ok
        );
        assert_eq!(
            SysMachine::check_request(SysState::Running, Some(SysRequest::Error), SysRequest::Error),
            RequestStatus::RequestPending
        );
        assert_eq!(
            SysMachine::check_request(
                SysState::Error(SysErrorCause::RtcTimeout),
                None,
                SysRequest::Error
            ),
            RequestStatus::IllegalRequest
        );
    }

    #[test]
    fn entering_a_top_level_state_starts_at_its_first_step() {
        assert_eq!(
            SysState::PreRunning(PreRunStep::BmsInitWait).entry(),
            SysState::PreRunning(PreRunStep::InterlockInit)
        );
        assert_eq!(
            SysState::Error(SysErrorCause::RtcTimeout).entry(),
            SysState::Error(SysErrorCause::RtcTimeout)
        );
    }

    #[test]
    fn raw_requests_decode() {
        assert_eq!(SysMachine::decode_request(1), Some(SysRequest::Init));
        assert_eq!(SysMachine::decode_request(2), Some(SysRequest::Error));
        assert_eq!(SysMachine::decode_request(0), None);
    }
}
