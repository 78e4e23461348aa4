//! Time-triggered state machine pattern shared by the safety subsystems.
//!
//! Every concrete machine is split in two halves:
//!
//! * a [`Mailbox`] that lives for the whole program and is the only part other
//!   tasks may touch. It holds the pending request slot, the published state,
//!   the illegal-request counter, and the busy flag that keeps a trigger from
//!   running twice at once.
//! * an [`FsmCore`] owned by the task that triggers the machine. It holds the
//!   dwell timer and the authoritative current/previous state.
//!
//! The concrete machine implements [`StateMachine::process`] and inherits the
//! trigger protocol from [`StateMachine::trigger`].

use core::cell::Cell;
use core::fmt;

use critical_section::Mutex;
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

/// Dwell applied when the next substate should run on the following trigger.
pub const SHORT_DWELL: u16 = 1;
/// Dwell used by steady states that are only re-evaluated occasionally.
pub const LONG_DWELL: u16 = 100;

/// Answer to a [`Mailbox::set_state_request`] call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RequestStatus {
    /// The request was queued for the next trigger.
    Ok,
    /// Another request is still waiting to be consumed.
    RequestPending,
    /// The request makes no sense in the current state.
    IllegalRequest,
    /// The machine has already left its uninitialized state.
    AlreadyInitialized,
}

impl RequestStatus {
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, RequestStatus::Ok)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequestStatus::Ok => "ok",
            RequestStatus::RequestPending => "request-pending",
            RequestStatus::IllegalRequest => "illegal-request",
            RequestStatus::AlreadyInitialized => "already-initialized",
        };
        f.write_str(label)
    }
}

/// What a single [`StateMachine::trigger`] call did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TriggerOutcome {
    /// Another trigger was already running; nothing happened.
    Reentered,
    /// The dwell timer has not elapsed yet.
    Dwelling,
    /// The state handler ran.
    Processed,
}

/// State enum whose variants carry their own substate.
pub trait HierarchicalState: Copy + Eq {
    /// Top-level state without substate detail.
    type Top: Copy + Eq;

    /// Returns the top-level state.
    fn top(self) -> Self::Top;

    /// Returns the state used when this top-level state is entered from a
    /// different top-level state.
    fn entry(self) -> Self;
}

/// Static description of a concrete machine.
pub trait Machine {
    type State: HierarchicalState;
    type Request: Copy + Eq;

    /// State every instance starts in.
    const INITIAL: Self::State;

    /// Decides whether `request` may be queued.
    fn check_request(
        current: Self::State,
        pending: Option<Self::Request>,
        request: Self::Request,
    ) -> RequestStatus;

    /// Decodes a raw request byte received from outside the firmware.
    fn decode_request(raw: u8) -> Option<Self::Request>;
}

/// Cross-task access point of a machine.
pub struct Mailbox<M: Machine> {
    current: Mutex<Cell<M::State>>,
    previous: Mutex<Cell<M::State>>,
    pending: Mutex<Cell<Option<M::Request>>>,
    illegal_requests: AtomicU32,
    busy: AtomicBool,
}

impl<M: Machine> Mailbox<M> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: Mutex::new(Cell::new(M::INITIAL)),
            previous: Mutex::new(Cell::new(M::INITIAL)),
            pending: Mutex::new(Cell::new(None)),
            illegal_requests: AtomicU32::new(0),
            busy: AtomicBool::new(false),
        }
    }

    /// Validates `request` against the published state and queues it.
    pub fn set_state_request(&self, request: M::Request) -> RequestStatus {
        let status = critical_section::with(|cs| {
            let current = self.current.borrow(cs).get();
            let pending = self.pending.borrow(cs);
            let status = M::check_request(current, pending.get(), request);
            if status.is_ok() {
                pending.set(Some(request));
            }
            status
        });

        if status == RequestStatus::IllegalRequest {
            self.illegal_requests.fetch_add(1, Ordering::Relaxed);
        }
        status
    }

    /// Decodes and queues a raw request; unknown values are illegal.
    pub fn set_state_request_raw(&self, raw: u8) -> RequestStatus {
        match M::decode_request(raw) {
            Some(request) => self.set_state_request(request),
            None => {
                self.illegal_requests.fetch_add(1, Ordering::Relaxed);
                RequestStatus::IllegalRequest
            }
        }
    }

    /// Returns the last state published by the owning task.
    pub fn state(&self) -> M::State {
        critical_section::with(|cs| self.current.borrow(cs).get())
    }

    /// Returns the state published before the current one.
    pub fn previous_state(&self) -> M::State {
        critical_section::with(|cs| self.previous.borrow(cs).get())
    }

    /// Returns the queued request, if any, without consuming it.
    pub fn pending_request(&self) -> Option<M::Request> {
        critical_section::with(|cs| self.pending.borrow(cs).get())
    }

    /// Number of rejected requests since the last legal initialization.
    pub fn illegal_request_count(&self) -> u32 {
        self.illegal_requests.load(Ordering::Relaxed)
    }

    /// Returns `true` while a trigger is executing.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Marks the machine busy for the lifetime of the returned guard.
    ///
    /// Returns `None` when a trigger is already running.
    pub fn enter(&self) -> Option<TriggerGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| TriggerGuard { busy: &self.busy })
    }

    fn take_request(&self) -> Option<M::Request> {
        critical_section::with(|cs| self.pending.borrow(cs).take())
    }

    fn publish(&self, current: M::State, previous: M::State) {
        critical_section::with(|cs| {
            self.current.borrow(cs).set(current);
            self.previous.borrow(cs).set(previous);
        });
    }

    fn clear_illegal_requests(&self) {
        self.illegal_requests.store(0, Ordering::Relaxed);
    }
}

impl<M: Machine> Default for Mailbox<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the busy flag of a [`Mailbox`] when dropped.
#[must_use = "the machine is only marked busy while the guard is alive"]
pub struct TriggerGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for TriggerGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Next state chosen by a state handler and the dwell before the one after.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Transition<S> {
    pub next: S,
    pub dwell: u16,
}

impl<S> Transition<S> {
    #[must_use]
    pub const fn to(next: S, dwell: u16) -> Self {
        Self { next, dwell }
    }
}

/// Task-owned half of a machine.
pub struct FsmCore<'a, M: Machine> {
    mailbox: &'a Mailbox<M>,
    current: M::State,
    previous: M::State,
    timer: u16,
    retry_counter: u32,
}

impl<'a, M: Machine> FsmCore<'a, M> {
    /// Binds a fresh instance to its mailbox and publishes the initial state.
    pub fn new(mailbox: &'a Mailbox<M>) -> Self {
        mailbox.publish(M::INITIAL, M::INITIAL);
        Self {
            mailbox,
            current: M::INITIAL,
            previous: M::INITIAL,
            timer: 0,
            retry_counter: 0,
        }
    }

    pub fn mailbox(&self) -> &'a Mailbox<M> {
        self.mailbox
    }

    pub fn state(&self) -> M::State {
        self.current
    }

    pub fn previous_state(&self) -> M::State {
        self.previous
    }

    /// Remaining dwell ticks before the next transition is processed.
    pub fn timer(&self) -> u16 {
        self.timer
    }

    /// Total failed attempts since the last legal initialization.
    pub fn retry_counter(&self) -> u32 {
        self.retry_counter
    }

    /// Counts a failed attempt.
    pub fn record_retry(&mut self) {
        self.retry_counter = self.retry_counter.saturating_add(1);
    }

    /// Clears the fault counters; called when a legal initialization starts.
    pub fn reset_counters(&mut self) {
        self.retry_counter = 0;
        self.mailbox.clear_illegal_requests();
    }

    /// Counts down the dwell timer, returning `true` while it is still running.
    fn dwell(&mut self) -> bool {
        if self.timer > 0 {
            self.timer -= 1;
            if self.timer > 0 {
                return true;
            }
        }
        false
    }

    /// Applies a transition chosen by the state handler.
    ///
    /// A change of top-level state always lands in that state's entry
    /// substate; only moves within the same top-level state keep the
    /// requested substate.
    pub fn set_state(&mut self, transition: Transition<M::State>) {
        self.timer = transition.dwell;

        let next = if transition.next.top() == self.current.top() {
            transition.next
        } else {
            transition.next.entry()
        };

        if next == self.current {
            return;
        }

        self.previous = self.current;
        self.current = next;
        self.mailbox.publish(self.current, self.previous);
    }
}

/// Trigger protocol shared by every concrete machine.
pub trait StateMachine<'a> {
    type Machine: Machine + 'a;

    fn core(&self) -> &FsmCore<'a, Self::Machine>;

    fn core_mut(&mut self) -> &mut FsmCore<'a, Self::Machine>;

    /// Handles one step of `state`, returning the next state.
    fn process(
        &mut self,
        state: <Self::Machine as Machine>::State,
        request: Option<<Self::Machine as Machine>::Request>,
    ) -> Transition<<Self::Machine as Machine>::State>;

    /// Advances the machine by one period.
    ///
    /// The busy guard is released on every return path.
    fn trigger(&mut self) -> TriggerOutcome {
        let mailbox = self.core().mailbox();
        let Some(_guard) = mailbox.enter() else {
            return TriggerOutcome::Reentered;
        };

        if self.core_mut().dwell() {
            return TriggerOutcome::Dwelling;
        }

        let request = mailbox.take_request();
        let state = self.core().state();
        let transition = self.process(state, request);
        self.core_mut().set_state(transition);
        TriggerOutcome::Processed
    }

    /// Returns the current state.
    fn state(&self) -> <Self::Machine as Machine>::State {
        self.core().state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    enum Warmup {
        Entry,
        Heating,
        Settled,
    }

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    enum LampState {
        Uninitialized,
        Initialization(Warmup),
        Running,
    }

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    enum LampTop {
        Uninitialized,
        Initialization,
        Running,
    }

    impl HierarchicalState for LampState {
        type Top = LampTop;

        fn top(self) -> LampTop {
            match self {
                LampState::Uninitialized => LampTop::Uninitialized,
                LampState::Initialization(_) => LampTop::Initialization,
                LampState::Running => LampTop::Running,
            }
        }

        fn entry(self) -> Self {
            match self {
                LampState::Initialization(_) => LampState::Initialization(Warmup::Entry),
                other => other,
            }
        }
    }

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    enum LampRequest {
        Init,
    }

    struct LampMachine;

    impl Machine for LampMachine {
        type State = LampState;
        type Request = LampRequest;

        const INITIAL: LampState = LampState::Uninitialized;

        fn check_request(
            current: LampState,
            pending: Option<LampRequest>,
            _: LampRequest,
        ) -> RequestStatus {
            if pending.is_some() {
                RequestStatus::RequestPending
            } else if current == LampState::Uninitialized {
                RequestStatus::Ok
            } else {
                RequestStatus::AlreadyInitialized
            }
        }

        fn decode_request(raw: u8) -> Option<LampRequest> {
            (raw == 1).then_some(LampRequest::Init)
        }
    }

    struct Lamp<'a> {
        core: FsmCore<'a, LampMachine>,
        processed: u32,
        nested: Option<TriggerOutcome>,
        nest_once: bool,
    }

    impl<'a> Lamp<'a> {
        fn new(mailbox: &'a Mailbox<LampMachine>) -> Self {
            Self {
                core: FsmCore::new(mailbox),
                processed: 0,
                nested: None,
                nest_once: false,
            }
        }
    }

    impl<'a> StateMachine<'a> for Lamp<'a> {
        type Machine = LampMachine;

        fn core(&self) -> &FsmCore<'a, LampMachine> {
            &self.core
        }

        fn core_mut(&mut self) -> &mut FsmCore<'a, LampMachine> {
            &mut self.core
        }

        fn process(
            &mut self,
            state: LampState,
            request: Option<LampRequest>,
        ) -> Transition<LampState> {
            self.processed += 1;
            if self.nest_once {
                self.nest_once = false;
                self.nested = Some(self.trigger());
            }

            match state {
                LampState::Uninitialized => match request {
                    // the substate argument is ignored on a top-level change
                    Some(LampRequest::Init) => {
                        Transition::to(LampState::Initialization(Warmup::Settled), SHORT_DWELL)
                    }
                    None => Transition::to(state, SHORT_DWELL),
                },
                LampState::Initialization(Warmup::Entry) => {
                    Transition::to(LampState::Initialization(Warmup::Heating), 3)
                }
                LampState::Initialization(Warmup::Heating) => {
                    Transition::to(LampState::Initialization(Warmup::Settled), SHORT_DWELL)
                }
                LampState::Initialization(Warmup::Settled) => {
                    Transition::to(LampState::Running, LONG_DWELL)
                }
                LampState::Running => Transition::to(state, LONG_DWELL),
            }
        }
    }

    #[test]
    fn init_request_accepted_once() {
        let mailbox = Mailbox::<LampMachine>::new();
        let mut lamp = Lamp::new(&mailbox);

        assert_eq!(mailbox.set_state_request(LampRequest::Init), RequestStatus::Ok);
        assert_eq!(
            mailbox.set_state_request(LampRequest::Init),
            RequestStatus::RequestPending
        );

        assert_eq!(lamp.trigger(), TriggerOutcome::Processed);
        assert_eq!(mailbox.pending_request(), None);
        assert_eq!(
            mailbox.set_state_request(LampRequest::Init),
            RequestStatus::AlreadyInitialized
        );
    }

    #[test]
    fn top_level_change_forces_entry_substate() {
        let mailbox = Mailbox::<LampMachine>::new();
        let mut lamp = Lamp::new(&mailbox);

        mailbox.set_state_request(LampRequest::Init);
        lamp.trigger();

        assert_eq!(lamp.state(), LampState::Initialization(Warmup::Entry));
        assert_eq!(mailbox.state(), LampState::Initialization(Warmup::Entry));
        assert_eq!(mailbox.previous_state(), LampState::Uninitialized);
    }

    #[test]
    fn dwell_timer_blocks_transitions() {
        let mailbox = Mailbox::<LampMachine>::new();
        let mut lamp = Lamp::new(&mailbox);

        mailbox.set_state_request(LampRequest::Init);
        lamp.trigger();
        assert_eq!(lamp.trigger(), TriggerOutcome::Processed);
        assert_eq!(lamp.state(), LampState::Initialization(Warmup::Heating));
        assert_eq!(lamp.core().timer(), 3);

        assert_eq!(lamp.trigger(), TriggerOutcome::Dwelling);
        assert_eq!(lamp.trigger(), TriggerOutcome::Dwelling);
        assert_eq!(lamp.state(), LampState::Initialization(Warmup::Heating));
        assert_eq!(lamp.trigger(), TriggerOutcome::Processed);
        assert_eq!(lamp.state(), LampState::Initialization(Warmup::Settled));
        assert!(!mailbox.is_busy());
    }

    #[test]
    fn back_to_back_triggers_release_guard() {
        let mailbox = Mailbox::<LampMachine>::new();
        let mut lamp = Lamp::new(&mailbox);

        mailbox.set_state_request(LampRequest::Init);
        for _ in 0..250 {
            lamp.trigger();
            assert!(!mailbox.is_busy());
        }
        assert_eq!(lamp.state(), LampState::Running);
    }

    #[test]
    fn trigger_while_busy_changes_nothing() {
        let mailbox = Mailbox::<LampMachine>::new();
        let mut lamp = Lamp::new(&mailbox);
        mailbox.set_state_request(LampRequest::Init);

        let guard = mailbox.enter().expect("machine idle");
        assert_eq!(lamp.trigger(), TriggerOutcome::Reentered);
        assert_eq!(lamp.state(), LampState::Uninitialized);
        assert_eq!(mailbox.pending_request(), Some(LampRequest::Init));
        assert_eq!(lamp.processed, 0);
        drop(guard);

        assert!(!mailbox.is_busy());
        assert_eq!(lamp.trigger(), TriggerOutcome::Processed);
    }

    #[test]
    fn nested_trigger_is_rejected() {
        let mailbox = Mailbox::<LampMachine>::new();
        let mut lamp = Lamp::new(&mailbox);
        mailbox.set_state_request(LampRequest::Init);

        lamp.nest_once = true;
        assert_eq!(lamp.trigger(), TriggerOutcome::Processed);

        assert_eq!(lamp.nested, Some(TriggerOutcome::Reentered));
        assert_eq!(lamp.processed, 1);
        assert_eq!(lamp.state(), LampState::Initialization(Warmup::Entry));
        assert!(!mailbox.is_busy());
    }

    #[test]
    fn unknown_raw_request_is_counted() {
        let mailbox = Mailbox::<LampMachine>::new();
        let mut lamp = Lamp::new(&mailbox);

        assert_eq!(
            mailbox.set_state_request_raw(0xEE),
            RequestStatus::IllegalRequest
        );
        assert_eq!(mailbox.illegal_request_count(), 1);
        assert_eq!(mailbox.set_state_request_raw(1), RequestStatus::Ok);

        lamp.trigger();
        lamp.core_mut().reset_counters();
        assert_eq!(mailbox.illegal_request_count(), 0);
    }
}
