//! Rapid-channel-change control path: the APP-packet stash carried on the
//! repair stream, and the small state machine that governs it.

use std::collections::VecDeque;

/// Fields carried verbatim from an RCC APP packet (received on the repair
/// stream before any data). The core stashes these for the state machine
/// and for the out-of-scope channel-change orchestrator; it does not
/// interpret most of them itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct RccAppPacket {
    pub first_seq: u16,
    pub earliest_join_delta_ms: u32,
    pub burst_end_delta_ms: u32,
    pub min_backfill_ms: u32,
    pub backfill_at_join_ms: u32,
    pub er_holdoff_ms: u32,
    pub first_repair_deadline_ms: u32,
    pub app_paks_per_rcc: u32,
    pub fast_fill_time_ms: Option<u32>,
}

/// Events the RCC Mealy machine can be driven with. Only `Primary`,
/// `Repair`, and `TimeFirstSeq` are raised from inside this core's receive
/// path (per the primary/repair packet paths); the rest are exposed so an
/// out-of-scope orchestrator can drive channel-change timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RccEvent {
    StartRcc,
    Abort,
    InternalError,
    TimeToJoin,
    TimeToEnableEr,
    TimeEndBurst,
    TimeFirstSeq,
    Repair,
    Primary,
    ActivityTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RccState {
    Idle,
    AwaitingFirstSeq,
    Bursting,
    ErEnabled,
    SteadyState,
    Aborted,
}

/// Whether a packet event was accepted by the machine; a non-accepting
/// return (`Reject`) means the packet is dropped and the caller's
/// `sm_drop` counter is bumped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Accept,
    Reject,
}

const RING_CAPACITY: usize = 32;

/// Enum-driven Mealy machine; transitions are logged into a fixed ring
/// buffer for post-mortem inspection rather than discarded.
pub struct RccStateMachine {
    state: RccState,
    app: Option<RccAppPacket>,
    log: VecDeque<(RccState, RccEvent, RccState)>,
    sm_drops: u64,
}

impl Default for RccStateMachine {
    fn default() -> Self {
        Self {
            state: RccState::Idle,
            app: None,
            log: VecDeque::with_capacity(RING_CAPACITY),
            sm_drops: 0,
        }
    }
}

impl RccStateMachine {
    pub fn state(&self) -> RccState {
        self.state
    }

    pub fn app(&self) -> Option<&RccAppPacket> {
        self.app.as_ref()
    }

    pub fn stash_app(&mut self, app: RccAppPacket) {
        self.app = Some(app);
    }

    pub fn log(&self) -> impl Iterator<Item = &(RccState, RccEvent, RccState)> {
        self.log.iter()
    }

    /// Packets the caller discarded because the machine rejected their
    /// event (only possible from `Aborted`).
    pub fn sm_drops(&self) -> u64 {
        self.sm_drops
    }

    fn transition_to(&mut self, event: RccEvent, next: RccState) -> Transition {
        if self.log.len() == RING_CAPACITY {
            self.log.pop_front();
        }

        self.log.push_back((self.state, event, next));
        self.state = next;
        Transition::Accept
    }

    fn reject(&mut self) -> Transition {
        self.sm_drops += 1;
        Transition::Reject
    }

    /// Drives the `PRIMARY` event: a primary packet was received.
    pub fn on_primary_pak(&mut self) -> Transition {
        match self.state {
            RccState::Aborted => self.reject(),
            RccState::Idle => self.transition_to(RccEvent::Primary, RccState::SteadyState),
            _ => self.transition_to(RccEvent::Primary, self.state),
        }
    }

    /// Drives the `REPAIR` event: a repair packet was received.
    pub fn on_repair_pak(&mut self) -> Transition {
        match self.state {
            RccState::Aborted => self.reject(),
            RccState::Idle => self.transition_to(RccEvent::Repair, RccState::AwaitingFirstSeq),
            _ => self.transition_to(RccEvent::Repair, self.state),
        }
    }

    /// Drives the `TIME_FIRST_SEQ` event once the APP packet's first
    /// expected repair sequence has been applied and the holdq released.
    pub fn on_time_first_seq(&mut self) -> Transition {
        match self.state {
            RccState::Aborted => Transition::Reject,
            _ => self.transition_to(RccEvent::TimeFirstSeq, RccState::Bursting),
        }
    }

    pub fn abort(&mut self) {
        self.transition_to(RccEvent::Abort, RccState::Aborted);
    }
}
