//! Channel registry: the receive-side state for one tuned channel, grouping
//! its primary stream with optional repair/FEC input streams and the
//! bookkeeping a source change needs (splice offsets, RCC state, generation
//! counter for upcall correlation).

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Instant,
};

use crate::{
    failover::FailoverQueue,
    pool::PakHandle,
    rcc::RccStateMachine,
    source::{SourceTable, SsrcFilter},
};

/// Sink the core hands spliced, sequence-ordered packets to. Actual
/// jitter-buffer and decode behavior is out of scope for this crate; callers
/// supply an implementation (or a no-op one in tests).
///
/// `last_rx_seq_num`/`highest_rx_seq_num` are the PCM's own bookkeeping,
/// consulted by the receiver to project a source's 16-bit RTP sequence onto
/// the session's 32-bit extended space (`last_rx_seq_num`) and to publish a
/// lower bound for future repair requests at splice time
/// (`highest_rx_seq_num`).
pub trait PcmSink {
    fn last_rx_seq_num(&self) -> u32;

    fn highest_rx_seq_num(&self) -> u32;

    /// Inserts one packet; `discontinuity` marks the first packet after a
    /// splice. Returns `true` if PCM retained the packet, `false` if it was
    /// dropped (e.g. duplicate or out-of-bounds sequence) and should be
    /// counted against the source's drop counter.
    fn insert(
        &mut self,
        channel_id: u32,
        seq_num: u32,
        rtp_timestamp: u32,
        payload: &[u8],
        discontinuity: bool,
    ) -> bool;
}

#[derive(Default)]
pub struct NullPcm {
    last_rx_seq_num: u32,
}

impl PcmSink for NullPcm {
    fn last_rx_seq_num(&self) -> u32 {
        self.last_rx_seq_num
    }

    fn highest_rx_seq_num(&self) -> u32 {
        self.last_rx_seq_num
    }

    fn insert(
        &mut self,
        _channel_id: u32,
        seq_num: u32,
        _rtp_timestamp: u32,
        _payload: &[u8],
        _discontinuity: bool,
    ) -> bool {
        self.last_rx_seq_num = seq_num;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecSlot {
    Column,
    Row,
}

/// Runtime-toggleable debug switches, settable over the control-plane API
/// rather than compiled in behind a `#[cfg(feature = ...)]` (the teacher
/// gates its own `COLLECT_STATS` counters at compile time; this core needs
/// them flippable per channel without a rebuild).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugFlags(u8);

impl DebugFlags {
    pub const COLLECT_STATS: Self = Self(1 << 0);
    pub const FAILOVER_DEBUG: Self = Self(1 << 1);

    pub fn set(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn clear(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

pub struct Channel {
    pub id: u32,
    pub is_multicast: bool,
    pub primary: SourceTable,
    pub repair: SourceTable,
    pub fec: [Option<SourceTable>; 2],
    pub failover: FailoverQueue,
    pub rcc: RccStateMachine,
    /// Receive time of the last packet from the previously demoted
    /// packet-flow source, cached across a splice for the control plane's
    /// gap reporting.
    pub prev_src_last_rcv_ts: Option<Instant>,
    /// PCM's highest received extended sequence number, snapshotted just
    /// before a promotion demotes the current packet-flow source. A lower
    /// bound below which the (out-of-scope) error-repair requester must not
    /// ask for retransmissions, since PCM has already moved past them.
    pub repair_request_floor: Option<u32>,
    pub primary_ssrc_filter: Option<SsrcFilter>,
    pub repair_ssrc_filter: Option<SsrcFilter>,
    /// Repair packets received while the RCC state machine is still
    /// awaiting the APP packet's first-expected-sequence field; released in
    /// order (or dropped, for anything preceding `first_seq`) once it
    /// arrives.
    pub holdq: Vec<(PakHandle, u16)>,
    pub debug_flags: DebugFlags,
    generation: AtomicU32,
}

impl Channel {
    pub fn new(id: u32, is_multicast: bool, max_known_sources: usize, failover_max: usize) -> Self {
        Self {
            id,
            is_multicast,
            primary: SourceTable::new(max_known_sources),
            repair: SourceTable::new(max_known_sources),
            fec: [None, None],
            failover: FailoverQueue::new(failover_max),
            rcc: RccStateMachine::default(),
            prev_src_last_rcv_ts: None,
            repair_request_floor: None,
            primary_ssrc_filter: None,
            repair_ssrc_filter: None,
            holdq: Vec::new(),
            debug_flags: DebugFlags::default(),
            generation: AtomicU32::new(0),
        }
    }

    pub fn enable_fec(&mut self, slot: FecSlot, max_known_sources: usize) {
        let index = match slot {
            FecSlot::Column => 0,
            FecSlot::Row => 1,
        };
        self.fec[index] = Some(SourceTable::new(max_known_sources));
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Bumped on every source-change event so stale upcalls can be told
    /// apart from the current state by the control plane.
    pub fn bump_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }
}
