//! Per-packet RTP receive path: header validation, source-table lookup,
//! activity tracking, election, and dispatch to PCM, the failover queue, or
//! the drop counter.

use std::time::Instant;

use codec::{
    looks_like_stun,
    rtp::RtpHeader,
    seq::{nearest_to_rtp_seq_num, next_rtp_seq_num},
};

use crate::{
    channel::{Channel, DebugFlags, FecSlot, PcmSink},
    failover::QueuedPak,
    pool::{PakFlags, PakHandle, PakKind, Pool},
    rcc::{RccAppPacket, RccState, Transition},
    source::{Lookup, RtpSourceKey, SourceState, SsrcFilter, XrStats, PostErStats},
    upcall::{Device, Reason, UpcallQueue},
};

/// Outcome of feeding one datagram through the primary-stream path, for
/// callers that want to account for it (tests, statistics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    PacketFlow,
    Failover,
    Dropped,
    /// Failed RTP validation but looked like STUN; ejected to the
    /// control-plane channel rather than counted as a parse drop.
    EjectedStun,
    /// Repair packet stashed in the RCC holdq, awaiting the APP packet's
    /// first-expected-sequence field before it can be admitted or dropped.
    Held,
}

pub struct RtpReceiver {
    pool: Pool,
}

impl RtpReceiver {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn parse(&self, handle: PakHandle) -> Result<RtpHeader, ()> {
        let parsed = self
            .pool
            .with_payload(handle, |bytes| RtpHeader::parse(bytes).map_err(|_| bytes.first().copied()));

        match parsed {
            Some(Ok(header)) => Ok(header),
            Some(Err(Some(first))) if first >> 6 == 0 => Err(()),
            _ => Err(()),
        }
    }

    /// Primary-stream path (§4.4, steps 1-6). An enabled SSRC filter
    /// pre-rejects non-matching sources before table lookup, as installing
    /// one does retroactively via `purge_non_matching`.
    pub fn receive_primary(
        &self,
        channel: &mut Channel,
        pcm: &mut impl PcmSink,
        upcalls: &UpcallQueue,
        handle: PakHandle,
        now: Instant,
    ) -> Dispatch {
        let header = match self.parse(handle) {
            Ok(h) => h,
            Err(()) => {
                let looks_stun = self
                    .pool
                    .with_payload(handle, |b| looks_like_stun(b))
                    .unwrap_or(false);
                self.pool.free(handle);
                return if looks_stun {
                    Dispatch::EjectedStun
                } else {
                    Dispatch::Dropped
                };
            }
        };

        if channel.rcc.on_primary_pak() == Transition::Reject {
            self.pool.free(handle);
            return Dispatch::Dropped;
        }

        let meta = match self.pool.meta(handle) {
            Some(m) => m,
            None => return Dispatch::Dropped,
        };

        let key = RtpSourceKey {
            ssrc: header.ssrc,
            src_addr: meta.src_addr,
        };

        if let Some(filter) = channel.primary_ssrc_filter.as_mut() {
            if key.ssrc != filter.ssrc {
                filter.drop_count += 1;
                self.pool.free(handle);
                return Dispatch::Dropped;
            }
        }

        let pool = &self.pool;
        let lookup = channel
            .primary
            .lookup_or_create(key, now, || pool.available() > 0);

        let index = match lookup {
            Lookup::Rejected => {
                self.pool.free(handle);
                return Dispatch::Dropped;
            }
            Lookup::New(i) => i,
            Lookup::Existing(i) => i,
        };

        let is_new = matches!(lookup, Lookup::New(_));
        let was_inactive;
        let is_pktflow;
        let is_failover;
        let csrc_changed;

        {
            let entry = channel.primary.get_mut(index).expect("just looked up");
            entry.packet_count += 1;
            entry.byte_count += header.header_len() as u64;
            entry.last_rx_time = now;
            entry.received_since_last_check = true;
            was_inactive = entry.state == SourceState::Inactive;
            if was_inactive {
                entry.state = SourceState::Active;
                entry.thresh_cnt += 1;
            }
            csrc_changed = entry.update_csrc(&header.csrc_list());
            is_pktflow = entry.packet_flow_permitted;
            is_failover = entry.buffer_for_failover;
        }

        if is_new {
            upcalls.raise(channel.id, channel.generation(), Device::RtpPrimary, 0, Reason::RTP_SRC_NEW);
        }
        if was_inactive {
            upcalls.raise(
                channel.id,
                channel.generation(),
                Device::RtpPrimary,
                0,
                Reason::RTP_SRC_ISACTIVE,
            );
        }
        if csrc_changed {
            upcalls.raise(
                channel.id,
                channel.generation(),
                Device::RtpPrimary,
                0,
                Reason::RTP_SRC_CSRC_UPDATE,
            );
        }

        if was_inactive && !is_pktflow && !is_failover && channel.primary.failover_index().is_none() {
            channel
                .primary
                .get_mut(index)
                .expect("just looked up")
                .buffer_for_failover = true;
        }

        if is_pktflow {
            let offset = channel.primary.get(index).expect("just looked up").session_rtp_seq_num_offset;
            let spliced_seq = (header.sequence as i32).wrapping_add(offset as i32) as u16;
            let projected = nearest_to_rtp_seq_num(pcm.last_rx_seq_num(), spliced_seq as u32);
            self.pool.update_meta(handle, |m| {
                m.seq_num = projected;
                m.rtp_timestamp = header.timestamp;
                m.kind = PakKind::Primary;
                m.flags.clear(PakFlags::AFTER_EC);
            });

            let retained = self.pool.with_payload(handle, |bytes| {
                pcm.insert(channel.id, projected, header.timestamp, bytes, false)
            });

            if retained != Some(true) {
                let entry = channel.primary.get_mut(index).expect("just looked up");
                entry.drops += 1;
            }

            self.pool.free(handle);
            Dispatch::PacketFlow
        } else if is_failover || (was_inactive && channel.primary.failover_index() == Some(index)) {
            self.pool.pak_ref(handle);
            if let Some(crate::failover::Evicted(evicted)) = channel.failover.push(QueuedPak {
                handle,
                rtp_sequence: header.sequence,
            }) {
                if let Some(fi) = channel.primary.failover_index() {
                    if let Some(entry) = channel.primary.get_mut(fi) {
                        entry.drops += 1;
                    }
                }
                self.pool.free(evicted);
            }
            self.pool.free(handle);
            Dispatch::Failover
        } else {
            let entry = channel.primary.get_mut(index).expect("just looked up");
            entry.drops += 1;
            self.pool.free(handle);
            Dispatch::Dropped
        }
    }

    /// Repair-stream path (§4.4): no failover queue; every source that
    /// passes the SSRC filter is marked packet-flow-permitted on sight, and
    /// inherits the primary's current splice offset on unicast channels.
    ///
    /// While the RCC state machine is still awaiting the APP packet's
    /// first-expected-sequence field (§4.4.1a), repair packets are stashed
    /// in the channel's holdq instead of admitted; [`Self::receive_rcc_app`]
    /// releases them once that field is known.
    pub fn receive_repair(
        &self,
        channel: &mut Channel,
        upcalls: &UpcallQueue,
        handle: PakHandle,
        now: Instant,
    ) -> Dispatch {
        let header = match self.parse(handle) {
            Ok(h) => h,
            Err(()) => {
                self.pool.free(handle);
                return Dispatch::Dropped;
            }
        };

        let meta = match self.pool.meta(handle) {
            Some(m) => m,
            None => return Dispatch::Dropped,
        };

        let key = RtpSourceKey {
            ssrc: header.ssrc,
            src_addr: meta.src_addr,
        };

        if let Some(filter) = channel.repair_ssrc_filter.as_mut() {
            if key.ssrc != filter.ssrc {
                filter.drop_count += 1;
                self.pool.free(handle);
                return Dispatch::Dropped;
            }
        }

        if channel.rcc.on_repair_pak() == Transition::Reject {
            self.pool.free(handle);
            return Dispatch::Dropped;
        }

        if channel.rcc.state() == RccState::AwaitingFirstSeq {
            self.pool.pak_ref(handle);
            channel.holdq.push((handle, header.sequence));
            self.pool.free(handle);
            return Dispatch::Held;
        }

        self.admit_repair(channel, upcalls, handle, now, key, &header)
    }

    /// Stashes an out-of-band RCC APP packet and releases the holdq: any
    /// packet sequenced before `app.first_seq` is discarded (it predates the
    /// channel-change join point), the rest are admitted in sequence order.
    pub fn receive_rcc_app(&self, channel: &mut Channel, upcalls: &UpcallQueue, app: RccAppPacket, now: Instant) {
        channel.rcc.stash_app(app);
        channel.rcc.on_time_first_seq();

        let mut held = std::mem::take(&mut channel.holdq);
        held.sort_by_key(|(_, seq)| *seq);

        for (handle, seq) in held {
            if (seq.wrapping_sub(app.first_seq) as i16) < 0 {
                self.pool.free(handle);
                continue;
            }

            let (header, meta) = match (self.parse(handle), self.pool.meta(handle)) {
                (Ok(h), Some(m)) => (h, m),
                _ => {
                    self.pool.free(handle);
                    continue;
                }
            };

            let key = RtpSourceKey {
                ssrc: header.ssrc,
                src_addr: meta.src_addr,
            };

            self.admit_repair(channel, upcalls, handle, now, key, &header);
        }
    }

    /// Shared repair-source bookkeeping: offset assignment for a new source,
    /// per-source counters, and CSRC-update upcalls. Always consumes
    /// `handle`.
    fn admit_repair(
        &self,
        channel: &mut Channel,
        upcalls: &UpcallQueue,
        handle: PakHandle,
        now: Instant,
        key: RtpSourceKey,
        header: &RtpHeader,
    ) -> Dispatch {
        let is_multicast = channel.is_multicast;
        let pool = &self.pool;
        let lookup = channel
            .repair
            .lookup_or_create(key, now, || pool.available() > 0);

        let index = match lookup {
            Lookup::Rejected => {
                self.pool.free(handle);
                return Dispatch::Dropped;
            }
            Lookup::New(i) => i,
            Lookup::Existing(i) => i,
        };

        if matches!(lookup, Lookup::New(_)) {
            let offset = if is_multicast {
                Some(0)
            } else {
                channel.primary.pktflow().map(|s| s.session_rtp_seq_num_offset)
            };

            match offset {
                Some(offset) => {
                    channel.repair.get_mut(index).expect("just inserted").session_rtp_seq_num_offset = offset;
                    channel.repair.get_mut(index).expect("just inserted").packet_flow_permitted = true;
                }
                None => {
                    channel.repair.delete(index);
                    self.pool.free(handle);
                    return Dispatch::Dropped;
                }
            }
        }

        let csrc_changed;
        {
            let entry = channel.repair.get_mut(index).expect("just looked up");
            entry.packet_count += 1;
            entry.byte_count += header.header_len() as u64;
            entry.last_rx_time = now;
            entry.received_since_last_check = true;
            csrc_changed = entry.update_csrc(&header.csrc_list());
        }

        if csrc_changed {
            upcalls.raise(
                channel.id,
                channel.generation(),
                Device::RtpRepair,
                0,
                Reason::RTP_SRC_CSRC_UPDATE,
            );
        }

        self.pool.free(handle);
        Dispatch::PacketFlow
    }

    /// FEC path (§4.4): a FEC stream accounts exactly one aggregate source
    /// per column/row slot regardless of SSRC — the first packet creates it,
    /// every later packet (from any sender) just bumps its counters, mirroring
    /// the original's single zero-keyed FEC source entry.
    pub fn receive_fec(&self, channel: &mut Channel, slot: FecSlot, upcalls: &UpcallQueue, handle: PakHandle, now: Instant) -> Dispatch {
        let header = match self.parse(handle) {
            Ok(h) => h,
            Err(()) => {
                self.pool.free(handle);
                return Dispatch::Dropped;
            }
        };

        let meta = match self.pool.meta(handle) {
            Some(m) => m,
            None => {
                self.pool.free(handle);
                return Dispatch::Dropped;
            }
        };

        let slot_index = match slot {
            FecSlot::Column => 0,
            FecSlot::Row => 1,
        };

        let Some(table) = channel.fec[slot_index].as_mut() else {
            self.pool.free(handle);
            return Dispatch::Dropped;
        };

        let index = if table.is_empty() {
            let key = RtpSourceKey {
                ssrc: header.ssrc,
                src_addr: meta.src_addr,
            };
            let pool = &self.pool;
            match table.lookup_or_create(key, now, || pool.available() > 0) {
                Lookup::Rejected => {
                    self.pool.free(handle);
                    return Dispatch::Dropped;
                }
                Lookup::New(i) | Lookup::Existing(i) => i,
            }
        } else {
            0
        };

        {
            let entry = table.get_mut(index).expect("just ensured");
            entry.packet_count += 1;
            entry.byte_count += header.header_len() as u64;
            entry.last_rx_time = now;
            entry.received_since_last_check = true;
        }

        upcalls.raise(channel.id, channel.generation(), Device::RtpFec, 0, Reason::CHAN_FEC_UPDATE);

        self.pool.free(handle);
        Dispatch::PacketFlow
    }

    /// Promotes a source to packet-flow, computing and applying the splice
    /// offset per §4.4.3, and draining/discarding the failover queue.
    pub fn promote_permit_pktflow(
        &self,
        channel: &mut Channel,
        pcm: &mut impl PcmSink,
        key: RtpSourceKey,
        caller_offset: Option<i16>,
    ) {
        let Some(new_index) = channel.primary.find(&key) else {
            return;
        };

        if channel.primary.pktflow_index == Some(new_index) {
            return;
        }

        let offset = if channel.is_multicast {
            0
        } else if let Some(o) = caller_offset {
            o
        } else {
            match channel.failover.lowest_rtp_sequence() {
                Some(lowest) => {
                    let next = next_rtp_seq_num(pcm.last_rx_seq_num() as u16);
                    next.wrapping_sub(lowest) as i16
                }
                None => {
                    log::error!(
                        "channel {}: splicing with empty failoverq, offset forced to 0 (CHAN_NEW_SOURCE_SYNC_ERROR)",
                        channel.id
                    );
                    0
                }
            }
        };

        if let Some(prev) = channel.primary.pktflow_index {
            // Snapshot PCM's highest delivered sequence before demoting the
            // current source, so a repair request never asks for a packet
            // PCM has already moved past.
            channel.repair_request_floor = Some(pcm.highest_rx_seq_num());

            if let Some(prev_entry) = channel.primary.get_mut(prev) {
                prev_entry.packet_flow_permitted = false;
                channel.prev_src_last_rcv_ts = Some(prev_entry.last_rx_time);
            }
        }

        let was_failover = channel.primary.failover_index() == Some(new_index);

        {
            let entry = channel.primary.get_mut(new_index).expect("checked above");
            entry.session_rtp_seq_num_offset = offset;
            entry.packet_flow_permitted = true;
        }

        channel.primary.promote_to_head(new_index);
        channel.bump_generation();

        // `splice_failover` locates the failover source by its
        // `buffer_for_failover` flag and reads its offset before clearing
        // the flag itself, so it must run while that flag still points at
        // `new_index` (cleared here only for the non-failover promotion
        // path, where it was already false).
        if was_failover {
            self.splice_failover(channel, pcm, true);
        } else if let Some(entry) = channel.primary.get_mut(new_index) {
            entry.buffer_for_failover = false;
        }

        self.reelect_failover(channel);
    }

    /// §4.4.2: drain the failover queue onto PCM (`accept = true`) or
    /// discard it (`accept = false`), always clearing `buffer_for_failover`
    /// and unassigning the failover pointer on the owning source.
    pub fn splice_failover(&self, channel: &mut Channel, pcm: &mut impl PcmSink, accept: bool) {
        let queued = channel.failover.drain();
        let failover_index = channel.primary.failover_index();

        if accept {
            for (i, q) in queued.into_iter().enumerate() {
                if let Some(meta) = self.pool.meta(q.handle) {
                    let offset = failover_index
                        .and_then(|fi| channel.primary.get(fi))
                        .map(|e| e.session_rtp_seq_num_offset)
                        .unwrap_or(0);
                    let spliced_seq = (q.rtp_sequence as i32).wrapping_add(offset as i32) as u16;
                    let projected = nearest_to_rtp_seq_num(pcm.last_rx_seq_num(), spliced_seq as u32);
                    let retained = self.pool.with_payload(q.handle, |bytes| {
                        pcm.insert(channel.id, projected, meta.rtp_timestamp, bytes, i == 0)
                    });
                    if retained != Some(true) {
                        if let Some(fi) = failover_index {
                            if let Some(e) = channel.primary.get_mut(fi) {
                                e.drops += 1;
                            }
                        }
                    }
                }
                self.pool.free(q.handle);
            }
        } else {
            let n = queued.len() as u64;
            if let Some(fi) = failover_index {
                if let Some(e) = channel.primary.get_mut(fi) {
                    e.drops += n;
                }
            }
            for q in queued {
                self.pool.free(q.handle);
            }
        }

        if let Some(fi) = failover_index {
            if let Some(e) = channel.primary.get_mut(fi) {
                e.buffer_for_failover = false;
            }
        }
    }

    fn reelect_failover(&self, channel: &mut Channel) {
        let pktflow = channel.primary.pktflow_index;
        let mut best: Option<(usize, Instant)> = None;

        for (i, s) in channel.primary.iter().enumerate() {
            if Some(i) == pktflow || s.state != SourceState::Active {
                continue;
            }
            if best.is_none_or(|(_, t)| s.last_rx_time > t) {
                best = Some((i, s.last_rx_time));
            }
        }

        if let Some((i, _)) = best {
            if let Some(e) = channel.primary.get_mut(i) {
                e.buffer_for_failover = true;
            }
        }
    }

    /// §4.4.5, periodic, primary streams only.
    pub fn activity_scan(&self, channel: &mut Channel, upcalls: &UpcallQueue, now: Instant) {
        let mut to_delete = Vec::new();
        let mut lost_failover = false;
        let mut went_inactive = Vec::new();
        let collect_stats = channel.debug_flags.contains(DebugFlags::COLLECT_STATS);

        for i in 0..channel.primary.len() {
            let entry = channel.primary.get_mut(i).expect("in range");

            if collect_stats {
                entry.xr_stats = Some(XrStats {
                    loss_run_length: entry.drops as u32,
                    jitter: 0,
                });
                entry.post_er_stats = Some(PostErStats {
                    discards: entry.drops as u32,
                    duplicates: 0,
                });
            }

            if !entry.received_since_last_check && entry.state == SourceState::Active {
                entry.state = SourceState::Inactive;
                went_inactive.push(entry.packet_flow_permitted);
                if entry.buffer_for_failover {
                    entry.buffer_for_failover = false;
                    lost_failover = true;
                }
            } else {
                entry.received_since_last_check = false;
            }

            let age_eligible = entry.state == SourceState::Inactive
                && !entry.packet_flow_permitted
                && now.duration_since(entry.last_rx_time).as_secs() > crate::source::AGE_THRESHOLD_SECS;

            if age_eligible {
                to_delete.push(i);
            }
        }

        for &i in to_delete.iter().rev() {
            channel.primary.delete(i);
        }

        for was_pktflow in went_inactive {
            let reason = if was_pktflow {
                Reason::RTP_SRC_ISINACTIVE.union(Reason::CHAN_PRIM_INACTIVE)
            } else {
                Reason::RTP_SRC_ISINACTIVE
            };
            upcalls.raise(channel.id, channel.generation(), Device::RtpPrimary, 0, reason);
        }

        if lost_failover {
            if channel.debug_flags.contains(DebugFlags::FAILOVER_DEBUG) {
                log::debug!(
                    "channel {}: failover candidate went inactive, discarding its queued packets",
                    channel.id
                );
            }
            self.splice_failover(channel, &mut crate::channel::NullPcm::default(), false);
            self.reelect_failover(channel);
        }
    }

    /// §4.4.6: installing purges every non-matching source immediately;
    /// removing leaves existing sources untouched.
    pub fn install_ssrc_filter(&self, channel: &mut Channel, ssrc: u32) {
        channel.primary.purge_non_matching(ssrc);
        channel.primary_ssrc_filter = Some(SsrcFilter { ssrc, drop_count: 0 });
    }

    pub fn remove_ssrc_filter(&self, channel: &mut Channel) {
        channel.primary_ssrc_filter = None;
    }
}
