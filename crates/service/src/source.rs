//! The per-receiver source table: up to `MAX_KNOWN_SOURCES` concurrent RTP
//! sources, ordered so the packet-flow source (if any) sits at the head.
//!
//! With a cap this small a linear scan beats a hashed lookup, so this is a
//! small-vector rather than a map; `pktflow_index` caches the head position
//! to avoid a scan on the hot path.

use std::{net::SocketAddr, time::Instant};

use codec::MAX_CSRCC;

pub const AGE_THRESHOLD_SECS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RtpSourceKey {
    pub ssrc: u32,
    pub src_addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Active,
    Inactive,
}

/// Opportunistic, inert statistics snapshots. Their fields are not consulted
/// by any dispatch decision in this core; they exist to be exported verbatim
/// to the control plane.
#[derive(Debug, Clone, Copy, Default)]
pub struct XrStats {
    pub loss_run_length: u32,
    pub jitter: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostErStats {
    pub discards: u32,
    pub duplicates: u32,
}

#[derive(Debug, Clone)]
pub struct RtpSourceEntry {
    pub key: RtpSourceKey,
    pub state: SourceState,
    pub packet_flow_permitted: bool,
    pub buffer_for_failover: bool,
    pub first_rx_time: Instant,
    pub last_rx_time: Instant,
    pub csrc_count: u8,
    pub csrcs: [u32; MAX_CSRCC],
    pub byte_count: u64,
    pub packet_count: u64,
    pub drops: u64,
    pub session_rtp_seq_num_offset: i16,
    pub xr_stats: Option<XrStats>,
    pub post_er_stats: Option<PostErStats>,
    pub received_since_last_check: bool,
    pub thresh_cnt: u32,
}

impl RtpSourceEntry {
    fn new(key: RtpSourceKey, now: Instant) -> Self {
        Self {
            key,
            state: SourceState::Inactive,
            packet_flow_permitted: false,
            buffer_for_failover: false,
            first_rx_time: now,
            last_rx_time: now,
            csrc_count: 0,
            csrcs: [0; MAX_CSRCC],
            byte_count: 0,
            packet_count: 0,
            drops: 0,
            session_rtp_seq_num_offset: 0,
            xr_stats: None,
            post_er_stats: None,
            received_since_last_check: false,
            thresh_cnt: 0,
        }
    }

    /// Replaces the cached CSRC list if it differs; returns whether it did.
    pub fn update_csrc(&mut self, csrcs: &[u32]) -> bool {
        if self.csrc_count as usize == csrcs.len() && &self.csrcs[..csrcs.len()] == csrcs {
            return false;
        }

        self.csrc_count = csrcs.len() as u8;
        self.csrcs = [0; MAX_CSRCC];
        self.csrcs[..csrcs.len()].copy_from_slice(csrcs);
        true
    }
}

/// Optional per-receiver SSRC filter. When enabled, a source whose SSRC
/// doesn't match is rejected before table lookup even occurs.
#[derive(Debug, Clone, Copy)]
pub struct SsrcFilter {
    pub ssrc: u32,
    pub drop_count: u64,
}

/// Outcome of looking a key up / inserting it, distinguishing a genuinely
/// new source from one the caller already knew about.
pub enum Lookup {
    Existing(usize),
    New(usize),
    /// Per-receiver or global pool capacity was exceeded; the packet must be
    /// dropped and a rate-limited counter bumped.
    Rejected,
}

/// Ordered set of known sources for one receiver.
pub struct SourceTable {
    sources: Vec<RtpSourceEntry>,
    max_known_sources: usize,
    pub pktflow_index: Option<usize>,
}

impl SourceTable {
    pub fn new(max_known_sources: usize) -> Self {
        Self {
            sources: Vec::with_capacity(max_known_sources),
            max_known_sources,
            pktflow_index: None,
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RtpSourceEntry> {
        self.sources.iter()
    }

    pub fn get(&self, index: usize) -> Option<&RtpSourceEntry> {
        self.sources.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut RtpSourceEntry> {
        self.sources.get_mut(index)
    }

    pub fn find(&self, key: &RtpSourceKey) -> Option<usize> {
        self.sources.iter().position(|s| &s.key == key)
    }

    pub fn pktflow(&self) -> Option<&RtpSourceEntry> {
        self.pktflow_index.and_then(|i| self.sources.get(i))
    }

    /// Linear scan for the (at most one) source currently buffered for
    /// failover. Cheap at `MAX_KNOWN_SOURCES`-scale tables; no cached index
    /// is kept since promotion/demotion already has to touch every entry.
    pub fn failover_index(&self) -> Option<usize> {
        self.sources.iter().position(|s| s.buffer_for_failover)
    }

    /// Looks up `key`, global-pool permitting creates a new entry when
    /// absent. `global_room` is a closure reporting whether the process-wide
    /// source slab has a free slot.
    pub fn lookup_or_create(
        &mut self,
        key: RtpSourceKey,
        now: Instant,
        global_room: impl FnOnce() -> bool,
    ) -> Lookup {
        if let Some(i) = self.find(&key) {
            return Lookup::Existing(i);
        }

        if self.sources.len() >= self.max_known_sources || !global_room() {
            return Lookup::Rejected;
        }

        self.sources.push(RtpSourceEntry::new(key, now));
        Lookup::New(self.sources.len() - 1)
    }

    pub fn delete(&mut self, index: usize) {
        self.sources.remove(index);

        self.pktflow_index = match self.pktflow_index {
            Some(p) if p == index => None,
            Some(p) if p > index => Some(p - 1),
            other => other,
        };
    }

    pub fn delete_key(&mut self, key: &RtpSourceKey) {
        if let Some(i) = self.find(key) {
            self.delete(i);
        }
    }

    /// Moves a source to the head of the list (the position the
    /// packet-flow source occupies) and caches its new index.
    pub fn promote_to_head(&mut self, index: usize) {
        if index != 0 {
            let entry = self.sources.remove(index);
            self.sources.insert(0, entry);
        }

        self.pktflow_index = Some(0);
    }

    pub fn clear_pktflow(&mut self) {
        if let Some(i) = self.pktflow_index.take() {
            if let Some(s) = self.sources.get_mut(i) {
                s.packet_flow_permitted = false;
            }
        }
    }

    /// Deletes every source whose SSRC doesn't match `ssrc` (used when an
    /// SSRC filter is installed).
    pub fn purge_non_matching(&mut self, ssrc: u32) {
        let pktflow_key = self.pktflow().map(|s| s.key);

        self.sources.retain(|s| s.key.ssrc == ssrc);

        self.pktflow_index = pktflow_key
            .filter(|k| k.ssrc == ssrc)
            .and_then(|k| self.sources.iter().position(|s| s.key == k));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ssrc: u32, port: u16) -> RtpSourceKey {
        RtpSourceKey {
            ssrc,
            src_addr: SocketAddr::new("127.0.0.1".parse().unwrap(), port),
        }
    }

    #[test]
    fn lookup_or_create_distinguishes_new_and_existing() {
        let mut table = SourceTable::new(4);
        let now = Instant::now();
        let k = key(1, 5000);

        match table.lookup_or_create(k, now, || true) {
            Lookup::New(i) => assert_eq!(i, 0),
            _ => panic!("expected a new source"),
        }

        match table.lookup_or_create(k, now, || true) {
            Lookup::Existing(i) => assert_eq!(i, 0),
            _ => panic!("expected the same source to be found"),
        }
    }

    #[test]
    fn lookup_or_create_rejects_past_capacity() {
        let mut table = SourceTable::new(1);
        let now = Instant::now();
        table.lookup_or_create(key(1, 5000), now, || true);

        match table.lookup_or_create(key(2, 5001), now, || true) {
            Lookup::Rejected => {}
            _ => panic!("table is full, second distinct source must be rejected"),
        }
    }

    #[test]
    fn lookup_or_create_rejects_when_global_pool_is_full() {
        let mut table = SourceTable::new(4);
        let now = Instant::now();
        match table.lookup_or_create(key(1, 5000), now, || false) {
            Lookup::Rejected => {}
            _ => panic!("global pool reported no room, must reject"),
        }
        assert!(table.is_empty());
    }

    #[test]
    fn promote_to_head_moves_entry_and_caches_index() {
        let mut table = SourceTable::new(4);
        let now = Instant::now();
        table.lookup_or_create(key(1, 5000), now, || true);
        table.lookup_or_create(key(2, 5001), now, || true);
        table.lookup_or_create(key(3, 5002), now, || true);

        table.promote_to_head(2);
        assert_eq!(table.pktflow_index, Some(0));
        assert_eq!(table.pktflow().unwrap().key, key(3, 5002));
        assert_eq!(table.find(&key(1, 5000)), Some(1));
        assert_eq!(table.find(&key(2, 5001)), Some(2));
    }

    #[test]
    fn delete_reindexes_pktflow() {
        let mut table = SourceTable::new(4);
        let now = Instant::now();
        table.lookup_or_create(key(1, 5000), now, || true);
        table.lookup_or_create(key(2, 5001), now, || true);
        table.promote_to_head(1);
        assert_eq!(table.pktflow_index, Some(0));

        // Deleting an entry before the packet-flow head shifts its index.
        table.lookup_or_create(key(3, 5002), now, || true);
        let idx = table.find(&key(3, 5002)).unwrap();
        assert!(idx > 0);
        table.delete(0);
        assert_eq!(table.pktflow_index, None, "deleting the pktflow entry itself clears the cache");
    }

    #[test]
    fn failover_index_finds_the_buffered_source() {
        let mut table = SourceTable::new(4);
        let now = Instant::now();
        table.lookup_or_create(key(1, 5000), now, || true);
        let i = table.lookup_or_create(key(2, 5001), now, || true);
        let idx = match i {
            Lookup::New(i) => i,
            _ => unreachable!(),
        };

        assert!(table.failover_index().is_none());
        table.get_mut(idx).unwrap().buffer_for_failover = true;
        assert_eq!(table.failover_index(), Some(idx));
    }

    #[test]
    fn purge_non_matching_keeps_only_matching_ssrc_and_tracks_pktflow() {
        let mut table = SourceTable::new(4);
        let now = Instant::now();
        table.lookup_or_create(key(1, 5000), now, || true);
        table.lookup_or_create(key(2, 5001), now, || true);
        table.promote_to_head(1);

        table.purge_non_matching(2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.pktflow_index, Some(0));
        assert_eq!(table.get(0).unwrap().key, key(2, 5001));
    }

    #[test]
    fn purge_non_matching_clears_pktflow_when_head_is_purged() {
        let mut table = SourceTable::new(4);
        let now = Instant::now();
        table.lookup_or_create(key(1, 5000), now, || true);
        table.lookup_or_create(key(2, 5001), now, || true);
        table.promote_to_head(0);

        table.purge_non_matching(2);
        assert!(table.pktflow_index.is_none());
    }

    #[test]
    fn update_csrc_reports_whether_it_changed() {
        let mut entry = RtpSourceEntry::new(key(1, 5000), Instant::now());
        assert!(entry.update_csrc(&[1, 2]));
        assert!(!entry.update_csrc(&[1, 2]), "identical list is not a change");
        assert!(entry.update_csrc(&[1, 2, 3]));
    }
}
