//! End-to-end failover scenarios driven through the public `Channel`/
//! `RtpReceiver` API, standing in for the "failover" test set (E1-E7) and
//! the universal invariants of §8 that are observable at this core's level
//! (CP source-update bookkeeping and repair-request counting belong to an
//! out-of-scope orchestrator and aren't re-derived here).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use dataplane_core::channel::{Channel, PcmSink};
use dataplane_core::pool::{PakKind, Pool};
use dataplane_core::receiver::{Dispatch, RtpReceiver};
use dataplane_core::source::RtpSourceKey;
use dataplane_core::upcall::UpcallQueue;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

fn rtp_packet(seq: u16, ssrc: u32, timestamp: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 16];
    buf[0] = 0x80; // version 2, no CSRC
    buf[1] = 96; // payload type
    buf[2..4].copy_from_slice(&seq.to_be_bytes());
    buf[4..8].copy_from_slice(&timestamp.to_be_bytes());
    buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
    buf[12..16].copy_from_slice(b"data");
    buf
}

/// Records every packet PCM accepted, in order, for assertions.
#[derive(Default)]
struct TestPcm {
    last_rx_seq_num: u32,
    delivered: Vec<(u32, bool)>,
}

impl PcmSink for TestPcm {
    fn last_rx_seq_num(&self) -> u32 {
        self.last_rx_seq_num
    }

    fn highest_rx_seq_num(&self) -> u32 {
        self.last_rx_seq_num
    }

    fn insert(&mut self, _channel_id: u32, seq_num: u32, _rtp_timestamp: u32, _payload: &[u8], discontinuity: bool) -> bool {
        self.last_rx_seq_num = seq_num;
        self.delivered.push((seq_num, discontinuity));
        true
    }
}

fn send_primary(
    receiver: &RtpReceiver,
    pool: &Pool,
    channel: &mut Channel,
    pcm: &mut TestPcm,
    upcalls: &UpcallQueue,
    src: SocketAddr,
    ssrc: u32,
    seq: u16,
) -> Dispatch {
    let handle = pool.alloc(src, PakKind::Primary).expect("pool has room");
    pool.write_payload(handle, &rtp_packet(seq, ssrc, seq as u32 * 160));
    receiver.receive_primary(channel, pcm, upcalls, handle, Instant::now())
}

/// E6-equivalent: source A streams, source B overlaps and is promoted while
/// A's tail is still queued in the failover buffer; the splice must stitch
/// B's 16-bit sequence numbers onto A's extended space without a gap.
#[test]
fn overlapping_sources_splice_without_gap() {
    let pool = Pool::new(16, 1500);
    let receiver = RtpReceiver::new(pool.clone());
    let upcalls = UpcallQueue::new();
    let mut channel = Channel::new(0, false, 3, 128);
    let mut pcm = TestPcm::default();

    let a = addr(5000);
    let b = addr(5002);

    // A streams first; the first packet creates and activates the source
    // but isn't yet packet-flow (nothing is, until explicitly promoted).
    for seq in 0u16..5 {
        send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, a, 0xAAAA, seq);
    }

    let key_a = RtpSourceKey { ssrc: 0xAAAA, src_addr: a };
    receiver.promote_permit_pktflow(&mut channel, &mut pcm, key_a, Some(0));
    assert_eq!(channel.primary.pktflow().map(|s| s.key), Some(key_a));

    for seq in 5u16..10 {
        let d = send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, a, 0xAAAA, seq);
        assert_eq!(d, Dispatch::PacketFlow);
    }
    assert_eq!(pcm.last_rx_seq_num, 9);

    // B starts overlapping; it is not yet pktflow so it lands in the
    // failover queue instead of PCM.
    for seq in 100u16..103 {
        let d = send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, b, 0xBBBB, seq);
        assert_eq!(d, Dispatch::Failover);
    }
    assert_eq!(channel.failover.len(), 3);

    let key_b = RtpSourceKey { ssrc: 0xBBBB, src_addr: b };
    receiver.promote_permit_pktflow(&mut channel, &mut pcm, key_b, None);

    // Failover queue drained in order, first packet marked discontinuous.
    let tail = &pcm.delivered[pcm.delivered.len() - 3..];
    assert!(tail[0].1, "first spliced packet must carry the discontinuity flag");
    assert!(!tail[1].1);
    assert!(!tail[2].1);

    // Sequence numbers must continue forward from A's last delivered value.
    assert!(tail[0].0 > 9);
    assert_eq!(tail[1].0, tail[0].0 + 1);
    assert_eq!(tail[2].0, tail[1].0 + 1);

    assert!(channel.failover.is_empty());
    assert_eq!(channel.primary.pktflow().map(|s| s.key), Some(key_b));
}

/// E2/E7-equivalent: sequence space wraps past 65535 during continuous
/// packet-flow delivery; `nearest_to_rtp_seq_num` must track the wrap.
#[test]
fn sequence_space_wraps_forward() {
    let pool = Pool::new(8, 1500);
    let receiver = RtpReceiver::new(pool.clone());
    let upcalls = UpcallQueue::new();
    let mut channel = Channel::new(0, false, 3, 128);
    let mut pcm = TestPcm::default();
    let a = addr(6000);
    let key = RtpSourceKey { ssrc: 0xC0FFEE, src_addr: a };

    send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, a, 0xC0FFEE, 0xFFFE);
    receiver.promote_permit_pktflow(&mut channel, &mut pcm, key, Some(0));

    for seq in [0xFFFFu16, 0x0000u16, 0x0001u16] {
        send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, a, 0xC0FFEE, seq);
    }

    let seqs: Vec<u32> = pcm.delivered.iter().map(|(s, _)| *s).collect();
    assert!(seqs.windows(2).all(|w| w[1] > w[0]), "extended sequence must be monotonic across the wrap: {seqs:?}");
}

/// Invariant 5 + boundary behavior: the (FAILOVER_PAKS_MAX+1)-th queued
/// packet evicts the oldest and counts as a source-level drop.
#[test]
fn failover_queue_evicts_oldest_past_capacity() {
    let pool = Pool::new(8, 1500);
    let receiver = RtpReceiver::new(pool.clone());
    let upcalls = UpcallQueue::new();
    let mut channel = Channel::new(0, false, 3, 2);
    let mut pcm = TestPcm::default();
    let a = addr(7000);

    for seq in 0u16..3 {
        send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, a, 0xBEEF, seq);
    }

    assert_eq!(channel.failover.len(), 2);
    let entry = channel.primary.get(channel.primary.failover_index().unwrap()).unwrap();
    assert_eq!(entry.drops, 1);
}

/// Invariant 6: once an SSRC filter is installed, no non-matching source is
/// admitted, and an existing non-matching source is purged immediately.
#[test]
fn ssrc_filter_rejects_and_purges() {
    let pool = Pool::new(8, 1500);
    let receiver = RtpReceiver::new(pool.clone());
    let upcalls = UpcallQueue::new();
    let mut channel = Channel::new(0, false, 3, 16);
    let mut pcm = TestPcm::default();
    let a = addr(8000);

    send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, a, 0x1111, 0);
    assert_eq!(channel.primary.len(), 1);

    receiver.install_ssrc_filter(&mut channel, 0x2222);
    assert_eq!(channel.primary.len(), 0, "non-matching source must be purged on install");

    let d = send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, a, 0x1111, 1);
    assert_eq!(d, Dispatch::Dropped);
    assert_eq!(channel.primary.len(), 0);
    assert_eq!(channel.primary_ssrc_filter.unwrap().drop_count, 1);

    let d = send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, a, 0x2222, 1);
    assert_eq!(d, Dispatch::Failover, "matching source is admitted, not dropped by the filter");
}

/// Boundary: the 65th-source analog — with a small `max_known_sources`, the
/// table rejects admission past capacity rather than growing.
#[test]
fn source_table_rejects_past_capacity() {
    let pool = Pool::new(2, 1500);
    let receiver = RtpReceiver::new(pool.clone());
    let upcalls = UpcallQueue::new();
    let mut channel = Channel::new(0, false, 2, 16);
    let mut pcm = TestPcm::default();

    for i in 0..2u32 {
        let d = send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, addr(9000 + i as u16), i, 0);
        assert_ne!(d, Dispatch::Dropped);
    }
    assert_eq!(channel.primary.len(), 2);

    let d = send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, addr(9002), 99, 0);
    assert_eq!(d, Dispatch::Dropped);
    assert_eq!(channel.primary.len(), 2, "table must not grow past max_known_sources");
}

/// §4.4.3: promoting a new source over an existing packet-flow source must
/// snapshot PCM's highest delivered sequence before the old source is
/// demoted, so a later repair request never asks below it.
#[test]
fn promotion_snapshots_repair_request_floor() {
    let pool = Pool::new(8, 1500);
    let receiver = RtpReceiver::new(pool.clone());
    let upcalls = UpcallQueue::new();
    let mut channel = Channel::new(0, false, 3, 16);
    let mut pcm = TestPcm::default();
    let a = addr(11000);
    let b = addr(11002);

    send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, a, 0xA, 0);
    let key_a = RtpSourceKey { ssrc: 0xA, src_addr: a };
    receiver.promote_permit_pktflow(&mut channel, &mut pcm, key_a, Some(0));
    assert!(channel.repair_request_floor.is_none(), "nothing was demoted on the first promotion");

    for seq in 0u16..4 {
        send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, a, 0xA, seq);
    }
    assert_eq!(pcm.last_rx_seq_num, 3);

    send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, b, 0xB, 0);
    let key_b = RtpSourceKey { ssrc: 0xB, src_addr: b };
    receiver.promote_permit_pktflow(&mut channel, &mut pcm, key_b, Some(0));

    assert_eq!(channel.repair_request_floor, Some(3), "floor must reflect PCM's state before A was demoted");
}

/// Activity scan demotes a silent packet-flow source and re-elects a new
/// failover candidate from the remaining active sources.
#[test]
fn activity_scan_demotes_and_reelects() {
    let pool = Pool::new(8, 1500);
    let receiver = RtpReceiver::new(pool.clone());
    let upcalls = UpcallQueue::new();
    let mut channel = Channel::new(0, false, 3, 16);
    let mut pcm = TestPcm::default();
    let a = addr(10000);
    let b = addr(10002);

    send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, a, 0xA, 0);
    let key_a = RtpSourceKey { ssrc: 0xA, src_addr: a };
    receiver.promote_permit_pktflow(&mut channel, &mut pcm, key_a, Some(0));

    send_primary(&receiver, &pool, &mut channel, &mut pcm, &upcalls, b, 0xB, 0);
    assert!(channel.primary.failover_index().is_some());

    // First scan just clears the "received since last check" flag set by
    // each source's one packet; the second scan, seeing no packets arrived
    // in between, is what actually demotes a silent source to inactive.
    receiver.activity_scan(&mut channel, &upcalls, Instant::now());
    receiver.activity_scan(&mut channel, &upcalls, Instant::now() + Duration::from_millis(1));

    let a_idx = channel.primary.find(&key_a).unwrap();
    assert_eq!(channel.primary.get(a_idx).unwrap().state, dataplane_core::source::SourceState::Inactive);
}
