//! FEC path: a single aggregate source entry per column/row slot, bumped by
//! every packet regardless of its SSRC.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use dataplane_core::channel::{Channel, FecSlot};
use dataplane_core::pool::{PakKind, Pool};
use dataplane_core::receiver::{Dispatch, RtpReceiver};
use dataplane_core::upcall::UpcallQueue;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

fn rtp_packet(seq: u16, ssrc: u32, timestamp: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 16];
    buf[0] = 0x80;
    buf[1] = 96;
    buf[2..4].copy_from_slice(&seq.to_be_bytes());
    buf[4..8].copy_from_slice(&timestamp.to_be_bytes());
    buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
    buf[12..16].copy_from_slice(b"data");
    buf
}

fn send_fec(receiver: &RtpReceiver, pool: &Pool, channel: &mut Channel, upcalls: &UpcallQueue, slot: FecSlot, ssrc: u32, seq: u16) -> Dispatch {
    let handle = pool.alloc(addr(12000), PakKind::Fec).expect("pool has room");
    pool.write_payload(handle, &rtp_packet(seq, ssrc, seq as u32 * 160));
    receiver.receive_fec(channel, slot, upcalls, handle, Instant::now())
}

#[test]
fn unconfigured_slot_drops_every_packet() {
    let pool = Pool::new(8, 1500);
    let receiver = RtpReceiver::new(pool.clone());
    let upcalls = UpcallQueue::new();
    let mut channel = Channel::new(0, false, 3, 16);

    let d = send_fec(&receiver, &pool, &mut channel, &upcalls, FecSlot::Column, 0xF00D, 0);
    assert_eq!(d, Dispatch::Dropped);
}

#[test]
fn packets_from_different_ssrcs_collapse_into_one_aggregate_entry() {
    let pool = Pool::new(8, 1500);
    let receiver = RtpReceiver::new(pool.clone());
    let upcalls = UpcallQueue::new();
    let mut channel = Channel::new(0, false, 3, 16);
    channel.enable_fec(FecSlot::Column, 3);

    for (ssrc, seq) in [(0x1111, 0), (0x2222, 1), (0x1111, 2)] {
        let d = send_fec(&receiver, &pool, &mut channel, &upcalls, FecSlot::Column, ssrc, seq);
        assert_eq!(d, Dispatch::PacketFlow);
    }

    let table = channel.fec[0].as_ref().unwrap();
    assert_eq!(table.len(), 1, "every packet lands in the same aggregate entry regardless of SSRC");
    assert_eq!(table.get(0).unwrap().packet_count, 3);
}

#[test]
fn column_and_row_slots_are_independent() {
    let pool = Pool::new(8, 1500);
    let receiver = RtpReceiver::new(pool.clone());
    let upcalls = UpcallQueue::new();
    let mut channel = Channel::new(0, false, 3, 16);
    channel.enable_fec(FecSlot::Column, 3);
    channel.enable_fec(FecSlot::Row, 3);

    send_fec(&receiver, &pool, &mut channel, &upcalls, FecSlot::Column, 0xAAAA, 0);
    send_fec(&receiver, &pool, &mut channel, &upcalls, FecSlot::Row, 0xBBBB, 0);
    send_fec(&receiver, &pool, &mut channel, &upcalls, FecSlot::Row, 0xBBBB, 1);

    assert_eq!(channel.fec[0].as_ref().unwrap().get(0).unwrap().packet_count, 1);
    assert_eq!(channel.fec[1].as_ref().unwrap().get(0).unwrap().packet_count, 2);
}
