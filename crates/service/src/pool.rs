//! Fixed-size packet pool.
//!
//! Mirrors the "arena + index" approach: every `Pak` lives in a fixed slab
//! indexed by a handle, and queues (PCM, failover, the shim's local batch)
//! hold handles rather than pointers. The pool also owns the single
//! process-wide emergency buffer used to drain a socket when the slab is
//! exhausted.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use codec::rtp::RtpHeader;
use parking_lot::Mutex;

/// Opaque handle into the pool's slab. Cheap to copy and to hold in queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PakHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PakKind {
    Primary,
    Repair,
    Fec,
}

/// `RX_DISCONTINUITY` is set on the first packet delivered after a splice;
/// `AFTER_EC` is cleared on ingest and left for the (out-of-scope) FEC
/// decoder to set once it has reconstructed a packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PakFlags(u8);

impl PakFlags {
    pub const RX_DISCONTINUITY: Self = Self(1 << 0);
    pub const AFTER_EC: Self = Self(1 << 1);

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

/// Everything about a packet other than its payload bytes.
#[derive(Debug, Clone)]
pub struct PakMeta {
    pub recv_time: Instant,
    pub src_addr: SocketAddr,
    pub payload_offset: usize,
    /// 32-bit extended session sequence number, assigned during PCM insert.
    pub seq_num: u32,
    pub rtp_timestamp: u32,
    pub kind: PakKind,
    pub flags: PakFlags,
    pub header: Option<RtpHeader>,
}

struct Slot {
    data: Vec<u8>,
    len: usize,
    ref_count: usize,
    meta: PakMeta,
}

struct PoolInner {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    max_paksize: usize,
    emergency: Vec<u8>,
    emergency_reads: u64,
    tr135_overruns: u64,
}

/// Fixed-count slab of packet buffers, sized at init by `pakpool_size` and
/// `max_paksize`. Cloning a `Pool` clones the `Arc` handle, not the slab.
#[derive(Clone)]
pub struct Pool(Arc<Mutex<PoolInner>>);

impl Pool {
    pub fn new(pakpool_size: usize, max_paksize: usize) -> Self {
        let mut slots = Vec::with_capacity(pakpool_size);
        let mut free = Vec::with_capacity(pakpool_size);
        for i in 0..pakpool_size {
            slots.push(None);
            free.push(i as u32);
        }

        Self(Arc::new(Mutex::new(PoolInner {
            slots,
            free,
            max_paksize,
            emergency: vec![0u8; max_paksize],
            emergency_reads: 0,
            tr135_overruns: 0,
        })))
    }

    fn default_meta(src_addr: SocketAddr, kind: PakKind) -> PakMeta {
        PakMeta {
            recv_time: Instant::now(),
            src_addr,
            payload_offset: 0,
            seq_num: 0,
            rtp_timestamp: 0,
            kind,
            flags: PakFlags::default(),
            header: None,
        }
    }

    /// Allocate one packet buffer. Returns `None` on exhaustion; the caller
    /// falls back to the emergency buffer.
    pub fn alloc(&self, src_addr: SocketAddr, kind: PakKind) -> Option<PakHandle> {
        let mut inner = self.0.lock();
        let index = inner.free.pop()?;
        let max_paksize = inner.max_paksize;

        inner.slots[index as usize] = Some(Slot {
            data: vec![0u8; max_paksize],
            len: 0,
            ref_count: 1,
            meta: Self::default_meta(src_addr, kind),
        });

        Some(PakHandle(index))
    }

    /// Increment the reference count. Every caller that stashes a handle in
    /// a queue of its own must pair this with exactly one `free`.
    pub fn pak_ref(&self, handle: PakHandle) {
        let mut inner = self.0.lock();
        if let Some(slot) = inner.slots[handle.0 as usize].as_mut() {
            slot.ref_count += 1;
        }
    }

    /// Decrement the reference count; returns the buffer to the pool when it
    /// reaches zero.
    pub fn free(&self, handle: PakHandle) {
        let mut inner = self.0.lock();
        let released = if let Some(slot) = inner.slots[handle.0 as usize].as_mut() {
            slot.ref_count -= 1;
            slot.ref_count == 0
        } else {
            false
        };

        if released {
            inner.slots[handle.0 as usize] = None;
            inner.free.push(handle.0);
        }
    }

    pub fn write_payload(&self, handle: PakHandle, bytes: &[u8]) {
        let mut inner = self.0.lock();
        if let Some(slot) = inner.slots[handle.0 as usize].as_mut() {
            let n = bytes.len().min(slot.data.len());
            slot.data[..n].copy_from_slice(&bytes[..n]);
            slot.len = n;
        }
    }

    pub fn with_payload<R>(&self, handle: PakHandle, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let inner = self.0.lock();
        inner.slots[handle.0 as usize]
            .as_ref()
            .map(|slot| f(&slot.data[..slot.len]))
    }

    pub fn meta(&self, handle: PakHandle) -> Option<PakMeta> {
        self.0.lock().slots[handle.0 as usize]
            .as_ref()
            .map(|slot| slot.meta.clone())
    }

    pub fn update_meta(&self, handle: PakHandle, f: impl FnOnce(&mut PakMeta)) {
        let mut inner = self.0.lock();
        if let Some(slot) = inner.slots[handle.0 as usize].as_mut() {
            f(&mut slot.meta);
        }
    }

    /// Drain a socket's pending datagram into the single process-wide
    /// emergency buffer and discard it. Used only when `alloc` fails, to
    /// keep the kernel socket buffer from filling with stale data.
    ///
    /// Every call here bumps the OS drop counter (by the caller) and the
    /// global `tr135_overruns` counter.
    pub fn emergency_read(&self, read: impl FnOnce(&mut [u8]) -> std::io::Result<usize>) {
        let mut inner = self.0.lock();
        let _ = read(&mut inner.emergency);
        inner.emergency_reads += 1;
        inner.tr135_overruns += 1;
    }

    pub fn tr135_overruns(&self) -> u64 {
        self.0.lock().tr135_overruns
    }

    pub fn capacity(&self) -> usize {
        self.0.lock().slots.len()
    }

    pub fn available(&self) -> usize {
        self.0.lock().free.len()
    }
}

impl PakMeta {
    pub fn age(&self) -> Duration {
        self.recv_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn alloc_exhausts_and_refuses() {
        let pool = Pool::new(2, 128);
        let a = pool.alloc(addr(), PakKind::Primary).unwrap();
        let b = pool.alloc(addr(), PakKind::Primary).unwrap();
        assert!(pool.alloc(addr(), PakKind::Primary).is_none());
        assert_eq!(pool.available(), 0);

        pool.free(a);
        assert_eq!(pool.available(), 1);
        pool.free(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn ref_count_keeps_slot_alive_until_every_free() {
        let pool = Pool::new(1, 128);
        let handle = pool.alloc(addr(), PakKind::Primary).unwrap();
        pool.pak_ref(handle);

        pool.free(handle);
        assert_eq!(pool.available(), 0, "still referenced once more");

        pool.free(handle);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn write_payload_truncates_to_slot_size() {
        let pool = Pool::new(1, 4);
        let handle = pool.alloc(addr(), PakKind::Primary).unwrap();
        pool.write_payload(handle, b"abcdefgh");
        let read = pool.with_payload(handle, |b| b.to_vec()).unwrap();
        assert_eq!(read, b"abcd");
    }

    #[test]
    fn emergency_read_bumps_overrun_counter() {
        let pool = Pool::new(1, 16);
        pool.emergency_read(|buf| {
            buf[..3].copy_from_slice(b"xyz");
            Ok(3)
        });
        assert_eq!(pool.tr135_overruns(), 1);
    }

    #[test]
    fn update_meta_mutates_in_place() {
        let pool = Pool::new(1, 16);
        let handle = pool.alloc(addr(), PakKind::Repair).unwrap();
        pool.update_meta(handle, |meta| meta.seq_num = 42);
        assert_eq!(pool.meta(handle).unwrap().seq_num, 42);
        assert_eq!(pool.meta(handle).unwrap().kind, PakKind::Repair);
    }
}
