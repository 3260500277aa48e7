//! Upcall / IRQ contract to the control plane.
//!
//! State changes are coalesced per channel into a single pending IRQ record;
//! the reason bitmask is OR-ed under the table lock exactly as the session
//! manager's tables are, and a background thread periodically raises a
//! generation-number-sync event so the control plane can recover missed
//! upcalls by polling.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, sleep},
    time::Duration,
};

use ahash::HashMap;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    RtpPrimary,
    RtpRepair,
    RtpFec,
    DpChan,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reason(u32);

impl Reason {
    pub const RTP_SRC_ISACTIVE: Self = Self(1 << 0);
    pub const RTP_SRC_ISINACTIVE: Self = Self(1 << 1);
    pub const RTP_SRC_NEW: Self = Self(1 << 2);
    pub const RTP_SRC_CSRC_UPDATE: Self = Self(1 << 3);
    pub const CHAN_RCC_NCSI: Self = Self(1 << 4);
    pub const CHAN_RCC_ABORT: Self = Self(1 << 5);
    pub const CHAN_FAST_FILL_DONE: Self = Self(1 << 6);
    pub const CHAN_BURST_DONE: Self = Self(1 << 7);
    pub const CHAN_FEC_UPDATE: Self = Self(1 << 8);
    pub const CHAN_PRIM_INACTIVE: Self = Self(1 << 9);
    pub const CHAN_GEN_NUM_SYNC: Self = Self(1 << 10);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    fn merge(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IrqRecord {
    pub generation_num: u64,
    pub channel_id: u32,
    pub chan_generation_num: u32,
    pub device: Device,
    pub device_stream_id: u32,
    pub reason: Reason,
}

struct Pending {
    device: Device,
    device_stream_id: u32,
    chan_generation_num: u32,
    reason: Reason,
}

struct QueueInner {
    pending: HashMap<u32, Pending>,
    generation: AtomicU64,
}

/// Single-producer coalescing queue: at most one pending IRQ per channel.
/// The generation counter is the `generation_num` stamped on each record
/// when it is acknowledged, so the control plane can tell freshness apart
/// from a stale poll.
#[derive(Clone)]
pub struct UpcallQueue(Arc<Mutex<QueueInner>>);

impl UpcallQueue {
    pub fn new() -> Self {
        let this = Self(Arc::new(Mutex::new(QueueInner {
            pending: HashMap::default(),
            generation: AtomicU64::new(0),
        })));

        let weak = Arc::downgrade(&this.0);
        thread::spawn(move || {
            while let Some(inner) = weak.upgrade() {
                {
                    let mut guard = inner.lock();
                    let channels: Vec<u32> = guard.pending.keys().copied().collect();
                    for id in channels {
                        if let Some(p) = guard.pending.get_mut(&id) {
                            p.reason.merge(Reason::CHAN_GEN_NUM_SYNC);
                        }
                    }
                }

                sleep(Duration::from_secs(1));
            }
        });

        this
    }

    /// Raises a reason for `channel_id`; if an IRQ is already pending for
    /// that channel the new reason is OR-ed into it instead of creating a
    /// second record.
    pub fn raise(
        &self,
        channel_id: u32,
        chan_generation_num: u32,
        device: Device,
        device_stream_id: u32,
        reason: Reason,
    ) {
        let mut inner = self.0.lock();
        inner
            .pending
            .entry(channel_id)
            .and_modify(|p| p.reason.merge(reason))
            .or_insert(Pending {
                device,
                device_stream_id,
                chan_generation_num,
                reason,
            });
    }

    /// Consumes and clears the pending IRQ for a channel, if any.
    pub fn poll(&self, channel_id: u32) -> Option<IrqRecord> {
        let mut inner = self.0.lock();
        let p = inner.pending.remove(&channel_id)?;
        let generation_num = inner.generation.fetch_add(1, Ordering::Relaxed) + 1;

        Some(IrqRecord {
            generation_num,
            channel_id,
            chan_generation_num: p.chan_generation_num,
            device: p.device,
            device_stream_id: p.device_stream_id,
            reason: p.reason,
        })
    }

    pub fn has_pending(&self, channel_id: u32) -> bool {
        self.0.lock().pending.contains_key(&channel_id)
    }
}

impl Default for UpcallQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_with_nothing_pending_is_none() {
        let q = UpcallQueue::new();
        assert!(!q.has_pending(0));
        assert!(q.poll(0).is_none());
    }

    #[test]
    fn raise_then_poll_round_trips() {
        let q = UpcallQueue::new();
        q.raise(3, 7, Device::RtpPrimary, 42, Reason::RTP_SRC_NEW);
        assert!(q.has_pending(3));

        let irq = q.poll(3).unwrap();
        assert_eq!(irq.channel_id, 3);
        assert_eq!(irq.chan_generation_num, 7);
        assert_eq!(irq.device, Device::RtpPrimary);
        assert_eq!(irq.device_stream_id, 42);
        assert!(irq.reason.contains(Reason::RTP_SRC_NEW));
        assert!(!q.has_pending(3));
    }

    #[test]
    fn repeated_raises_coalesce_reasons_into_one_record() {
        let q = UpcallQueue::new();
        q.raise(1, 0, Device::RtpPrimary, 0, Reason::RTP_SRC_NEW);
        q.raise(1, 0, Device::RtpPrimary, 0, Reason::RTP_SRC_ISACTIVE);

        let irq = q.poll(1).unwrap();
        assert!(irq.reason.contains(Reason::RTP_SRC_NEW));
        assert!(irq.reason.contains(Reason::RTP_SRC_ISACTIVE));
        assert!(q.poll(1).is_none(), "only one record per channel is pending at a time");
    }

    #[test]
    fn generation_num_increases_across_polls() {
        let q = UpcallQueue::new();
        q.raise(1, 0, Device::RtpPrimary, 0, Reason::RTP_SRC_NEW);
        let first = q.poll(1).unwrap().generation_num;

        q.raise(1, 0, Device::RtpPrimary, 0, Reason::RTP_SRC_NEW);
        let second = q.poll(1).unwrap().generation_num;
        assert!(second > first);
    }

    #[test]
    fn reason_union_and_contains() {
        let r = Reason::RTP_SRC_NEW.union(Reason::CHAN_RCC_ABORT);
        assert!(r.contains(Reason::RTP_SRC_NEW));
        assert!(r.contains(Reason::CHAN_RCC_ABORT));
        assert!(!r.contains(Reason::RTP_SRC_ISACTIVE));
    }
}
