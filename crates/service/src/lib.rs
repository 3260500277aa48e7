//! Dataplane core: packet pool, input shim, per-channel source tables, and
//! the failover/RCC state that turns overlapping RTP streams into a single
//! sequence-ordered feed for the downstream PCM.
//!
//! Mutating control-plane calls (bind, promote, filter install) must be
//! made while holding the per-channel table lock; the hot packet-receive
//! path is driven exclusively by the single service thread that calls
//! [`Dataplane::run_service`].

pub mod channel;
pub mod connection;
pub mod error;
pub mod failover;
pub mod pool;
pub mod rcc;
pub mod receiver;
pub mod shim;
pub mod source;
pub mod upcall;

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use ahash::HashMap;
use parking_lot::RwLock;

use crate::{
    channel::{Channel, DebugFlags, FecSlot, NullPcm, PcmSink},
    connection::{Capa, Encap, IsOps},
    error::{DataplaneError, Result},
    pool::{PakHandle, PakKind, Pool},
    rcc::RccAppPacket,
    receiver::{Dispatch, RtpReceiver},
    shim::{FilterSpec, InputShim},
    source::RtpSourceKey,
    upcall::{IrqRecord, UpcallQueue},
};

pub struct DataplaneOptions {
    pub pakpool_size: usize,
    pub max_paksize: usize,
    pub max_known_sources: usize,
    pub failover_paks_max: usize,
    pub scheduling_class_intervals_ms: Vec<u32>,
}

/// Table of live channels keyed by channel id. A thin wrapper mirroring the
/// teacher's session table: an `RwLock`-guarded map, read-mostly for
/// control-plane queries and briefly write-locked by the service thread
/// while dispatching a batch.
pub struct ChannelTable(RwLock<HashMap<u32, Channel>>);

impl ChannelTable {
    fn new() -> Self {
        Self(RwLock::new(HashMap::default()))
    }

    pub fn with_channel<R>(&self, id: u32, f: impl FnOnce(&mut Channel) -> R) -> Result<R> {
        let mut table = self.0.write();
        let channel = table.get_mut(&id).ok_or(DataplaneError::NoSuchStream)?;
        Ok(f(channel))
    }

    pub fn insert(&self, channel: Channel) {
        self.0.write().insert(channel.id, channel);
    }

    pub fn remove(&self, id: u32) -> Option<Channel> {
        self.0.write().remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.0.read().contains_key(&id)
    }
}

pub struct Dataplane {
    pool: Pool,
    pub shim: RwLock<InputShim>,
    pub channels: Arc<ChannelTable>,
    receiver: RtpReceiver,
    pub upcalls: UpcallQueue,
    max_known_sources: usize,
    failover_paks_max: usize,
    next_channel_id: AtomicU32,
}

impl Dataplane {
    pub fn new(options: DataplaneOptions) -> Self {
        let pool = Pool::new(options.pakpool_size, options.max_paksize);

        Self {
            shim: RwLock::new(InputShim::new(pool.clone(), &options.scheduling_class_intervals_ms)),
            receiver: RtpReceiver::new(pool.clone()),
            pool,
            channels: Arc::new(ChannelTable::new()),
            upcalls: UpcallQueue::new(),
            max_known_sources: options.max_known_sources,
            failover_paks_max: options.failover_paks_max,
            next_channel_id: AtomicU32::new(0),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn graph_create(&self, is_multicast: bool) -> u32 {
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        self.channels.insert(Channel::new(
            id,
            is_multicast,
            self.max_known_sources,
            self.failover_paks_max,
        ));
        id
    }

    pub fn graph_destroy(&self, id: u32) -> Result<()> {
        self.channels.remove(id).ok_or(DataplaneError::NoSuchStream)?;
        Ok(())
    }

    pub fn os_create(&self, encap: Encap, capa: Capa) -> Result<u32> {
        self.shim.write().os_create(encap, capa)
    }

    pub fn os_destroy(&self, os_id: u32) -> Result<()> {
        self.shim.write().os_destroy(os_id)
    }

    pub fn connect(
        &self,
        os_id: u32,
        is_id: u32,
        is_ops: &IsOps,
        requested_encap: Encap,
        requested_capa: Capa,
    ) -> Result<connection::ConnectedPeer> {
        self.shim
            .write()
            .connect(os_id, is_id, is_ops, requested_encap, requested_capa)
    }

    pub fn os_bind_reserve(&self, os_id: u32, spec: FilterSpec, kind: pool::PakKind) -> Result<u32> {
        self.shim.write().os_bind_reserve(os_id, spec, kind)
    }

    pub fn os_bind_commit(&self, filter_id: u32) -> Result<u16> {
        self.shim.write().os_bind_commit(filter_id)
    }

    pub fn os_bind_update(&self, filter_id: u32, spec: FilterSpec) -> Result<()> {
        self.shim.write().os_bind_update(filter_id, spec)
    }

    pub fn os_unbind(&self, filter_id: u32) -> Result<()> {
        self.shim.write().os_unbind(filter_id)
    }

    /// Drives the scheduling classes once and routes every delivered batch
    /// to the named channel's primary, repair, or FEC receive path per the
    /// packet's own `PakKind` (set on allocation by the filter that bound
    /// it). Intended to be called repeatedly by the single service thread
    /// with the milliseconds elapsed since the previous call.
    pub fn run_service(&self, channel_id: u32, elapsed_ms: u32, pcm: &mut impl PcmSink) {
        let pool = self.pool.clone();
        let receiver = &self.receiver;
        let upcalls = &self.upcalls;
        let channels = &self.channels;

        self.shim.write().run_service(elapsed_ms, |_filter_id, handles: &[PakHandle]| {
            let _ = channels.with_channel(channel_id, |channel| {
                for &handle in handles {
                    let kind = pool.meta(handle).map(|m| m.kind);
                    pool.pak_ref(handle);
                    let now = std::time::Instant::now();
                    match kind {
                        Some(PakKind::Primary) => {
                            receiver.receive_primary(channel, pcm, upcalls, handle, now);
                        }
                        Some(PakKind::Repair) => {
                            receiver.receive_repair(channel, upcalls, handle, now);
                        }
                        Some(PakKind::Fec) => {
                            receiver.receive_fec(channel, FecSlot::Column, upcalls, handle, now);
                        }
                        None => pool.free(handle),
                    }
                }
            });
        });
    }

    pub fn activity_scan(&self, channel_id: u32, now: std::time::Instant) -> Result<()> {
        self.channels.with_channel(channel_id, |channel| {
            self.receiver.activity_scan(channel, &self.upcalls, now);
        })
    }

    pub fn permit_pktflow(&self, channel_id: u32, key: RtpSourceKey, offset: Option<i16>) -> Result<()> {
        self.channels.with_channel(channel_id, |channel| {
            let mut pcm = NullPcm::default();
            self.receiver.promote_permit_pktflow(channel, &mut pcm, key, offset);
        })
    }

    pub fn disable_pktflow(&self, channel_id: u32, key: RtpSourceKey) -> Result<()> {
        self.channels.with_channel(channel_id, |channel| {
            let index = channel.primary.find(&key).ok_or(DataplaneError::NotFound)?;
            if channel.primary.pktflow_index != Some(index) {
                return Err(DataplaneError::NotFound);
            }
            channel.primary.clear_pktflow();
            Ok(())
        })?
    }

    pub fn add_ssrc_filter(&self, channel_id: u32, ssrc: u32) -> Result<()> {
        self.channels.with_channel(channel_id, |channel| {
            self.receiver.install_ssrc_filter(channel, ssrc);
        })
    }

    pub fn del_ssrc_filter(&self, channel_id: u32) -> Result<()> {
        self.channels.with_channel(channel_id, |channel| {
            self.receiver.remove_ssrc_filter(channel);
        })
    }

    pub fn poll_upcall_irq(&self, channel_id: u32) -> Result<IrqRecord> {
        self.upcalls.poll(channel_id).ok_or(DataplaneError::NoPendingIrq)
    }

    /// Delivers a rapid-channel-change APP packet: records its `first_seq`
    /// and releases any repair packets held in the channel's holdq while the
    /// RCC state machine was awaiting it.
    pub fn receive_rcc_app(&self, channel_id: u32, app: RccAppPacket) -> Result<()> {
        self.channels.with_channel(channel_id, |channel| {
            self.receiver
                .receive_rcc_app(channel, &self.upcalls, app, std::time::Instant::now());
        })
    }

    /// Sets (OR-ing in) the named debug flags on a channel. Flags are never
    /// cleared by the control plane mid-session; a fresh `graph_create` call
    /// is how a caller starts a channel back at `DebugFlags::default()`.
    pub fn set_debug_flags(&self, channel_id: u32, flags: DebugFlags) -> Result<()> {
        self.channels.with_channel(channel_id, |channel| {
            channel.debug_flags.set(flags);
        })
    }
}

/// Utility used by [`Dataplane::receive_repair`]-style call sites that feed
/// the repair-stream path the same way `run_service` feeds primary.
impl Dataplane {
    pub fn receive_repair_handle(&self, channel_id: u32, handle: PakHandle) -> Result<Dispatch> {
        self.channels.with_channel(channel_id, |channel| {
            self.receiver
                .receive_repair(channel, &self.upcalls, handle, std::time::Instant::now())
        })
    }
}
