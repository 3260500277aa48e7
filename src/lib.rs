pub mod config;
pub mod observer;
pub mod statistics;

use std::{
    net::Ipv4Addr,
    sync::Arc,
    thread::sleep,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use dataplane_core::{
    Dataplane, DataplaneOptions,
    channel::NullPcm,
    connection::{Capa, Encap, IsOps},
    pool::PakKind,
    shim::FilterSpec,
};

use self::{config::Config, observer::Observer, statistics::Statistics};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "rtp-dataplane.",
    env!("CARGO_PKG_VERSION")
);

/// Binds one direction (primary/repair/fec) of a channel: stands up an
/// output stream, connects a push-mode input stream to it, then reserves
/// and commits the filter that actually opens the socket.
fn bind_stream(dataplane: &Dataplane, dest: std::net::SocketAddr, is_multicast: bool, kind: PakKind) -> Result<u32> {
    let os_id = dataplane.os_create(Encap::Rtp, Capa::PUSH)?;

    dataplane.connect(
        os_id,
        os_id,
        &IsOps {
            push: true,
            ..Default::default()
        },
        Encap::Rtp,
        Capa::PUSH,
    )?;

    let multicast_group = match (is_multicast, dest.ip()) {
        (true, std::net::IpAddr::V4(v4)) => Some(v4),
        _ => None::<Ipv4Addr>,
    };

    let filter_id = dataplane.os_bind_reserve(
        os_id,
        FilterSpec {
            dest,
            source_addr_filter: None,
            source_port_filter: None,
            multicast_group,
            extra_multicast_group: None,
            scheduling_class: 0,
            so_rcvbuf: 0,
        },
        kind,
    )?;

    dataplane.os_bind_commit(filter_id).context("failed to commit filter bind")?;
    Ok(filter_id)
}

/// Builds the dataplane from configuration and runs its service loop until
/// the process is killed. Exposed as a function (rather than folded into
/// `main`) so integration tests can exercise the same startup path
/// in-process.
pub fn startup(config: Arc<Config>) -> Result<()> {
    log::info!("starting {SOFTWARE}, {} channel(s) configured", config.channels.len());

    let statistics = Statistics::default();
    let observer = Observer::new(config.clone(), statistics.clone());

    let dataplane = Dataplane::new(DataplaneOptions {
        pakpool_size: config.capacities.pakpool_size,
        max_paksize: config.capacities.max_paksize,
        max_known_sources: config.capacities.max_known_sources,
        failover_paks_max: config.capacities.failover_paks_max(),
        scheduling_class_intervals_ms: config.capacities.scheduling_policy.polling_interval_ms.clone(),
    });

    dataplane.shim.write().startup()?;

    for desc in &config.channels {
        let channel_id = dataplane.graph_create(desc.is_multicast);

        let primary_filter = bind_stream(&dataplane, desc.primary, desc.is_multicast, PakKind::Primary)?;
        observer.os_opened(primary_filter);

        if let Some(repair) = desc.repair {
            let repair_filter = bind_stream(&dataplane, repair, false, PakKind::Repair)?;
            observer.os_opened(repair_filter);
        }

        log::info!("channel {channel_id} bound: primary={}", desc.primary);
    }

    let poll_interval_ms = config
        .capacities
        .scheduling_policy
        .polling_interval_ms
        .iter()
        .copied()
        .min()
        .unwrap_or(20);

    let mut pcm = NullPcm::default();
    let mut last_tick = Instant::now();

    loop {
        sleep(Duration::from_millis(poll_interval_ms as u64));

        let now = Instant::now();
        let elapsed_ms = now.duration_since(last_tick).as_millis() as u32;
        last_tick = now;

        for channel_id in 0..config.channels.len() as u32 {
            dataplane.run_service(channel_id, elapsed_ms, &mut pcm);
            let _ = dataplane.activity_scan(channel_id, now);

            while let Ok(irq) = dataplane.poll_upcall_irq(channel_id) {
                observer.observe(&irq);
            }
        }
    }
}
