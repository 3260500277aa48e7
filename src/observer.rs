use std::sync::Arc;

use dataplane_core::upcall::{IrqRecord, Reason};

use crate::{config::Config, statistics::Statistics};

/// Every reason bit paired with the name logged for it; walked in order so a
/// coalesced upcall's log line lists every event that was merged into it.
const REASONS: &[(Reason, &str)] = &[
    (Reason::RTP_SRC_NEW, "rtp-src-new"),
    (Reason::RTP_SRC_ISACTIVE, "rtp-src-isactive"),
    (Reason::RTP_SRC_ISINACTIVE, "rtp-src-isinactive"),
    (Reason::RTP_SRC_CSRC_UPDATE, "rtp-src-csrc-update"),
    (Reason::CHAN_RCC_NCSI, "chan-rcc-ncsi"),
    (Reason::CHAN_RCC_ABORT, "chan-rcc-abort"),
    (Reason::CHAN_FAST_FILL_DONE, "chan-fast-fill-done"),
    (Reason::CHAN_BURST_DONE, "chan-burst-done"),
    (Reason::CHAN_FEC_UPDATE, "chan-fec-update"),
    (Reason::CHAN_PRIM_INACTIVE, "chan-prim-inactive"),
    (Reason::CHAN_GEN_NUM_SYNC, "chan-gen-num-sync"),
];

/// Logs upcall activity and keeps the statistics table's registered filter
/// set in step with the input shim's bind/unbind calls.
#[derive(Clone)]
pub struct Observer {
    #[allow(unused)]
    config: Arc<Config>,
    statistics: Statistics,
}

impl Observer {
    pub fn new(config: Arc<Config>, statistics: Statistics) -> Self {
        Self { config, statistics }
    }

    pub fn os_opened(&self, filter_id: u32) {
        self.statistics.register(filter_id);
        log::info!("output stream opened: filter={filter_id}");
    }

    pub fn os_closed(&self, filter_id: u32) {
        self.statistics.unregister(filter_id);
        log::info!("output stream closed: filter={filter_id}");
    }

    /// Logs one polled IRQ record, naming every reason bit the control plane
    /// would otherwise have to decode from the raw bitmask.
    pub fn observe(&self, irq: &IrqRecord) {
        let reasons: Vec<&str> = REASONS
            .iter()
            .filter(|(bit, _)| irq.reason.contains(*bit))
            .map(|(_, name)| *name)
            .collect();

        log::info!(
            "channel upcall: channel={}, generation={}, poll_gen={}, device={:?}, stream={}, reasons={:?}",
            irq.channel_id,
            irq.chan_generation_num,
            irq.generation_num,
            irq.device,
            irq.device_stream_id,
            reasons,
        );
    }
}
