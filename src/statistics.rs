use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// Integrated Prometheus Metrics Exporter
pub mod prometheus {
    use std::sync::LazyLock;

    use anyhow::Result;
    use prometheus::{Encoder, IntCounter, TextEncoder, register_int_counter};

    use super::{Counts, DebugReason, Number, Stats};

    macro_rules! counter {
        ($prefix:expr, $operation:expr, $dst:expr) => {
            register_int_counter!(
                format!("{}_{}_{}", $prefix, $operation, $dst),
                format!("The {} amount of {} {}", $prefix, $dst, $operation)
            )
        };
    }

    pub static METRICS: LazyLock<Metrics> = LazyLock::new(|| Metrics::default());

    impl Number for IntCounter {
        fn add(&self, value: usize) {
            self.inc_by(value as u64);
        }

        fn get(&self) -> usize {
            self.get() as usize
        }
    }

    impl Counts<IntCounter> {
        fn new(prefix: &str) -> Result<Self> {
            Ok(Self {
                received_bytes: counter!(prefix, "received", "bytes")?,
                received_pkts: counter!(prefix, "received", "packets")?,
                error_pkts: counter!(prefix, "error", "packets")?,
            })
        }
    }

    /// Summarized metrics for the whole process and the per-reason debug
    /// counters called out by the drop taxonomy (parse failures, source
    /// table exhaustion, filter rejections).
    pub struct Metrics {
        pub total: Counts<IntCounter>,
        pub rtp_parse_drops: IntCounter,
        pub rtp_src_limit_exceeded: IntCounter,
        pub rtp_src_table_full: IntCounter,
        pub tr135_overruns: IntCounter,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new().expect("Unable to initialize Prometheus metrics data!")
        }
    }

    impl Metrics {
        pub fn new() -> Result<Self> {
            Ok(Self {
                total: Counts::new("total")?,
                rtp_parse_drops: register_int_counter!("rtp_parse_drops", "Packets dropped failing RTP header parse")?,
                rtp_src_limit_exceeded: register_int_counter!(
                    "rtp_src_limit_exceeded",
                    "Packets dropped because a channel's known-source table was full"
                )?,
                rtp_src_table_full: register_int_counter!(
                    "rtp_src_table_full",
                    "New-source admissions rejected outright because no slot could be aged out"
                )?,
                tr135_overruns: register_int_counter!(
                    "tr135_overruns",
                    "Failover queue evictions from a primary/alternate overlap outlasting FAILOVER_PAKS_MAX"
                )?,
            })
        }

        pub fn add(&self, payload: &Stats) {
            self.total.add(payload);
        }

        pub fn add_debug(&self, reason: DebugReason) {
            match reason {
                DebugReason::RtpParseDrop => self.rtp_parse_drops.inc(),
                DebugReason::SrcLimitExceeded => self.rtp_src_limit_exceeded.inc(),
                DebugReason::SrcTableFull => self.rtp_src_table_full.inc(),
                DebugReason::Tr135Overrun => self.tr135_overruns.inc(),
            }
        }
    }

    /// Generate prometheus metrics data that externally needs to be exposed
    /// to the `/metrics` route.
    pub fn generate_metrics(buf: &mut Vec<u8>) -> Result<()> {
        TextEncoder::new().encode(&prometheus::gather(), buf)?;
        Ok(())
    }
}

/// The type of information passed in the statistics channel for a single
/// output stream.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(usize),
    ReceivedPkts(usize),
    ErrorPkts(usize),
}

/// Process-wide debug counters that aren't attributable to a single output
/// stream: source-table admission failures and failover-queue overruns.
#[derive(Debug, Clone, Copy)]
pub enum DebugReason {
    RtpParseDrop,
    SrcLimitExceeded,
    SrcTableFull,
    Tr135Overrun,
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-output-stream counters.
pub struct Counts<T> {
    pub received_bytes: T,
    pub received_pkts: T,
    pub error_pkts: T,
}

impl<T: Number> Counts<T> {
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(v) => self.received_bytes.add(*v),
            Stats::ReceivedPkts(v) => self.received_pkts.add(*v),
            Stats::ErrorPkts(v) => self.error_pkts.add(*v),
        }
    }
}

#[derive(Default)]
struct DebugCounters {
    rtp_parse_drops: Count,
    rtp_src_limit_exceeded: Count,
    rtp_src_table_full: Count,
    tr135_overruns: Count,
}

impl DebugCounters {
    fn add(&self, reason: DebugReason) {
        match reason {
            DebugReason::RtpParseDrop => self.rtp_parse_drops.add(1),
            DebugReason::SrcLimitExceeded => self.rtp_src_limit_exceeded.add(1),
            DebugReason::SrcTableFull => self.rtp_src_table_full.add(1),
            DebugReason::Tr135Overrun => self.tr135_overruns.add(1),
        }
    }
}

/// Process-wide statistics: per-filter (output stream) byte/packet counters
/// plus the process-wide debug counters.
#[derive(Clone)]
pub struct Statistics(Arc<RwLock<AHashMap<u32, Counts<Count>>>>, Arc<DebugCounters>);

impl Default for Statistics {
    fn default() -> Self {
        Self(
            Arc::new(RwLock::new(AHashMap::with_capacity(256))),
            Arc::new(DebugCounters::default()),
        )
    }
}

impl Statistics {
    /// Get a reporter scoped to one output stream's filter id.
    pub fn get_reporter(&self, filter_id: u32) -> StatisticsReporter {
        StatisticsReporter {
            table: self.0.clone(),
            filter_id,
        }
    }

    pub fn register(&self, filter_id: u32) {
        self.0.write().insert(
            filter_id,
            Counts {
                received_bytes: Count::default(),
                received_pkts: Count::default(),
                error_pkts: Count::default(),
            },
        );
    }

    pub fn unregister(&self, filter_id: u32) {
        self.0.write().remove(&filter_id);
    }

    pub fn get(&self, filter_id: u32) -> Option<Counts<usize>> {
        self.0.read().get(&filter_id).map(|counts| Counts {
            received_bytes: counts.received_bytes.get(),
            received_pkts: counts.received_pkts.get(),
            error_pkts: counts.error_pkts.get(),
        })
    }

    pub fn report_debug(&self, reason: DebugReason) {
        #[cfg(feature = "prometheus")]
        {
            self::prometheus::METRICS.add_debug(reason);
        }

        self.1.add(reason);
    }
}

/// Held by the service thread; every packet disposition on the hot path
/// reports through this handle instead of touching the shared table
/// directly when no counters are registered for the filter.
#[derive(Clone)]
#[allow(unused)]
pub struct StatisticsReporter {
    table: Arc<RwLock<AHashMap<u32, Counts<Count>>>>,
    filter_id: u32,
}

impl StatisticsReporter {
    pub fn send(&self, reports: &[Stats]) {
        #[cfg(feature = "prometheus")]
        {
            for report in reports {
                self::prometheus::METRICS.add(report);
            }
        }

        if let Some(counts) = self.table.read().get(&self.filter_id) {
            for item in reports {
                counts.add(item);
            }
        }
    }
}
