use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Bind addresses for the sockets the input shim opens on startup: the
/// primary multicast/unicast feed and, optionally, a repair unicast feed
/// and up to two FEC feeds, per channel description handed to `graph_create`.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ChannelDesc {
    pub primary: SocketAddr,
    #[serde(default)]
    pub repair: Option<SocketAddr>,
    #[serde(default)]
    pub fec_column: Option<SocketAddr>,
    #[serde(default)]
    pub fec_row: Option<SocketAddr>,
    #[serde(default)]
    pub is_multicast: bool,
}

/// Per-class polling cadence, index-matched to the classes a channel's
/// filters are assigned to at bind time.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulingPolicy {
    #[serde(default = "SchedulingPolicy::polling_interval_ms")]
    pub polling_interval_ms: Vec<u32>,
}

impl SchedulingPolicy {
    const MAX_CLASSES: usize = 32;

    fn polling_interval_ms() -> Vec<u32> {
        vec![20]
    }
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self {
            polling_interval_ms: Self::polling_interval_ms(),
        }
    }
}

/// Capacities handed to `module_init` (§6.2): every slab in the process is
/// sized once at startup and never grows.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Capacities {
    #[serde(default = "Capacities::max_channels")]
    pub max_channels: usize,
    #[serde(default = "Capacities::max_streams_per_channel")]
    pub max_streams_per_channel: usize,
    #[serde(default = "Capacities::pakpool_size")]
    pub pakpool_size: usize,
    #[serde(default = "Capacities::max_paksize")]
    pub max_paksize: usize,
    #[serde(default = "Capacities::max_known_sources")]
    pub max_known_sources: usize,
    #[serde(default = "Capacities::max_tuners")]
    pub max_tuners: usize,
    #[serde(default = "Capacities::output_q_limit")]
    pub output_q_limit: usize,
    #[serde(default = "Capacities::max_iobuf_cnt")]
    pub max_iobuf_cnt: usize,
    #[serde(default = "Capacities::iobuf_recv_timeout_ms")]
    pub iobuf_recv_timeout_ms: u32,
    #[serde(default = "Capacities::app_paks_per_rcc")]
    pub app_paks_per_rcc: u32,
    #[serde(default = "Capacities::app_cpy_delay_ms")]
    pub app_cpy_delay_ms: u32,
    #[serde(default)]
    pub scheduling_policy: SchedulingPolicy,
}

impl Capacities {
    fn max_channels() -> usize {
        64
    }

    fn max_streams_per_channel() -> usize {
        4
    }

    fn pakpool_size() -> usize {
        4096
    }

    fn max_paksize() -> usize {
        1500
    }

    fn max_known_sources() -> usize {
        3
    }

    fn max_tuners() -> usize {
        16
    }

    fn output_q_limit() -> usize {
        256
    }

    fn max_iobuf_cnt() -> usize {
        64
    }

    fn iobuf_recv_timeout_ms() -> u32 {
        500
    }

    fn app_paks_per_rcc() -> u32 {
        3
    }

    fn app_cpy_delay_ms() -> u32 {
        0
    }

    /// §4.4.2: `80 + 2 * poll_interval_ms`, evaluated against the fastest
    /// configured scheduling class.
    pub fn failover_paks_max(&self) -> usize {
        let interval = self
            .scheduling_policy
            .polling_interval_ms
            .iter()
            .copied()
            .min()
            .unwrap_or(dataplane_core::failover::DEFAULT_POLL_INTERVAL_MSECS);
        dataplane_core::failover::failover_paks_max(interval)
    }
}

impl Default for Capacities {
    fn default() -> Self {
        Self {
            max_channels: Self::max_channels(),
            max_streams_per_channel: Self::max_streams_per_channel(),
            pakpool_size: Self::pakpool_size(),
            max_paksize: Self::max_paksize(),
            max_known_sources: Self::max_known_sources(),
            max_tuners: Self::max_tuners(),
            output_q_limit: Self::output_q_limit(),
            max_iobuf_cnt: Self::max_iobuf_cnt(),
            iobuf_recv_timeout_ms: Self::iobuf_recv_timeout_ms(),
            app_paks_per_rcc: Self::app_paks_per_rcc(),
            app_cpy_delay_ms: Self::app_cpy_delay_ms(),
            scheduling_policy: SchedulingPolicy::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Prometheus {
    #[serde(default = "Prometheus::bind")]
    pub listen: SocketAddr,
}

impl Prometheus {
    fn bind() -> SocketAddr {
        "127.0.0.1:9090".parse().unwrap()
    }
}

impl Default for Prometheus {
    fn default() -> Self {
        Self { listen: Self::bind() }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub capacities: Capacities,
    #[serde(default)]
    pub channels: Vec<ChannelDesc>,
    #[serde(default)]
    pub prometheus: Option<Prometheus>,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: rtp-dataplane --config /etc/rtp-dataplane/config.toml
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    pub fn load() -> Result<Self> {
        Ok(toml::from_str::<Self>(&read_to_string(&Cli::parse().config)?)?)
    }
}
