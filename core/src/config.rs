//! Configuration options.
//!
//! Scoped to the options relevant to the reconstruction core: protocol
//! bindings, connection expiry, capture engine selection, body-capture
//! toggles, and matcher capacities. Modeled on Retina's
//! `RuntimeConfig`/`load_config`/`default_config` shape (`serde` + `toml`),
//! trimmed of the DPDK/online-port/mempool options that belong to the
//! capture engine, which is out of scope here.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocols::ProtocolId;

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<RuntimeConfig> {
    let config_str = fs::read_to_string(path)?;
    let config: RuntimeConfig = toml::from_str(&config_str)?;
    Ok(config)
}

/// Returns a default configuration suitable for offline functional testing.
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// One `(protocol, ports)` binding.
///
/// `host` is carried through for the external control plane (e.g. restricting
/// a binding to one listening address) but is not consulted by the core's
/// `decide_proto` itself, which dispatches purely on port.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProtocolBinding {
    pub protocol: ProtocolId,
    #[serde(default)]
    pub host: Option<String>,
    pub ports: Vec<u16>,
}

/// Runtime configuration options relevant to the reconstruction core.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// Protocol port bindings.
    #[serde(default)]
    pub protocols: Vec<ProtocolBinding>,

    /// Connection tracking settings.
    #[serde(default)]
    pub conntrack: ConnTrackConfig,

    /// HTTP/1.1-specific options.
    #[serde(default)]
    pub http: HttpConfig,

    /// HTTP/2 and gRPC-specific options.
    #[serde(default)]
    pub http2: Http2Config,

    /// MongoDB-specific options.
    #[serde(default)]
    pub mongodb: MongodbConfig,

    /// Matcher capacities.
    #[serde(default)]
    pub matchers: MatcherConfig,

    /// Name of the capture engine to use. The engine itself is an external
    /// collaborator; this only selects which one to install.
    #[serde(default = "default_capture_engine")]
    pub capture_engine: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            protocols: Vec::new(),
            conntrack: ConnTrackConfig::default(),
            http: HttpConfig::default(),
            http2: Http2Config::default(),
            mongodb: MongodbConfig::default(),
            matchers: MatcherConfig::default(),
            capture_engine: default_capture_engine(),
        }
    }
}

fn default_capture_engine() -> String {
    "libpcap".to_string()
}

/* --------------------------------------------------------------------------------- */

/// Connection tracking options.
///
/// ## Example
/// ```toml
/// [conntrack]
///     max_connections = 1_000_000
///     expiry_secs = 300
///     frozen_ttl_secs = 240
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConnTrackConfig {
    /// Maximum number of connections tracked simultaneously. Defaults to
    /// `1_000_000`.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// A connection idle for longer than this is reaped by the expiry loop
    /// (`remove_expired`). Minimum one minute; default five.
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,

    /// How often the expiry loop sweeps the connection table, in seconds.
    #[serde(default = "default_expiry_interval_secs")]
    pub expiry_interval_secs: u64,

    /// The frozen-flow window (`TTLCache`), in seconds. Defaults
    /// to 2×MSL (240s, using the standard 120s MSL).
    #[serde(default = "default_frozen_ttl_secs")]
    pub frozen_ttl_secs: u64,

    /// Capacity of the bounded `roundtrips` output channel; also
    /// sizes the worker pool that drains it.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
}

impl ConnTrackConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs.max(60))
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_interval_secs)
    }

    pub fn frozen_ttl(&self) -> Duration {
        Duration::from_secs(self.frozen_ttl_secs)
    }
}

impl Default for ConnTrackConfig {
    fn default() -> Self {
        ConnTrackConfig {
            max_connections: default_max_connections(),
            expiry_secs: default_expiry_secs(),
            expiry_interval_secs: default_expiry_interval_secs(),
            frozen_ttl_secs: default_frozen_ttl_secs(),
            worker_concurrency: default_worker_concurrency(),
        }
    }
}

fn default_max_connections() -> usize {
    1_000_000
}

fn default_expiry_secs() -> u64 {
    300
}

fn default_expiry_interval_secs() -> u64 {
    60
}

fn default_frozen_ttl_secs() -> u64 {
    240
}

fn default_worker_concurrency() -> usize {
    4
}

/* --------------------------------------------------------------------------------- */

/// HTTP/1.1 body-capture options.
///
/// ## Example
/// ```toml
/// [http]
///     enable_body = true
///     max_body_size = 102400
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct HttpConfig {
    /// Whether to capture a JSON response body prefix. Defaults to `false`.
    #[serde(default)]
    pub enable_body: bool,

    /// Maximum captured body size in bytes. Defaults to 100 KiB.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig { enable_body: false, max_body_size: default_max_body_size() }
    }
}

fn default_max_body_size() -> usize {
    100 * 1024
}

/* --------------------------------------------------------------------------------- */

/// HTTP/2 options, also used for gRPC (which rides on the
/// same frame/stream decoder with a different trailer-key set).
///
/// ## Example
/// ```toml
/// [http2]
///     max_concurrent_streams = 100
///     trailer_keys = ["grpc-status", "grpc-message"]
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Http2Config {
    /// Per-connection stream pool cap; the lowest-numbered stream is evicted
    /// past this. Defaults to `100`.
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,

    /// A HEADERS frame whose key set is a superset of `trailer_keys` is
    /// treated as trailers (request/response completion marker) rather than
    /// a new message. Defaults to gRPC's `grpc-status`/`grpc-message`.
    #[serde(default = "default_trailer_keys")]
    pub trailer_keys: Vec<String>,
}

impl Default for Http2Config {
    fn default() -> Self {
        Http2Config {
            max_concurrent_streams: default_max_concurrent_streams(),
            trailer_keys: default_trailer_keys(),
        }
    }
}

fn default_max_concurrent_streams() -> usize {
    100
}

fn default_trailer_keys() -> Vec<String> {
    vec!["grpc-status".to_string(), "grpc-message".to_string()]
}

/* --------------------------------------------------------------------------------- */

/// MongoDB options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MongodbConfig {
    /// Whether to skim `ok`/`code` out of OP_MSG response bodies. Defaults
    /// to `false`.
    #[serde(default)]
    pub enable_response_code: bool,
}

impl Default for MongodbConfig {
    fn default() -> Self {
        MongodbConfig { enable_response_code: false }
    }
}

/* --------------------------------------------------------------------------------- */

/// Matcher capacities.
///
/// ## Example
/// ```toml
/// [matchers]
///     list_cap_http2 = 100
///     list_cap_keyed = 64
///     fuzzy_cap = 128
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MatcherConfig {
    /// `ListMatcher` cap for HTTP/2 and gRPC streams. Defaults to `100`.
    #[serde(default = "default_list_cap_http2")]
    pub list_cap_http2: usize,

    /// `ListMatcher` cap for MongoDB and Kafka (keyed by correlation/request
    /// id rather than stream id). Defaults to `64`.
    #[serde(default = "default_list_cap_keyed")]
    pub list_cap_keyed: usize,

    /// `FuzzyMatcher` cap for AMQP. Defaults to `128` (mirrors the §4.12
    /// channel-pool eviction threshold).
    #[serde(default = "default_fuzzy_cap")]
    pub fuzzy_cap: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        MatcherConfig {
            list_cap_http2: default_list_cap_http2(),
            list_cap_keyed: default_list_cap_keyed(),
            fuzzy_cap: default_fuzzy_cap(),
        }
    }
}

fn default_list_cap_http2() -> usize {
    100
}

fn default_list_cap_keyed() -> usize {
    64
}

fn default_fuzzy_cap() -> usize {
    128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_bounds() {
        let cfg = default_config();
        assert!(cfg.conntrack.expiry() >= Duration::from_secs(60));
        assert_eq!(cfg.matchers.list_cap_http2, 100);
        assert_eq!(cfg.matchers.list_cap_keyed, 64);
    }

    #[test]
    fn toml_round_trips_protocol_bindings() {
        let toml_str = r#"
            capture_engine = "libpcap"

            [[protocols]]
            protocol = "http1"
            ports = [80, 8080]

            [[protocols]]
            protocol = "redis"
            ports = [6379]

            [conntrack]
            expiry_secs = 120
        "#;
        let cfg: RuntimeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.protocols.len(), 2);
        assert_eq!(cfg.protocols[0].protocol, ProtocolId::Http1);
        assert_eq!(cfg.protocols[0].ports, vec![80, 8080]);
        assert_eq!(cfg.conntrack.expiry_secs, 120);
    }
}
