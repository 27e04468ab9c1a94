//! Typed configuration the core itself owns.
//!
//! Loading these from a file or the environment is explicitly out of
//! scope (the plugin registry and config-file layer are external
//! collaborators) — these structs are plain `serde`-derived data that an
//! embedding application's own config loader can deserialize straight
//! into, mirroring the way the teacher crate's `statics::Config` nests
//! small serializable structs per concern.

use serde::{Deserialize, Serialize};

/// How a connection-backed transport should reach Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// `redis://host:port[/db]`
    pub address: String,
    /// Upper bound on pool size.
    pub maxsize: u32,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            address: "redis://127.0.0.1:6379".to_owned(),
            maxsize: 100,
        }
    }
}

impl ConnectionParameters {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_maxsize(mut self, maxsize: u32) -> Self {
        self.maxsize = maxsize;
        self
    }
}

/// Serializer variant selection. The distilled spec allows naming a
/// serializer by dotted path for compatibility with the original
/// implementation's dynamic loading; this port enumerates the two real
/// variants and treats anything else as a configuration error at
/// construction time rather than at first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializerKind {
    Blob,
    ByField,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default)]
    pub connection_parameters: ConnectionParameters,
    /// Reserved: accepted for wire compatibility, not yet used to batch
    /// `BLPOP` calls (see Open Questions in the spec).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_restart_delay")]
    pub consumption_restart_delay_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            connection_parameters: ConnectionParameters::default(),
            batch_size: default_batch_size(),
            rpc_timeout_secs: default_rpc_timeout(),
            consumption_restart_delay_secs: default_restart_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultConfig {
    #[serde(default)]
    pub connection_parameters: ConnectionParameters,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_result_ttl")]
    pub result_ttl_secs: u64,
}

impl Default for ResultConfig {
    fn default() -> Self {
        Self {
            connection_parameters: ConnectionParameters::default(),
            rpc_timeout_secs: default_rpc_timeout(),
            result_ttl_secs: default_result_ttl(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamUse {
    PerApi,
    PerEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default)]
    pub connection_parameters: ConnectionParameters,
    pub consumer_group_prefix: String,
    pub consumer_name: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Defaults to `batch_size * 10` when absent, per the distilled spec.
    #[serde(default)]
    pub reclaim_batch_size: Option<u64>,
    #[serde(default = "default_ack_timeout")]
    pub acknowledgement_timeout_secs: u64,
    /// `None` disables stream trimming.
    #[serde(default = "default_max_stream_length")]
    pub max_stream_length: Option<u64>,
    #[serde(default = "default_stream_use")]
    pub stream_use: StreamUse,
    #[serde(default = "default_restart_delay")]
    pub consumption_restart_delay_secs: u64,
}

impl EventConfig {
    pub fn new(consumer_group_prefix: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        Self {
            connection_parameters: ConnectionParameters::default(),
            consumer_group_prefix: consumer_group_prefix.into(),
            consumer_name: consumer_name.into(),
            batch_size: default_batch_size() as u64,
            reclaim_batch_size: None,
            acknowledgement_timeout_secs: default_ack_timeout(),
            max_stream_length: default_max_stream_length(),
            stream_use: default_stream_use(),
            consumption_restart_delay_secs: default_restart_delay(),
        }
    }

    pub fn effective_reclaim_batch_size(&self) -> u64 {
        self.reclaim_batch_size.unwrap_or(self.batch_size * 10)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(default)]
    pub connection_parameters: ConnectionParameters,
}

fn default_batch_size() -> usize {
    10
}
fn default_rpc_timeout() -> u64 {
    5
}
fn default_restart_delay() -> u64 {
    5
}
fn default_result_ttl() -> u64 {
    60
}
fn default_ack_timeout() -> u64 {
    60
}
fn default_max_stream_length() -> Option<u64> {
    Some(100_000)
}
fn default_stream_use() -> StreamUse {
    StreamUse::PerApi
}
