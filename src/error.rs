//! Unified error handling for the transport core.
//!
//! Mirrors the teacher crate's `BotError`: one `thiserror` enum collecting
//! every library error the dependency stack can actually produce, plus a
//! handful of domain variants for states the wire protocol itself defines
//! (a closed transport, an expired pool, a malformed return path).

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    /// `close()` has already been called on this transport; do not retry.
    #[error("transport is closed")]
    TransportIsClosed,

    /// The pool reported closed while an `acquire()` was already in flight.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// Constructor-time misuse: an injected pool used from a different OS
    /// thread than the one that built it, or a pool backed by a single
    /// connection rather than a real pool.
    #[error("invalid redis pool: {0}")]
    InvalidPool(String),

    /// A return-path string did not start with `redis+key://`.
    #[error("malformed return path: {0}")]
    MalformedReturnPath(String),

    /// A stream/field payload could not be turned back into a message.
    #[error("failed to decode message: {0}")]
    Decode(String),

    /// A stored schema could not be parsed back into JSON.
    #[error("failed to load schema for api {api}: {source}")]
    SchemaLoad {
        api: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis pool error: {0}")]
    Pool(#[from] bb8::RunError<redis::RedisError>),

    #[error("msgpack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("operation was cancelled")]
    Cancelled,
}

impl BusError {
    /// True for errors that a long-running consume loop should treat as
    /// transient: log, sleep `consumption_restart_delay`, and resume.
    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            BusError::Redis(e) if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal()
        )
    }
}
