//! # Redbus: a Redis-backed transport core for a request/response and
//! durable pub/sub message bus.
//!
//! Redbus provides the four transports a message bus needs to talk to
//! Redis — RPC call delivery, RPC result delivery, durable event
//! streaming, and schema storage — plus the connection pooling,
//! serialization, and error handling they share. It does not implement
//! an API registry, argument validation, or a plugin system; those are
//! the job of whatever sits on top of this crate.

use async_trait::async_trait;

use crate::error::Result;

/// Errors this crate can return, and the retry/fatal distinction a
/// long-running consumer needs.
pub mod error;

/// Wire message shapes shared by every transport.
pub mod message;

/// Typed configuration the core itself owns.
pub mod config;

/// Thread-affine pooled connection access.
pub mod pool;

/// Blob and by-field encoding used over the wire.
pub mod serializer;

/// Stream-position normalisation helpers.
pub mod since;

/// RPC call transport.
pub mod rpc;

/// RPC result transport.
pub mod result;

/// Event transport.
pub mod event;

/// Schema transport.
pub mod schema;

pub use config::{ConnectionParameters, EventConfig, ResultConfig, RpcConfig, SchemaConfig, StreamUse};
pub use error::BusError;
pub use event::{DeliveredEvent, EventConsumer, EventTransport};
pub use message::{EventMessage, ResultMessage, RpcMessage};
pub use rpc::RpcTransport;
pub use result::ResultTransport;
pub use schema::SchemaTransport;
pub use since::Since;

/// Common shutdown surface for the four transports, so an embedder
/// holding a `Vec<Box<dyn Transport>>` (or similar) doesn't need to know
/// which concrete transport it's closing.
#[async_trait]
pub trait Transport {
    async fn close(&self);
}

#[async_trait]
impl Transport for RpcTransport {
    async fn close(&self) {
        RpcTransport::close(self).await
    }
}

#[async_trait]
impl Transport for ResultTransport {
    async fn close(&self) {
        ResultTransport::close(self).await
    }
}

#[async_trait]
impl Transport for EventTransport {
    async fn close(&self) {
        EventTransport::close(self).await
    }
}

#[async_trait]
impl Transport for SchemaTransport {
    async fn close(&self) {
        SchemaTransport::close(self).await
    }
}

/// A bundle of the four transports, sharing nothing but a consistent
/// configuration convention; each one owns its own connection manager.
pub struct Bus {
    pub rpc: RpcTransport,
    pub result: ResultTransport,
    pub event: EventTransport,
    pub schema: SchemaTransport,
}

impl Bus {
    pub fn new(
        rpc_config: RpcConfig,
        result_config: ResultConfig,
        event_config: EventConfig,
        schema_config: SchemaConfig,
    ) -> Self {
        Self {
            rpc: RpcTransport::new(rpc_config),
            result: ResultTransport::new(result_config),
            event: EventTransport::new(event_config),
            schema: SchemaTransport::new(schema_config),
        }
    }

    /// Close every transport's connection manager.
    pub async fn close(&self) {
        let transports: [&dyn Transport; 4] = [&self.rpc, &self.result, &self.event, &self.schema];
        for transport in transports {
            transport.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_wires_up_default_configs() {
        let bus = Bus::new(
            RpcConfig::default(),
            ResultConfig::default(),
            EventConfig::new("myapp", "consumer-1"),
            SchemaConfig::default(),
        );
        let _: &RpcTransport = &bus.rpc;
    }

    #[allow(dead_code)]
    fn result_alias_is_exported() -> Result<()> {
        Ok(())
    }
}
