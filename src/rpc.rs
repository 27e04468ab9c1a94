//! RPC Transport: at-most-once delivery of a procedure call to a single
//! consumer, via a redis list and a companion expiry key.
//!
//! Grounded on `lightbus.transports.redis.RedisRpcTransport` for the
//! protocol (`RPUSH`+`SET`+`EXPIRE` on call, `BLPOP`+`DEL` on consume) and
//! on the teacher crate's `persist::redis::RedisPool::pipe`/`sq` for how a
//! pipeline is built and run against a pooled connection.

use std::time::Duration;

use redis::aio::ConnectionLike;
use redis::AsyncCommands;

use crate::config::RpcConfig;
use crate::error::Result;
use crate::message::RpcMessage;
use crate::pool::ConnectionManager;
use crate::serializer::{decode_blob, encode_blob};

pub struct RpcTransport {
    cm: ConnectionManager,
    config: RpcConfig,
}

impl RpcTransport {
    pub fn new(config: RpcConfig) -> Self {
        let cm = ConnectionManager::from_parameters(config.connection_parameters.clone());
        Self { cm, config }
    }

    pub fn from_pool(pool: bb8::Pool<bb8_redis::RedisConnectionManager>, config: RpcConfig) -> Self {
        Self {
            cm: ConnectionManager::from_pool(pool),
            config,
        }
    }

    /// Enqueue a call. Returns once the enqueue pipeline commits; the
    /// producer never waits for a consumer.
    pub async fn call(&self, message: &RpcMessage) -> Result<()> {
        let timeout = self.config.rpc_timeout_secs;
        self.cm
            .acquire(|mut conn| async move { do_call(&mut *conn, message, timeout).await })
            .await
    }

    /// One consume iteration: `BLPOP` across `apis`' queues (blocks
    /// indefinitely), then `DEL` the popped call's expiry key. Returns
    /// `None` if the call had already expired — an empty batch, per the
    /// spec's RPC message lifecycle.
    pub async fn consume_once(&self, apis: &[String]) -> Result<Option<RpcMessage>> {
        let queue_keys: Vec<String> = apis.iter().map(|api| format!("{api}:rpc_queue")).collect();
        self.cm
            .acquire(|mut conn| async move { do_consume_once(&mut *conn, &queue_keys).await })
            .await
    }

    /// Drive `consume_once` forever, invoking `on_message` for every
    /// delivered call. A dropped connection is treated as transient: log a
    /// warning, sleep `consumption_restart_delay`, and resume.
    pub async fn run<F, Fut>(&self, apis: Vec<String>, mut on_message: F) -> Result<()>
    where
        F: FnMut(RpcMessage) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            match self.consume_once(&apis).await {
                Ok(Some(message)) => on_message(message).await,
                Ok(None) => {}
                Err(err) if err.is_connection_closed() => {
                    log::warn!(
                        "redis connection lost while consuming RPCs, reconnecting in {}s...",
                        self.config.consumption_restart_delay_secs
                    );
                    tokio::time::sleep(Duration::from_secs(
                        self.config.consumption_restart_delay_secs,
                    ))
                    .await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn close(&self) {
        self.cm.close().await
    }
}

async fn do_call<C>(conn: &mut C, message: &RpcMessage, rpc_timeout_secs: u64) -> Result<()>
where
    C: ConnectionLike + Send + AsyncCommands,
{
    let blob = encode_blob(message)?;
    let queue_key = message.queue_key();
    let expiry_key = message.expiry_key();

    redis::pipe()
        .atomic()
        .rpush(&queue_key, blob)
        .ignore()
        .set(&expiry_key, 1)
        .ignore()
        .expire(&expiry_key, rpc_timeout_secs as i64)
        .ignore()
        .query_async::<()>(conn)
        .await?;
    Ok(())
}

async fn do_consume_once<C>(conn: &mut C, queue_keys: &[String]) -> Result<Option<RpcMessage>>
where
    C: ConnectionLike + Send + AsyncCommands,
{
    let (_queue, payload): (String, Vec<u8>) = conn.blpop(queue_keys, 0.0).await?;
    let message: RpcMessage = decode_blob(&payload)?;

    let expiry_key = message.expiry_key();
    let deleted: i64 = conn.del(&expiry_key).await?;
    if deleted == 0 {
        return Ok(None);
    }
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis_test::{MockCmd, MockRedisConnection};

    fn sample_message() -> RpcMessage {
        let mut message = RpcMessage::new("my.api", "add");
        message.id = uuid::Uuid::nil();
        message
    }

    #[tokio::test]
    async fn call_enqueues_and_sets_expiry() {
        let message = sample_message();
        let blob = encode_blob(&message).unwrap();
        let mut conn = MockRedisConnection::new(vec![
            MockCmd::new(
                redis::cmd("RPUSH").arg(message.queue_key()).arg(blob),
                Ok("1"),
            ),
            MockCmd::new(
                redis::cmd("SET").arg(message.expiry_key()).arg(1),
                Ok("OK"),
            ),
            MockCmd::new(
                redis::cmd("EXPIRE").arg(message.expiry_key()).arg(5),
                Ok("1"),
            ),
        ]);
        do_call(&mut *conn, &message, 5).await.unwrap();
    }

    #[tokio::test]
    async fn consume_once_discards_expired_call() {
        let message = sample_message();
        let blob = encode_blob(&message).unwrap();
        let queue_key = message.queue_key();
        let mut conn = MockRedisConnection::new(vec![
            MockCmd::new(
                redis::cmd("BLPOP").arg(&queue_key).arg(0.0),
                Ok((queue_key.clone(), blob)),
            ),
            MockCmd::new(redis::cmd("DEL").arg(message.expiry_key()), Ok(0)),
        ]);
        let result = do_consume_once(&mut *conn, std::slice::from_ref(&queue_key))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn consume_once_delivers_valid_call() {
        let message = sample_message();
        let blob = encode_blob(&message).unwrap();
        let queue_key = message.queue_key();
        let mut conn = MockRedisConnection::new(vec![
            MockCmd::new(
                redis::cmd("BLPOP").arg(&queue_key).arg(0.0),
                Ok((queue_key.clone(), blob)),
            ),
            MockCmd::new(redis::cmd("DEL").arg(message.expiry_key()), Ok(1)),
        ]);
        let result = do_consume_once(&mut *conn, std::slice::from_ref(&queue_key))
            .await
            .unwrap();
        assert_eq!(result, Some(message));
    }
}
