//! Result Transport: delivers a single RPC result back to the caller
//! holding the matching return-path key.
//!
//! Grounded on `lightbus.transports.redis.RedisResultTransport`: the
//! return path is an opaque `redis+key://<key>` string, producers
//! `LPUSH`+`EXPIRE`, callers loop on `BLPOP` because the underlying client
//! can hand back an empty reply on spurious wakeup or cancellation.

use redis::aio::ConnectionLike;
use redis::AsyncCommands;

use crate::config::ResultConfig;
use crate::error::{BusError, Result};
use crate::message::{ResultMessage, RpcMessage};
use crate::pool::ConnectionManager;
use crate::serializer::{decode_blob, encode_blob};

const RETURN_PATH_PREFIX: &str = "redis+key://";

pub struct ResultTransport {
    cm: ConnectionManager,
    config: ResultConfig,
}

impl ResultTransport {
    pub fn new(config: ResultConfig) -> Self {
        let cm = ConnectionManager::from_parameters(config.connection_parameters.clone());
        Self { cm, config }
    }

    pub fn from_pool(pool: bb8::Pool<bb8_redis::RedisConnectionManager>, config: ResultConfig) -> Self {
        Self {
            cm: ConnectionManager::from_pool(pool),
            config,
        }
    }

    /// Pure: the key a caller should poll for this call's result.
    pub fn get_return_path(rpc_message: &RpcMessage) -> String {
        format!(
            "{RETURN_PATH_PREFIX}{}.{}:result:{}",
            rpc_message.api_name, rpc_message.procedure_name, rpc_message.id
        )
    }

    pub async fn send_result(&self, result_message: &ResultMessage, return_path: &str) -> Result<()> {
        let key = parse_return_path(return_path)?;
        let ttl = self.config.result_ttl_secs;
        self.cm
            .acquire(|mut conn| async move { do_send_result(&mut *conn, &key, result_message, ttl).await })
            .await
    }

    pub async fn receive_result(&self, return_path: &str) -> Result<ResultMessage> {
        let key = parse_return_path(return_path)?;
        let timeout = self.config.rpc_timeout_secs;
        self.cm
            .acquire(|mut conn| async move { do_receive_result(&mut *conn, &key, timeout).await })
            .await
    }

    pub async fn close(&self) {
        self.cm.close().await
    }
}

fn parse_return_path(return_path: &str) -> Result<String> {
    return_path
        .strip_prefix(RETURN_PATH_PREFIX)
        .map(str::to_owned)
        .ok_or_else(|| BusError::MalformedReturnPath(return_path.to_owned()))
}

async fn do_send_result<C>(
    conn: &mut C,
    key: &str,
    result_message: &ResultMessage,
    ttl_secs: u64,
) -> Result<()>
where
    C: ConnectionLike + Send + AsyncCommands,
{
    let blob = encode_blob(result_message)?;
    redis::pipe()
        .atomic()
        .lpush(key, blob)
        .ignore()
        .expire(key, ttl_secs as i64)
        .ignore()
        .query_async::<()>(conn)
        .await?;
    Ok(())
}

async fn do_receive_result<C>(conn: &mut C, key: &str, timeout_secs: u64) -> Result<ResultMessage>
where
    C: ConnectionLike + Send + AsyncCommands,
{
    loop {
        // A timed-out or spuriously-woken BLPOP returns an empty reply;
        // the original implementation loops rather than treating that as
        // "no result", and so does this port.
        let reply: Option<(String, Vec<u8>)> = conn.blpop(key, timeout_secs as f64).await?;
        if let Some((_key, payload)) = reply {
            return decode_blob(&payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn return_path_round_trips() {
        let message = RpcMessage::new("my.api", "add");
        let path = ResultTransport::get_return_path(&message);
        assert!(path.starts_with("redis+key://"));
        let key = parse_return_path(&path).unwrap();
        assert_eq!(key, format!("my.api.add:result:{}", message.id));
    }

    #[test]
    fn rejects_paths_without_prefix() {
        let err = parse_return_path("not-a-key").unwrap_err();
        assert!(matches!(err, BusError::MalformedReturnPath(_)));
    }

    #[tokio::test]
    async fn send_result_pipelines_lpush_and_expire() {
        use redis_test::{MockCmd, MockRedisConnection};

        let result = ResultMessage::ok(Uuid::nil(), serde_json::json!(5));
        let blob = encode_blob(&result).unwrap();
        let mut conn = MockRedisConnection::new(vec![
            MockCmd::new(redis::cmd("LPUSH").arg("my.api.add:result:1").arg(blob), Ok(1)),
            MockCmd::new(redis::cmd("EXPIRE").arg("my.api.add:result:1").arg(60), Ok(1)),
        ]);
        do_send_result(&mut *conn, "my.api.add:result:1", &result, 60)
            .await
            .unwrap();
    }
}
