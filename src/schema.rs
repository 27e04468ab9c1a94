//! Schema Transport: stores and retrieves per-API JSON schema documents,
//! with an index set tracking which APIs currently have one stored.
//!
//! Grounded on `lightbus.transports.redis.RedisSchemaTransport`: one
//! string key per API (`schema:<api>`, optional TTL) plus a `schemas`
//! set recording which API keys are live, so `load()` can discover every
//! stored API without scanning the keyspace.

use std::collections::HashMap;

use redis::aio::ConnectionLike;
use redis::AsyncCommands;

use crate::config::SchemaConfig;
use crate::error::{BusError, Result};
use crate::pool::ConnectionManager;

const SCHEMA_INDEX_KEY: &str = "schemas";

pub struct SchemaTransport {
    cm: ConnectionManager,
}

impl SchemaTransport {
    pub fn new(config: SchemaConfig) -> Self {
        Self {
            cm: ConnectionManager::from_parameters(config.connection_parameters),
        }
    }

    pub fn from_pool(pool: bb8::Pool<bb8_redis::RedisConnectionManager>) -> Self {
        Self {
            cm: ConnectionManager::from_pool(pool),
        }
    }

    /// Store `schema` (already-serialized JSON) for `api_name`, recording
    /// it in the index set. `ttl_secs` of `None` means the entry never
    /// expires.
    pub async fn store(&self, api_name: &str, schema: &serde_json::Value, ttl_secs: Option<u64>) -> Result<()> {
        let key = schema_key(api_name);
        let payload = serde_json::to_string(schema)?;
        self.cm
            .acquire(|mut conn| async move { do_store(&mut *conn, &key, api_name, &payload, ttl_secs).await })
            .await
    }

    pub async fn delete(&self, api_name: &str) -> Result<()> {
        let key = schema_key(api_name);
        self.cm
            .acquire(|mut conn| async move { do_delete(&mut *conn, &key, api_name).await })
            .await
    }

    /// Load every schema currently recorded in the index set. An API
    /// whose key has since expired is silently dropped, matching the
    /// original transport's "an index entry is a hint, not a guarantee"
    /// behavior.
    pub async fn load(&self) -> Result<HashMap<String, serde_json::Value>> {
        self.cm
            .acquire(|mut conn| async move { do_load(&mut *conn).await })
            .await
    }

    pub async fn close(&self) {
        self.cm.close().await
    }
}

fn schema_key(api_name: &str) -> String {
    format!("schema:{api_name}")
}

async fn do_store<C>(
    conn: &mut C,
    key: &str,
    api_name: &str,
    payload: &str,
    ttl_secs: Option<u64>,
) -> Result<()>
where
    C: ConnectionLike + Send + AsyncCommands,
{
    let mut pipe = redis::pipe();
    pipe.atomic().set(key, payload).ignore();
    if let Some(ttl) = ttl_secs {
        pipe.expire(key, ttl as i64).ignore();
    }
    pipe.sadd(SCHEMA_INDEX_KEY, api_name).ignore();
    pipe.query_async::<()>(conn).await?;
    Ok(())
}

async fn do_delete<C>(conn: &mut C, key: &str, api_name: &str) -> Result<()>
where
    C: ConnectionLike + Send + AsyncCommands,
{
    redis::pipe()
        .atomic()
        .del(key)
        .ignore()
        .srem(SCHEMA_INDEX_KEY, api_name)
        .ignore()
        .query_async::<()>(conn)
        .await?;
    Ok(())
}

async fn do_load<C>(conn: &mut C) -> Result<HashMap<String, serde_json::Value>>
where
    C: ConnectionLike + Send + AsyncCommands,
{
    let api_names: Vec<String> = conn.smembers(SCHEMA_INDEX_KEY).await?;
    if api_names.is_empty() {
        return Ok(HashMap::new());
    }

    let keys: Vec<String> = api_names.iter().map(|name| schema_key(name)).collect();
    let payloads: Vec<Option<String>> = conn.mget(&keys).await?;

    let mut schemas = HashMap::with_capacity(api_names.len());
    for (api_name, payload) in api_names.into_iter().zip(payloads) {
        let Some(payload) = payload else {
            // Index entry outlived the key's TTL; not an error.
            continue;
        };
        let schema = serde_json::from_str(&payload).map_err(|source| BusError::SchemaLoad {
            api: api_name.clone(),
            source,
        })?;
        schemas.insert(api_name, schema);
    }
    Ok(schemas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis_test::{MockCmd, MockRedisConnection};

    #[tokio::test]
    async fn store_pipelines_set_expire_and_index() {
        let schema = serde_json::json!({"type": "object"});
        let payload = serde_json::to_string(&schema).unwrap();
        let mut conn = MockRedisConnection::new(vec![
            MockCmd::new(redis::cmd("SET").arg("schema:my.api").arg(&payload), Ok("OK")),
            MockCmd::new(redis::cmd("EXPIRE").arg("schema:my.api").arg(3600), Ok(1)),
            MockCmd::new(redis::cmd("SADD").arg("schemas").arg("my.api"), Ok(1)),
        ]);
        do_store(&mut *conn, "schema:my.api", "my.api", &payload, Some(3600))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn store_without_ttl_skips_expire() {
        let payload = "{}".to_owned();
        let mut conn = MockRedisConnection::new(vec![
            MockCmd::new(redis::cmd("SET").arg("schema:my.api").arg(&payload), Ok("OK")),
            MockCmd::new(redis::cmd("SADD").arg("schemas").arg("my.api"), Ok(1)),
        ]);
        do_store(&mut *conn, "schema:my.api", "my.api", &payload, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn load_skips_expired_index_entries() {
        let mut conn = MockRedisConnection::new(vec![
            MockCmd::new(
                redis::cmd("SMEMBERS").arg("schemas"),
                Ok(vec!["my.api".to_owned(), "gone.api".to_owned()]),
            ),
            MockCmd::new(
                redis::cmd("MGET")
                    .arg("schema:my.api")
                    .arg("schema:gone.api"),
                Ok(vec![Some("{\"type\":\"object\"}".to_owned()), None::<String>]),
            ),
        ]);
        let schemas = do_load(&mut *conn).await.unwrap();
        assert_eq!(schemas.len(), 1);
        assert!(schemas.contains_key("my.api"));
    }
}
