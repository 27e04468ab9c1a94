//! Symmetric encode/decode over a message value, in the two flavors the
//! wire format needs: *blob* (RPC calls and results, one opaque value per
//! list element) and *by-field* (events, matching a Redis Stream entry's
//! native field/value shape).
//!
//! Blob encoding reuses the teacher crate's own workaround for redis-rs
//! binary strings: msgpack via `rmp_serde`, exactly as `persist::redis::RedisStr`
//! does it.

use std::collections::HashMap;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{BusError, Result};
use crate::message::EventMessage;

/// A single opaque payload, written as one redis value (`RPUSH`/`LPUSH`
/// argument).
pub fn encode_blob<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode_blob<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Redis Stream entry fields: an ordered field -> value mapping, one field
/// per message attribute rather than a single opaque blob.
pub type Fields = Vec<(String, String)>;

const NOOP_FIELD: &str = "";

/// A stream-seed noop entry: `{"": ""}`. Written only to force stream
/// creation before `XGROUP CREATE`; recognised and skipped on read.
pub fn noop_fields() -> Fields {
    vec![(NOOP_FIELD.to_owned(), String::new())]
}

fn is_noop(fields: &Fields) -> bool {
    fields.len() == 1 && fields[0].0 == NOOP_FIELD && fields[0].1.is_empty()
}

/// Encode an event message as individual stream fields: the envelope
/// (id/api/event name) as top-level fields, then one field per kwarg and
/// metadata entry, each JSON-encoded.
pub fn encode_event_fields(message: &EventMessage) -> Result<Fields> {
    let mut fields = Vec::with_capacity(3 + message.kwargs.len() + message.metadata.len());
    fields.push(("id".to_owned(), message.id.to_string()));
    fields.push(("api_name".to_owned(), message.api_name.clone()));
    fields.push(("event_name".to_owned(), message.event_name.clone()));
    for (key, value) in &message.kwargs {
        fields.push((format!("kwargs:{key}"), serde_json::to_string(value)?));
    }
    for (key, value) in &message.metadata {
        fields.push((format!("metadata:{key}"), value.clone()));
    }
    Ok(fields)
}

/// Decode stream fields back into an event message. Returns `Ok(None)` for
/// a noop seed entry; the caller is responsible for the separate
/// `expected_events` filter described by the spec.
pub fn decode_event_fields(fields: Fields, native_id: Option<String>) -> Result<Option<EventMessage>> {
    if is_noop(&fields) {
        return Ok(None);
    }

    let mut map: HashMap<String, String> = fields.into_iter().collect();
    let id = map
        .remove("id")
        .ok_or_else(|| BusError::Decode("missing id field".to_owned()))?
        .parse()
        .map_err(|e| BusError::Decode(format!("invalid id field: {e}")))?;
    let api_name = map
        .remove("api_name")
        .ok_or_else(|| BusError::Decode("missing api_name field".to_owned()))?;
    let event_name = map
        .remove("event_name")
        .ok_or_else(|| BusError::Decode("missing event_name field".to_owned()))?;

    let mut kwargs = HashMap::new();
    let mut metadata = HashMap::new();
    for (key, value) in map {
        if let Some(name) = key.strip_prefix("kwargs:") {
            let decoded = serde_json::from_str(&value)?;
            kwargs.insert(name.to_owned(), decoded);
        } else if let Some(name) = key.strip_prefix("metadata:") {
            metadata.insert(name.to_owned(), value);
        }
    }

    Ok(Some(EventMessage {
        id,
        api_name,
        event_name,
        kwargs,
        metadata,
        native_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RpcMessage;

    #[test]
    fn blob_round_trips() {
        let message = RpcMessage::new("my.api", "add").with_kwargs(HashMap::from([(
            "x".to_owned(),
            serde_json::json!(2),
        )]));
        let bytes = encode_blob(&message).unwrap();
        let decoded: RpcMessage = decode_blob(&bytes).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn event_fields_round_trip() {
        let message = EventMessage::new("acct", "opened").with_kwargs(HashMap::from([(
            "user_id".to_owned(),
            serde_json::json!(42),
        )]));
        let fields = encode_event_fields(&message).unwrap();
        let decoded = decode_event_fields(fields, Some("123-0".to_owned()))
            .unwrap()
            .unwrap();
        assert_eq!(decoded.id, message.id);
        assert_eq!(decoded.api_name, "acct");
        assert_eq!(decoded.event_name, "opened");
        assert_eq!(decoded.kwargs.get("user_id"), Some(&serde_json::json!(42)));
        assert_eq!(decoded.native_id.as_deref(), Some("123-0"));
    }

    #[test]
    fn noop_fields_decode_to_none() {
        let decoded = decode_event_fields(noop_fields(), Some("1-0".to_owned())).unwrap();
        assert!(decoded.is_none());
    }
}
