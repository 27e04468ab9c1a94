//! Stream-position ("since") helpers.
//!
//! Ported behavior-for-behavior from `lightbus.transports.redis`'s
//! `normalise_since_value` and `redis_stream_id_subtract_one` — the
//! distilled spec states the normalization rules but the original source
//! is the authority on the exact subtract-one arithmetic used at the
//! boundaries (§8 of the spec).

use chrono::{DateTime, Utc};

/// A stream position as given by a caller: absent/empty means "from now
/// on", a datetime is converted to a millisecond-resolution id, anything
/// else is assumed to already be a valid redis stream id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Since {
    Tail,
    At(DateTime<Utc>),
    Id(String),
}

impl Default for Since {
    fn default() -> Self {
        Since::Tail
    }
}

/// Normalise a `since` value to the redis stream id it corresponds to.
pub fn normalise_since_value(since: &Since) -> String {
    match since {
        Since::Tail => "$".to_owned(),
        Since::At(dt) => format!("{}-0", (dt.timestamp_millis()).max(0)),
        Since::Id(id) => id.clone(),
    }
}

/// Subtract one from a redis stream id (`"<ms>-<seq>"`), useful when a
/// caller needs to read inclusive of a given id rather than exclusive of
/// it. Clamped at the zero id, which cannot be decremented further.
pub fn redis_stream_id_subtract_one(message_id: &str) -> String {
    let Some((ms_str, seq_str)) = message_id.split_once('-') else {
        return message_id.to_owned();
    };
    let (Ok(ms), Ok(seq)) = (ms_str.parse::<i64>(), seq_str.parse::<i64>()) else {
        return message_id.to_owned();
    };

    if seq > 0 {
        format!("{ms}-{}", seq - 1)
    } else if ms > 0 {
        format!("{}-9999", ms - 1)
    } else {
        message_id.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_id_is_clamped() {
        assert_eq!(redis_stream_id_subtract_one("0-0"), "0-0");
    }

    #[test]
    fn sequence_rolls_back_to_9999_when_zero() {
        assert_eq!(redis_stream_id_subtract_one("5-0"), "4-9999");
    }

    #[test]
    fn nonzero_sequence_just_decrements() {
        assert_eq!(redis_stream_id_subtract_one("5-3"), "5-2");
    }

    #[test]
    fn tail_normalises_to_dollar() {
        assert_eq!(normalise_since_value(&Since::Tail), "$");
    }

    #[test]
    fn explicit_id_passes_through() {
        assert_eq!(
            normalise_since_value(&Since::Id("123-4".to_owned())),
            "123-4"
        );
    }

    #[test]
    fn datetime_normalises_to_millisecond_id() {
        let dt = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(normalise_since_value(&Since::At(dt)), "1704067200000-0");
    }
}
