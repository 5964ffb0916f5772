//! Field string encodings
//!
//! Every persisted field is a string. Encodings are chosen so that byte order
//! matches value order wherever a field takes part in an index:
//!
//! | Type                    | Encoding                                  |
//! |-------------------------|-------------------------------------------|
//! | `String`                | as-is                                     |
//! | unsigned integers       | zero-padded to 20 digits                  |
//! | signed integers, floats | decimal                                   |
//! | `bool`                  | `"true"`                                  |
//! | `Duration`              | whole nanoseconds                         |
//! | `Option<DateTime<Utc>>` | `YYYY-MM-DDTHH:MM:SS.nnnnnnnnnZ`          |
//!
//! Zero values (0, false, empty, `None`) always encode as `""`.

use super::{CodecError, Values};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Timestamp layout: fixed width, nanosecond precision, always UTC.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";

/// A value that can be stored in a record field.
pub trait FieldValue {
    fn encode_field(&self) -> String;

    /// Parse the stored form. `""` yields the zero value.
    fn decode_field(raw: &str) -> Result<Self, String>
    where
        Self: Sized;
}

impl FieldValue for String {
    fn encode_field(&self) -> String {
        self.clone()
    }

    fn decode_field(raw: &str) -> Result<Self, String> {
        Ok(raw.to_string())
    }
}

macro_rules! unsigned_field {
    ($($t:ty),*) => {$(
        impl FieldValue for $t {
            fn encode_field(&self) -> String {
                if *self == 0 {
                    String::new()
                } else {
                    format!("{:020}", self)
                }
            }

            fn decode_field(raw: &str) -> Result<Self, String> {
                if raw.is_empty() {
                    return Ok(0);
                }
                raw.parse::<$t>().map_err(|e| e.to_string())
            }
        }
    )*};
}

macro_rules! signed_field {
    ($($t:ty),*) => {$(
        impl FieldValue for $t {
            fn encode_field(&self) -> String {
                if *self == 0 {
                    String::new()
                } else {
                    self.to_string()
                }
            }

            fn decode_field(raw: &str) -> Result<Self, String> {
                if raw.is_empty() {
                    return Ok(0);
                }
                raw.parse::<$t>().map_err(|e| e.to_string())
            }
        }
    )*};
}

unsigned_field!(u16, u32, u64);
signed_field!(i32, i64);

impl FieldValue for f64 {
    fn encode_field(&self) -> String {
        if *self == 0.0 {
            String::new()
        } else {
            self.to_string()
        }
    }

    fn decode_field(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Ok(0.0);
        }
        raw.parse::<f64>().map_err(|e| e.to_string())
    }
}

impl FieldValue for bool {
    fn encode_field(&self) -> String {
        if *self {
            "true".to_string()
        } else {
            String::new()
        }
    }

    fn decode_field(raw: &str) -> Result<Self, String> {
        match raw {
            "" | "false" => Ok(false),
            "true" => Ok(true),
            other => Err(format!("invalid bool {:?}", other)),
        }
    }
}

impl FieldValue for Duration {
    fn encode_field(&self) -> String {
        let nanos = self.as_nanos();
        if nanos == 0 {
            String::new()
        } else {
            nanos.to_string()
        }
    }

    fn decode_field(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Ok(Duration::ZERO);
        }
        let nanos: u64 = raw.parse().map_err(|e: std::num::ParseIntError| e.to_string())?;
        Ok(Duration::from_nanos(nanos))
    }
}

impl FieldValue for Option<DateTime<Utc>> {
    fn encode_field(&self) -> String {
        match self {
            Some(t) => format_timestamp(t),
            None => String::new(),
        }
    }

    fn decode_field(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Ok(None);
        }
        parse_timestamp(raw).map(Some)
    }
}

pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp {:?}: {}", raw, e))
}

/// Store `value` under `name`.
pub fn put<V: FieldValue>(values: &mut Values, name: &str, value: &V) {
    values.insert(name.to_string(), value.encode_field());
}

/// Read `name`, treating an absent field as the zero value.
pub fn get<V: FieldValue>(
    values: &Values,
    entity: &'static str,
    name: &'static str,
) -> Result<V, CodecError> {
    let raw = values.get(name).map(String::as_str).unwrap_or("");
    V::decode_field(raw).map_err(|message| CodecError::InvalidValue {
        entity,
        field: name,
        message,
    })
}

/// Store an embedded record as JSON; `None` stores `""`.
pub fn put_json<T: Serialize>(
    values: &mut Values,
    name: &str,
    value: &Option<T>,
) -> Result<(), CodecError> {
    let encoded = match value {
        Some(v) => serde_json::to_string(v).map_err(|e| CodecError::Serialization(e.to_string()))?,
        None => String::new(),
    };
    values.insert(name.to_string(), encoded);
    Ok(())
}

pub fn get_json<T: DeserializeOwned>(
    values: &Values,
    entity: &'static str,
    name: &'static str,
) -> Result<Option<T>, CodecError> {
    match values.get(name).map(String::as_str) {
        None | Some("") => Ok(None),
        Some(raw) => serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| CodecError::InvalidValue {
                entity,
                field: name,
                message: e.to_string(),
            }),
    }
}
