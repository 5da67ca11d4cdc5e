//! Duration parsing for config values and query parameters.
//!
//! Accepts either a bare number of seconds (`"30"`) or a suffixed
//! human string (`"2m30s"`). Empty strings and `"0"` mean zero.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
#[error("invalid duration value '{0}'")]
pub struct DurationError(String);

/// Parse a human-written duration.
pub fn parse_duration(val: &str) -> Result<Duration, DurationError> {
    let val = val.trim();

    if val.is_empty() || val == "0" {
        return Ok(Duration::ZERO);
    }

    if val.bytes().all(|b| b.is_ascii_digit()) {
        let seconds: u64 = val.parse().map_err(|_| DurationError(val.to_string()))?;
        return Ok(Duration::from_secs(seconds));
    }

    humantime::parse_duration(val).map_err(|_| DurationError(val.to_string()))
}

/// Serde adapter for optional duration fields that may be written as
/// an integer (seconds) or a suffixed string.
pub mod serde_opt {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Deserializer, Visitor};

    use super::parse_duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Option<Duration>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an integer number of seconds or a duration string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(Some(Duration::from_secs(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                if v < 0 {
                    return Err(E::custom("negative duration value"));
                }
                Ok(Some(Duration::from_secs(v as u64)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                parse_duration(v).map(Some).map_err(E::custom)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}
