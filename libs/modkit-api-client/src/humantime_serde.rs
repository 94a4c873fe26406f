//! Serde `with` module for `humantime`-formatted `Duration` fields (`"250ms"`, `"5m"`).

use serde::{Deserialize, Deserializer, de};
use std::time::Duration;

/// Deserializes a `Duration` from a humantime string.
///
/// # Errors
/// Returns a deserialization error if the string is not a valid humantime duration.
pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(d)?;
    humantime::parse_duration(&raw).map_err(de::Error::custom)
}

/// `Option<Duration>` variant that also accepts a bare integer as milliseconds.
pub mod option {
    use serde::{Deserialize, Deserializer, de};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Millis(u64),
        Text(String),
    }

    /// Deserializes an optional duration from `"5s"`-style text or integer milliseconds.
    ///
    /// # Errors
    /// Returns a deserialization error for unparsable text.
    pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Repr>::deserialize(d)? {
            None => Ok(None),
            Some(Repr::Millis(ms)) => Ok(Some(Duration::from_millis(ms))),
            Some(Repr::Text(raw)) => humantime::parse_duration(&raw)
                .map(Some)
                .map_err(de::Error::custom),
        }
    }
}
