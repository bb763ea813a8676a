use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use ulid::Ulid;

/// A 26-character, timestamp-prefixed, lexicographically sortable, collision-
/// resistant token. Backed by a ULID: the first 10 characters
/// encode millisecond time, the remaining 16 are random, and Crockford
/// base32 encoding preserves lexicographic order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(Ulid);

impl TxId {
    pub fn new() -> Self { Self(Ulid::new()) }

    /// `YYYYMM` of this id's embedded timestamp, used as the Transactions
    /// table partition key.
    pub fn partition(&self) -> String {
        let millis = self.0.timestamp_ms();
        let secs = (millis / 1000) as i64;
        let nanos = ((millis % 1000) * 1_000_000) as u32;
        let dt = chrono::DateTime::from_timestamp(secs, nanos).unwrap_or_default();
        dt.format("%Y%m").to_string()
    }

    /// A short form suitable for subject lines.
    pub fn short(&self) -> String {
        let s = self.0.to_string();
        s[s.len().saturating_sub(8)..].to_string()
    }
}

impl Default for TxId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for TxId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TxId {
    type Err = ulid::DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Ok(Self(Ulid::from_str(s)?)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_26_chars() {
        assert_eq!(TxId::new().to_string().len(), 26);
    }

    #[test]
    fn sorts_lexicographically_with_time() {
        let a = TxId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = TxId::new();
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn round_trips_through_display_and_parse() {
        let id = TxId::new();
        let parsed: TxId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn partition_is_year_month() {
        let id = TxId::new();
        let p = id.partition();
        assert_eq!(p.len(), 6);
        assert!(p.chars().all(|c| c.is_ascii_digit()));
    }
}
