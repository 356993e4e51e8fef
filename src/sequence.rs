//! Stream sequence numbers.
//!
//! Shard sequence numbers are decimal strings of varying length that exceed
//! any fixed-width integer, so they are parsed into [`BigUint`] and compared
//! numerically. The ledger stores them as strings; all range logic lives here.

use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::prelude::*;
use std::fmt;
use std::str::FromStr;

/// Error returned when a value is not a non-negative decimal integer.
#[derive(Debug, Snafu)]
#[snafu(display("Invalid sequence number {value:?}"))]
pub struct SequenceParseError {
    value: String,
}

/// A per-shard position marker, compared as an arbitrary-precision integer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(BigUint);

impl SequenceNumber {
    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }
}

impl FromStr for SequenceNumber {
    type Err = SequenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        ensure!(
            !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()),
            SequenceParseSnafu { value: s }
        );
        BigUint::parse_bytes(trimmed.as_bytes(), 10)
            .map(SequenceNumber)
            .context(SequenceParseSnafu { value: s })
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        SequenceNumber(BigUint::from(value))
    }
}

impl From<BigUint> for SequenceNumber {
    fn from(value: BigUint) -> Self {
        SequenceNumber(value)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for SequenceNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SequenceNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Inclusive range of sequence numbers covered by one load of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub start: SequenceNumber,
    pub end: SequenceNumber,
}

impl SequenceRange {
    pub fn new(start: SequenceNumber, end: SequenceNumber) -> Self {
        Self { start, end }
    }

    /// Whether this candidate range collides with an already committed one.
    ///
    /// With the committed range `[a, b]` and this range `[c, d]`, a collision
    /// is `a < c < b`, `a < d < b`, or `c <= a && b <= d`. Touching endpoints
    /// (`c == b`) are allowed so that back-to-back loads chain.
    pub fn overlaps(&self, committed: &SequenceRange) -> bool {
        let (a, b) = (&committed.start, &committed.end);
        let (c, d) = (&self.start, &self.end);

        (a < c && c < b) || (a < d && d < b) || (c <= a && b <= d)
    }
}

impl fmt::Display for SequenceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(s: &str) -> SequenceNumber {
        s.parse().unwrap()
    }

    fn range(a: &str, b: &str) -> SequenceRange {
        SequenceRange::new(seq(a), seq(b))
    }

    #[test]
    fn test_compares_numerically_not_lexically() {
        assert!(seq("9") < seq("10"));
        assert!(seq("49590338271490256608559692538361571095921575989136588898") > seq("9"));
    }

    #[test]
    fn test_values_beyond_u128() {
        let big = "340282366920938463463374607431768211456000";
        let parsed = seq(big);
        assert_eq!(parsed.to_string(), big);
        assert!(parsed > SequenceNumber::from(u64::MAX));
    }

    #[test]
    fn test_rejects_non_decimal() {
        assert!("".parse::<SequenceNumber>().is_err());
        assert!("12a".parse::<SequenceNumber>().is_err());
        assert!("-5".parse::<SequenceNumber>().is_err());
        assert!("1.5".parse::<SequenceNumber>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let value = seq("49590338271490256608559692538361571095921575989136588898");
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(
            json,
            "\"49590338271490256608559692538361571095921575989136588898\""
        );
        let back: SequenceNumber = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_overlap_exact_match() {
        assert!(range("1000", "1150").overlaps(&range("1000", "1150")));
    }

    #[test]
    fn test_overlap_nested() {
        assert!(range("1010", "1100").overlaps(&range("1000", "1150")));
    }

    #[test]
    fn test_overlap_covering() {
        assert!(range("900", "1200").overlaps(&range("1000", "1150")));
    }

    #[test]
    fn test_overlap_partial_front_and_back() {
        assert!(range("900", "1050").overlaps(&range("1000", "1150")));
        assert!(range("1100", "1300").overlaps(&range("1000", "1150")));
    }

    #[test]
    fn test_touching_ranges_do_not_overlap() {
        assert!(!range("1150", "1300").overlaps(&range("1000", "1150")));
        assert!(!range("1151", "1300").overlaps(&range("1000", "1150")));
    }

    #[test]
    fn test_single_point_ranges() {
        assert!(range("5", "5").overlaps(&range("5", "5")));
        assert!(!range("6", "6").overlaps(&range("5", "5")));
    }
}
