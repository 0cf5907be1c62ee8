use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Month letters in expiry order. They also happen to be alphabetical.
pub const MONTH_CODES: [char; 12] = ['F', 'G', 'H', 'J', 'K', 'M', 'N', 'Q', 'U', 'V', 'X', 'Z'];

/// Globex-style futures contract identifier such as `ESH24`.
///
/// The derived ordering sorts by root first, so two contracts of the same
/// root compare by (year, month). Use [`GlobexCode::precedes`] when the
/// roots must match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobexCode {
    pub root: String,
    pub year: u16,
    pub month: char,
}

impl GlobexCode {
    pub fn parse(symbol: &str) -> Result<Self> {
        let bytes = symbol.as_bytes();
        // root (>= 2) + month letter + two year digits
        if bytes.len() < 5 || !symbol.is_ascii() {
            bail!("Unable to parse Globex code '{symbol}'");
        }
        let split = bytes.len() - 3;
        let (root, tail) = symbol.split_at(split);
        if !root
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
        {
            bail!("Unable to parse Globex code '{symbol}': invalid root '{root}'");
        }
        let mut chars = tail.chars();
        let month = chars
            .next()
            .ok_or_else(|| anyhow!("Unable to parse Globex code '{symbol}'"))?;
        if !MONTH_CODES.contains(&month) {
            bail!("Unable to parse Globex code '{symbol}': invalid month letter '{month}'");
        }
        let digits = chars.as_str();
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            bail!("Unable to parse Globex code '{symbol}': invalid year '{digits}'");
        }
        let short_year: u16 = digits
            .parse()
            .map_err(|err| anyhow!("Unable to parse Globex code '{symbol}': {err}"))?;
        let year = if short_year < 70 {
            2000 + short_year
        } else {
            1900 + short_year
        };
        Ok(Self {
            root: root.to_string(),
            year,
            month,
        })
    }

    /// Zero-based position of the month letter in the expiry calendar.
    pub fn month_index(&self) -> usize {
        MONTH_CODES
            .iter()
            .position(|&code| code == self.month)
            .unwrap_or(0)
    }

    /// Strict expiry ordering between two contracts of the same root.
    pub fn precedes(&self, other: &GlobexCode) -> Result<bool> {
        if self.root != other.root {
            bail!(
                "Tried to compare Globex codes with different roots ({self} vs. {other})"
            );
        }
        Ok((self.year, self.month_index()) < (other.year, other.month_index()))
    }
}

impl fmt::Display for GlobexCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:02}", self.root, self.month, self.year % 100)
    }
}

impl FromStr for GlobexCode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for GlobexCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GlobexCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        GlobexCode::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_root_month_and_century() {
        let code = GlobexCode::parse("ESH24").unwrap();
        assert_eq!(code.root, "ES");
        assert_eq!(code.month, 'H');
        assert_eq!(code.year, 2024);

        let legacy = GlobexCode::parse("6EZ98").unwrap();
        assert_eq!(legacy.root, "6E");
        assert_eq!(legacy.year, 1998);
        assert_eq!(legacy.to_string(), "6EZ98");
    }

    #[test]
    fn rejects_malformed_symbols() {
        for symbol in ["E H24", "EH24", "ESA24", "ESH2X", "esh24", "ESH245", ""] {
            assert!(GlobexCode::parse(symbol).is_err(), "{symbol} should fail");
        }
    }

    #[test]
    fn orders_by_year_then_month() {
        let h24 = GlobexCode::parse("ESH24").unwrap();
        let z23 = GlobexCode::parse("ESZ23").unwrap();
        let m24 = GlobexCode::parse("ESM24").unwrap();
        assert!(z23.precedes(&h24).unwrap());
        assert!(h24.precedes(&m24).unwrap());
        assert!(!m24.precedes(&m24).unwrap());
        assert!(z23 < h24);
    }

    #[test]
    fn refuses_cross_root_comparison() {
        let es = GlobexCode::parse("ESH24").unwrap();
        let nq = GlobexCode::parse("NQH24").unwrap();
        assert!(es.precedes(&nq).is_err());
    }
}
