//! Cursor - a comparable position in an upstream change feed.
//!
//! Sequence-numbered feeds use only `position`. Feeds that only expose a
//! modification timestamp use `position = millis` plus the package name as a
//! tie-break, so two packages modified in the same millisecond still have a
//! strict order.
//!
//! Text form: `"123"` or `"1700000000000:@scope/name"`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Cursor {
    position: u64,
    tiebreak: Option<String>,
}

impl Cursor {
    pub fn new(position: u64) -> Self {
        Self {
            position,
            tiebreak: None,
        }
    }

    pub fn with_tiebreak(position: u64, tiebreak: impl Into<String>) -> Self {
        Self {
            position,
            tiebreak: Some(tiebreak.into()),
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn tiebreak(&self) -> Option<&str> {
        self.tiebreak.as_deref()
    }
}

// No tie-break sorts before any tie-break at the same position: a bare
// timestamp means "nothing at this millisecond has been seen yet".
impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.position
            .cmp(&other.position)
            .then_with(|| self.tiebreak.cmp(&other.tiebreak))
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tiebreak {
            Some(tb) => write!(f, "{}:{}", self.position, tb),
            None => write!(f, "{}", self.position),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cursor {0:?}")]
pub struct InvalidCursor(pub String);

impl FromStr for Cursor {
    type Err = InvalidCursor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pos, tiebreak) = match s.split_once(':') {
            Some((pos, tb)) if !tb.is_empty() => (pos, Some(tb.to_string())),
            Some(_) => return Err(InvalidCursor(s.to_string())),
            None => (s, None),
        };
        let position = pos
            .trim()
            .parse::<u64>()
            .map_err(|_| InvalidCursor(s.to_string()))?;
        Ok(Self { position, tiebreak })
    }
}

impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
