//! Dotted index identifiers (`mission.instrument.indexname`).

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::prelude::*;

/// Error returned when a dotted key cannot be parsed.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(display(
    "invalid index key {input:?}: expected mission.instrument.indexname, got {segments} segment(s)"
))]
pub struct ParseIndexKeyError {
    /// The string that failed to parse.
    pub input: String,
    /// Number of segments found after stripping an optional `missions.` prefix.
    pub segments: usize,
}

/// Immutable identifier of one archive index.
///
/// Equality and hashing are by the `(mission, instrument, indexname)` triple.
/// The canonical string form is the dotted triple, which is also how the key
/// serializes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexKey {
    mission: String,
    instrument: String,
    indexname: String,
}

impl IndexKey {
    /// Build a key from its parts. Each part must be non-empty and dot-free.
    pub fn new(
        mission: impl Into<String>,
        instrument: impl Into<String>,
        indexname: impl Into<String>,
    ) -> Result<Self, ParseIndexKeyError> {
        let (mission, instrument, indexname) = (mission.into(), instrument.into(), indexname.into());
        let ok = [&mission, &instrument, &indexname]
            .iter()
            .all(|p| !p.is_empty() && !p.contains('.'));
        if !ok {
            let input = format!("{mission}.{instrument}.{indexname}");
            let segments = input.split('.').count();
            return Err(ParseIndexKeyError { input, segments });
        }
        Ok(Self {
            mission,
            instrument,
            indexname,
        })
    }

    /// Build a key from parts known to be valid (crate-internal constants).
    pub(crate) fn from_static(mission: &str, instrument: &str, indexname: &str) -> Self {
        Self {
            mission: mission.to_string(),
            instrument: instrument.to_string(),
            indexname: indexname.to_string(),
        }
    }

    /// Mission segment, e.g. `mro`.
    pub fn mission(&self) -> &str {
        &self.mission
    }

    /// Instrument segment, e.g. `ctx`.
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Index name segment, e.g. `edr`.
    pub fn indexname(&self) -> &str {
        &self.indexname
    }

    /// `mission.instrument`, the key dynamic listings are registered under.
    pub fn instrument_key(&self) -> String {
        format!("{}.{}", self.mission, self.instrument)
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.mission, self.instrument, self.indexname)
    }
}

impl FromStr for IndexKey {
    type Err = ParseIndexKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed.strip_prefix("missions.").unwrap_or(trimmed);
        let parts: Vec<&str> = body.split('.').collect();

        match parts.as_slice() {
            [m, i, n] if !m.is_empty() && !i.is_empty() && !n.is_empty() => {
                Ok(Self {
                    mission: (*m).to_string(),
                    instrument: (*i).to_string(),
                    indexname: (*n).to_string(),
                })
            }
            _ => Err(ParseIndexKeyError {
                input: s.to_string(),
                segments: parts.len(),
            }),
        }
    }
}

impl TryFrom<&str> for IndexKey {
    type Error = ParseIndexKeyError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl Serialize for IndexKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IndexKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn parses_dotted_triple() {
        let key: IndexKey = "mro.ctx.edr".parse().unwrap();
        assert_eq!(key.mission(), "mro");
        assert_eq!(key.instrument(), "ctx");
        assert_eq!(key.indexname(), "edr");
        assert_eq!(key.instrument_key(), "mro.ctx");
        assert_eq!(key.to_string(), "mro.ctx.edr");
    }

    #[test]
    fn strips_missions_prefix() {
        let key: IndexKey = "missions.cassini.iss.index".parse().unwrap();
        assert_eq!(key, IndexKey::new("cassini", "iss", "index").unwrap());
    }

    #[test]
    fn rejects_wrong_segment_counts() {
        let err = "mro.ctx".parse::<IndexKey>().unwrap_err();
        assert_eq!(err.segments, 2);
        assert!("mro.ctx.edr.extra".parse::<IndexKey>().is_err());
        assert!("mro..edr".parse::<IndexKey>().is_err());
        assert!("".parse::<IndexKey>().is_err());
    }

    #[test]
    fn new_rejects_dotted_parts() {
        assert!(IndexKey::new("mro", "ctx.x", "edr").is_err());
        assert!(IndexKey::new("", "ctx", "edr").is_err());
    }

    #[test]
    fn hash_and_eq_follow_the_triple() {
        let mut set = HashSet::new();
        set.insert("go.ssi.index".parse::<IndexKey>().unwrap());
        set.insert("missions.go.ssi.index".parse::<IndexKey>().unwrap());
        assert_eq!(set.len(), 1);
    }
}
