use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Suffix that routes a game id to its preview stream.
pub const PREVIEW_SUFFIX: &str = "_Preview";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameId(String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

/// Independent write stream of a game.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Content,
    Preview,
}

impl SnapshotKind {
    pub const ALL: [SnapshotKind; 2] = [SnapshotKind::Content, SnapshotKind::Preview];

    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotKind::Content => "content",
            SnapshotKind::Preview => "preview",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "content" => Some(SnapshotKind::Content),
            "preview" => Some(SnapshotKind::Preview),
            _ => None,
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl GameId {
    /// Parses a bare game id (`8-4-4-4-12` lowercase hex, no suffix).
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        if is_hyphenated_hex(raw, false) {
            Ok(Self(raw.to_owned()))
        } else {
            Err(RelayError::validation(format!("invalid game id `{raw}`")))
        }
    }

    /// Parses a path segment which may carry the `_Preview` suffix.
    pub fn parse_with_kind(raw: &str) -> Result<(Self, SnapshotKind), RelayError> {
        match raw.strip_suffix(PREVIEW_SUFFIX) {
            Some(base) => Ok((Self::parse(base)?, SnapshotKind::Preview)),
            None => Ok((Self::parse(raw)?, SnapshotKind::Content)),
        }
    }

    /// Wraps an id read back from storage without re-validating it.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PlayerId {
    /// Player ids are UUID-shaped; hex case is preserved as sent by the client.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        if is_hyphenated_hex(raw, true) {
            Ok(Self(raw.to_owned()))
        } else {
            Err(RelayError::validation(format!("invalid player id `{raw}`")))
        }
    }

    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];

fn is_hyphenated_hex(raw: &str, allow_upper: bool) -> bool {
    let mut parts = raw.split('-');
    for expected in GROUPS {
        let Some(part) = parts.next() else {
            return false;
        };
        if part.len() != expected {
            return false;
        }
        let valid = part.bytes().all(|b| {
            b.is_ascii_digit() || (b'a'..=b'f').contains(&b) || (allow_upper && (b'A'..=b'F').contains(&b))
        });
        if !valid {
            return false;
        }
    }
    parts.next().is_none()
}
