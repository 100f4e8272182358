// Core domain types shared across all Tandem crates.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, never-reused identity of a document line.
///
/// Freshly minted ids are UUID v4 strings; ids received over the wire are
/// kept verbatim so peers running other implementations interoperate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineId(String);

impl LineId {
    /// Mint a new random line identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Mint `count` fresh identities.
    pub fn mint(count: usize) -> Vec<LineId> {
        (0..count).map(|_| Self::new()).collect()
    }
}

impl Default for LineId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for LineId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for LineId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A position in local document coordinates.
///
/// `line` is zero-based; `character` counts Unicode scalar values within the
/// line, not bytes or UTF-16 units.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }

    /// The position reached after inserting `text` at `self`.
    pub fn advance(self, text: &str) -> Self {
        let mut line = self.line;
        let mut character = self.character;
        for ch in text.chars() {
            if ch == '\n' {
                line += 1;
                character = 0;
            } else {
                character += 1;
            }
        }
        Self { line, character }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.character)
    }
}

/// An identity-addressed position: a line identity plus a character offset
/// within that line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Anchor {
    pub line: LineId,
    pub character: u32,
}

impl Anchor {
    pub fn new(line: LineId, character: u32) -> Self {
        Self { line, character }
    }
}

/// Public identity of a room member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub user_id: String,
    pub user_name: String,
    pub user_display_name: String,
}

/// Number of lines in `text` (an empty text still has one line).
pub fn line_count(text: &str) -> usize {
    text.split('\n').count()
}

/// Number of line breaks in `text`; also the number of line identities a
/// replacement with this content creates.
pub fn newline_count(text: &str) -> usize {
    text.matches('\n').count()
}
