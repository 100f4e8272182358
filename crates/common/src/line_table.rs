// Line identity table: the addressing primitive of the sync protocol.
//
// One opaque id per document line, in line order. Peers address edits by
// line identity so that concurrent line-count changes do not shift the
// target of an operation.

use crate::error::SyncError;
use crate::types::LineId;

/// Ordered sequence of line identities for one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineTable {
    ids: Vec<LineId>,
}

impl LineTable {
    pub fn from_ids(ids: Vec<LineId>) -> Self {
        Self { ids }
    }

    /// A table of `line_count` freshly minted ids.
    pub fn fresh(line_count: usize) -> Self {
        Self { ids: LineId::mint(line_count) }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[LineId] {
        &self.ids
    }

    pub fn into_ids(self) -> Vec<LineId> {
        self.ids
    }

    pub fn id_at(&self, line: usize) -> Option<&LineId> {
        self.ids.get(line)
    }

    /// Current line index of `id`.
    ///
    /// A diverged table may hold the same id twice; the last occurrence is
    /// the one that counts.
    pub fn resolve(&self, id: &LineId) -> Result<usize, SyncError> {
        self.ids
            .iter()
            .rposition(|candidate| candidate == id)
            .ok_or_else(|| SyncError::unknown_identity(id))
    }

    /// Resolve both ends of a range. A range whose end resolves before its
    /// start cannot belong to this table's history.
    pub fn resolve_range(&self, from: &LineId, to: &LineId) -> Result<(usize, usize), SyncError> {
        let from_line = self.resolve(from)?;
        let to_line = self.resolve(to)?;
        if to_line < from_line {
            return Err(SyncError::unknown_identity(to));
        }
        Ok((from_line, to_line))
    }

    /// Splice `ids` after `after_line`, keeping their order. An index past
    /// the end appends.
    pub fn insert(&mut self, after_line: usize, ids: &[LineId]) {
        let at = after_line.saturating_add(1).min(self.ids.len());
        self.ids.splice(at..at, ids.iter().cloned());
    }

    /// Delete `count` consecutive entries starting at `from_line`.
    pub fn remove(&mut self, from_line: usize, count: usize) {
        let start = from_line.min(self.ids.len());
        let end = from_line.saturating_add(count).min(self.ids.len());
        self.ids.drain(start..end);
    }

    /// Apply a text replacement spanning `from_line..=to_line` whose content
    /// introduced `new_ids.len()` line breaks.
    ///
    /// The first line keeps its identity, the lines after it up to `to_line`
    /// are merged away, and each new line break contributes one new id right
    /// after `from_line`. Afterwards `len()` equals the document's line count
    /// provided it did before.
    pub fn apply_replacement(&mut self, from_line: usize, to_line: usize, new_ids: &[LineId]) {
        self.remove(from_line + 1, to_line.saturating_sub(from_line));
        self.insert(from_line, new_ids);
    }

    /// Returns the first id that appears more than once, if any.
    pub fn first_duplicate(&self) -> Option<&LineId> {
        let mut seen = std::collections::HashSet::with_capacity(self.ids.len());
        self.ids.iter().find(|id| !seen.insert(*id))
    }
}
