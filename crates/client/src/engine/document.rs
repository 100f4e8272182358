// Editor buffer abstraction.

use tandem_common::error::SyncError;
use tandem_common::types::Position;

/// The text buffer an editor exposes to the sync engine.
///
/// Positions are zero-based lines and char offsets within a line. A
/// document always has at least one line.
pub trait TextDocument {
    fn line_count(&self) -> usize;

    /// Full document text, lines joined with `\n`.
    fn text(&self) -> String;

    /// Replace the text between `start` and `end` with `text`.
    ///
    /// Fails with `SyncError::ApplyRejected` when the range no longer fits
    /// the document.
    fn replace(&mut self, start: Position, end: Position, text: &str) -> Result<(), SyncError>;
}

/// In-memory line buffer used by the headless peer and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDocument {
    lines: Vec<String>,
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self { lines: vec![String::new()] }
    }
}

impl MemoryDocument {
    pub fn from_text(text: &str) -> Self {
        Self { lines: text.split('\n').map(str::to_string).collect() }
    }

    pub fn line(&self, line: usize) -> Option<&str> {
        self.lines.get(line).map(String::as_str)
    }

    fn byte_offset(&self, position: Position) -> Result<usize, SyncError> {
        let line = self.lines.get(position.line as usize).ok_or_else(|| {
            SyncError::apply_rejected(format!(
                "line {} out of range ({} lines)",
                position.line,
                self.lines.len()
            ))
        })?;
        let target = position.character as usize;
        if target == line.chars().count() {
            return Ok(line.len());
        }
        line.char_indices().nth(target).map(|(idx, _)| idx).ok_or_else(|| {
            SyncError::apply_rejected(format!("character {position} out of range"))
        })
    }
}

impl TextDocument for MemoryDocument {
    fn line_count(&self) -> usize {
        self.lines.len()
    }

    fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn replace(&mut self, start: Position, end: Position, text: &str) -> Result<(), SyncError> {
        if end < start {
            return Err(SyncError::apply_rejected(format!("range {start}..{end} is inverted")));
        }
        let start_byte = self.byte_offset(start)?;
        let end_byte = self.byte_offset(end)?;
        let first = start.line as usize;
        let last = end.line as usize;

        let merged =
            format!("{}{}{}", &self.lines[first][..start_byte], text, &self.lines[last][end_byte..]);
        let replacement: Vec<String> = merged.split('\n').map(str::to_string).collect();
        self.lines.splice(first..=last, replacement);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(line: u32, character: u32) -> Position {
        Position::new(line, character)
    }

    #[test]
    fn empty_document_has_one_line() {
        assert_eq!(MemoryDocument::default().line_count(), 1);
        assert_eq!(MemoryDocument::from_text("").line_count(), 1);
        assert_eq!(MemoryDocument::from_text("a\nb\n").line_count(), 3);
    }

    #[test]
    fn inserts_within_a_line() {
        let mut doc = MemoryDocument::from_text("hello world");
        doc.replace(pos(0, 5), pos(0, 5), ",").unwrap();
        assert_eq!(doc.text(), "hello, world");
    }

    #[test]
    fn inserting_a_newline_splits_the_line() {
        let mut doc = MemoryDocument::from_text("one\ntwo\nthree");
        doc.replace(pos(1, 3), pos(1, 3), "\n").unwrap();
        assert_eq!(doc.text(), "one\ntwo\n\nthree");
        assert_eq!(doc.line_count(), 4);
    }

    #[test]
    fn deleting_across_lines_joins_them() {
        let mut doc = MemoryDocument::from_text("one\ntwo\nthree");
        doc.replace(pos(0, 3), pos(2, 5), "").unwrap();
        assert_eq!(doc.text(), "one");
    }

    #[test]
    fn offsets_count_chars_not_bytes() {
        let mut doc = MemoryDocument::from_text("héllo");
        doc.replace(pos(0, 2), pos(0, 4), "LL").unwrap();
        assert_eq!(doc.text(), "héLLo");
    }

    #[test]
    fn out_of_range_positions_are_rejected() {
        let mut doc = MemoryDocument::from_text("abc");
        let error = doc.replace(pos(3, 0), pos(3, 0), "x").unwrap_err();
        assert_eq!(error.code(), "SYNC_APPLY_REJECTED");
        assert!(doc.replace(pos(0, 4), pos(0, 4), "x").is_err());
        assert!(doc.replace(pos(0, 2), pos(0, 1), "x").is_err());
        assert_eq!(doc.text(), "abc");
    }
}
