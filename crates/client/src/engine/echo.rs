// Self-echo filter.
//
// The relay broadcasts every textReplaced to the whole room, sender
// included. Outbound operations are remembered until their echo comes back
// so they are applied exactly once. In the other direction, edits this
// client applies on behalf of peers come back from the editor as change
// events; those are recognized here and must not be re-sent.

use std::collections::VecDeque;

use tandem_common::path::paths_match;
use tandem_common::protocol::ws::TextReplaced;
use tandem_common::types::Position;

use super::coalescer::TextChange;

/// Upper bound on remembered remote applies awaiting their editor event.
const APPLIED_HISTORY_LIMIT: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
struct AppliedEdit {
    path: String,
    start: Position,
    end: Position,
    content: String,
}

#[derive(Debug, Default)]
pub struct EchoFilter {
    outbound: Vec<TextReplaced>,
    applied: VecDeque<AppliedEdit>,
}

impl EchoFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember an operation at send time.
    pub fn record_outbound(&mut self, op: TextReplaced) {
        self.outbound.push(op);
    }

    /// Whether `op` is the echo of an operation this client sent. A match
    /// consumes the outbound entry.
    ///
    /// Besides exact matches, an operation from `local_user` whose content
    /// is contained in a pending outbound operation on the same path counts
    /// as an echo. Editors that save through a temp file report the nested
    /// write as a separate change.
    pub fn take_echo(&mut self, op: &TextReplaced, local_user: &str) -> bool {
        let exact = self.outbound.iter().position(|sent| {
            paths_match(&sent.path_name, &op.path_name)
                && sent.from == op.from
                && sent.to == op.to
                && sent.content == op.content
                && sent.new_line_ids == op.new_line_ids
        });

        let matched = exact.or_else(|| {
            if op.user_id != local_user || op.content.is_empty() {
                return None;
            }
            self.outbound.iter().position(|sent| {
                paths_match(&sent.path_name, &op.path_name) && sent.content.contains(&op.content)
            })
        });

        match matched {
            Some(idx) => {
                self.outbound.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Remember a replacement the remote-apply pipeline made to the local
    /// document.
    pub fn note_remote_applied(&mut self, path: &str, start: Position, end: Position, content: &str) {
        if self.applied.len() == APPLIED_HISTORY_LIMIT {
            self.applied.pop_front();
        }
        self.applied.push_back(AppliedEdit {
            path: path.to_string(),
            start,
            end,
            content: content.to_string(),
        });
    }

    /// Whether `change` is the editor's report of a remote apply. A match
    /// consumes the entry.
    ///
    /// A change that only carries part of an applied edit's content matches
    /// when it starts inside the region that edit wrote. Editors report
    /// remote applies before any further local change, so a change that
    /// matches nothing expires the remaining entries for its path.
    pub fn take_applied_change(&mut self, path: &str, change: &TextChange) -> bool {
        let exact = self.applied.iter().position(|applied| {
            paths_match(&applied.path, path)
                && applied.start == change.start
                && applied.end == change.end
                && applied.content == change.text
        });

        let matched = exact.or_else(|| {
            if change.text.is_empty() {
                return None;
            }
            self.applied.iter().position(|applied| {
                paths_match(&applied.path, path)
                    && applied.start <= change.start
                    && change.start <= applied.start.advance(&applied.content)
                    && applied.content.contains(&change.text)
            })
        });

        match matched {
            Some(idx) => self.applied.remove(idx).is_some(),
            None => {
                self.applied.retain(|applied| !paths_match(&applied.path, path));
                false
            }
        }
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Forget everything; used after a reconnect.
    pub fn clear(&mut self) {
        self.outbound.clear();
        self.applied.clear();
    }
}
