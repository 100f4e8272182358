// Remote apply pipeline: buffers incoming textReplaced operations and
// translates them from line identities into local positions.

use std::collections::VecDeque;
use std::time::Instant;

use tandem_common::error::SyncError;
use tandem_common::line_table::LineTable;
use tandem_common::path::paths_match;
use tandem_common::protocol::ws::TextReplaced;
use tandem_common::types::Position;

use super::coalescer::WindowConfig;
use super::document::TextDocument;

/// Re-queue attempts before an operation is dropped and the document resynced.
pub const DEFAULT_MAX_REQUEUE: u32 = 20;

/// A buffered remote operation and how often it failed to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedOp {
    pub op: TextReplaced,
    pub attempts: u32,
}

impl QueuedOp {
    pub fn new(op: TextReplaced) -> Self {
        Self { op, attempts: 0 }
    }
}

/// Outcome of handing a failed operation back to the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Requeue {
    Queued,
    /// The operation ran out of attempts.
    Dropped(QueuedOp),
}

/// The local effect of one applied remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedRemote {
    pub start: Position,
    pub end: Position,
    /// Where the origin peer's cursor ends up.
    pub cursor: Position,
}

/// Window-buffered queue of remote operations.
///
/// The window is armed by the first push into an empty queue; everything
/// buffered is released together when it expires.
#[derive(Debug)]
pub struct RemoteApplyQueue {
    config: WindowConfig,
    max_requeue: u32,
    pending: VecDeque<QueuedOp>,
    armed_at: Option<Instant>,
}

impl RemoteApplyQueue {
    pub fn new(config: WindowConfig, max_requeue: u32) -> Self {
        Self { config, max_requeue, pending: VecDeque::new(), armed_at: None }
    }

    pub fn push_at(&mut self, op: TextReplaced, now: Instant) {
        self.enqueue(QueuedOp::new(op), now);
    }

    /// Put back an operation that could not be applied yet.
    pub fn requeue_at(&mut self, mut queued: QueuedOp, now: Instant) -> Requeue {
        queued.attempts += 1;
        if queued.attempts > self.max_requeue {
            return Requeue::Dropped(queued);
        }
        self.enqueue(queued, now);
        Requeue::Queued
    }

    fn enqueue(&mut self, queued: QueuedOp, now: Instant) {
        if self.armed_at.is_none() {
            self.armed_at = Some(now);
        }
        self.pending.push_back(queued);
    }

    /// Release the buffered batch, in arrival order, once the window elapsed.
    pub fn drain_ready_at(&mut self, now: Instant) -> Vec<QueuedOp> {
        match self.armed_at {
            Some(armed) if now.duration_since(armed) >= self.config.window => self.drain_all(),
            _ => Vec::new(),
        }
    }

    /// Release the buffered batch regardless of the window.
    pub fn drain_all(&mut self) -> Vec<QueuedOp> {
        self.armed_at = None;
        self.pending.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed_at.map(|armed| armed + self.config.window)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.armed_at = None;
    }

    /// Drop buffered operations for a document that is no longer open.
    pub fn discard_path(&mut self, path: &str) {
        self.pending.retain(|queued| !paths_match(&queued.op.path_name, path));
        if self.pending.is_empty() {
            self.armed_at = None;
        }
    }
}

/// Apply one remote operation to `doc` and `table`.
///
/// Both are left untouched on error: an unknown identity fails before the
/// document is touched, and a rejected replacement fails before the table
/// is.
pub fn apply_remote<D: TextDocument>(
    doc: &mut D,
    table: &mut LineTable,
    op: &TextReplaced,
) -> Result<AppliedRemote, SyncError> {
    let (from_line, to_line) = table.resolve_range(&op.from.line, &op.to.line)?;
    let start = Position::new(line_index(from_line)?, op.from.character);
    let end = Position::new(line_index(to_line)?, op.to.character);

    doc.replace(start, end, &op.content)?;
    table.apply_replacement(from_line, to_line, &op.new_line_ids);

    Ok(AppliedRemote { start, end, cursor: start.advance(&op.content) })
}

fn line_index(line: usize) -> Result<u32, SyncError> {
    u32::try_from(line).map_err(|_| SyncError::apply_rejected(format!("line {line} out of range")))
}
