// Local edit coalescer.
//
// Merges a contiguous run of keystrokes into one net edit. The window is
// armed by the first event of a run and does not slide: a run is flushed at
// most one window after it started, however fast the user keeps typing.
//
// Run coordinates (`start`, `end`) are positions in the document as it was
// before the run began, so the run can be resolved against a line table
// that has not seen any of it yet.

use std::time::{Duration, Instant};

use tandem_common::types::{newline_count, Position};

/// Default window for local keystrokes.
pub const DEFAULT_LOCAL_WINDOW_MS: u64 = 150;
/// Default window for incoming remote operations.
pub const DEFAULT_REMOTE_WINDOW_MS: u64 = 50;
/// Minimum allowed window.
const MIN_WINDOW_MS: u64 = 10;
/// Maximum allowed window.
const MAX_WINDOW_MS: u64 = 2_000;

/// Length of a buffering window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    pub window: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { window: Duration::from_millis(DEFAULT_LOCAL_WINDOW_MS) }
    }
}

impl WindowConfig {
    /// Create a config with the given window in milliseconds, clamped to [10, 2000].
    pub fn with_millis(ms: u64) -> Self {
        let clamped = ms.clamp(MIN_WINDOW_MS, MAX_WINDOW_MS);
        Self { window: Duration::from_millis(clamped) }
    }

    pub fn remote() -> Self {
        Self::with_millis(DEFAULT_REMOTE_WINDOW_MS)
    }
}

/// One editor change event: `start..end` (coordinates before the change)
/// was replaced by `text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub start: Position,
    pub end: Position,
    pub text: String,
}

impl TextChange {
    pub fn new(start: Position, end: Position, text: impl Into<String>) -> Self {
        Self { start, end, text: text.into() }
    }

    pub fn insert(at: Position, text: impl Into<String>) -> Self {
        Self::new(at, at, text)
    }

    pub fn delete(start: Position, end: Position) -> Self {
        Self::new(start, end, "")
    }

    fn is_noop(&self) -> bool {
        self.start == self.end && self.text.is_empty()
    }
}

/// The net edit of a flushed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescedEdit {
    pub path: String,
    pub start: Position,
    pub end: Position,
    pub content: String,
    /// Delete keystrokes that removed text present before the run.
    pub delete_count: u32,
}

impl CoalescedEdit {
    /// Lines this edit adds to the document (negative when it joins lines).
    pub fn line_delta(&self) -> isize {
        line_delta(self.start, self.end, &self.content)
    }
}

fn line_delta(start: Position, end: Position, content: &str) -> isize {
    newline_count(content) as isize - (end.line - start.line) as isize
}

#[derive(Debug)]
struct PendingEdit {
    path: String,
    start: Position,
    end: Position,
    content: String,
    delete_count: u32,
    armed_at: Instant,
}

impl PendingEdit {
    fn begin(path: &str, change: TextChange, now: Instant) -> Self {
        let deletes_existing = change.text.is_empty() && change.start != change.end;
        Self {
            path: path.to_string(),
            start: change.start,
            end: change.end,
            content: change.text,
            delete_count: u32::from(deletes_existing),
            armed_at: now,
        }
    }

    /// Where the next typed character lands, in current coordinates.
    fn insert_point(&self) -> Position {
        self.start.advance(&self.content)
    }

    /// Map a current-coordinate position at or after the insert point back
    /// to the coordinates before the run.
    fn to_original(&self, current: Position) -> Position {
        let ip = self.insert_point();
        if current.line == ip.line {
            Position::new(self.end.line, self.end.character + (current.character - ip.character))
        } else {
            Position::new(self.end.line + (current.line - ip.line), current.character)
        }
    }

    /// Byte index into the buffered content of the current-coordinate
    /// position `target`, if it lies within the content.
    fn content_offset(&self, target: Position) -> Option<usize> {
        let mut position = self.start;
        for (idx, ch) in self.content.char_indices() {
            if position == target {
                return Some(idx);
            }
            position = position.advance(ch.encode_utf8(&mut [0; 4]));
        }
        (position == target).then_some(self.content.len())
    }

    /// Try to fold `change` into this run. Returns the change back when it
    /// is not contiguous with the run.
    fn absorb(&mut self, change: TextChange) -> Result<(), TextChange> {
        let ip = self.insert_point();

        if change.start == ip {
            if change.end > ip {
                self.end = self.to_original(change.end);
                if change.text.is_empty() {
                    self.delete_count += 1;
                }
            }
            self.content.push_str(&change.text);
            return Ok(());
        }

        if change.text.is_empty() && change.end == ip && change.start < ip {
            if change.start >= self.start {
                if let Some(idx) = self.content_offset(change.start) {
                    self.content.truncate(idx);
                    return Ok(());
                }
            } else {
                self.content.clear();
                self.start = change.start;
                self.delete_count += 1;
                return Ok(());
            }
        }

        Err(change)
    }

    fn finish(self) -> Option<CoalescedEdit> {
        if self.start == self.end && self.content.is_empty() {
            return None;
        }
        Some(CoalescedEdit {
            path: self.path,
            start: self.start,
            end: self.end,
            content: self.content,
            delete_count: self.delete_count,
        })
    }
}

#[derive(Debug, Default)]
enum CoalescerState {
    #[default]
    Idle,
    Accumulating(PendingEdit),
}

/// Buffers local change events and emits one net edit per contiguous run.
///
/// Call `push_at()` for each change, then `drain_ready_at()` when
/// `next_deadline()` passes.
#[derive(Debug)]
pub struct EditCoalescer {
    config: WindowConfig,
    state: CoalescerState,
}

impl EditCoalescer {
    pub fn new(config: WindowConfig) -> Self {
        Self { config, state: CoalescerState::Idle }
    }

    /// Record a change to `path`. If it cannot join the current run, the
    /// current run is closed and returned, and a new run starts.
    pub fn push_at(&mut self, path: &str, change: TextChange, now: Instant) -> Option<CoalescedEdit> {
        let change = match &mut self.state {
            CoalescerState::Accumulating(pending) if pending.path == path => {
                match pending.absorb(change) {
                    Ok(()) => return None,
                    Err(change) => change,
                }
            }
            _ => change,
        };

        let flushed = self.flush();
        if !change.is_noop() {
            self.state = CoalescerState::Accumulating(PendingEdit::begin(path, change, now));
        }
        flushed
    }

    /// Close the current run if its window has elapsed.
    pub fn drain_ready_at(&mut self, now: Instant) -> Option<CoalescedEdit> {
        match &self.state {
            CoalescerState::Accumulating(pending)
                if now.duration_since(pending.armed_at) >= self.config.window =>
            {
                self.flush()
            }
            _ => None,
        }
    }

    /// Close the current run regardless of its window.
    pub fn flush(&mut self) -> Option<CoalescedEdit> {
        match std::mem::take(&mut self.state) {
            CoalescerState::Idle => None,
            CoalescerState::Accumulating(pending) => pending.finish(),
        }
    }

    pub fn is_accumulating(&self) -> bool {
        matches!(self.state, CoalescerState::Accumulating(_))
    }

    /// Path of the run in progress.
    /// Line delta of the run still buffered for `path`; zero when nothing
    /// is buffered for it. The editor already shows that run, the line
    /// table does not.
    pub fn pending_line_delta(&self, path: &str) -> isize {
        match &self.state {
            CoalescerState::Accumulating(pending) if pending.path == path => {
                line_delta(pending.start, pending.end, &pending.content)
            }
            _ => 0,
        }
    }

    pub fn pending_path(&self) -> Option<&str> {
        match &self.state {
            CoalescerState::Accumulating(pending) => Some(&pending.path),
            CoalescerState::Idle => None,
        }
    }

    /// When the current run's window closes, or None if idle.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.state {
            CoalescerState::Accumulating(pending) => Some(pending.armed_at + self.config.window),
            CoalescerState::Idle => None,
        }
    }
}
