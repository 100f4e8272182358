// Sync session: the single-threaded state machine tying the coalescer,
// echo filter, remote-apply queue and presence together for one project.
//
// The session never does I/O. Frames go in through `handle_envelope`,
// editor activity through the `on_*` methods, and time through `poll`.
// Outbound envelopes and UI events accumulate until taken.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde::Serialize;
use tandem_common::error::SyncError;
use tandem_common::line_table::LineTable;
use tandem_common::path::document_key;
use tandem_common::protocol::ws::{
    ChatMsg, CursorMoved, Envelope, FileRequest, GetCursors, IdArray, Operation, SendFile,
    TextReplaced, UserJoined, UserLeft,
};
use tandem_common::types::{newline_count, Anchor, LineId, PeerInfo};
use tracing::{debug, info, warn};

use super::coalescer::{CoalescedEdit, EditCoalescer, TextChange, WindowConfig};
use super::document::TextDocument;
use super::echo::EchoFilter;
use super::presence::{
    DisplayMode, LocalPresence, MarkerUpdate, PeerMarker, PeerRegistry, PresenceBroadcaster,
    Selection,
};
use super::remote_apply::{apply_remote, QueuedOp, RemoteApplyQueue, Requeue, DEFAULT_MAX_REQUEUE};

/// Who this client is and which room it joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
    pub user_display_name: String,
    pub project: String,
}

impl Identity {
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            user_display_name: self.user_display_name.clone(),
        }
    }

    pub fn label(&self, mode: DisplayMode) -> &str {
        match mode {
            DisplayMode::Name => &self.user_name,
            DisplayMode::DisplayName => &self.user_display_name,
            DisplayMode::Id => &self.user_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub local_window: WindowConfig,
    pub remote_window: WindowConfig,
    pub max_requeue: u32,
    pub display_mode: DisplayMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_window: WindowConfig::default(),
            remote_window: WindowConfig::remote(),
            max_requeue: DEFAULT_MAX_REQUEUE,
            display_mode: DisplayMode::default(),
        }
    }
}

/// Things a front end may want to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    PeerJoined { user_id: String, label: String },
    PeerLeft { user_id: String, label: String },
    PeersListed { peers: Vec<PeerInfo> },
    MarkerShown { user_id: String, label: String, marker: PeerMarker },
    MarkerCleared { user_id: String },
    Chat { user_id: String, label: String, msg: String, time: Option<i64> },
    RemoteApplied { path: String, count: usize },
    TableReplaced { path: String, lines: usize },
    ResyncRequested { path: String, reason: String },
    OperationDropped { path: String, reason: String },
}

#[derive(Debug)]
struct OpenDocument<D> {
    doc: D,
    table: Option<LineTable>,
    /// Edits flushed before the table arrived, oldest first.
    deferred: Vec<CoalescedEdit>,
    /// A sendFile went out and its idArray has not come back.
    requested: bool,
    /// Own edits sent after the last sendFile that have not echoed back.
    /// The relay answers that sendFile before it sees them.
    in_flight: Vec<TextReplaced>,
}

/// Net change in line count caused by an edit.
pub struct SyncSession<D: TextDocument> {
    identity: Identity,
    config: SessionConfig,
    documents: HashMap<String, OpenDocument<D>>,
    active: Option<String>,
    connected: bool,
    coalescer: EditCoalescer,
    echo: EchoFilter,
    remote: RemoteApplyQueue,
    presence: PresenceBroadcaster,
    peers: PeerRegistry,
    applying_remote: bool,
    outbound: Vec<Envelope>,
    events: Vec<SessionEvent>,
}

impl<D: TextDocument> SyncSession<D> {
    pub fn new(identity: Identity, config: SessionConfig) -> Self {
        Self {
            peers: PeerRegistry::new(identity.user_id.clone()),
            coalescer: EditCoalescer::new(config.local_window),
            remote: RemoteApplyQueue::new(config.remote_window, config.max_requeue),
            identity,
            config,
            documents: HashMap::new(),
            active: None,
            connected: false,
            echo: EchoFilter::new(),
            presence: PresenceBroadcaster::new(),
            applying_remote: false,
            outbound: Vec::new(),
            events: Vec::new(),
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// The relay connection is up: announce ourselves and every open
    /// document.
    pub fn on_connected(&mut self) {
        self.connected = true;
        self.echo.clear();
        self.queue(Operation::UserJoined(UserJoined {
            user_id: self.identity.user_id.clone(),
            user_name: self.identity.user_name.clone(),
            user_display_name: self.identity.user_display_name.clone(),
            project: self.identity.project.clone(),
        }));

        let mut paths: Vec<String> = self.documents.keys().cloned().collect();
        paths.sort();
        for path in paths {
            self.send_file(&path);
        }
    }

    /// The relay connection dropped. Peers are forgotten until the next
    /// `activeUsers`.
    pub fn on_disconnected(&mut self) {
        self.connected = false;
        self.peers = PeerRegistry::new(self.identity.user_id.clone());
    }

    /// Flush local edits and say goodbye.
    pub fn leave(&mut self) {
        if let Some(edit) = self.coalescer.flush() {
            self.commit(edit);
        }
        self.queue(Operation::UserLeft(UserLeft {
            user_id: self.identity.user_id.clone(),
            project: self.identity.project.clone(),
        }));
        self.connected = false;
    }

    // ── Documents ──────────────────────────────────────────────────

    /// Start syncing `doc`. The first opened document becomes active.
    pub fn open_document(&mut self, path: &str, doc: D) {
        let key = document_key(path);
        self.documents.insert(
            key.clone(),
            OpenDocument {
                doc,
                table: None,
                deferred: Vec::new(),
                requested: false,
                in_flight: Vec::new(),
            },
        );
        if self.active.is_none() {
            self.active = Some(key.clone());
        }
        if self.connected {
            self.send_file(&key);
        }
    }

    /// Stop syncing a document and hand it back.
    pub fn close_document(&mut self, path: &str) -> Option<D> {
        let key = document_key(path);
        if self.coalescer.pending_path() == Some(key.as_str()) {
            if let Some(edit) = self.coalescer.flush() {
                self.commit(edit);
            }
        }
        self.remote.discard_path(&key);
        if self.active.as_deref() == Some(key.as_str()) {
            self.active = None;
        }
        self.documents.remove(&key).map(|open| open.doc)
    }

    /// The user switched to another document.
    pub fn set_active(&mut self, path: &str) {
        let key = document_key(path);
        if self.active.as_deref() == Some(key.as_str()) {
            return;
        }
        self.active = Some(key.clone());

        for (user_id, update) in self.peers.refresh_markers(Some(&key)) {
            self.emit_marker(&user_id, update);
        }

        if let Some(presence) = self.presence.current().filter(|p| p.path == key).cloned() {
            self.send_cursor(&presence);
        }
        self.queue(Operation::GetCursors(GetCursors {
            user_id: self.identity.user_id.clone(),
            project: self.identity.project.clone(),
        }));

        let needs_table = self.documents.get(&key).is_some_and(|open| open.table.is_none());
        if needs_table && self.connected {
            self.send_file(&key);
        }
    }

    // ── Local activity ─────────────────────────────────────────────

    /// The editor reports a change it already made to its buffer.
    ///
    /// Changes that are the editor's report of a remote apply are dropped.
    pub fn on_local_change(&mut self, path: &str, change: TextChange, now: Instant) {
        let key = document_key(path);
        if self.echo.take_applied_change(&key, &change) {
            debug!(path = %key, "ignoring change caused by remote apply");
            return;
        }
        self.record_change(key, change, now);
    }

    /// Make a local edit to a document the session owns, then sync it.
    pub fn apply_local_edit(
        &mut self,
        path: &str,
        change: TextChange,
        now: Instant,
    ) -> Result<(), SyncError> {
        let key = document_key(path);
        let open = self
            .documents
            .get_mut(&key)
            .ok_or_else(|| SyncError::apply_rejected(format!("document {key} is not open")))?;
        open.doc.replace(change.start, change.end, &change.text)?;
        self.record_change(key, change, now);
        Ok(())
    }

    fn record_change(&mut self, key: String, change: TextChange, now: Instant) {
        if !self.documents.contains_key(&key) {
            debug!(path = %key, "ignoring change to a document that is not open");
            return;
        }
        if let Some(edit) = self.coalescer.push_at(&key, change, now) {
            self.commit(edit);
        }
    }

    /// The local selection moved. Broadcast unless edits are in flight, in
    /// which case the latest selection goes out once the engine is idle.
    pub fn on_local_selection(&mut self, path: &str, selection: Selection) {
        let key = document_key(path);
        let suppressed = self.is_busy();
        if let Some(presence) = self.presence.on_local_selection(&key, selection, suppressed) {
            self.send_cursor(&presence);
        }
    }

    pub fn send_chat(&mut self, msg: &str) {
        self.queue(Operation::ChatMsg(ChatMsg {
            msg: msg.to_string(),
            user_id: self.identity.user_id.clone(),
            time: None,
            project: self.identity.project.clone(),
        }));
    }

    // ── Inbound ────────────────────────────────────────────────────

    pub fn handle_envelope(&mut self, envelope: Envelope, now: Instant) {
        let Envelope { operation, time } = envelope;
        if let Some(project) = operation.project() {
            if project != self.identity.project {
                debug!(project, operation = operation.tag(), "ignoring operation for another project");
                return;
            }
        }

        match operation {
            Operation::UserJoined(data) => {
                let info = data.peer_info();
                if self.peers.join(info) {
                    let label = self.peer_label(&data.user_id);
                    info!(user_id = %data.user_id, "peer joined");
                    self.events.push(SessionEvent::PeerJoined { user_id: data.user_id, label });
                }
            }
            Operation::UserLeft(data) => {
                if let Some(peer) = self.peers.leave(&data.user_id) {
                    if peer.marker.is_some() {
                        self.events.push(SessionEvent::MarkerCleared { user_id: data.user_id.clone() });
                    }
                    let label = peer.label(self.config.display_mode).to_string();
                    info!(user_id = %data.user_id, "peer left");
                    self.events.push(SessionEvent::PeerLeft { user_id: data.user_id, label });
                }
            }
            Operation::ActiveUsers(peers) => {
                self.peers.replace_all(peers.clone());
                self.events.push(SessionEvent::PeersListed { peers });
            }
            Operation::CursorMoved(data) => {
                if data.user_id == self.identity.user_id {
                    return;
                }
                let update = self.peers.move_cursor(
                    &data.user_id,
                    &document_key(&data.path_name),
                    data.cursor,
                    data.selection_end,
                    self.active.as_deref(),
                );
                self.emit_marker(&data.user_id, update);
            }
            Operation::TextReplaced(op) => self.receive_remote(op, now),
            Operation::SendFile(data) => {
                debug!(path = %data.path_name, user_id = %data.user_id, "ignoring peer file announcement");
            }
            Operation::FileRequest(request) => self.answer_file_request(request),
            Operation::IdArray(data) => self.install_table(data),
            Operation::ChatMsg(data) => {
                let label = if data.user_id == self.identity.user_id {
                    self.identity.label(self.config.display_mode).to_string()
                } else {
                    self.peer_label(&data.user_id)
                };
                self.events.push(SessionEvent::Chat {
                    user_id: data.user_id,
                    label,
                    msg: data.msg,
                    time: data.time.or(time),
                });
            }
            Operation::GetCursors(data) => {
                if data.user_id == self.identity.user_id {
                    return;
                }
                if let Some(presence) = self.presence.current().cloned() {
                    self.send_cursor(&presence);
                }
            }
        }
    }

    fn receive_remote(&mut self, op: TextReplaced, now: Instant) {
        if self.echo.take_echo(&op, &self.identity.user_id) {
            debug!(path = %op.path_name, "echo of own edit");
            if let Some(open) = self.documents.get_mut(&document_key(&op.path_name)) {
                if let Some(idx) = open.in_flight.iter().position(|sent| *sent == op) {
                    open.in_flight.remove(idx);
                }
            }
            return;
        }
        if op.user_id == self.identity.user_id {
            debug!(path = %op.path_name, "ignoring unmatched own edit");
            return;
        }
        if !self.documents.contains_key(&document_key(&op.path_name)) {
            debug!(path = %op.path_name, "ignoring edit to a document that is not open");
            return;
        }
        self.remote.push_at(op, now);
    }

    fn answer_file_request(&mut self, request: FileRequest) {
        let key = request.path_name.as_deref().map(document_key).or_else(|| self.active.clone());
        match key {
            Some(key) if self.documents.contains_key(&key) => self.send_file(&key),
            Some(key) => debug!(path = %key, "file requested for a document that is not open"),
            None => debug!("file requested with no active document"),
        }
    }

    fn install_table(&mut self, data: IdArray) {
        let key = document_key(&data.path_name);
        let buffered = self.coalescer.pending_line_delta(&key);
        let Some(open) = self.documents.get_mut(&key) else {
            debug!(path = %key, "ignoring line table for a document that is not open");
            return;
        };

        let mut table = LineTable::from_ids(data.id_array);
        for op in &open.in_flight {
            if let Err(e) = replay_own_edit(&mut table, op) {
                warn!(path = %key, code = e.code(), error = %e, "cannot replay unacknowledged edit");
            }
        }
        let lines = table.len();
        let deferred = std::mem::take(&mut open.deferred);
        let line_count = open.doc.line_count() as isize;
        let expected = line_count
            - buffered
            - deferred.iter().map(CoalescedEdit::line_delta).sum::<isize>();
        open.requested = false;
        open.table = Some(table);

        self.events.push(SessionEvent::TableReplaced { path: key.clone(), lines });

        if lines as isize != expected {
            warn!(path = %key, lines, expected, "line table does not match document");
            for _ in &deferred {
                self.events.push(SessionEvent::OperationDropped {
                    path: key.clone(),
                    reason: "line table does not match document".into(),
                });
            }
            return;
        }

        let last = deferred.len().saturating_sub(1);
        for (idx, edit) in deferred.into_iter().enumerate() {
            self.commit_edit(edit, idx == last);
        }
    }

    // ── Timers ─────────────────────────────────────────────────────

    /// Fire whatever timers have expired at `now`.
    pub fn poll(&mut self, now: Instant) {
        if let Some(edit) = self.coalescer.drain_ready_at(now) {
            self.commit(edit);
        }

        let batch = self.remote.drain_ready_at(now);
        if !batch.is_empty() {
            self.apply_batch(batch, now);
        }

        if !self.is_busy() {
            if let Some(presence) = self.presence.take_deferred() {
                self.send_cursor(&presence);
            }
        }
    }

    /// The earliest instant at which `poll` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.coalescer.next_deadline(), self.remote.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ── Outbound edits ─────────────────────────────────────────────

    fn commit(&mut self, edit: CoalescedEdit) {
        self.commit_edit(edit, true);
    }

    /// Address a flushed run by line identity and send it. `verify` checks
    /// the table against the document afterwards; it is off for all but the
    /// last of a series of parked edits, whose effects are already in the
    /// document. A run still in the coalescer is in the document but not in
    /// the table, so its line delta is discounted.
    fn commit_edit(&mut self, edit: CoalescedEdit, verify: bool) {
        let buffered = self.coalescer.pending_line_delta(&edit.path);
        let Some(open) = self.documents.get_mut(&edit.path) else {
            debug!(path = %edit.path, "dropping edit to a document that is not open");
            return;
        };

        let Some(table) = open.table.as_mut() else {
            debug!(path = %edit.path, "no line table yet, parking edit");
            let request = !open.requested;
            let path = edit.path.clone();
            open.deferred.push(edit);
            if request && self.connected {
                self.send_file(&path);
            }
            return;
        };

        let result = address_edit(table, &edit, &self.identity);
        let in_step = table.len() as isize == open.doc.line_count() as isize - buffered;
        if let Ok(op) = &result {
            open.in_flight.push(op.clone());
        }
        match result {
            Ok(op) => {
                self.echo.record_outbound(op.clone());
                self.queue(Operation::TextReplaced(op));
                if verify && !in_step {
                    warn!(path = %edit.path, "line table out of step after local edit");
                    self.request_resync(&edit.path, "line table out of step after local edit");
                }
            }
            Err(e) => {
                warn!(path = %edit.path, code = e.code(), error = %e, "cannot address local edit");
                self.request_resync(&edit.path, &e.to_string());
            }
        }
    }

    // ── Remote apply ───────────────────────────────────────────────

    fn apply_batch(&mut self, batch: Vec<QueuedOp>, now: Instant) {
        // The table must reflect every local edit before remote positions
        // are resolved against it.
        if let Some(edit) = self.coalescer.flush() {
            self.commit(edit);
        }

        self.applying_remote = true;
        let mut applied: BTreeMap<String, usize> = BTreeMap::new();
        let mut pending = batch;
        loop {
            let mut failed = Vec::new();
            let mut progressed = false;
            for queued in pending {
                match self.apply_one(&queued.op) {
                    Ok(Some(path)) => {
                        progressed = true;
                        *applied.entry(path).or_default() += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(
                            path = %queued.op.path_name,
                            code = e.code(),
                            error = %e,
                            attempts = queued.attempts,
                            "remote operation not applicable yet"
                        );
                        failed.push(queued);
                    }
                }
            }
            pending = failed;
            if pending.is_empty() || !progressed {
                break;
            }
        }

        for queued in pending {
            if let Requeue::Dropped(dropped) = self.remote.requeue_at(queued, now) {
                let key = document_key(&dropped.op.path_name);
                warn!(path = %key, attempts = dropped.attempts, "dropping remote operation");
                self.events.push(SessionEvent::OperationDropped {
                    path: key.clone(),
                    reason: format!("not applicable after {} attempts", dropped.attempts),
                });
                self.request_resync(&key, "remote operation dropped");
            }
        }
        self.applying_remote = false;

        for (path, count) in applied {
            self.events.push(SessionEvent::RemoteApplied { path, count });
        }
    }

    /// Returns the document key on success, None when the document is no
    /// longer open.
    fn apply_one(&mut self, op: &TextReplaced) -> Result<Option<String>, SyncError> {
        let key = document_key(&op.path_name);
        let Some(open) = self.documents.get_mut(&key) else {
            return Ok(None);
        };
        let table = open
            .table
            .as_mut()
            .ok_or_else(|| SyncError::apply_rejected("no line table for document yet"))?;

        let applied = apply_remote(&mut open.doc, table, op)?;
        let in_step = table.len() == open.doc.line_count();
        self.echo.note_remote_applied(&key, applied.start, applied.end, &op.content);

        let update = self.peers.move_cursor(
            &op.user_id,
            &key,
            applied.cursor,
            applied.cursor,
            self.active.as_deref(),
        );
        self.emit_marker(&op.user_id, update);

        if !in_step {
            warn!(path = %key, "line table out of step after remote apply");
            self.request_resync(&key, "line table out of step after remote apply");
        }
        Ok(Some(key))
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn is_busy(&self) -> bool {
        self.coalescer.is_accumulating() || self.applying_remote || self.remote.pending_count() > 0
    }

    fn queue(&mut self, operation: Operation) {
        self.outbound.push(Envelope::new(operation));
    }

    fn send_file(&mut self, key: &str) {
        let Some(open) = self.documents.get_mut(key) else {
            return;
        };
        open.requested = true;
        open.in_flight.clear();
        let line_count = open.doc.line_count();
        self.queue(Operation::SendFile(SendFile {
            path_name: key.to_string(),
            line_count: Some(line_count),
            content: None,
            user_id: self.identity.user_id.clone(),
            project: self.identity.project.clone(),
        }));
    }

    fn send_cursor(&mut self, presence: &LocalPresence) {
        self.queue(Operation::CursorMoved(CursorMoved {
            path_name: presence.path.clone(),
            cursor: presence.selection.caret(),
            selection_end: presence.selection.selection_end(),
            user_id: self.identity.user_id.clone(),
            project: self.identity.project.clone(),
        }));
    }

    fn request_resync(&mut self, key: &str, reason: &str) {
        if !self.connected {
            return;
        }
        info!(path = %key, reason, "requesting resync");
        self.events.push(SessionEvent::ResyncRequested { path: key.to_string(), reason: reason.to_string() });
        self.send_file(key);
    }

    fn peer_label(&self, user_id: &str) -> String {
        self.peers
            .get(user_id)
            .map_or(user_id, |peer| peer.label(self.config.display_mode))
            .to_string()
    }

    fn emit_marker(&mut self, user_id: &str, update: MarkerUpdate) {
        match update {
            MarkerUpdate::Shown(marker) => {
                let label = self.peer_label(user_id);
                self.events.push(SessionEvent::MarkerShown { user_id: user_id.to_string(), label, marker });
            }
            MarkerUpdate::Cleared => {
                self.events.push(SessionEvent::MarkerCleared { user_id: user_id.to_string() });
            }
            MarkerUpdate::Unchanged => {}
        }
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn take_outbound(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbound)
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn active_path(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn document(&self, path: &str) -> Option<&D> {
        self.documents.get(&document_key(path)).map(|open| &open.doc)
    }

    pub fn table(&self, path: &str) -> Option<&LineTable> {
        self.documents.get(&document_key(path)).and_then(|open| open.table.as_ref())
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn pending_remote(&self) -> usize {
        self.remote.pending_count()
    }

    pub fn pending_echoes(&self) -> usize {
        self.echo.pending_outbound()
    }
}

/// Translate a run into an identity-addressed operation and apply it to
/// the local table.
fn address_edit(
    table: &mut LineTable,
    edit: &CoalescedEdit,
    identity: &Identity,
) -> Result<TextReplaced, SyncError> {
    let from_line = edit.start.line as usize;
    let to_line = edit.end.line as usize;
    let identity_at = |line: usize| {
        table.id_at(line).cloned().ok_or_else(|| {
            SyncError::apply_rejected(format!("line {line} has no identity ({} known)", table.len()))
        })
    };
    let from = identity_at(from_line)?;
    let to = identity_at(to_line)?;

    let new_line_ids = LineId::mint(newline_count(&edit.content));
    table.apply_replacement(from_line, to_line, &new_line_ids);

    Ok(TextReplaced {
        path_name: edit.path.clone(),
        from: Anchor::new(from, edit.start.character),
        to: Anchor::new(to, edit.end.character),
        content: edit.content.clone(),
        new_line_ids,
        user_id: identity.user_id.clone(),
        project: identity.project.clone(),
    })
}

/// Re-apply an own edit the relay has not seen to a table it sent.
fn replay_own_edit(table: &mut LineTable, op: &TextReplaced) -> Result<(), SyncError> {
    let (from_line, to_line) = table.resolve_range(&op.from.line, &op.to.line)?;
    table.apply_replacement(from_line, to_line, &op.new_line_ids);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tandem_common::types::Position;

    use super::*;
    use crate::engine::document::MemoryDocument;

    const PATH: &str = "a.txt";

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn pos(line: u32, character: u32) -> Position {
        Position::new(line, character)
    }

    fn identity(user: &str) -> Identity {
        Identity {
            user_id: user.into(),
            user_name: format!("{user}-name"),
            user_display_name: format!("{user}-display"),
            project: "P1".into(),
        }
    }

    fn id_array(path: &str, ids: &[&str]) -> Envelope {
        Envelope::new(Operation::IdArray(IdArray {
            project: "P1".into(),
            path_name: path.into(),
            id_array: ids.iter().map(|id| LineId::from(*id)).collect(),
        }))
    }

    fn ids(table: &LineTable) -> Vec<&str> {
        table.ids().iter().map(LineId::as_str).collect()
    }

    fn ops(session: &mut SyncSession<MemoryDocument>) -> Vec<Operation> {
        session.take_outbound().into_iter().map(|e| e.operation).collect()
    }

    /// A connected session with `PATH` open and its table installed.
    fn ready(user: &str, text: &str, table: &[&str]) -> SyncSession<MemoryDocument> {
        let mut session = SyncSession::new(identity(user), SessionConfig::default());
        session.open_document(PATH, MemoryDocument::from_text(text));
        session.on_connected();
        session.handle_envelope(id_array(PATH, table), Instant::now());
        session.take_outbound();
        session.take_events();
        session
    }

    fn remote_op(user: &str, from: (&str, u32), to: (&str, u32), content: &str, new_ids: &[&str]) -> TextReplaced {
        TextReplaced {
            path_name: PATH.into(),
            from: Anchor::new(LineId::from(from.0), from.1),
            to: Anchor::new(LineId::from(to.0), to.1),
            content: content.into(),
            new_line_ids: new_ids.iter().map(|id| LineId::from(*id)).collect(),
            user_id: user.into(),
            project: "P1".into(),
        }
    }

    fn join(session: &mut SyncSession<MemoryDocument>, user: &str) {
        let info = identity(user);
        session.handle_envelope(
            Envelope::new(Operation::UserJoined(UserJoined {
                user_id: info.user_id,
                user_name: info.user_name,
                user_display_name: info.user_display_name,
                project: info.project,
            })),
            Instant::now(),
        );
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    #[test]
    fn connecting_announces_join_then_documents() {
        let mut session = SyncSession::new(identity("me"), SessionConfig::default());
        session.open_document(PATH, MemoryDocument::from_text("a\nb\nc"));
        assert!(session.take_outbound().is_empty());

        session.on_connected();
        let out = ops(&mut session);
        assert!(matches!(&out[0], Operation::UserJoined(data) if data.user_id == "me"));
        assert!(matches!(
            &out[1],
            Operation::SendFile(data) if data.path_name == PATH && data.line_count == Some(3)
        ));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn document_paths_are_normalized() {
        let mut session = ready("me", "x", &["i1"]);
        session.open_document("src\\b.txt", MemoryDocument::default());

        let out = ops(&mut session);
        assert!(matches!(&out[..], [Operation::SendFile(data)] if data.path_name == "src/b.txt"));
        assert!(session.document("/src/b.txt").is_some());
    }

    #[test]
    fn leave_flushes_pending_edit_before_user_left() {
        let mut session = ready("me", "x", &["i1"]);
        session.apply_local_edit(PATH, TextChange::insert(pos(0, 1), "y"), Instant::now()).unwrap();
        session.leave();

        let out = ops(&mut session);
        assert!(matches!(out[0], Operation::TextReplaced(_)));
        assert!(matches!(out[1], Operation::UserLeft(_)));
    }

    // ── Local edits ────────────────────────────────────────────────

    #[test]
    fn typed_newline_is_sent_after_window_with_fresh_identity() {
        let now = Instant::now();
        let mut session = ready("me", "one\ntwo\nthree", &["i1", "i2", "i3"]);

        session.apply_local_edit(PATH, TextChange::insert(pos(1, 3), "\n"), now).unwrap();
        assert!(session.take_outbound().is_empty());
        assert_eq!(session.next_deadline(), Some(now + ms(150)));

        session.poll(now + ms(150));
        let out = ops(&mut session);
        let [Operation::TextReplaced(op)] = &out[..] else {
            panic!("expected one textReplaced, got {out:?}");
        };
        assert_eq!(op.from, Anchor::new(LineId::from("i2"), 3));
        assert_eq!(op.to, op.from);
        assert_eq!(op.new_line_ids.len(), 1);

        let table = session.table(PATH).unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table.id_at(2), Some(&op.new_line_ids[0]));
    }

    #[test]
    fn own_echo_is_not_applied_again() {
        let now = Instant::now();
        let mut session = ready("me", "one", &["i1"]);
        session.apply_local_edit(PATH, TextChange::insert(pos(0, 3), "!"), now).unwrap();
        session.poll(now + ms(150));
        let Some(Operation::TextReplaced(op)) = ops(&mut session).pop() else {
            panic!("expected textReplaced");
        };
        assert_eq!(session.pending_echoes(), 1);

        session.handle_envelope(Envelope::stamped(Operation::TextReplaced(op), 1), now);
        session.poll(now + ms(500));

        assert_eq!(session.pending_echoes(), 0);
        assert_eq!(session.pending_remote(), 0);
        assert_eq!(session.document(PATH).unwrap().text(), "one!");
    }

    #[test]
    fn unmatched_own_edit_is_ignored() {
        let mut session = ready("me", "one", &["i1"]);
        let op = remote_op("me", ("i1", 0), ("i1", 0), "zz", &[]);
        session.handle_envelope(Envelope::new(Operation::TextReplaced(op)), Instant::now());
        assert_eq!(session.pending_remote(), 0);
    }

    #[test]
    fn edit_before_table_is_parked_until_id_array() {
        let now = Instant::now();
        let mut session = SyncSession::new(identity("me"), SessionConfig::default());
        session.on_connected();
        session.open_document(PATH, MemoryDocument::from_text("ab"));
        session.take_outbound();

        session.apply_local_edit(PATH, TextChange::insert(pos(0, 2), "\nc"), now).unwrap();
        session.poll(now + ms(150));
        assert!(session.take_outbound().is_empty(), "file request already outstanding");

        session.handle_envelope(id_array(PATH, &["i1"]), now + ms(200));
        let out = ops(&mut session);
        let [Operation::TextReplaced(op)] = &out[..] else {
            panic!("expected parked edit to be sent, got {out:?}");
        };
        assert_eq!(op.from, Anchor::new(LineId::from("i1"), 2));
        assert_eq!(op.content, "\nc");
        assert_eq!(session.table(PATH).unwrap().len(), 2);
    }

    #[test]
    fn parked_edits_are_dropped_when_table_does_not_fit() {
        let now = Instant::now();
        let mut session = SyncSession::new(identity("me"), SessionConfig::default());
        session.on_connected();
        session.open_document(PATH, MemoryDocument::from_text("ab"));
        session.apply_local_edit(PATH, TextChange::insert(pos(0, 2), "!"), now).unwrap();
        session.poll(now + ms(150));
        session.take_outbound();

        session.handle_envelope(id_array(PATH, &["i1", "i2", "i3"]), now);
        assert!(session.take_outbound().is_empty());
        assert!(session
            .take_events()
            .iter()
            .any(|e| matches!(e, SessionEvent::OperationDropped { .. })));
    }

    #[test]
    fn run_closed_by_line_changing_edit_elsewhere_stays_in_step() {
        let now = Instant::now();
        let mut session = ready("me", "a\nb\nc", &["i1", "i2", "i3"]);

        session.apply_local_edit(PATH, TextChange::insert(pos(0, 1), "x"), now).unwrap();
        session.apply_local_edit(PATH, TextChange::insert(pos(2, 1), "\n"), now).unwrap();
        assert!(matches!(&ops(&mut session)[..], [Operation::TextReplaced(op)] if op.content == "x"));

        session.poll(now + ms(150));
        assert!(matches!(&ops(&mut session)[..], [Operation::TextReplaced(op)] if op.content == "\n"));
        assert!(!session
            .take_events()
            .iter()
            .any(|e| matches!(e, SessionEvent::ResyncRequested { .. })));
        assert_eq!(session.table(PATH).unwrap().len(), 4);
        assert_eq!(session.document(PATH).unwrap().line_count(), 4);
    }

    #[test]
    fn resync_reply_keeps_own_edits_sent_after_the_request() {
        let now = Instant::now();
        let mut session = ready("me", "a\nb\nc", &["i1", "i2", "i3"]);

        session.apply_local_edit(PATH, TextChange::insert(pos(0, 1), "\n"), now).unwrap();
        session.poll(now + ms(150));
        let Some(Operation::TextReplaced(before)) = ops(&mut session).pop() else {
            panic!("expected textReplaced");
        };

        let request = FileRequest { path_name: Some(PATH.into()), project: Some("P1".into()) };
        session.handle_envelope(Envelope::new(Operation::FileRequest(request)), now + ms(160));
        assert!(matches!(&ops(&mut session)[..], [Operation::SendFile(_)]));

        session.apply_local_edit(PATH, TextChange::insert(pos(3, 1), "\n"), now + ms(170)).unwrap();
        session.poll(now + ms(320));
        let Some(Operation::TextReplaced(after)) = ops(&mut session).pop() else {
            panic!("expected textReplaced");
        };

        // The reply reflects the first edit but predates the second.
        let first = before.new_line_ids[0].as_str();
        session.handle_envelope(id_array(PATH, &["i1", first, "i2", "i3"]), now + ms(330));

        let table = session.table(PATH).unwrap();
        assert_eq!(ids(table), ["i1", first, "i2", "i3", after.new_line_ids[0].as_str()]);
        assert_eq!(table.len(), session.document(PATH).unwrap().line_count());
        assert!(!session
            .take_events()
            .iter()
            .any(|e| matches!(e, SessionEvent::ResyncRequested { .. } | SessionEvent::OperationDropped { .. })));
    }

    #[test]
    fn echoed_edits_are_not_replayed_onto_later_tables() {
        let now = Instant::now();
        let mut session = ready("me", "a", &["i1"]);

        let request = FileRequest { path_name: Some(PATH.into()), project: Some("P1".into()) };
        session.handle_envelope(Envelope::new(Operation::FileRequest(request)), now);
        session.apply_local_edit(PATH, TextChange::insert(pos(0, 1), "\n"), now).unwrap();
        session.poll(now + ms(150));
        let Some(Operation::TextReplaced(op)) = ops(&mut session).pop() else {
            panic!("expected textReplaced");
        };
        let minted = op.new_line_ids[0].clone();
        session.handle_envelope(Envelope::stamped(Operation::TextReplaced(op), 1), now + ms(160));

        // Relay table already holds the echoed edit.
        session.handle_envelope(id_array(PATH, &["i1", minted.as_str()]), now + ms(170));
        assert_eq!(ids(session.table(PATH).unwrap()), ["i1", minted.as_str()]);
    }

    #[test]
    fn typing_after_unreported_remote_apply_is_sent() {
        let now = Instant::now();
        let mut session = ready("me", "one\ntwo", &["i1", "i2"]);
        let op = remote_op("peer", ("i1", 3), ("i1", 3), "hello", &[]);
        session.handle_envelope(Envelope::new(Operation::TextReplaced(op)), now);
        session.poll(now + ms(50));

        session.on_local_change(PATH, TextChange::insert(pos(0, 0), "o"), now + ms(60));
        session.poll(now + ms(500));
        let out = ops(&mut session);
        assert!(matches!(&out[..], [Operation::TextReplaced(op)] if op.content == "o"));
    }

    #[test]
    fn change_reported_for_remote_apply_is_not_resent() {
        let now = Instant::now();
        let mut session = ready("me", "one\ntwo", &["i1", "i2"]);
        let op = remote_op("peer", ("i1", 3), ("i1", 3), "\n", &["n1"]);
        session.handle_envelope(Envelope::new(Operation::TextReplaced(op)), now);
        session.poll(now + ms(50));

        session.on_local_change(PATH, TextChange::insert(pos(0, 3), "\n"), now + ms(60));
        session.poll(now + ms(500));
        assert!(session.take_outbound().is_empty());
    }

    // ── Remote apply ───────────────────────────────────────────────

    #[test]
    fn remote_edit_applies_after_window_and_moves_peer_marker() {
        let now = Instant::now();
        let mut session = ready("me", "one\ntwo\nthree", &["i1", "i2", "i3"]);
        join(&mut session, "peer");

        let op = remote_op("peer", ("i2", 3), ("i2", 3), "\n", &["n1"]);
        session.handle_envelope(Envelope::stamped(Operation::TextReplaced(op), 7), now);
        assert_eq!(session.pending_remote(), 1);
        assert_eq!(session.next_deadline(), Some(now + ms(50)));

        session.poll(now + ms(50));
        assert_eq!(session.document(PATH).unwrap().text(), "one\ntwo\n\nthree");
        assert_eq!(ids(session.table(PATH).unwrap()), ["i1", "i2", "n1", "i3"]);

        let events = session.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::MarkerShown { user_id, marker, .. }
                if user_id == "peer" && marker.cursor == pos(2, 0)
        )));
        assert!(events.contains(&SessionEvent::RemoteApplied { path: PATH.into(), count: 1 }));
    }

    #[test]
    fn batch_applies_out_of_order_dependency() {
        let now = Instant::now();
        let mut session = ready("me", "a\nb", &["i1", "i2"]);
        // The second op creates "n1"; the first one targets it.
        let dependent = remote_op("peer", ("n1", 0), ("n1", 0), "x", &[]);
        let creator = remote_op("peer", ("i2", 1), ("i2", 1), "\n", &["n1"]);
        session.handle_envelope(Envelope::new(Operation::TextReplaced(dependent)), now);
        session.handle_envelope(Envelope::new(Operation::TextReplaced(creator)), now);

        session.poll(now + ms(50));
        assert_eq!(session.document(PATH).unwrap().text(), "a\nb\nx");
        assert_eq!(session.pending_remote(), 0);
    }

    #[test]
    fn operation_is_dropped_and_resynced_after_requeue_limit() {
        let now = Instant::now();
        let config = SessionConfig { max_requeue: 1, ..SessionConfig::default() };
        let mut session = SyncSession::new(identity("me"), config);
        session.open_document(PATH, MemoryDocument::from_text("a"));
        session.on_connected();
        session.handle_envelope(id_array(PATH, &["i1"]), now);
        session.take_outbound();

        let op = remote_op("peer", ("ghost", 0), ("ghost", 0), "x", &[]);
        session.handle_envelope(Envelope::new(Operation::TextReplaced(op)), now);
        session.poll(now + ms(50));
        assert_eq!(session.pending_remote(), 1);

        session.poll(now + ms(100));
        assert_eq!(session.pending_remote(), 0);
        let out = ops(&mut session);
        assert!(matches!(&out[..], [Operation::SendFile(data)] if data.path_name == PATH));
        let events = session.take_events();
        assert!(events.iter().any(|e| matches!(e, SessionEvent::OperationDropped { .. })));
        assert!(events.iter().any(|e| matches!(e, SessionEvent::ResyncRequested { .. })));
        assert_eq!(session.document(PATH).unwrap().text(), "a");
    }

    #[test]
    fn operations_for_other_projects_are_ignored() {
        let mut session = ready("me", "a", &["i1"]);
        let mut op = remote_op("peer", ("i1", 0), ("i1", 0), "x", &[]);
        op.project = "P2".into();
        session.handle_envelope(Envelope::new(Operation::TextReplaced(op)), Instant::now());
        assert_eq!(session.pending_remote(), 0);
    }

    // ── Presence ───────────────────────────────────────────────────

    #[test]
    fn selection_waits_for_pending_edit() {
        let now = Instant::now();
        let mut session = ready("me", "", &["i1"]);
        session.apply_local_edit(PATH, TextChange::insert(pos(0, 0), "x"), now).unwrap();
        session.on_local_selection(PATH, Selection::caret_at(pos(0, 1)));
        assert!(session.take_outbound().is_empty());

        session.poll(now + ms(150));
        let out = ops(&mut session);
        assert!(matches!(out[0], Operation::TextReplaced(_)));
        assert!(matches!(&out[1], Operation::CursorMoved(data) if data.cursor == pos(0, 1)));
    }

    #[test]
    fn cursor_reports_non_active_end_as_selection_end() {
        let mut session = ready("me", "hello", &["i1"]);
        session.on_local_selection(PATH, Selection::new(pos(0, 5), pos(0, 1)));

        let out = ops(&mut session);
        let [Operation::CursorMoved(data)] = &out[..] else {
            panic!("expected cursorMoved, got {out:?}");
        };
        assert_eq!((data.cursor, data.selection_end), (pos(0, 1), pos(0, 5)));
    }

    #[test]
    fn get_cursors_from_peer_resends_current_cursor() {
        let mut session = ready("me", "hello", &["i1"]);
        session.on_local_selection(PATH, Selection::caret_at(pos(0, 2)));
        session.take_outbound();

        let request = |user: &str| {
            Envelope::new(Operation::GetCursors(GetCursors { user_id: user.into(), project: "P1".into() }))
        };
        session.handle_envelope(request("me"), Instant::now());
        assert!(session.take_outbound().is_empty());

        session.handle_envelope(request("peer"), Instant::now());
        assert!(matches!(&ops(&mut session)[..], [Operation::CursorMoved(_)]));
    }

    #[test]
    fn switching_documents_requests_cursors_and_table() {
        let mut session = ready("me", "a", &["i1"]);
        session.open_document("b.txt", MemoryDocument::default());
        session.take_outbound();

        session.set_active("b.txt");
        let out = ops(&mut session);
        assert!(matches!(out[0], Operation::GetCursors(_)));
        assert!(matches!(&out[1], Operation::SendFile(data) if data.path_name == "b.txt"));
        assert_eq!(session.active_path(), Some("b.txt"));
    }

    #[test]
    fn peer_cursor_on_other_document_clears_marker() {
        let now = Instant::now();
        let mut session = ready("me", "a", &["i1"]);
        join(&mut session, "peer");
        let moved = |path: &str| {
            Envelope::new(Operation::CursorMoved(CursorMoved {
                path_name: path.into(),
                cursor: pos(0, 1),
                selection_end: pos(0, 0),
                user_id: "peer".into(),
                project: "P1".into(),
            }))
        };
        session.handle_envelope(moved(PATH), now);
        session.handle_envelope(moved("b.txt"), now);

        let events = session.take_events();
        assert!(matches!(events[1], SessionEvent::MarkerShown { .. }));
        assert_eq!(events[2], SessionEvent::MarkerCleared { user_id: "peer".into() });
    }

    // ── Chat / membership ──────────────────────────────────────────

    #[test]
    fn chat_uses_peer_label_and_relay_time() {
        let mut session = ready("me", "a", &["i1"]);
        join(&mut session, "peer");
        session.take_events();

        let chat = ChatMsg { msg: "hi".into(), user_id: "peer".into(), time: None, project: "P1".into() };
        session.handle_envelope(Envelope::stamped(Operation::ChatMsg(chat), 42), Instant::now());

        assert_eq!(
            session.take_events(),
            [SessionEvent::Chat {
                user_id: "peer".into(),
                label: "peer-name".into(),
                msg: "hi".into(),
                time: Some(42),
            }]
        );
    }

    #[test]
    fn membership_events_track_peers() {
        let mut session = ready("me", "a", &["i1"]);
        join(&mut session, "peer");
        join(&mut session, "me");
        assert_eq!(session.peers().len(), 1);

        session.handle_envelope(
            Envelope::new(Operation::UserLeft(UserLeft { user_id: "peer".into(), project: "P1".into() })),
            Instant::now(),
        );
        let events = session.take_events();
        assert_eq!(events[0], SessionEvent::PeerJoined { user_id: "peer".into(), label: "peer-name".into() });
        assert_eq!(events[1], SessionEvent::PeerLeft { user_id: "peer".into(), label: "peer-name".into() });
        assert!(session.peers().is_empty());
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = SessionEvent::RemoteApplied { path: PATH.into(), count: 2 };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "remote_applied");
        assert_eq!(value["count"], 2);
    }
}
