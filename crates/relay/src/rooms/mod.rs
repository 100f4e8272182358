// Room registry: project rooms, their members, and the authoritative line
// identity table of every registered document.
//
// Every mutation and the fan-out it causes happen under one write lock, so
// all members of a room observe operations in table-update order.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tandem_common::line_table::LineTable;
use tandem_common::path::document_key;
use tandem_common::protocol::ws::{
    CursorMoved, Envelope, FileRequest, IdArray, Operation, SendFile, TextReplaced, UserJoined,
    UserLeft,
};
use tandem_common::types::PeerInfo;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Outbound half of a connection: the socket task drains it.
pub type Outbound = mpsc::UnboundedSender<Envelope>;

#[derive(Debug, Clone)]
struct Member {
    conn_id: ConnectionId,
    info: PeerInfo,
}

#[derive(Debug, Default)]
struct Room {
    members: Vec<Member>,
    tables: HashMap<String, LineTable>,
}

impl Room {
    fn connections(&self) -> Vec<ConnectionId> {
        let mut seen = HashSet::new();
        self.members
            .iter()
            .map(|member| member.conn_id)
            .filter(|conn_id| seen.insert(*conn_id))
            .collect()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Outbound>,
    rooms: HashMap<String, Room>,
}

impl RegistryState {
    fn send_to(&self, conn_id: ConnectionId, envelope: Envelope) {
        if let Some(outbound) = self.connections.get(&conn_id) {
            // A closed channel means the socket task is already tearing down.
            let _ = outbound.send(envelope);
        }
    }

    /// Stamp `operation` and deliver it to every connection in `project`.
    fn broadcast(&self, project: &str, operation: Operation) {
        let Some(room) = self.rooms.get(project) else {
            return;
        };
        let envelope = Envelope::stamped(operation, Utc::now().timestamp_millis());
        for conn_id in room.connections() {
            self.send_to(conn_id, envelope.clone());
        }
    }

    fn request_file(&self, conn_id: ConnectionId, project: &str, path: &str) {
        self.send_to(
            conn_id,
            Envelope::new(Operation::FileRequest(FileRequest {
                path_name: Some(path.to_string()),
                project: Some(project.to_string()),
            })),
        );
    }
}

/// Owns every room and connection the relay knows about.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    state: RwLock<RegistryState>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection and return its id.
    pub async fn register(&self, outbound: Outbound) -> ConnectionId {
        let conn_id = Uuid::new_v4();
        self.state.write().await.connections.insert(conn_id, outbound);
        debug!(conn_id = %conn_id, "connection registered");
        conn_id
    }

    /// Forget a closed connection. Every membership it still held is removed
    /// and announced as a `userLeft`; rooms left empty are destroyed.
    pub async fn unregister(&self, conn_id: ConnectionId) {
        let mut state = self.state.write().await;
        state.connections.remove(&conn_id);

        let mut departed = Vec::new();
        for (project, room) in state.rooms.iter_mut() {
            room.members.retain(|member| {
                if member.conn_id == conn_id {
                    departed.push((project.clone(), member.info.user_id.clone()));
                    false
                } else {
                    true
                }
            });
        }

        for (project, user_id) in departed {
            info!(conn_id = %conn_id, project = %project, user_id = %user_id, "member disconnected");
            state.broadcast(
                &project,
                Operation::UserLeft(UserLeft { user_id, project: project.clone() }),
            );
        }
        prune_empty_rooms(&mut state);
    }

    /// Route one inbound envelope from `conn_id`.
    pub async fn dispatch(&self, conn_id: ConnectionId, envelope: Envelope) {
        debug!(conn_id = %conn_id, operation = envelope.operation.tag(), "inbound operation");
        let mut state = self.state.write().await;
        match envelope.operation {
            Operation::UserJoined(data) => join(&mut state, conn_id, data),
            Operation::UserLeft(data) => leave(&mut state, conn_id, data),
            Operation::SendFile(data) => register_file(&mut state, conn_id, data),
            Operation::CursorMoved(data) => cursor_moved(&state, conn_id, data),
            Operation::TextReplaced(data) => text_replaced(&mut state, conn_id, data),
            Operation::ChatMsg(data) => {
                let project = data.project.clone();
                relay_to_room(&state, &project, Operation::ChatMsg(data));
            }
            Operation::GetCursors(data) => {
                let project = data.project.clone();
                relay_to_room(&state, &project, Operation::GetCursors(data));
            }
            other @ (Operation::ActiveUsers(_)
            | Operation::IdArray(_)
            | Operation::FileRequest(_)) => {
                warn!(
                    conn_id = %conn_id,
                    operation = other.tag(),
                    "dropping server-only operation sent by client"
                );
            }
        }
    }

    /// Snapshot of the authoritative table for a document.
    pub async fn table(&self, project: &str, path: &str) -> Option<LineTable> {
        let state = self.state.read().await;
        state.rooms.get(project)?.tables.get(&document_key(path)).cloned()
    }

    /// Members of a room, in join order.
    pub async fn members(&self, project: &str) -> Vec<PeerInfo> {
        let state = self.state.read().await;
        state
            .rooms
            .get(project)
            .map(|room| room.members.iter().map(|member| member.info.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }
}

fn join(state: &mut RegistryState, conn_id: ConnectionId, data: UserJoined) {
    let info = data.peer_info();
    let room = state.rooms.entry(data.project.clone()).or_default();
    // A re-announce (reconnect or repeated join) replaces the earlier entry.
    room.members.retain(|member| member.info.user_id != info.user_id);
    room.members.push(Member { conn_id, info: info.clone() });
    let peers: Vec<PeerInfo> = room.members.iter().map(|member| member.info.clone()).collect();

    info!(
        conn_id = %conn_id,
        project = %data.project,
        user_id = %info.user_id,
        members = peers.len(),
        "member joined"
    );

    let project = data.project.clone();
    state.broadcast(&project, Operation::UserJoined(data));
    state.send_to(conn_id, Envelope::new(Operation::ActiveUsers(peers)));
}

fn leave(state: &mut RegistryState, conn_id: ConnectionId, data: UserLeft) {
    if !state.rooms.contains_key(&data.project) {
        warn!(conn_id = %conn_id, project = %data.project, "userLeft for unknown room");
        return;
    }

    let project = data.project.clone();
    let user_id = data.user_id.clone();
    state.broadcast(&project, Operation::UserLeft(data));

    if let Some(room) = state.rooms.get_mut(&project) {
        room.members.retain(|member| member.info.user_id != user_id);
    }
    info!(conn_id = %conn_id, project = %project, user_id = %user_id, "member left");
    prune_empty_rooms(state);
}

fn register_file(state: &mut RegistryState, conn_id: ConnectionId, data: SendFile) {
    let Some(room) = state.rooms.get_mut(&data.project) else {
        warn!(
            conn_id = %conn_id,
            project = %data.project,
            path = %data.path_name,
            "sendFile before joining room, dropping"
        );
        return;
    };

    let key = document_key(&data.path_name);
    let line_count = data.resolved_line_count().unwrap_or(1);
    let table = room.tables.entry(key).or_insert_with(|| {
        info!(
            project = %data.project,
            path = %data.path_name,
            lines = line_count,
            "document registered"
        );
        LineTable::fresh(line_count)
    });
    let id_array = table.ids().to_vec();

    state.send_to(
        conn_id,
        Envelope::new(Operation::IdArray(IdArray {
            project: data.project,
            path_name: data.path_name,
            id_array,
        })),
    );
}

fn cursor_moved(state: &RegistryState, conn_id: ConnectionId, data: CursorMoved) {
    let Some(room) = state.rooms.get(&data.project) else {
        warn!(conn_id = %conn_id, project = %data.project, "cursorMoved for unknown room");
        return;
    };
    if !room.tables.contains_key(&document_key(&data.path_name)) {
        state.request_file(conn_id, &data.project, &data.path_name);
    }
    let project = data.project.clone();
    state.broadcast(&project, Operation::CursorMoved(data));
}

fn text_replaced(state: &mut RegistryState, conn_id: ConnectionId, data: TextReplaced) {
    let Some(room) = state.rooms.get_mut(&data.project) else {
        warn!(conn_id = %conn_id, project = %data.project, "textReplaced for unknown room");
        return;
    };
    // Without a relay table no peer was ever issued ids for this document,
    // so nobody can resolve the edit's anchors. It is not relayed.
    let Some(table) = room.tables.get_mut(&document_key(&data.path_name)) else {
        debug!(
            conn_id = %conn_id,
            path = %data.path_name,
            "textReplaced for unregistered document, requesting file"
        );
        state.request_file(conn_id, &data.project, &data.path_name);
        return;
    };

    match table.resolve_range(&data.from.line, &data.to.line) {
        Ok((from_line, to_line)) => {
            table.apply_replacement(from_line, to_line, &data.new_line_ids);
        }
        Err(error) => {
            warn!(
                conn_id = %conn_id,
                path = %data.path_name,
                error = %error,
                "cannot apply textReplaced to relay table"
            );
        }
    }

    let project = data.project.clone();
    state.broadcast(&project, Operation::TextReplaced(data));
}

fn relay_to_room(state: &RegistryState, project: &str, operation: Operation) {
    if !state.rooms.contains_key(project) {
        warn!(project = %project, operation = operation.tag(), "operation for unknown room");
        return;
    }
    state.broadcast(project, operation);
}

fn prune_empty_rooms(state: &mut RegistryState) {
    state.rooms.retain(|project, room| {
        let keep = !room.members.is_empty();
        if !keep {
            info!(project = %project, documents = room.tables.len(), "room destroyed");
        }
        keep
    });
}
