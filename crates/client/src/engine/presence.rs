// Presence: local selection broadcasts and the registry of remote peers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tandem_common::path::paths_match;
use tandem_common::types::{PeerInfo, Position};

/// A selection as the editor reports it: `anchor` is where it started,
/// `active` is the end that moves with the caret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Selection {
    pub anchor: Position,
    pub active: Position,
}

impl Selection {
    pub fn new(anchor: Position, active: Position) -> Self {
        Self { anchor, active }
    }

    /// An empty selection at `at`.
    pub fn caret_at(at: Position) -> Self {
        Self::new(at, at)
    }

    pub fn caret(&self) -> Position {
        self.active
    }

    /// The non-active end, whichever direction the selection was made in.
    pub fn selection_end(&self) -> Position {
        self.anchor
    }
}

/// How peers are labelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisplayMode {
    #[default]
    Name,
    DisplayName,
    Id,
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Name => "name",
            Self::DisplayName => "displayName",
            Self::Id => "id",
        })
    }
}

impl FromStr for DisplayMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "name" => Ok(Self::Name),
            "displayName" | "display_name" => Ok(Self::DisplayName),
            "id" => Ok(Self::Id),
            other => Err(format!("unknown display mode `{other}` (expected name, displayName or id)")),
        }
    }
}

/// Last reported position of a peer, on any document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPosition {
    pub path: String,
    pub cursor: Position,
    pub selection_end: Position,
}

/// A peer marker shown in the local active document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMarker {
    pub path: String,
    pub line: u32,
    pub cursor: Position,
    pub selection_end: Position,
}

impl PeerMarker {
    fn from_position(position: &PeerPosition) -> Self {
        Self {
            path: position.path.clone(),
            line: position.cursor.line,
            cursor: position.cursor,
            selection_end: position.selection_end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub info: PeerInfo,
    pub position: Option<PeerPosition>,
    pub marker: Option<PeerMarker>,
}

impl Peer {
    fn new(info: PeerInfo) -> Self {
        Self { info, position: None, marker: None }
    }

    pub fn label(&self, mode: DisplayMode) -> &str {
        peer_label(&self.info, mode)
    }
}

/// The part of a member's identity shown under `mode`.
pub fn peer_label(info: &PeerInfo, mode: DisplayMode) -> &str {
    match mode {
        DisplayMode::Name => &info.user_name,
        DisplayMode::DisplayName => &info.user_display_name,
        DisplayMode::Id => &info.user_id,
    }
}

/// What happened to a peer's marker after a position update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerUpdate {
    Shown(PeerMarker),
    Cleared,
    Unchanged,
}

/// Remote peers in the room, keyed by user id. Never contains the local user.
#[derive(Debug)]
pub struct PeerRegistry {
    local_user_id: String,
    peers: BTreeMap<String, Peer>,
}

impl PeerRegistry {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self { local_user_id: local_user_id.into(), peers: BTreeMap::new() }
    }

    /// Add a peer. Returns false for the local user or a peer already known.
    pub fn join(&mut self, info: PeerInfo) -> bool {
        if info.user_id == self.local_user_id || self.peers.contains_key(&info.user_id) {
            return false;
        }
        self.peers.insert(info.user_id.clone(), Peer::new(info));
        true
    }

    pub fn leave(&mut self, user_id: &str) -> Option<Peer> {
        self.peers.remove(user_id)
    }

    /// Replace the whole set, keeping known positions of peers that remain.
    pub fn replace_all(&mut self, infos: Vec<PeerInfo>) {
        let mut previous = std::mem::take(&mut self.peers);
        for info in infos {
            if info.user_id == self.local_user_id {
                continue;
            }
            let peer = match previous.remove(&info.user_id) {
                Some(mut known) => {
                    known.info = info;
                    known
                }
                None => Peer::new(info),
            };
            self.peers.insert(peer.info.user_id.clone(), peer);
        }
    }

    /// Record a peer's new position and show or clear its marker depending
    /// on whether it is on the local active document. Unknown peers are
    /// ignored.
    pub fn move_cursor(
        &mut self,
        user_id: &str,
        path: &str,
        cursor: Position,
        selection_end: Position,
        active_path: Option<&str>,
    ) -> MarkerUpdate {
        let Some(peer) = self.peers.get_mut(user_id) else {
            return MarkerUpdate::Unchanged;
        };
        peer.position = Some(PeerPosition { path: path.to_string(), cursor, selection_end });
        Self::place_marker(peer, active_path)
    }

    /// Re-evaluate every marker after the local active document changed.
    pub fn refresh_markers(&mut self, active_path: Option<&str>) -> Vec<(String, MarkerUpdate)> {
        self.peers
            .iter_mut()
            .map(|(user_id, peer)| (user_id.clone(), Self::place_marker(peer, active_path)))
            .filter(|(_, update)| *update != MarkerUpdate::Unchanged)
            .collect()
    }

    fn place_marker(peer: &mut Peer, active_path: Option<&str>) -> MarkerUpdate {
        let visible = match (&peer.position, active_path) {
            (Some(position), Some(active)) if paths_match(&position.path, active) => {
                Some(PeerMarker::from_position(position))
            }
            _ => None,
        };

        match visible {
            Some(marker) => {
                if peer.marker.as_ref() == Some(&marker) {
                    return MarkerUpdate::Unchanged;
                }
                peer.marker = Some(marker.clone());
                MarkerUpdate::Shown(marker)
            }
            None => match peer.marker.take() {
                Some(_) => MarkerUpdate::Cleared,
                None => MarkerUpdate::Unchanged,
            },
        }
    }

    pub fn get(&self, user_id: &str) -> Option<&Peer> {
        self.peers.get(user_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Local selection state awaiting broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPresence {
    pub path: String,
    pub selection: Selection,
}

/// Decides when the local selection is broadcast.
///
/// While broadcasting is suppressed the latest selection is kept and handed
/// out by `take_deferred` once the engine is idle again.
#[derive(Debug, Default)]
pub struct PresenceBroadcaster {
    deferred: Option<LocalPresence>,
    last: Option<LocalPresence>,
}

impl PresenceBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the presence to send now, or None if suppressed.
    pub fn on_local_selection(
        &mut self,
        path: &str,
        selection: Selection,
        suppressed: bool,
    ) -> Option<LocalPresence> {
        let presence = LocalPresence { path: path.to_string(), selection };
        self.last = Some(presence.clone());
        if suppressed {
            self.deferred = Some(presence);
            return None;
        }
        self.deferred = None;
        Some(presence)
    }

    pub fn take_deferred(&mut self) -> Option<LocalPresence> {
        self.deferred.take()
    }

    /// The most recent local selection, sent or not.
    pub fn current(&self) -> Option<&LocalPresence> {
        self.last.as_ref()
    }
}
