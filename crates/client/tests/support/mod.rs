// In-process room: sessions wired to a relay stand-in that keeps the
// authoritative tables the way the real relay does.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tandem_client::engine::{
    Identity, MemoryDocument, SessionConfig, SyncSession, TextChange, TextDocument,
};
use tandem_common::line_table::LineTable;
use tandem_common::protocol::ws::{Envelope, FileRequest, IdArray, Operation};
use tandem_common::types::PeerInfo;

pub const PATH: &str = "a.txt";
pub const PROJECT: &str = "P1";

pub enum Route {
    Sender(Envelope),
    Room(Envelope),
}

#[derive(Default)]
pub struct TestRelay {
    pub tables: HashMap<String, LineTable>,
    pub members: Vec<PeerInfo>,
    /// When set, room broadcasts are held here instead of delivered.
    pub hold: bool,
    pub held: Vec<Envelope>,
}

impl TestRelay {
    pub fn process(&mut self, envelope: Envelope) -> Vec<Route> {
        match envelope.operation {
            Operation::UserJoined(data) => {
                self.members.push(data.peer_info());
                vec![
                    Route::Room(Envelope::new(Operation::UserJoined(data))),
                    Route::Sender(Envelope::new(Operation::ActiveUsers(self.members.clone()))),
                ]
            }
            Operation::UserLeft(data) => {
                self.members.retain(|member| member.user_id != data.user_id);
                vec![Route::Room(Envelope::new(Operation::UserLeft(data)))]
            }
            Operation::SendFile(data) => {
                let lines = data.resolved_line_count().unwrap_or(1);
                let table =
                    self.tables.entry(data.path_name.clone()).or_insert_with(|| LineTable::fresh(lines));
                vec![Route::Sender(Envelope::new(Operation::IdArray(IdArray {
                    project: data.project,
                    path_name: data.path_name,
                    id_array: table.ids().to_vec(),
                })))]
            }
            Operation::TextReplaced(op) => match self.tables.get_mut(&op.path_name) {
                None => vec![Route::Sender(Envelope::new(Operation::FileRequest(FileRequest {
                    path_name: Some(op.path_name),
                    project: Some(op.project),
                })))],
                Some(table) => {
                    let (from, to) = table
                        .resolve_range(&op.from.line, &op.to.line)
                        .expect("relay table knows every addressed line");
                    table.apply_replacement(from, to, &op.new_line_ids);
                    vec![Route::Room(Envelope::new(Operation::TextReplaced(op)))]
                }
            },
            other => vec![Route::Room(Envelope::new(other))],
        }
    }
}

pub struct Room {
    pub relay: TestRelay,
    pub peers: Vec<SyncSession<MemoryDocument>>,
    pub now: Instant,
}

pub fn identity(user: &str) -> Identity {
    Identity {
        user_id: user.into(),
        user_name: format!("{user}-name"),
        user_display_name: format!("{user}-display"),
        project: PROJECT.into(),
    }
}

impl Room {
    /// One connected peer per text, each with `PATH` open.
    pub fn new(texts: &[&str]) -> Self {
        let mut room = Self { relay: TestRelay::default(), peers: Vec::new(), now: Instant::now() };
        for (idx, text) in texts.iter().enumerate() {
            let mut session = SyncSession::new(identity(&format!("u{idx}")), SessionConfig::default());
            session.open_document(PATH, MemoryDocument::from_text(text));
            session.on_connected();
            room.peers.push(session);
            room.settle();
        }
        room
    }

    /// Route every outbound envelope until the room is quiet.
    pub fn settle(&mut self) {
        let mut queue: VecDeque<(usize, Envelope)> = VecDeque::new();
        self.collect(&mut queue);
        while let Some((from, envelope)) = queue.pop_front() {
            for route in self.relay.process(envelope) {
                match route {
                    Route::Sender(reply) => self.peers[from].handle_envelope(reply, self.now),
                    Route::Room(broadcast) if self.relay.hold => self.relay.held.push(broadcast),
                    Route::Room(broadcast) => {
                        for peer in &mut self.peers {
                            peer.handle_envelope(broadcast.clone(), self.now);
                        }
                    }
                }
            }
            self.collect(&mut queue);
        }
    }

    fn collect(&mut self, queue: &mut VecDeque<(usize, Envelope)>) {
        for (idx, peer) in self.peers.iter_mut().enumerate() {
            queue.extend(peer.take_outbound().into_iter().map(|envelope| (idx, envelope)));
        }
    }

    pub fn advance(&mut self, ms: u64) {
        self.now += Duration::from_millis(ms);
        for peer in &mut self.peers {
            peer.poll(self.now);
        }
        self.settle();
    }

    /// Let every pending edit flush, travel and apply.
    pub fn round(&mut self) {
        self.advance(150);
        self.advance(50);
        self.advance(50);
    }

    pub fn edit(&mut self, peer: usize, change: TextChange) {
        let now = self.now;
        self.peers[peer].apply_local_edit(PATH, change, now).expect("edit fits the document");
    }

    pub fn text(&self, peer: usize) -> String {
        self.peers[peer].document(PATH).expect("document open").text()
    }

    pub fn table(&self, peer: usize) -> &LineTable {
        self.peers[peer].table(PATH).expect("table installed")
    }

    pub fn relay_table(&self) -> &LineTable {
        &self.relay.tables[PATH]
    }

    /// Every peer holds the same text and the relay's table, one id per line.
    pub fn assert_converged(&self) {
        let text = self.text(0);
        for idx in 0..self.peers.len() {
            assert_eq!(self.text(idx), text, "peer {idx} text diverged");
            assert_eq!(self.table(idx), self.relay_table(), "peer {idx} table diverged");
            let doc = self.peers[idx].document(PATH).expect("document open");
            assert_eq!(self.table(idx).len(), doc.line_count(), "peer {idx} table length");
            assert!(self.table(idx).first_duplicate().is_none());
        }
    }
}
