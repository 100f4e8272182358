mod support;

use std::time::Duration;

use support::{Room, PATH};
use tandem_client::engine::{SessionEvent, TextChange};
use tandem_common::protocol::ws::Operation;
use tandem_common::types::{LineId, Position};

fn pos(line: u32, character: u32) -> Position {
    Position::new(line, character)
}

fn original_ids(room: &Room) -> Vec<LineId> {
    room.relay_table().ids().to_vec()
}

// ── Registration ───────────────────────────────────────────────────

#[test]
fn peers_share_the_table_created_by_first_announcement() {
    let room = Room::new(&["one\ntwo\nthree", "one\ntwo\nthree"]);

    assert_eq!(room.relay_table().len(), 3);
    assert_eq!(room.table(0), room.relay_table());
    assert_eq!(room.table(1), room.relay_table());
}

#[test]
fn repeated_announcement_returns_cached_table() {
    let mut room = Room::new(&["one\ntwo\nthree"]);
    let before = original_ids(&room);

    room.peers[0].on_connected();
    room.settle();

    assert_eq!(original_ids(&room), before);
    assert_eq!(room.table(0).ids(), before.as_slice());
}

// ── Single-author edits ────────────────────────────────────────────

#[test]
fn newline_after_second_line_reaches_both_peers() {
    let mut room = Room::new(&["one\ntwo\nthree", "one\ntwo\nthree"]);
    let ids = original_ids(&room);

    room.edit(0, TextChange::insert(pos(1, 3), "\n"));
    room.round();

    room.assert_converged();
    let table = room.table(1).ids();
    assert_eq!(table.len(), 4);
    assert_eq!((&table[0], &table[1], &table[3]), (&ids[0], &ids[1], &ids[2]));
    assert!(!ids.contains(&table[2]));
    assert_eq!(room.text(1), "one\ntwo\n\nthree");
}

#[test]
fn delete_spanning_lines_collapses_to_first_line() {
    let mut room = Room::new(&["one\ntwo\nthree", "one\ntwo\nthree"]);
    let ids = original_ids(&room);

    room.edit(0, TextChange::delete(pos(0, 3), pos(2, 5)));
    room.round();

    room.assert_converged();
    assert_eq!(room.table(1).ids(), &ids[..1]);
    assert_eq!(room.text(1), "one");
}

#[test]
fn typing_burst_travels_as_one_operation() {
    let mut room = Room::new(&["", ""]);
    let mut at = pos(0, 0);
    for ch in "hello\nworld".chars() {
        let text = ch.to_string();
        room.edit(0, TextChange::insert(at, text.clone()));
        at = at.advance(&text);
    }
    room.relay.hold = true;
    room.advance(150);

    assert_eq!(room.relay.held.len(), 1);
    let Operation::TextReplaced(op) = &room.relay.held[0].operation else {
        panic!("expected textReplaced");
    };
    assert_eq!(op.content, "hello\nworld");
    assert_eq!(op.new_line_ids.len(), 1);
}

#[test]
fn own_edit_is_applied_exactly_once() {
    let mut room = Room::new(&["abc", "abc"]);

    room.edit(0, TextChange::insert(pos(0, 3), "d\ne"));
    room.round();

    assert_eq!(room.text(0), "abcd\ne");
    assert_eq!(room.peers[0].pending_echoes(), 0);
    room.assert_converged();
}

// ── Concurrency ────────────────────────────────────────────────────

#[test]
fn concurrent_newlines_on_different_lines_converge() {
    let mut room = Room::new(&["one\ntwo\nthree", "one\ntwo\nthree"]);

    room.edit(0, TextChange::insert(pos(0, 3), "\n"));
    room.edit(1, TextChange::insert(pos(2, 5), "\n"));
    room.round();

    room.assert_converged();
    assert_eq!(room.text(0), "one\n\ntwo\nthree\n");
}

#[test]
fn concurrent_edits_keep_addressing_by_identity() {
    let mut room = Room::new(&["a\nb\nc\nd", "a\nb\nc\nd"]);

    // Peer 0 removes line "b"; peer 1 appends to line "d" which moves up.
    room.edit(0, TextChange::delete(pos(0, 1), pos(1, 1)));
    room.edit(1, TextChange::insert(pos(3, 1), "!"));
    room.round();

    room.assert_converged();
    assert_eq!(room.text(1), "a\nc\nd!");
}

#[test]
fn out_of_order_operation_waits_for_its_predecessor() {
    let mut room = Room::new(&["one\ntwo", "one\ntwo"]);

    // Capture two dependent operations from peer 0 without delivering them.
    room.relay.hold = true;
    room.edit(0, TextChange::insert(pos(1, 3), "\nnew"));
    room.advance(150);
    room.edit(0, TextChange::insert(pos(2, 3), "er"));
    room.advance(150);
    let mut held = std::mem::take(&mut room.relay.held);
    assert_eq!(held.len(), 2);
    room.relay.hold = false;

    // Peer 1 sees the dependent operation first.
    let second = held.pop().expect("second op");
    let first = held.pop().expect("first op");
    let start = room.now;
    room.peers[1].handle_envelope(second, start);
    room.peers[1].poll(start + Duration::from_millis(50));
    assert_eq!(room.peers[1].pending_remote(), 1, "dependent op re-queued");
    assert_eq!(room.text(1), "one\ntwo");

    room.peers[1].handle_envelope(first, start + Duration::from_millis(60));
    room.peers[1].poll(start + Duration::from_millis(100));

    assert_eq!(room.text(1), "one\ntwo\nnewer");
    assert_eq!(room.table(1), room.table(0));
    assert_eq!(room.peers[1].pending_remote(), 0);
}

// ── Presence ───────────────────────────────────────────────────────

#[test]
fn remote_edit_moves_author_marker_for_viewer() {
    let mut room = Room::new(&["one\ntwo", "one\ntwo"]);
    room.peers[1].take_events();

    room.edit(0, TextChange::insert(pos(1, 3), "xyz"));
    room.round();

    let events = room.peers[1].take_events();
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::MarkerShown { user_id, marker, .. }
            if user_id == "u0" && marker.path == PATH && marker.cursor == pos(1, 6)
    )));
}

#[test]
fn joiners_see_each_other() {
    let mut room = Room::new(&["x", "x"]);
    assert_eq!(room.peers[0].peers().len(), 1);
    assert!(room.peers[0].peers().get("u1").is_some());
    assert!(room.peers[1].peers().get("u0").is_some());

    room.peers[1].leave();
    room.settle();
    assert!(room.peers[0].peers().is_empty());
}
