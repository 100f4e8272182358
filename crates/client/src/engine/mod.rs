// Collaborative sync engine. Everything here is synchronous and driven by
// explicit `now` instants, so the runtime owns all scheduling.

pub mod coalescer;
pub mod document;
pub mod echo;
pub mod presence;
pub mod remote_apply;
pub mod session;

pub use coalescer::{CoalescedEdit, EditCoalescer, TextChange, WindowConfig};
pub use document::{MemoryDocument, TextDocument};
pub use presence::{peer_label, DisplayMode, PeerMarker, Selection};
pub use session::{Identity, SessionConfig, SessionEvent, SyncSession};
