use crate::rooms::RoomRegistry;
use std::sync::Arc;

pub(crate) const HEARTBEAT_INTERVAL_MS: u32 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: u32 = 262_144;

#[derive(Clone)]
pub(crate) struct RelayRouterState {
    pub(crate) registry: Arc<RoomRegistry>,
}
