//! Result pagination: turns a driver result set into a sequence of bounded
//! columnar packets, prefetching the next packet in the background.

mod holder;
mod packet;
mod source;

pub use holder::{CursorHolder, HolderPhase, HolderStats};
pub use packet::{ColumnData, MergeMode, NullBitmap, PacketColumn, PacketWindow, RowPacket};
pub use source::RowSource;

use std::time::Duration;

pub const DEFAULT_PACKET_SIZE: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationSettings {
    /// Rows per packet (`K`).
    pub packet_size: usize,
    /// Upper bound on how long a request waits for a background packet.
    pub wait_timeout: Duration,
}

impl Default for PaginationSettings {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            wait_timeout: Duration::from_secs(30),
        }
    }
}
