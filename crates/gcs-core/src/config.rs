//! Connection configuration.

use crate::log::Logger;

/// Default maximum size of one backend message, in bytes.
pub const DEFAULT_PKT_SIZE: usize = 1500;

/// Configuration applied when a connection is created.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Maximum backend message size; actions are fragmented to fit
    pub pkt_size: usize,
    /// Per-connection log sink. `None` logs through the thread's current
    /// `tracing` dispatcher.
    pub logger: Option<Logger>,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self { pkt_size: DEFAULT_PKT_SIZE, logger: None }
    }
}
