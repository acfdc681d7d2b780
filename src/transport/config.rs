//! Runtime configuration shared by clients and servers.

use crate::protocol::{MAX_FRAME_SIZE, MAX_OPTION_SIZE};

/// Default capacity of the completion channel created by [`crate::Client::go`].
pub const DEFAULT_DONE_CAPACITY: usize = 10;

/// Connection configuration options.
#[derive(Debug, Clone)]
pub struct Config {
    /// Largest header or body accepted or produced, in bytes.
    pub max_frame_size: usize,
    /// Largest negotiation line accepted, in bytes.
    pub max_option_size: usize,
    /// Capacity of the completion channel when the caller supplies none.
    pub done_capacity: usize,
}

impl Config {
    /// Override the frame size limit.
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Override the default completion channel capacity.
    ///
    /// A capacity of zero is raised to one; the completer never blocks, so
    /// a channel must be able to hold at least one completion.
    #[must_use]
    pub fn with_done_capacity(mut self, done_capacity: usize) -> Self {
        self.done_capacity = done_capacity.max(1);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            max_option_size: MAX_OPTION_SIZE,
            done_capacity: DEFAULT_DONE_CAPACITY,
        }
    }
}
