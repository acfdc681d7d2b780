//! Per-message envelope
//!
//! Every request and response is one header followed by one body. The
//! header names the target, carries the sequence number used to match a
//! response to its call, and reports remote failures.

use serde::{Deserialize, Serialize};

/// Request/response header
///
/// An empty `error` means success. A non-empty `error` means the body that
/// follows is a placeholder and must be read and dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    /// Target in `Service.Method` form
    pub service_method: String,
    /// Sequence number chosen by the client
    pub seq: u64,
    /// Remote error text, empty on success
    pub error: String,
}

impl Header {
    /// Create a request header.
    #[must_use]
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Whether the header reports a remote failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Stamp an error onto the header.
    pub fn set_error(&mut self, error: impl ToString) {
        self.error = error.to_string();
    }
}

/// Opaque body sent alongside an error header.
///
/// Receivers never look inside it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalid;
