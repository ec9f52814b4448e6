//! Per-session quota counters

use super::result::SandboxError;
use std::cell::Cell;

/// Counts outbound side effects of one session.
///
/// Capability calls are strictly sequential on the session thread, so plain
/// cells are enough and the tracker is `!Sync`.
#[derive(Debug)]
pub struct QuotaTracker {
    http_requests: Cell<u32>,
    max_http_requests: u32,
}

impl QuotaTracker {
    pub fn new(max_http_requests: u32) -> Self {
        Self {
            http_requests: Cell::new(0),
            max_http_requests,
        }
    }

    /// Count an HTTP request and refuse it once the cap is crossed.
    ///
    /// The refused attempt is counted too; the counter never decreases.
    pub fn record_http_request(&self) -> Result<u32, SandboxError> {
        let made = self.http_requests.get().saturating_add(1);
        self.http_requests.set(made);

        if made > self.max_http_requests {
            return Err(SandboxError::QuotaExceeded {
                limit: self.max_http_requests,
            });
        }
        Ok(made)
    }

    pub fn http_requests(&self) -> u32 {
        self.http_requests.get()
    }

    pub fn max_http_requests(&self) -> u32 {
        self.max_http_requests
    }
}
