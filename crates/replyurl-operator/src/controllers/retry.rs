//! Retry policy with exponential backoff for controller errors
//!
//! Shared error classification and backoff strategy. Errors are classified as
//! transient or permanent to determine whether a resource is requeued with
//! backoff or parked until it changes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use kube::runtime::controller::Action;
use tracing::{debug, warn};

/// Maximum number of retries before giving up
const MAX_RETRIES: u32 = 10;

/// Base delay for exponential backoff (seconds)
const BASE_DELAY_SECS: u64 = 5;

/// Maximum delay between retries (1 hour)
const MAX_DELAY_SECS: u64 = 3600;

/// Tracks retry attempts per resource.
///
/// Uses std::sync::Mutex so the controller's synchronous error policy can
/// call into it; no lock is ever held across an await point.
#[derive(Debug, Default)]
pub struct RetryTracker {
    /// Map of resource UID to retry count
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    /// Create a new retry tracker
    pub fn new() -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Increment retry count for a resource and return the new count
    pub fn increment(&self, uid: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let count = attempts.entry(uid.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Reset retry count for a resource (call on successful reconciliation)
    pub fn reset(&self, uid: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.remove(uid);
    }

    /// Get current retry count for a resource
    pub fn get(&self, uid: &str) -> u32 {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.get(uid).copied().unwrap_or(0)
    }

    /// Clean up entries for resources that no longer exist
    pub fn cleanup(&self, active_uids: &[String]) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.retain(|uid, _| active_uids.contains(uid));
    }
}

/// Error classification for retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient errors that should be retried with backoff
    /// Examples: network issues, temporary unavailability, rate limiting
    Transient,
    /// Permanent errors that will not recover without intervention
    /// Examples: missing required fields, invalid filter patterns
    Permanent,
}

/// Determine retry action based on error kind and attempt count
pub fn compute_backoff(attempt: u32, kind: ErrorKind) -> Action {
    match kind {
        ErrorKind::Transient => {
            if attempt >= MAX_RETRIES {
                warn!(
                    attempt,
                    max_retries = MAX_RETRIES,
                    "Max retries exceeded, waiting for resource change"
                );
                // Stop retrying until the resource changes
                Action::await_change()
            } else {
                // Exponential backoff: 5s, 10s, 20s, 40s, ... up to 1 hour
                let delay_secs = BASE_DELAY_SECS * 2u64.pow(attempt.saturating_sub(1));
                let capped_delay = delay_secs.min(MAX_DELAY_SECS);
                debug!(
                    attempt,
                    delay_secs = capped_delay,
                    "Scheduling retry with exponential backoff"
                );
                Action::requeue(Duration::from_secs(capped_delay))
            }
        }
        ErrorKind::Permanent => {
            // Permanent errors: wait for resource change, no point retrying
            warn!("Permanent error, waiting for resource change");
            Action::await_change()
        }
    }
}
