//! Expiry notification collaborator.
//!
//! Delivery (email) is owned by an external collaborator; the engine only
//! fires a best-effort notification when the sweeper reclaims an abandoned
//! registration. Failures are the implementation's problem to log — they
//! must never roll back the expiration that triggered them.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::types::Registration;

/// Notifies the registering party that their registration expired.
#[async_trait]
pub trait ExpiryNotifier: Send + Sync {
    /// Fire-and-forget: implementations swallow and log their own
    /// failures.
    async fn notify_expired(&self, registration: &Registration);
}

/// Default notifier: logs the expiry and leaves delivery to the operator.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl ExpiryNotifier for LogNotifier {
    async fn notify_expired(&self, registration: &Registration) {
        tracing::info!(
            registration_id = %registration.id,
            parent_id = %registration.parent_id,
            event_id = %registration.event_id,
            "registration expired; notify registering party"
        );
    }
}

/// Recording notifier for tests.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    notified: Arc<Mutex<Vec<Registration>>>,
}

impl RecordingNotifier {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registrations notified so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (test-only type).
    #[allow(clippy::unwrap_used)]
    #[must_use]
    pub fn notified(&self) -> Vec<Registration> {
        self.notified.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExpiryNotifier for RecordingNotifier {
    #[allow(clippy::unwrap_used)]
    async fn notify_expired(&self, registration: &Registration) {
        self.notified.lock().unwrap().push(registration.clone());
    }
}
