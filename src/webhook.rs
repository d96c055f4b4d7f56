//! Webhook reconciler for asynchronous provider notifications.
//!
//! Consumes "checkout completed / expired / failed" callbacks, maps them to
//! a registration by the checkout correlation id and applies the idempotent
//! state-machine transition. Signature verification happens upstream (the
//! webhook transport collaborator); by the time a notification reaches this
//! module it is authentic.
//!
//! The reconciler fails softly: any condition where a retry by the sender
//! would not help (unknown correlation id, already-terminal registration,
//! unrecognized event type) is acknowledged and logged, never raised.
//! Storage failures are the one exception — nothing was committed, so a
//! sender retry is both helpful and, thanks to idempotency, harmless.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::error::{RegistrationError, Result};
use crate::state_machine::{self, PaymentStatus, TransitionOutcome, TransitionTrigger};
use crate::store;
use crate::types::{EventId, RegistrationId};

/// An inbound provider notification, as consumed from the webhook channel.
///
/// Only `event_type` and `correlation_id` are interpreted; the raw payload
/// travels along for diagnostics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderNotification {
    /// Provider event type string, e.g. `checkout.session.completed`.
    pub event_type: String,
    /// Correlation id of the checkout session the event refers to.
    pub correlation_id: String,
    /// Raw provider payload, not interpreted by the engine.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Provider event types this engine consumes, mapped from the provider's
/// strings at the boundary.
///
/// Unrecognized strings never reach the state machine; they are
/// acknowledged and dropped exactly like an unknown correlation id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderEventKind {
    /// The checkout session completed; payment settled.
    Completed,
    /// The checkout session expired without payment.
    Expired,
    /// The payment failed.
    Failed,
}

impl ProviderEventKind {
    /// Maps a provider event type string to the closed internal enum.
    #[must_use]
    pub fn parse(event_type: &str) -> Option<Self> {
        match event_type {
            "checkout.session.completed" | "completed" => Some(Self::Completed),
            "checkout.session.expired" | "expired" => Some(Self::Expired),
            "checkout.payment.failed" | "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// The state-machine trigger this event drives.
    #[must_use]
    pub const fn trigger(self) -> TransitionTrigger {
        match self {
            Self::Completed => TransitionTrigger::CheckoutCompleted,
            Self::Expired => TransitionTrigger::CheckoutExpired,
            Self::Failed => TransitionTrigger::CheckoutFailed,
        }
    }
}

/// Outcome of handling one notification. Every variant is an
/// acknowledgement; the distinctions exist for logging, metrics and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The transition was applied.
    Applied {
        /// Registration the notification resolved to.
        registration_id: RegistrationId,
        /// Event whose lock flag was re-evaluated.
        event_id: EventId,
        /// The status reached.
        status: PaymentStatus,
        /// Seats released by the transition, if any.
        seats_released: u64,
    },
    /// The registration already reached a terminal state; duplicate or
    /// late delivery, no-op.
    AlreadyTerminal {
        /// Registration the notification resolved to.
        registration_id: RegistrationId,
        /// The terminal status found.
        status: PaymentStatus,
    },
    /// No registration carries this correlation id.
    UnknownCorrelationId,
    /// The provider event type is not one this engine consumes.
    UnknownEventType,
    /// The transition table refused the trigger from a non-terminal state.
    /// Unreachable when the guards hold; logged loudly.
    Conflict {
        /// Registration the notification resolved to.
        registration_id: RegistrationId,
    },
}

/// Webhook reconciler: thin transactional shell around the pure transition
/// table.
#[derive(Clone)]
pub struct WebhookReconciler {
    pool: PgPool,
}

impl WebhookReconciler {
    /// Creates a reconciler over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Handles one provider notification.
    ///
    /// Callable repeatedly for the same notification without side effect
    /// beyond the first application.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::RegistrationError::Database`] only for
    /// storage failures, where nothing was committed and a sender retry is
    /// safe. Every business condition resolves to an acknowledged
    /// [`WebhookOutcome`].
    pub async fn handle(&self, notification: &ProviderNotification) -> Result<WebhookOutcome> {
        let Some(kind) = ProviderEventKind::parse(&notification.event_type) else {
            debug!(
                event_type = %notification.event_type,
                correlation_id = %notification.correlation_id,
                "ignoring unrecognized provider event type"
            );
            metrics::counter!("registration_webhooks_total", "outcome" => "unknown_type")
                .increment(1);
            return Ok(WebhookOutcome::UnknownEventType);
        };

        let mut tx = self.pool.begin().await.map_err(RegistrationError::from)?;

        let Some(registration) =
            store::lock_by_correlation_id(&mut *tx, &notification.correlation_id).await?
        else {
            // A registration this engine never created, or one already
            // cleaned up. Acknowledge so the sender stops retrying.
            info!(
                correlation_id = %notification.correlation_id,
                event_type = %notification.event_type,
                "webhook for unknown correlation id acknowledged"
            );
            metrics::counter!("registration_webhooks_total", "outcome" => "unknown_correlation")
                .increment(1);
            return Ok(WebhookOutcome::UnknownCorrelationId);
        };

        let outcome = match state_machine::apply(&mut *tx, &registration, kind.trigger(), Utc::now())
            .await
        {
            Ok(outcome) => outcome,
            Err(RegistrationError::TransitionConflict { from, trigger }) => {
                // A missing guard upstream, not something the sender can
                // fix by retrying: acknowledge loudly.
                warn!(
                    registration_id = %registration.id,
                    status = %from,
                    ?trigger,
                    "webhook trigger refused by transition table"
                );
                metrics::counter!("registration_webhooks_total", "outcome" => "conflict")
                    .increment(1);
                return Ok(WebhookOutcome::Conflict {
                    registration_id: registration.id,
                });
            }
            Err(err) => return Err(err),
        };

        tx.commit().await.map_err(RegistrationError::from)?;

        match outcome {
            TransitionOutcome::Transitioned {
                next,
                seats_released,
            } => {
                info!(
                    registration_id = %registration.id,
                    event_id = %registration.event_id,
                    correlation_id = %notification.correlation_id,
                    status = %next,
                    seats_released,
                    "webhook applied"
                );
                metrics::counter!("registration_webhooks_total", "outcome" => "applied")
                    .increment(1);
                Ok(WebhookOutcome::Applied {
                    registration_id: registration.id,
                    event_id: registration.event_id,
                    status: next,
                    seats_released,
                })
            }
            TransitionOutcome::AlreadyTerminal { status } => {
                if kind == ProviderEventKind::Completed && status == PaymentStatus::Expired {
                    // A successful payment arrived after the sweeper already
                    // expired the registration. The transition stays a no-op;
                    // flag it for a human-driven refund.
                    warn!(
                        registration_id = %registration.id,
                        correlation_id = %notification.correlation_id,
                        "completed webhook after expiry; payment needs manual reconciliation"
                    );
                } else {
                    debug!(
                        registration_id = %registration.id,
                        correlation_id = %notification.correlation_id,
                        status = %status,
                        "duplicate webhook on terminal registration acknowledged"
                    );
                }
                metrics::counter!("registration_webhooks_total", "outcome" => "already_terminal")
                    .increment(1);
                Ok(WebhookOutcome::AlreadyTerminal {
                    registration_id: registration.id,
                    status,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_event_strings_map_to_closed_enum() {
        assert_eq!(
            ProviderEventKind::parse("checkout.session.completed"),
            Some(ProviderEventKind::Completed)
        );
        assert_eq!(
            ProviderEventKind::parse("expired"),
            Some(ProviderEventKind::Expired)
        );
        assert_eq!(
            ProviderEventKind::parse("checkout.payment.failed"),
            Some(ProviderEventKind::Failed)
        );
        assert_eq!(ProviderEventKind::parse("invoice.paid"), None);
        assert_eq!(ProviderEventKind::parse(""), None);
    }

    #[test]
    fn kinds_drive_the_expected_triggers() {
        assert_eq!(
            ProviderEventKind::Completed.trigger(),
            TransitionTrigger::CheckoutCompleted
        );
        assert_eq!(
            ProviderEventKind::Expired.trigger(),
            TransitionTrigger::CheckoutExpired
        );
        assert_eq!(
            ProviderEventKind::Failed.trigger(),
            TransitionTrigger::CheckoutFailed
        );
    }
}
