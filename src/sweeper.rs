//! Expiration sweeper: the engine's self-healing fallback.
//!
//! A webhook can arrive late, duplicated, or never. The sweeper runs on a
//! fixed interval (and once at process start, to repair gaps from downtime)
//! and force-resolves registrations stuck in `ONLINE_AWAITING` past the
//! grace window, through the same idempotent state-machine entry point the
//! webhook path uses — so the two reconciliation sources can never
//! disagree, and overlapping sweeper runs are safe without any
//! sweeper-level lock.
//!
//! Before expiring, the sweeper probes the provider for the session's
//! actual state: a session that completed provider-side (webhook lost) is
//! confirmed instead of expired. The probe is best-effort; on any probe
//! failure the registration expires, because the grace window is shorter
//! than the provider's own session lifetime and a settled payment will
//! still be reconciled by its retried webhook.

use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::checkout::{CheckoutGateway, SessionStatus};
use crate::config::SweeperConfig;
use crate::error::{RegistrationError, Result};
use crate::notify::ExpiryNotifier;
use crate::state_machine::{self, TransitionOutcome, TransitionTrigger};
use crate::store;
use crate::types::Registration;

/// Counters for one sweep pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale registrations the scan returned.
    pub scanned: usize,
    /// Registrations moved to `Expired`.
    pub expired: usize,
    /// Registrations the provider probe rescued to `Confirmed`.
    pub confirmed: usize,
    /// Registrations already resolved by the time the sweeper locked them.
    pub skipped: usize,
}

/// Periodic reclamation of abandoned online registrations.
pub struct Sweeper {
    pool: PgPool,
    gateway: Arc<dyn CheckoutGateway>,
    notifier: Arc<dyn ExpiryNotifier>,
    grace_period: chrono::Duration,
}

impl Sweeper {
    /// Creates a sweeper.
    #[must_use]
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn CheckoutGateway>,
        notifier: Arc<dyn ExpiryNotifier>,
        config: &SweeperConfig,
    ) -> Self {
        Self {
            pool,
            gateway,
            notifier,
            grace_period: config.grace_period(),
        }
    }

    /// Runs sweep passes forever: once immediately, then on every tick.
    pub async fn run(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // The first tick completes immediately, giving the startup
            // repair pass.
            ticker.tick().await;
            match self.run_once().await {
                Ok(report) => {
                    if report.scanned > 0 {
                        info!(
                            scanned = report.scanned,
                            expired = report.expired,
                            confirmed = report.confirmed,
                            skipped = report.skipped,
                            "sweep pass finished"
                        );
                    }
                }
                Err(err) => error!(error = %err, "sweep pass failed"),
            }
        }
    }

    /// Runs a single sweep pass.
    ///
    /// Safe to run concurrently with itself and with the webhook path: each
    /// registration is resolved in its own transaction behind the
    /// per-registration idempotency guard.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::RegistrationError::Database`] if the scan
    /// itself fails. Per-registration failures are logged and skipped so
    /// one bad row cannot stall reclamation of the rest.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let cutoff = Utc::now() - self.grace_period;
        let stale = store::stale_online_awaiting(&self.pool, cutoff).await?;

        let mut report = SweepReport {
            scanned: stale.len(),
            ..SweepReport::default()
        };

        for registration in stale {
            match self.resolve(&registration).await {
                Ok(Resolution::Expired) => report.expired += 1,
                Ok(Resolution::Confirmed) => report.confirmed += 1,
                Ok(Resolution::Skipped) => report.skipped += 1,
                Err(err) => {
                    report.skipped += 1;
                    error!(
                        registration_id = %registration.id,
                        error = %err,
                        "failed to resolve stale registration; will retry next pass"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Resolves one stale registration.
    async fn resolve(&self, registration: &Registration) -> Result<Resolution> {
        let trigger = match self.probe(registration).await {
            Some(SessionStatus::Completed) => TransitionTrigger::CheckoutCompleted,
            _ => TransitionTrigger::CheckoutExpired,
        };

        let mut tx = self.pool.begin().await.map_err(RegistrationError::from)?;

        // Re-read under lock: the scan snapshot may be stale by now.
        let Some(current) = store::lock_registration(&mut *tx, registration.id).await? else {
            debug!(registration_id = %registration.id, "registration gone before sweep; skipping");
            return Ok(Resolution::Skipped);
        };

        let outcome = match state_machine::apply(&mut *tx, &current, trigger, Utc::now()).await {
            Ok(outcome) => outcome,
            Err(RegistrationError::TransitionConflict { from, trigger }) => {
                warn!(
                    registration_id = %current.id,
                    status = %from,
                    ?trigger,
                    "sweeper trigger refused by transition table"
                );
                return Ok(Resolution::Skipped);
            }
            Err(err) => return Err(err),
        };
        tx.commit().await.map_err(RegistrationError::from)?;

        match outcome {
            TransitionOutcome::Transitioned { next, seats_released } => {
                info!(
                    registration_id = %current.id,
                    event_id = %current.event_id,
                    status = %next,
                    seats_released,
                    "sweeper resolved stale registration"
                );
                if next == crate::state_machine::PaymentStatus::Confirmed {
                    metrics::counter!("registration_sweeps_total", "outcome" => "confirmed")
                        .increment(1);
                    Ok(Resolution::Confirmed)
                } else {
                    metrics::counter!("registration_sweeps_total", "outcome" => "expired")
                        .increment(1);
                    // Best-effort: notification failure must not undo the
                    // already-committed expiration.
                    self.notifier.notify_expired(&current).await;
                    Ok(Resolution::Expired)
                }
            }
            TransitionOutcome::AlreadyTerminal { status } => {
                debug!(
                    registration_id = %current.id,
                    status = %status,
                    "registration resolved before sweeper; no-op"
                );
                metrics::counter!("registration_sweeps_total", "outcome" => "already_terminal")
                    .increment(1);
                Ok(Resolution::Skipped)
            }
        }
    }

    /// Probes the provider-side session state, best-effort.
    async fn probe(&self, registration: &Registration) -> Option<SessionStatus> {
        let correlation_id = registration.checkout_session_id.as_deref()?;
        match self.gateway.session_status(correlation_id).await {
            Ok(status) => Some(status),
            Err(err) => {
                warn!(
                    registration_id = %registration.id,
                    correlation_id,
                    error = %err,
                    "session status probe failed; falling back to expiry"
                );
                None
            }
        }
    }
}

enum Resolution {
    Expired,
    Confirmed,
    Skipped,
}
