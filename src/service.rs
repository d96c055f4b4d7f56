//! Registration service: the engine's synchronous API.
//!
//! One logical operation per inbound request. Every operation runs in a
//! single transaction that re-checks live capacity, mutates the rows and
//! rewrites the derived event-lock flag, so no reader ever observes a seat
//! count inconsistent with the open/closed cache for longer than one
//! commit.

use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::checkout::{self, CheckoutGateway, OpenSessionRequest};
use crate::config::CheckoutConfig;
use crate::error::{RegistrationError, Result};
use crate::state_machine::{self, PaymentStatus, TransitionOutcome, TransitionTrigger};
use crate::store::{self, NewRegistration};
use crate::types::{ChildId, EventId, Money, ParentId, PaymentMethod, RegistrationId, StaffId};
use crate::{capacity, event_lock};

/// A validated registration request, as handed over by the API layer.
#[derive(Clone, Debug)]
pub struct RegisterRequest {
    /// Event to register for.
    pub event_id: EventId,
    /// The authenticated registering parent.
    pub parent_id: ParentId,
    /// Children to reserve seats for; one seat each.
    pub child_ids: Vec<ChildId>,
    /// Chosen payment method.
    pub payment_method: PaymentMethod,
}

/// Result of a successful registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationOutcome {
    /// The created registration.
    pub registration_id: RegistrationId,
    /// Hosted checkout URL; present only for online-paid registrations.
    pub checkout_url: Option<String>,
}

/// The reservation and payment reconciliation engine's front door.
#[derive(Clone)]
pub struct RegistrationService {
    pool: PgPool,
    gateway: Arc<dyn CheckoutGateway>,
    checkout: CheckoutConfig,
}

impl RegistrationService {
    /// Creates a service over the given pool and checkout gateway.
    #[must_use]
    pub const fn new(
        pool: PgPool,
        gateway: Arc<dyn CheckoutGateway>,
        checkout: CheckoutConfig,
    ) -> Self {
        Self {
            pool,
            gateway,
            checkout,
        }
    }

    /// Registers children for an event.
    ///
    /// Runs entirely inside one transaction: the live capacity check (never
    /// the cached `open` flag), the row insertion, the checkout session
    /// opening for online payment, and the event-lock recompute. A gateway
    /// failure rolls everything back — no seat is ever held for a session
    /// that was never created.
    ///
    /// Free events (price zero) skip both awaiting states: the registration
    /// is created directly `Confirmed`, with no gateway call and no
    /// correlation id.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::NoChildren`] — empty child list.
    /// - [`RegistrationError::EventNotFound`] /
    ///   [`RegistrationError::EventAlreadyPast`] /
    ///   [`RegistrationError::CapacityExceeded`] — admission refused.
    /// - [`RegistrationError::GatewayUnavailable`] — the checkout session
    ///   could not be opened; the caller may retry the whole registration.
    /// - [`RegistrationError::Database`] — storage failure.
    #[instrument(skip(self, request), fields(event_id = %request.event_id, parent_id = %request.parent_id))]
    pub async fn register(&self, request: RegisterRequest) -> Result<RegistrationOutcome> {
        let mut children = request.child_ids;
        children.sort_unstable();
        children.dedup();
        if children.is_empty() {
            return Err(RegistrationError::NoChildren);
        }
        let seat_count = u32::try_from(children.len()).map_err(|_| {
            RegistrationError::CapacityExceeded {
                requested: u32::MAX,
                available: 0,
            }
        })?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(RegistrationError::from)?;

        let event = capacity::try_reserve(&mut *tx, request.event_id, seat_count, now).await?;

        let payment_status = if event.price_cents.is_free() {
            PaymentStatus::Confirmed
        } else {
            match request.payment_method {
                PaymentMethod::Offline => PaymentStatus::OfflineAwaiting,
                PaymentMethod::Online => PaymentStatus::OnlineAwaiting,
            }
        };

        let registration_id = RegistrationId::new();
        store::insert_registration(
            &mut *tx,
            &NewRegistration {
                id: registration_id,
                event_id: event.id,
                parent_id: request.parent_id,
                payment_method: request.payment_method,
                payment_status,
                children,
                created_at: now,
            },
        )
        .await?;

        let checkout_url = if payment_status == PaymentStatus::OnlineAwaiting {
            let amount = Money::from_cents(
                event
                    .price_cents
                    .cents()
                    .saturating_mul(i64::from(seat_count)),
            );
            let session = checkout::open_session_with_retry(
                self.gateway.as_ref(),
                OpenSessionRequest {
                    registration_id,
                    amount,
                    success_url: self.checkout.success_url.clone(),
                    cancel_url: self.checkout.cancel_url.clone(),
                },
                self.checkout.open_attempts,
                std::time::Duration::from_millis(self.checkout.retry_delay_ms),
            )
            .await
            .map_err(|err| RegistrationError::GatewayUnavailable {
                reason: err.to_string(),
            })?;
            // The `?` above drops `tx`, rolling back the provisional
            // reservation.

            store::attach_checkout_session(&mut *tx, registration_id, &session.correlation_id)
                .await?;
            Some(session.checkout_url)
        } else {
            None
        };

        event_lock::recompute(&mut *tx, event.id).await?;
        tx.commit().await.map_err(RegistrationError::from)?;

        info!(
            %registration_id,
            event_id = %event.id,
            seats = seat_count,
            status = %payment_status,
            online = checkout_url.is_some(),
            "registration created"
        );
        metrics::counter!("registrations_created_total", "status" => payment_status.to_string())
            .increment(1);

        Ok(RegistrationOutcome {
            registration_id,
            checkout_url,
        })
    }

    /// Cancels a registration, releasing its seats.
    ///
    /// Permitted to the registering parent while the event has not started.
    /// Cancelling an already-cancelled registration is an idempotent no-op.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::RegistrationNotFound`] — no such registration.
    /// - [`RegistrationError::NotPermitted`] — caller is not the
    ///   registering parent.
    /// - [`RegistrationError::EventAlreadyPast`] — the event already
    ///   started; cancellation is closed.
    /// - [`RegistrationError::NotApplicable`] — the registration is in a
    ///   state cancellation does not apply to (online payment pending, or
    ///   already expired/failed).
    /// - [`RegistrationError::Database`] — storage failure.
    #[instrument(skip(self))]
    pub async fn cancel(&self, registration_id: RegistrationId, caller: ParentId) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(RegistrationError::from)?;

        let registration = store::lock_registration(&mut *tx, registration_id)
            .await?
            .ok_or(RegistrationError::RegistrationNotFound)?;

        if registration.parent_id != caller {
            return Err(RegistrationError::NotPermitted);
        }

        let event = capacity::lock_event(&mut *tx, registration.event_id).await?;
        if event.has_started(now) {
            return Err(RegistrationError::EventAlreadyPast);
        }

        match state_machine::apply(&mut *tx, &registration, TransitionTrigger::Cancel, now).await {
            Ok(TransitionOutcome::Transitioned { .. }) => {
                tx.commit().await.map_err(RegistrationError::from)?;
                info!(%registration_id, event_id = %event.id, "registration cancelled");
                metrics::counter!("registrations_cancelled_total").increment(1);
                Ok(())
            }
            Ok(TransitionOutcome::AlreadyTerminal {
                status: PaymentStatus::Cancelled,
            }) => Ok(()),
            Ok(TransitionOutcome::AlreadyTerminal { status })
            | Err(RegistrationError::TransitionConflict { from: status, .. }) => {
                Err(RegistrationError::NotApplicable { status })
            }
            Err(err) => Err(err),
        }
    }

    /// Records receipt of an offline payment, confirming the registration.
    ///
    /// Staff authorization happens in the API layer; the staff id is taken
    /// for the audit log. Re-confirming a confirmed registration is an
    /// idempotent no-op.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::RegistrationNotFound`] — no such registration.
    /// - [`RegistrationError::NotApplicable`] — the registration is not
    ///   awaiting an offline payment.
    /// - [`RegistrationError::Database`] — storage failure.
    #[instrument(skip(self))]
    pub async fn confirm_offline(
        &self,
        registration_id: RegistrationId,
        staff: StaffId,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(RegistrationError::from)?;

        let registration = store::lock_registration(&mut *tx, registration_id)
            .await?
            .ok_or(RegistrationError::RegistrationNotFound)?;

        match state_machine::apply(
            &mut *tx,
            &registration,
            TransitionTrigger::OfflinePaymentReceived,
            now,
        )
        .await
        {
            Ok(TransitionOutcome::Transitioned { .. }) => {
                tx.commit().await.map_err(RegistrationError::from)?;
                info!(%registration_id, staff_id = %staff, "offline payment recorded");
                metrics::counter!("registrations_confirmed_total", "method" => "offline")
                    .increment(1);
                Ok(())
            }
            Ok(TransitionOutcome::AlreadyTerminal {
                status: PaymentStatus::Confirmed,
            }) => Ok(()),
            Ok(TransitionOutcome::AlreadyTerminal { status })
            | Err(RegistrationError::TransitionConflict { from: status, .. }) => {
                Err(RegistrationError::NotApplicable { status })
            }
            Err(err) => Err(err),
        }
    }
}
