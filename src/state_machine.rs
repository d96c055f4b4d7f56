//! Payment state machine for registrations.
//!
//! The transition table is a pure function so that both reconciliation
//! sources (webhook and sweeper) and the synchronous paths all share one
//! entry point and can never disagree. The transactional shells around it
//! live in [`crate::webhook`], [`crate::sweeper`] and [`crate::service`].
//!
//! States and transitions:
//!
//! ```text
//!                ┌──────────────────┐ CheckoutCompleted  ┌───────────┐
//!                │  OnlineAwaiting  ├───────────────────▶│ Confirmed │──┐
//!                └──┬────────────┬──┘                    └───────────┘  │ Cancel
//!   CheckoutExpired │            │ CheckoutFailed              ▲        ▼
//!                   ▼            ▼                             │  ┌───────────┐
//!             ┌─────────┐  ┌────────┐   OfflinePaymentReceived │  │ Cancelled │
//!             │ Expired │  │ Failed │  ┌────────────────────┐  │  └───────────┘
//!             └─────────┘  └────────┘  │  OfflineAwaiting   ├──┘        ▲
//!                                      └─────────┬──────────┘           │
//!                                                └──────────────────────┘
//!                                                        Cancel
//! ```
//!
//! Everything except the two awaiting states is terminal: applying any
//! reconciliation trigger to a terminal state is a no-op
//! ([`Transition::AlreadyTerminal`]), which is what makes duplicate webhooks
//! and overlapping sweeper runs safe. The single exception is explicit
//! cancellation, which stays legal from `Confirmed` until the event date.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use std::fmt;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::Registration;
use crate::{event_lock, store};

/// Payment status of a registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Hosted checkout session opened, waiting for the provider callback.
    OnlineAwaiting,
    /// Waiting for staff to record receipt of the offline cheque.
    OfflineAwaiting,
    /// Payment settled (or event was free); seats are held.
    Confirmed,
    /// Online session abandoned past the grace window; seats released.
    Expired,
    /// Provider reported the payment failed; seats released.
    Failed,
    /// Cancelled by the registering party or staff; seats released.
    Cancelled,
}

impl PaymentStatus {
    /// Returns `true` for states the reconciliation paths treat as final:
    /// provider callbacks and sweeper passes are no-ops on these. The one
    /// non-reconciliation exception is explicit cancellation, which remains
    /// legal from `Confirmed` until the event date.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::OnlineAwaiting | Self::OfflineAwaiting)
    }

    /// Returns `true` for states whose seats count toward event capacity.
    ///
    /// This set defines the reserved-seat sum: awaiting registrations hold
    /// their seats until resolved, so the three non-released states count.
    #[must_use]
    pub const fn holds_seats(&self) -> bool {
        matches!(
            self,
            Self::OnlineAwaiting | Self::OfflineAwaiting | Self::Confirmed
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OnlineAwaiting => "ONLINE_AWAITING",
            Self::OfflineAwaiting => "OFFLINE_AWAITING",
            Self::Confirmed => "CONFIRMED",
            Self::Expired => "EXPIRED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Trigger for a payment status transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionTrigger {
    /// Provider reported the checkout session completed (webhook), or the
    /// sweeper found a provider-side completed session during
    /// reconciliation.
    CheckoutCompleted,
    /// Provider reported the session expired, or the sweeper found the
    /// registration past the grace window without confirmation.
    CheckoutExpired,
    /// Provider reported the payment failed.
    CheckoutFailed,
    /// Staff recorded receipt of the offline payment.
    OfflinePaymentReceived,
    /// Explicit cancellation by the registering party or staff.
    Cancel,
}

/// Outcome of consulting the transition table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The trigger is legal from the current state.
    Apply {
        /// State to move to.
        next: PaymentStatus,
        /// Whether the transition frees this registration's seats (child
        /// rows are deleted exactly once, in the same transaction).
        releases_seats: bool,
        /// Whether `confirmed_at` is stamped by this transition.
        sets_confirmed_at: bool,
    },
    /// The registration is already terminal; the trigger is a no-op.
    AlreadyTerminal,
    /// The trigger is not legal from the current (awaiting) state. With the
    /// idempotency guards in place this is unreachable from the
    /// reconciliation paths; reaching it indicates a missing guard.
    Conflict,
}

/// Consults the transition table for `current` + `trigger`.
///
/// Pure and total: every `(state, trigger)` pairing resolves to exactly one
/// of the three outcomes, and terminal states absorb every trigger.
#[must_use]
pub const fn transition(current: PaymentStatus, trigger: TransitionTrigger) -> Transition {
    use PaymentStatus as S;
    use TransitionTrigger as T;

    match (current, trigger) {
        (S::OnlineAwaiting, T::CheckoutCompleted) => Transition::Apply {
            next: S::Confirmed,
            releases_seats: false,
            sets_confirmed_at: true,
        },
        (S::OnlineAwaiting, T::CheckoutExpired) => Transition::Apply {
            next: S::Expired,
            releases_seats: true,
            sets_confirmed_at: false,
        },
        (S::OnlineAwaiting, T::CheckoutFailed) => Transition::Apply {
            next: S::Failed,
            releases_seats: true,
            sets_confirmed_at: false,
        },
        (S::OfflineAwaiting, T::OfflinePaymentReceived) => Transition::Apply {
            next: S::Confirmed,
            releases_seats: false,
            sets_confirmed_at: true,
        },
        // Confirmed is terminal for the reconciliation triggers but still
        // admits explicit cancellation while policy allows it.
        (S::OfflineAwaiting | S::Confirmed, T::Cancel) => Transition::Apply {
            next: S::Cancelled,
            releases_seats: true,
            sets_confirmed_at: false,
        },
        _ if current.is_terminal() => Transition::AlreadyTerminal,
        _ => Transition::Conflict,
    }
}

/// Outcome of applying a trigger to a persisted registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The transition was applied and committed by the caller's
    /// transaction.
    Transitioned {
        /// The state moved to.
        next: PaymentStatus,
        /// Seats released by this transition (0 unless it was a releasing
        /// transition).
        seats_released: u64,
    },
    /// The registration was already terminal; nothing changed.
    AlreadyTerminal {
        /// The terminal status found.
        status: PaymentStatus,
    },
}

/// Applies `trigger` to a registration inside the caller's transaction.
///
/// This is the single idempotent entry point shared by the webhook
/// reconciler, the expiration sweeper and the synchronous cancel/confirm
/// paths, so the reconciliation sources can never disagree. The status
/// update is guarded by the pre-transition state; a releasing transition
/// deletes the child rows and recomputes the event lock in the same
/// transaction, exactly once.
///
/// Callers are expected to hold a row lock on the registration (see
/// [`store::lock_registration`]); the guard still makes a lost race a
/// no-op rather than a double release.
///
/// # Errors
///
/// - [`crate::error::RegistrationError::TransitionConflict`] — the table
///   refuses the trigger from the current state. Unreachable when the
///   callers' guards hold; reconciliation shells convert it to an
///   acknowledgement, the synchronous paths to a user-facing refusal.
/// - [`crate::error::RegistrationError::Database`] — a statement failed;
///   the caller's transaction should roll back.
pub async fn apply(
    conn: &mut PgConnection,
    registration: &Registration,
    trigger: TransitionTrigger,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome> {
    let (next, releases_seats, sets_confirmed_at) =
        match transition(registration.payment_status, trigger) {
            Transition::Apply {
                next,
                releases_seats,
                sets_confirmed_at,
            } => (next, releases_seats, sets_confirmed_at),
            Transition::AlreadyTerminal => {
                debug!(
                    registration_id = %registration.id,
                    status = %registration.payment_status,
                    ?trigger,
                    "trigger on terminal registration ignored"
                );
                return Ok(TransitionOutcome::AlreadyTerminal {
                    status: registration.payment_status,
                });
            }
            Transition::Conflict => {
                warn!(
                    registration_id = %registration.id,
                    status = %registration.payment_status,
                    ?trigger,
                    "illegal transition refused"
                );
                return Err(crate::error::RegistrationError::TransitionConflict {
                    from: registration.payment_status,
                    trigger,
                });
            }
        };

    let confirmed_at = sets_confirmed_at.then_some(now);
    let applied = store::apply_status(
        &mut *conn,
        registration.id,
        registration.payment_status,
        next,
        confirmed_at,
    )
    .await?;

    if !applied {
        // A concurrent transaction won the race despite the guard; treat
        // exactly like the terminal short-circuit.
        warn!(
            registration_id = %registration.id,
            status = %registration.payment_status,
            ?trigger,
            "transition lost guarded update race; no-op"
        );
        return Ok(TransitionOutcome::AlreadyTerminal {
            status: registration.payment_status,
        });
    }

    let seats_released = if releases_seats {
        let released = store::release_children(&mut *conn, registration.id).await?;
        event_lock::recompute(&mut *conn, registration.event_id).await?;
        released
    } else {
        event_lock::recompute(&mut *conn, registration.event_id).await?;
        0
    };

    debug!(
        registration_id = %registration.id,
        from = %registration.payment_status,
        to = %next,
        seats_released,
        "payment status transitioned"
    );

    Ok(TransitionOutcome::Transitioned {
        next,
        seats_released,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_STATUSES: [PaymentStatus; 6] = [
        PaymentStatus::OnlineAwaiting,
        PaymentStatus::OfflineAwaiting,
        PaymentStatus::Confirmed,
        PaymentStatus::Expired,
        PaymentStatus::Failed,
        PaymentStatus::Cancelled,
    ];

    const ALL_TRIGGERS: [TransitionTrigger; 5] = [
        TransitionTrigger::CheckoutCompleted,
        TransitionTrigger::CheckoutExpired,
        TransitionTrigger::CheckoutFailed,
        TransitionTrigger::OfflinePaymentReceived,
        TransitionTrigger::Cancel,
    ];

    #[test]
    fn online_awaiting_transitions() {
        assert_eq!(
            transition(
                PaymentStatus::OnlineAwaiting,
                TransitionTrigger::CheckoutCompleted
            ),
            Transition::Apply {
                next: PaymentStatus::Confirmed,
                releases_seats: false,
                sets_confirmed_at: true,
            }
        );
        assert_eq!(
            transition(
                PaymentStatus::OnlineAwaiting,
                TransitionTrigger::CheckoutExpired
            ),
            Transition::Apply {
                next: PaymentStatus::Expired,
                releases_seats: true,
                sets_confirmed_at: false,
            }
        );
        assert_eq!(
            transition(
                PaymentStatus::OnlineAwaiting,
                TransitionTrigger::CheckoutFailed
            ),
            Transition::Apply {
                next: PaymentStatus::Failed,
                releases_seats: true,
                sets_confirmed_at: false,
            }
        );
    }

    #[test]
    fn offline_awaiting_transitions() {
        assert_eq!(
            transition(
                PaymentStatus::OfflineAwaiting,
                TransitionTrigger::OfflinePaymentReceived
            ),
            Transition::Apply {
                next: PaymentStatus::Confirmed,
                releases_seats: false,
                sets_confirmed_at: true,
            }
        );
        assert_eq!(
            transition(PaymentStatus::OfflineAwaiting, TransitionTrigger::Cancel),
            Transition::Apply {
                next: PaymentStatus::Cancelled,
                releases_seats: true,
                sets_confirmed_at: false,
            }
        );
    }

    #[test]
    fn confirmed_can_only_cancel() {
        assert_eq!(
            transition(PaymentStatus::Confirmed, TransitionTrigger::Cancel),
            Transition::Apply {
                next: PaymentStatus::Cancelled,
                releases_seats: true,
                sets_confirmed_at: false,
            }
        );
        // Confirmed is terminal for every other trigger.
        assert_eq!(
            transition(
                PaymentStatus::Confirmed,
                TransitionTrigger::CheckoutCompleted
            ),
            Transition::AlreadyTerminal
        );
    }

    #[test]
    fn illegal_awaiting_pairings_conflict() {
        assert_eq!(
            transition(
                PaymentStatus::OnlineAwaiting,
                TransitionTrigger::OfflinePaymentReceived
            ),
            Transition::Conflict
        );
        // Cancel is not in the table for OnlineAwaiting; the sweeper owns
        // reclamation of abandoned online sessions.
        assert_eq!(
            transition(PaymentStatus::OnlineAwaiting, TransitionTrigger::Cancel),
            Transition::Conflict
        );
        assert_eq!(
            transition(
                PaymentStatus::OfflineAwaiting,
                TransitionTrigger::CheckoutCompleted
            ),
            Transition::Conflict
        );
    }

    #[test]
    fn seat_release_exactly_on_releasing_transitions() {
        let mut releasing = 0;
        for status in ALL_STATUSES {
            for trigger in ALL_TRIGGERS {
                if let Transition::Apply {
                    next,
                    releases_seats,
                    ..
                } = transition(status, trigger)
                {
                    assert_eq!(releases_seats, !next.holds_seats());
                    if releases_seats {
                        releasing += 1;
                    }
                }
            }
        }
        // OnlineAwaiting→{Expired,Failed}, OfflineAwaiting→Cancelled,
        // Confirmed→Cancelled.
        assert_eq!(releasing, 4);
    }

    fn arb_status() -> impl Strategy<Value = PaymentStatus> {
        prop::sample::select(ALL_STATUSES.to_vec())
    }

    fn arb_trigger() -> impl Strategy<Value = TransitionTrigger> {
        prop::sample::select(ALL_TRIGGERS.to_vec())
    }

    proptest! {
        /// Terminal states absorb every trigger: this is the idempotency
        /// guarantee duplicate webhooks and overlapping sweeper runs rely
        /// on.
        #[test]
        fn terminal_states_absorb_all_triggers(
            status in arb_status(),
            trigger in arb_trigger(),
        ) {
            prop_assume!(status.is_terminal() && !(status == PaymentStatus::Confirmed && trigger == TransitionTrigger::Cancel));
            prop_assert_eq!(transition(status, trigger), Transition::AlreadyTerminal);
        }

        /// A trigger can never fire twice: once applied, the resulting
        /// state absorbs or refuses the same trigger, so seats are never
        /// released a second time.
        #[test]
        fn transitions_never_apply_twice(
            status in arb_status(),
            trigger in arb_trigger(),
        ) {
            if let Transition::Apply { next, .. } = transition(status, trigger) {
                prop_assert!(
                    !matches!(transition(next, trigger), Transition::Apply { .. }),
                    "{:?} applied twice from {:?}", trigger, status,
                );
            }
        }

        /// Every pairing resolves; the table is total.
        #[test]
        fn table_is_total(status in arb_status(), trigger in arb_trigger()) {
            let _ = transition(status, trigger);
        }
    }
}
