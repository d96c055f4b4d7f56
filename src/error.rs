//! Error types for registration and reconciliation operations.

use crate::state_machine::{PaymentStatus, TransitionTrigger};
use thiserror::Error;

/// Result type alias for registration operations.
pub type Result<T> = std::result::Result<T, RegistrationError>;

/// Error taxonomy for the registration engine.
///
/// The synchronous registration path surfaces these to its caller
/// unmodified. The reconciliation paths (webhook, sweeper) catch them at
/// the outermost handler and convert them to an acknowledgement plus a log
/// line, because their upstream retry behavior cannot distinguish "please
/// retry" from "permanently invalid".
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistrationError {
    // ═══════════════════════════════════════════════════════════
    // Admission Errors (user-correctable, no partial state written)
    // ═══════════════════════════════════════════════════════════

    /// The requested event does not exist.
    #[error("Event not found")]
    EventNotFound,

    /// The event has already started; registration and cancellation are
    /// closed.
    #[error("Event has already started")]
    EventAlreadyPast,

    /// The live reserved-seat sum leaves too few seats for this request.
    #[error("Capacity exceeded: requested {requested}, available {available}")]
    CapacityExceeded {
        /// Seats the caller asked for.
        requested: u32,
        /// Seats actually left.
        available: u32,
    },

    /// A registration must reserve at least one seat.
    #[error("Registration must include at least one child")]
    NoChildren,

    // ═══════════════════════════════════════════════════════════
    // Reconciliation Errors
    // ═══════════════════════════════════════════════════════════

    /// A provider notification referenced a correlation id this engine
    /// never created (or cleaned up long ago). Acknowledged, never retried.
    #[error("Unknown correlation id")]
    UnknownCorrelationId,

    /// Idempotency short-circuit: the registration already reached a
    /// terminal state. Not a failure; logged at debug level at most.
    #[error("Registration is already in terminal state {status:?}")]
    AlreadyTerminal {
        /// The terminal status found.
        status: PaymentStatus,
    },

    /// A trigger arrived that the transition table does not permit from the
    /// current state. Unreachable when the idempotency guards hold; treated
    /// as a fatal assertion in tests.
    #[error("Illegal transition: {trigger:?} from {from:?}")]
    TransitionConflict {
        /// State the registration was in.
        from: PaymentStatus,
        /// Trigger that could not be applied.
        trigger: TransitionTrigger,
    },

    // ═══════════════════════════════════════════════════════════
    // Gateway & Policy Errors
    // ═══════════════════════════════════════════════════════════

    /// The hosted checkout processor could not open a session; the whole
    /// reservation transaction rolls back and the caller may retry.
    #[error("Checkout gateway unavailable: {reason}")]
    GatewayUnavailable {
        /// Gateway-reported reason.
        reason: String,
    },

    /// The caller is not allowed to act on this registration.
    #[error("Caller is not permitted to modify this registration")]
    NotPermitted,

    /// The registration exists but is not in a state the requested
    /// operation applies to (e.g. cancelling an online-awaiting
    /// registration, confirming a non-offline one).
    #[error("Operation not applicable in status {status:?}")]
    NotApplicable {
        /// Current status of the registration.
        status: PaymentStatus,
    },

    /// The registration to act on does not exist.
    #[error("Registration not found")]
    RegistrationNotFound,

    // ═══════════════════════════════════════════════════════════
    // System Errors
    // ═══════════════════════════════════════════════════════════

    /// Storage operation failed.
    #[error("Database error: {0}")]
    Database(String),
}

impl RegistrationError {
    /// Returns `true` if this error is correctable by the caller (as
    /// opposed to a system failure).
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::EventNotFound
                | Self::EventAlreadyPast
                | Self::CapacityExceeded { .. }
                | Self::NoChildren
                | Self::NotPermitted
                | Self::NotApplicable { .. }
                | Self::RegistrationNotFound
        )
    }

    /// Returns `true` if a reconciliation channel should acknowledge this
    /// error instead of asking its sender to retry.
    #[must_use]
    pub const fn is_acknowledgeable(&self) -> bool {
        matches!(
            self,
            Self::UnknownCorrelationId | Self::AlreadyTerminal { .. }
        )
    }
}

impl From<sqlx::Error> for RegistrationError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_exceeded_is_user_error() {
        let err = RegistrationError::CapacityExceeded {
            requested: 3,
            available: 1,
        };
        assert!(err.is_user_error());
        assert!(!err.is_acknowledgeable());
    }

    #[test]
    fn admission_errors_stay_distinguishable() {
        // UI messaging differs between these three; they must never collapse.
        assert_ne!(
            RegistrationError::EventNotFound,
            RegistrationError::EventAlreadyPast
        );
        assert_ne!(
            RegistrationError::EventNotFound,
            RegistrationError::CapacityExceeded {
                requested: 1,
                available: 0
            }
        );
    }

    #[test]
    fn already_terminal_is_acknowledgeable() {
        let err = RegistrationError::AlreadyTerminal {
            status: PaymentStatus::Expired,
        };
        assert!(err.is_acknowledgeable());
        assert!(!err.is_user_error());
    }
}
