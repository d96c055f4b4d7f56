//! Domain types for the registration engine.
//!
//! Value objects and row structs shared across the engine: identifier
//! newtypes, the cents-based `Money` value object, the payment method, and
//! the persisted `EventRecord` / `Registration` shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::state_machine::PaymentStatus;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random `EventId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `EventId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct RegistrationId(Uuid);

impl RegistrationId {
    /// Creates a new random `RegistrationId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `RegistrationId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RegistrationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a registering parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct ParentId(Uuid);

impl ParentId {
    /// Creates a new random `ParentId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `ParentId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ParentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a child.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct ChildId(Uuid);

impl ChildId {
    /// Creates a new random `ChildId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `ChildId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ChildId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a staff member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct StaffId(Uuid);

impl StaffId {
    /// Creates a new random `StaffId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `StaffId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for StaffId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StaffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Money Value Object (cents-based to avoid floating point errors)
// ============================================================================

/// Represents money in minor currency units (cents).
///
/// Stored as a signed 64-bit integer to match the `BIGINT` column it is
/// persisted in; amounts are never negative in practice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct Money(i64);

impl Money {
    /// A zero amount (free event).
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from cents.
    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Returns the amount in cents.
    #[must_use]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// Returns `true` when the amount is zero.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, (self.0 % 100).abs())
    }
}

// ============================================================================
// Payment Method
// ============================================================================

/// How a registration is paid: by cheque at the desk, or through the hosted
/// checkout processor. The two methods are mutually exclusive per
/// registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    /// Offline cheque payment, confirmed manually by staff.
    Offline,
    /// Online payment through a hosted checkout session.
    Online,
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "OFFLINE"),
            Self::Online => write!(f, "ONLINE"),
        }
    }
}

// ============================================================================
// Persisted rows
// ============================================================================

/// An event row as the engine sees it.
///
/// Only the `open` flag is mutated by this engine (through the event lock
/// controller); the remaining fields are owned by the event CRUD
/// collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRecord {
    /// Event identifier.
    pub id: EventId,
    /// Display title.
    pub title: String,
    /// Start of the event window.
    pub starts_at: DateTime<Utc>,
    /// End of the event window.
    pub ends_at: DateTime<Utc>,
    /// Price per seat in cents; zero means free.
    pub price_cents: Money,
    /// Seat capacity; `None` means unlimited.
    pub capacity: Option<i32>,
    /// Derived open/closed cache, never consulted for admission.
    pub open: bool,
}

impl EventRecord {
    /// Returns `true` when the event has already started.
    #[must_use]
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now
    }
}

/// A registration row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Registration {
    /// Registration identifier.
    pub id: RegistrationId,
    /// Event this registration reserves seats for.
    pub event_id: EventId,
    /// The registering parent.
    pub parent_id: ParentId,
    /// Payment method chosen at registration time.
    pub payment_method: PaymentMethod,
    /// Current payment state-machine status.
    pub payment_status: PaymentStatus,
    /// Correlation id of the hosted checkout session; present only for
    /// online registrations, written exactly once.
    pub checkout_session_id: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Set when the registration reaches `Confirmed`.
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_display_renders_cents() {
        assert_eq!(Money::from_cents(1250).to_string(), "12.50");
        assert_eq!(Money::from_cents(5).to_string(), "0.05");
        assert!(Money::ZERO.is_free());
        assert!(!Money::from_cents(1).is_free());
    }

    #[test]
    fn ids_are_distinct_and_printable() {
        let a = RegistrationId::new();
        let b = RegistrationId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_uuid().to_string());
    }
}
