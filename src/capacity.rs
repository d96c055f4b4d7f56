//! Capacity ledger: the live reserved-seat sum and the atomic
//! check-and-reserve gate.
//!
//! Capacity accounting is never an in-process counter. The reserved-seat
//! sum is computed from the rows inside the same transaction that inserts
//! the registration, behind a row lock on the event, so two simultaneous
//! requests for the last seat serialize and exactly one wins.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::error::{RegistrationError, Result};
use crate::types::{EventId, EventRecord};

/// The live reserved-seat sum for an event.
///
/// Counts children across registrations whose payment status still holds
/// seats (`ONLINE_AWAITING`, `OFFLINE_AWAITING`, `CONFIRMED`). This is the
/// single source of truth for admission; the `events.open` flag is only a
/// cache derived from it.
///
/// # Errors
///
/// Returns [`RegistrationError::Database`] if the query fails.
pub async fn reserved_seats(conn: &mut PgConnection, event_id: EventId) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*)
         FROM registration_children rc
         JOIN registrations r ON r.id = rc.registration_id
         WHERE r.event_id = $1
           AND r.payment_status IN ('ONLINE_AWAITING', 'OFFLINE_AWAITING', 'CONFIRMED')",
    )
    .bind(event_id)
    .fetch_one(conn)
    .await?;

    Ok(count)
}

/// Locks the event row for the remainder of the enclosing transaction and
/// returns it.
///
/// The `FOR UPDATE` lock is what serializes concurrent reservations against
/// the same event: the sum read after it cannot go stale before commit.
///
/// # Errors
///
/// Returns [`RegistrationError::EventNotFound`] if no such event exists.
pub async fn lock_event(conn: &mut PgConnection, event_id: EventId) -> Result<EventRecord> {
    sqlx::query_as::<_, EventRecord>(
        "SELECT id, title, starts_at, ends_at, price_cents, capacity, open
         FROM events
         WHERE id = $1
         FOR UPDATE",
    )
    .bind(event_id)
    .fetch_optional(conn)
    .await?
    .ok_or(RegistrationError::EventNotFound)
}

/// Atomic "try reserve N seats" gate.
///
/// Must run inside the transaction that inserts the registration rows; the
/// caller owns the insertion. Locks the event, re-checks the live sum
/// (never the cached `open` flag) and admits or rejects. A `NULL` capacity
/// always admits.
///
/// # Errors
///
/// - [`RegistrationError::EventNotFound`] — no such event.
/// - [`RegistrationError::EventAlreadyPast`] — the event already started.
/// - [`RegistrationError::CapacityExceeded`] — too few seats left.
pub async fn try_reserve(
    conn: &mut PgConnection,
    event_id: EventId,
    seat_count: u32,
    now: DateTime<Utc>,
) -> Result<EventRecord> {
    let event = lock_event(&mut *conn, event_id).await?;

    if event.has_started(now) {
        return Err(RegistrationError::EventAlreadyPast);
    }

    if let Some(capacity) = event.capacity {
        let reserved = reserved_seats(&mut *conn, event_id).await?;
        let available = seats_available(capacity, reserved);
        if u64::from(seat_count) > available {
            return Err(RegistrationError::CapacityExceeded {
                requested: seat_count,
                available: u32::try_from(available).unwrap_or(u32::MAX),
            });
        }
    }

    Ok(event)
}

/// Seats still available given a capacity and the live reserved sum.
fn seats_available(capacity: i32, reserved: i64) -> u64 {
    let capacity = i64::from(capacity.max(0));
    u64::try_from(capacity.saturating_sub(reserved)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_math() {
        assert_eq!(seats_available(10, 0), 10);
        assert_eq!(seats_available(10, 10), 0);
        // An over-full event (capacity lowered after the fact) reports zero
        // rather than wrapping.
        assert_eq!(seats_available(10, 12), 0);
        assert_eq!(seats_available(0, 0), 0);
    }
}
