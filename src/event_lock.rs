//! Event lock controller: derives the `events.open` flag from the live
//! reserved-seat sum.
//!
//! The flag is a denormalized cache for read-side queries ("list open
//! events"). It is rewritten at the end of every transaction that can
//! change the sum and is never consulted for admission — that authority
//! belongs solely to [`crate::capacity::try_reserve`].

use sqlx::PgConnection;
use tracing::debug;

use crate::capacity;
use crate::error::{RegistrationError, Result};
use crate::types::EventId;

/// Recomputes `events.open` for one event inside the caller's transaction.
///
/// Locks the event row first so the recompute serializes with concurrent
/// reservations (in the reservation path the same transaction already holds
/// that lock and this re-entry is free).
///
/// # Errors
///
/// Returns [`crate::error::RegistrationError::Database`] if a query fails;
/// a missing event is a no-op (the registration cascade already removed it).
pub async fn recompute(conn: &mut PgConnection, event_id: EventId) -> Result<()> {
    let event = match capacity::lock_event(&mut *conn, event_id).await {
        Ok(event) => event,
        Err(RegistrationError::EventNotFound) => {
            debug!(%event_id, "event vanished before lock recompute; skipping");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let open = match event.capacity {
        None => true,
        Some(capacity) => {
            let reserved = capacity::reserved_seats(&mut *conn, event_id).await?;
            reserved < i64::from(capacity)
        }
    };

    if open != event.open {
        debug!(%event_id, open, "event open flag flipped");
    }

    sqlx::query("UPDATE events SET open = $2 WHERE id = $1")
        .bind(event_id)
        .bind(open)
        .execute(conn)
        .await?;

    Ok(())
}
