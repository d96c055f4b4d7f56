//! Registration store: all row mutations for registrations and their
//! children.
//!
//! This module is the only writer of registration and payment-status
//! fields. Every function runs on the caller's connection so that status
//! transitions, child-row deletion and the event-lock recompute share one
//! transaction.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::Result;
use crate::state_machine::PaymentStatus;
use crate::types::{ChildId, EventId, ParentId, PaymentMethod, Registration, RegistrationId};

/// A registration to insert, together with the children it reserves seats
/// for.
#[derive(Clone, Debug)]
pub struct NewRegistration {
    /// Registration identifier (caller-generated).
    pub id: RegistrationId,
    /// Event being registered for.
    pub event_id: EventId,
    /// The registering parent.
    pub parent_id: ParentId,
    /// Chosen payment method.
    pub payment_method: PaymentMethod,
    /// Initial status (`Confirmed` for free events, an awaiting state
    /// otherwise).
    pub payment_status: PaymentStatus,
    /// Children to reserve seats for; one seat each.
    pub children: Vec<ChildId>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

const REGISTRATION_COLUMNS: &str = "id, event_id, parent_id, payment_method, payment_status, \
     checkout_session_id, created_at, confirmed_at";

/// Inserts the registration row and its child rows.
///
/// # Errors
///
/// Returns [`crate::error::RegistrationError::Database`] on failure
/// (including a duplicate registration id).
pub async fn insert_registration(conn: &mut PgConnection, new: &NewRegistration) -> Result<()> {
    let confirmed_at = if new.payment_status == PaymentStatus::Confirmed {
        Some(new.created_at)
    } else {
        None
    };

    sqlx::query(
        "INSERT INTO registrations
             (id, event_id, parent_id, payment_method, payment_status, created_at, confirmed_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(new.id)
    .bind(new.event_id)
    .bind(new.parent_id)
    .bind(new.payment_method)
    .bind(new.payment_status)
    .bind(new.created_at)
    .bind(confirmed_at)
    .execute(&mut *conn)
    .await?;

    let child_ids: Vec<Uuid> = new.children.iter().map(|c| *c.as_uuid()).collect();
    sqlx::query(
        "INSERT INTO registration_children (registration_id, child_id)
         SELECT $1, unnest($2::uuid[])",
    )
    .bind(new.id)
    .bind(&child_ids)
    .execute(conn)
    .await?;

    Ok(())
}

/// Persists the checkout session correlation id on a registration.
///
/// Write-once: the update only applies while the column is still `NULL`,
/// establishing the 1:1 correlation-id → registration mapping. Returns
/// `true` if the id was written.
///
/// # Errors
///
/// Returns [`crate::error::RegistrationError::Database`] on failure.
pub async fn attach_checkout_session(
    conn: &mut PgConnection,
    id: RegistrationId,
    correlation_id: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE registrations
         SET checkout_session_id = $2
         WHERE id = $1 AND checkout_session_id IS NULL",
    )
    .bind(id)
    .bind(correlation_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Locks and returns a registration by id.
///
/// The `FOR UPDATE` lock serializes the webhook, sweeper and cancellation
/// paths per registration: whichever transaction commits first wins and the
/// others observe the terminal state.
///
/// # Errors
///
/// Returns [`crate::error::RegistrationError::Database`] on failure.
pub async fn lock_registration(
    conn: &mut PgConnection,
    id: RegistrationId,
) -> Result<Option<Registration>> {
    let registration = sqlx::query_as::<_, Registration>(&format!(
        "SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?;

    Ok(registration)
}

/// Locks and returns a registration by its checkout correlation id.
///
/// # Errors
///
/// Returns [`crate::error::RegistrationError::Database`] on failure.
pub async fn lock_by_correlation_id(
    conn: &mut PgConnection,
    correlation_id: &str,
) -> Result<Option<Registration>> {
    let registration = sqlx::query_as::<_, Registration>(&format!(
        "SELECT {REGISTRATION_COLUMNS} FROM registrations
         WHERE checkout_session_id = $1 FOR UPDATE"
    ))
    .bind(correlation_id)
    .fetch_optional(conn)
    .await?;

    Ok(registration)
}

/// Applies a status transition guarded by the expected prior status.
///
/// The `WHERE payment_status = $from` guard makes the transition atomic and
/// exactly-once even without a prior row lock: a concurrent transaction
/// that already moved the row leaves this update matching zero rows.
/// Returns `true` if the transition was applied.
///
/// # Errors
///
/// Returns [`crate::error::RegistrationError::Database`] on failure.
pub async fn apply_status(
    conn: &mut PgConnection,
    id: RegistrationId,
    from: PaymentStatus,
    to: PaymentStatus,
    confirmed_at: Option<DateTime<Utc>>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE registrations
         SET payment_status = $3, confirmed_at = COALESCE($4, confirmed_at)
         WHERE id = $1 AND payment_status = $2",
    )
    .bind(id)
    .bind(from)
    .bind(to)
    .bind(confirmed_at)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Deletes a registration's child rows, releasing its seats.
///
/// Called exactly once per registration, in the same transaction as the
/// terminal status transition that guards it. Returns the number of seats
/// released.
///
/// # Errors
///
/// Returns [`crate::error::RegistrationError::Database`] on failure.
pub async fn release_children(conn: &mut PgConnection, id: RegistrationId) -> Result<u64> {
    let result = sqlx::query("DELETE FROM registration_children WHERE registration_id = $1")
        .bind(id)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}

/// Fetches a registration without locking (read-side).
///
/// # Errors
///
/// Returns [`crate::error::RegistrationError::Database`] on failure.
pub async fn fetch_registration(
    pool: &PgPool,
    id: RegistrationId,
) -> Result<Option<Registration>> {
    let registration = sqlx::query_as::<_, Registration>(&format!(
        "SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(registration)
}

/// The children a registration currently reserves seats for.
///
/// # Errors
///
/// Returns [`crate::error::RegistrationError::Database`] on failure.
pub async fn children_of(pool: &PgPool, id: RegistrationId) -> Result<Vec<ChildId>> {
    let rows: Vec<(ChildId,)> = sqlx::query_as(
        "SELECT child_id FROM registration_children WHERE registration_id = $1 ORDER BY child_id",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Sweeper scan: online-awaiting registrations created before `cutoff`.
///
/// Read with ordinary isolation; the per-registration guarded transition is
/// what makes acting on a stale snapshot safe.
///
/// # Errors
///
/// Returns [`crate::error::RegistrationError::Database`] on failure.
pub async fn stale_online_awaiting(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Registration>> {
    let rows = sqlx::query_as::<_, Registration>(&format!(
        "SELECT {REGISTRATION_COLUMNS} FROM registrations
         WHERE payment_status = 'ONLINE_AWAITING' AND created_at < $1
         ORDER BY created_at"
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
