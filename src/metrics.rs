//! Business metrics for the registration engine.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `registrations_created_total{status}` - Registrations created by initial status
//! - `registrations_cancelled_total` - Cancellations applied
//! - `registrations_confirmed_total{method}` - Confirmations by payment method
//! - `registration_webhooks_total{outcome}` - Webhook notifications by outcome
//! - `registration_sweeps_total{outcome}` - Sweeper resolutions by outcome

use metrics::describe_counter;

/// Initialize and register all business metrics descriptions.
///
/// This should be called once at application startup, before any metrics
/// are recorded.
pub fn register_business_metrics() {
    describe_counter!(
        "registrations_created_total",
        "Total registrations created, labelled by initial payment status"
    );
    describe_counter!(
        "registrations_cancelled_total",
        "Total registrations cancelled by the registering party or staff"
    );
    describe_counter!(
        "registrations_confirmed_total",
        "Total registrations confirmed, labelled by payment method"
    );
    describe_counter!(
        "registration_webhooks_total",
        "Provider webhook notifications handled, labelled by outcome \
         (applied, already_terminal, unknown_correlation, unknown_type, conflict)"
    );
    describe_counter!(
        "registration_sweeps_total",
        "Sweeper resolutions of stale registrations, labelled by outcome \
         (expired, confirmed, already_terminal)"
    );

    tracing::info!("Business metrics registered");
}
