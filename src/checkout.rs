//! Checkout session gateway for the hosted payment processor.
//!
//! Thin adapter that opens hosted-checkout sessions and probes their
//! provider-side status. The registration id travels as opaque metadata and
//! comes back on the asynchronous callback as the correlation id the
//! [`crate::webhook`] reconciler maps to a registration.
//!
//! Transient failures are retried a bounded number of times *before* the
//! enclosing reservation transaction commits, never after — a retry after
//! commit could mint a second session for one registration.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::types::{Money, RegistrationId};

/// Gateway result type.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Checkout gateway error.
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Transient transport failure (timeout, connect error, 5xx); safe to
    /// retry before the transaction commits.
    Transient {
        /// Failure description.
        reason: String,
    },
    /// The processor rejected the request (4xx); retrying will not help.
    Rejected {
        /// Rejection reason.
        reason: String,
    },
    /// The processor answered with a payload this adapter cannot read.
    Protocol {
        /// Parse failure description.
        reason: String,
    },
}

impl GatewayError {
    /// Returns `true` when a bounded retry may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient { reason } => write!(f, "Transient gateway failure: {reason}"),
            Self::Rejected { reason } => write!(f, "Gateway rejected request: {reason}"),
            Self::Protocol { reason } => write!(f, "Unreadable gateway response: {reason}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Request to open a hosted checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSessionRequest {
    /// Registration the session pays for; carried as opaque metadata.
    pub registration_id: RegistrationId,
    /// Amount to collect.
    pub amount: Money,
    /// Redirect after a completed payment.
    pub success_url: String,
    /// Redirect after an abandoned payment.
    pub cancel_url: String,
}

/// An opened hosted checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    /// Correlation id the provider will echo on callbacks.
    pub correlation_id: String,
    /// URL the registering party completes payment at.
    pub checkout_url: String,
}

/// Provider-side state of a checkout session, as seen by the sweeper's
/// reconciliation probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Still open; no payment yet.
    Open,
    /// Payment completed provider-side (the webhook may still be in
    /// flight).
    Completed,
    /// Session expired provider-side.
    Expired,
}

/// Checkout gateway trait.
///
/// Abstraction over hosted-checkout processors (Stripe Checkout and
/// friends). Object-safe so it can be shared as `Arc<dyn CheckoutGateway>`.
pub trait CheckoutGateway: Send + Sync {
    /// Opens a hosted checkout session.
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError`] if the processor cannot be reached or
    /// refuses the request.
    fn open_session(
        &self,
        request: OpenSessionRequest,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<CheckoutSession>> + Send + '_>>;

    /// Probes the provider-side status of a session.
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError`] if the processor cannot be reached or the
    /// session is unknown to it.
    fn session_status(
        &self,
        correlation_id: &str,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<SessionStatus>> + Send + '_>>;
}

/// Opens a session, retrying transient failures a bounded number of times
/// with a fixed delay.
///
/// # Errors
///
/// Returns the last [`GatewayError`] once the attempts are exhausted, or
/// immediately for non-transient failures.
pub async fn open_session_with_retry(
    gateway: &dyn CheckoutGateway,
    request: OpenSessionRequest,
    attempts: u32,
    delay: Duration,
) -> GatewayResult<CheckoutSession> {
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match gateway.open_session(request.clone()).await {
            Ok(session) => return Ok(session),
            Err(err) if err.is_transient() && attempt < attempts => {
                tracing::warn!(
                    registration_id = %request.registration_id,
                    attempt,
                    error = %err,
                    "checkout session open failed; retrying"
                );
                last_error = Some(err);
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }

    // Unreachable: the loop always returns on its last attempt.
    Err(last_error.unwrap_or(GatewayError::Transient {
        reason: "no attempts made".to_string(),
    }))
}

// ============================================================================
// Hosted implementation (reqwest)
// ============================================================================

#[derive(Serialize)]
struct OpenSessionBody<'a> {
    amount: i64,
    success_url: &'a str,
    cancel_url: &'a str,
    metadata: SessionMetadata,
}

#[derive(Serialize)]
struct SessionMetadata {
    registration_id: RegistrationId,
}

#[derive(Deserialize)]
struct SessionResponse {
    id: String,
    url: String,
}

#[derive(Deserialize)]
struct SessionStatusResponse {
    status: String,
}

/// Checkout gateway backed by the hosted processor's HTTP API.
#[derive(Clone)]
pub struct HostedCheckoutGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HostedCheckoutGateway {
    /// Creates a gateway from the checkout configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError::Protocol`] if the HTTP client cannot be
    /// constructed.
    pub fn new(config: &crate::config::CheckoutConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .build()
            .map_err(|e| GatewayError::Protocol {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn classify(err: &reqwest::Error) -> GatewayError {
        if err.is_timeout() || err.is_connect() {
            return GatewayError::Transient {
                reason: err.to_string(),
            };
        }
        match err.status() {
            Some(status) if status.is_server_error() => GatewayError::Transient {
                reason: format!("processor returned {status}"),
            },
            Some(status) => GatewayError::Rejected {
                reason: format!("processor returned {status}"),
            },
            None => GatewayError::Transient {
                reason: err.to_string(),
            },
        }
    }
}

impl CheckoutGateway for HostedCheckoutGateway {
    fn open_session(
        &self,
        request: OpenSessionRequest,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<CheckoutSession>> + Send + '_>> {
        Box::pin(async move {
            let body = OpenSessionBody {
                amount: request.amount.cents(),
                success_url: &request.success_url,
                cancel_url: &request.cancel_url,
                metadata: SessionMetadata {
                    registration_id: request.registration_id,
                },
            };

            let response = self
                .client
                .post(format!("{}/v1/checkout/sessions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| Self::classify(&e))?
                .error_for_status()
                .map_err(|e| Self::classify(&e))?;

            let session: SessionResponse =
                response.json().await.map_err(|e| GatewayError::Protocol {
                    reason: e.to_string(),
                })?;

            tracing::info!(
                registration_id = %request.registration_id,
                correlation_id = %session.id,
                "checkout session opened"
            );

            Ok(CheckoutSession {
                correlation_id: session.id,
                checkout_url: session.url,
            })
        })
    }

    fn session_status(
        &self,
        correlation_id: &str,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<SessionStatus>> + Send + '_>> {
        let correlation_id = correlation_id.to_string();
        Box::pin(async move {
            let response = self
                .client
                .get(format!(
                    "{}/v1/checkout/sessions/{correlation_id}",
                    self.base_url
                ))
                .bearer_auth(&self.api_key)
                .send()
                .await
                .map_err(|e| Self::classify(&e))?
                .error_for_status()
                .map_err(|e| Self::classify(&e))?;

            let status: SessionStatusResponse =
                response.json().await.map_err(|e| GatewayError::Protocol {
                    reason: e.to_string(),
                })?;

            match status.status.as_str() {
                "open" => Ok(SessionStatus::Open),
                "complete" | "completed" => Ok(SessionStatus::Completed),
                "expired" => Ok(SessionStatus::Expired),
                other => Err(GatewayError::Protocol {
                    reason: format!("unknown session status '{other}'"),
                }),
            }
        })
    }
}

// ============================================================================
// Mock implementation (tests and development)
// ============================================================================

/// In-memory checkout gateway for tests and development.
///
/// Records every opened session, can be scripted to fail the next N open
/// attempts transiently, and serves configurable session statuses to the
/// sweeper probe.
#[derive(Clone, Default)]
pub struct MockCheckoutGateway {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    opened: Mutex<Vec<OpenSessionRequest>>,
    statuses: Mutex<std::collections::HashMap<String, SessionStatus>>,
    transient_failures: AtomicU32,
    open_calls: AtomicU32,
}

impl MockCheckoutGateway {
    /// Creates a mock gateway that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` open attempts fail transiently.
    pub fn fail_next_opens(&self, count: u32) {
        self.inner.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Scripts the provider-side status served for a correlation id.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (test-only type).
    #[allow(clippy::unwrap_used)]
    pub fn set_session_status(&self, correlation_id: &str, status: SessionStatus) {
        self.inner
            .statuses
            .lock()
            .unwrap()
            .insert(correlation_id.to_string(), status);
    }

    /// The requests opened so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (test-only type).
    #[allow(clippy::unwrap_used)]
    #[must_use]
    pub fn opened(&self) -> Vec<OpenSessionRequest> {
        self.inner.opened.lock().unwrap().clone()
    }

    /// Total `open_session` calls, including failed attempts.
    #[must_use]
    pub fn open_calls(&self) -> u32 {
        self.inner.open_calls.load(Ordering::SeqCst)
    }
}

impl CheckoutGateway for MockCheckoutGateway {
    #[allow(clippy::unwrap_used)]
    fn open_session(
        &self,
        request: OpenSessionRequest,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<CheckoutSession>> + Send + '_>> {
        Box::pin(async move {
            self.inner.open_calls.fetch_add(1, Ordering::SeqCst);

            let remaining = self.inner.transient_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.inner
                    .transient_failures
                    .store(remaining - 1, Ordering::SeqCst);
                return Err(GatewayError::Transient {
                    reason: "scripted transient failure".to_string(),
                });
            }

            let correlation_id = format!("mock_cs_{}", uuid::Uuid::new_v4());
            let session = CheckoutSession {
                checkout_url: format!("https://checkout.localhost/pay/{correlation_id}"),
                correlation_id: correlation_id.clone(),
            };

            self.inner.opened.lock().unwrap().push(request);
            self.inner
                .statuses
                .lock()
                .unwrap()
                .entry(correlation_id)
                .or_insert(SessionStatus::Open);

            Ok(session)
        })
    }

    #[allow(clippy::unwrap_used)]
    fn session_status(
        &self,
        correlation_id: &str,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<SessionStatus>> + Send + '_>> {
        let correlation_id = correlation_id.to_string();
        Box::pin(async move {
            self.inner
                .statuses
                .lock()
                .unwrap()
                .get(&correlation_id)
                .copied()
                .ok_or(GatewayError::Rejected {
                    reason: format!("unknown session {correlation_id}"),
                })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request() -> OpenSessionRequest {
        OpenSessionRequest {
            registration_id: RegistrationId::new(),
            amount: Money::from_cents(2500),
            success_url: "http://localhost/success".to_string(),
            cancel_url: "http://localhost/cancel".to_string(),
        }
    }

    #[tokio::test]
    async fn mock_open_session_succeeds() {
        let gateway = MockCheckoutGateway::new();
        let session = gateway.open_session(request()).await.unwrap();

        assert!(session.correlation_id.starts_with("mock_cs_"));
        assert_eq!(gateway.opened().len(), 1);
        assert_eq!(
            gateway
                .session_status(&session.correlation_id)
                .await
                .unwrap(),
            SessionStatus::Open
        );
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let gateway = MockCheckoutGateway::new();
        gateway.fail_next_opens(2);

        let session =
            open_session_with_retry(&gateway, request(), 3, Duration::from_millis(1)).await;

        assert!(session.is_ok());
        assert_eq!(gateway.open_calls(), 3);
        assert_eq!(gateway.opened().len(), 1);
    }

    #[tokio::test]
    async fn retry_gives_up_after_bounded_attempts() {
        let gateway = MockCheckoutGateway::new();
        gateway.fail_next_opens(5);

        let result =
            open_session_with_retry(&gateway, request(), 3, Duration::from_millis(1)).await;

        assert!(matches!(result, Err(GatewayError::Transient { .. })));
        assert_eq!(gateway.open_calls(), 3);
        assert!(gateway.opened().is_empty());
    }

    #[tokio::test]
    async fn scripted_status_served_to_probe() {
        let gateway = MockCheckoutGateway::new();
        let session = gateway.open_session(request()).await.unwrap();
        gateway.set_session_status(&session.correlation_id, SessionStatus::Completed);

        assert_eq!(
            gateway
                .session_status(&session.correlation_id)
                .await
                .unwrap(),
            SessionStatus::Completed
        );
    }
}
