//! Registration Desk - reservation and payment reconciliation engine for
//! capacity-limited events.
//!
//! Parents reserve seats for their children; payment happens by offline
//! cheque or a hosted online checkout; and the event's open/closed state
//! must always reflect true remaining capacity. The hard problem this crate
//! owns is keeping the seat count exact and race-free under three
//! independent, partially-ordered sources of truth: the synchronous
//! registration request, an asynchronous provider notification that may
//! arrive late, duplicated, or never, and a periodic reconciliation sweep.
//!
//! # Architecture
//!
//! ```text
//! register / cancel / confirm_offline        provider callbacks
//!              │                                    │
//!              ▼                                    ▼
//!      ┌───────────────┐                   ┌─────────────────┐
//!      │ Registration  │                   │     Webhook     │
//!      │   Service     │                   │   Reconciler    │
//!      └──────┬────────┘                   └────────┬────────┘
//!             │         ┌────────────────┐          │
//!             ├────────▶│ Capacity Ledger│          │
//!             │         └────────────────┘          │
//!             │         ┌────────────────┐          │      ┌───────────┐
//!             ├────────▶│ Payment State  │◀─────────┤      │ Expiration│
//!             │         │    Machine     │◀─────────┼──────│  Sweeper  │
//!             │         └────────────────┘          │      └───────────┘
//!             │         ┌────────────────┐          │
//!             └────────▶│   Event Lock   │◀─────────┘
//!                       │   Controller   │
//!                       └────────────────┘
//! ```
//!
//! Every mutation runs inside one transaction that re-checks the live
//! reserved-seat sum behind a row lock on the event, applies the idempotent
//! status transition, and rewrites the derived `open` flag. The webhook
//! reconciler and the expiration sweeper converge on the same transition
//! entry point ([`state_machine::apply`]), so whichever reaches a
//! registration first wins and the other becomes a no-op.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod capacity;
pub mod checkout;
pub mod config;
pub mod error;
pub mod event_lock;
pub mod metrics;
pub mod notify;
pub mod service;
pub mod state_machine;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod webhook;

pub use checkout::{CheckoutGateway, HostedCheckoutGateway, MockCheckoutGateway};
pub use config::Config;
pub use error::{RegistrationError, Result};
pub use service::{RegisterRequest, RegistrationOutcome, RegistrationService};
pub use state_machine::{PaymentStatus, Transition, TransitionTrigger};
pub use sweeper::Sweeper;
pub use types::*;
pub use webhook::{ProviderNotification, WebhookOutcome, WebhookReconciler};
