//! ispgate billing - mobile-money payments and subscription reconciliation
//!
//! - [`PaymentService`] starts C2B/B2C/B2B payments and records them as
//!   pending transactions
//! - [`Reconciler`] turns provider callbacks into at-most-once
//!   subscription extensions
//! - [`gateway`] is the provider client, [`notify`] the outbox for events
//!   the provider cannot be told about

pub mod gateway;
pub mod notify;
pub mod payments;
pub mod reconcile;

pub use gateway::{CallbackUrls, DarajaClient, GatewayCredentials, GatewayError, PaymentGateway, PaymentOrder};
pub use notify::{BillingEvent, LogNotifier, Notifier, WebhookConfig, WebhookNotifier};
pub use payments::{PaymentRequest, PaymentService, SubscriptionPayment};
pub use reconcile::{CallbackKind, CallbackPayload, DropReason, Outcome, Reconciler};

use ispgate_common::{PackageId, RepositoryError, SubscriberId, TenantId, TransactionId};
use thiserror::Error;

/// Billing errors
#[derive(Error, Debug)]
pub enum BillingError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("tenant {0} not found")]
    TenantNotFound(TenantId),

    #[error("subscriber {0} not found for this tenant")]
    SubscriberNotFound(SubscriberId),

    #[error("package {0} not found for this tenant")]
    PackageNotFound(PackageId),

    #[error("transaction {0} is not open")]
    NotOpen(TransactionId),

    #[error("invalid payment request: {0}")]
    InvalidRequest(String),

    #[error("malformed callback: {0}")]
    MalformedCallback(String),
}

impl BillingError {
    /// Whether the request itself was at fault
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::TenantNotFound(_)
                | Self::SubscriberNotFound(_)
                | Self::PackageNotFound(_)
                | Self::NotOpen(_)
                | Self::InvalidRequest(_)
                | Self::MalformedCallback(_)
                | Self::Gateway(GatewayError::MissingCredential(_))
        )
    }
}
