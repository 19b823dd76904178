//! Repositories - Persistence abstraction for the AAA and billing engines
//!
//! Every mutating operation is a single-record update so a backing store
//! with atomic document updates can implement it without explicit locks.

use super::model::*;
use super::value_objects::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Repository result type
pub type RepoResult<T> = Result<T, RepositoryError>;

/// Repository errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Subscriber and package reads, plus the two subscriber mutations
#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    /// Resolve a subscriber by login; a malformed login is `InvalidId`
    async fn find_by_login(&self, login: &str) -> RepoResult<Lookup<Subscriber>>;

    /// Get subscriber by id
    async fn find_subscriber(&self, id: &SubscriberId) -> RepoResult<Option<Subscriber>>;

    /// Get package by id
    async fn find_package(&self, id: &PackageId) -> RepoResult<Option<Package>>;

    /// Lowest-priced package offered by a tenant
    async fn cheapest_package(&self, tenant: &TenantId) -> RepoResult<Option<Package>>;

    /// Fold a finished session into the subscriber's cumulative counters.
    /// Returns false if the subscriber no longer exists.
    async fn record_usage(&self, id: &SubscriberId, delta: &SessionDelta) -> RepoResult<bool>;

    /// Atomically set package, activate, and push expiry out by `periods`
    /// billing periods from `max(now, expiry)`. Returns the new expiry, or
    /// `None` if the subscriber no longer exists.
    async fn extend_subscription(
        &self,
        id: &SubscriberId,
        package: &PackageId,
        periods: u32,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<DateTime<Utc>>>;
}

/// Tenant reads
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn find_tenant(&self, id: &TenantId) -> RepoResult<Option<Tenant>>;

    /// Tenant whose payment account owns `shortcode`
    async fn find_by_shortcode(&self, shortcode: &str) -> RepoResult<Option<Tenant>>;
}

/// Live accounting view, one record per login
#[async_trait]
pub trait AccountingStore: Send + Sync {
    /// Overwrite the record for `record.login`, returning the one it replaced
    async fn upsert_accounting(&self, record: AccountingRecord) -> RepoResult<Option<AccountingRecord>>;

    async fn find_accounting(&self, login: &str) -> RepoResult<Option<AccountingRecord>>;
}

/// Append-only post-auth audit log
#[async_trait]
pub trait PostAuthLog: Send + Sync {
    async fn append_post_auth(&self, record: PostAuthRecord) -> RepoResult<()>;

    /// Entries oldest first, optionally for one login
    async fn list_post_auth(&self, login: Option<&str>) -> RepoResult<Vec<PostAuthRecord>>;
}

/// Query over stored transactions; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub tenant: Option<TenantId>,
    pub subscriber: Option<SubscriberId>,
    pub kind: Option<TransactionKind>,
    pub status: Option<TransactionStatus>,
    pub reference: Option<String>,
    pub counterparty: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
}

impl TransactionFilter {
    /// Whether `tx` passes every set criterion
    pub fn matches(&self, tx: &PaymentTransaction) -> bool {
        self.tenant.map_or(true, |t| tx.tenant == t)
            && self.subscriber.map_or(true, |s| tx.subscriber == Some(s))
            && self.kind.map_or(true, |k| tx.kind == k)
            && self.status.map_or(true, |s| tx.status == s)
            && self.reference.as_deref().map_or(true, |r| tx.reference == r)
            && self
                .counterparty
                .as_deref()
                .map_or(true, |c| tx.counterparty.as_deref() == Some(c))
            && self.created_from.map_or(true, |from| tx.created_at >= from)
            && self.created_to.map_or(true, |to| tx.created_at <= to)
    }
}

/// Payment transactions
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Persist a new transaction. A provider receipt already recorded for
    /// the same tenant is a `Conflict`.
    async fn insert_transaction(&self, tx: PaymentTransaction) -> RepoResult<()>;

    async fn find_transaction(&self, id: &TransactionId) -> RepoResult<Option<PaymentTransaction>>;

    async fn find_by_receipt(&self, tenant: &TenantId, receipt: &str) -> RepoResult<Option<PaymentTransaction>>;

    /// Open (pending or validated) transaction for `(tenant, reference)`
    async fn find_open(&self, tenant: &TenantId, reference: &str) -> RepoResult<Option<PaymentTransaction>>;

    /// Apply `update` to the open transaction for `(tenant, reference)` if
    /// one still exists. The open-check and the write are one atomic step, so
    /// of two concurrent claims at most one observes `Some`.
    async fn claim_open(
        &self,
        tenant: &TenantId,
        reference: &str,
        update: &TransactionUpdate,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<PaymentTransaction>>;

    /// Same as [`claim_open`](Self::claim_open) but addressed by id
    async fn update_open(
        &self,
        id: &TransactionId,
        update: &TransactionUpdate,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<PaymentTransaction>>;

    /// Record the provider's synchronous response on a still-open transaction
    async fn attach_response(&self, id: &TransactionId, raw: serde_json::Value) -> RepoResult<bool>;

    /// Matching transactions, newest first
    async fn list_transactions(&self, filter: &TransactionFilter) -> RepoResult<Vec<PaymentTransaction>>;
}
