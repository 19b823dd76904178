//! In-memory authoritative store
//!
//! One `DashMap` per collection. Every mutation goes through a single
//! `get_mut`/`entry` guard, so it runs under that record's shard lock and is
//! atomic with respect to concurrent requests for the same record.

use crate::domain::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fixture loaded into a fresh store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSeed {
    #[serde(default)]
    pub tenants: Vec<Tenant>,
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(default)]
    pub subscribers: Vec<Subscriber>,
}

/// Store backing every repository trait
#[derive(Default)]
pub struct MemoryStore {
    tenants: DashMap<TenantId, Tenant>,
    packages: DashMap<PackageId, Package>,
    subscribers: DashMap<SubscriberId, Subscriber>,
    logins: DashMap<String, SubscriberId>,
    accounting: DashMap<String, AccountingRecord>,
    post_auth: RwLock<Vec<PostAuthRecord>>,
    transactions: DashMap<TransactionId, PaymentTransaction>,
    receipts: DashMap<(TenantId, String), TransactionId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a fixture
    pub fn from_seed(seed: StoreSeed) -> RepoResult<Self> {
        let store = Self::new();
        for tenant in seed.tenants {
            store.insert_tenant(tenant);
        }
        for package in seed.packages {
            package
                .validate()
                .map_err(|e| RepositoryError::Conflict(format!("package {}: {}", package.id, e)))?;
            store.insert_package(package);
        }
        for subscriber in seed.subscribers {
            store.insert_subscriber(subscriber)?;
        }
        debug!(
            tenants = store.tenants.len(),
            packages = store.packages.len(),
            subscribers = store.subscribers.len(),
            "store seeded"
        );
        Ok(store)
    }

    pub fn insert_tenant(&self, tenant: Tenant) {
        self.tenants.insert(tenant.id, tenant);
    }

    pub fn insert_package(&self, package: Package) {
        self.packages.insert(package.id, package);
    }

    /// Add a subscriber; its login must be unused
    pub fn insert_subscriber(&self, subscriber: Subscriber) -> RepoResult<()> {
        match self.logins.entry(subscriber.login.as_str().to_string()) {
            Entry::Occupied(_) => {
                return Err(RepositoryError::Conflict(format!(
                    "login {} already taken",
                    subscriber.login
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(subscriber.id);
            }
        }
        self.subscribers.insert(subscriber.id, subscriber);
        Ok(())
    }

    /// Number of stored transactions
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Record the receipt index entry for `id`, refusing a receipt owned by
    /// another transaction
    fn index_receipt(&self, tenant: TenantId, receipt: &str, id: TransactionId) -> RepoResult<()> {
        match self.receipts.entry((tenant, receipt.to_string())) {
            Entry::Occupied(owner) if *owner.get() != id => Err(RepositoryError::Conflict(format!(
                "receipt {} already recorded",
                receipt
            ))),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(id);
                Ok(())
            }
        }
    }

    fn apply_open(
        &self,
        id: &TransactionId,
        update: &TransactionUpdate,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<PaymentTransaction>> {
        let Some(mut tx) = self.transactions.get_mut(id) else {
            return Ok(None);
        };
        if !tx.status.is_open() || !tx.status.can_transition_to(update.status) {
            return Ok(None);
        }
        if let Some(receipt) = &update.receipt {
            self.index_receipt(tx.tenant, receipt, tx.id)?;
        }
        tx.apply(update, now);
        Ok(Some(tx.clone()))
    }
}

#[async_trait]
impl SubscriberDirectory for MemoryStore {
    async fn find_by_login(&self, login: &str) -> RepoResult<Lookup<Subscriber>> {
        let login = match Login::parse(login) {
            Ok(login) => login,
            Err(e) => return Ok(Lookup::InvalidId(e.to_string())),
        };
        let found = self
            .logins
            .get(login.as_str())
            .and_then(|id| self.subscribers.get(&*id).map(|s| s.clone()));
        Ok(found.into())
    }

    async fn find_subscriber(&self, id: &SubscriberId) -> RepoResult<Option<Subscriber>> {
        Ok(self.subscribers.get(id).map(|s| s.clone()))
    }

    async fn find_package(&self, id: &PackageId) -> RepoResult<Option<Package>> {
        Ok(self.packages.get(id).map(|p| p.clone()))
    }

    async fn cheapest_package(&self, tenant: &TenantId) -> RepoResult<Option<Package>> {
        Ok(self
            .packages
            .iter()
            .filter(|p| p.tenant == *tenant)
            .min_by(|a, b| a.price.cmp(&b.price))
            .map(|p| p.clone()))
    }

    async fn record_usage(&self, id: &SubscriberId, delta: &SessionDelta) -> RepoResult<bool> {
        match self.subscribers.get_mut(id) {
            Some(mut subscriber) => {
                subscriber.apply_session(delta);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn extend_subscription(
        &self,
        id: &SubscriberId,
        package: &PackageId,
        periods: u32,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<DateTime<Utc>>> {
        let Some(mut subscriber) = self.subscribers.get_mut(id) else {
            return Ok(None);
        };
        let expiry = subscriber.extended_expiry(now, periods);
        subscriber.expiry = Some(expiry);
        subscriber.package = Some(*package);
        subscriber.status = SubscriberStatus::Active;
        subscriber.updated_at = now;
        Ok(Some(expiry))
    }
}

#[async_trait]
impl TenantDirectory for MemoryStore {
    async fn find_tenant(&self, id: &TenantId) -> RepoResult<Option<Tenant>> {
        Ok(self.tenants.get(id).map(|t| t.clone()))
    }

    async fn find_by_shortcode(&self, shortcode: &str) -> RepoResult<Option<Tenant>> {
        Ok(self
            .tenants
            .iter()
            .find(|t| t.owns_shortcode(shortcode))
            .map(|t| t.clone()))
    }
}

#[async_trait]
impl AccountingStore for MemoryStore {
    async fn upsert_accounting(&self, record: AccountingRecord) -> RepoResult<Option<AccountingRecord>> {
        Ok(self.accounting.insert(record.login.as_str().to_string(), record))
    }

    async fn find_accounting(&self, login: &str) -> RepoResult<Option<AccountingRecord>> {
        Ok(self.accounting.get(login).map(|r| r.clone()))
    }
}

#[async_trait]
impl PostAuthLog for MemoryStore {
    async fn append_post_auth(&self, record: PostAuthRecord) -> RepoResult<()> {
        self.post_auth.write().push(record);
        Ok(())
    }

    async fn list_post_auth(&self, login: Option<&str>) -> RepoResult<Vec<PostAuthRecord>> {
        Ok(self
            .post_auth
            .read()
            .iter()
            .filter(|r| login.map_or(true, |l| r.login == l))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn insert_transaction(&self, tx: PaymentTransaction) -> RepoResult<()> {
        if let Some(receipt) = &tx.receipt {
            self.index_receipt(tx.tenant, receipt, tx.id)?;
        }
        match self.transactions.entry(tx.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!("transaction {} exists", tx.id))),
            Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(())
            }
        }
    }

    async fn find_transaction(&self, id: &TransactionId) -> RepoResult<Option<PaymentTransaction>> {
        Ok(self.transactions.get(id).map(|t| t.clone()))
    }

    async fn find_by_receipt(&self, tenant: &TenantId, receipt: &str) -> RepoResult<Option<PaymentTransaction>> {
        let id = self.receipts.get(&(*tenant, receipt.to_string())).map(|id| *id);
        Ok(id.and_then(|id| self.transactions.get(&id).map(|t| t.clone())))
    }

    async fn find_open(&self, tenant: &TenantId, reference: &str) -> RepoResult<Option<PaymentTransaction>> {
        Ok(self
            .transactions
            .iter()
            .filter(|t| t.tenant == *tenant && t.reference == reference && t.status.is_open())
            .max_by_key(|t| t.created_at)
            .map(|t| t.clone()))
    }

    async fn claim_open(
        &self,
        tenant: &TenantId,
        reference: &str,
        update: &TransactionUpdate,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<PaymentTransaction>> {
        // Collect first: get_mut while an iterator holds a shard read lock deadlocks.
        let mut candidates: Vec<(DateTime<Utc>, TransactionId)> = self
            .transactions
            .iter()
            .filter(|t| t.tenant == *tenant && t.reference == reference && t.status.is_open())
            .map(|t| (t.created_at, t.id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, id) in candidates {
            if let Some(tx) = self.apply_open(&id, update, now)? {
                return Ok(Some(tx));
            }
        }
        Ok(None)
    }

    async fn update_open(
        &self,
        id: &TransactionId,
        update: &TransactionUpdate,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<PaymentTransaction>> {
        self.apply_open(id, update, now)
    }

    async fn attach_response(&self, id: &TransactionId, raw: serde_json::Value) -> RepoResult<bool> {
        match self.transactions.get_mut(id) {
            Some(mut tx) if tx.status.is_open() => {
                tx.raw_response = Some(raw);
                tx.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_transactions(&self, filter: &TransactionFilter) -> RepoResult<Vec<PaymentTransaction>> {
        let mut found: Vec<PaymentTransaction> = self
            .transactions
            .iter()
            .filter(|t| filter.matches(t))
            .map(|t| t.clone())
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }
}
