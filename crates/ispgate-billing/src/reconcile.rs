//! Payment reconciliation state machine
//!
//! `pending -> {validated, completed, failed, timeout, cancelled}`
//!
//! A callback either matches an open transaction created by
//! [`PaymentService`](crate::PaymentService) (solicited) or, for
//! confirmations only, is a bill-pay whose reference is the subscriber's
//! login (unsolicited). Both end in at most one subscription extension per
//! payment: the solicited path through the atomic open-transaction claim,
//! the unsolicited path through the per-tenant receipt index.
//!
//! Nothing here fails toward the provider. Every input yields an
//! [`Outcome`]; internal errors are logged and reported as
//! [`Outcome::Failed`].

use crate::notify::{BillingEvent, Notifier};
use crate::BillingError;
use chrono::{DateTime, Utc};
use ispgate_common::{
    Lookup, Package, PaymentTransaction, RepositoryError, SubscriberDirectory, SubscriberId, TenantDirectory,
    TenantId, TransactionFilter, TransactionId, TransactionKind, TransactionStatus, TransactionStore,
    TransactionUpdate,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Provider callback endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Validation,
    Confirmation,
    Result,
    Timeout,
}

impl CallbackKind {
    /// ResultDesc returned with ResultCode 0
    pub fn ack_description(self) -> &'static str {
        match self {
            CallbackKind::Validation => "Accepted",
            _ => "Success",
        }
    }
}

/// Provider result codes with a dedicated terminal state
const RESULT_CANCELLED_BY_USER: i64 = 1032;
const RESULT_USER_UNREACHABLE: i64 = 1037;

/// Fields of a provider callback, whatever its envelope
///
/// Accepts the flat C2B shape (`TransID`, `BillRefNumber`, ...) and the
/// nested `{"Result": {..., "ReferenceData": {"ReferenceItem": ...}}}`
/// shape of B2C/B2B results.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackPayload {
    pub shortcode: Option<String>,
    pub reference: Option<String>,
    pub receipt: Option<String>,
    pub amount: Option<String>,
    pub phone: Option<String>,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,
    pub raw: Value,
}

fn text(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

/// Merge `{"Key": k, "Value": v}` items (single object or list) into `fields`
fn merge_key_values(fields: &mut Map<String, Value>, items: Option<&Value>) {
    let items: Vec<&Value> = match items {
        Some(Value::Array(list)) => list.iter().collect(),
        Some(item @ Value::Object(_)) => vec![item],
        _ => Vec::new(),
    };
    for item in items {
        if let (Some(Value::String(key)), Some(value)) = (item.get("Key"), item.get("Value")) {
            fields.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

impl CallbackPayload {
    pub fn from_json(raw: Value) -> Result<Self, BillingError> {
        let top = raw
            .as_object()
            .ok_or_else(|| BillingError::MalformedCallback("expected a JSON object".into()))?;

        let mut fields = top.clone();
        if let Some(Value::Object(result)) = top.get("Result") {
            for (key, value) in result {
                fields.entry(key.clone()).or_insert_with(|| value.clone());
            }
            merge_key_values(
                &mut fields,
                result.get("ReferenceData").and_then(|r| r.get("ReferenceItem")),
            );
            merge_key_values(
                &mut fields,
                result.get("ResultParameters").and_then(|r| r.get("ResultParameter")),
            );
        }

        let first = |keys: &[&str]| keys.iter().find_map(|k| fields.get(*k).and_then(text));
        Ok(Self {
            shortcode: first(&["BusinessShortCode", "ShortCode"]),
            reference: first(&["BillRefNumber", "AccountReference", "Occasion", "BillReferenceNumber"]),
            receipt: first(&["TransID", "TransactionReceipt", "TransactionID"]),
            amount: first(&["TransAmount", "Amount", "TransactionAmount"]),
            phone: first(&["MSISDN", "Msisdn", "PhoneNumber"]),
            result_code: first(&["ResultCode"]).and_then(|c| c.parse().ok()),
            result_desc: first(&["ResultDesc"]),
            raw,
        })
    }

    /// Amount as a decimal, if it parses
    pub fn amount(&self) -> Option<Decimal> {
        self.amount.as_deref().and_then(|a| Decimal::from_str(a).ok())
    }
}

/// Why a confirmed bill-pay could not be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    MissingReference,
    /// Bill-pay without a provider receipt cannot be deduplicated
    MissingReceipt,
    UnknownSubscriber,
    NoPackage,
    InvalidAmount,
    Underpaid { amount: Decimal, price: Decimal },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::MissingReference => f.write_str("payment carries no account reference"),
            DropReason::MissingReceipt => f.write_str("payment carries no provider receipt"),
            DropReason::UnknownSubscriber => f.write_str("reference matches no subscriber"),
            DropReason::NoPackage => f.write_str("no package available"),
            DropReason::InvalidAmount => f.write_str("invalid amount"),
            DropReason::Underpaid { amount, price } => {
                write!(f, "amount {} is less than package price {}", amount, price)
            }
        }
    }
}

/// What a callback did
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Validation with nothing to mark
    Accepted,
    /// Open transaction marked validated
    Validated(TransactionId),
    /// Solicited transaction moved to a terminal state
    Settled {
        transaction: TransactionId,
        status: TransactionStatus,
        expiry: Option<DateTime<Utc>>,
    },
    /// Bill-pay recorded and subscription extended
    Applied {
        transaction: TransactionId,
        subscriber: SubscriberId,
        periods: u32,
        expiry: DateTime<Utc>,
    },
    /// Re-delivery of an already reconciled payment
    Duplicate,
    /// No open transaction for the reference
    NotFound,
    /// Bill-pay acknowledged but not applied
    Dropped(DropReason),
    /// Shortcode and tenant hint name no tenant
    Unroutable,
    /// Internal failure, logged
    Failed(String),
}

pub struct Reconciler {
    directory: Arc<dyn SubscriberDirectory>,
    tenants: Arc<dyn TenantDirectory>,
    transactions: Arc<dyn TransactionStore>,
    notifier: Arc<dyn Notifier>,
}

impl Reconciler {
    pub fn new(
        directory: Arc<dyn SubscriberDirectory>,
        tenants: Arc<dyn TenantDirectory>,
        transactions: Arc<dyn TransactionStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self { directory, tenants, transactions, notifier }
    }

    /// Reconcile one callback. Never fails; see [`Outcome`].
    pub async fn handle(
        &self,
        kind: CallbackKind,
        tenant_hint: Option<TenantId>,
        payload: &CallbackPayload,
        now: DateTime<Utc>,
    ) -> Outcome {
        match self.dispatch(kind, tenant_hint, payload, now).await {
            Ok(outcome) => {
                debug!(?kind, ?outcome, "callback reconciled");
                outcome
            }
            Err(e) => {
                error!(?kind, reference = ?payload.reference, receipt = ?payload.receipt, error = %e, "callback reconciliation failed");
                Outcome::Failed(e.to_string())
            }
        }
    }

    async fn dispatch(
        &self,
        kind: CallbackKind,
        tenant_hint: Option<TenantId>,
        payload: &CallbackPayload,
        now: DateTime<Utc>,
    ) -> Result<Outcome, BillingError> {
        let Some(tenant) = self.resolve_tenant(payload, tenant_hint).await? else {
            warn!(shortcode = ?payload.shortcode, hint = ?tenant_hint, "callback for unknown tenant");
            return Ok(Outcome::Unroutable);
        };

        match kind {
            CallbackKind::Validation => self.validate(tenant, payload, now).await,
            CallbackKind::Confirmation => self.confirm(tenant, payload, now).await,
            CallbackKind::Result => {
                let status = match payload.result_code {
                    None | Some(0) => TransactionStatus::Completed,
                    Some(RESULT_CANCELLED_BY_USER) => TransactionStatus::Cancelled,
                    Some(RESULT_USER_UNREACHABLE) => TransactionStatus::Timeout,
                    Some(_) => TransactionStatus::Failed,
                };
                self.settle(tenant, payload, status, now).await
            }
            CallbackKind::Timeout => self.settle(tenant, payload, TransactionStatus::Timeout, now).await,
        }
    }

    async fn resolve_tenant(
        &self,
        payload: &CallbackPayload,
        hint: Option<TenantId>,
    ) -> Result<Option<TenantId>, BillingError> {
        if let Some(shortcode) = payload.shortcode.as_deref() {
            if let Some(tenant) = self.tenants.find_by_shortcode(shortcode).await? {
                return Ok(Some(tenant.id));
            }
        }
        if let Some(hint) = hint {
            if let Some(tenant) = self.tenants.find_tenant(&hint).await? {
                return Ok(Some(tenant.id));
            }
        }
        Ok(None)
    }

    async fn validate(&self, tenant: TenantId, payload: &CallbackPayload, now: DateTime<Utc>) -> Result<Outcome, BillingError> {
        let Some(reference) = payload.reference.as_deref() else {
            return Ok(Outcome::Accepted);
        };
        let update = TransactionUpdate {
            status: TransactionStatus::Validated,
            receipt: None,
            raw_response: Some(payload.raw.clone()),
        };
        Ok(match self.transactions.claim_open(&tenant, reference, &update, now).await? {
            Some(tx) => {
                info!(%tenant, reference, transaction = %tx.id, "transaction validated");
                Outcome::Validated(tx.id)
            }
            None => Outcome::Accepted,
        })
    }

    /// Move the open transaction for the payload's reference to `status`;
    /// `None` if there is no open transaction
    async fn claim(
        &self,
        tenant: TenantId,
        reference: &str,
        payload: &CallbackPayload,
        status: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Outcome>, BillingError> {
        let update = TransactionUpdate {
            status,
            receipt: payload.receipt.clone().filter(|_| status == TransactionStatus::Completed),
            raw_response: Some(payload.raw.clone()),
        };
        let claimed = match self.transactions.claim_open(&tenant, reference, &update, now).await {
            Ok(claimed) => claimed,
            Err(RepositoryError::Conflict(reason)) => {
                info!(%tenant, reference, %reason, "receipt already reconciled");
                return Ok(Some(Outcome::Duplicate));
            }
            Err(e) => return Err(e.into()),
        };
        let Some(tx) = claimed else {
            return Ok(None);
        };

        let mut expiry = None;
        if tx.status == TransactionStatus::Completed {
            if let (Some(subscriber), Some(package)) = (tx.subscriber, tx.package) {
                let periods = tx.periods.unwrap_or(1).max(1);
                expiry = self
                    .directory
                    .extend_subscription(&subscriber, &package, periods, now)
                    .await?;
                match expiry {
                    Some(expiry) => self.notifier.publish(BillingEvent::PaymentApplied {
                        tenant,
                        transaction: tx.id,
                        subscriber,
                        periods,
                        expiry,
                    }),
                    None => warn!(%tenant, %subscriber, transaction = %tx.id, "paid subscriber no longer exists"),
                }
            }
        }

        info!(%tenant, reference, transaction = %tx.id, status = %tx.status, "transaction settled");
        self.notifier.publish(BillingEvent::TransactionSettled {
            tenant,
            transaction: tx.id,
            status: tx.status,
        });
        Ok(Some(Outcome::Settled { transaction: tx.id, status: tx.status, expiry }))
    }

    async fn settle(
        &self,
        tenant: TenantId,
        payload: &CallbackPayload,
        status: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Result<Outcome, BillingError> {
        let Some(reference) = payload.reference.as_deref() else {
            warn!(%tenant, "result callback without reference");
            return Ok(Outcome::NotFound);
        };
        match self.claim(tenant, reference, payload, status, now).await? {
            Some(outcome) => Ok(outcome),
            None => {
                info!(%tenant, reference, "no open transaction for callback");
                Ok(Outcome::NotFound)
            }
        }
    }

    async fn confirm(&self, tenant: TenantId, payload: &CallbackPayload, now: DateTime<Utc>) -> Result<Outcome, BillingError> {
        let Some(reference) = payload.reference.as_deref() else {
            return Ok(self.drop_payment(tenant, payload, DropReason::MissingReference));
        };
        if let Some(receipt) = payload.receipt.as_deref() {
            if self.transactions.find_by_receipt(&tenant, receipt).await?.is_some() {
                info!(%tenant, reference, receipt, "confirmation already reconciled");
                return Ok(Outcome::Duplicate);
            }
        }
        if let Some(outcome) = self.claim(tenant, reference, payload, TransactionStatus::Completed, now).await? {
            return Ok(outcome);
        }
        self.bill_pay(tenant, reference, payload, now).await
    }

    /// Unsolicited path: reference is the subscriber login
    async fn bill_pay(
        &self,
        tenant: TenantId,
        reference: &str,
        payload: &CallbackPayload,
        now: DateTime<Utc>,
    ) -> Result<Outcome, BillingError> {
        let subscriber = match self.directory.find_by_login(reference).await? {
            Lookup::Found(subscriber) if subscriber.tenant == tenant => subscriber,
            _ => {
                // a re-delivered solicited confirmation lands here once its
                // transaction is no longer open
                let filter = TransactionFilter {
                    tenant: Some(tenant),
                    reference: Some(reference.to_string()),
                    ..Default::default()
                };
                if !self.transactions.list_transactions(&filter).await?.is_empty() {
                    info!(%tenant, reference, "confirmation for settled transaction");
                    return Ok(Outcome::Duplicate);
                }
                return Ok(self.drop_payment(tenant, payload, DropReason::UnknownSubscriber));
            }
        };
        if payload.receipt.is_none() {
            return Ok(self.drop_payment(tenant, payload, DropReason::MissingReceipt));
        }

        let Some(package) = self.billing_package(tenant, subscriber.package).await? else {
            return Ok(self.drop_payment(tenant, payload, DropReason::NoPackage));
        };
        let amount = match payload.amount() {
            Some(amount) if amount > Decimal::ZERO => amount,
            _ => return Ok(self.drop_payment(tenant, payload, DropReason::InvalidAmount)),
        };
        let periods = amount
            .checked_div(package.price)
            .and_then(|q| q.floor().to_u32())
            .unwrap_or(0);
        if amount < package.price || periods < 1 {
            let reason = DropReason::Underpaid { amount, price: package.price };
            return Ok(self.drop_payment(tenant, payload, reason));
        }

        let mut tx = PaymentTransaction::pending(tenant, TransactionKind::C2b, amount, reference, now);
        tx.subscriber = Some(subscriber.id);
        tx.package = Some(package.id);
        tx.counterparty = payload.phone.clone();
        tx.receipt = payload.receipt.clone();
        tx.periods = Some(periods);
        tx.raw_response = Some(payload.raw.clone());
        tx.status = TransactionStatus::Completed;
        tx.completed_at = Some(now);
        let transaction = tx.id;

        match self.transactions.insert_transaction(tx).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(reason)) => {
                info!(%tenant, reference, %reason, "bill-pay already recorded");
                return Ok(Outcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        }

        let Some(expiry) = self
            .directory
            .extend_subscription(&subscriber.id, &package.id, periods, now)
            .await?
        else {
            error!(%tenant, subscriber = %subscriber.id, %transaction, "paid subscriber no longer exists");
            return Ok(Outcome::Failed(format!("subscriber {} vanished", subscriber.id)));
        };

        info!(%tenant, login = reference, periods, %expiry, "subscription extended");
        self.notifier.publish(BillingEvent::PaymentApplied {
            tenant,
            transaction,
            subscriber: subscriber.id,
            periods,
            expiry,
        });
        Ok(Outcome::Applied { transaction, subscriber: subscriber.id, periods, expiry })
    }

    /// The subscriber's own package, else the tenant's cheapest
    async fn billing_package(
        &self,
        tenant: TenantId,
        assigned: Option<ispgate_common::PackageId>,
    ) -> Result<Option<Package>, BillingError> {
        if let Some(id) = assigned {
            if let Some(package) = self.directory.find_package(&id).await? {
                if package.tenant == tenant {
                    return Ok(Some(package));
                }
            }
        }
        Ok(self.directory.cheapest_package(&tenant).await?)
    }

    fn drop_payment(&self, tenant: TenantId, payload: &CallbackPayload, reason: DropReason) -> Outcome {
        warn!(
            %tenant,
            reference = ?payload.reference,
            receipt = ?payload.receipt,
            amount = ?payload.amount,
            %reason,
            "payment acknowledged but not applied"
        );
        self.notifier.publish(BillingEvent::PaymentDropped {
            tenant,
            reference: payload.reference.clone(),
            receipt: payload.receipt.clone(),
            amount: payload.amount(),
            phone: payload.phone.clone(),
            reason: reason.to_string(),
        });
        Outcome::Dropped(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ispgate_common::*;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<BillingEvent>>,
    }

    impl Notifier for RecordingNotifier {
        fn publish(&self, event: BillingEvent) {
            self.events.lock().push(event);
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        reconciler: Reconciler,
        tenant: Tenant,
        package: Package,
        subscriber: Subscriber,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let tenant = Tenant {
            id: TenantId::new(),
            name: "Agency".into(),
            mpesa: Some(MpesaAccount {
                shortcode: "600000".into(),
                b2c_shortcode: None,
                b2b_shortcode: None,
                environment: MpesaEnvironment::Sandbox,
                consumer_key: "k".into(),
                consumer_secret: "s".into(),
                passkey: None,
                initiator_name: None,
                initiator_password: None,
            }),
        };
        let package = Package::new(tenant.id, "Home 10", dec!(1000), 10.0, 5.0);
        let subscriber = Subscriber::new(tenant.id, Login::parse("alice").unwrap(), Credential::new("pw"));
        store.insert_tenant(tenant.clone());
        store.insert_package(package.clone());
        store.insert_subscriber(subscriber.clone()).unwrap();
        let reconciler = Reconciler::new(store.clone(), store.clone(), store.clone(), notifier.clone());
        Fixture { store, notifier, reconciler, tenant, package, subscriber }
    }

    fn confirmation(reference: &str, amount: &str, receipt: &str) -> CallbackPayload {
        CallbackPayload::from_json(json!({
            "TransactionType": "Pay Bill",
            "TransID": receipt,
            "TransAmount": amount,
            "BusinessShortCode": "600000",
            "BillRefNumber": reference,
            "MSISDN": "254700000001"
        }))
        .unwrap()
    }

    impl Fixture {
        async fn subscriber_now(&self) -> Subscriber {
            self.store.find_subscriber(&self.subscriber.id).await.unwrap().unwrap()
        }

        async fn pending(&self, reference: &str, periods: u32) -> PaymentTransaction {
            let mut tx = PaymentTransaction::pending(self.tenant.id, TransactionKind::C2b, dec!(1000), reference, Utc::now());
            tx.subscriber = Some(self.subscriber.id);
            tx.package = Some(self.package.id);
            tx.periods = Some(periods);
            self.store.insert_transaction(tx.clone()).await.unwrap();
            tx
        }

        fn dropped_events(&self) -> usize {
            self.notifier
                .events
                .lock()
                .iter()
                .filter(|e| matches!(e, BillingEvent::PaymentDropped { .. }))
                .count()
        }
    }

    #[test]
    fn test_payload_flat_and_nested() {
        let flat = confirmation("alice", "2500.00", "QK1");
        assert_eq!(flat.shortcode.as_deref(), Some("600000"));
        assert_eq!(flat.amount(), Some(dec!(2500)));

        let nested = CallbackPayload::from_json(json!({
            "Result": {
                "ResultType": 0,
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user",
                "TransactionID": "QK2",
                "ReferenceData": {"ReferenceItem": {"Key": "Occasion", "Value": "REFUND1"}}
            }
        }))
        .unwrap();
        assert_eq!(nested.result_code, Some(1032));
        assert_eq!(nested.reference.as_deref(), Some("REFUND1"));
        assert_eq!(nested.receipt.as_deref(), Some("QK2"));
        assert!(nested.shortcode.is_none());

        assert!(CallbackPayload::from_json(json!("nope")).is_err());
    }

    #[tokio::test]
    async fn test_bill_pay_extends_from_now() {
        let f = fixture();
        let now = Utc::now();

        let outcome = f
            .reconciler
            .handle(CallbackKind::Confirmation, None, &confirmation("alice", "2500", "QK1"), now)
            .await;

        let Outcome::Applied { periods, expiry, .. } = outcome else {
            panic!("expected applied, got {:?}", outcome);
        };
        assert_eq!(periods, 2);
        assert_eq!(expiry, now + Duration::days(60));
        let sub = f.subscriber_now().await;
        assert!(sub.is_active());
        assert_eq!(sub.expiry, Some(now + Duration::days(60)));
        assert_eq!(sub.package, Some(f.package.id));
    }

    #[tokio::test]
    async fn test_bill_pay_extends_remaining_time() {
        let f = fixture();
        let now = Utc::now();
        f.store
            .extend_subscription(&f.subscriber.id, &f.package.id, 0, now + Duration::days(10))
            .await
            .unwrap();

        f.reconciler
            .handle(CallbackKind::Confirmation, None, &confirmation("alice", "2500", "QK1"), now)
            .await;

        let sub = f.subscriber_now().await;
        assert_eq!(sub.expiry, Some(now + Duration::days(10) + Duration::days(60)));
    }

    #[tokio::test]
    async fn test_underpayment_dropped_without_mutation() {
        let f = fixture();
        let outcome = f
            .reconciler
            .handle(CallbackKind::Confirmation, None, &confirmation("alice", "900", "QK1"), Utc::now())
            .await;

        assert_eq!(outcome, Outcome::Dropped(DropReason::Underpaid { amount: dec!(900), price: dec!(1000) }));
        assert_eq!(f.store.transaction_count(), 0);
        let sub = f.subscriber_now().await;
        assert!(sub.expiry.is_none());
        assert!(!sub.is_active());
        assert_eq!(f.dropped_events(), 1);
    }

    #[tokio::test]
    async fn test_unknown_login_dropped() {
        let f = fixture();
        let outcome = f
            .reconciler
            .handle(CallbackKind::Confirmation, None, &confirmation("ghost", "1000", "QK1"), Utc::now())
            .await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::UnknownSubscriber));
        assert_eq!(f.dropped_events(), 1);
    }

    #[tokio::test]
    async fn test_bill_pay_redelivery_extends_once() {
        let f = fixture();
        let now = Utc::now();
        let payload = confirmation("alice", "1000", "QK1");

        let first = f.reconciler.handle(CallbackKind::Confirmation, None, &payload, now).await;
        let second = f.reconciler.handle(CallbackKind::Confirmation, None, &payload, now).await;

        assert!(matches!(first, Outcome::Applied { periods: 1, .. }));
        assert_eq!(second, Outcome::Duplicate);
        assert_eq!(f.subscriber_now().await.expiry, Some(now + Duration::days(30)));
        assert_eq!(f.store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_bill_pay_without_receipt_is_dropped() {
        let f = fixture();
        let now = Utc::now();
        let payload = CallbackPayload::from_json(json!({
            "TransAmount": "1000",
            "BusinessShortCode": "600000",
            "BillRefNumber": "alice"
        }))
        .unwrap();

        let first = f.reconciler.handle(CallbackKind::Confirmation, None, &payload, now).await;
        let second = f.reconciler.handle(CallbackKind::Confirmation, None, &payload, now).await;

        assert_eq!(first, Outcome::Dropped(DropReason::MissingReceipt));
        assert_eq!(second, Outcome::Dropped(DropReason::MissingReceipt));
        assert!(f.subscriber_now().await.expiry.is_none());
        assert_eq!(f.store.transaction_count(), 0);
        assert_eq!(f.dropped_events(), 2);
    }

    #[tokio::test]
    async fn test_solicited_completion_is_idempotent() {
        let f = fixture();
        let now = Utc::now();
        let tx = f.pending("SUB123456", 1).await;
        let payload = confirmation("SUB123456", "1000", "QK7");

        let first = f.reconciler.handle(CallbackKind::Confirmation, None, &payload, now).await;
        assert_eq!(
            first,
            Outcome::Settled {
                transaction: tx.id,
                status: TransactionStatus::Completed,
                expiry: Some(now + Duration::days(30)),
            }
        );
        let second = f.reconciler.handle(CallbackKind::Confirmation, None, &payload, now).await;
        assert_eq!(second, Outcome::Duplicate);

        // same callback without a receipt id is still recognised
        let bare = CallbackPayload::from_json(json!({"BusinessShortCode": "600000", "BillRefNumber": "SUB123456"})).unwrap();
        let third = f.reconciler.handle(CallbackKind::Confirmation, None, &bare, now).await;
        assert_eq!(third, Outcome::Duplicate);

        assert_eq!(f.subscriber_now().await.expiry, Some(now + Duration::days(30)));
        assert_eq!(f.dropped_events(), 0);
        let stored = f.store.find_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.receipt.as_deref(), Some("QK7"));
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_validation_then_confirmation() {
        let f = fixture();
        let now = Utc::now();
        let tx = f.pending("SUB1", 2).await;
        let payload = confirmation("SUB1", "2000", "QK3");

        let validated = f.reconciler.handle(CallbackKind::Validation, None, &payload, now).await;
        assert_eq!(validated, Outcome::Validated(tx.id));

        let settled = f.reconciler.handle(CallbackKind::Confirmation, None, &payload, now).await;
        assert!(matches!(settled, Outcome::Settled { status: TransactionStatus::Completed, .. }));
        assert_eq!(f.subscriber_now().await.expiry, Some(now + Duration::days(60)));

        let unmatched = f.reconciler.handle(CallbackKind::Validation, None, &payload, now).await;
        assert_eq!(unmatched, Outcome::Accepted);
    }

    #[tokio::test]
    async fn test_result_codes_map_to_terminal_states() {
        let f = fixture();
        let now = Utc::now();
        for (code, status) in [
            (1032, TransactionStatus::Cancelled),
            (1037, TransactionStatus::Timeout),
            (2001, TransactionStatus::Failed),
        ] {
            let reference = format!("REF{}", code);
            let tx = f.pending(&reference, 1).await;
            let payload = CallbackPayload::from_json(json!({
                "Result": {
                    "ResultCode": code,
                    "ReferenceData": {"ReferenceItem": [{"Key": "Occasion", "Value": reference}]}
                }
            }))
            .unwrap();

            let outcome = f.reconciler.handle(CallbackKind::Result, Some(f.tenant.id), &payload, now).await;
            assert_eq!(outcome, Outcome::Settled { transaction: tx.id, status, expiry: None });
        }
        assert!(f.subscriber_now().await.expiry.is_none());
    }

    #[tokio::test]
    async fn test_timeout_and_missing_transaction() {
        let f = fixture();
        let now = Utc::now();
        let tx = f.pending("SUB9", 1).await;
        let payload = CallbackPayload::from_json(json!({"BusinessShortCode": "600000", "BillRefNumber": "SUB9"})).unwrap();

        let outcome = f.reconciler.handle(CallbackKind::Timeout, None, &payload, now).await;
        assert!(matches!(outcome, Outcome::Settled { status: TransactionStatus::Timeout, .. }));
        let stored = f.store.find_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Timeout);

        let again = f.reconciler.handle(CallbackKind::Timeout, None, &payload, now).await;
        assert_eq!(again, Outcome::NotFound);
    }

    #[tokio::test]
    async fn test_cheapest_package_fallback() {
        let f = fixture();
        f.store.insert_package(Package::new(f.tenant.id, "Lite", dec!(500), 2.0, 1.0));

        let outcome = f
            .reconciler
            .handle(CallbackKind::Confirmation, None, &confirmation("alice", "1500", "QK1"), Utc::now())
            .await;
        assert!(matches!(outcome, Outcome::Applied { periods: 3, .. }));
    }

    #[tokio::test]
    async fn test_unknown_shortcode_unroutable() {
        let f = fixture();
        let payload = CallbackPayload::from_json(json!({"BusinessShortCode": "999999", "BillRefNumber": "alice"})).unwrap();
        let outcome = f.reconciler.handle(CallbackKind::Confirmation, None, &payload, Utc::now()).await;
        assert_eq!(outcome, Outcome::Unroutable);
        assert!(f.subscriber_now().await.expiry.is_none());
    }
}
