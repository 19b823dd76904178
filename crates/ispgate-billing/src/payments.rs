//! Outbound payment initiation
//!
//! A transaction is persisted as pending before the provider is asked to
//! move money, and the provider's answer is attached to it afterwards.
//! Callbacks find it again by `(tenant, reference)`.

use crate::gateway::{CallbackUrls, GatewayCredentials, PaymentGateway, PaymentOrder};
use crate::BillingError;
use chrono::{DateTime, Utc};
use ispgate_common::{
    PackageId, PaymentTransaction, SubscriberDirectory, SubscriberId, TenantDirectory, TenantId, TransactionFilter,
    TransactionId, TransactionKind, TransactionStatus, TransactionStore, TransactionUpdate,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

/// A payment to start
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRequest {
    pub kind: TransactionKind,
    pub amount: Decimal,
    /// Payer (C2B) or payee (B2C) phone
    #[serde(default)]
    pub phone: Option<String>,
    /// Receiving business shortcode (B2B)
    #[serde(default)]
    pub receiver_shortcode: Option<String>,
    pub reference: String,
    #[serde(default)]
    pub remarks: Option<String>,
}

impl PaymentRequest {
    fn counterparty(&self) -> Result<String, BillingError> {
        let (value, what) = match self.kind {
            TransactionKind::B2b => (self.receiver_shortcode.as_deref(), "receiver shortcode"),
            TransactionKind::C2b | TransactionKind::B2c => (self.phone.as_deref(), "phone number"),
        };
        value
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| BillingError::InvalidRequest(format!("{} is required", what)))
    }

    fn validate(&self) -> Result<String, BillingError> {
        if self.amount <= Decimal::ZERO {
            return Err(BillingError::InvalidRequest("amount must be positive".into()));
        }
        if self.reference.trim().is_empty() {
            return Err(BillingError::InvalidRequest("reference is required".into()));
        }
        self.counterparty()
    }
}

/// A subscriber paying for one or more billing periods of a package
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionPayment {
    pub subscriber: SubscriberId,
    pub package: PackageId,
    pub amount: Decimal,
    pub phone: String,
    #[serde(default = "one_period")]
    pub periods: u32,
    #[serde(default)]
    pub remarks: Option<String>,
}

fn one_period() -> u32 {
    1
}

pub struct PaymentService {
    tenants: Arc<dyn TenantDirectory>,
    directory: Arc<dyn SubscriberDirectory>,
    transactions: Arc<dyn TransactionStore>,
    gateway: Arc<dyn PaymentGateway>,
    callback_base_url: String,
    /// Provider host override, for stubs
    provider_base_url: Option<String>,
}

impl PaymentService {
    pub fn new(
        tenants: Arc<dyn TenantDirectory>,
        directory: Arc<dyn SubscriberDirectory>,
        transactions: Arc<dyn TransactionStore>,
        gateway: Arc<dyn PaymentGateway>,
        callback_base_url: impl Into<String>,
    ) -> Self {
        Self {
            tenants,
            directory,
            transactions,
            gateway,
            callback_base_url: callback_base_url.into(),
            provider_base_url: None,
        }
    }

    /// Send every provider call to `base_url` instead of the tenant's
    /// environment host
    pub fn with_provider_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.provider_base_url = Some(base_url.into());
        self
    }

    async fn credentials(&self, tenant: TenantId) -> Result<GatewayCredentials, BillingError> {
        let record = self
            .tenants
            .find_tenant(&tenant)
            .await?
            .ok_or(BillingError::TenantNotFound(tenant))?;
        let creds = GatewayCredentials::from_tenant(&record)?;
        Ok(match &self.provider_base_url {
            Some(url) => creds.with_base_url(url.clone()),
            None => creds,
        })
    }

    /// Start a payment
    ///
    /// Nothing is stored when the provider cannot even issue a token. Once
    /// the pending transaction exists, a rejected initiation fails it with
    /// the provider's error recorded.
    pub async fn initiate(
        &self,
        tenant: TenantId,
        request: PaymentRequest,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransaction, BillingError> {
        let counterparty = request.validate()?;
        let mut tx = PaymentTransaction::pending(tenant, request.kind, request.amount, request.reference.trim(), now);
        tx.counterparty = Some(counterparty);
        tx.remarks = request.remarks;
        self.submit(tx).await
    }

    /// Start a C2B payment that extends `payment.subscriber` on completion
    pub async fn initiate_subscription(
        &self,
        tenant: TenantId,
        payment: SubscriptionPayment,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransaction, BillingError> {
        let subscriber = self
            .directory
            .find_subscriber(&payment.subscriber)
            .await?
            .filter(|s| s.tenant == tenant)
            .ok_or(BillingError::SubscriberNotFound(payment.subscriber))?;
        self.directory
            .find_package(&payment.package)
            .await?
            .filter(|p| p.tenant == tenant)
            .ok_or(BillingError::PackageNotFound(payment.package))?;
        if payment.periods == 0 {
            return Err(BillingError::InvalidRequest("periods must be at least 1".into()));
        }

        let id = subscriber.id.to_string();
        let reference = format!("SUB{}{}", &id[id.len().saturating_sub(6)..], now.timestamp());
        let request = PaymentRequest {
            kind: TransactionKind::C2b,
            amount: payment.amount,
            phone: Some(payment.phone),
            receiver_shortcode: None,
            reference,
            remarks: payment.remarks,
        };
        let counterparty = request.validate()?;

        let mut tx = PaymentTransaction::pending(tenant, TransactionKind::C2b, request.amount, request.reference, now);
        tx.counterparty = Some(counterparty);
        tx.remarks = request.remarks;
        tx.subscriber = Some(subscriber.id);
        tx.package = Some(payment.package);
        tx.periods = Some(payment.periods);
        self.submit(tx).await
    }

    async fn submit(&self, mut tx: PaymentTransaction) -> Result<PaymentTransaction, BillingError> {
        let creds = self.credentials(tx.tenant).await?;
        let token = self.gateway.access_token(&creds).await?;
        self.transactions.insert_transaction(tx.clone()).await?;

        let order = PaymentOrder {
            kind: tx.kind,
            amount: tx.amount,
            counterparty: tx.counterparty.clone().unwrap_or_default(),
            reference: tx.reference.clone(),
            remarks: tx.remarks.clone().unwrap_or_else(|| "Payment".to_string()),
        };
        let urls = CallbackUrls::new(&self.callback_base_url, tx.tenant);
        let sent = match tx.kind {
            TransactionKind::C2b => self.gateway.initiate_c2b(&creds, &token, &order).await,
            TransactionKind::B2c => self.gateway.initiate_b2c(&creds, &token, &order, &urls).await,
            TransactionKind::B2b => self.gateway.initiate_b2b(&creds, &token, &order, &urls).await,
        };

        match sent {
            Ok(response) => {
                self.transactions.attach_response(&tx.id, response.clone()).await?;
                tx.raw_response = Some(response);
                info!(tenant = %tx.tenant, transaction = %tx.id, kind = ?tx.kind, reference = %tx.reference, "payment initiated");
                Ok(tx)
            }
            Err(e) => {
                error!(tenant = %tx.tenant, transaction = %tx.id, error = %e, "payment initiation failed");
                let update = TransactionUpdate {
                    status: TransactionStatus::Failed,
                    receipt: None,
                    raw_response: Some(json!({ "error": e.to_string() })),
                };
                self.transactions.update_open(&tx.id, &update, Utc::now()).await?;
                Err(e.into())
            }
        }
    }

    /// Cancel an open transaction
    pub async fn cancel(&self, id: TransactionId, now: DateTime<Utc>) -> Result<PaymentTransaction, BillingError> {
        let update = TransactionUpdate::status(TransactionStatus::Cancelled);
        let tx = self
            .transactions
            .update_open(&id, &update, now)
            .await?
            .ok_or(BillingError::NotOpen(id))?;
        info!(tenant = %tx.tenant, transaction = %id, "transaction cancelled");
        Ok(tx)
    }

    /// Register the tenant's C2B callback URLs with the provider
    pub async fn register_urls(&self, tenant: TenantId) -> Result<Value, BillingError> {
        let creds = self.credentials(tenant).await?;
        let token = self.gateway.access_token(&creds).await?;
        let urls = CallbackUrls::new(&self.callback_base_url, tenant);
        let response = self.gateway.register_urls(&creds, &token, &urls).await?;
        info!(%tenant, confirmation = %urls.confirmation, "callback URLs registered");
        Ok(response)
    }

    /// Ask for the tenant's account balance; the answer arrives on the
    /// result callback
    pub async fn check_balance(&self, tenant: TenantId) -> Result<Value, BillingError> {
        let creds = self.credentials(tenant).await?;
        let token = self.gateway.access_token(&creds).await?;
        let urls = CallbackUrls::new(&self.callback_base_url, tenant);
        Ok(self.gateway.check_balance(&creds, &token, &urls).await?)
    }

    pub async fn find(&self, id: TransactionId) -> Result<Option<PaymentTransaction>, BillingError> {
        Ok(self.transactions.find_transaction(&id).await?)
    }

    /// Transactions matching `filter`, newest first
    pub async fn list(&self, filter: &TransactionFilter) -> Result<Vec<PaymentTransaction>, BillingError> {
        Ok(self.transactions.list_transactions(filter).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::GatewayError;
    use ispgate_common::*;
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<MemoryStore>,
        gateway: Arc<MockGateway>,
        service: PaymentService,
        tenant: TenantId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
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
                initiator_name: Some("op".into()),
                initiator_password: Some("pw".into()),
            }),
        };
        store.insert_tenant(tenant.clone());
        let service = PaymentService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            gateway.clone(),
            "https://isp.example.com/",
        );
        Fixture { store, gateway, service, tenant: tenant.id }
    }

    fn c2b(amount: Decimal) -> PaymentRequest {
        PaymentRequest {
            kind: TransactionKind::C2b,
            amount,
            phone: Some("254700000001".into()),
            receiver_shortcode: None,
            reference: "INV-1".into(),
            remarks: None,
        }
    }

    #[tokio::test]
    async fn test_initiate_records_pending() {
        let f = fixture();
        let tx = f.service.initiate(f.tenant, c2b(dec!(500)), Utc::now()).await.unwrap();

        assert_eq!(tx.status, TransactionStatus::Pending);
        let stored = f.store.find_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.counterparty.as_deref(), Some("254700000001"));
        assert_eq!(stored.raw_response.unwrap()["ConversationID"], "AG_INV-1");
        assert_eq!(f.gateway.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_initiation_fails_transaction() {
        let f = fixture();
        f.gateway.fail_initiate("Invalid Access Token");

        let err = f.service.initiate(f.tenant, c2b(dec!(500)), Utc::now()).await.unwrap_err();
        assert!(matches!(err, BillingError::Gateway(GatewayError::Status { status: 400, .. })));

        let all = f.service.list(&TransactionFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, TransactionStatus::Failed);
        let raw = all[0].raw_response.clone().unwrap();
        assert!(raw["error"].as_str().unwrap().contains("Invalid Access Token"));
    }

    #[tokio::test]
    async fn test_token_failure_stores_nothing() {
        let f = fixture();
        f.gateway.fail_token();

        assert!(f.service.initiate(f.tenant, c2b(dec!(500)), Utc::now()).await.is_err());
        assert_eq!(f.store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_request_validation() {
        let f = fixture();
        let zero = f.service.initiate(f.tenant, c2b(Decimal::ZERO), Utc::now()).await;
        assert!(matches!(zero, Err(BillingError::InvalidRequest(_))));

        let mut b2b = c2b(dec!(100));
        b2b.kind = TransactionKind::B2b;
        let missing = f.service.initiate(f.tenant, b2b, Utc::now()).await;
        assert!(matches!(missing, Err(BillingError::InvalidRequest(_))));

        let unknown = f.service.initiate(TenantId::new(), c2b(dec!(100)), Utc::now()).await;
        assert!(matches!(unknown, Err(BillingError::TenantNotFound(_))));
        assert_eq!(f.store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_payment_reference() {
        let f = fixture();
        let package = Package::new(f.tenant, "Home", dec!(1000), 10.0, 5.0);
        let subscriber = Subscriber::new(f.tenant, Login::parse("alice").unwrap(), Credential::new("pw"));
        f.store.insert_package(package.clone());
        f.store.insert_subscriber(subscriber.clone()).unwrap();
        let now = Utc::now();

        let payment = SubscriptionPayment {
            subscriber: subscriber.id,
            package: package.id,
            amount: dec!(2000),
            phone: "254700000001".into(),
            periods: 2,
            remarks: None,
        };
        let tx = f.service.initiate_subscription(f.tenant, payment, now).await.unwrap();

        let id = subscriber.id.to_string();
        assert_eq!(tx.reference, format!("SUB{}{}", &id[id.len() - 6..], now.timestamp()));
        assert_eq!(tx.subscriber, Some(subscriber.id));
        assert_eq!(tx.periods, Some(2));
        assert_eq!(tx.kind, TransactionKind::C2b);
    }

    #[tokio::test]
    async fn test_subscription_payment_checks_tenant() {
        let f = fixture();
        let other = TenantId::new();
        let subscriber = Subscriber::new(other, Login::parse("bob").unwrap(), Credential::new("pw"));
        f.store.insert_subscriber(subscriber.clone()).unwrap();

        let payment = SubscriptionPayment {
            subscriber: subscriber.id,
            package: PackageId::new(),
            amount: dec!(1000),
            phone: "254700000002".into(),
            periods: 1,
            remarks: None,
        };
        let err = f.service.initiate_subscription(f.tenant, payment, Utc::now()).await.unwrap_err();
        assert!(matches!(err, BillingError::SubscriberNotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_only_open() {
        let f = fixture();
        let tx = f.service.initiate(f.tenant, c2b(dec!(500)), Utc::now()).await.unwrap();

        let cancelled = f.service.cancel(tx.id, Utc::now()).await.unwrap();
        assert_eq!(cancelled.status, TransactionStatus::Cancelled);
        assert!(matches!(f.service.cancel(tx.id, Utc::now()).await, Err(BillingError::NotOpen(_))));
    }

    #[tokio::test]
    async fn test_register_urls_carry_tenant() {
        let f = fixture();
        let response = f.service.register_urls(f.tenant).await.unwrap();
        assert_eq!(
            response["ConfirmationURL"],
            format!("https://isp.example.com/api/mpesa/confirmation?tenant={}", f.tenant)
        );
    }
}
