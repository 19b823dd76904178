//! Mobile-money gateway client
//!
//! [`PaymentGateway`] is the seam to the provider. Credentials are passed
//! on every call as a [`GatewayCredentials`] built from the tenant record
//! fetched for the request, so no client ever holds a tenant's secrets
//! between requests.

use async_trait::async_trait;
use base64::Engine as _;
use ispgate_common::{MpesaEnvironment, Tenant, TenantId, TransactionKind};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Sandbox API host
pub const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
/// Production API host
pub const PRODUCTION_BASE_URL: &str = "https://api.safaricom.co.ke";

/// Gateway errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider returned no access token")]
    MissingToken,

    #[error("undecodable provider response: {0}")]
    Decode(String),

    #[error("tenant has no {0} configured")]
    MissingCredential(&'static str),
}

/// Per-call provider credentials for one tenant
#[derive(Clone)]
pub struct GatewayCredentials {
    pub tenant: TenantId,
    pub base_url: String,
    pub shortcode: String,
    pub b2c_shortcode: Option<String>,
    pub b2b_shortcode: Option<String>,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub initiator_name: Option<String>,
    pub initiator_password: Option<String>,
}

impl GatewayCredentials {
    pub fn from_tenant(tenant: &Tenant) -> Result<Self, GatewayError> {
        let account = tenant
            .mpesa
            .as_ref()
            .ok_or(GatewayError::MissingCredential("payment account"))?;
        let base_url = match account.environment {
            MpesaEnvironment::Sandbox => SANDBOX_BASE_URL,
            MpesaEnvironment::Production => PRODUCTION_BASE_URL,
        };
        Ok(Self {
            tenant: tenant.id,
            base_url: base_url.to_string(),
            shortcode: account.shortcode.clone(),
            b2c_shortcode: account.b2c_shortcode.clone(),
            b2b_shortcode: account.b2b_shortcode.clone(),
            consumer_key: account.consumer_key.clone(),
            consumer_secret: account.consumer_secret.clone(),
            initiator_name: account.initiator_name.clone(),
            initiator_password: account.initiator_password.clone(),
        })
    }

    /// Point at another host, e.g. a local stub
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn initiator(&self) -> Result<(&str, &str), GatewayError> {
        let name = self
            .initiator_name
            .as_deref()
            .ok_or(GatewayError::MissingCredential("initiator name"))?;
        let password = self
            .initiator_password
            .as_deref()
            .ok_or(GatewayError::MissingCredential("initiator password"))?;
        Ok((name, password))
    }
}

impl fmt::Debug for GatewayCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayCredentials")
            .field("tenant", &self.tenant)
            .field("base_url", &self.base_url)
            .field("shortcode", &self.shortcode)
            .finish_non_exhaustive()
    }
}

/// Provider callback URLs registered for, or sent with, a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackUrls {
    pub confirmation: String,
    pub validation: String,
    pub timeout: String,
    pub result: String,
}

impl CallbackUrls {
    /// `<base>/api/mpesa/<endpoint>?tenant=<id>`; the tenant hint routes
    /// result callbacks that carry no shortcode
    pub fn new(base_url: &str, tenant: TenantId) -> Self {
        let base = base_url.trim_end_matches('/');
        let url = |endpoint: &str| format!("{}/api/mpesa/{}?tenant={}", base, endpoint, tenant);
        Self {
            confirmation: url("confirmation"),
            validation: url("validation"),
            timeout: url("timeout"),
            result: url("result"),
        }
    }
}

/// One outbound payment request
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentOrder {
    pub kind: TransactionKind,
    pub amount: Decimal,
    /// Payer/payee phone, or receiving shortcode for B2B
    pub counterparty: String,
    pub reference: String,
    pub remarks: String,
}

/// Provider operations
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn access_token(&self, creds: &GatewayCredentials) -> Result<String, GatewayError>;

    async fn register_urls(
        &self,
        creds: &GatewayCredentials,
        token: &str,
        urls: &CallbackUrls,
    ) -> Result<Value, GatewayError>;

    async fn initiate_c2b(&self, creds: &GatewayCredentials, token: &str, order: &PaymentOrder) -> Result<Value, GatewayError>;

    async fn initiate_b2c(
        &self,
        creds: &GatewayCredentials,
        token: &str,
        order: &PaymentOrder,
        urls: &CallbackUrls,
    ) -> Result<Value, GatewayError>;

    async fn initiate_b2b(
        &self,
        creds: &GatewayCredentials,
        token: &str,
        order: &PaymentOrder,
        urls: &CallbackUrls,
    ) -> Result<Value, GatewayError>;

    async fn check_balance(
        &self,
        creds: &GatewayCredentials,
        token: &str,
        urls: &CallbackUrls,
    ) -> Result<Value, GatewayError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// Daraja REST client
#[derive(Clone)]
pub struct DarajaClient {
    client: Client,
}

impl DarajaClient {
    /// Client whose every request is bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn post(&self, creds: &GatewayCredentials, token: &str, path: &str, body: Value) -> Result<Value, GatewayError> {
        let url = format!("{}{}", creds.base_url, path);
        debug!(%url, tenant = %creds.tenant, "provider request");
        let response = self.client.post(&url).bearer_auth(token).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(GatewayError::Status { status: status.as_u16(), body: text });
        }
        serde_json::from_str(&text).map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

fn amount_field(amount: Decimal) -> String {
    amount.normalize().to_string()
}

#[async_trait]
impl PaymentGateway for DarajaClient {
    async fn access_token(&self, creds: &GatewayCredentials) -> Result<String, GatewayError> {
        let basic = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", creds.consumer_key, creds.consumer_secret));
        let response = self
            .client
            .get(format!("{}/oauth/v1/generate", creds.base_url))
            .query(&[("grant_type", "client_credentials")])
            .header(reqwest::header::AUTHORIZATION, format!("Basic {}", basic))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status { status: status.as_u16(), body });
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(GatewayError::MissingToken)
    }

    async fn register_urls(
        &self,
        creds: &GatewayCredentials,
        token: &str,
        urls: &CallbackUrls,
    ) -> Result<Value, GatewayError> {
        let body = json!({
            "ShortCode": creds.shortcode,
            "ResponseType": "Completed",
            "ConfirmationURL": urls.confirmation,
            "ValidationURL": urls.validation,
        });
        self.post(creds, token, "/mpesa/c2b/v1/registerurl", body).await
    }

    async fn initiate_c2b(&self, creds: &GatewayCredentials, token: &str, order: &PaymentOrder) -> Result<Value, GatewayError> {
        let body = json!({
            "ShortCode": creds.shortcode,
            "CommandID": "CustomerPayBillOnline",
            "Amount": amount_field(order.amount),
            "Msisdn": order.counterparty,
            "BillRefNumber": order.reference,
        });
        self.post(creds, token, "/mpesa/c2b/v1/simulate", body).await
    }

    async fn initiate_b2c(
        &self,
        creds: &GatewayCredentials,
        token: &str,
        order: &PaymentOrder,
        urls: &CallbackUrls,
    ) -> Result<Value, GatewayError> {
        let (initiator, credential) = creds.initiator()?;
        let party_a = creds
            .b2c_shortcode
            .as_deref()
            .ok_or(GatewayError::MissingCredential("B2C shortcode"))?;
        let body = json!({
            "InitiatorName": initiator,
            "SecurityCredential": credential,
            "CommandID": "BusinessPayment",
            "Amount": amount_field(order.amount),
            "PartyA": party_a,
            "PartyB": order.counterparty,
            "Remarks": order.remarks,
            "QueueTimeOutURL": urls.timeout,
            "ResultURL": urls.result,
            "Occasion": order.reference,
        });
        self.post(creds, token, "/mpesa/b2c/v1/paymentrequest", body).await
    }

    async fn initiate_b2b(
        &self,
        creds: &GatewayCredentials,
        token: &str,
        order: &PaymentOrder,
        urls: &CallbackUrls,
    ) -> Result<Value, GatewayError> {
        let (initiator, credential) = creds.initiator()?;
        let party_a = creds
            .b2b_shortcode
            .as_deref()
            .ok_or(GatewayError::MissingCredential("B2B shortcode"))?;
        let body = json!({
            "Initiator": initiator,
            "SecurityCredential": credential,
            "CommandID": "BusinessToBusinessPayment",
            "SenderIdentifierType": "4",
            "RecieverIdentifierType": "4",
            "Amount": amount_field(order.amount),
            "PartyA": party_a,
            "PartyB": order.counterparty,
            "AccountReference": order.reference,
            "Remarks": order.remarks,
            "QueueTimeOutURL": urls.timeout,
            "ResultURL": urls.result,
        });
        self.post(creds, token, "/mpesa/b2b/v1/paymentrequest", body).await
    }

    async fn check_balance(
        &self,
        creds: &GatewayCredentials,
        token: &str,
        urls: &CallbackUrls,
    ) -> Result<Value, GatewayError> {
        let (initiator, credential) = creds.initiator()?;
        let body = json!({
            "Initiator": initiator,
            "SecurityCredential": credential,
            "CommandID": "AccountBalance",
            "PartyA": creds.shortcode,
            "IdentifierType": "4",
            "Remarks": "Account balance query",
            "QueueTimeOutURL": urls.timeout,
            "ResultURL": urls.result,
        });
        self.post(creds, token, "/mpesa/accountbalance/v1/query", body).await
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    //! Scripted in-process gateway for tests

    use super::*;
    use parking_lot::Mutex;

    /// Records every call and answers from a script
    #[derive(Default)]
    pub struct MockGateway {
        calls: Mutex<Vec<(TransactionKind, PaymentOrder)>>,
        fail_token: Mutex<bool>,
        fail_initiate: Mutex<Option<String>>,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make token retrieval fail
        pub fn fail_token(&self) {
            *self.fail_token.lock() = true;
        }

        /// Make every initiation fail with `body`
        pub fn fail_initiate(&self, body: impl Into<String>) {
            *self.fail_initiate.lock() = Some(body.into());
        }

        /// Orders received so far
        pub fn orders(&self) -> Vec<(TransactionKind, PaymentOrder)> {
            self.calls.lock().clone()
        }

        fn answer(&self, kind: TransactionKind, order: &PaymentOrder) -> Result<Value, GatewayError> {
            self.calls.lock().push((kind, order.clone()));
            if let Some(body) = self.fail_initiate.lock().clone() {
                return Err(GatewayError::Status { status: 400, body });
            }
            Ok(json!({
                "ConversationID": format!("AG_{}", order.reference),
                "ResponseCode": "0",
                "ResponseDescription": "Accept the service request successfully.",
            }))
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn access_token(&self, _creds: &GatewayCredentials) -> Result<String, GatewayError> {
            if *self.fail_token.lock() {
                return Err(GatewayError::MissingToken);
            }
            Ok("mock-token".into())
        }

        async fn register_urls(&self, _: &GatewayCredentials, _: &str, urls: &CallbackUrls) -> Result<Value, GatewayError> {
            Ok(json!({"ResponseDescription": "success", "ConfirmationURL": urls.confirmation}))
        }

        async fn initiate_c2b(&self, _: &GatewayCredentials, _: &str, order: &PaymentOrder) -> Result<Value, GatewayError> {
            self.answer(TransactionKind::C2b, order)
        }

        async fn initiate_b2c(
            &self,
            _: &GatewayCredentials,
            _: &str,
            order: &PaymentOrder,
            _: &CallbackUrls,
        ) -> Result<Value, GatewayError> {
            self.answer(TransactionKind::B2c, order)
        }

        async fn initiate_b2b(
            &self,
            _: &GatewayCredentials,
            _: &str,
            order: &PaymentOrder,
            _: &CallbackUrls,
        ) -> Result<Value, GatewayError> {
            self.answer(TransactionKind::B2b, order)
        }

        async fn check_balance(&self, _: &GatewayCredentials, _: &str, _: &CallbackUrls) -> Result<Value, GatewayError> {
            Ok(json!({"ResponseCode": "0"}))
        }
    }
}
