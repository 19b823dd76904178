//! ispgate HTTP API
//!
//! ```text
//! NAS ──RADIUS──▶ FreeRADIUS ──rest──▶ /radius/*     ──▶ RadiusEngine ─┐
//!                                                                        ├─▶ MemoryStore
//! provider ───────── callbacks ──────▶ /api/mpesa/*  ──▶ Reconciler   ─┤
//! operator ───────────────────────────▶ /api/tenants, /api/transactions ─▶ PaymentService
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod models;
pub mod routes;

use axum::routing::get;
use axum::{Json, Router};
use ispgate_billing::{Notifier, PaymentGateway, PaymentService, Reconciler};
use ispgate_common::MemoryStore;
use ispgate_radius::RadiusEngine;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

pub use config::ServiceConfig;
pub use error::ApiError;
pub use models::*;

/// API state
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub radius: RadiusEngine,
    pub reconciler: Reconciler,
    pub payments: PaymentService,
}

impl AppState {
    /// Wire every component to one store
    pub fn new(
        store: Arc<MemoryStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        callback_base_url: &str,
    ) -> Self {
        Self {
            radius: RadiusEngine::new(store.clone()),
            reconciler: Reconciler::new(store.clone(), store.clone(), store.clone(), notifier),
            payments: PaymentService::new(store.clone(), store.clone(), store.clone(), gateway, callback_base_url),
            store,
        }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "ispgate API",
        description = "RADIUS REST adapter and mobile-money billing",
        license(name = "Apache-2.0")
    ),
    paths(
        routes::health::health_check,
        routes::radius::authorize,
        routes::radius::authenticate,
        routes::radius::accounting,
        routes::radius::post_auth,
        routes::mpesa::validation,
        routes::mpesa::confirmation,
        routes::mpesa::result,
        routes::mpesa::timeout,
        routes::payments::initiate_payment,
        routes::payments::initiate_subscription_payment,
        routes::payments::register_urls,
        routes::payments::check_balance,
        routes::payments::list_transactions,
        routes::payments::get_transaction,
        routes::payments::cancel_transaction,
    ),
    components(schemas(routes::health::HealthResponse, CallbackAck, ErrorResponse)),
    tags(
        (name = "health", description = "Health check"),
        (name = "radius", description = "FreeRADIUS rest module calls"),
        (name = "mpesa", description = "Provider callbacks"),
        (name = "payments", description = "Payment initiation and transactions")
    )
)]
pub struct ApiDoc;

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Build the API router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api-docs/openapi.json", get(openapi))
        .nest("/radius", routes::radius::router())
        .nest("/api/mpesa", routes::mpesa::router())
        .merge(routes::payments::router())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(Arc::new(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use chrono::{Duration, Utc};
    use ispgate_billing::gateway::mock::MockGateway;
    use ispgate_billing::LogNotifier;
    use ispgate_common::*;
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};

    struct Fixture {
        server: TestServer,
        store: Arc<MemoryStore>,
        tenant: TenantId,
        alice: SubscriberId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
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
        let mut alice = Subscriber::new(tenant.id, Login::parse("alice").unwrap(), Credential::new("s3cret"));
        alice.status = SubscriberStatus::Active;
        alice.package = Some(package.id);
        alice.expiry = Some(Utc::now() + Duration::days(5));
        let mut bob = Subscriber::new(tenant.id, Login::parse("bob").unwrap(), Credential::new("pw"));
        bob.package = Some(package.id);

        store.insert_tenant(tenant.clone());
        store.insert_package(package);
        store.insert_subscriber(alice.clone()).unwrap();
        store.insert_subscriber(bob).unwrap();

        let state = AppState::new(
            store.clone(),
            Arc::new(MockGateway::new()),
            Arc::new(LogNotifier),
            "https://isp.example.com",
        );
        let server = TestServer::new(build_router(state)).unwrap();
        Fixture { server, store, tenant: tenant.id, alice: alice.id }
    }

    /// Reads come from a seeded store; every write and transaction lookup fails
    struct BrokenStore {
        inner: MemoryStore,
    }

    fn broken() -> RepositoryError {
        RepositoryError::Storage("connection reset".into())
    }

    #[async_trait::async_trait]
    impl SubscriberDirectory for BrokenStore {
        async fn find_by_login(&self, login: &str) -> RepoResult<Lookup<Subscriber>> {
            self.inner.find_by_login(login).await
        }

        async fn find_subscriber(&self, id: &SubscriberId) -> RepoResult<Option<Subscriber>> {
            self.inner.find_subscriber(id).await
        }

        async fn find_package(&self, id: &PackageId) -> RepoResult<Option<Package>> {
            self.inner.find_package(id).await
        }

        async fn cheapest_package(&self, tenant: &TenantId) -> RepoResult<Option<Package>> {
            self.inner.cheapest_package(tenant).await
        }

        async fn record_usage(&self, _: &SubscriberId, _: &SessionDelta) -> RepoResult<bool> {
            Err(broken())
        }

        async fn extend_subscription(
            &self,
            _: &SubscriberId,
            _: &PackageId,
            _: u32,
            _: chrono::DateTime<Utc>,
        ) -> RepoResult<Option<chrono::DateTime<Utc>>> {
            Err(broken())
        }
    }

    #[async_trait::async_trait]
    impl TenantDirectory for BrokenStore {
        async fn find_tenant(&self, id: &TenantId) -> RepoResult<Option<Tenant>> {
            self.inner.find_tenant(id).await
        }

        async fn find_by_shortcode(&self, shortcode: &str) -> RepoResult<Option<Tenant>> {
            self.inner.find_by_shortcode(shortcode).await
        }
    }

    #[async_trait::async_trait]
    impl AccountingStore for BrokenStore {
        async fn upsert_accounting(&self, _: AccountingRecord) -> RepoResult<Option<AccountingRecord>> {
            Err(broken())
        }

        async fn find_accounting(&self, _: &str) -> RepoResult<Option<AccountingRecord>> {
            Err(broken())
        }
    }

    #[async_trait::async_trait]
    impl PostAuthLog for BrokenStore {
        async fn append_post_auth(&self, _: PostAuthRecord) -> RepoResult<()> {
            Err(broken())
        }

        async fn list_post_auth(&self, _: Option<&str>) -> RepoResult<Vec<PostAuthRecord>> {
            Err(broken())
        }
    }

    #[async_trait::async_trait]
    impl TransactionStore for BrokenStore {
        async fn insert_transaction(&self, _: PaymentTransaction) -> RepoResult<()> {
            Err(broken())
        }

        async fn find_transaction(&self, _: &TransactionId) -> RepoResult<Option<PaymentTransaction>> {
            Err(broken())
        }

        async fn find_by_receipt(&self, _: &TenantId, _: &str) -> RepoResult<Option<PaymentTransaction>> {
            Err(broken())
        }

        async fn find_open(&self, _: &TenantId, _: &str) -> RepoResult<Option<PaymentTransaction>> {
            Err(broken())
        }

        async fn claim_open(
            &self,
            _: &TenantId,
            _: &str,
            _: &TransactionUpdate,
            _: chrono::DateTime<Utc>,
        ) -> RepoResult<Option<PaymentTransaction>> {
            Err(broken())
        }

        async fn update_open(
            &self,
            _: &TransactionId,
            _: &TransactionUpdate,
            _: chrono::DateTime<Utc>,
        ) -> RepoResult<Option<PaymentTransaction>> {
            Err(broken())
        }

        async fn attach_response(&self, _: &TransactionId, _: Value) -> RepoResult<bool> {
            Err(broken())
        }

        async fn list_transactions(&self, _: &TransactionFilter) -> RepoResult<Vec<PaymentTransaction>> {
            Err(broken())
        }
    }

    fn broken_server() -> TestServer {
        let inner = MemoryStore::new();
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
        let mut alice = Subscriber::new(tenant.id, Login::parse("alice").unwrap(), Credential::new("s3cret"));
        alice.status = SubscriberStatus::Active;
        alice.package = Some(package.id);
        inner.insert_tenant(tenant);
        inner.insert_package(package);
        inner.insert_subscriber(alice).unwrap();

        let store = Arc::new(BrokenStore { inner });
        let state = AppState {
            store: Arc::new(MemoryStore::new()),
            radius: RadiusEngine::new(store.clone()),
            reconciler: Reconciler::new(store.clone(), store.clone(), store.clone(), Arc::new(LogNotifier)),
            payments: PaymentService::new(
                store.clone(),
                store.clone(),
                store,
                Arc::new(MockGateway::new()),
                "https://isp.example.com",
            ),
        };
        TestServer::new(build_router(state)).unwrap()
    }

    #[tokio::test]
    async fn test_store_failure_on_accounting_is_server_error() {
        let server = broken_server();
        let response = server
            .post("/radius/accounting")
            .json(&json!({"username": "alice", "acct_session_id": "1", "acct_status_type": "Start"}))
            .await;
        assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.json::<Value>()["error"]["code"], "internal_error");

        let post_auth = server
            .post("/radius/post-auth")
            .json(&json!({"username": "alice", "packet_type": "Access-Accept"}))
            .await;
        assert_eq!(post_auth.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_store_failure_on_callback_still_acknowledged() {
        let server = broken_server();
        let response = server
            .post("/api/mpesa/confirmation")
            .json(&json!({
                "TransID": "QK9",
                "TransAmount": "1000",
                "BusinessShortCode": "600000",
                "BillRefNumber": "alice"
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<Value>(), json!({"ResultCode": "0", "ResultDesc": "Success"}));
    }

    #[tokio::test]
    async fn test_health() {
        let f = fixture();
        let response = f.server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<Value>()["status"], "healthy");
    }

    #[tokio::test]
    async fn test_authorize_returns_profile() {
        let f = fixture();
        let response = f.server.post("/radius/authorize").json(&json!({"username": "alice"})).await;

        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["control:Cleartext-Password"], json!({"value": ["s3cret"], "op": ":="}));
        assert_eq!(body["reply:Mikrotik-Rate-Limit"]["value"][0], "10M/5M");
    }

    #[tokio::test]
    async fn test_authorize_rejections() {
        let f = fixture();

        let unknown = f.server.post("/radius/authorize").json(&json!({"username": "ghost"})).await;
        assert_eq!(unknown.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(unknown.json::<Value>()["reply:Reply-Message"]["value"][0], "Login invalid");

        let disabled = f.server.post("/radius/authorize").json(&json!({"username": "bob"})).await;
        assert_eq!(disabled.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(disabled.json::<Value>()["reply:Reply-Message"]["value"][0], "Login disabled");

        let missing = f.server.post("/radius/authorize").json(&json!({})).await;
        assert_eq!(missing.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_authenticate_form_body() {
        let f = fixture();
        let ok = f
            .server
            .post("/radius/authenticate")
            .form(&[("User-Name", "alice"), ("User-Password", "s3cret")])
            .await;
        assert_eq!(ok.status_code(), StatusCode::NO_CONTENT);

        let wrong = f
            .server
            .post("/radius/authenticate")
            .form(&[("User-Name", "alice"), ("User-Password", "nope")])
            .await;
        assert_eq!(wrong.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(wrong.json::<Value>()["reply:Reply-Message"]["value"][0], "Wrong Password");
    }

    #[tokio::test]
    async fn test_accounting_session_counts_once() {
        let f = fixture();
        for status in ["Start", "Interim-Update", "Stop"] {
            let response = f
                .server
                .post("/radius/accounting")
                .form(&[
                    ("User-Name", "alice"),
                    ("Acct-Session-Id", "81000001"),
                    ("Acct-Status-Type", status),
                    ("Acct-Session-Time", "600"),
                    ("Acct-Input-Octets", "100"),
                    ("Acct-Input-Gigawords", "1"),
                ])
                .await;
            assert_eq!(response.status_code(), StatusCode::NO_CONTENT);
        }

        let alice = f.store.find_subscriber(&f.alice).await.unwrap().unwrap();
        assert_eq!(alice.usage.sessions, 1);
        assert_eq!(alice.usage.input_bytes, (1u64 << 32) + 100);
    }

    #[tokio::test]
    async fn test_accounting_errors() {
        let f = fixture();
        let unknown = f
            .server
            .post("/radius/accounting")
            .json(&json!({"username": "ghost", "acct_session_id": "1", "acct_status_type": "Start"}))
            .await;
        assert_eq!(unknown.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(unknown.json::<Value>()["reply:Reply-Message"]["value"][0], "Login invalid");

        let malformed = f
            .server
            .post("/radius/accounting")
            .json(&json!({"username": "alice", "acct_status_type": "Start"}))
            .await;
        assert_eq!(malformed.status_code(), StatusCode::BAD_REQUEST);

        let nas = f
            .server
            .post("/radius/accounting")
            .json(&json!({"acct_status_type": "Accounting-On", "nas_ip_address": "10.0.0.1"}))
            .await;
        assert_eq!(nas.status_code(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_post_auth_logged() {
        let f = fixture();
        let response = f
            .server
            .post("/radius/post-auth")
            .json(&json!({"username": "alice", "packet_type": "Access-Reject"}))
            .await;
        assert_eq!(response.status_code(), StatusCode::NO_CONTENT);
        assert_eq!(f.store.list_post_auth(Some("alice")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_confirmation_extends_and_acknowledges() {
        let f = fixture();
        let before = f.store.find_subscriber(&f.alice).await.unwrap().unwrap().expiry.unwrap();
        let body = json!({
            "TransID": "QK1",
            "TransAmount": "2000",
            "BusinessShortCode": "600000",
            "BillRefNumber": "alice",
            "MSISDN": "254700000001"
        });

        for _ in 0..2 {
            let response = f.server.post("/api/mpesa/confirmation").json(&body).await;
            assert_eq!(response.status_code(), StatusCode::OK);
            assert_eq!(response.json::<Value>(), json!({"ResultCode": "0", "ResultDesc": "Success"}));
        }

        let after = f.store.find_subscriber(&f.alice).await.unwrap().unwrap().expiry.unwrap();
        assert_eq!(after, before + Duration::days(60));
    }

    #[tokio::test]
    async fn test_dropped_payment_still_acknowledged() {
        let f = fixture();
        let response = f
            .server
            .post("/api/mpesa/confirmation")
            .json(&json!({"TransID": "QK2", "TransAmount": "900", "BusinessShortCode": "600000", "BillRefNumber": "alice"}))
            .await;
        assert_eq!(response.json::<Value>()["ResultCode"], "0");
        assert_eq!(f.store.transaction_count(), 0);

        let validation = f
            .server
            .post("/api/mpesa/validation")
            .json(&json!({"BusinessShortCode": "600000", "BillRefNumber": "alice"}))
            .await;
        assert_eq!(validation.json::<Value>(), json!({"ResultCode": "0", "ResultDesc": "Accepted"}));
    }

    #[tokio::test]
    async fn test_unreadable_callback_asks_for_retry() {
        let f = fixture();
        let response = f
            .server
            .post("/api/mpesa/result")
            .bytes(Bytes::from_static(b"{not json"))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<Value>()["ResultCode"], 1);
    }

    #[tokio::test]
    async fn test_subscription_payment_round_trip() {
        let f = fixture();
        let package = f.store.find_subscriber(&f.alice).await.unwrap().unwrap().package;
        let created = f
            .server
            .post(&format!("/api/tenants/{}/subscription-payments", f.tenant))
            .json(&json!({
                "subscriber": f.alice,
                "package": package,
                "amount": "1000",
                "phone": "254700000001"
            }))
            .await;
        assert_eq!(created.status_code(), StatusCode::CREATED);
        let tx: Value = created.json();
        let reference = tx["data"]["reference"].as_str().unwrap().to_string();
        assert_eq!(tx["data"]["status"], "pending");

        let result = f
            .server
            .post("/api/mpesa/result")
            .add_query_param("tenant", f.tenant)
            .json(&json!({"Result": {"ResultCode": 1032, "ReferenceData": {"ReferenceItem": {"Key": "Occasion", "Value": reference}}}}))
            .await;
        assert_eq!(result.json::<Value>()["ResultCode"], "0");

        let listed: Value = f
            .server
            .get("/api/transactions")
            .add_query_param("tenant", f.tenant)
            .add_query_param("status", "cancelled")
            .await
            .json();
        assert_eq!(listed["data"].as_array().unwrap().len(), 1);

        let id = tx["data"]["id"].as_str().unwrap();
        let cancel = f.server.post(&format!("/api/transactions/{}/cancel", id)).await;
        assert_eq!(cancel.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_tenant_payment() {
        let f = fixture();
        let response = f
            .server
            .post(&format!("/api/tenants/{}/payments", TenantId::new()))
            .json(&json!({"kind": "c2b", "amount": "10", "phone": "254700000001", "reference": "X"}))
            .await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(response.json::<Value>()["error"]["code"], "not_found");
    }
}
