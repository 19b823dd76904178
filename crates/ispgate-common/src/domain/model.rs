//! Domain entities read and mutated by the AAA and billing engines
//!
//! Subscribers, packages and tenants are created by the admin collaborator;
//! this crate only reads them and applies the narrow mutations the
//! accounting and payment paths need.

use super::value_objects::*;
use crate::error::{DomainError, DomainResult};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of one purchased billing period
pub const BILLING_PERIOD_DAYS: i64 = 30;

// ============ Subscribers ============

/// Operational status of a subscriber account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberStatus {
    Active,
    Inactive,
    Suspended,
}

/// Subscriber (customer) record
///
/// # Invariants
/// - `expiry` only matters while `status == Active`
/// - no `package` means no bandwidth entitlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub tenant: TenantId,
    pub login: Login,
    pub secret: Credential,
    pub status: SubscriberStatus,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub package: Option<PackageId>,
    #[serde(default)]
    pub station: Option<StationId>,
    #[serde(default)]
    pub usage: UsageTotals,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_session: Option<LastSession>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Subscriber {
    /// New inactive subscriber without package
    pub fn new(tenant: TenantId, login: Login, secret: Credential) -> Self {
        Self {
            id: SubscriberId::new(),
            tenant,
            login,
            secret,
            status: SubscriberStatus::Inactive,
            expiry: None,
            package: None,
            station: None,
            usage: UsageTotals::default(),
            last_seen: None,
            last_session: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether the account is enabled
    pub fn is_active(&self) -> bool {
        self.status == SubscriberStatus::Active
    }

    /// Whether a set expiry lies at or before `now`
    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry, Some(expiry) if expiry <= now)
    }

    /// Expiry after buying `periods` more billing periods
    ///
    /// Time left on a running subscription is kept; a lapsed or unset expiry
    /// restarts from `now`.
    pub fn extended_expiry(&self, now: DateTime<Utc>, periods: u32) -> DateTime<Utc> {
        let base = match self.expiry {
            Some(expiry) if expiry > now => expiry,
            _ => now,
        };
        base + Duration::days(BILLING_PERIOD_DAYS * i64::from(periods))
    }

    /// Fold a finished session into the cumulative counters
    pub fn apply_session(&mut self, delta: &SessionDelta) {
        self.usage.sessions += 1;
        self.usage.online_seconds += delta.session_time;
        self.usage.input_bytes += delta.input_bytes;
        self.usage.output_bytes += delta.output_bytes;
        self.last_seen = Some(delta.snapshot.ended_at);
        self.last_session = Some(delta.snapshot.clone());
        self.updated_at = delta.snapshot.ended_at;
    }
}

/// Cumulative usage across finished sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub sessions: u64,
    pub online_seconds: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
}

/// Summary of the most recently finished session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastSession {
    pub session_id: String,
    pub duration_secs: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub nas_ip_address: Option<String>,
    pub framed_ip_address: Option<String>,
    pub terminate_cause: Option<String>,
    pub ended_at: DateTime<Utc>,
}

/// Increment applied to a subscriber when a session stops
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDelta {
    pub session_time: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub snapshot: LastSession,
}

// ============ Packages ============

/// Access service a package is provisioned for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Pppoe,
    Hotspot,
    Dhcp,
    Static,
}

impl ServiceType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pppoe => "pppoe",
            Self::Hotspot => "hotspot",
            Self::Dhcp => "dhcp",
            Self::Static => "static",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pppoe" => Ok(Self::Pppoe),
            "hotspot" => Ok(Self::Hotspot),
            "dhcp" => Ok(Self::Dhcp),
            "static" => Ok(Self::Static),
            _ => Err(DomainError::UnknownVariant { kind: "service type", value: s.into() }),
        }
    }
}

/// Bandwidth package (profile)
///
/// Speeds are megabits per second; burst time and timeouts are seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub id: PackageId,
    pub tenant: TenantId,
    pub name: String,
    pub price: Decimal,
    pub download_speed: f64,
    pub upload_speed: f64,
    #[serde(default)]
    pub burst_download: Option<f64>,
    #[serde(default)]
    pub burst_upload: Option<f64>,
    #[serde(default)]
    pub threshold_download: Option<f64>,
    #[serde(default)]
    pub threshold_upload: Option<f64>,
    #[serde(default)]
    pub burst_time: Option<u32>,
    #[serde(default)]
    pub service_type: Option<ServiceType>,
    #[serde(default)]
    pub address_pool: Option<String>,
    #[serde(default)]
    pub session_timeout: Option<u32>,
    #[serde(default)]
    pub idle_timeout: Option<u32>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub vlan_id: Option<u16>,
}

impl Package {
    /// Lowest and highest MikroTik queue priority
    pub const PRIORITY_RANGE: std::ops::RangeInclusive<u8> = 1..=8;

    /// Plain package with base rates only
    pub fn new(tenant: TenantId, name: impl Into<String>, price: Decimal, download: f64, upload: f64) -> Self {
        Self {
            id: PackageId::new(),
            tenant,
            name: name.into(),
            price,
            download_speed: download,
            upload_speed: upload,
            burst_download: None,
            burst_upload: None,
            threshold_download: None,
            threshold_upload: None,
            burst_time: None,
            service_type: None,
            address_pool: None,
            session_timeout: None,
            idle_timeout: None,
            priority: None,
            vlan_id: None,
        }
    }

    /// Whether any burst parameter is configured
    pub fn has_burst(&self) -> bool {
        self.burst_download.is_some()
            || self.burst_upload.is_some()
            || self.threshold_download.is_some()
            || self.threshold_upload.is_some()
            || self.burst_time.is_some()
    }

    /// Check package invariants
    pub fn validate(&self) -> DomainResult<()> {
        if !(self.download_speed > 0.0 && self.upload_speed > 0.0) {
            return Err(DomainError::InvalidPackage("speeds must be positive".into()));
        }
        if self.price <= Decimal::ZERO {
            return Err(DomainError::InvalidPackage("price must be positive".into()));
        }
        if let Some(priority) = self.priority {
            if !Self::PRIORITY_RANGE.contains(&priority) {
                return Err(DomainError::InvalidPackage(format!(
                    "priority {} outside 1-8",
                    priority
                )));
            }
        }
        Ok(())
    }
}

// ============ Tenants ============

/// Provider environment a tenant transacts against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MpesaEnvironment {
    #[default]
    Sandbox,
    Production,
}

/// Mobile-money account of a tenant
///
/// Secrets are stored already decrypted by the encryption collaborator.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct MpesaAccount {
    pub shortcode: String,
    #[serde(default)]
    pub b2c_shortcode: Option<String>,
    #[serde(default)]
    pub b2b_shortcode: Option<String>,
    #[serde(default)]
    pub environment: MpesaEnvironment,
    pub consumer_key: String,
    pub consumer_secret: String,
    #[serde(default)]
    pub passkey: Option<String>,
    #[serde(default)]
    pub initiator_name: Option<String>,
    #[serde(default)]
    pub initiator_password: Option<String>,
}

impl fmt::Debug for MpesaAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpesaAccount")
            .field("shortcode", &self.shortcode)
            .field("b2c_shortcode", &self.b2c_shortcode)
            .field("b2b_shortcode", &self.b2b_shortcode)
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

/// Tenant (agency) operating subscribers and receiving payments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    #[serde(default)]
    pub mpesa: Option<MpesaAccount>,
}

impl Tenant {
    /// Whether `shortcode` routes payments to this tenant
    pub fn owns_shortcode(&self, shortcode: &str) -> bool {
        self.mpesa.as_ref().map_or(false, |account| {
            account.shortcode == shortcode
                || account.b2c_shortcode.as_deref() == Some(shortcode)
                || account.b2b_shortcode.as_deref() == Some(shortcode)
        })
    }
}

// ============ Accounting ============

/// Acct-Status-Type (RFC 2866 Section 5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcctStatus {
    #[serde(rename = "Start")]
    Start,
    #[serde(rename = "Interim-Update")]
    InterimUpdate,
    #[serde(rename = "Stop")]
    Stop,
    #[serde(rename = "Accounting-On")]
    AccountingOn,
    #[serde(rename = "Accounting-Off")]
    AccountingOff,
}

impl AcctStatus {
    /// RFC 2866 numeric value
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Start => 1,
            Self::Stop => 2,
            Self::InterimUpdate => 3,
            Self::AccountingOn => 7,
            Self::AccountingOff => 8,
        }
    }

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::InterimUpdate => "Interim-Update",
            Self::Stop => "Stop",
            Self::AccountingOn => "Accounting-On",
            Self::AccountingOff => "Accounting-Off",
        }
    }

    /// Start, Stop or Interim-Update
    pub fn is_session_status(self) -> bool {
        matches!(self, Self::Start | Self::Stop | Self::InterimUpdate)
    }
}

impl fmt::Display for AcctStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AcctStatus {
    type Err = DomainError;

    /// Accepts names (any case, `Alive` for Interim-Update) or RFC numbers
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "start" | "1" => Ok(Self::Start),
            "stop" | "2" => Ok(Self::Stop),
            "interim-update" | "interim_update" | "alive" | "3" => Ok(Self::InterimUpdate),
            "accounting-on" | "7" => Ok(Self::AccountingOn),
            "accounting-off" | "8" => Ok(Self::AccountingOff),
            _ => Err(DomainError::UnknownVariant { kind: "Acct-Status-Type", value: trimmed.into() }),
        }
    }
}

/// Exact usage of one session, reconciled from wrapping 32-bit counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUsage {
    pub total_input_bytes: u64,
    pub total_output_bytes: u64,
    pub total_bytes: u64,
    pub input_megabytes: f64,
    pub output_megabytes: f64,
    pub total_megabytes: f64,
    pub session_hours: f64,
}

/// Network access server that reported an event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NasInfo {
    pub ip_address: Option<String>,
    pub identifier: Option<String>,
    pub port: Option<String>,
    pub port_type: Option<String>,
}

/// Live accounting view, one per subscriber login
///
/// # Invariants
/// - `usage.total_input_bytes == (input_gigawords << 32) + input_octets`,
///   likewise for output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountingRecord {
    pub login: Login,
    pub subscriber: SubscriberId,
    pub session_id: String,
    pub status: AcctStatus,
    pub session_time: u64,
    pub input_octets: u32,
    pub input_gigawords: u32,
    pub output_octets: u32,
    pub output_gigawords: u32,
    pub usage: SessionUsage,
    pub nas: NasInfo,
    pub framed_protocol: Option<String>,
    pub framed_ip_address: Option<String>,
    pub terminate_cause: Option<String>,
    pub last_update: DateTime<Utc>,
}

impl AccountingRecord {
    /// Whether this record already finalized `session_id`
    pub fn has_stopped(&self, session_id: &str) -> bool {
        self.status == AcctStatus::Stop && self.session_id == session_id
    }
}

/// Result the NAS sent for an access request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostAuthOutcome {
    #[serde(rename = "Access-Accept")]
    Accept,
    #[serde(rename = "Access-Reject")]
    Reject,
}

impl FromStr for PostAuthOutcome {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "access-accept" | "accept" | "2" => Ok(Self::Accept),
            "access-reject" | "reject" | "3" => Ok(Self::Reject),
            other => Err(DomainError::UnknownVariant { kind: "post-auth result", value: other.into() }),
        }
    }
}

/// Append-only audit entry written on every post-auth callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostAuthRecord {
    pub login: String,
    pub device: Option<String>,
    pub outcome: PostAuthOutcome,
    pub nas_ip_address: Option<String>,
    pub reply_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

// ============ Payments ============

/// Direction of a mobile-money transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Customer to business
    C2b,
    /// Business to customer
    B2c,
    /// Business to business
    B2b,
}

/// Lifecycle of a payment transaction
///
/// `Pending` and `Validated` are open; every other state is terminal and
/// never goes back to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Validated,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TransactionStatus {
    /// Completed, failed, timed out or cancelled
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled)
    }

    /// Still awaiting a provider outcome
    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }

    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Validated) => true,
            (Self::Pending | Self::Validated, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Validated => "validated",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Mobile-money transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: TransactionId,
    pub tenant: TenantId,
    pub subscriber: Option<SubscriberId>,
    pub package: Option<PackageId>,
    pub kind: TransactionKind,
    pub amount: Decimal,
    /// Payer phone (C2B/B2C) or receiving shortcode (B2B)
    pub counterparty: Option<String>,
    pub reference: String,
    pub remarks: Option<String>,
    pub status: TransactionStatus,
    pub receipt: Option<String>,
    pub periods: Option<u32>,
    pub raw_response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentTransaction {
    /// New pending transaction
    pub fn pending(
        tenant: TenantId,
        kind: TransactionKind,
        amount: Decimal,
        reference: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            tenant,
            subscriber: None,
            package: None,
            kind,
            amount,
            counterparty: None,
            reference: reference.into(),
            remarks: None,
            status: TransactionStatus::Pending,
            receipt: None,
            periods: None,
            raw_response: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Apply a status change; refused (returns false) if the transition is illegal
    pub fn apply(&mut self, update: &TransactionUpdate, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(update.status) {
            return false;
        }
        self.status = update.status;
        if let Some(receipt) = &update.receipt {
            self.receipt = Some(receipt.clone());
        }
        if let Some(raw) = &update.raw_response {
            self.raw_response = Some(raw.clone());
        }
        if update.status == TransactionStatus::Completed {
            self.completed_at = Some(now);
        }
        self.updated_at = now;
        true
    }
}

/// Fields written when an open transaction advances
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionUpdate {
    pub status: TransactionStatus,
    pub receipt: Option<String>,
    pub raw_response: Option<serde_json::Value>,
}

impl TransactionUpdate {
    /// Status-only update
    pub fn status(status: TransactionStatus) -> Self {
        Self { status, receipt: None, raw_response: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn subscriber() -> Subscriber {
        Subscriber::new(TenantId::new(), Login::parse("alice").unwrap(), Credential::new("pw"))
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_extended_expiry_without_prior_expiry() {
        let sub = subscriber();
        assert_eq!(sub.extended_expiry(at(1), 2), at(1) + Duration::days(60));
    }

    #[test]
    fn test_extended_expiry_keeps_remaining_time() {
        let mut sub = subscriber();
        sub.expiry = Some(at(11));
        assert_eq!(sub.extended_expiry(at(1), 2), at(11) + Duration::days(60));
    }

    #[test]
    fn test_extended_expiry_restarts_after_lapse() {
        let mut sub = subscriber();
        sub.expiry = Some(at(1));
        assert_eq!(sub.extended_expiry(at(20), 1), at(20) + Duration::days(30));
    }

    #[test]
    fn test_has_expired() {
        let mut sub = subscriber();
        assert!(!sub.has_expired(at(5)));
        sub.expiry = Some(at(5));
        assert!(sub.has_expired(at(5)));
        assert!(!sub.has_expired(at(4)));
    }

    #[test]
    fn test_acct_status_parsing() {
        assert_eq!("Start".parse::<AcctStatus>().unwrap(), AcctStatus::Start);
        assert_eq!("interim-update".parse::<AcctStatus>().unwrap(), AcctStatus::InterimUpdate);
        assert_eq!("Alive".parse::<AcctStatus>().unwrap(), AcctStatus::InterimUpdate);
        assert_eq!("2".parse::<AcctStatus>().unwrap(), AcctStatus::Stop);
        assert_eq!("7".parse::<AcctStatus>().unwrap(), AcctStatus::AccountingOn);
        assert!("Paused".parse::<AcctStatus>().is_err());
        assert!(AcctStatus::Stop.is_session_status());
        assert!(!AcctStatus::AccountingOff.is_session_status());
        assert_eq!(AcctStatus::InterimUpdate.as_u32(), 3);
    }

    #[test]
    fn test_transaction_transitions() {
        use TransactionStatus::*;
        assert!(Pending.can_transition_to(Validated));
        assert!(Pending.can_transition_to(Completed));
        assert!(Validated.can_transition_to(Completed));
        assert!(!Validated.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Timeout.can_transition_to(Completed));
        assert!(Pending.is_open() && Validated.is_open());
        assert!(Cancelled.is_terminal());
    }

    #[test]
    fn test_transaction_apply_sets_completion() {
        let mut tx = PaymentTransaction::pending(TenantId::new(), TransactionKind::C2b, dec!(100), "SUB1", at(1));
        let update = TransactionUpdate {
            status: TransactionStatus::Completed,
            receipt: Some("QK123".into()),
            raw_response: Some(serde_json::json!({"TransID": "QK123"})),
        };
        assert!(tx.apply(&update, at(2)));
        assert_eq!(tx.receipt.as_deref(), Some("QK123"));
        assert_eq!(tx.completed_at, Some(at(2)));
        assert!(!tx.apply(&update, at(3)));
        assert_eq!(tx.updated_at, at(2));
    }

    #[test]
    fn test_package_validation() {
        let mut pkg = Package::new(TenantId::new(), "Home 10", dec!(1000), 10.0, 5.0);
        assert!(pkg.validate().is_ok());
        assert!(!pkg.has_burst());
        pkg.priority = Some(9);
        assert!(pkg.validate().is_err());
        pkg.priority = Some(8);
        pkg.burst_time = Some(10);
        assert!(pkg.has_burst());
        pkg.price = dec!(0);
        assert!(pkg.validate().is_err());
    }

    #[test]
    fn test_tenant_shortcodes() {
        let tenant = Tenant {
            id: TenantId::new(),
            name: "Agency".into(),
            mpesa: Some(MpesaAccount {
                shortcode: "600000".into(),
                b2c_shortcode: Some("600001".into()),
                b2b_shortcode: None,
                environment: MpesaEnvironment::Sandbox,
                consumer_key: "key".into(),
                consumer_secret: "secret".into(),
                passkey: None,
                initiator_name: None,
                initiator_password: None,
            }),
        };
        assert!(tenant.owns_shortcode("600000"));
        assert!(tenant.owns_shortcode("600001"));
        assert!(!tenant.owns_shortcode("600002"));
        assert!(!format!("{:?}", tenant).contains("secret"));
    }
}
