//! Billing event delivery
//!
//! Payment outcomes the provider cannot be told about (it only ever gets
//! ResultCode 0) are published here so the tenant's own tooling sees them.

use chrono::{DateTime, Utc};
use ispgate_common::{SubscriberId, TenantId, TransactionId, TransactionStatus};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Something billing-relevant happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BillingEvent {
    /// A payment extended a subscription
    PaymentApplied {
        tenant: TenantId,
        transaction: TransactionId,
        subscriber: SubscriberId,
        periods: u32,
        expiry: DateTime<Utc>,
    },
    /// A confirmed payment could not be applied
    PaymentDropped {
        tenant: TenantId,
        reference: Option<String>,
        receipt: Option<String>,
        amount: Option<Decimal>,
        phone: Option<String>,
        reason: String,
    },
    /// A solicited transaction reached a terminal state
    TransactionSettled {
        tenant: TenantId,
        transaction: TransactionId,
        status: TransactionStatus,
    },
}

impl BillingEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PaymentApplied { .. } => "payment.applied",
            Self::PaymentDropped { .. } => "payment.dropped",
            Self::TransactionSettled { .. } => "transaction.settled",
        }
    }
}

/// Sink for billing events; publishing never blocks the caller
pub trait Notifier: Send + Sync {
    fn publish(&self, event: BillingEvent);
}

/// Logs events only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn publish(&self, event: BillingEvent) {
        match &event {
            BillingEvent::PaymentDropped { tenant, reference, reason, .. } => {
                warn!(%tenant, ?reference, %reason, "payment dropped");
            }
            other => info!(event = other.event_type(), "billing event"),
        }
    }
}

/// Webhook target and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_secs() -> u64 {
    60
}

/// Longest wait between two attempts
const MAX_RETRY_DELAY_SECS: u64 = 86_400;

/// Dead letters kept; the oldest are discarded first
const DEAD_LETTER_CAPACITY: usize = 1_000;

/// Queued delivery
#[derive(Debug, Clone)]
struct QueuedEvent {
    id: Uuid,
    event: BillingEvent,
    attempt: u32,
    next_attempt: DateTime<Utc>,
}

/// Delivery that exhausted its retries
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: Uuid,
    pub event: BillingEvent,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Signed JSON POST delivery with retry and dead letter
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: reqwest::Client,
    queue: RwLock<Vec<QueuedEvent>>,
    dead_letter: RwLock<Vec<DeadLetter>>,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            config,
            client: reqwest::Client::builder().timeout(timeout).build()?,
            queue: RwLock::new(Vec::new()),
            dead_letter: RwLock::new(Vec::new()),
        })
    }

    /// Attempt every event that is due; failures are requeued with
    /// exponential backoff until `max_retries`, then dead-lettered
    pub async fn process(&self) {
        let now = Utc::now();
        let due: Vec<QueuedEvent> = {
            let mut queue = self.queue.write();
            let (due, later): (Vec<_>, Vec<_>) = queue.drain(..).partition(|e| e.next_attempt <= now);
            *queue = later;
            due
        };

        for mut queued in due {
            match self.deliver(&queued.event).await {
                Ok(()) => info!(id = %queued.id, event = queued.event.event_type(), "webhook delivered"),
                Err(e) => {
                    queued.attempt += 1;
                    if queued.attempt < self.config.max_retries {
                        let delay = retry_delay(self.config.base_delay_secs, queued.attempt);
                        queued.next_attempt = Utc::now() + chrono::Duration::seconds(delay);
                        warn!(id = %queued.id, attempt = queued.attempt, error = %e, "webhook delivery failed, retrying");
                        self.queue.write().push(queued);
                    } else {
                        error!(id = %queued.id, error = %e, "webhook delivery abandoned");
                        let mut dead_letter = self.dead_letter.write();
                        if dead_letter.len() >= DEAD_LETTER_CAPACITY {
                            dead_letter.remove(0);
                        }
                        dead_letter.push(DeadLetter {
                            id: queued.id,
                            event: queued.event,
                            error: e,
                            failed_at: Utc::now(),
                        });
                    }
                }
            }
        }
    }

    /// Drain the queue every `interval`, forever
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.process().await;
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.read().len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letter.read().clone()
    }

    /// Take the dead letters, leaving the list empty
    pub fn drain_dead_letters(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.dead_letter.write())
    }

    async fn deliver(&self, event: &BillingEvent) -> Result<(), String> {
        let payload = serde_json::to_string(event).map_err(|e| e.to_string())?;
        let signature = sign(&payload, &self.config.secret).map_err(|e| e.to_string())?;

        let resp = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header("X-Ispgate-Signature", signature)
            .header("X-Ispgate-Event", event.event_type())
            .body(payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", resp.status()))
        }
    }
}

impl Notifier for WebhookNotifier {
    fn publish(&self, event: BillingEvent) {
        self.queue.write().push(QueuedEvent {
            id: Uuid::new_v4(),
            event,
            attempt: 0,
            next_attempt: Utc::now(),
        });
    }
}

/// Seconds before retry number `attempt`, doubling from `base` up to a day
fn retry_delay(base: u64, attempt: u32) -> i64 {
    let delay = base
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(MAX_RETRY_DELAY_SECS);
    i64::try_from(delay).unwrap_or(i64::MAX)
}

/// `sha256=<hex(hmac_sha256(secret, payload))>`
pub fn sign(payload: &str, secret: &str) -> Result<String, hmac::digest::InvalidLength> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())?;
    mac.update(payload.as_bytes());
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
