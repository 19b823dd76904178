//! Post-auth audit log

use crate::attributes::{AttributeBag, Field};
use crate::RadiusError;
use chrono::{DateTime, Utc};
use ispgate_common::{PostAuthLog, PostAuthOutcome, PostAuthRecord};
use std::sync::Arc;
use tracing::{debug, warn};

/// One normalized post-auth callback
#[derive(Debug, Clone, PartialEq)]
pub struct PostAuthEvent {
    pub login: String,
    pub device: Option<String>,
    pub outcome: PostAuthOutcome,
    pub nas_ip_address: Option<String>,
    pub reply_message: Option<String>,
}

impl PostAuthEvent {
    /// FreeRADIUS runs the plain post-auth section on accept, so a missing
    /// Packet-Type means Access-Accept
    pub fn from_bag(bag: &AttributeBag) -> Result<Self, RadiusError> {
        let login = bag.require(Field::UserName)?.to_string();
        let outcome = match bag.get(Field::PacketType) {
            Some(raw) => raw
                .parse::<PostAuthOutcome>()
                .map_err(|e| RadiusError::MalformedBody(e.to_string()))?,
            None => PostAuthOutcome::Accept,
        };
        Ok(Self {
            login,
            device: bag.owned(Field::CallingStationId),
            outcome,
            nas_ip_address: bag.owned(Field::NasIpAddress),
            reply_message: bag.owned(Field::ReplyMessage),
        })
    }
}

#[derive(Clone)]
pub struct PostAuthAudit {
    log: Arc<dyn PostAuthLog>,
}

impl PostAuthAudit {
    pub fn new(log: Arc<dyn PostAuthLog>) -> Self {
        Self { log }
    }

    /// Append one audit entry; the login need not belong to a subscriber
    pub async fn record(&self, event: PostAuthEvent, now: DateTime<Utc>) -> Result<(), RadiusError> {
        if event.outcome == PostAuthOutcome::Reject {
            warn!(login = %event.login, device = ?event.device, "access rejected by NAS");
        } else {
            debug!(login = %event.login, device = ?event.device, "access accepted");
        }
        self.log
            .append_post_auth(PostAuthRecord {
                login: event.login,
                device: event.device,
                outcome: event.outcome,
                nas_ip_address: event.nas_ip_address,
                reply_message: event.reply_message,
                recorded_at: now,
            })
            .await?;
        Ok(())
    }
}
