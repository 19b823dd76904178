//! Accounting ingest
//!
//! Every event overwrites the single live record for the login. Only a
//! `Stop` folds the session into the subscriber's cumulative counters, and
//! only the first `Stop` for a given session id does so, so retransmitted
//! Stops from the NAS are not double-counted.

use crate::attributes::{AttributeBag, Field};
use crate::counters::{reconcile, SessionCounters};
use crate::RadiusError;
use chrono::{DateTime, Utc};
use ispgate_common::{
    AccountingRecord, AccountingStore, AcctStatus, LastSession, Lookup, NasInfo, SessionDelta,
    SubscriberDirectory,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One normalized Accounting-Request
#[derive(Debug, Clone, PartialEq)]
pub struct AccountingEvent {
    pub status: AcctStatus,
    pub login: Option<String>,
    pub session_id: Option<String>,
    pub counters: SessionCounters,
    pub nas: NasInfo,
    pub framed_protocol: Option<String>,
    pub framed_ip_address: Option<String>,
    pub terminate_cause: Option<String>,
}

impl AccountingEvent {
    /// Extract the event from normalized attributes
    ///
    /// Identity is only required for session events; NAS-level
    /// Accounting-On/Off carry none.
    pub fn from_bag(bag: &AttributeBag) -> Result<Self, RadiusError> {
        let raw_status = bag.require(Field::AcctStatusType)?;
        let status: AcctStatus = raw_status
            .parse()
            .map_err(|_| RadiusError::UnknownStatus(raw_status.to_string()))?;

        let (login, session_id) = if status.is_session_status() {
            (
                Some(bag.require(Field::UserName)?.to_string()),
                Some(bag.require(Field::AcctSessionId)?.to_string()),
            )
        } else {
            (bag.owned(Field::UserName), bag.owned(Field::AcctSessionId))
        };

        Ok(Self {
            status,
            login,
            session_id,
            counters: SessionCounters {
                session_time: bag.counter(Field::AcctSessionTime),
                input_octets: bag.counter(Field::AcctInputOctets),
                input_gigawords: bag.counter(Field::AcctInputGigawords),
                output_octets: bag.counter(Field::AcctOutputOctets),
                output_gigawords: bag.counter(Field::AcctOutputGigawords),
            },
            nas: NasInfo {
                ip_address: bag.owned(Field::NasIpAddress),
                identifier: bag.owned(Field::NasIdentifier),
                port: bag.owned(Field::NasPort),
                port_type: bag.owned(Field::NasPortType),
            },
            framed_protocol: bag.owned(Field::FramedProtocol),
            framed_ip_address: bag.owned(Field::FramedIpAddress),
            terminate_cause: bag.owned(Field::AcctTerminateCause),
        })
    }
}

/// What ingest did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountingOutcome {
    /// Live record written; `finalized` if the session was folded into
    /// cumulative usage
    Recorded { finalized: bool },
    /// Accounting-On/Off, acknowledged without persisting
    NasEvent,
    /// No subscriber with that login
    UnknownSubscriber,
}

#[derive(Clone)]
pub struct AccountingIngest {
    directory: Arc<dyn SubscriberDirectory>,
    store: Arc<dyn AccountingStore>,
}

impl AccountingIngest {
    pub fn new(directory: Arc<dyn SubscriberDirectory>, store: Arc<dyn AccountingStore>) -> Self {
        Self { directory, store }
    }

    pub async fn ingest(&self, event: AccountingEvent, now: DateTime<Utc>) -> Result<AccountingOutcome, RadiusError> {
        if !event.status.is_session_status() {
            info!(status = %event.status, nas = ?event.nas.ip_address, "NAS accounting event");
            return Ok(AccountingOutcome::NasEvent);
        }
        let Some(login) = event.login.as_deref() else {
            return Err(RadiusError::MissingAttribute(Field::UserName.attribute_name()));
        };
        let Some(session_id) = event.session_id.as_deref() else {
            return Err(RadiusError::MissingAttribute(Field::AcctSessionId.attribute_name()));
        };

        let subscriber = match self.directory.find_by_login(login).await? {
            Lookup::Found(subscriber) => subscriber,
            Lookup::NotFound | Lookup::InvalidId(_) => {
                warn!(login, session_id, "accounting for unknown subscriber");
                return Ok(AccountingOutcome::UnknownSubscriber);
            }
        };

        let usage = reconcile(&event.counters);
        let record = AccountingRecord {
            login: subscriber.login.clone(),
            subscriber: subscriber.id,
            session_id: session_id.to_string(),
            status: event.status,
            session_time: u64::from(event.counters.session_time),
            input_octets: event.counters.input_octets,
            input_gigawords: event.counters.input_gigawords,
            output_octets: event.counters.output_octets,
            output_gigawords: event.counters.output_gigawords,
            usage,
            nas: event.nas.clone(),
            framed_protocol: event.framed_protocol.clone(),
            framed_ip_address: event.framed_ip_address.clone(),
            terminate_cause: event.terminate_cause.clone(),
            last_update: now,
        };
        let previous = self.store.upsert_accounting(record).await?;

        if event.status != AcctStatus::Stop {
            debug!(login, session_id, status = %event.status, "accounting updated");
            return Ok(AccountingOutcome::Recorded { finalized: false });
        }
        if previous.map_or(false, |p| p.has_stopped(session_id)) {
            debug!(login, session_id, "duplicate Stop ignored");
            return Ok(AccountingOutcome::Recorded { finalized: false });
        }

        let delta = SessionDelta {
            session_time: u64::from(event.counters.session_time),
            input_bytes: usage.total_input_bytes,
            output_bytes: usage.total_output_bytes,
            snapshot: LastSession {
                session_id: session_id.to_string(),
                duration_secs: u64::from(event.counters.session_time),
                input_bytes: usage.total_input_bytes,
                output_bytes: usage.total_output_bytes,
                nas_ip_address: event.nas.ip_address.clone(),
                framed_ip_address: event.framed_ip_address.clone(),
                terminate_cause: event.terminate_cause.clone(),
                ended_at: now,
            },
        };
        let finalized = self.directory.record_usage(&subscriber.id, &delta).await?;
        info!(
            login,
            session_id,
            total_mb = usage.total_megabytes,
            hours = usage.session_hours,
            "session finalized"
        );
        Ok(AccountingOutcome::Recorded { finalized })
    }
}
