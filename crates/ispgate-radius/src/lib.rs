//! ispgate RADIUS - REST adapter for a FreeRADIUS `rest` module
//!
//! Answers the four AAA calls a NAS makes through FreeRADIUS:
//! - **authorize / authenticate**: [`Authorizer`]
//! - **accounting**: [`AccountingIngest`], backed by the [`counters`] reconciler
//! - **post-auth**: [`PostAuthAudit`]
//!
//! Protocol-expected outcomes (unknown login, disabled account, expired
//! subscription, wrong password) are values, never errors. [`RadiusError`]
//! covers malformed requests and store failures only.

pub mod accounting;
pub mod attributes;
pub mod authorize;
pub mod codec;
pub mod counters;
pub mod postauth;

pub use accounting::{AccountingEvent, AccountingIngest, AccountingOutcome};
pub use attributes::{AttributeBag, Field};
pub use authorize::{AuthorizeReply, Authorizer, Decision, Rejection};
pub use codec::{profile_attributes, CodecError, RateLimit, ReplyAttribute};
pub use postauth::{PostAuthAudit, PostAuthEvent};

use ispgate_common::{AccountingStore, PostAuthLog, RepositoryError, SubscriberDirectory};
use std::sync::Arc;
use thiserror::Error;

/// Failures that are not protocol answers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadiusError {
    /// A required identity attribute is absent
    #[error("missing attribute {0}")]
    MissingAttribute(&'static str),

    /// Acct-Status-Type not in RFC 2866
    #[error("unknown Acct-Status-Type {0:?}")]
    UnknownStatus(String),

    /// Body could not be read as attributes
    #[error("malformed request body: {0}")]
    MalformedBody(String),

    /// Backing store failed
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl RadiusError {
    /// Whether the caller, not the server, is at fault
    pub fn is_client_error(&self) -> bool {
        !matches!(self, RadiusError::Repository(_))
    }
}

/// The three RADIUS handlers over one store
#[derive(Clone)]
pub struct RadiusEngine {
    pub authorizer: Authorizer,
    pub accounting: AccountingIngest,
    pub post_auth: PostAuthAudit,
}

impl RadiusEngine {
    pub fn new<S>(store: Arc<S>) -> Self
    where
        S: SubscriberDirectory + AccountingStore + PostAuthLog + 'static,
    {
        Self {
            authorizer: Authorizer::new(store.clone()),
            accounting: AccountingIngest::new(store.clone(), store.clone()),
            post_auth: PostAuthAudit::new(store),
        }
    }
}
