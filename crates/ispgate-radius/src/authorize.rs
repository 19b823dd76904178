//! Authorization decision
//!
//! `received -> resolved -> {accept, login-invalid, wrong-credential,
//! login-disabled, access-expired}`. The checks run in that order and the
//! first failing one decides, so an inactive subscriber past expiry is
//! reported as disabled.

use crate::codec::{profile_attributes, Rate, ReplyAttribute};
use crate::RadiusError;
use chrono::{DateTime, Utc};
use ispgate_common::{Lookup, Subscriber, SubscriberDirectory};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

const OP_SET: &str = ":=";

/// Why an access request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    LoginInvalid,
    WrongPassword,
    LoginDisabled,
    AccessExpired,
}

impl Rejection {
    /// Reply-Message text
    pub fn message(self) -> &'static str {
        match self {
            Rejection::LoginInvalid => "Login invalid",
            Rejection::WrongPassword => "Wrong Password",
            Rejection::LoginDisabled => "Login disabled",
            Rejection::AccessExpired => "Access time expired",
        }
    }

    /// `{"reply:Reply-Message": {"value": [..], "op": ":="}}`
    pub fn to_json(self) -> Value {
        let mut body = Map::new();
        body.insert("reply:Reply-Message".into(), wrap(self.message()));
        Value::Object(body)
    }
}

/// Outcome of an access check
#[derive(Debug, Clone, PartialEq)]
pub enum Decision<T> {
    Accept(T),
    Reject(Rejection),
}

impl<T> Decision<T> {
    pub fn is_accept(&self) -> bool {
        matches!(self, Decision::Accept(_))
    }
}

/// Attributes returned on a successful authorize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeReply {
    pub control: Vec<ReplyAttribute>,
    pub reply: Vec<ReplyAttribute>,
}

impl AuthorizeReply {
    /// FreeRADIUS rest-module body: `control:` and `reply:` prefixed names,
    /// each value wrapped as `{"value": [..], "op": ":="}`
    pub fn to_json(&self) -> Value {
        let mut body = Map::new();
        for attribute in &self.control {
            body.insert(format!("control:{}", attribute.name), wrap(&attribute.value));
        }
        for attribute in &self.reply {
            body.insert(format!("reply:{}", attribute.name), wrap(&attribute.value));
        }
        Value::Object(body)
    }

    pub fn reply_value(&self, name: &str) -> Option<&str> {
        self.reply
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }
}

fn wrap(value: &str) -> Value {
    json!({ "value": [value], "op": OP_SET })
}

/// Read-only authorize / authenticate over the subscriber directory
#[derive(Clone)]
pub struct Authorizer {
    directory: Arc<dyn SubscriberDirectory>,
}

impl Authorizer {
    pub fn new(directory: Arc<dyn SubscriberDirectory>) -> Self {
        Self { directory }
    }

    /// Run the ordered checks; `secret` is only compared when present
    async fn resolve(
        &self,
        login: &str,
        secret: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Decision<Subscriber>, RadiusError> {
        let subscriber = match self.directory.find_by_login(login).await? {
            Lookup::Found(subscriber) => subscriber,
            Lookup::NotFound => return Ok(Decision::Reject(Rejection::LoginInvalid)),
            Lookup::InvalidId(reason) => {
                debug!(login, %reason, "malformed login");
                return Ok(Decision::Reject(Rejection::LoginInvalid));
            }
        };

        if let Some(secret) = secret {
            if !subscriber.secret.matches(secret) {
                return Ok(Decision::Reject(Rejection::WrongPassword));
            }
        }
        if !subscriber.is_active() {
            return Ok(Decision::Reject(Rejection::LoginDisabled));
        }
        if subscriber.has_expired(now) {
            return Ok(Decision::Reject(Rejection::AccessExpired));
        }
        Ok(Decision::Accept(subscriber))
    }

    /// Authorize: credential for the NAS plus the package's reply attributes
    pub async fn authorize(&self, login: &str, now: DateTime<Utc>) -> Result<Decision<AuthorizeReply>, RadiusError> {
        let subscriber = match self.resolve(login, None, now).await? {
            Decision::Accept(subscriber) => subscriber,
            Decision::Reject(rejection) => {
                warn!(login, reason = rejection.message(), "authorize rejected");
                return Ok(Decision::Reject(rejection));
            }
        };

        let control = vec![ReplyAttribute::new("Cleartext-Password", subscriber.secret.expose())];
        let mut reply = Vec::new();

        if let Some(package_id) = subscriber.package {
            match self.directory.find_package(&package_id).await? {
                Some(package) => {
                    reply = profile_attributes(&package);
                    reply.push(ReplyAttribute::new(
                        "WISPr-Bandwidth-Max-Down",
                        Rate::from_mbps(package.download_speed).bps().to_string(),
                    ));
                    reply.push(ReplyAttribute::new(
                        "WISPr-Bandwidth-Max-Up",
                        Rate::from_mbps(package.upload_speed).bps().to_string(),
                    ));
                }
                None => warn!(login, package = %package_id, "assigned package missing"),
            }
        }

        debug!(login, attributes = reply.len(), "authorize accepted");
        Ok(Decision::Accept(AuthorizeReply { control, reply }))
    }

    /// Authenticate: outcome only
    pub async fn authenticate(
        &self,
        login: &str,
        secret: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision<()>, RadiusError> {
        Ok(match self.resolve(login, Some(secret), now).await? {
            Decision::Accept(_) => Decision::Accept(()),
            Decision::Reject(rejection) => {
                warn!(login, reason = rejection.message(), "authenticate rejected");
                Decision::Reject(rejection)
            }
        })
    }
}
