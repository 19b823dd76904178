//! Request normalization
//!
//! The NAS may post either a JSON body with snake_case keys or a form body
//! with RADIUS attribute names. Both are folded into one [`AttributeBag`]
//! keyed by [`Field`] through a single mapping table before any decision
//! logic runs.

use crate::counters::parse_counter;
use crate::RadiusError;
use serde_json::Value;
use std::collections::HashMap;

/// Canonical request field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    UserName,
    Password,
    AcctStatusType,
    AcctSessionId,
    AcctSessionTime,
    AcctInputOctets,
    AcctInputGigawords,
    AcctOutputOctets,
    AcctOutputGigawords,
    AcctTerminateCause,
    NasIpAddress,
    NasIdentifier,
    NasPort,
    NasPortType,
    FramedProtocol,
    FramedIpAddress,
    CallingStationId,
    PacketType,
    ReplyMessage,
}

/// (field, JSON key, RADIUS attribute name)
const FIELD_TABLE: &[(Field, &str, &str)] = &[
    (Field::UserName, "username", "User-Name"),
    (Field::Password, "password", "User-Password"),
    (Field::AcctStatusType, "acct_status_type", "Acct-Status-Type"),
    (Field::AcctSessionId, "acct_session_id", "Acct-Session-Id"),
    (Field::AcctSessionTime, "acct_session_time", "Acct-Session-Time"),
    (Field::AcctInputOctets, "acct_input_octets", "Acct-Input-Octets"),
    (Field::AcctInputGigawords, "acct_input_gigawords", "Acct-Input-Gigawords"),
    (Field::AcctOutputOctets, "acct_output_octets", "Acct-Output-Octets"),
    (Field::AcctOutputGigawords, "acct_output_gigawords", "Acct-Output-Gigawords"),
    (Field::AcctTerminateCause, "acct_terminate_cause", "Acct-Terminate-Cause"),
    (Field::NasIpAddress, "nas_ip_address", "NAS-IP-Address"),
    (Field::NasIdentifier, "nas_identifier", "NAS-Identifier"),
    (Field::NasPort, "nas_port", "NAS-Port"),
    (Field::NasPortType, "nas_port_type", "NAS-Port-Type"),
    (Field::FramedProtocol, "framed_protocol", "Framed-Protocol"),
    (Field::FramedIpAddress, "framed_ip_address", "Framed-IP-Address"),
    (Field::CallingStationId, "calling_station_id", "Calling-Station-Id"),
    (Field::PacketType, "packet_type", "Packet-Type"),
    (Field::ReplyMessage, "reply_message", "Reply-Message"),
];

impl Field {
    /// Resolve a wire key from either vocabulary
    pub fn from_key(key: &str) -> Option<Field> {
        FIELD_TABLE
            .iter()
            .find(|(_, json, radius)| *json == key || radius.eq_ignore_ascii_case(key))
            .map(|(field, _, _)| *field)
    }

    /// RADIUS attribute name, used in error messages
    pub fn attribute_name(self) -> &'static str {
        FIELD_TABLE
            .iter()
            .find(|(field, _, _)| *field == self)
            .map(|(_, _, radius)| *radius)
            .unwrap_or("unknown")
    }
}

/// Normalized request attributes; empty values count as absent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeBag {
    values: HashMap<Field, String>,
}

impl AttributeBag {
    /// From decoded form pairs; unknown keys are ignored
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut bag = Self::default();
        for (key, value) in pairs {
            if let Some(field) = Field::from_key(key.as_ref()) {
                bag.insert(field, value.into());
            }
        }
        bag
    }

    /// From a JSON object. Values may be strings, numbers, booleans or
    /// FreeRADIUS `{"value": [..]}` wrappers; only the first value is kept.
    pub fn from_json(body: &Value) -> Result<Self, RadiusError> {
        let object = body
            .as_object()
            .ok_or_else(|| RadiusError::MalformedBody("expected a JSON object".into()))?;
        let mut bag = Self::default();
        for (key, value) in object {
            if let (Some(field), Some(value)) = (Field::from_key(key), scalar(value)) {
                bag.insert(field, value);
            }
        }
        Ok(bag)
    }

    pub fn insert(&mut self, field: Field, value: impl Into<String>) {
        let value = value.into();
        if !value.trim().is_empty() {
            self.values.insert(field, value.trim().to_string());
        }
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        self.values.get(&field).map(String::as_str)
    }

    /// Value of a mandatory field
    pub fn require(&self, field: Field) -> Result<&str, RadiusError> {
        self.get(field)
            .ok_or(RadiusError::MissingAttribute(field.attribute_name()))
    }

    /// Lenient counter: absent or garbage reads as zero
    pub fn counter(&self, field: Field) -> u32 {
        parse_counter(self.get(field))
    }

    pub fn owned(&self, field: Field) -> Option<String> {
        self.get(field).map(str::to_string)
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => items.first().and_then(scalar),
        Value::Object(map) => map.get("value").and_then(scalar),
        Value::Null => None,
    }
}
