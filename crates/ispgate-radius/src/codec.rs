//! Bandwidth profile codec
//!
//! Translates a [`Package`] into the MikroTik `Mikrotik-Rate-Limit` string
//!
//! ```text
//! down/up [burstDown/burstUp thresholdDown/thresholdUp burstTime/burstTime [priority]]
//! ```
//!
//! and back, and emits the flat reply attribute list for a package. Rates
//! are held in bits per second; 1M is 1024k and 1k is 1024 bits.

use ispgate_common::{Package, ServiceType};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const KILO: u64 = 1024;
const MEGA: u64 = KILO * 1024;
const GIGA: u64 = MEGA * 1024;

/// Malformed rate-limit string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty rate-limit string")]
    Empty,

    #[error("expected 1, 4 or 5 tokens, got {0}")]
    TokenCount(usize),

    #[error("expected a rx/tx pair, got {0:?}")]
    Pair(String),

    #[error("invalid rate {0:?}")]
    Rate(String),

    #[error("invalid burst time {0:?}")]
    BurstTime(String),

    #[error("invalid priority {0:?}")]
    Priority(String),
}

/// A link rate in bits per second
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rate(u64);

impl Rate {
    pub const fn from_bps(bps: u64) -> Self {
        Self(bps)
    }

    /// Megabits per second, quantized to whole kilobits
    pub fn from_mbps(mbps: f64) -> Self {
        let kbps = (mbps.max(0.0) * KILO as f64).round() as u64;
        Self(kbps.saturating_mul(KILO))
    }

    pub const fn bps(self) -> u64 {
        self.0
    }

    pub fn mbps(self) -> f64 {
        self.0 as f64 / MEGA as f64
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % MEGA == 0 {
            write!(f, "{}M", self.0 / MEGA)
        } else if self.0 % KILO == 0 {
            write!(f, "{}k", self.0 / KILO)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for Rate {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CodecError::Rate(s.to_string());
        let (digits, unit) = match s.chars().last() {
            Some('k') | Some('K') => (&s[..s.len() - 1], KILO),
            Some('m') | Some('M') => (&s[..s.len() - 1], MEGA),
            Some('g') | Some('G') => (&s[..s.len() - 1], GIGA),
            Some(_) => (s, 1),
            None => return Err(invalid()),
        };
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        value.checked_mul(unit).map(Self).ok_or_else(invalid)
    }
}

/// Burst segment of a rate limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Burst {
    pub download: Rate,
    pub upload: Rate,
    pub threshold_download: Rate,
    pub threshold_upload: Rate,
    /// Seconds
    pub time: u32,
}

/// Structured form of a `Mikrotik-Rate-Limit` value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimit {
    pub download: Rate,
    pub upload: Rate,
    pub burst: Option<Burst>,
    pub priority: Option<u8>,
}

impl RateLimit {
    /// Rate limit for a package
    ///
    /// The burst segment exists only if the package sets a burst field; any
    /// burst field it leaves unset falls back to the base rate, or one
    /// second for the burst time.
    pub fn from_package(package: &Package) -> Self {
        let download = Rate::from_mbps(package.download_speed);
        let upload = Rate::from_mbps(package.upload_speed);
        let or_base = |value: Option<f64>, base: Rate| value.map(Rate::from_mbps).unwrap_or(base);

        let burst = package.has_burst().then(|| Burst {
            download: or_base(package.burst_download, download),
            upload: or_base(package.burst_upload, upload),
            threshold_download: or_base(package.threshold_download, download),
            threshold_upload: or_base(package.threshold_upload, upload),
            time: package.burst_time.unwrap_or(1),
        });

        Self { download, upload, burst, priority: package.priority }
    }

    /// Decode leniently: a malformed string yields the zero profile plus
    /// the reason instead of failing
    pub fn decode(input: &str) -> (Self, Option<CodecError>) {
        match input.parse() {
            Ok(limit) => (limit, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.download, self.upload)?;
        if let Some(burst) = &self.burst {
            write!(
                f,
                " {}/{} {}/{} {}/{}",
                burst.download,
                burst.upload,
                burst.threshold_download,
                burst.threshold_upload,
                burst.time,
                burst.time
            )?;
            // priority is positional, so only expressible after a burst segment
            if let Some(priority) = self.priority {
                write!(f, " {}", priority)?;
            }
        }
        Ok(())
    }
}

fn split_pair(token: &str) -> Result<(&str, &str), CodecError> {
    token
        .split_once('/')
        .ok_or_else(|| CodecError::Pair(token.to_string()))
}

fn parse_rates(token: &str) -> Result<(Rate, Rate), CodecError> {
    let (down, up) = split_pair(token)?;
    Ok((down.parse()?, up.parse()?))
}

fn parse_burst_time(token: &str) -> Result<u32, CodecError> {
    let invalid = || CodecError::BurstTime(token.to_string());
    // either "t" or the symmetric "t/t"
    let (first, second) = token.split_once('/').unwrap_or((token, token));
    let first: u32 = first.parse().map_err(|_| invalid())?;
    let second: u32 = second.parse().map_err(|_| invalid())?;
    if first != second {
        return Err(invalid());
    }
    Ok(first)
}

impl FromStr for RateLimit {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(CodecError::Empty);
        }
        if !matches!(tokens.len(), 1 | 4 | 5) {
            return Err(CodecError::TokenCount(tokens.len()));
        }

        let (download, upload) = parse_rates(tokens[0])?;
        let mut limit = RateLimit { download, upload, burst: None, priority: None };

        if tokens.len() >= 4 {
            let (burst_down, burst_up) = parse_rates(tokens[1])?;
            let (threshold_down, threshold_up) = parse_rates(tokens[2])?;
            limit.burst = Some(Burst {
                download: burst_down,
                upload: burst_up,
                threshold_download: threshold_down,
                threshold_upload: threshold_up,
                time: parse_burst_time(tokens[3])?,
            });
        }
        if let Some(raw) = tokens.get(4) {
            let priority: u8 = raw.parse().map_err(|_| CodecError::Priority(raw.to_string()))?;
            if !Package::PRIORITY_RANGE.contains(&priority) {
                return Err(CodecError::Priority(raw.to_string()));
            }
            limit.priority = Some(priority);
        }
        Ok(limit)
    }
}

/// One reply attribute of an authorize response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyAttribute {
    pub name: &'static str,
    pub value: String,
}

impl ReplyAttribute {
    pub fn new(name: &'static str, value: impl Into<String>) -> Self {
        Self { name, value: value.into() }
    }
}

/// Flat reply attribute list provisioning `package` on a MikroTik NAS
pub fn profile_attributes(package: &Package) -> Vec<ReplyAttribute> {
    let mut attributes = vec![ReplyAttribute::new(
        "Mikrotik-Rate-Limit",
        RateLimit::from_package(package).to_string(),
    )];

    match package.service_type {
        Some(ServiceType::Pppoe) => {
            attributes.push(ReplyAttribute::new("Service-Type", "Framed-User"));
            attributes.push(ReplyAttribute::new("Framed-Protocol", "PPP"));
        }
        Some(ServiceType::Dhcp) => {
            attributes.push(ReplyAttribute::new("Service-Type", "Framed-User"));
            attributes.push(ReplyAttribute::new("Framed-Protocol", "DHCP"));
        }
        Some(ServiceType::Hotspot) => {
            attributes.push(ReplyAttribute::new("Service-Type", "Login-User"));
        }
        Some(ServiceType::Static) | None => {}
    }

    if let Some(pool) = package.address_pool.as_deref().filter(|p| !p.is_empty()) {
        attributes.push(ReplyAttribute::new("Framed-Pool", pool));
    }
    if let Some(timeout) = package.session_timeout.filter(|t| *t > 0) {
        attributes.push(ReplyAttribute::new("Session-Timeout", timeout.to_string()));
    }
    if let Some(timeout) = package.idle_timeout.filter(|t| *t > 0) {
        attributes.push(ReplyAttribute::new("Idle-Timeout", timeout.to_string()));
    }
    if let Some(priority) = package.priority {
        attributes.push(ReplyAttribute::new("Mikrotik-Queue-Priority", priority.to_string()));
    }
    if let Some(vlan) = package.vlan_id {
        attributes.push(ReplyAttribute::new("Tunnel-Type", "VLAN"));
        attributes.push(ReplyAttribute::new("Tunnel-Medium-Type", "IEEE-802"));
        attributes.push(ReplyAttribute::new("Tunnel-Private-Group-Id", vlan.to_string()));
    }
    attributes
}
