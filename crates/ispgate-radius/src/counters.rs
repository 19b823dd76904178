//! Counter reconciliation
//!
//! Acct-Input-Octets and Acct-Output-Octets wrap at 2^32. The matching
//! Gigawords attribute counts the wraps, so the exact 64-bit total is
//! `(gigawords << 32) + octets`.

use ispgate_common::SessionUsage;

const BYTES_PER_MEGABYTE: f64 = 1024.0 * 1024.0;
const SECONDS_PER_HOUR: f64 = 3600.0;

/// Raw 32-bit counters of one accounting event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub session_time: u32,
    pub input_octets: u32,
    pub input_gigawords: u32,
    pub output_octets: u32,
    pub output_gigawords: u32,
}

/// Exact byte count from a wrapped octet counter and its gigaword counter
pub fn combine(gigawords: u32, octets: u32) -> u64 {
    (u64::from(gigawords) << 32) + u64::from(octets)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Exact totals and derived megabyte / hour figures
pub fn reconcile(counters: &SessionCounters) -> SessionUsage {
    let total_input_bytes = combine(counters.input_gigawords, counters.input_octets);
    let total_output_bytes = combine(counters.output_gigawords, counters.output_octets);
    let total_bytes = total_input_bytes.saturating_add(total_output_bytes);

    SessionUsage {
        total_input_bytes,
        total_output_bytes,
        total_bytes,
        input_megabytes: round2(total_input_bytes as f64 / BYTES_PER_MEGABYTE),
        output_megabytes: round2(total_output_bytes as f64 / BYTES_PER_MEGABYTE),
        total_megabytes: round2(total_bytes as f64 / BYTES_PER_MEGABYTE),
        session_hours: round2(f64::from(counters.session_time) / SECONDS_PER_HOUR),
    }
}

/// Parse a wire counter, treating absent, empty or garbage values as zero
pub fn parse_counter(raw: Option<&str>) -> u32 {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}
