//! Deterministic broker-facing order identifiers.
//!
//! Every identifier is the first 16 lowercase hex characters of the SHA-256
//! of a canonical input string. The derivation is pure: replaying the same
//! signal after a crash produces the same id, which is what makes submission
//! idempotent across restarts. Do not change the canonical formats.

use chrono::{DateTime, NaiveDate, Utc};
use sha2::{Digest, Sha256};

use crate::domain::types::OrderSide;

/// Canonical timestamp form: seven fractional digits and an explicit
/// `+00:00` offset, e.g. `2024-02-21T14:30:00.0000000+00:00`.
pub fn canonical_timestamp(ts: DateTime<Utc>) -> String {
    // chrono has no seven-digit fraction specifier, so the fraction is
    // rendered by hand from the sub-second nanoseconds.
    format!(
        "{}.{:07}+00:00",
        ts.format("%Y-%m-%dT%H:%M:%S"),
        ts.timestamp_subsec_nanos() / 100
    )
}

fn first16(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Id for a strategy-driven entry or exit order.
pub fn entry_order_id(
    strategy: &str,
    symbol: &str,
    timeframe: &str,
    signal_ts: DateTime<Utc>,
    side: OrderSide,
) -> String {
    first16(&format!(
        "{}:{}:{}:{}:{}",
        strategy,
        symbol,
        timeframe,
        canonical_timestamp(signal_ts),
        side.as_lower()
    ))
}

/// Id for an engine-driven exit, unique per symbol per calendar day.
pub fn exit_order_id(symbol: &str, date: NaiveDate, side: OrderSide) -> String {
    daily_id("exit", symbol, date, side)
}

/// Id for a flatten order, unique per symbol per calendar day.
pub fn flatten_order_id(symbol: &str, date: NaiveDate, side: OrderSide) -> String {
    daily_id("flatten", symbol, date, side)
}

fn daily_id(prefix: &str, symbol: &str, date: NaiveDate, side: OrderSide) -> String {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc();
    first16(&format!(
        "{}:{}:{}:{}:{}",
        prefix,
        symbol,
        date.format("%Y%m%d"),
        canonical_timestamp(midnight),
        side.as_lower()
    ))
}
