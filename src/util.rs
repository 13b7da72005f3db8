/// Utility helpers used across the ingestion pipeline.
///
/// This module contains:
/// - Time helpers
/// - Small numeric parsing helpers shared by connectors
///
/// IMPORTANT:
/// - No exchange-specific business logic should live here.
/// - This module must remain lightweight and deterministic.
///
/// Exchange-specific behavior belongs in:
/// - connector implementations
/// - the normalizer
///
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

/// Returns the current Unix timestamp in milliseconds.
///
/// Used across the pipeline for:
/// - Book update timestamps
/// - Spread tick timestamps
/// - Heartbeat / staleness timing
///
/// PANIC:
/// - Panics if system time is before UNIX_EPOCH (should never happen).
///
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time is before UNIX_EPOCH")
        .as_millis() as i64
}

/// Returns the current Unix timestamp in microseconds.
///
/// Top-of-book quotes carry microsecond timestamps so that spread
/// freshness checks can distinguish updates inside one millisecond.
pub fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time is before UNIX_EPOCH")
        .as_micros() as i64
}

/// Extracts an `f64` from a JSON value that may be either a number
/// or a string-encoded number.
///
/// Exchanges are inconsistent about this even within a single payload,
/// so every connector parses prices and sizes through this helper.
///
/// Returns `None` for missing fields, nulls and unparseable strings.
pub fn json_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

/// Extracts a `u64` sequence id from a JSON value that may be a number
/// or a string-encoded number.
pub fn json_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<u64>().ok(),
        _ => None,
    }
}

/// Extracts an `i64` millisecond timestamp from a JSON value.
///
/// Exchanges mix seconds, milliseconds, microseconds and nanoseconds;
/// the magnitude decides the unit.
pub fn json_ts_ms(v: &Value) -> Option<i64> {
    let raw = match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => s.parse::<i64>().ok()?,
        _ => return None,
    };
    if raw > 100_000_000_000_000_000 {
        Some(raw / 1_000_000)
    } else if raw > 100_000_000_000_000 {
        Some(raw / 1_000)
    } else if raw < 100_000_000_000 {
        Some(raw * 1_000)
    } else {
        Some(raw)
    }
}

/// Parses a `[price, quantity]` JSON array level into an `(f64, f64)` pair.
///
/// Both members may be numbers or strings. Returns `None` when either
/// member is missing or unparseable; callers skip such levels.
pub fn json_level(v: &Value) -> Option<(f64, f64)> {
    let arr = v.as_array()?;
    let price = json_f64(arr.first()?)?;
    let qty = json_f64(arr.get(1)?)?;
    Some((price, qty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn f64_from_number_and_string() {
        assert_eq!(json_f64(&json!(1.5)), Some(1.5));
        assert_eq!(json_f64(&json!("60000.25")), Some(60000.25));
        assert_eq!(json_f64(&json!(null)), None);
        assert_eq!(json_f64(&json!("abc")), None);
    }

    #[test]
    fn ts_unit_detection() {
        // seconds
        assert_eq!(json_ts_ms(&json!(1_700_000_000i64)), Some(1_700_000_000_000));
        // milliseconds
        assert_eq!(json_ts_ms(&json!(1_700_000_000_123i64)), Some(1_700_000_000_123));
        // microseconds
        assert_eq!(
            json_ts_ms(&json!(1_700_000_000_123_456i64)),
            Some(1_700_000_000_123)
        );
        // nanoseconds
        assert_eq!(
            json_ts_ms(&json!(1_700_000_000_123_456_789i64)),
            Some(1_700_000_000_123)
        );
    }

    #[test]
    fn level_parsing() {
        assert_eq!(json_level(&json!(["100.0", "2.0"])), Some((100.0, 2.0)));
        assert_eq!(json_level(&json!([100.0, 2.0])), Some((100.0, 2.0)));
        assert_eq!(json_level(&json!(["100.0"])), None);
    }
}
