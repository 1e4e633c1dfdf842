//! Utility functions for tnet

use std::time::{SystemTime, UNIX_EPOCH};

const BYTES_PER_GB: f64 = (1024u64 * 1024 * 1024) as f64;

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Convert a byte count to (binary) gigabytes
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// Parse duration string (e.g., "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        let split = s.len() - s.chars().last().map(char::len_utf8).unwrap_or(0);
        (&s[..split], &s[split..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let secs_per_unit = match unit {
        "ms" => return Ok(std::time::Duration::from_millis(num)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };
    let secs = num
        .checked_mul(secs_per_unit)
        .ok_or_else(|| crate::Error::InvalidConfig(format!("duration too large: {}", s)))?;

    Ok(std::time::Duration::from_secs(secs))
}

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Validate an identifier received from the network (peer or content id)
///
/// Identifiers are used as store keys joined by a NUL separator, so NUL and
/// other control characters are rejected.
pub fn validate_id(kind: &str, id: &str) -> crate::Result<()> {
    if id.is_empty() {
        return Err(crate::Error::MalformedMessage(format!("empty {}", kind)));
    }

    if id.len() > 512 {
        return Err(crate::Error::MalformedMessage(format!(
            "{} too long (max 512 bytes)",
            kind
        )));
    }

    if id.chars().any(|c| c.is_control()) {
        return Err(crate::Error::MalformedMessage(format!(
            "{} contains invalid characters",
            kind
        )));
    }

    Ok(())
}
