//! Byte quantity parsing with IEC and SI suffixes.

use crate::error::{Result, UnikitError};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Parses strings like `64Mi`, `1Gi`, `512K`, or plain byte counts.
///
/// IEC suffixes (`Ki`, `Mi`, `Gi`) are powers of 1024; SI suffixes
/// (`K`, `M`, `G`) are powers of 1000. A bare number is taken as bytes.
///
/// # Errors
///
/// Returns [`UnikitError::InvalidInput`] if the numeric part does not parse
/// or the suffix is unrecognised.
pub fn parse_quantity(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("Gi") {
        (n, GIB)
    } else if let Some(n) = s.strip_suffix("Mi") {
        (n, MIB)
    } else if let Some(n) = s.strip_suffix("Ki") {
        (n, KIB)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1_000_000_000)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1_000_000)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1_000)
    } else {
        (s, 1)
    };
    let value: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| UnikitError::InvalidInput {
            message: format!("invalid quantity: {s}"),
        })?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| UnikitError::InvalidInput {
            message: format!("quantity overflows: {s}"),
        })
}

/// Formats a byte count with the largest fitting IEC suffix.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GIB && bytes % GIB == 0 {
        format!("{}Gi", bytes / GIB)
    } else if bytes >= MIB && bytes % MIB == 0 {
        format!("{}Mi", bytes / MIB)
    } else if bytes >= KIB && bytes % KIB == 0 {
        format!("{}Ki", bytes / KIB)
    } else {
        format!("{bytes}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_iec_suffixes() {
        assert_eq!(parse_quantity("64Mi").unwrap(), 64 * MIB);
        assert_eq!(parse_quantity("512Mi").unwrap(), 536_870_912);
        assert_eq!(parse_quantity("1Gi").unwrap(), GIB);
        assert_eq!(parse_quantity("4Ki").unwrap(), 4096);
    }

    #[test]
    fn parse_si_suffixes() {
        assert_eq!(parse_quantity("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_quantity("5M").unwrap(), 5_000_000);
        assert_eq!(parse_quantity("2K").unwrap(), 2_000);
    }

    #[test]
    fn bare_number_is_bytes() {
        assert_eq!(parse_quantity("512").unwrap(), 512);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_quantity("lots").is_err());
        assert!(parse_quantity("12Q").is_err());
        assert!(parse_quantity("").is_err());
    }

    #[test]
    fn format_picks_largest_suffix() {
        assert_eq!(format_bytes(64 * MIB), "64Mi");
        assert_eq!(format_bytes(GIB), "1Gi");
        assert_eq!(format_bytes(500), "500");
    }
}
