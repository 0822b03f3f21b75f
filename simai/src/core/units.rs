//! Canonical units and backend textual conventions.
//!
//! Canonical values are plain `f64`s in base units: bits/second for bandwidth,
//! seconds for latency, a plain fraction for error rate. Backends either want
//! the raw base-unit number or a unit-suffixed string (`400Gbps`, `0.5ms`).
//! Reading accepts both forms.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Bandwidth,
    Latency,
    ErrorRate,
}

impl Quantity {
    pub fn field_name(self) -> &'static str {
        match self {
            Quantity::Bandwidth => "bandwidth",
            Quantity::Latency => "latency",
            Quantity::ErrorRate => "error rate",
        }
    }
}

/// Textual convention a backend expects for link quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// Bare numbers in canonical base units.
    Raw,
    /// Bandwidth in `Gbps`, latency in `ms`, error rate bare.
    Suffixed,
}

const SIGNIFICANT_DIGITS: usize = 12;

static QUANTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?)\s*([A-Za-z/]*)$").unwrap()
});

/// Render a canonical value in the given backend convention.
pub fn to_backend_units(value: f64, quantity: Quantity, convention: Convention) -> String {
    match (convention, quantity) {
        (Convention::Raw, _) | (Convention::Suffixed, Quantity::ErrorRate) => format_number(value),
        (Convention::Suffixed, Quantity::Bandwidth) => {
            format!("{}Gbps", format_number(value / 1e9))
        }
        (Convention::Suffixed, Quantity::Latency) => format!("{}ms", format_number(value * 1e3)),
    }
}

/// Format a float with at most 12 significant digits and no exponent or
/// trailing zeros.
pub fn format_number(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if !value.is_finite() {
        return format!("{value}");
    }
    let rounded: f64 = format!("{:.*e}", SIGNIFICANT_DIGITS - 1, value)
        .parse()
        .unwrap_or(value);
    format!("{rounded}")
}

/// Parse a bare or unit-suffixed field into canonical units.
///
/// Bare numbers are taken as already canonical. Suffixes are matched
/// case-insensitively. Negative values are rejected.
pub fn parse_quantity(text: &str, quantity: Quantity) -> Result<f64> {
    let field = quantity.field_name();
    let trimmed = text.trim();
    let caps = QUANTITY_RE
        .captures(trimmed)
        .ok_or_else(|| Error::malformed(field, trimmed, "not a number"))?;

    let number: f64 = caps[1]
        .parse()
        .map_err(|_| Error::malformed(field, trimmed, "not a number"))?;
    let suffix = caps[2].to_ascii_lowercase();
    let scale = match (quantity, suffix.as_str()) {
        (_, "") => 1.0,
        (Quantity::Bandwidth, "bps") => 1.0,
        (Quantity::Bandwidth, "kbps") => 1e3,
        (Quantity::Bandwidth, "mbps") => 1e6,
        (Quantity::Bandwidth, "gbps") => 1e9,
        (Quantity::Bandwidth, "tbps") => 1e12,
        (Quantity::Latency, "s") => 1.0,
        (Quantity::Latency, "ms") => 1e-3,
        (Quantity::Latency, "us") => 1e-6,
        (Quantity::Latency, "ns") => 1e-9,
        _ => {
            return Err(Error::malformed(
                field,
                trimmed,
                format!("unrecognised unit `{}`", &caps[2]),
            ));
        }
    };

    let value = number * scale;
    if !value.is_finite() {
        return Err(Error::malformed(field, trimmed, "out of range"));
    }
    if value < 0.0 {
        return Err(Error::malformed(field, trimmed, "must be non-negative"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        let tolerance = expected.abs() * 1e-6;
        assert!(
            (actual - expected).abs() <= tolerance,
            "{actual} differs from {expected} by more than 1e-6 relative"
        );
    }

    #[test]
    fn canonical_values_survive_both_conventions() {
        let cases = [
            (400_000_000_000.0, Quantity::Bandwidth),
            (0.000025, Quantity::Latency),
            (0.0, Quantity::ErrorRate),
        ];
        for (value, quantity) in cases {
            for convention in [Convention::Raw, Convention::Suffixed] {
                let text = to_backend_units(value, quantity, convention);
                let back = parse_quantity(&text, quantity).expect("parse rendered value");
                assert_close(back, value);
            }
        }
    }

    #[test]
    fn suffixed_rendering_uses_gbps_and_ms() {
        assert_eq!(
            to_backend_units(400e9, Quantity::Bandwidth, Convention::Suffixed),
            "400Gbps"
        );
        assert_eq!(
            to_backend_units(0.000025, Quantity::Latency, Convention::Suffixed),
            "0.025ms"
        );
        assert_eq!(
            to_backend_units(0.000025, Quantity::Latency, Convention::Raw),
            "0.000025"
        );
    }

    #[test]
    fn hand_written_suffixes_match_bare_numbers() {
        let suffixed = parse_quantity("100Gbps", Quantity::Bandwidth).expect("parse");
        let bare = parse_quantity("100000000000", Quantity::Bandwidth).expect("parse");
        assert_close(suffixed, bare);

        let suffixed = parse_quantity("0.5ms", Quantity::Latency).expect("parse");
        let bare = parse_quantity("0.0005", Quantity::Latency).expect("parse");
        assert_close(suffixed, bare);

        assert_close(
            parse_quantity("2.5 GBPS", Quantity::Bandwidth).expect("parse"),
            2.5e9,
        );
    }

    #[test]
    fn rejects_unknown_units_and_negatives() {
        let err = parse_quantity("10furlongs", Quantity::Latency).unwrap_err();
        assert!(err.to_string().contains("unrecognised unit `furlongs`"));

        let err = parse_quantity("-1", Quantity::Bandwidth).unwrap_err();
        assert!(err.to_string().contains("non-negative"));

        assert!(parse_quantity("5ms", Quantity::ErrorRate).is_err());
        assert!(parse_quantity("fast", Quantity::Bandwidth).is_err());
    }

    #[test]
    fn rejects_values_that_overflow() {
        for text in ["1e400", "1e300Tbps", "-1e400"] {
            let err = parse_quantity(text, Quantity::Bandwidth).unwrap_err();
            assert!(matches!(err, Error::MalformedValue { .. }), "{text}: {err}");
            assert!(err.to_string().contains("out of range"), "{text}: {err}");
        }
    }

    #[test]
    fn format_number_trims_float_noise() {
        assert_eq!(format_number(0.1 + 0.2), "0.3");
        assert_eq!(format_number(1e-9), "0.000000001");
        assert_eq!(format_number(0.0), "0");
    }
}
