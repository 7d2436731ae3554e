// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[-+]?\d*\.?\d+(?:[eE][-+]?\d+)?").expect("number regex is valid")
});

/// Extract the first signed floating point token of an analyzer reply.
///
/// Unit suffixes and surrounding whitespace are ignored, e.g. `"23.5 DBM"`
/// yields `23.5`.
pub fn parse_number(reply: &str) -> Result<f64> {
    NUMBER
        .find(reply)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| Error::Parse {
            reply: reply.to_string(),
        })
}

/// Frequency unit codes understood by the `{units}` placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrequencyUnit {
    #[default]
    Hz,
    KHz,
    MHz,
    GHz,
}

impl FrequencyUnit {
    pub fn code(self) -> &'static str {
        match self {
            FrequencyUnit::Hz => "HZ",
            FrequencyUnit::KHz => "KHZ",
            FrequencyUnit::MHz => "MHZ",
            FrequencyUnit::GHz => "GHZ",
        }
    }

    pub fn to_hz(self, value: f64) -> f64 {
        match self {
            FrequencyUnit::Hz => value,
            FrequencyUnit::KHz => value * 1e3,
            FrequencyUnit::MHz => value * 1e6,
            FrequencyUnit::GHz => value * 1e9,
        }
    }
}

impl fmt::Display for FrequencyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Render a value for a command argument. Integral values are written without
/// a fractional part.
pub(crate) fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("23.5 DBM").unwrap(), 23.5);
        assert_eq!(parse_number("-40dBm\r\n").unwrap(), -40.0);
        assert_eq!(parse_number("9.18000918E+08").unwrap(), 918_000_918.0);
        assert_eq!(parse_number("  +.5").unwrap(), 0.5);
        assert!(matches!(parse_number("N/A"), Err(Error::Parse { .. })));
        assert!(parse_number("").is_err());
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(918_000_000.0), "918000000");
        assert_eq!(format_value(20.5), "20.5");
        assert_eq!(format_value(-3.0), "-3");
        assert_eq!(FrequencyUnit::KHz.to_string(), "KHZ");
        assert_eq!(FrequencyUnit::MHz.to_hz(2.0), 2e6);
    }
}
