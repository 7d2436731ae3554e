// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Outcome of comparing a measured value with optional limits.
///
/// `passed` is `None` when no limit was supplied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassFailResult {
    pub measured_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lower_bound: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upper_bound: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ppm_limit: Option<f64>,
    pub passed: Option<bool>,
}

impl PassFailResult {
    /// No limits apply.
    pub fn undecided(measured_value: f64) -> Self {
        PassFailResult {
            measured_value,
            lower_bound: None,
            upper_bound: None,
            ppm_limit: None,
            passed: None,
        }
    }

    /// Passes when every supplied bound holds.
    pub fn within_bounds(measured_value: f64, lower_bound: Option<f64>, upper_bound: Option<f64>) -> Self {
        let passed = match (lower_bound, upper_bound) {
            (None, None) => None,
            (lower, upper) => Some(
                lower.is_none_or(|lower| measured_value >= lower)
                    && upper.is_none_or(|upper| measured_value <= upper),
            ),
        };
        PassFailResult {
            measured_value,
            lower_bound,
            upper_bound,
            ppm_limit: None,
            passed,
        }
    }

    /// Passes when the magnitude of `error_ppm` does not exceed the limit.
    pub fn within_ppm(error_ppm: f64, ppm_limit: Option<f64>) -> Self {
        PassFailResult {
            measured_value: error_ppm,
            lower_bound: None,
            upper_bound: None,
            ppm_limit,
            passed: ppm_limit.map(|limit| error_ppm.abs() <= limit),
        }
    }
}

/// Deviation of a measured carrier from the expected one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyError {
    pub expected_hz: f64,
    pub measured_hz: f64,
    pub error_hz: f64,
    pub error_ppm: f64,
}

impl FrequencyError {
    pub fn new(expected_hz: f64, measured_hz: f64) -> Self {
        let error_hz = measured_hz - expected_hz;
        FrequencyError {
            expected_hz,
            measured_hz,
            error_hz,
            error_ppm: error_hz / expected_hz * 1e6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_error_verdicts() {
        let error = FrequencyError::new(918_000_000.0, 918_009_180.0);
        assert_eq!(error.error_hz, 9_180.0);
        assert!((error.error_ppm - 10.0).abs() < 1e-9);
        assert_eq!(PassFailResult::within_ppm(error.error_ppm, Some(15.0)).passed, Some(true));
        assert_eq!(PassFailResult::within_ppm(error.error_ppm, Some(5.0)).passed, Some(false));
        assert_eq!(PassFailResult::within_ppm(error.error_ppm, None).passed, None);
        assert_eq!(PassFailResult::within_ppm(-error.error_ppm, Some(15.0)).passed, Some(true));
    }

    #[test]
    fn test_power_bounds() {
        assert_eq!(PassFailResult::within_bounds(13.8, Some(12.0), Some(15.0)).passed, Some(true));
        assert_eq!(PassFailResult::within_bounds(13.8, None, None).passed, None);
        assert_eq!(PassFailResult::within_bounds(13.8, Some(14.0), None).passed, Some(false));
        assert_eq!(PassFailResult::within_bounds(13.8, None, Some(13.0)).passed, Some(false));
        assert_eq!(PassFailResult::within_bounds(15.0, Some(12.0), Some(15.0)).passed, Some(true));
    }

    #[test]
    fn test_serialized_shape() {
        let value = serde_json::to_value(PassFailResult::within_bounds(13.8, Some(12.0), None)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"measuredValue": 13.8, "lowerBound": 12.0, "passed": true})
        );
        let value = serde_json::to_value(PassFailResult::undecided(1.0)).unwrap();
        assert_eq!(value, serde_json::json!({"measuredValue": 1.0, "passed": null}));
    }
}
