// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Progress records streamed to the consumer of a run.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::request::{Procedure, Protocol, RunParameters};
use crate::verdict::{FrequencyError, PassFailResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKey {
    ConnectAnalyzer,
    ConfigureAnalyzer,
    ConnectDut,
    ModemOn,
    Abort,
    CwOn,
    SetPower,
    SaveReset,
    ReconnectDut,
    ToneStart,
    Zoom,
    Measure,
    CwOff,
    ModemOff,
    DisconnectDut,
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepKey::ConnectAnalyzer => "connect analyzer",
            StepKey::ConfigureAnalyzer => "configure analyzer",
            StepKey::ConnectDut => "connect device",
            StepKey::ModemOn => "modem on",
            StepKey::Abort => "abort",
            StepKey::CwOn => "carrier on",
            StepKey::SetPower => "set power",
            StepKey::SaveReset => "save and reset",
            StepKey::ReconnectDut => "reconnect device",
            StepKey::ToneStart => "start tone",
            StepKey::Zoom => "zoom",
            StepKey::Measure => "measure",
            StepKey::CwOff => "carrier off",
            StepKey::ModemOff => "modem off",
            StepKey::DisconnectDut => "disconnect device",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Start,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Measurement {
    TxPower {
        measured_dbm: f64,
    },
    FrequencyAccuracy {
        expected_hz: f64,
        measured_hz: f64,
        error_hz: f64,
        error_ppm: f64,
    },
    OccupiedBandwidth {
        measured_hz: f64,
        percentage: f64,
    },
}

impl Measurement {
    /// The value limits are checked against.
    pub fn value(&self) -> f64 {
        match self {
            Measurement::TxPower { measured_dbm } => *measured_dbm,
            Measurement::FrequencyAccuracy { error_ppm, .. } => *error_ppm,
            Measurement::OccupiedBandwidth { measured_hz, .. } => *measured_hz,
        }
    }
}

impl From<FrequencyError> for Measurement {
    fn from(error: FrequencyError) -> Self {
        Measurement::FrequencyAccuracy {
            expected_hz: error.expected_hz,
            measured_hz: error.measured_hz,
            error_hz: error.error_hz,
            error_ppm: error.error_ppm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TestEvent {
    Start {
        run_id: Uuid,
        protocol: Protocol,
        procedure: Procedure,
        params: RunParameters,
    },
    Step {
        key: StepKey,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        measurement: Option<Measurement>,
        /// Attempt number of a retried step.
        #[serde(skip_serializing_if = "Option::is_none")]
        attempt: Option<u32>,
        /// The step was not needed and nothing was sent to the device.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        skipped: bool,
    },
    Log {
        message: String,
    },
    Result {
        measurement: Measurement,
        #[serde(flatten)]
        verdict: PassFailResult,
    },
    Error {
        message: String,
    },
    Done {
        ok: bool,
    },
}

impl TestEvent {
    pub(crate) fn step(key: StepKey, status: StepStatus) -> Self {
        TestEvent::Step {
            key,
            status,
            message: None,
            measurement: None,
            attempt: None,
            skipped: false,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, TestEvent::Done { .. })
    }

    /// Key and status of a step event.
    pub fn step_status(&self) -> Option<(StepKey, StepStatus)> {
        match self {
            TestEvent::Step { key, status, .. } => Some((*key, *status)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_json() {
        let start = TestEvent::Start {
            run_id: Uuid::nil(),
            protocol: Protocol::Lora,
            procedure: Procedure::TxPower,
            params: RunParameters {
                frequency_hz: Some(918_000_000),
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&start).unwrap();
        assert_eq!(value["type"], "start");
        assert_eq!(value["runId"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(value["protocol"], "lora");
        assert_eq!(value["procedure"], "txPower");
        assert_eq!(value["params"]["frequencyHz"], 918_000_000);

        let step = TestEvent::step(StepKey::ConnectDut, StepStatus::Start);
        assert_eq!(
            serde_json::to_value(&step).unwrap(),
            json!({"type": "step", "key": "connectDut", "status": "start"})
        );
        let skipped = TestEvent::Step {
            key: StepKey::SaveReset,
            status: StepStatus::Done,
            message: Some("power already set".to_string()),
            measurement: None,
            attempt: None,
            skipped: true,
        };
        assert_eq!(serde_json::to_value(&skipped).unwrap()["skipped"], true);

        let result = TestEvent::Result {
            measurement: Measurement::TxPower { measured_dbm: 13.8 },
            verdict: PassFailResult::within_bounds(13.8, Some(12.0), Some(15.0)),
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "type": "result",
                "measurement": {"kind": "txPower", "measuredDbm": 13.8},
                "measuredValue": 13.8,
                "lowerBound": 12.0,
                "upperBound": 15.0,
                "passed": true
            })
        );
        assert_eq!(
            serde_json::to_value(TestEvent::Done { ok: true }).unwrap(),
            json!({"type": "done", "ok": true})
        );
    }

    #[test]
    fn test_frequency_measurement() {
        let measurement = Measurement::from(FrequencyError::new(918_000_000.0, 918_009_180.0));
        assert!((measurement.value() - 10.0).abs() < 1e-9);
        let value = serde_json::to_value(measurement).unwrap();
        assert_eq!(value["kind"], "frequencyAccuracy");
        assert_eq!(value["errorHz"], 9180.0);
    }
}
