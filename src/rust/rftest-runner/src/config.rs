// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Per-procedure test configuration.
//!
//! Every field may be omitted. Values whose default depends on the protocol
//! or procedure are optional here and resolved when a run is planned.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::request::{Procedure, Protocol};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestConfig {
    pub analyzer: AnalyzerEndpoint,
    pub defaults: Defaults,
    pub lora: ProtocolConfig,
    pub lte: ProtocolConfig,
    pub ble: ProtocolConfig,
    /// EARFCN to downlink carrier frequency in Hz.
    pub lte_earfcn_map: BTreeMap<u32, u64>,
    /// Overrides of the BLE channel to frequency mapping.
    pub ble_channel_map: BTreeMap<u8, u64>,
}

impl TestConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text).context("Failed to parse test configuration")?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read test configuration from {}", path.display()))?;
        Self::from_json_str(&text)
    }

    pub fn protocol(&self, protocol: Protocol) -> &ProtocolConfig {
        match protocol {
            Protocol::Lora => &self.lora,
            Protocol::Lte => &self.lte,
            Protocol::Ble => &self.ble,
        }
    }

    pub fn procedure(&self, protocol: Protocol, procedure: Procedure) -> &ProcedureConfig {
        self.protocol(protocol).procedure(procedure)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyzerEndpoint {
    pub address: String,
    pub port: u16,
}

impl Default for AnalyzerEndpoint {
    fn default() -> Self {
        AnalyzerEndpoint {
            address: rftest_analyzer::DEFAULT_ADDRESS.to_string(),
            port: rftest_analyzer::DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Defaults {
    pub marker: String,
    /// Pause between analyzer commands and readings.
    pub default_delay_seconds: f64,
    /// Written on every run unless the procedure overrides it.
    pub ref_offset_db: f64,
    pub timeouts: Timeouts,
}

impl Default for Defaults {
    fn default() -> Self {
        Defaults {
            marker: rftest_analyzer::DEFAULT_MARKER.to_string(),
            default_delay_seconds: 0.18,
            ref_offset_db: 0.0,
            timeouts: Timeouts::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    pub connect_analyzer_seconds: f64,
    pub analyzer_command_seconds: f64,
    pub device_command_seconds: f64,
    /// Bound on each best-effort call after a run was cancelled.
    pub cleanup_seconds: f64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect_analyzer_seconds: 25.0,
            analyzer_command_seconds: 12.0,
            device_command_seconds: 20.0,
            cleanup_seconds: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolConfig {
    pub tx_power: ProcedureConfig,
    pub frequency_accuracy: ProcedureConfig,
    pub occupied_bandwidth: ProcedureConfig,
}

impl ProtocolConfig {
    pub fn procedure(&self, procedure: Procedure) -> &ProcedureConfig {
        match procedure {
            Procedure::TxPower => &self.tx_power,
            Procedure::FrequencyAccuracy => &self.frequency_accuracy,
            Procedure::OccupiedBandwidth => &self.occupied_bandwidth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcedureConfig {
    pub analyzer_setup: AnalyzerSetup,
    pub settle: Settle,
    pub zooms: Vec<ZoomEntry>,
    /// Connecting the device and switching the LTE modem on.
    pub retries: Option<Retries>,
    /// Reconnecting a BLE device after save-and-reset.
    pub reconnect: Option<Retries>,
    pub reset_wait_seconds: Option<f64>,
    pub limits: Limits,
    pub tone: ToneConfig,
    pub obw: ObwConfig,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyzerSetup {
    pub span_hz: Option<f64>,
    pub rbw_hz: Option<f64>,
    pub vbw_hz: Option<f64>,
    pub ref_level_dbm: Option<f64>,
    pub ref_offset_db: Option<f64>,
    pub use_peak_detector: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settle {
    pub after_center_seconds: Option<f64>,
    pub after_arm_seconds: Option<f64>,
}

/// Zoom pass as written in the configuration. Incomplete or non-positive
/// entries are skipped.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ZoomEntry {
    pub span_hz: Option<f64>,
    pub rbw_hz: Option<f64>,
    pub vbw_hz: Option<f64>,
    pub delay_seconds: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomPass {
    pub span_hz: f64,
    pub rbw_hz: f64,
    pub vbw_hz: f64,
    pub settle: Duration,
}

const DEFAULT_ZOOM_SETTLE_SECONDS: f64 = 0.2;

const FALLBACK_ZOOMS: [(f64, f64, f64); 3] = [
    (2_000_000.0, 30_000.0, 100_000.0),
    (200_000.0, 10_000.0, 30_000.0),
    (20_000.0, 1_000.0, 3_000.0),
];

impl ZoomEntry {
    fn validate(&self) -> Option<ZoomPass> {
        let positive = |v: Option<f64>| v.filter(|v| v.is_finite() && *v > 0.0);
        Some(ZoomPass {
            span_hz: positive(self.span_hz)?,
            rbw_hz: positive(self.rbw_hz)?,
            vbw_hz: positive(self.vbw_hz)?,
            settle: seconds(self.delay_seconds.unwrap_or(DEFAULT_ZOOM_SETTLE_SECONDS)),
        })
    }
}

impl ProcedureConfig {
    /// Valid configured zoom passes, or the built-in narrowing sequence when
    /// none are usable.
    pub fn zoom_passes(&self) -> Vec<ZoomPass> {
        let passes: Vec<ZoomPass> = self.zooms.iter().filter_map(ZoomEntry::validate).collect();
        if !passes.is_empty() {
            return passes;
        }
        FALLBACK_ZOOMS
            .iter()
            .map(|&(span_hz, rbw_hz, vbw_hz)| ZoomPass {
                span_hz,
                rbw_hz,
                vbw_hz,
                settle: seconds(DEFAULT_ZOOM_SETTLE_SECONDS),
            })
            .collect()
    }
}

/// Bounded retry with a growing pause.
///
/// The pause after attempt `n` is `backoff × (1 + growth × (n − 1))`, so a
/// growth of 1 gives a linear backoff and 0 a fixed one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retries {
    pub attempts: u32,
    pub backoff_seconds: f64,
    #[serde(default = "Retries::linear")]
    pub backoff_growth: f64,
}

impl Retries {
    fn linear() -> f64 {
        1.0
    }

    pub const DEVICE_CONNECT: Retries = Retries {
        attempts: 3,
        backoff_seconds: 0.8,
        backoff_growth: 1.0,
    };

    pub const RECONNECT_AFTER_RESET: Retries = Retries {
        attempts: 5,
        backoff_seconds: 0.35,
        backoff_growth: 0.25,
    };

    pub fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1.0 + self.backoff_growth * f64::from(attempt.saturating_sub(1));
        seconds(self.backoff_seconds * factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Limits {
    pub min_dbm: Option<f64>,
    pub max_dbm: Option<f64>,
    pub ppm_limit: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToneConfig {
    pub duration_seconds: Option<f64>,
    pub offset_hz: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObwConfig {
    pub accumulate_seconds: Option<f64>,
    pub percentage: Option<f64>,
}

/// Source of the configuration used by new runs.
pub trait ConfigProvider: Send + Sync {
    /// Configuration for one run. A run keeps its snapshot even if the
    /// provider changes while it executes.
    fn snapshot(&self) -> Arc<TestConfig>;
}

/// Fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(Arc<TestConfig>);

impl StaticConfig {
    pub fn new(config: TestConfig) -> Self {
        StaticConfig(Arc::new(config))
    }
}

impl ConfigProvider for StaticConfig {
    fn snapshot(&self) -> Arc<TestConfig> {
        Arc::clone(&self.0)
    }
}

/// Non-negative seconds to a duration. Out of range values saturate.
pub(crate) fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}
