// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Test requests and their validation into an executable plan.

use std::fmt;
use std::time::Duration;

use rftest_analyzer::registry::names;
use rftest_analyzer::{CommandRegistry, DEFAULT_OBW_PERCENTAGE};
use serde::{Deserialize, Serialize};

use crate::config::{Limits, ProcedureConfig, Retries, TestConfig, Timeouts, ZoomPass, seconds};
use crate::device::{CarrierTarget, LoraModulation, ToneRequest, TxPowerConst};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Lora,
    Lte,
    Ble,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Lora => "LoRa",
            Protocol::Lte => "LTE",
            Protocol::Ble => "BLE",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Procedure {
    TxPower,
    FrequencyAccuracy,
    OccupiedBandwidth,
}

impl Procedure {
    /// Analyzer commands a run of this procedure cannot do without.
    pub fn required_commands(self) -> &'static [&'static str] {
        match self {
            Procedure::TxPower => &[
                names::IDENTIFY,
                names::OPERATION_COMPLETE,
                names::SET_CENTER_FREQUENCY,
                names::SET_SPAN,
                names::PEAK_SEARCH,
                names::GET_MARKER_POWER,
            ],
            Procedure::FrequencyAccuracy => &[
                names::IDENTIFY,
                names::OPERATION_COMPLETE,
                names::SET_CENTER_FREQUENCY,
                names::SET_SPAN,
                names::SET_RBW,
                names::SET_VBW,
                names::PEAK_SEARCH,
                names::MARKER_TO_CENTER,
                names::GET_MARKER_FREQUENCY,
            ],
            Procedure::OccupiedBandwidth => &[
                names::IDENTIFY,
                names::OPERATION_COMPLETE,
                names::SET_CENTER_FREQUENCY,
                names::SET_SPAN,
                names::SET_TRACE_MODE,
                names::GET_TRACE_DATA,
            ],
        }
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Procedure::TxPower => "Tx power",
            Procedure::FrequencyAccuracy => "frequency accuracy",
            Procedure::OccupiedBandwidth => "occupied bandwidth",
        })
    }
}

/// Caller supplied parameters. Which ones are needed depends on the protocol
/// and procedure.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunParameters {
    pub device_address: Option<String>,
    pub frequency_hz: Option<u64>,
    /// EARFCN for LTE, channel index for BLE.
    pub channel: Option<u32>,
    pub power_dbm: Option<i32>,
    /// BLE power setting, e.g. `0x1F`.
    pub power_const: Option<String>,
    pub min_dbm: Option<f64>,
    pub max_dbm: Option<f64>,
    pub ppm_limit: Option<f64>,
    pub bandwidth: Option<u32>,
    pub datarate: Option<u32>,
    /// Max-hold accumulation for occupied bandwidth, tone length for BLE.
    pub duration_seconds: Option<f64>,
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRequest {
    pub protocol: Protocol,
    pub procedure: Procedure,
    #[serde(flatten)]
    pub parameters: RunParameters,
}

impl TestRequest {
    pub fn new(protocol: Protocol, procedure: Procedure, parameters: RunParameters) -> Self {
        TestRequest {
            protocol,
            procedure,
            parameters,
        }
    }
}

const BLE_MAX_CHANNEL: u32 = 39;
const BLE_BASE_FREQUENCY_HZ: u64 = 2_402_000_000;
const BLE_CHANNEL_SPACING_HZ: u64 = 2_000_000;
const LTE_FREQUENCY_TOLERANCE_HZ: u64 = 2_000;
const DEFAULT_BLE_TONE_SECONDS: f64 = 5.0;
const DEFAULT_OBW_ACCUMULATE_SECONDS: f64 = 10.0;
const DEFAULT_RESET_WAIT_SECONDS: f64 = 1.8;

/// Analyzer settings applied before arming.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AnalyzerSettings {
    pub span_hz: Option<f64>,
    pub rbw_hz: Option<f64>,
    pub vbw_hz: Option<f64>,
    pub ref_level_dbm: Option<f64>,
    pub ref_offset_db: f64,
    pub use_peak_detector: bool,
    pub settle: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RunTimeouts {
    pub connect_analyzer: Duration,
    pub analyzer_command: Duration,
    pub device_command: Duration,
    pub cleanup: Duration,
}

impl From<&Timeouts> for RunTimeouts {
    fn from(timeouts: &Timeouts) -> Self {
        RunTimeouts {
            connect_analyzer: seconds(timeouts.connect_analyzer_seconds),
            analyzer_command: seconds(timeouts.analyzer_command_seconds),
            device_command: seconds(timeouts.device_command_seconds),
            cleanup: seconds(timeouts.cleanup_seconds),
        }
    }
}

/// A validated request with all configuration resolved.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RunPlan {
    pub protocol: Protocol,
    pub procedure: Procedure,
    pub analyzer_address: String,
    pub analyzer_port: u16,
    pub device_address: Option<String>,
    /// Expected carrier, used as analyzer center frequency.
    pub carrier_hz: u64,
    pub target: CarrierTarget,
    pub power_dbm: i32,
    pub ble_power: Option<TxPowerConst>,
    pub tone: Option<ToneRequest>,
    pub modulation: Option<LoraModulation>,
    pub limits: Limits,
    pub analyzer: AnalyzerSettings,
    pub zooms: Vec<ZoomPass>,
    pub connect_retries: Retries,
    pub reconnect_retries: Retries,
    pub reset_wait: Duration,
    pub arm_settle: Duration,
    pub obw_accumulate: Duration,
    pub obw_percentage: f64,
    pub marker: String,
    pub delay: Duration,
}

impl RunPlan {
    pub(crate) fn resolve(request: &TestRequest, config: &TestConfig, registry: &CommandRegistry) -> Result<Self> {
        registry.require(request.procedure.required_commands())?;

        let params = &request.parameters;
        let procedure_config = config.procedure(request.protocol, request.procedure);
        let (carrier_hz, target) = resolve_carrier(request, config)?;

        let power_dbm = match request.protocol {
            Protocol::Lora | Protocol::Lte => params
                .power_dbm
                .ok_or_else(|| Error::validation("powerDbm is required"))?,
            Protocol::Ble => params.power_dbm.unwrap_or_default(),
        };
        let ble_power = match (request.protocol, request.procedure) {
            (Protocol::Ble, Procedure::TxPower) => {
                let raw = params
                    .power_const
                    .as_deref()
                    .ok_or_else(|| Error::validation("powerConst is required for BLE Tx power"))?;
                Some(raw.parse::<TxPowerConst>().map_err(Error::Validation)?)
            }
            _ => None,
        };

        let tone_seconds = params
            .duration_seconds
            .or(procedure_config.tone.duration_seconds)
            .unwrap_or(DEFAULT_BLE_TONE_SECONDS);
        let tone = match request.protocol {
            Protocol::Ble => {
                let channel = params.channel.unwrap_or_default();
                Some(ToneRequest {
                    channel: u8::try_from(channel).map_err(|_| Error::validation("BLE channel out of range"))?,
                    duration_ms: (tone_seconds * 1000.0).clamp(0.0, f64::from(u32::MAX)) as u32,
                    offset_hz: procedure_config.tone.offset_hz.unwrap_or_default(),
                })
            }
            _ => None,
        };

        let modulation = match (request.protocol, request.procedure) {
            (Protocol::Lora, Procedure::OccupiedBandwidth) => match (params.bandwidth, params.datarate) {
                (Some(bandwidth), Some(datarate)) => Some(LoraModulation { bandwidth, datarate }),
                (None, None) => None,
                _ => {
                    return Err(Error::validation(
                        "bandwidth and datarate must be given together",
                    ));
                }
            },
            _ => None,
        };

        let limits = Limits {
            min_dbm: params.min_dbm.or(procedure_config.limits.min_dbm),
            max_dbm: params.max_dbm.or(procedure_config.limits.max_dbm),
            ppm_limit: params.ppm_limit.or(procedure_config.limits.ppm_limit),
        };
        if let Some(limit) = limits.ppm_limit.filter(|l| l.is_nan() || *l < 0.0) {
            return Err(Error::validation(format!("ppm limit {limit} must be non-negative")));
        }

        let obw_accumulate_seconds = match request.procedure {
            Procedure::OccupiedBandwidth => params.duration_seconds,
            _ => None,
        }
        .or(procedure_config.obw.accumulate_seconds)
        .unwrap_or(DEFAULT_OBW_ACCUMULATE_SECONDS);
        let obw_percentage = params
            .percentage
            .or(procedure_config.obw.percentage)
            .unwrap_or(DEFAULT_OBW_PERCENTAGE);
        if obw_percentage.is_nan() || obw_percentage <= 0.0 || obw_percentage > 100.0 {
            return Err(Error::validation(format!(
                "percentage {obw_percentage} outside (0, 100]"
            )));
        }

        let delay = seconds(config.defaults.default_delay_seconds);
        let analyzer = analyzer_settings(request.procedure, procedure_config, config, delay);
        let arm_settle = procedure_config
            .settle
            .after_arm_seconds
            .map(seconds)
            .unwrap_or_else(|| default_arm_settle(request.protocol, request.procedure, tone_seconds));

        Ok(RunPlan {
            protocol: request.protocol,
            procedure: request.procedure,
            analyzer_address: config.analyzer.address.clone(),
            analyzer_port: config.analyzer.port,
            device_address: params.device_address.clone(),
            carrier_hz,
            target,
            power_dbm,
            ble_power,
            tone,
            modulation,
            limits,
            analyzer,
            zooms: procedure_config.zoom_passes(),
            connect_retries: procedure_config.retries.unwrap_or(Retries::DEVICE_CONNECT),
            reconnect_retries: procedure_config
                .reconnect
                .unwrap_or(Retries::RECONNECT_AFTER_RESET),
            reset_wait: seconds(
                procedure_config
                    .reset_wait_seconds
                    .unwrap_or(DEFAULT_RESET_WAIT_SECONDS),
            ),
            arm_settle,
            obw_accumulate: seconds(obw_accumulate_seconds),
            obw_percentage,
            marker: config.defaults.marker.clone(),
            delay,
        })
    }
}

fn resolve_carrier(request: &TestRequest, config: &TestConfig) -> Result<(u64, CarrierTarget)> {
    let params = &request.parameters;
    match request.protocol {
        Protocol::Lora => {
            let hz = params
                .frequency_hz
                .filter(|hz| *hz > 0)
                .ok_or_else(|| Error::validation("frequencyHz is required"))?;
            Ok((hz, CarrierTarget::FrequencyHz(hz)))
        }
        Protocol::Lte => {
            let (earfcn, hz) = resolve_earfcn(config, params.channel, params.frequency_hz)?;
            Ok((hz, CarrierTarget::Earfcn(earfcn)))
        }
        Protocol::Ble => {
            let channel = params
                .channel
                .ok_or_else(|| Error::validation("channel is required"))?;
            let hz = ble_channel_frequency(config, channel)?;
            Ok((hz, CarrierTarget::FrequencyHz(hz)))
        }
    }
}

/// Look up an EARFCN or a carrier frequency in the configured map.
///
/// Frequencies match exactly first, then within a small tolerance.
pub(crate) fn resolve_earfcn(config: &TestConfig, earfcn: Option<u32>, frequency_hz: Option<u64>) -> Result<(u32, u64)> {
    let map = &config.lte_earfcn_map;
    if map.is_empty() {
        return Err(Error::validation("no LTE EARFCN map configured"));
    }
    if let Some(earfcn) = earfcn {
        return map
            .get(&earfcn)
            .map(|hz| (earfcn, *hz))
            .ok_or_else(|| Error::validation(format!("unsupported LTE EARFCN {earfcn}")));
    }
    let hz = frequency_hz.ok_or_else(|| Error::validation("channel or frequencyHz is required"))?;
    map.iter()
        .find(|(_, f)| **f == hz)
        .or_else(|| {
            map.iter()
                .filter(|(_, f)| f.abs_diff(hz) <= LTE_FREQUENCY_TOLERANCE_HZ)
                .min_by_key(|(_, f)| f.abs_diff(hz))
        })
        .map(|(earfcn, f)| (*earfcn, *f))
        .ok_or_else(|| Error::validation(format!("unsupported LTE frequency {hz} Hz")))
}

pub(crate) fn ble_channel_frequency(config: &TestConfig, channel: u32) -> Result<u64> {
    if channel > BLE_MAX_CHANNEL {
        return Err(Error::validation(format!(
            "BLE channel {channel} outside 0..={BLE_MAX_CHANNEL}"
        )));
    }
    let overridden = u8::try_from(channel)
        .ok()
        .and_then(|ch| config.ble_channel_map.get(&ch).copied());
    Ok(overridden.unwrap_or(BLE_BASE_FREQUENCY_HZ + u64::from(channel) * BLE_CHANNEL_SPACING_HZ))
}

fn analyzer_settings(procedure: Procedure, procedure_config: &ProcedureConfig, config: &TestConfig, delay: Duration) -> AnalyzerSettings {
    let setup = &procedure_config.analyzer_setup;
    let (span, rbw, vbw) = match procedure {
        Procedure::OccupiedBandwidth => (Some(500_000.0), Some(3_000.0), Some(10_000.0)),
        _ => (Some(5_000_000.0), None, None),
    };
    AnalyzerSettings {
        span_hz: setup.span_hz.or(span),
        rbw_hz: setup.rbw_hz.or(rbw),
        vbw_hz: setup.vbw_hz.or(vbw),
        ref_level_dbm: setup.ref_level_dbm,
        ref_offset_db: setup.ref_offset_db.unwrap_or(config.defaults.ref_offset_db),
        use_peak_detector: setup.use_peak_detector.unwrap_or(true),
        settle: procedure_config
            .settle
            .after_center_seconds
            .map(seconds)
            .unwrap_or(delay),
    }
}

fn default_arm_settle(protocol: Protocol, procedure: Procedure, tone_seconds: f64) -> Duration {
    match (protocol, procedure) {
        (Protocol::Lora, _) => Duration::from_millis(600),
        (Protocol::Lte, Procedure::FrequencyAccuracy) => Duration::from_millis(400),
        (Protocol::Lte, _) => Duration::from_millis(300),
        (Protocol::Ble, _) => seconds((tone_seconds * 0.1).clamp(0.15, 0.5)),
    }
}
