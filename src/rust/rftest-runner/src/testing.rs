// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Scripted device under test recording every call.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rftest_analyzer::simulator::AnalyzerSimulator;

use crate::config::{
    AnalyzerEndpoint, Defaults, ObwConfig, ProcedureConfig, ProtocolConfig, Retries, Settle, TestConfig, Timeouts,
    ZoomEntry,
};
use crate::device::{
    CarrierTarget, DeviceConnector, DeviceControlPort, DeviceError, DeviceResult, LoraModulation, ToneRequest,
    TxPowerConst,
};

#[derive(Debug, Clone, Default)]
pub(crate) struct Script {
    /// Number of connect calls failing before one succeeds.
    pub connect_failures: u32,
    pub tx_power: Option<TxPowerConst>,
    pub tone_rejected: bool,
    /// Calls answered with [`DeviceError::Rejected`].
    pub fail_on: Vec<&'static str>,
}

#[derive(Clone, Default)]
pub(crate) struct RecordingConnector {
    calls: Arc<Mutex<Vec<String>>>,
    script: Arc<Mutex<Script>>,
}

impl RecordingConnector {
    pub(crate) fn new(script: Script) -> Self {
        RecordingConnector {
            calls: Arc::default(),
            script: Arc::new(Mutex::new(script)),
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Wait until `call` was made, up to `limit`.
    pub(crate) async fn wait_for(&self, call: &str, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.calls().iter().any(|c| c == call) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

impl DeviceConnector for RecordingConnector {
    fn open(&self, _address: Option<&str>) -> DeviceResult<Box<dyn DeviceControlPort>> {
        Ok(Box::new(RecordingDevice {
            calls: Arc::clone(&self.calls),
            script: Arc::clone(&self.script),
        }))
    }
}

struct RecordingDevice {
    calls: Arc<Mutex<Vec<String>>>,
    script: Arc<Mutex<Script>>,
}

impl RecordingDevice {
    fn record(&mut self, call: &'static str) -> DeviceResult<()> {
        self.calls.lock().unwrap().push(call.to_string());
        if self.script.lock().unwrap().fail_on.contains(&call) {
            return Err(DeviceError::Rejected(format!("{call} refused")));
        }
        Ok(())
    }
}

impl DeviceControlPort for RecordingDevice {
    fn connect(&mut self) -> DeviceResult<()> {
        self.record("connect")?;
        let mut script = self.script.lock().unwrap();
        if script.connect_failures > 0 {
            script.connect_failures -= 1;
            return Err(DeviceError::Io("link down".to_string()));
        }
        Ok(())
    }

    fn disconnect(&mut self) -> DeviceResult<()> {
        self.record("disconnect")
    }

    fn continuous_wave_on(&mut self, _target: CarrierTarget, _power_dbm: i32) -> DeviceResult<()> {
        self.record("cw_on")
    }

    fn continuous_wave_off(&mut self) -> DeviceResult<()> {
        self.record("cw_off")
    }

    fn modulated_wave_on(&mut self, _frequency_hz: u64, _power_dbm: i32, _modulation: LoraModulation) -> DeviceResult<()> {
        self.record("modulated_on")
    }

    fn modulated_wave_off(&mut self) -> DeviceResult<()> {
        self.record("modulated_off")
    }

    fn modem_on(&mut self) -> DeviceResult<()> {
        self.record("modem_on")
    }

    fn modem_off(&mut self) -> DeviceResult<()> {
        self.record("modem_off")
    }

    fn abort(&mut self) -> DeviceResult<()> {
        self.record("abort")
    }

    fn set_transmit_power(&mut self, power: TxPowerConst) -> DeviceResult<()> {
        self.record("set_power")?;
        self.script.lock().unwrap().tx_power = Some(power);
        Ok(())
    }

    fn get_transmit_power(&mut self) -> DeviceResult<Option<TxPowerConst>> {
        self.record("get_power")?;
        Ok(self.script.lock().unwrap().tx_power)
    }

    fn save_settings_and_reset(&mut self) -> DeviceResult<()> {
        self.record("save_reset")
    }

    fn start_tone(&mut self, _tone: ToneRequest) -> DeviceResult<bool> {
        self.record("start_tone")?;
        Ok(!self.script.lock().unwrap().tone_rejected)
    }
}

/// Configuration pointing at `simulator` with all waits shortened.
pub(crate) fn fast_config(simulator: &AnalyzerSimulator) -> TestConfig {
    let retries = Retries {
        attempts: 3,
        backoff_seconds: 0.01,
        backoff_growth: 1.0,
    };
    let procedure = ProcedureConfig {
        settle: Settle {
            after_center_seconds: Some(0.0),
            after_arm_seconds: Some(0.0),
        },
        zooms: vec![
            ZoomEntry {
                span_hz: Some(2e6),
                rbw_hz: Some(3e4),
                vbw_hz: Some(1e5),
                delay_seconds: Some(0.0),
            },
            ZoomEntry {
                span_hz: Some(2e4),
                rbw_hz: Some(1e3),
                vbw_hz: Some(3e3),
                delay_seconds: Some(0.0),
            },
        ],
        retries: Some(retries),
        reconnect: Some(retries),
        reset_wait_seconds: Some(0.0),
        obw: ObwConfig {
            accumulate_seconds: Some(0.05),
            percentage: None,
        },
        ..Default::default()
    };
    let protocol = ProtocolConfig {
        tx_power: procedure.clone(),
        frequency_accuracy: procedure.clone(),
        occupied_bandwidth: procedure,
    };
    TestConfig {
        analyzer: AnalyzerEndpoint {
            address: "127.0.0.1".to_string(),
            port: simulator.port(),
        },
        defaults: Defaults {
            default_delay_seconds: 0.0,
            timeouts: Timeouts {
                connect_analyzer_seconds: 2.0,
                analyzer_command_seconds: 2.0,
                device_command_seconds: 2.0,
                cleanup_seconds: 1.0,
            },
            ..Default::default()
        },
        lora: protocol.clone(),
        lte: protocol.clone(),
        ble: protocol,
        lte_earfcn_map: [(6300, 806_000_000)].into_iter().collect(),
        ..Default::default()
    }
}
