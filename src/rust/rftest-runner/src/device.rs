// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Control port of the device under test.
//!
//! Ports are synchronous and bounded by the adapter; the runner drives them
//! from blocking worker threads under its own timeouts. Retries live in the
//! runner, not in the port.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device rejected the command: {0}")]
    Rejected(String),

    #[error("device is not connected")]
    Disconnected,

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("link error: {0}")]
    Io(String),

    #[error("device port lock poisoned")]
    Poisoned,
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Carrier the device transmits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CarrierTarget {
    FrequencyHz(u64),
    Earfcn(u32),
}

impl fmt::Display for CarrierTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CarrierTarget::FrequencyHz(hz) => write!(f, "{:.3} MHz", *hz as f64 / 1e6),
            CarrierTarget::Earfcn(earfcn) => write!(f, "EARFCN {earfcn}"),
        }
    }
}

/// LoRa modem settings for a modulated carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoraModulation {
    pub bandwidth: u32,
    pub datarate: u32,
}

/// Raw transmit power setting of a BLE device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TxPowerConst(pub u8);

impl FromStr for TxPowerConst {
    type Err = String;

    /// Accepts `0x1F`, `1F` (any hex letter means hex) or `31`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || format!("invalid power parameter {s:?}");
        let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u8::from_str_radix(hex, 16)
        } else if s.chars().any(|c| c.is_ascii_hexdigit() && !c.is_ascii_digit()) {
            u8::from_str_radix(s, 16)
        } else {
            s.parse::<u8>()
        };
        value.map(TxPowerConst).map_err(|_| invalid())
    }
}

impl fmt::Display for TxPowerConst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToneRequest {
    pub channel: u8,
    pub duration_ms: u32,
    pub offset_hz: i32,
}

/// Commands the runner needs from a device under test.
pub trait DeviceControlPort: Send {
    fn connect(&mut self) -> DeviceResult<()>;

    fn disconnect(&mut self) -> DeviceResult<()>;

    fn continuous_wave_on(&mut self, target: CarrierTarget, power_dbm: i32) -> DeviceResult<()>;

    fn continuous_wave_off(&mut self) -> DeviceResult<()>;

    fn modulated_wave_on(
        &mut self,
        _frequency_hz: u64,
        _power_dbm: i32,
        _modulation: LoraModulation,
    ) -> DeviceResult<()> {
        Err(DeviceError::Unsupported("modulated wave"))
    }

    fn modulated_wave_off(&mut self) -> DeviceResult<()> {
        self.continuous_wave_off()
    }

    fn modem_on(&mut self) -> DeviceResult<()>;

    fn modem_off(&mut self) -> DeviceResult<()>;

    fn abort(&mut self) -> DeviceResult<()>;

    fn set_transmit_power(&mut self, power: TxPowerConst) -> DeviceResult<()>;

    fn get_transmit_power(&mut self) -> DeviceResult<Option<TxPowerConst>>;

    /// Persist settings and reboot. The link drops as a consequence.
    fn save_settings_and_reset(&mut self) -> DeviceResult<()>;

    /// Returns whether the device accepted the tone.
    fn start_tone(&mut self, tone: ToneRequest) -> DeviceResult<bool>;
}

/// Creates ports for devices addressed by e.g. a MAC address or a serial
/// port name. Creating a port must not block; connecting happens through
/// [`DeviceControlPort::connect`].
pub trait DeviceConnector: Send + Sync {
    fn open(&self, address: Option<&str>) -> DeviceResult<Box<dyn DeviceControlPort>>;
}

/// Shared handle running port calls on the blocking thread pool.
#[derive(Clone)]
pub(crate) struct DeviceHandle {
    port: Arc<Mutex<Box<dyn DeviceControlPort>>>,
}

impl DeviceHandle {
    pub(crate) fn new(port: Box<dyn DeviceControlPort>) -> Self {
        DeviceHandle {
            port: Arc::new(Mutex::new(port)),
        }
    }

    /// Run `f` against the port, bounded by `limit`.
    ///
    /// On timeout the blocking call keeps running in the background and
    /// holds the port until it returns.
    pub(crate) async fn call<T, F>(&self, operation: &'static str, limit: Duration, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn DeviceControlPort) -> DeviceResult<T> + Send + 'static,
    {
        let port = Arc::clone(&self.port);
        let task = tokio::task::spawn_blocking(move || {
            let mut port = port.lock().map_err(|_| DeviceError::Poisoned)?;
            f(&mut **port)
        });
        match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result.map_err(|source| Error::Device { operation, source }),
            Ok(Err(join)) => Err(Error::Device {
                operation,
                source: DeviceError::Io(join.to_string()),
            }),
            Err(_) => Err(Error::Timeout {
                operation,
                after: limit,
            }),
        }
    }
}
