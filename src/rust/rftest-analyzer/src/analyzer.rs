// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Spectrum analyzer operations built on the command registry.
//!
//! Setters wait for operation complete. Getters fall back to a long-form
//! SCPI query when the templated command is missing or its reply cannot be
//! parsed.

use std::time::Duration;

use rftest_log::{diagnostic, info, warn};

use crate::error::{Error, Result};
use crate::number::{FrequencyUnit, format_value, parse_number};
use crate::registry::names;
use crate::session::InstrumentSession;
use crate::trace::{TraceSample, occupied_bandwidth};

pub const DEFAULT_MARKER: &str = "MARK1";

/// Read timeout while transferring a full trace.
const TRACE_TRANSFER_TIMEOUT: Duration = Duration::from_secs(15);

mod fallback {
    pub const CENTER_FREQUENCY: &str = "SENS:FREQ:CENT?";
    pub const SPAN: &str = "SENS:FREQ:SPAN?";
    pub const RBW: &str = "SENS:BAND:RES?";
    pub const VBW: &str = "SENS:BAND:VID?";
    pub const REF_LEVEL: &str = "DISP:WIND:TRAC:Y:SCAL:RLEV?";
    pub const REF_LEVEL_OFFSET: &str = "DISP:WIND:TRAC:Y:SCAL:RLEV:OFFS?";
    pub const SWEEP_POINTS: &str = "SENS:SWE:POIN?";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    ClearWrite,
    MaxHold,
    MinHold,
    Average,
    View,
}

impl TraceMode {
    pub fn code(self) -> &'static str {
        match self {
            TraceMode::ClearWrite => "WRIT",
            TraceMode::MaxHold => "MAXH",
            TraceMode::MinHold => "MINH",
            TraceMode::Average => "AVER",
            TraceMode::View => "VIEW",
        }
    }
}

impl InstrumentSession {
    async fn set_frequency_setting(&mut self, name: &str, hz: f64) -> Result<()> {
        let value = format_value(hz);
        let command = self.command(name, &[("value", &value), ("units", FrequencyUnit::Hz.code())])?;
        self.send_and_confirm(&command).await
    }

    async fn set_level_setting(&mut self, name: &str, value: f64) -> Result<()> {
        let value = format_value(value);
        let command = self.command(name, &[("value", &value)])?;
        self.send_and_confirm(&command).await
    }

    async fn marker_command(&mut self, name: &str, marker: &str) -> Result<()> {
        let command = self.command(name, &[("mark_name", marker)])?;
        self.send_and_confirm(&command).await
    }

    async fn query_with_fallback(&mut self, name: &str, params: &[(&str, &str)], fallback: &str) -> Result<f64> {
        let primary = match self.command(name, params) {
            Ok(command) => self.query_number(&command).await,
            Err(e) => Err(e),
        };
        match primary {
            Err(e) if !e.is_transport() => {
                warn!("Query '{}' failed ({}), retrying with {}", name, e, fallback);
                self.query_number(fallback).await
            }
            other => other,
        }
    }

    pub async fn identify(&mut self) -> Result<String> {
        let command = self.command(names::IDENTIFY, &[])?;
        self.query(&command).await
    }

    /// Restore the instrument's power-on preset.
    pub async fn reset(&mut self) -> Result<()> {
        let command = self.command(names::RESET, &[])?;
        self.send_and_confirm(&command).await
    }

    pub async fn set_center_frequency(&mut self, hz: f64) -> Result<()> {
        self.set_frequency_setting(names::SET_CENTER_FREQUENCY, hz).await
    }

    pub async fn set_span(&mut self, hz: f64) -> Result<()> {
        self.set_frequency_setting(names::SET_SPAN, hz).await
    }

    pub async fn set_rbw(&mut self, hz: f64) -> Result<()> {
        self.set_frequency_setting(names::SET_RBW, hz).await
    }

    pub async fn set_vbw(&mut self, hz: f64) -> Result<()> {
        self.set_frequency_setting(names::SET_VBW, hz).await
    }

    pub async fn set_ref_level(&mut self, dbm: f64) -> Result<()> {
        self.set_level_setting(names::SET_REF_LEVEL, dbm).await
    }

    pub async fn set_ref_level_offset(&mut self, db: f64) -> Result<()> {
        self.set_level_setting(names::SET_REF_LEVEL_OFFSET, db).await
    }

    pub async fn set_peak_detector(&mut self) -> Result<()> {
        let command = self.command(names::SET_PEAK_DETECTOR, &[])?;
        self.send_and_confirm(&command).await
    }

    pub async fn peak_search(&mut self, marker: &str) -> Result<()> {
        self.marker_command(names::PEAK_SEARCH, marker).await
    }

    /// Move the center frequency to the marker position.
    pub async fn set_marker_to_center_frequency(&mut self, marker: &str) -> Result<()> {
        self.marker_command(names::MARKER_TO_CENTER, marker).await
    }

    pub async fn set_trace_mode(&mut self, mode: TraceMode) -> Result<()> {
        let command = self.command(names::SET_TRACE_MODE, &[("mode", mode.code())])?;
        self.send_and_confirm(&command).await
    }

    /// Store a screenshot under `name` on the instrument.
    pub async fn take_screenshot(&mut self, name: &str) -> Result<()> {
        let command = self.command(names::TAKE_SCREENSHOT, &[("name", name)])?;
        self.send_and_confirm(&command).await
    }

    pub async fn center_frequency(&mut self) -> Result<f64> {
        self.query_with_fallback(names::GET_CENTER_FREQUENCY, &[], fallback::CENTER_FREQUENCY)
            .await
    }

    pub async fn span(&mut self) -> Result<f64> {
        self.query_with_fallback(names::GET_SPAN, &[], fallback::SPAN).await
    }

    pub async fn rbw(&mut self) -> Result<f64> {
        self.query_with_fallback(names::GET_RBW, &[], fallback::RBW).await
    }

    pub async fn vbw(&mut self) -> Result<f64> {
        self.query_with_fallback(names::GET_VBW, &[], fallback::VBW).await
    }

    pub async fn ref_level(&mut self) -> Result<f64> {
        self.query_with_fallback(names::GET_REF_LEVEL, &[], fallback::REF_LEVEL).await
    }

    pub async fn ref_level_offset(&mut self) -> Result<f64> {
        self.query_with_fallback(names::GET_REF_LEVEL_OFFSET, &[], fallback::REF_LEVEL_OFFSET)
            .await
    }

    pub async fn marker_power(&mut self, marker: &str) -> Result<f64> {
        let fallback = format!("CALC:{marker}:Y?");
        self.query_with_fallback(names::GET_MARKER_POWER, &[("mark_name", marker)], &fallback)
            .await
    }

    pub async fn marker_frequency(&mut self, marker: &str) -> Result<f64> {
        let fallback = format!("CALC:{marker}:X?");
        self.query_with_fallback(names::GET_MARKER_FREQUENCY, &[("mark_name", marker)], &fallback)
            .await
    }

    pub async fn sweep_points(&mut self) -> Result<usize> {
        let points = self
            .query_with_fallback(names::GET_SWEEP_POINTS, &[], fallback::SWEEP_POINTS)
            .await?;
        if points < 2.0 || points.fract() != 0.0 {
            return Err(Error::Parse {
                reply: points.to_string(),
            });
        }
        Ok(points as usize)
    }

    /// Fetch the current display trace in dBm.
    pub async fn trace_data(&mut self) -> Result<Vec<f64>> {
        let command = self.command(names::GET_TRACE_DATA, &[])?;
        let reply = {
            let mut session = self.with_io_timeout(TRACE_TRANSFER_TIMEOUT);
            session.query(&command).await?
        };
        reply
            .split(',')
            .map(|value| {
                let value = value.trim();
                value.parse::<f64>().or_else(|_| parse_number(value))
            })
            .collect()
    }

    /// Capture a trace for occupied bandwidth analysis.
    ///
    /// Span and point count come from the instrument. A point count that
    /// cannot be read or disagrees with the transferred trace is replaced by
    /// the number of received values.
    pub async fn capture_trace(&mut self) -> Result<TraceSample> {
        let values = self.trace_data().await?;
        let span = self.span().await?;
        let points = match self.sweep_points().await {
            Ok(points) => Some(points),
            Err(e) if !e.is_transport() => {
                diagnostic!("Sweep point query failed ({}), using trace length", e);
                None
            }
            Err(e) => return Err(e),
        };
        Ok(TraceSample::new(values, span, points))
    }

    /// Occupied bandwidth from a max-hold accumulated trace.
    ///
    /// The trace is switched to max-hold for `accumulate`, captured and
    /// analyzed. Clear-write mode is restored afterwards whatever the
    /// outcome, as long as the session is still usable.
    pub async fn measure_obw_via_max_hold(&mut self, accumulate: Duration, percentage: f64) -> Result<f64> {
        let outcome = self.accumulate_and_analyze(accumulate, percentage).await;
        if self.is_connected() {
            if let Err(e) = self.set_trace_mode(TraceMode::ClearWrite).await {
                warn!("Failed to restore clear-write trace mode: {}", e);
            }
        }
        match &outcome {
            Ok(bandwidth) => {
                info!("Occupied bandwidth ({}%): {} Hz", percentage, bandwidth);
            }
            Err(e) => {
                warn!("Occupied bandwidth measurement failed: {}", e);
            }
        }
        outcome
    }

    async fn accumulate_and_analyze(&mut self, accumulate: Duration, percentage: f64) -> Result<f64> {
        self.set_trace_mode(TraceMode::MaxHold).await?;
        tokio::time::sleep(accumulate).await;
        let trace = self.capture_trace().await?;
        occupied_bandwidth(&trace, percentage)
    }
}
