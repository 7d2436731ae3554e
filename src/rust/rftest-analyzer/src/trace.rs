// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Occupied bandwidth of a sampled power trace.

use crate::error::{Error, Result};

pub const DEFAULT_OBW_PERCENTAGE: f64 = 99.0;

/// Results wider than the span by more than this factor point to a broken
/// capture.
const SPAN_TOLERANCE: f64 = 1.05;

/// One sweep of the analyzer display trace.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceSample {
    pub values_dbm: Vec<f64>,
    pub span_hz: f64,
    pub point_count: usize,
}

impl TraceSample {
    /// Create a sample, falling back to the number of received values when
    /// the reported point count disagrees with it.
    pub fn new(values_dbm: Vec<f64>, span_hz: f64, reported_points: Option<usize>) -> Self {
        let point_count = match reported_points {
            Some(points) if points == values_dbm.len() => points,
            _ => values_dbm.len(),
        };
        TraceSample {
            values_dbm,
            span_hz,
            point_count,
        }
    }

    pub fn bin_width_hz(&self) -> f64 {
        self.span_hz / (self.point_count as f64 - 1.0)
    }
}

fn dbm_to_linear(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// Bandwidth in Hz containing `percentage` of the total trace power.
///
/// The window starts at the strongest sample and grows one sample at a time
/// toward the stronger neighbour until the accumulated power reaches the
/// target.
///
/// Every sample in the window counts as one bin of `span / (points - 1)`, so
/// a window of `n` samples is `n * span / (points - 1)` wide. A flat trace
/// therefore reads exactly the span when `points - 1` samples are needed (99 %
/// of 101 points), and `points / (points - 1)` times the span at 100 %. The
/// latter exceeds the sanity bound for traces of 20 points or fewer.
pub fn occupied_bandwidth(trace: &TraceSample, percentage: f64) -> Result<f64> {
    if trace.point_count < 2 || trace.values_dbm.len() < 2 {
        return Err(Error::InvalidTrace(format!(
            "need at least 2 points, got {}",
            trace.values_dbm.len()
        )));
    }
    if percentage.is_nan() || percentage <= 0.0 || percentage > 100.0 {
        return Err(Error::InvalidTrace(format!(
            "percentage {percentage} outside (0, 100]"
        )));
    }
    if !trace.span_hz.is_finite() || trace.span_hz <= 0.0 {
        return Err(Error::InvalidTrace(format!("span {} Hz", trace.span_hz)));
    }
    let power: Vec<f64> = trace.values_dbm.iter().copied().map(dbm_to_linear).collect();
    if power.iter().any(|p| !p.is_finite()) {
        return Err(Error::InvalidTrace("non-finite sample".to_string()));
    }

    let total: f64 = power.iter().sum();
    let target = total * percentage / 100.0;
    let peak = power
        .iter()
        .enumerate()
        .fold(0, |best, (i, p)| if *p > power[best] { i } else { best });

    let last = power.len() - 1;
    let (mut left, mut right) = (peak, peak);
    let mut accumulated = power[peak];
    while accumulated < target && (left > 0 || right < last) {
        let left_power = if left > 0 { power[left - 1] } else { f64::NEG_INFINITY };
        let right_power = if right < last { power[right + 1] } else { f64::NEG_INFINITY };
        if left_power > right_power {
            left -= 1;
            accumulated += left_power;
        } else {
            right += 1;
            accumulated += right_power;
        }
    }

    let width = (right - left + 1) as f64;
    let bandwidth = width * trace.bin_width_hz();
    if bandwidth <= 0.0 || bandwidth > trace.span_hz * SPAN_TOLERANCE {
        return Err(Error::InvalidTrace(format!(
            "occupied bandwidth {bandwidth} Hz outside (0, {}] Hz",
            trace.span_hz * SPAN_TOLERANCE
        )));
    }
    Ok(bandwidth)
}
