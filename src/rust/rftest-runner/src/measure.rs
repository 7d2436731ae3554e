// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use rftest_log::{diagnostic, warn};

use crate::config::ZoomPass;
use crate::context::TestRun;
use crate::error::{Error, Result};
use crate::event::{Measurement, StepKey, StepStatus, TestEvent};
use crate::request::{Procedure, RunPlan};
use crate::slot::AnalyzerLease;
use crate::verdict::{FrequencyError, PassFailResult};

/// Take the measurement of the planned procedure and judge it.
///
/// `trace_dirty` is raised while the analyzer trace may be left in max-hold.
pub(crate) async fn measure(
    run: &mut TestRun,
    plan: &RunPlan,
    lease: &mut AnalyzerLease,
    trace_dirty: &mut bool,
) -> Result<(Measurement, PassFailResult)> {
    match plan.procedure {
        Procedure::TxPower => {
            run.step_start(StepKey::Measure).await?;
            let result = read_power(run, plan, lease).await;
            let measurement = run.conclude_measurement(StepKey::Measure, result).await?;
            let verdict = PassFailResult::within_bounds(
                measurement.value(),
                plan.limits.min_dbm,
                plan.limits.max_dbm,
            );
            Ok((measurement, verdict))
        }
        Procedure::FrequencyAccuracy => {
            let passes = plan.zooms.len();
            for (index, pass) in plan.zooms.iter().enumerate() {
                run.emit(TestEvent::Step {
                    key: StepKey::Zoom,
                    status: StepStatus::Start,
                    message: Some(format!(
                        "pass {}/{}: span {} Hz, RBW {} Hz, VBW {} Hz",
                        index + 1,
                        passes,
                        pass.span_hz,
                        pass.rbw_hz,
                        pass.vbw_hz
                    )),
                    measurement: None,
                    attempt: None,
                    skipped: false,
                })
                .await?;
                let result = zoom(run, plan, lease, pass).await;
                let centered = run.conclude(StepKey::Zoom, result).await?;
                if !centered {
                    run.log(format!("Marker to center failed on zoom pass {}", index + 1))
                        .await?;
                }
            }
            run.step_start(StepKey::Measure).await?;
            let result = read_frequency(run, plan, lease).await;
            let measurement = run.conclude_measurement(StepKey::Measure, result).await?;
            let verdict = PassFailResult::within_ppm(measurement.value(), plan.limits.ppm_limit);
            Ok((measurement, verdict))
        }
        Procedure::OccupiedBandwidth => {
            run.step_start(StepKey::Measure).await?;
            *trace_dirty = true;
            let limit = plan
                .obw_accumulate
                .saturating_add(run.timeouts.analyzer_command);
            let result = run
                .analyzer_within(
                    "occupied bandwidth",
                    limit,
                    lease.measure_obw_via_max_hold(plan.obw_accumulate, plan.obw_percentage),
                )
                .await;
            // An interrupted measurement never restored the trace mode.
            *trace_dirty = match &result {
                Ok(_) => false,
                Err(Error::Timeout { .. } | Error::Cancelled) => true,
                Err(_) => !lease.is_connected(),
            };
            let result = result.map(|measured_hz| Measurement::OccupiedBandwidth {
                measured_hz,
                percentage: plan.obw_percentage,
            });
            let measurement = run.conclude_measurement(StepKey::Measure, result).await?;
            Ok((measurement, PassFailResult::undecided(measurement.value())))
        }
    }
}

async fn read_power(run: &TestRun, plan: &RunPlan, lease: &mut AnalyzerLease) -> Result<Measurement> {
    run.analyzer("peak search", lease.peak_search(&plan.marker))
        .await?;
    run.sleep(plan.delay).await?;
    let measured_dbm = run
        .analyzer("marker power", lease.marker_power(&plan.marker))
        .await?;
    Ok(Measurement::TxPower { measured_dbm })
}

/// Narrow the analyzer on the carrier. Returns whether the marker could be
/// moved to the center.
async fn zoom(run: &TestRun, plan: &RunPlan, lease: &mut AnalyzerLease, pass: &ZoomPass) -> Result<bool> {
    run.analyzer("set span", lease.set_span(pass.span_hz)).await?;
    run.analyzer("set RBW", lease.set_rbw(pass.rbw_hz)).await?;
    run.analyzer("set VBW", lease.set_vbw(pass.vbw_hz)).await?;
    run.sleep(pass.settle).await?;
    run.analyzer("peak search", lease.peak_search(&plan.marker))
        .await?;
    let centered = match run
        .analyzer(
            "marker to center",
            lease.set_marker_to_center_frequency(&plan.marker),
        )
        .await
    {
        Ok(()) => true,
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => {
            warn!("Marker to center failed: {}", e);
            false
        }
    };
    run.sleep(plan.delay).await?;
    Ok(centered)
}

/// The marker settles on the carrier during the first reading, the second
/// one is used.
async fn read_frequency(run: &TestRun, plan: &RunPlan, lease: &mut AnalyzerLease) -> Result<Measurement> {
    let first = run
        .analyzer("marker frequency", lease.marker_frequency(&plan.marker))
        .await?;
    run.sleep(plan.delay).await?;
    let measured_hz = run
        .analyzer("marker frequency", lease.marker_frequency(&plan.marker))
        .await?;
    diagnostic!("Marker frequency readings: {} Hz, {} Hz", first, measured_hz);
    Ok(FrequencyError::new(plan.carrier_hz as f64, measured_hz).into())
}
