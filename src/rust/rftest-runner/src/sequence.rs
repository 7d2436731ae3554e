// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Step sequence of a validated run.
//!
//! ```text
//! ConnectAnalyzer -> ConfigureAnalyzer -> ConnectDut -> arm -> Measure
//!     -> disarm -> DisconnectDut -> Result -> Done
//! ```

use std::future::Future;
use std::sync::Arc;

use rftest_log::{diagnostic, info, warn};

use crate::arm::{self, ArmState};
use crate::cleanup;
use crate::context::{RunState, TestRun};
use crate::device::{DeviceConnector, DeviceHandle};
use crate::error::{Error, Result};
use crate::event::{Measurement, StepKey, TestEvent};
use crate::measure;
use crate::request::RunPlan;
use crate::runner::RunReport;
use crate::slot::{AnalyzerLease, AnalyzerSlot};
use crate::verdict::PassFailResult;

/// Everything a run holds that must be released when it ends.
#[derive(Default)]
pub(crate) struct Resources {
    pub lease: Option<AnalyzerLease>,
    pub device: Option<DeviceHandle>,
    pub arm: ArmState,
    /// The analyzer trace may still be in max-hold.
    pub trace_dirty: bool,
}

type Outcome = Result<(Measurement, PassFailResult)>;

pub(crate) async fn execute(
    mut run: TestRun,
    plan: RunPlan,
    slot: AnalyzerSlot,
    devices: Arc<dyn DeviceConnector>,
) -> Result<RunReport> {
    run.set_state(RunState::Running);
    let mut resources = Resources::default();
    let outcome = drive(&mut run, &plan, &slot, devices.as_ref(), &mut resources).await;
    if matches!(outcome, Err(Error::Cancelled)) {
        return Err(abandon(run, &plan, resources));
    }
    match wrap_up(&mut run, &plan, &mut resources, outcome).await {
        Ok((ok, measured)) => {
            run.set_state(RunState::Finished);
            info!(
                "Run {}: {} {} finished, ok: {}",
                run.run_id, plan.protocol, plan.procedure, ok
            );
            let (measurement, verdict) = measured.unzip();
            Ok(RunReport {
                run_id: run.run_id,
                ok,
                measurement,
                verdict,
                events: run.into_events(),
            })
        }
        Err(e) => Err(abandon_with(run, &plan, resources, e)),
    }
}

async fn drive(
    run: &mut TestRun,
    plan: &RunPlan,
    slot: &AnalyzerSlot,
    devices: &dyn DeviceConnector,
    resources: &mut Resources,
) -> Outcome {
    run.step_start(StepKey::ConnectAnalyzer).await?;
    let lease = run.interruptible(async { Ok(slot.acquire().await) }).await?;
    let lease = resources.lease.insert(lease);
    match connect_analyzer(run, plan, lease).await {
        Ok(identity) => run.step_done(StepKey::ConnectAnalyzer, Some(identity)).await?,
        Err(e) => return run.conclude(StepKey::ConnectAnalyzer, Err(e)).await,
    }

    run.step_start(StepKey::ConfigureAnalyzer).await?;
    let result = configure_analyzer(run, plan, lease).await;
    run.conclude(StepKey::ConfigureAnalyzer, result).await?;

    let device = match devices.open(plan.device_address.as_deref()) {
        Ok(port) => resources.device.insert(DeviceHandle::new(port)).clone(),
        Err(source) => {
            run.step_start(StepKey::ConnectDut).await?;
            let e = Error::Device {
                operation: "open",
                source,
            };
            return run.conclude(StepKey::ConnectDut, Err(e)).await;
        }
    };
    run.device_with_retries(StepKey::ConnectDut, &device, "connect", plan.connect_retries, |port| {
        port.connect()
    })
    .await?;
    resources.arm.dut_connected = true;

    arm::arm(run, plan, &device, &mut resources.arm).await?;
    info!("Run {}: transmitting {}", run.run_id, arm::describe(plan));

    measure::measure(run, plan, lease, &mut resources.trace_dirty).await
}

async fn connect_analyzer(run: &TestRun, plan: &RunPlan, lease: &mut AnalyzerLease) -> Result<String> {
    if lease
        .retarget(&plan.analyzer_address, plan.analyzer_port)
        .await
    {
        diagnostic!("Analyzer moved to {}", lease.config().target());
    }
    run.analyzer_within(
        "connect analyzer",
        run.timeouts.connect_analyzer,
        lease.ensure_connected(),
    )
    .await?;
    Ok(lease.identity().unwrap_or_default().to_string())
}

/// Center and span are required, the remaining settings are applied when
/// possible. The reference offset is always written so none lingers from
/// an earlier run.
async fn configure_analyzer(run: &mut TestRun, plan: &RunPlan, lease: &mut AnalyzerLease) -> Result<()> {
    let settings = &plan.analyzer;
    run.analyzer(
        "set center frequency",
        lease.set_center_frequency(plan.carrier_hz as f64),
    )
    .await?;
    if let Some(span) = settings.span_hz {
        run.analyzer("set span", lease.set_span(span)).await?;
    }
    if let Some(rbw) = settings.rbw_hz {
        best_effort(run, "set RBW", lease.set_rbw(rbw)).await?;
    }
    if let Some(vbw) = settings.vbw_hz {
        best_effort(run, "set VBW", lease.set_vbw(vbw)).await?;
    }
    if let Some(level) = settings.ref_level_dbm {
        best_effort(run, "set reference level", lease.set_ref_level(level)).await?;
    }
    best_effort(
        run,
        "set reference offset",
        lease.set_ref_level_offset(settings.ref_offset_db),
    )
    .await?;
    if settings.use_peak_detector {
        best_effort(run, "set peak detector", lease.set_peak_detector()).await?;
    }
    run.sleep(settings.settle).await
}

async fn best_effort(
    run: &mut TestRun,
    operation: &'static str,
    future: impl Future<Output = rftest_analyzer::Result<()>>,
) -> Result<()> {
    match run.analyzer(operation, future).await {
        Ok(()) => Ok(()),
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            warn!("Skipping analyzer setting: {}", e);
            run.log(format!("{operation} skipped: {e}")).await
        }
    }
}

/// Tear down and report. Only fails when the consumer goes away.
///
/// A failure before the device transmitted is reported before teardown,
/// a later one after the device has been disarmed.
async fn wrap_up(
    run: &mut TestRun,
    plan: &RunPlan,
    resources: &mut Resources,
    outcome: Outcome,
) -> Result<(bool, Option<(Measurement, PassFailResult)>)> {
    run.set_state(RunState::TearingDown);
    let armed = resources.arm.is_armed();
    if let Some(e) = outcome.as_ref().err().filter(|_| !armed) {
        warn!("Run {} failed: {}", run.run_id, e);
        run.emit(TestEvent::Error {
            message: e.to_string(),
        })
        .await?;
    }

    let disarm_failure = teardown(run, plan, resources).await?;

    match outcome {
        Ok((measurement, verdict)) => {
            run.emit(TestEvent::Result {
                measurement,
                verdict,
            })
            .await?;
            if let Some(e) = &disarm_failure {
                warn!("Run {}: device not disarmed: {}", run.run_id, e);
                run.emit(TestEvent::Error {
                    message: e.to_string(),
                })
                .await?;
            }
            let ok = disarm_failure.is_none();
            run.emit(TestEvent::Done { ok }).await?;
            Ok((ok, Some((measurement, verdict))))
        }
        Err(e) => {
            if armed {
                warn!("Run {} failed: {}", run.run_id, e);
                run.emit(TestEvent::Error {
                    message: e.to_string(),
                })
                .await?;
            }
            run.emit(TestEvent::Done { ok: false }).await?;
            Ok((false, None))
        }
    }
}

/// Disarm and disconnect the device, then hand the analyzer back.
///
/// Returns the first disarm failure. A failed disconnect is reported as a
/// step error only.
async fn teardown(run: &mut TestRun, plan: &RunPlan, resources: &mut Resources) -> Result<Option<Error>> {
    let mut failure = None;
    if let Some(device) = resources.device.clone() {
        failure = arm::disarm(run, plan.protocol, &device, &mut resources.arm).await?;
        if resources.arm.dut_connected {
            run.step_start(StepKey::DisconnectDut).await?;
            let result = run
                .device(&device, "disconnect", |port| port.disconnect())
                .await;
            if result.is_ok() {
                resources.arm.dut_connected = false;
            }
            if let Err(Error::Cancelled) = run.conclude(StepKey::DisconnectDut, result).await {
                return Err(Error::Cancelled);
            }
        }
        resources.device = None;
    }
    if let Some(mut lease) = resources.lease.take() {
        if resources.trace_dirty {
            let limit = run.timeouts.cleanup;
            resources.trace_dirty = !cleanup::restore_trace_mode(&mut lease, limit).await;
        }
        if resources.trace_dirty {
            // Leave a fresh connection to whoever uses the analyzer next.
            lease.disconnect().await;
        }
    }
    Ok(failure)
}

fn abandon(run: TestRun, plan: &RunPlan, resources: Resources) -> Error {
    abandon_with(run, plan, resources, Error::Cancelled)
}

fn abandon_with(mut run: TestRun, plan: &RunPlan, resources: Resources, error: Error) -> Error {
    info!(
        "Run {}: consumer went away while {:?}, cleaning up in the background",
        run.run_id,
        run.state()
    );
    run.set_state(RunState::Cancelled);
    drop(cleanup::spawn(
        run.run_id,
        plan.protocol,
        resources,
        run.timeouts.cleanup,
    ));
    error
}
