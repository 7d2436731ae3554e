// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Bringing the device under test to transmit, and back.

use rftest_log::{info, warn};

use crate::context::{RunState, TestRun};
use crate::device::{CarrierTarget, DeviceError, DeviceHandle, TxPowerConst};
use crate::error::{Error, Result};
use crate::event::StepKey;
use crate::request::{Protocol, RunPlan};

/// What has been switched on at the device so far.
///
/// Carrier flags are raised before the call whose effect they track, so a
/// timed out call is still undone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ArmState {
    pub dut_connected: bool,
    pub modem_on: bool,
    pub carrier_on: bool,
    pub modulated: bool,
    pub tone_started: bool,
}

impl ArmState {
    pub(crate) fn is_armed(&self) -> bool {
        self.modem_on || self.carrier_on || self.tone_started
    }
}

pub(crate) async fn arm(run: &mut TestRun, plan: &RunPlan, device: &DeviceHandle, state: &mut ArmState) -> Result<()> {
    match plan.protocol {
        Protocol::Lora => arm_lora(run, plan, device, state).await?,
        Protocol::Lte => arm_lte(run, plan, device, state).await?,
        Protocol::Ble => arm_ble(run, plan, device, state).await?,
    }
    run.set_state(RunState::Armed);
    run.sleep(plan.arm_settle).await
}

async fn arm_lora(run: &mut TestRun, plan: &RunPlan, device: &DeviceHandle, state: &mut ArmState) -> Result<()> {
    run.step_start(StepKey::CwOn).await?;
    state.carrier_on = true;
    let (frequency_hz, power_dbm) = (plan.carrier_hz, plan.power_dbm);
    let result = match plan.modulation {
        Some(modulation) => {
            state.modulated = true;
            run.device(device, "modulated wave on", move |port| {
                port.modulated_wave_on(frequency_hz, power_dbm, modulation)
            })
            .await
        }
        None => {
            let target = plan.target;
            run.device(device, "carrier on", move |port| {
                port.continuous_wave_on(target, power_dbm)
            })
            .await
        }
    };
    run.conclude(StepKey::CwOn, result).await
}

async fn arm_lte(run: &mut TestRun, plan: &RunPlan, device: &DeviceHandle, state: &mut ArmState) -> Result<()> {
    run.device_with_retries(StepKey::ModemOn, device, "modem on", plan.connect_retries, |port| {
        port.modem_on()
    })
    .await?;
    state.modem_on = true;

    run.step_start(StepKey::Abort).await?;
    let result = run.device(device, "abort", |port| port.abort()).await;
    run.conclude(StepKey::Abort, result).await?;

    run.step_start(StepKey::CwOn).await?;
    state.carrier_on = true;
    let (target, power_dbm) = (plan.target, plan.power_dbm);
    let result = run
        .device(device, "carrier on", move |port| port.continuous_wave_on(target, power_dbm))
        .await;
    run.conclude(StepKey::CwOn, result).await
}

async fn arm_ble(run: &mut TestRun, plan: &RunPlan, device: &DeviceHandle, state: &mut ArmState) -> Result<()> {
    if let Some(requested) = plan.ble_power {
        apply_ble_power(run, plan, device, state, requested).await?;
    }

    let tone = plan
        .tone
        .ok_or_else(|| Error::validation("no tone parameters"))?;
    run.step_start(StepKey::ToneStart).await?;
    let result = run
        .device(device, "start tone", move |port| port.start_tone(tone))
        .await
        .and_then(|accepted| {
            if accepted {
                Ok(())
            } else {
                Err(Error::Device {
                    operation: "start tone",
                    source: DeviceError::Rejected("tone not accepted".to_string()),
                })
            }
        });
    state.tone_started = result.is_ok();
    run.conclude(StepKey::ToneStart, result).await
}

/// Set the BLE transmit power unless it already has the requested value.
///
/// A new power only takes effect after saving and resetting, which drops
/// the link.
async fn apply_ble_power(
    run: &mut TestRun,
    plan: &RunPlan,
    device: &DeviceHandle,
    state: &mut ArmState,
    requested: TxPowerConst,
) -> Result<()> {
    let current = match run.device(device, "read power", |port| port.get_transmit_power()).await {
        Ok(current) => current,
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => {
            warn!("Could not read transmit power: {}", e);
            run.log(format!("Could not read transmit power: {e}")).await?;
            None
        }
    };
    if current == Some(requested) {
        info!("Transmit power already {}, skipping reset", requested);
        let reason = format!("transmit power already {requested}");
        for key in [StepKey::SetPower, StepKey::SaveReset, StepKey::ReconnectDut] {
            run.step_skipped(key, &reason).await?;
        }
        return Ok(());
    }

    run.step_start(StepKey::SetPower).await?;
    let result = run
        .device(device, "set power", move |port| port.set_transmit_power(requested))
        .await;
    run.conclude(StepKey::SetPower, result).await?;

    run.step_start(StepKey::SaveReset).await?;
    let result = run
        .device(device, "save and reset", |port| port.save_settings_and_reset())
        .await;
    state.dut_connected = false;
    run.conclude(StepKey::SaveReset, result).await?;

    run.sleep(plan.reset_wait).await?;
    run.device_with_retries(
        StepKey::ReconnectDut,
        device,
        "reconnect",
        plan.reconnect_retries,
        |port| port.connect(),
    )
    .await?;
    state.dut_connected = true;
    Ok(())
}

/// Undo what [`arm`] switched on, reporting every step.
///
/// Keeps going after a failed step and returns the first failure.
pub(crate) async fn disarm(
    run: &mut TestRun,
    protocol: Protocol,
    device: &DeviceHandle,
    state: &mut ArmState,
) -> Result<Option<Error>> {
    let mut failure = None;
    match protocol {
        Protocol::Lora if state.carrier_on => {
            run.step_start(StepKey::CwOff).await?;
            let modulated = state.modulated;
            let result = run
                .device(device, "carrier off", move |port| {
                    if modulated {
                        port.modulated_wave_off()
                    } else {
                        port.continuous_wave_off()
                    }
                })
                .await;
            if result.is_ok() {
                state.carrier_on = false;
            }
            keep_first(run.conclude(StepKey::CwOff, result).await, &mut failure)?;
        }
        Protocol::Lte if state.modem_on => {
            run.step_start(StepKey::Abort).await?;
            let result = run.device(device, "abort", |port| port.abort()).await;
            if result.is_ok() {
                state.carrier_on = false;
            }
            keep_first(run.conclude(StepKey::Abort, result).await, &mut failure)?;

            run.step_start(StepKey::ModemOff).await?;
            let result = run.device(device, "modem off", |port| port.modem_off()).await;
            if result.is_ok() {
                state.modem_on = false;
            }
            keep_first(run.conclude(StepKey::ModemOff, result).await, &mut failure)?;
        }
        // The tone stops by itself.
        Protocol::Ble => state.tone_started = false,
        _ => {}
    }
    Ok(failure)
}

/// Remember the first failure. Only cancellation stops the caller.
pub(crate) fn keep_first(result: Result<()>, failure: &mut Option<Error>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            failure.get_or_insert(e);
            Ok(())
        }
    }
}

/// Carrier description for log messages.
pub(crate) fn describe(plan: &RunPlan) -> String {
    match plan.target {
        CarrierTarget::FrequencyHz(_) => format!("{} at {} dBm", plan.target, plan.power_dbm),
        CarrierTarget::Earfcn(_) => format!(
            "{} ({:.3} MHz) at {} dBm",
            plan.target,
            plan.carrier_hz as f64 / 1e6,
            plan.power_dbm
        ),
    }
}
