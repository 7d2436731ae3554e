// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Best-effort cleanup after the consumer abandoned a run.
//!
//! Runs detached from the abandoned run. Every call is bounded by the
//! cleanup timeout and failures are only logged.

use std::time::Duration;

use rftest_analyzer::TraceMode;
use rftest_log::{info, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::arm::ArmState;
use crate::device::{DeviceControlPort, DeviceHandle, DeviceResult};
use crate::request::Protocol;
use crate::sequence::Resources;
use crate::slot::AnalyzerLease;

pub(crate) fn spawn(run_id: Uuid, protocol: Protocol, resources: Resources, limit: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Resources {
            lease,
            device,
            arm,
            trace_dirty,
        } = resources;
        let device_part = async {
            if let Some(device) = device {
                release_device(&device, protocol, arm, limit).await;
            }
        };
        let analyzer_part = async {
            if let Some(lease) = lease {
                release_analyzer(lease, trace_dirty, limit).await;
            }
        };
        tokio::join!(device_part, analyzer_part);
        info!("Run {}: background cleanup finished", run_id);
    })
}

async fn release_device(device: &DeviceHandle, protocol: Protocol, arm: ArmState, limit: Duration) {
    match protocol {
        Protocol::Lora if arm.carrier_on => {
            let modulated = arm.modulated;
            attempt(device, "carrier off", limit, move |port| {
                if modulated {
                    port.modulated_wave_off()
                } else {
                    port.continuous_wave_off()
                }
            })
            .await;
        }
        Protocol::Lte if arm.modem_on => {
            attempt(device, "abort", limit, |port| port.abort()).await;
            attempt(device, "modem off", limit, |port| port.modem_off()).await;
        }
        _ => {}
    }
    if arm.dut_connected {
        attempt(device, "disconnect", limit, |port| port.disconnect()).await;
    }
}

async fn attempt<F>(device: &DeviceHandle, operation: &'static str, limit: Duration, f: F)
where
    F: FnOnce(&mut dyn DeviceControlPort) -> DeviceResult<()> + Send + 'static,
{
    if let Err(e) = device.call(operation, limit, f).await {
        warn!("Cleanup: {}", e);
    }
}

async fn release_analyzer(mut lease: AnalyzerLease, trace_dirty: bool, limit: Duration) {
    if trace_dirty {
        restore_trace_mode(&mut lease, limit).await;
    }
    lease.disconnect().await;
}

/// Put the analyzer trace back to clear-write, reconnecting if the session
/// was lost. Returns whether that worked.
pub(crate) async fn restore_trace_mode(lease: &mut AnalyzerLease, limit: Duration) -> bool {
    let restored = tokio::time::timeout(limit, async {
        lease.ensure_connected().await?;
        lease.set_trace_mode(TraceMode::ClearWrite).await
    })
    .await;
    match restored {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("Failed to restore analyzer trace mode: {}", e);
            false
        }
        Err(_) => {
            warn!("Restoring analyzer trace mode timed out after {:?}", limit);
            false
        }
    }
}
