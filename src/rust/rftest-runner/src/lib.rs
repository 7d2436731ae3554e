// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! RF production test procedures.
//!
//! A [`TestRunner`] executes one [`TestRequest`] per run against the shared
//! spectrum analyzer and a device under test. Progress is streamed as
//! [`TestEvent`]s; dropping the event receiver cancels the run and leaves
//! the cleanup to a background task.

mod arm;
mod cleanup;
pub mod config;
mod context;
pub mod device;
pub mod error;
pub mod event;
mod measure;
pub mod request;
mod runner;
mod sequence;
mod slot;
pub mod verdict;

#[cfg(test)]
mod testing;

pub use config::{ConfigProvider, StaticConfig, TestConfig};
pub use device::{DeviceConnector, DeviceControlPort, DeviceError};
pub use error::{Error, Result};
pub use event::{Measurement, StepKey, StepStatus, TestEvent};
pub use request::{Procedure, Protocol, RunParameters, TestRequest};
pub use runner::{RunHandle, RunReport, TestRunner};
pub use slot::{AnalyzerLease, AnalyzerSlot};
pub use verdict::{FrequencyError, PassFailResult};
