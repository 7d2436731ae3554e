// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Driver for a networked spectrum analyzer speaking line-oriented SCPI.

mod analyzer;
pub mod error;
mod number;
pub mod registry;
mod session;
#[cfg(any(test, feature = "simulator"))]
pub mod simulator;
pub mod trace;

pub use analyzer::{DEFAULT_MARKER, TraceMode};
pub use error::{Error, Result};
pub use number::{FrequencyUnit, parse_number};
pub use registry::{CommandRegistry, CommandTemplate};
pub use session::{DEFAULT_ADDRESS, DEFAULT_PORT, InstrumentSession, IoTimeoutGuard, SessionConfig};
pub use trace::{DEFAULT_OBW_PERCENTAGE, TraceSample, occupied_bandwidth};
