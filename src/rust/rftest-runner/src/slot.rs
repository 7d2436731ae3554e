// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Exclusive access to the shared analyzer.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use rftest_analyzer::{CommandRegistry, InstrumentSession, SessionConfig};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// The one analyzer session of the process. Runs queue on it.
#[derive(Clone)]
pub struct AnalyzerSlot {
    session: Arc<Mutex<InstrumentSession>>,
    registry: Arc<CommandRegistry>,
}

impl AnalyzerSlot {
    pub fn new(config: SessionConfig, registry: Arc<CommandRegistry>) -> Self {
        let session = InstrumentSession::new(config, Arc::clone(&registry));
        AnalyzerSlot {
            session: Arc::new(Mutex::new(session)),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Wait until no other run holds the analyzer.
    pub async fn acquire(&self) -> AnalyzerLease {
        AnalyzerLease {
            guard: Arc::clone(&self.session).lock_owned().await,
        }
    }

    pub fn try_acquire(&self) -> Option<AnalyzerLease> {
        Arc::clone(&self.session)
            .try_lock_owned()
            .ok()
            .map(|guard| AnalyzerLease { guard })
    }
}

/// Exclusive use of the analyzer session until dropped.
pub struct AnalyzerLease {
    guard: OwnedMutexGuard<InstrumentSession>,
}

impl AnalyzerLease {
    /// Connect unless the session is already usable.
    pub async fn ensure_connected(&mut self) -> rftest_analyzer::Result<()> {
        if self.guard.is_connected() {
            return Ok(());
        }
        self.guard.connect().await
    }
}

impl Deref for AnalyzerLease {
    type Target = InstrumentSession;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for AnalyzerLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
