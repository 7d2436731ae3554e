// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Event emission and cancellation-aware calls of a single run.

use std::future::Future;
use std::time::Duration;

use rftest_log::diagnostic;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Retries;
use crate::device::{DeviceControlPort, DeviceHandle, DeviceResult};
use crate::error::{Error, Result};
use crate::event::{Measurement, StepKey, StepStatus, TestEvent};
use crate::request::RunTimeouts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Pending,
    Running,
    Armed,
    TearingDown,
    Finished,
    Cancelled,
}

/// One invocation of a test procedure. Never reused.
pub(crate) struct TestRun {
    pub run_id: Uuid,
    pub timeouts: RunTimeouts,
    state: RunState,
    events: Vec<TestEvent>,
    sender: mpsc::Sender<TestEvent>,
}

impl TestRun {
    pub(crate) fn new(run_id: Uuid, timeouts: RunTimeouts, sender: mpsc::Sender<TestEvent>) -> Self {
        TestRun {
            run_id,
            timeouts,
            state: RunState::Pending,
            events: Vec::new(),
            sender,
        }
    }

    pub(crate) fn state(&self) -> RunState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: RunState) {
        if self.state != state {
            diagnostic!("Run {}: {:?} -> {:?}", self.run_id, self.state, state);
            self.state = state;
        }
    }

    pub(crate) fn into_events(self) -> Vec<TestEvent> {
        self.events
    }

    /// Record and deliver an event. Fails with [`Error::Cancelled`] once the
    /// consumer is gone.
    pub(crate) async fn emit(&mut self, event: TestEvent) -> Result<()> {
        self.events.push(event.clone());
        self.sender.send(event).await.map_err(|_| Error::Cancelled)
    }

    pub(crate) async fn log(&mut self, message: impl Into<String>) -> Result<()> {
        self.emit(TestEvent::Log {
            message: message.into(),
        })
        .await
    }

    pub(crate) async fn step_start(&mut self, key: StepKey) -> Result<()> {
        self.emit(TestEvent::step(key, StepStatus::Start)).await
    }

    pub(crate) async fn step_done(&mut self, key: StepKey, message: Option<String>) -> Result<()> {
        self.emit(TestEvent::Step {
            key,
            status: StepStatus::Done,
            message,
            measurement: None,
            attempt: None,
            skipped: false,
        })
        .await
    }

    pub(crate) async fn step_measured(&mut self, key: StepKey, measurement: Measurement) -> Result<()> {
        self.emit(TestEvent::Step {
            key,
            status: StepStatus::Done,
            message: None,
            measurement: Some(measurement),
            attempt: None,
            skipped: false,
        })
        .await
    }

    pub(crate) async fn step_skipped(&mut self, key: StepKey, reason: &str) -> Result<()> {
        self.emit(TestEvent::Step {
            key,
            status: StepStatus::Done,
            message: Some(reason.to_string()),
            measurement: None,
            attempt: None,
            skipped: true,
        })
        .await
    }

    pub(crate) async fn step_error(&mut self, key: StepKey, error: &Error, attempt: Option<u32>) -> Result<()> {
        self.emit(TestEvent::Step {
            key,
            status: StepStatus::Error,
            message: Some(error.to_string()),
            measurement: None,
            attempt,
            skipped: false,
        })
        .await
    }

    /// Close a step with the outcome of its work.
    pub(crate) async fn conclude<T>(&mut self, key: StepKey, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.step_done(key, None).await?;
                Ok(value)
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                self.step_error(key, &e, None).await?;
                Err(e)
            }
        }
    }

    pub(crate) async fn conclude_measurement(
        &mut self,
        key: StepKey,
        result: Result<Measurement>,
    ) -> Result<Measurement> {
        match result {
            Ok(measurement) => {
                self.step_measured(key, measurement).await?;
                Ok(measurement)
            }
            Err(e) => self.conclude(key, Err(e)).await,
        }
    }

    /// Run `future` unless the consumer goes away first.
    pub(crate) async fn interruptible<T>(&self, future: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.sender.closed() => Err(Error::Cancelled),
            result = future => result,
        }
    }

    pub(crate) async fn sleep(&self, duration: Duration) -> Result<()> {
        self.interruptible(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    /// Analyzer exchange bounded by the command timeout.
    pub(crate) async fn analyzer<T>(
        &self,
        operation: &'static str,
        future: impl Future<Output = rftest_analyzer::Result<T>>,
    ) -> Result<T> {
        self.analyzer_within(operation, self.timeouts.analyzer_command, future)
            .await
    }

    pub(crate) async fn analyzer_within<T>(
        &self,
        operation: &'static str,
        limit: Duration,
        future: impl Future<Output = rftest_analyzer::Result<T>>,
    ) -> Result<T> {
        self.interruptible(async {
            match tokio::time::timeout(limit, future).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(Error::Timeout {
                    operation,
                    after: limit,
                }),
            }
        })
        .await
    }

    pub(crate) async fn device<T, F>(&self, device: &DeviceHandle, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn DeviceControlPort) -> DeviceResult<T> + Send + 'static,
    {
        self.interruptible(device.call(operation, self.timeouts.device_command, f))
            .await
    }

    /// A device step retried with backoff. Every failed attempt is reported.
    pub(crate) async fn device_with_retries<T, F>(
        &mut self,
        key: StepKey,
        device: &DeviceHandle,
        operation: &'static str,
        retries: Retries,
        f: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&mut dyn DeviceControlPort) -> DeviceResult<T> + Clone + Send + 'static,
    {
        self.step_start(key).await?;
        let attempts = retries.attempts();
        let mut attempt = 1;
        loop {
            match self.device(device, operation, f.clone()).await {
                Ok(value) => {
                    self.emit(TestEvent::Step {
                        key,
                        status: StepStatus::Done,
                        message: None,
                        measurement: None,
                        attempt: Some(attempt),
                        skipped: false,
                    })
                    .await?;
                    return Ok(value);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    self.step_error(key, &e, Some(attempt)).await?;
                    if attempt >= attempts {
                        return Err(e);
                    }
                    self.sleep(retries.delay(attempt)).await?;
                    attempt += 1;
                }
            }
        }
    }
}
