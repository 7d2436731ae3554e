// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use rftest_log::{info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{ConfigProvider, TestConfig};
use crate::context::{RunState, TestRun};
use crate::device::DeviceConnector;
use crate::error::{Error, Result};
use crate::event::{Measurement, TestEvent};
use crate::request::{RunPlan, RunTimeouts, TestRequest};
use crate::sequence;
use crate::slot::AnalyzerSlot;
use crate::verdict::PassFailResult;

const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Final state of a run that was observed to the end.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub ok: bool,
    pub measurement: Option<Measurement>,
    pub verdict: Option<PassFailResult>,
    /// Every event emitted, in order.
    pub events: Vec<TestEvent>,
}

/// Starts test runs against the shared analyzer.
pub struct TestRunner {
    analyzer: AnalyzerSlot,
    devices: Arc<dyn DeviceConnector>,
    config: Arc<dyn ConfigProvider>,
    event_capacity: usize,
}

impl TestRunner {
    pub fn new(analyzer: AnalyzerSlot, devices: Arc<dyn DeviceConnector>, config: Arc<dyn ConfigProvider>) -> Self {
        TestRunner {
            analyzer,
            devices,
            config,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Number of events buffered before a run waits for its consumer.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn analyzer(&self) -> &AnalyzerSlot {
        &self.analyzer
    }

    /// Start a run in the background. Must be called within a Tokio runtime.
    ///
    /// Dropping the event receiver of the returned handle cancels the run.
    pub fn start(&self, request: TestRequest) -> RunHandle {
        let run_id = Uuid::new_v4();
        let (sender, events) = mpsc::channel(self.event_capacity);
        let task = tokio::spawn(run_test(
            run_id,
            request,
            self.config.snapshot(),
            self.analyzer.clone(),
            Arc::clone(&self.devices),
            sender,
        ));
        RunHandle {
            run_id,
            events,
            task,
        }
    }

    /// Run without observing events as they happen.
    pub async fn run_to_completion(&self, request: TestRequest) -> Result<RunReport> {
        self.start(request).collect().await
    }
}

async fn run_test(
    run_id: Uuid,
    request: TestRequest,
    config: Arc<TestConfig>,
    slot: AnalyzerSlot,
    devices: Arc<dyn DeviceConnector>,
    sender: mpsc::Sender<TestEvent>,
) -> Result<RunReport> {
    let mut run = TestRun::new(run_id, RunTimeouts::from(&config.defaults.timeouts), sender);
    info!(
        "Run {}: {} {} requested",
        run_id, request.protocol, request.procedure
    );
    run.emit(TestEvent::Start {
        run_id,
        protocol: request.protocol,
        procedure: request.procedure,
        params: request.parameters.clone(),
    })
    .await?;

    match RunPlan::resolve(&request, &config, slot.registry()) {
        Ok(plan) => sequence::execute(run, plan, slot, devices).await,
        Err(e) => {
            warn!("Run {} rejected: {}", run_id, e);
            run.emit(TestEvent::Error {
                message: e.to_string(),
            })
            .await?;
            run.emit(TestEvent::Done { ok: false }).await?;
            run.set_state(RunState::Finished);
            Ok(RunReport {
                run_id,
                ok: false,
                measurement: None,
                verdict: None,
                events: run.into_events(),
            })
        }
    }
}

/// A started run.
pub struct RunHandle {
    run_id: Uuid,
    events: mpsc::Receiver<TestEvent>,
    task: JoinHandle<Result<RunReport>>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Next event, `None` after [`TestEvent::Done`] or once the run stopped.
    pub async fn next_event(&mut self) -> Option<TestEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (mpsc::Receiver<TestEvent>, JoinHandle<Result<RunReport>>) {
        (self.events, self.task)
    }

    /// Withdraw from the run and wait until it stopped its foreground work.
    ///
    /// Cleanup of the device and the analyzer continues in the background.
    pub async fn cancel(self) -> Result<()> {
        let (events, task) = self.into_parts();
        drop(events);
        match task.await {
            Ok(Ok(_) | Err(Error::Cancelled)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Error::new(e)),
        }
    }

    /// Drain the events and return the report.
    pub async fn collect(self) -> Result<RunReport> {
        let (mut events, task) = self.into_parts();
        while events.recv().await.is_some() {}
        task.await.map_err(Error::new)?
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use rftest_analyzer::simulator::{AnalyzerSimulator, SimulatorState};
    use rftest_analyzer::registry::names;
    use rftest_analyzer::{CommandRegistry, SessionConfig};

    use super::*;
    use crate::config::StaticConfig;
    use crate::device::TxPowerConst;
    use crate::event::StepKey::{self, *};
    use crate::event::StepStatus::{self, Done as Finished, Error as Failed, Start as Started};
    use crate::request::{Procedure, Protocol, RunParameters};
    use crate::testing::{RecordingConnector, Script, fast_config};

    struct Bench {
        simulator: AnalyzerSimulator,
        connector: RecordingConnector,
        runner: TestRunner,
    }

    async fn bench(state: SimulatorState, script: Script) -> Bench {
        bench_with(state, script, |_| {}).await
    }

    async fn bench_with(state: SimulatorState, script: Script, adjust: impl FnOnce(&mut TestConfig)) -> Bench {
        bench_on(CommandRegistry::builtin().unwrap(), state, script, adjust).await
    }

    async fn bench_on(
        registry: CommandRegistry,
        state: SimulatorState,
        script: Script,
        adjust: impl FnOnce(&mut TestConfig),
    ) -> Bench {
        let simulator = AnalyzerSimulator::start(state).await.unwrap();
        let connector = RecordingConnector::new(script);
        let mut config = fast_config(&simulator);
        adjust(&mut config);
        let slot = AnalyzerSlot::new(SessionConfig::default(), Arc::new(registry));
        let runner = TestRunner::new(
            slot,
            Arc::new(connector.clone()),
            Arc::new(StaticConfig::new(config)),
        );
        Bench {
            simulator,
            connector,
            runner,
        }
    }

    fn steps(report: &RunReport) -> Vec<(StepKey, StepStatus)> {
        report.events.iter().filter_map(TestEvent::step_status).collect()
    }

    fn lora(procedure: Procedure, parameters: RunParameters) -> TestRequest {
        TestRequest::new(
            Protocol::Lora,
            procedure,
            RunParameters {
                frequency_hz: Some(918_000_000),
                power_dbm: Some(14),
                ..parameters
            },
        )
    }

    #[tokio::test]
    async fn test_lora_tx_power() {
        let bench = bench(
            SimulatorState {
                marker_power_dbm: 13.8,
                ..Default::default()
            },
            Script::default(),
        )
        .await;
        let report = bench
            .runner
            .run_to_completion(lora(
                Procedure::TxPower,
                RunParameters {
                    min_dbm: Some(12.0),
                    max_dbm: Some(15.0),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert!(report.ok);
        assert_eq!(report.measurement, Some(Measurement::TxPower { measured_dbm: 13.8 }));
        assert_eq!(report.verdict.unwrap().passed, Some(true));
        assert!(matches!(report.events[0], TestEvent::Start { .. }));
        assert_eq!(
            steps(&report),
            [
                (ConnectAnalyzer, Started),
                (ConnectAnalyzer, Finished),
                (ConfigureAnalyzer, Started),
                (ConfigureAnalyzer, Finished),
                (ConnectDut, Started),
                (ConnectDut, Finished),
                (CwOn, Started),
                (CwOn, Finished),
                (Measure, Started),
                (Measure, Finished),
                (CwOff, Started),
                (CwOff, Finished),
                (DisconnectDut, Started),
                (DisconnectDut, Finished),
            ]
        );
        let tail = &report.events[report.events.len() - 2..];
        assert!(matches!(tail[0], TestEvent::Result { .. }));
        assert_eq!(tail[1], TestEvent::Done { ok: true });
        assert_eq!(bench.connector.calls(), ["connect", "cw_on", "cw_off", "disconnect"]);

        let received = bench.simulator.received();
        assert!(received.contains(&"FREQ:CENT 918000000HZ".to_string()));
        assert!(received.contains(&"FREQ:SPAN 5000000HZ".to_string()));
        assert!(received.contains(&"DET POS".to_string()));
        assert!(received.contains(&"CALC:MARK1:MAX".to_string()));
    }

    #[tokio::test]
    async fn test_reference_offset_reset_each_run() {
        let bench = bench(
            SimulatorState {
                ref_level_offset_db: 20.0,
                ..Default::default()
            },
            Script::default(),
        )
        .await;
        let report = bench
            .runner
            .run_to_completion(lora(Procedure::TxPower, RunParameters::default()))
            .await
            .unwrap();
        assert!(report.ok);
        assert_eq!(bench.simulator.state().ref_level_offset_db, 0.0);
    }

    #[tokio::test]
    async fn test_reference_offset_from_procedure() {
        let bench = bench_with(SimulatorState::default(), Script::default(), |config| {
            config.lora.tx_power.analyzer_setup.ref_offset_db = Some(1.5);
        })
        .await;
        let report = bench
            .runner
            .run_to_completion(lora(Procedure::TxPower, RunParameters::default()))
            .await
            .unwrap();
        assert!(report.ok);
        assert_eq!(bench.simulator.state().ref_level_offset_db, 1.5);
    }

    #[tokio::test]
    async fn test_frequency_accuracy_with_zoom() {
        let bench = bench(
            SimulatorState {
                marker_frequency_hz: 918_009_180.0,
                ..Default::default()
            },
            Script::default(),
        )
        .await;
        let report = bench
            .runner
            .run_to_completion(lora(
                Procedure::FrequencyAccuracy,
                RunParameters {
                    ppm_limit: Some(15.0),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert!(report.ok);
        let Some(Measurement::FrequencyAccuracy {
            error_hz, error_ppm, ..
        }) = report.measurement
        else {
            panic!("unexpected measurement {:?}", report.measurement);
        };
        assert_eq!(error_hz, 9_180.0);
        assert!((error_ppm - 10.0).abs() < 1e-9);
        assert_eq!(report.verdict.unwrap().passed, Some(true));
        let zooms = steps(&report)
            .into_iter()
            .filter(|step| *step == (Zoom, Finished))
            .count();
        assert_eq!(zooms, 2);
        let state = bench.simulator.state();
        assert_eq!(state.span_hz, 2e4);
        assert_eq!(state.rbw_hz, 1e3);
        assert_eq!(state.center_hz, 918_009_180.0);
    }

    #[tokio::test]
    async fn test_occupied_bandwidth_restores_trace_mode() {
        let bench = bench(SimulatorState::default(), Script::default()).await;
        let report = bench
            .runner
            .run_to_completion(lora(
                Procedure::OccupiedBandwidth,
                RunParameters {
                    bandwidth: Some(0),
                    datarate: Some(7),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert!(report.ok);
        assert_eq!(
            report.measurement,
            Some(Measurement::OccupiedBandwidth {
                measured_hz: 500_000.0,
                percentage: 99.0
            })
        );
        assert_eq!(report.verdict.unwrap().passed, None);
        assert_eq!(bench.simulator.state().trace_mode, "WRIT");
        let received = bench.simulator.received();
        assert!(received.contains(&"DISP:TRAC:MODE MAXH".to_string()));
        assert_eq!(
            bench.connector.calls(),
            ["connect", "modulated_on", "modulated_off", "disconnect"]
        );
    }

    #[tokio::test]
    async fn test_lte_tx_power() {
        let bench = bench(SimulatorState::default(), Script::default()).await;
        let report = bench
            .runner
            .run_to_completion(TestRequest::new(
                Protocol::Lte,
                Procedure::TxPower,
                RunParameters {
                    channel: Some(6300),
                    power_dbm: Some(23),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert!(report.ok);
        assert_eq!(report.verdict.unwrap().passed, None);
        assert_eq!(
            bench.connector.calls(),
            ["connect", "modem_on", "abort", "cw_on", "abort", "modem_off", "disconnect"]
        );
        assert_eq!(bench.simulator.state().center_hz, 806_000_000.0);
    }

    #[tokio::test]
    async fn test_lte_modem_failure_skips_disarm() {
        let bench = bench(
            SimulatorState::default(),
            Script {
                fail_on: vec!["modem_on"],
                ..Default::default()
            },
        )
        .await;
        let report = bench
            .runner
            .run_to_completion(TestRequest::new(
                Protocol::Lte,
                Procedure::TxPower,
                RunParameters {
                    channel: Some(6300),
                    power_dbm: Some(23),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert!(!report.ok);
        assert_eq!(
            bench.connector.calls(),
            ["connect", "modem_on", "modem_on", "modem_on", "disconnect"]
        );
        assert_eq!(
            steps(&report)[6..],
            [
                (ModemOn, Started),
                (ModemOn, Failed),
                (ModemOn, Failed),
                (ModemOn, Failed),
                (DisconnectDut, Started),
                (DisconnectDut, Finished),
            ]
        );
        let error = report
            .events
            .iter()
            .position(|e| matches!(e, TestEvent::Error { .. }))
            .unwrap();
        let disconnect = report
            .events
            .iter()
            .position(|e| e.step_status() == Some((DisconnectDut, Started)))
            .unwrap();
        assert!(error < disconnect);
        assert_eq!(report.events.last(), Some(&TestEvent::Done { ok: false }));
    }

    #[tokio::test]
    async fn test_unknown_earfcn_is_rejected_before_hardware() {
        let bench = bench(SimulatorState::default(), Script::default()).await;
        let report = bench
            .runner
            .run_to_completion(TestRequest::new(
                Protocol::Lte,
                Procedure::TxPower,
                RunParameters {
                    channel: Some(1234),
                    power_dbm: Some(23),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert!(!report.ok);
        assert_eq!(report.events.len(), 3);
        assert!(matches!(report.events[0], TestEvent::Start { .. }));
        assert!(matches!(&report.events[1], TestEvent::Error { message } if message.contains("1234")));
        assert_eq!(report.events[2], TestEvent::Done { ok: false });
        assert!(bench.connector.calls().is_empty());
        assert!(bench.simulator.received().is_empty());
    }

    #[tokio::test]
    async fn test_missing_span_command_rejected_before_hardware() {
        let builtin = CommandRegistry::builtin().unwrap();
        let templates: Vec<(String, String)> = builtin
            .names()
            .filter(|name| *name != names::SET_SPAN)
            .map(|name| (name.to_string(), builtin.get(name).unwrap().pattern().to_string()))
            .collect();
        let registry =
            CommandRegistry::from_templates(templates.iter().map(|(n, p)| (n.as_str(), p.as_str()))).unwrap();
        let bench = bench_on(registry, SimulatorState::default(), Script::default(), |_| {}).await;

        for procedure in [Procedure::TxPower, Procedure::OccupiedBandwidth] {
            let report = bench
                .runner
                .run_to_completion(lora(procedure, RunParameters::default()))
                .await
                .unwrap();
            assert!(!report.ok);
            assert_eq!(report.events.len(), 3);
            assert!(matches!(&report.events[1], TestEvent::Error { message } if message.contains("set_span")));
            assert_eq!(report.events[2], TestEvent::Done { ok: false });
        }
        assert!(bench.connector.calls().is_empty());
        assert!(bench.simulator.received().is_empty());
    }

    #[tokio::test]
    async fn test_ble_equal_power_skips_reset() {
        let bench = bench(
            SimulatorState::default(),
            Script {
                tx_power: Some(TxPowerConst(0x1F)),
                ..Default::default()
            },
        )
        .await;
        let report = bench
            .runner
            .run_to_completion(TestRequest::new(
                Protocol::Ble,
                Procedure::TxPower,
                RunParameters {
                    channel: Some(19),
                    power_const: Some("0x1F".to_string()),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert!(report.ok);
        let skipped: Vec<StepKey> = report
            .events
            .iter()
            .filter_map(|event| match event {
                TestEvent::Step {
                    key, skipped: true, ..
                } => Some(*key),
                _ => None,
            })
            .collect();
        assert_eq!(skipped, [SetPower, SaveReset, ReconnectDut]);
        assert_eq!(
            bench.connector.calls(),
            ["connect", "get_power", "start_tone", "disconnect"]
        );
        assert_eq!(bench.simulator.state().center_hz, 2_440_000_000.0);
    }

    #[tokio::test]
    async fn test_ble_power_change_resets_and_reconnects() {
        let bench = bench(
            SimulatorState::default(),
            Script {
                tx_power: Some(TxPowerConst(0x10)),
                ..Default::default()
            },
        )
        .await;
        let report = bench
            .runner
            .run_to_completion(TestRequest::new(
                Protocol::Ble,
                Procedure::TxPower,
                RunParameters {
                    channel: Some(0),
                    power_const: Some("1F".to_string()),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert!(report.ok);
        assert_eq!(
            bench.connector.calls(),
            [
                "connect",
                "get_power",
                "set_power",
                "save_reset",
                "connect",
                "start_tone",
                "disconnect"
            ]
        );
        assert!(steps(&report).contains(&(ReconnectDut, Finished)));
    }

    #[tokio::test]
    async fn test_rejected_tone_fails_run() {
        let bench = bench(
            SimulatorState::default(),
            Script {
                tone_rejected: true,
                ..Default::default()
            },
        )
        .await;
        let report = bench
            .runner
            .run_to_completion(TestRequest::new(
                Protocol::Ble,
                Procedure::FrequencyAccuracy,
                RunParameters {
                    channel: Some(39),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert!(!report.ok);
        assert!(steps(&report).contains(&(ToneStart, Failed)));
        assert!(!steps(&report).contains(&(Measure, Started)));
        assert_eq!(report.events.last(), Some(&TestEvent::Done { ok: false }));
    }

    #[tokio::test]
    async fn test_device_connect_is_retried() {
        let bench = bench(
            SimulatorState::default(),
            Script {
                connect_failures: 2,
                ..Default::default()
            },
        )
        .await;
        let report = bench
            .runner
            .run_to_completion(lora(Procedure::TxPower, RunParameters::default()))
            .await
            .unwrap();

        assert!(report.ok);
        let attempts: Vec<(StepStatus, Option<u32>)> = report
            .events
            .iter()
            .filter_map(|event| match event {
                TestEvent::Step {
                    key: ConnectDut,
                    status,
                    attempt,
                    ..
                } => Some((*status, *attempt)),
                _ => None,
            })
            .collect();
        assert_eq!(
            attempts,
            [
                (Started, None),
                (Failed, Some(1)),
                (Failed, Some(2)),
                (Finished, Some(3))
            ]
        );
    }

    #[tokio::test]
    async fn test_device_unreachable() {
        let bench = bench(
            SimulatorState::default(),
            Script {
                connect_failures: 10,
                ..Default::default()
            },
        )
        .await;
        let report = bench
            .runner
            .run_to_completion(lora(Procedure::TxPower, RunParameters::default()))
            .await
            .unwrap();

        assert!(!report.ok);
        assert_eq!(bench.connector.calls(), ["connect", "connect", "connect"]);
        let tail = &report.events[report.events.len() - 2..];
        assert!(matches!(tail[0], TestEvent::Error { .. }));
        assert_eq!(tail[1], TestEvent::Done { ok: false });
    }

    #[tokio::test]
    async fn test_failure_after_arming_disarms_first() {
        let bench = bench(
            SimulatorState {
                rejected: vec!["CALC:MARK1:Y?".to_string()],
                ..Default::default()
            },
            Script::default(),
        )
        .await;
        let report = bench
            .runner
            .run_to_completion(lora(Procedure::TxPower, RunParameters::default()))
            .await
            .unwrap();

        assert!(!report.ok);
        assert_eq!(
            steps(&report)[8..],
            [
                (Measure, Started),
                (Measure, Failed),
                (CwOff, Started),
                (CwOff, Finished),
                (DisconnectDut, Started),
                (DisconnectDut, Finished),
            ]
        );
        let tail = &report.events[report.events.len() - 2..];
        assert!(matches!(tail[0], TestEvent::Error { .. }));
        assert_eq!(tail[1], TestEvent::Done { ok: false });
        assert_eq!(bench.connector.calls(), ["connect", "cw_on", "cw_off", "disconnect"]);
    }

    #[tokio::test]
    async fn test_disarm_failure_fails_run_after_result() {
        let bench = bench(
            SimulatorState::default(),
            Script {
                fail_on: vec!["cw_off"],
                ..Default::default()
            },
        )
        .await;
        let report = bench
            .runner
            .run_to_completion(lora(Procedure::TxPower, RunParameters::default()))
            .await
            .unwrap();

        assert!(!report.ok);
        assert!(report.measurement.is_some());
        let tail = &report.events[report.events.len() - 3..];
        assert!(matches!(tail[0], TestEvent::Result { .. }));
        assert!(matches!(tail[1], TestEvent::Error { .. }));
        assert_eq!(tail[2], TestEvent::Done { ok: false });
    }

    #[tokio::test]
    async fn test_cancel_during_measure_disarms_in_background() {
        let bench = bench(
            SimulatorState {
                delays: vec![("CALC:MARK1:MAX".to_string(), Duration::from_secs(5))],
                ..Default::default()
            },
            Script::default(),
        )
        .await;
        let mut handle = bench
            .runner
            .start(lora(Procedure::TxPower, RunParameters::default()));
        while let Some(event) = handle.next_event().await {
            if event.step_status() == Some((Measure, Started)) {
                break;
            }
        }
        let cancelled = Instant::now();
        handle.cancel().await.unwrap();
        assert!(bench.connector.wait_for("disconnect", Duration::from_secs(2)).await);
        assert!(cancelled.elapsed() < Duration::from_secs(2));
        assert_eq!(bench.connector.calls(), ["connect", "cw_on", "cw_off", "disconnect"]);

        // The analyzer is released for the next run.
        let lease = tokio::time::timeout(Duration::from_secs(2), bench.runner.analyzer().acquire())
            .await
            .unwrap();
        assert!(!lease.is_connected());
    }

    #[tokio::test]
    async fn test_cancel_during_max_hold_restores_trace_mode() {
        let bench = bench_with(SimulatorState::default(), Script::default(), |config| {
            config.lora.occupied_bandwidth.obw.accumulate_seconds = Some(5.0);
        })
        .await;
        let mut handle = bench
            .runner
            .start(lora(Procedure::OccupiedBandwidth, RunParameters::default()));
        while let Some(event) = handle.next_event().await {
            if event.step_status() == Some((Measure, Started)) {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(bench.simulator.state().trace_mode, "MAXH");
        handle.cancel().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while bench.simulator.state().trace_mode != "WRIT" && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bench.simulator.state().trace_mode, "WRIT");
        assert!(bench.connector.wait_for("cw_off", Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_runs_queue_on_the_analyzer() {
        let bench = bench(SimulatorState::default(), Script::default()).await;
        let first = bench
            .runner
            .start(lora(Procedure::TxPower, RunParameters::default()));
        let second = bench
            .runner
            .start(lora(Procedure::TxPower, RunParameters::default()));
        assert_ne!(first.run_id(), second.run_id());
        let (first, second) = tokio::join!(first.collect(), second.collect());
        assert!(first.unwrap().ok);
        assert!(second.unwrap().ok);
        let calls = bench.connector.calls();
        assert_eq!(
            calls,
            [
                "connect",
                "cw_on",
                "cw_off",
                "disconnect",
                "connect",
                "cw_on",
                "cw_off",
                "disconnect"
            ]
        );
    }
}
