// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Scripted spectrum analyzer listening on a local TCP port.
//!
//! Understands the built-in command set and the long-form fallback queries.
//! Settings written by the client are stored and read back, marker and trace
//! readings are taken from the scripted [`SimulatorState`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rftest_log::diagnostic;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::number::{format_value, parse_number};

/// Reply to queries listed in [`SimulatorState::rejected`].
pub const REJECTED_REPLY: &str = "ERROR";

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorState {
    pub identity: String,
    pub center_hz: f64,
    pub span_hz: f64,
    pub rbw_hz: f64,
    pub vbw_hz: f64,
    pub ref_level_dbm: f64,
    pub ref_level_offset_db: f64,
    pub detector: String,
    pub trace_mode: String,
    pub marker_power_dbm: f64,
    pub marker_frequency_hz: f64,
    pub trace_dbm: Vec<f64>,
    pub sweep_points: usize,
    /// Reply to the operation complete query.
    pub opc_reply: String,
    /// Commands starting with one of these headers are held back for the
    /// given time before they are processed.
    pub delays: Vec<(String, Duration)>,
    /// Queries starting with one of these headers are answered with
    /// [`REJECTED_REPLY`]; other commands are ignored.
    pub rejected: Vec<String>,
}

impl Default for SimulatorState {
    fn default() -> Self {
        SimulatorState {
            identity: "Rohde&Schwarz,FSC3,1314.5000K03/101234,V2.1".to_string(),
            center_hz: 1e9,
            span_hz: 5e6,
            rbw_hz: 1e5,
            vbw_hz: 1e5,
            ref_level_dbm: 0.0,
            ref_level_offset_db: 0.0,
            detector: "SAMP".to_string(),
            trace_mode: "WRIT".to_string(),
            marker_power_dbm: -50.0,
            marker_frequency_hz: 1e9,
            trace_dbm: vec![-90.0; 101],
            sweep_points: 101,
            opc_reply: "1".to_string(),
            delays: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

impl SimulatorState {
    fn delay_for(&self, line: &str) -> Option<Duration> {
        self.delays
            .iter()
            .find_map(|(prefix, delay)| line.starts_with(prefix.as_str()).then_some(*delay))
    }

    /// Process one command line and return the reply, if any.
    pub fn process_command(&mut self, line: &str) -> Option<String> {
        let (header, argument) = line.split_once(' ').unwrap_or((line, ""));
        let header = header.to_ascii_uppercase();
        let is_query = header.ends_with('?');
        if self.rejected.iter().any(|r| header.starts_with(r.as_str())) {
            return is_query.then(|| REJECTED_REPLY.to_string());
        }
        let header = header.strip_prefix("SENS:").unwrap_or(&header);
        let header = header.replace("DISP:WIND:TRAC:Y:SCAL:", "DISP:TRAC:Y:");
        let value = parse_number(argument).ok();
        let parts: Vec<&str> = header.split(':').collect();

        match parts.as_slice() {
            ["*IDN?"] => Some(self.identity.clone()),
            ["*OPC?"] => Some(self.opc_reply.clone()),
            ["*RST"] => {
                let preset = SimulatorState::default();
                self.center_hz = preset.center_hz;
                self.span_hz = preset.span_hz;
                self.rbw_hz = preset.rbw_hz;
                self.vbw_hz = preset.vbw_hz;
                self.ref_level_dbm = preset.ref_level_dbm;
                self.ref_level_offset_db = preset.ref_level_offset_db;
                self.detector = preset.detector;
                self.trace_mode = preset.trace_mode;
                None
            }
            ["FREQ", "CENT?"] => Some(format_value(self.center_hz)),
            ["FREQ", "SPAN?"] => Some(format_value(self.span_hz)),
            ["BAND", "RES?"] => Some(format_value(self.rbw_hz)),
            ["BAND", "VID?"] => Some(format_value(self.vbw_hz)),
            ["DISP", "TRAC", "Y", "RLEV?"] => Some(format_value(self.ref_level_dbm)),
            ["DISP", "TRAC", "Y", "RLEV", "OFFS?"] => Some(format_value(self.ref_level_offset_db)),
            ["SWE", "POIN?"] => Some(self.sweep_points.to_string()),
            ["TRAC", "DATA?"] => Some(
                self.trace_dbm
                    .iter()
                    .map(|v| format!("{v:.2}"))
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            ["CALC", _, "Y?"] => Some(format!("{:.2} DBM", self.marker_power_dbm)),
            ["CALC", _, "X?"] => Some(format_value(self.marker_frequency_hz)),
            ["CALC", _, "MAX"] => None,
            ["CALC", _, "FUNC", "CENT"] => {
                self.center_hz = self.marker_frequency_hz;
                None
            }
            ["FREQ", "CENT"] => {
                self.center_hz = value.unwrap_or(self.center_hz);
                None
            }
            ["FREQ", "SPAN"] => {
                self.span_hz = value.unwrap_or(self.span_hz);
                None
            }
            ["BAND", "RES"] => {
                self.rbw_hz = value.unwrap_or(self.rbw_hz);
                None
            }
            ["BAND", "VID"] => {
                self.vbw_hz = value.unwrap_or(self.vbw_hz);
                None
            }
            ["DISP", "TRAC", "Y", "RLEV"] => {
                self.ref_level_dbm = value.unwrap_or(self.ref_level_dbm);
                None
            }
            ["DISP", "TRAC", "Y", "RLEV", "OFFS"] => {
                self.ref_level_offset_db = value.unwrap_or(self.ref_level_offset_db);
                None
            }
            ["DISP", "TRAC", "MODE"] => {
                self.trace_mode = argument.trim().to_ascii_uppercase();
                None
            }
            ["DET"] => {
                self.detector = argument.trim().to_ascii_uppercase();
                None
            }
            _ if is_query => {
                diagnostic!("Simulator: unknown query {}", line);
                Some(REJECTED_REPLY.to_string())
            }
            _ => None,
        }
    }
}

/// Simulated analyzer served on `127.0.0.1`.
///
/// The server stops when the simulator is dropped.
pub struct AnalyzerSimulator {
    state: Arc<Mutex<SimulatorState>>,
    received: Arc<Mutex<Vec<String>>>,
    address: SocketAddr,
    server: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AnalyzerSimulator {
    pub async fn start(state: SimulatorState) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let state = Arc::new(Mutex::new(state));
        let received = Arc::new(Mutex::new(Vec::new()));
        let server = tokio::spawn(accept_loop(listener, Arc::clone(&state), Arc::clone(&received)));
        Ok(AnalyzerSimulator {
            state,
            received,
            address,
            server,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Snapshot of the current instrument state.
    pub fn state(&self) -> SimulatorState {
        lock(&self.state).clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut SimulatorState)) {
        f(&mut lock(&self.state));
    }

    /// All command lines received so far, across connections.
    pub fn received(&self) -> Vec<String> {
        lock(&self.received).clone()
    }
}

impl Drop for AnalyzerSimulator {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<Mutex<SimulatorState>>, received: Arc<Mutex<Vec<String>>>) {
    while let Ok((socket, peer)) = listener.accept().await {
        diagnostic!("Simulator: connection from {}", peer);
        tokio::spawn(serve_connection(socket, Arc::clone(&state), Arc::clone(&received)));
    }
}

async fn serve_connection(socket: TcpStream, state: Arc<Mutex<SimulatorState>>, received: Arc<Mutex<Vec<String>>>) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        lock(&received).push(line.clone());
        let delay = lock(&state).delay_for(&line);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let reply = lock(&state).process_command(&line);
        if let Some(reply) = reply {
            let framed = format!("{reply}\n");
            if write.write_all(framed.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}
