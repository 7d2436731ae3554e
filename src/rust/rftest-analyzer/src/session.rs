// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! One line-framed TCP connection to the spectrum analyzer.

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use rftest_log::{diagnostic, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};

use crate::error::{Error, Result};
use crate::number::parse_number;
use crate::registry::{CommandRegistry, names};

pub const DEFAULT_PORT: u16 = 5555;
pub const DEFAULT_ADDRESS: &str = "172.16.10.1";

const READ_CHUNK: usize = 4096;

/// Connection parameters of an [`InstrumentSession`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub address: String,
    pub port: u16,
    pub line_ending: String,
    /// Bound on every single socket read or write.
    pub io_timeout: Duration,
    pub connect_timeout: Duration,
    /// The identity reply must contain this text for the handshake to succeed.
    pub identity_substring: String,
    pub opc_timeout: Duration,
    pub opc_poll_interval: Duration,
}

impl SessionConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        SessionConfig {
            address: address.into(),
            port,
            ..Default::default()
        }
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    fn terminator(&self) -> u8 {
        self.line_ending.as_bytes().last().copied().unwrap_or(b'\n')
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            line_ending: "\n".to_string(),
            io_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            identity_substring: "Rohde".to_string(),
            opc_timeout: Duration::from_secs(3),
            opc_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Connection to the analyzer.
///
/// The session owns its socket exclusively. Any write or read fault drops
/// the socket, so the next operation fails with [`Error::NotConnected`]
/// instead of talking over a broken or desynchronized stream. The same
/// happens when a previous exchange was abandoned half way, e.g. because
/// the future driving it was dropped.
#[derive(Debug)]
pub struct InstrumentSession {
    config: SessionConfig,
    registry: Arc<CommandRegistry>,
    stream: Option<TcpStream>,
    pending: Vec<u8>,
    io_timeout: Duration,
    exchange_open: bool,
    identity: Option<String>,
}

impl InstrumentSession {
    /// Create a disconnected session.
    pub fn new(config: SessionConfig, registry: Arc<CommandRegistry>) -> Self {
        let io_timeout = config.io_timeout;
        InstrumentSession {
            config,
            registry,
            stream: None,
            pending: Vec::new(),
            io_timeout,
            exchange_open: false,
            identity: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Identity reply of the current connection.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some() && !self.exchange_open
    }

    /// Build a command from the registry.
    pub fn command(&self, name: &str, params: &[(&str, &str)]) -> Result<String> {
        self.registry.build(name, params)
    }

    /// Open the socket and perform the identity handshake.
    ///
    /// An existing connection is closed first. On failure the session stays
    /// disconnected.
    pub async fn connect(&mut self) -> Result<()> {
        self.disconnect().await;
        let target = self.config.target();
        match self.open().await {
            Ok(identity) => {
                info!("Connected to analyzer at {}: {}", target, identity);
                self.exchange_open = false;
                self.identity = Some(identity);
                Ok(())
            }
            Err(reason) => {
                self.drop_stream();
                warn!("Failed to connect to analyzer at {}: {}", target, reason);
                Err(Error::ConnectionFailed {
                    address: target,
                    reason,
                })
            }
        }
    }

    async fn open(&mut self) -> std::result::Result<String, String> {
        let address = self.config.address.clone();
        let stream = match timeout(
            self.config.connect_timeout,
            TcpStream::connect((address.as_str(), self.config.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => {
                return Err(format!(
                    "no connection within {:?}",
                    self.config.connect_timeout
                ));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            diagnostic!("Could not disable Nagle on analyzer socket: {}", e);
        }
        self.stream = Some(stream);
        // Unusable until the handshake completes.
        self.exchange_open = true;
        let identify = self
            .registry
            .build(names::IDENTIFY, &[])
            .map_err(|e| e.to_string())?;
        self.write_line("identify", &identify)
            .await
            .map_err(|e| e.to_string())?;
        let reply = self
            .read_line("identify", self.io_timeout)
            .await
            .map_err(|e| e.to_string())?;
        if !reply.contains(&self.config.identity_substring) {
            return Err(format!(
                "unexpected identity {reply:?}, expected '{}'",
                self.config.identity_substring
            ));
        }
        Ok(reply)
    }

    /// Close the connection. Always leaves the session disconnected.
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if timeout(self.io_timeout, stream.shutdown()).await.is_err() {
                diagnostic!("Analyzer socket shutdown timed out");
            }
            info!("Disconnected from analyzer at {}", self.config.target());
        }
        self.pending.clear();
        self.exchange_open = false;
        self.identity = None;
    }

    /// Point the session at another analyzer. Returns whether the target
    /// changed, in which case the session is now disconnected.
    pub async fn retarget(&mut self, address: &str, port: u16) -> bool {
        if self.config.address == address && self.config.port == port {
            return false;
        }
        self.disconnect().await;
        self.config.address = address.to_string();
        self.config.port = port;
        true
    }

    /// Write one line.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        self.begin_exchange()?;
        let result = self.write_line("send", command).await;
        self.end_exchange();
        result
    }

    /// Read one line, trimmed.
    pub async fn read_response(&mut self) -> Result<String> {
        self.begin_exchange()?;
        let result = self.read_line("read", self.io_timeout).await;
        self.end_exchange();
        result
    }

    pub async fn query(&mut self, command: &str) -> Result<String> {
        self.begin_exchange()?;
        let result = match self.write_line("query", command).await {
            Ok(()) => self.read_line("query", self.io_timeout).await,
            Err(e) => Err(e),
        };
        self.end_exchange();
        result
    }

    /// Query and extract the first number of the reply.
    pub async fn query_number(&mut self, command: &str) -> Result<f64> {
        let reply = self.query(command).await?;
        parse_number(&reply)
    }

    /// Send a command and poll the operation complete query until it answers
    /// `expect` or `limit` elapses.
    pub async fn send_and_wait(&mut self, command: &str, expect: &str, limit: Duration) -> Result<()> {
        self.begin_exchange()?;
        let result = self.send_and_poll(command, expect, limit).await;
        self.end_exchange();
        result
    }

    /// [`Self::send_and_wait`] with the configured operation complete timeout.
    pub async fn send_and_confirm(&mut self, command: &str) -> Result<()> {
        let limit = self.config.opc_timeout;
        self.send_and_wait(command, "1", limit).await
    }

    async fn send_and_poll(&mut self, command: &str, expect: &str, limit: Duration) -> Result<()> {
        let opc = self.registry.build(names::OPERATION_COMPLETE, &[])?;
        let deadline = Instant::now() + limit;
        self.write_line("send", command).await?;
        loop {
            self.write_line("operation complete query", &opc).await?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self
                .read_line("operation complete query", remaining.min(self.io_timeout))
                .await
            {
                Ok(reply) if reply == expect => return Ok(()),
                Ok(reply) => {
                    diagnostic!("'{}' not complete yet: {:?}", command, reply);
                }
                Err(Error::Transport { source, .. })
                    if source.kind() == io::ErrorKind::TimedOut && Instant::now() >= deadline =>
                {
                    return Err(Error::Timeout {
                        operation: "operation complete",
                        after: limit,
                    });
                }
                Err(e) => return Err(e),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout {
                    operation: "operation complete",
                    after: limit,
                });
            }
            tokio::time::sleep(self.config.opc_poll_interval.min(remaining)).await;
        }
    }

    /// Temporarily replace the read/write timeout. The previous value is
    /// restored when the guard is dropped.
    pub fn with_io_timeout(&mut self, io_timeout: Duration) -> IoTimeoutGuard<'_> {
        let previous = std::mem::replace(&mut self.io_timeout, io_timeout);
        IoTimeoutGuard {
            session: self,
            previous,
        }
    }

    fn begin_exchange(&mut self) -> Result<()> {
        if self.exchange_open {
            warn!(
                "Previous exchange with analyzer at {} was interrupted, dropping connection",
                self.config.target()
            );
            self.drop_stream();
        }
        if self.stream.is_none() {
            return Err(Error::NotConnected);
        }
        self.exchange_open = true;
        Ok(())
    }

    fn end_exchange(&mut self) {
        self.exchange_open = false;
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.pending.clear();
        self.exchange_open = false;
        self.identity = None;
    }

    async fn write_line(&mut self, operation: &'static str, text: &str) -> Result<()> {
        let mut line = String::with_capacity(text.len() + self.config.line_ending.len());
        line.push_str(text);
        line.push_str(&self.config.line_ending);
        let io_timeout = self.io_timeout;
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        diagnostic!("-> {}", text);
        let written = match timeout(io_timeout, stream.write_all(line.as_bytes())).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        };
        if let Err(e) = written {
            self.drop_stream();
            return Err(Error::transport(operation, e));
        }
        Ok(())
    }

    async fn read_line(&mut self, operation: &'static str, limit: Duration) -> Result<String> {
        let terminator = self.config.terminator();
        let deadline = Instant::now() + limit;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == terminator) {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                let reply = decode(&line);
                diagnostic!("<- {}", reply);
                return Ok(reply);
            }
            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            let read = match timeout_at(deadline, stream.read(&mut chunk)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
            };
            match read {
                Ok(0) if self.pending.is_empty() => {
                    self.drop_stream();
                    return Err(Error::transport(
                        operation,
                        io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by analyzer"),
                    ));
                }
                Ok(0) => {
                    let reply = decode(&std::mem::take(&mut self.pending));
                    self.drop_stream();
                    diagnostic!("<- {} (connection closed)", reply);
                    return Ok(reply);
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    self.drop_stream();
                    return Err(Error::transport(operation, e));
                }
            }
        }
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Restores the session's previous I/O timeout on drop.
pub struct IoTimeoutGuard<'a> {
    session: &'a mut InstrumentSession,
    previous: Duration,
}

impl Deref for IoTimeoutGuard<'_> {
    type Target = InstrumentSession;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl DerefMut for IoTimeoutGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl Drop for IoTimeoutGuard<'_> {
    fn drop(&mut self) {
        self.session.io_timeout = self.previous;
    }
}
