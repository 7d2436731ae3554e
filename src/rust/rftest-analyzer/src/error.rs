// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Display;
use std::io;
use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Analyzer session is not connected")]
    NotConnected,

    #[error("Failed to connect to analyzer at {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    /// Write or read fault on the socket. The session is disconnected when
    /// this is returned.
    #[error("Transport error during {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{operation} did not complete within {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("No number found in analyzer reply {reply:?}")]
    Parse { reply: String },

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Command '{command}' requires parameter '{placeholder}'")]
    MissingParameter { command: String, placeholder: String },

    #[error("Invalid template for command '{command}': {reason}")]
    InvalidTemplate { command: String, reason: String },

    #[error("Invalid trace: {0}")]
    InvalidTrace(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    pub fn new<T>(msg: T) -> Self
    where
        T: Display,
    {
        Error::Anyhow(anyhow::anyhow!(msg.to_string()))
    }

    pub(crate) fn transport(operation: &'static str, source: io::Error) -> Self {
        Error::Transport { operation, source }
    }

    /// Whether the fault originated on the wire, as opposed to a rejected or
    /// malformed command.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::NotConnected
                | Error::ConnectionFailed { .. }
                | Error::Transport { .. }
                | Error::Timeout { .. }
        )
    }
}
