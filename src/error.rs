// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use thiserror::Error;

use crate::jdwp::error_code;

/// Represents errors that can occur while instrumenting a target process.
///
/// Attach, resolve and encode failures surface from
/// [`InvocationCountMeter::start`](crate::InvocationCountMeter::start) before any breakpoint
/// is armed. Disconnects and event timeouts that happen while measuring are absorbed by
/// the event reader and reported through [`SampleStatus`](crate::SampleStatus) instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The debug port refused the connection or the handshake failed.
    #[error("Failed to attach to {address}: {details}")]
    Attach {
        /// `host:port` that was dialed
        address: String,
        /// Additional context about the error
        details: String,
    },
    /// No class with the requested name is loaded in the target.
    #[error("Class {class} is not loaded in the target")]
    ClassNotFound {
        /// Fully-qualified class name
        class: String,
    },
    /// The class exists but has no method with the requested name and signature.
    #[error("Method {method} not found in class {class}")]
    MethodNotFound {
        /// Fully-qualified class name
        class: String,
        /// Method name followed by its encoded signature
        method: String,
    },
    /// A type descriptor cannot be represented as a protocol signature.
    #[error("Unsupported type '{type_name}'")]
    UnsupportedType {
        /// The offending type name as supplied by the caller
        type_name: String,
    },
    /// The connection to the target was lost.
    #[error("Target disconnected: {details}")]
    TargetDisconnected {
        /// Additional context about the error
        details: String,
    },
    /// An operation did not complete within its deadline.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Name of the operation that timed out (e.g., "attach", "start")
        operation: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },
    /// The target answered a command with a non-zero JDWP error code.
    #[error("JDWP command {command_set}/{command} failed with error code {code}")]
    Protocol {
        /// Command set of the failed command
        command_set: u8,
        /// Command within the set
        command: u8,
        /// JDWP error code from the reply header
        code: u16,
    },
    /// A packet from the target could not be decoded.
    #[error("Malformed packet: {details}")]
    MalformedPacket {
        /// What was being decoded when the data ran out or was invalid
        details: String,
    },
    /// The meter configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),
    /// A lifecycle method was called in a state that does not allow it.
    #[error("Invalid state: {details}")]
    InvalidState {
        /// Additional context about the error
        details: String,
    },
}

impl Error {
    /// Returns `true` for connection-level faults.
    ///
    /// A socket that closed, a reply that never arrived and a target that reports
    /// `VM_DEAD` all mean the measurement lost its peer. Every other protocol error code
    /// is a rejected command on a live connection.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::TargetDisconnected { .. } => true,
            Error::Protocol { code, .. } => *code == error_code::VM_DEAD,
            _ => false,
        }
    }

    pub(crate) fn disconnected(details: impl Into<String>) -> Self {
        Error::TargetDisconnected {
            details: details.into(),
        }
    }

    pub(crate) fn malformed(details: impl Into<String>) -> Self {
        Error::MalformedPacket {
            details: details.into(),
        }
    }

    pub(crate) fn invalid_state(details: impl Into<String>) -> Self {
        Error::InvalidState {
            details: details.into(),
        }
    }
}

impl From<figment::Error> for Error {
    fn from(error: figment::Error) -> Self {
        Error::Config(error.to_string())
    }
}

/// A Result type specialized for invocation metering.
pub type Result<T> = std::result::Result<T, Error>;
