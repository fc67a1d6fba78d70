use thiserror::Error;

use crate::protocol::{Fault, ProtocolError};

/// Failures of a single HTTP exchange with the hub.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Hub answered with HTTP status {0}")]
    Status(reqwest::StatusCode),

    #[error("Malformed hub response: {0}")]
    MalformedResponse(ProtocolError),
}

/// Errors that can occur in the SAMP client.
#[derive(Error, Debug)]
pub enum SampError {
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No hub? {0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Fault(#[from] Fault),

    #[error("Registration failed: {0}")]
    Registration(Box<SampError>),

    #[error("Not registered with the hub")]
    NotRegistered,

    #[error("Connection closed")]
    Closed,

    #[error("No Tokio runtime to run a background task on")]
    NoRuntime,
}

impl SampError {
    /// Network failure, bad HTTP status or unparseable reply.
    pub fn is_transport(&self) -> bool {
        matches!(self, SampError::Transport(_))
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, SampError::Fault(_))
    }
}
