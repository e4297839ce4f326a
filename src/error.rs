// Copyright 2020 Joyent, Inc.

use std::io;

use thiserror::Error;

use crate::b64::B64Error;
use crate::template::TemplateError;

/// Failures raised while framing or parsing the line protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("line exceeds the {0} byte buffer limit")]
    LineTooLong(usize),
    #[error("push batch exceeds the {0} byte buffer limit")]
    BatchTooLarge(usize),
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed command: {0}")]
    Malformed(String),
    #[error("connection closed before the response terminator")]
    UnexpectedEof,
}

impl ProtocolError {
    /// True when the underlying read merely timed out and may be retried.
    pub fn is_timeout(&self) -> bool {
        match self {
            ProtocolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum FanError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Base64(#[from] B64Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("not connected")]
    NotConnected,
    #[error("unable to connect to {addr} after {attempts} attempts: {source}")]
    ConnectFailed {
        addr: String,
        attempts: u32,
        source: io::Error,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("remote rejected {call}: {message}")]
    Rejected { call: String, message: String },
}

pub type Result<T> = std::result::Result<T, FanError>;
