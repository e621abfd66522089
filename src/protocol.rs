//! Messages crossing the worker process boundary
//!
//! Each message is one JSON object per line. The worker writes
//! [`ChannelMessage`]s to its stdout, the supervisor writes [`WorkerCommand`]s to
//! the worker's stdin. Stdout carries nothing else; worker logs go to stderr.

use crate::device::StateSample;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Worker to supervisor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// The worker established a hardware link
    Connected,
    /// A fresh reading
    Sample(StateSample),
    /// The worker hit a fatal condition and is terminating
    Error { cause: String },
}

impl ChannelMessage {
    pub fn error(cause: impl Into<String>) -> Self {
        ChannelMessage::Error {
            cause: cause.into(),
        }
    }
}

/// Supervisor to worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    Stop,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode line {line:?}: {source}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write message: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes `message` as a single newline-terminated line
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message).map_err(ProtocolError::Encode)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(line.trim()).map_err(|source| ProtocolError::Decode {
        line: line.trim().to_string(),
        source,
    })
}

/// Blocking line writer used on the worker side
///
/// Flushes after every message: the supervisor's liveness check depends on
/// messages arriving when they are produced, not when a buffer fills.
pub struct MessageWriter<W: Write> {
    inner: W,
}

impl<W: Write> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn send(&mut self, message: &ChannelMessage) -> Result<(), ProtocolError> {
        let line = encode_line(message)?;
        self.inner.write_all(line.as_bytes())?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
