use thiserror::Error;

/// Failure reported by the transport underneath an [`Endpoint`](crate::Endpoint).
///
/// Carries only a message: GATT stacks differ too much between platforms
/// for a richer shape to be portable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport write failed: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Errors terminating a print operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrintError {
    /// The endpoint rejected the write of segment `segment`. Nothing after it was sent.
    #[error("segment {segment} failed: {source}")]
    Transport {
        segment: usize,
        #[source]
        source: TransportError,
    },
    /// The print was cancelled before segment `written` was sent.
    #[error("print cancelled after {written} segment(s)")]
    Cancelled { written: usize },
    /// A character cannot be represented in one byte (strict encoding only).
    #[error("character {ch:?} at offset {offset} does not fit in one byte")]
    Encoding { offset: usize, ch: char },
    #[error("max chunk size must be greater than zero")]
    InvalidChunkSize,
}

/// Result of a single characteristic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The transport accepted this many bytes.
    Written(usize),
    /// No endpoint was available, nothing was sent.
    CapabilityUnavailable,
}

impl WriteOutcome {
    pub fn bytes_written(&self) -> usize {
        match self {
            WriteOutcome::Written(n) => *n,
            WriteOutcome::CapabilityUnavailable => 0,
        }
    }
}

/// Result of a whole print operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintOutcome {
    Printed { segments: usize, bytes: usize },
    CapabilityUnavailable,
}

impl PrintOutcome {
    pub fn is_printed(&self) -> bool {
        matches!(self, PrintOutcome::Printed { .. })
    }
}
