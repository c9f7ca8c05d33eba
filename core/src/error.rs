use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("PREAMBLE+START marker not found")]
    MarkerNotFound,

    #[error("Signal too weak for a content bit (level {level:.5})")]
    WeakSignal { level: f32 },

    #[error("Insufficient samples after START")]
    InsufficientSamples,

    #[error("Address mismatch: got {0}, expected 1")]
    AddressMismatch(u8),

    #[error("Sequence number mismatch: got {got}, expected {expected}")]
    SeqNrMismatch { got: u8, expected: u8 },

    #[error("Data length {len} exceeds maximum {max}")]
    DataLengthExceeded { len: usize, max: usize },

    #[error("END marker mismatch: got {0:#04x}")]
    EndMarkerMismatch(u8),

    #[error("Checksum mismatch: got {got:#04x}, calculated {calculated:#04x}")]
    ChecksumMismatch { got: u8, calculated: u8 },

    #[error("Unknown command code {0:#04x}")]
    UnknownCommand(u8),

    #[error("Max. nr. of resends ({max}) exceeded with command {command}")]
    MaxResendsExceeded { max: u32, command: String },

    #[error("Transmit buffer full ({0} telegrams in flight)")]
    BufferFull(usize),

    #[error("Frame of {len} samples does not fit a transmit slot of {capacity}")]
    FrameTooLong { len: usize, capacity: usize },

    #[error("Message of {len} bytes exceeds maximum {max}")]
    MessageTooLong { len: usize, max: usize },

    #[error("No answer from peer during {0}")]
    HandshakeTimeout(&'static str),

    #[error("Call rejected by peer")]
    CallRejected,

    #[error("No session key established")]
    MissingSessionKey,

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("FFT error: {0}")]
    FftError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Link stopped")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Field validation failures of the receive path. These are counted and
    /// recovered by the peer's retransmission timer.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            LinkError::AddressMismatch(_)
                | LinkError::SeqNrMismatch { .. }
                | LinkError::DataLengthExceeded { .. }
                | LinkError::EndMarkerMismatch(_)
                | LinkError::ChecksumMismatch { .. }
                | LinkError::UnknownCommand(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
