use thiserror::Error;

use crate::{command::CommandKind, notification::NotificationKind};

/// Errors raised while unwrapping the outer frame envelope
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The frame does not start with the header byte or is too short to carry one
    #[error("Malformed frame header: {0}")]
    MalformedHeader(String),

    /// The frame declares more bytes than were received
    #[error("Truncated frame: declared {declared} bytes after the length byte, received {available}")]
    Truncated {
        /// Bytes announced by the length byte
        declared: usize,
        /// Bytes actually present after the length byte
        available: usize,
    },

    /// The checksum byte does not match the payload
    #[error("Invalid checksum: computed {computed:#04X}, received {received:#04X}")]
    ChecksumMismatch {
        /// Checksum computed over the received payload
        computed: u8,
        /// Checksum byte carried by the frame
        received: u8,
    },

    /// Bytes after the checksum are not the `FF FF` terminator
    #[error("Invalid suffix {suffix:02X?}")]
    InvalidSuffix {
        /// The trailing bytes found after the checksum
        suffix: Vec<u8>,
    },

    /// The payload does not fit into the one-byte length field
    #[error("Payload of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLong {
        /// Payload length that was requested
        len: usize,
        /// Largest payload a frame can carry
        max: usize,
    },
}

/// Errors raised while decoding a payload into a [`crate::Notification`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// The payload length does not satisfy the layout of its kind
    #[error("Message has invalid payload length for {kind} (expected: {expected}, actual: {actual})")]
    InvalidPayloadLength {
        /// Kind selected by the opcode prefix
        kind: NotificationKind,
        /// Length the layout requires
        expected: usize,
        /// Length that was received
        actual: usize,
    },

    /// No layout is registered for the opcode prefix
    #[error("Unsupported message with prefix {prefix:02X?}")]
    UnsupportedMessage {
        /// The leading bytes of the payload
        prefix: Vec<u8>,
    },

    /// A text field is not valid UTF-8
    #[error("Invalid UTF-8 text in {kind}")]
    InvalidText {
        /// Kind carrying the text field
        kind: NotificationKind,
    },
}

/// Any failure of a single decode attempt, frame or payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The outer envelope is invalid
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The payload inside a valid envelope is invalid
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Errors that can occur when working with a SEM6000 plug
#[derive(Error, Debug)]
pub enum Sem6000Error {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found during scanning
    #[error("SEM6000 device not found: {0}")]
    DeviceNotFound(String),

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// No link is up and no reconnect is possible
    #[error("Not connected and no device address / PIN set")]
    NotConnected,

    /// The link went down while a reply was awaited
    #[error("Device disconnected")]
    Disconnected,

    /// The device rejected the PIN
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// An operation needs a remembered PIN but none is known
    #[error("Not authorized - authorize with a PIN first")]
    NotAuthorized,

    /// The reply never completed within the wait bounds
    #[error("Incomplete notification data after {received} bytes")]
    IncompleteNotification {
        /// Bytes collected before giving up
        received: usize,
    },

    /// The implicit reconnect before a command failed
    #[error("Reconnect failed while sending {command}: {source}")]
    ReconnectFailed {
        /// Command that triggered the reconnect
        command: CommandKind,
        /// Why the reconnect failed
        #[source]
        source: Box<Sem6000Error>,
    },

    /// The reply could not be decoded
    #[error("Failed to decode reply: {0}")]
    Decode(#[from] DecodeError),

    /// The reply decoded to a different kind than the command expects
    #[error("{command} failed: expected {expected}, received {received}")]
    UnexpectedNotification {
        /// Command that was sent
        command: CommandKind,
        /// Kind the command expects
        expected: NotificationKind,
        /// Kind that arrived
        received: NotificationKind,
    },

    /// The device reported that the command was not carried out
    #[error("{command} failed")]
    CommandFailed {
        /// Command the device rejected
        command: CommandKind,
    },

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Transport specific failure
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<FrameError> for Sem6000Error {
    fn from(error: FrameError) -> Self {
        Self::Decode(DecodeError::Frame(error))
    }
}

impl From<PayloadError> for Sem6000Error {
    fn from(error: PayloadError) -> Self {
        Self::Decode(DecodeError::Payload(error))
    }
}

/// Result type for SEM6000 operations
pub type Result<T> = std::result::Result<T, Sem6000Error>;

impl Sem6000Error {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::NotConnected
                | Self::Disconnected
                | Self::DeviceNotFound(_)
                | Self::ReconnectFailed { .. }
                | Self::Transport(_)
        )
    }

    /// Check if this error means the link dropped and a reconnect may help
    #[must_use]
    pub const fn is_link_loss(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::Disconnected | Self::NotConnected | Self::Transport(_)
        )
    }

    /// Check if retrying the same call at a higher level is reasonable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::IncompleteNotification { .. }
                | Self::Disconnected
                | Self::ReconnectFailed { .. }
        )
    }

    pub(crate) fn unexpected(
        command: CommandKind,
        expected: NotificationKind,
        received: NotificationKind,
    ) -> Self {
        Self::UnexpectedNotification {
            command,
            expected,
            received,
        }
    }
}
