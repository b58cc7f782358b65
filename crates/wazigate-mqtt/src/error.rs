use thiserror::Error;

use crate::packet::ConnectReturnCode;

/// Top-level error type for the `wazigate-mqtt` crate.
///
/// Protocol errors close the offending stream and are never retried.
/// Everything else is surfaced to the caller, who decides.
#[derive(Debug, Error)]
pub enum Error {
    // ── Protocol ────────────────────────────────────────────────────
    /// Malformed packet, reserved packet type, invalid length or a
    /// packet that is not allowed in the current state.
    #[error("MQTT protocol error: {0}")]
    Protocol(String),

    /// Remaining length exceeds the configured maximum.
    #[error("Packet too large: {length} bytes (max {max})")]
    PacketTooLarge { length: usize, max: usize },

    /// A topic name or filter failed validation.
    #[error("Invalid topic {topic:?}: {reason}")]
    InvalidTopic { topic: String, reason: &'static str },

    // ── Session ─────────────────────────────────────────────────────
    /// The pending-acknowledgement window is full.
    #[error("Too many packets awaiting acknowledgement (max {max})")]
    MaxPendingExceeded { max: usize },

    /// The peer refused the connection in its CONNACK.
    #[error("Connection refused: {0}")]
    ConnectionRefused(ConnectReturnCode),

    /// The stream or session is gone.
    #[error("Connection closed")]
    Closed,

    /// No packet arrived within the read deadline.
    #[error("Read timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Transport ───────────────────────────────────────────────────
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Returns `true` for errors caused by the peer violating the protocol.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::PacketTooLarge { .. } | Self::InvalidTopic { .. }
        )
    }

    /// Returns `true` if the connection itself broke (as opposed to a
    /// deliberate refusal or a full window).
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Closed | Self::Timeout { .. } | Self::WebSocket(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}
