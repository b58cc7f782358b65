// ── Core error types ──
//
// Every failure carries an HTTP-style code so REST handlers, the bridge
// and the cloud status fields can report it uniformly. The `From` impls
// wrap the lower crates' errors without flattening them, so the sync
// engine can still ask an API error for its status.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Data errors ──────────────────────────────────────────────────
    #[error("Device not found: {id}")]
    DeviceNotFound { id: String },

    #[error("Entity not found: {entity_type} {identifier}")]
    NotFound {
        entity_type: &'static str,
        identifier: String,
    },

    #[error("Cloud not found: {id}")]
    CloudNotFound { id: String },

    #[error("A cloud with id {id:?} already exists")]
    CloudExists { id: String },

    // ── Operation errors ─────────────────────────────────────────────
    /// The cloud is pausing, or must be paused for this operation.
    #[error("Cloud is locked: {message}")]
    Locked { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("No codec for {mime:?}")]
    UnsupportedCodec { mime: String },

    // ── Upstream errors ──────────────────────────────────────────────
    #[error(transparent)]
    Api(#[from] wazigate_api::Error),

    #[error(transparent)]
    Mqtt(#[from] wazigate_mqtt::Error),

    // ── Storage & configuration ──────────────────────────────────────
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// HTTP-style status code for this error.
    pub fn code(&self) -> u16 {
        match self {
            Self::DeviceNotFound { .. } | Self::NotFound { .. } | Self::CloudNotFound { .. } => 404,
            Self::CloudExists { .. } => 409,
            Self::Locked { .. } => 423,
            Self::ValidationFailed { .. } => 400,
            Self::UnsupportedCodec { .. } => 415,
            Self::Api(e) => e.status().unwrap_or(502),
            Self::Mqtt(_) => 502,
            Self::Storage { .. } | Self::Io(_) | Self::Config { .. } | Self::Internal(_) => 500,
        }
    }

    /// Status of a failed cloud answer, `None` if the request never got one.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Api(e) => e.status(),
            _ => None,
        }
    }

    /// The cloud rejected our credentials or token.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::Api(e) if e.is_auth_error())
    }

    /// The cloud could not be reached at all.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Api(wazigate_api::Error::Transport(_)) | Self::Mqtt(_))
    }

    /// A local failure: missing entity, store or I/O error.
    pub fn is_local(&self) -> bool {
        !matches!(self, Self::Api(_) | Self::Mqtt(_))
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::validation(format!("invalid JSON: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_http_conventions() {
        assert_eq!(CoreError::DeviceNotFound { id: "d".into() }.code(), 404);
        assert_eq!(CoreError::CloudExists { id: "c".into() }.code(), 409);
        assert_eq!(
            CoreError::Locked {
                message: "pausing".into()
            }
            .code(),
            423
        );
        let api = CoreError::from(wazigate_api::Error::Api {
            status: 422,
            message: String::new(),
        });
        assert_eq!(api.code(), 422);
        assert_eq!(api.upstream_status(), Some(422));
        assert!(!api.is_local());
        assert!(CoreError::Internal("x".into()).is_local());
    }
}
