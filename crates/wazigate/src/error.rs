//! CLI error types with miette diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use wazigate_config::ConfigError;
use wazigate_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
    pub const BIND: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(
        code(wazigate::config),
        help("Inspect the effective settings with: wazigate config")
    )]
    Config(#[from] ConfigError),

    // ── Listeners ────────────────────────────────────────────────────
    #[error("Could not listen on {addr}")]
    #[diagnostic(
        code(wazigate::bind),
        help(
            "Another process may hold the port.\n\
             Change the address in the config file or its WAZIUP_*_ADDR variable;\n\
             an empty address disables that listener."
        )
    )]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not load TLS material from {path}: {reason}")]
    #[diagnostic(
        code(wazigate::tls),
        help("tls_crt must hold a PEM certificate chain and tls_key a PEM private key.")
    )]
    Tls { path: String, reason: String },

    // ── Gateway ──────────────────────────────────────────────────────
    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(code(wazigate::not_found))]
    NotFound {
        resource_type: String,
        identifier: String,
    },

    #[error(transparent)]
    #[diagnostic(code(wazigate::core))]
    Core(CoreError),

    // ── IO ───────────────────────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(ConfigError::Validation { .. }) => exit_code::USAGE,
            Self::Bind { .. } => exit_code::BIND,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Core(e) => match e.code() {
                400 => exit_code::USAGE,
                409 => exit_code::CONFLICT,
                _ => exit_code::GENERAL,
            },
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::CloudNotFound { id } => Self::NotFound {
                resource_type: "cloud".into(),
                identifier: id,
            },
            CoreError::DeviceNotFound { id } => Self::NotFound {
                resource_type: "device".into(),
                identifier: id,
            },
            other => Self::Core(other),
        }
    }
}
