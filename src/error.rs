use std::io;
use thiserror::Error;

/// Unified gateway error type.
///
/// Startup-stage variants (`Config`, `MalformedUrl`, `UnknownScheme`,
/// `Factory`, `Listen`) are fatal: main logs them and exits non-zero.
/// Everything else is per-connection and only ever logged.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration document missing, unreadable or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration URL failed to parse
    #[error("malformed URL '{url}': {source}")]
    MalformedUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// URL scheme has no registered protocol factory
    #[error("unknown {kind} scheme '{scheme}'")]
    UnknownScheme {
        /// "server" or "client"
        kind: &'static str,
        scheme: String,
    },

    /// A protocol factory rejected its configuration URL
    #[error("factory for scheme '{scheme}' failed: {cause}")]
    Factory { scheme: String, cause: anyhow::Error },

    /// Cannot bind the front-end listen address
    #[error("cannot listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Front-end or back-end protocol negotiation failed
    #[error("{side} handshake with {peer} failed: {cause}")]
    Handshake {
        /// "local" or "remote"
        side: &'static str,
        peer: String,
        cause: anyhow::Error,
    },

    /// Cannot reach the chosen back-end endpoint
    #[error("cannot dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Dispatcher stage the error belongs to, used as a structured log field.
    pub fn stage(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::MalformedUrl { .. } | Error::UnknownScheme { .. } | Error::Factory { .. } => {
                "resolve"
            }
            Error::Listen { .. } => "listen",
            Error::Handshake { side, .. } => {
                if *side == "local" {
                    "local-handshake"
                } else {
                    "remote-handshake"
                }
            }
            Error::Dial { .. } => "dial",
        }
    }
}
