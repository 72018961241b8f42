//! Typed errors surfaced by the library.
//!
//! Orchestration code (the session driver, the listen loop, background jobs)
//! works in `anyhow::Result`; these enums cover the places where callers
//! need to match on what went wrong.

use thiserror::Error;

/// Configuration problems detected before any connection is attempted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no API key configured (set EVALLINK_API_KEY or pass --api-key)")]
    MissingApiKey,

    #[error("invalid base path '{base_path}': {reason}")]
    InvalidBasePath { base_path: String, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// A frame that could not be turned into an envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame data has no 'type' field")]
    MissingType,

    #[error("invalid '{kind}' message: {source}")]
    InvalidMessage {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures talking to the result collaborator.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("cannot build request url from {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}
