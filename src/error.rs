use std::path::PathBuf;

use thiserror::Error;

use crate::types::ProtocolClass;

/// A candidate list could not be obtained for a protocol class.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{class} list request to {url} failed: {source}")]
    Request {
        class: ProtocolClass,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{class} list at {url} returned status {status}")]
    Status {
        class: ProtocolClass,
        url: String,
        status: u16,
    },
    #[error("{class} list file {} could not be read: {source}", path.display())]
    Read {
        class: ProtocolClass,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no list configured for {0}")]
    NotConfigured(ProtocolClass),
}

/// Transport-level failure of a single probe attempt.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid proxy {proxy}: {source}")]
    InvalidProxy {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to build probe client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request through {proxy} timed out")]
    Timeout { proxy: String },
    #[error("request through {proxy} failed: {source}")]
    Transport {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },
}

/// A verified address could not be written to, or cleared from, its destination.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("no output destination configured for {0}")]
    NoDestination(ProtocolClass),
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
