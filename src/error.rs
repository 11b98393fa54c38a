//! Unified error type for the monitoring pipeline.
//!
//! `Error` is returned by every fallible component boundary (capture sources,
//! scanner, prober, history store, settings). Faults that the pipeline
//! survives are turned into a [`FaultRecord`] and kept in the pipeline stats,
//! so they show up in published snapshots as `{ "kind", "message", "at" }`.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Pipeline-level error.
///
/// Each variant maps to a distinct failure domain. Only `Config` is fatal at
/// startup; the others are isolated to the component that raised them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The packet-capture facility failed (device gone, read error).
    #[error("{0}")]
    Capture(String),

    /// A packet could not be normalized into a flow event.
    #[error(transparent)]
    Parse(#[from] crate::capture::ParseError),

    /// The network scanner failed, timed out, or produced unusable output.
    #[error("{0}")]
    Scan(String),

    /// A probe could not be issued (not a timeout; timeouts are loss samples).
    #[error("{0}")]
    Probe(String),

    /// Invalid or unreadable settings.
    #[error("{0}")]
    Config(String),

    /// Errors originating from the SQLite history store.
    #[error("{0}")]
    Database(String),

    /// I/O and OS-level errors (subprocess spawn, filesystem).
    #[error("{0}")]
    Io(String),
}

impl Error {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Capture(_) => "Capture",
            Error::Parse(_) => "Parse",
            Error::Scan(_) => "Scan",
            Error::Probe(_) => "Probe",
            Error::Config(_) => "Config",
            Error::Database(_) => "Database",
            Error::Io(_) => "Io",
        }
    }
}

/// A survived fault, as reported in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultRecord {
    pub kind: &'static str,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl FaultRecord {
    pub fn new(err: &Error, at: DateTime<Utc>) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            at,
        }
    }
}

// ---- From implementations for ergonomic error conversion ----

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Io(format!("{err:#}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
