//! Crate-wide error type and the wire-level error kind it maps to.

use std::io;
use thiserror::Error;

/// Error kinds surfaced to clients on the wire (§7 of the spec).
///
/// `kind()` on [`NexaError`] maps every variant onto one of these so the
/// binary protocol layer can fill in an `ERROR` response's `kind` field
/// without matching on the full error enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadFrame,
    BadPayload,
    BadQuery,
    BadVector,
    NotFound,
    Duplicate,
    Unauthorized,
    WriteFailed,
    StorageDegraded,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadFrame => "BAD_FRAME",
            ErrorKind::BadPayload => "BAD_PAYLOAD",
            ErrorKind::BadQuery => "BAD_QUERY",
            ErrorKind::BadVector => "BAD_VECTOR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Duplicate => "DUPLICATE",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::WriteFailed => "WRITE_FAILED",
            ErrorKind::StorageDegraded => "STORAGE_DEGRADED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

#[derive(Error, Debug)]
pub enum NexaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bad frame: {0}")]
    BadFrame(String),

    #[error("bad payload: {0}")]
    BadPayload(String),

    #[error("bad query: {0}")]
    BadQuery(String),

    #[error("bad vector: {0}")]
    BadVector(String),

    #[error("key not found")]
    NotFound,

    #[error("document already exists: {0}")]
    Duplicate(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("storage degraded: {0}")]
    StorageDegraded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, NexaError>;

impl NexaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NexaError::Io(_) => ErrorKind::Internal,
            NexaError::BadFrame(_) => ErrorKind::BadFrame,
            NexaError::BadPayload(_) => ErrorKind::BadPayload,
            NexaError::BadQuery(_) => ErrorKind::BadQuery,
            NexaError::BadVector(_) => ErrorKind::BadVector,
            NexaError::NotFound => ErrorKind::NotFound,
            NexaError::Duplicate(_) => ErrorKind::Duplicate,
            NexaError::Unauthorized => ErrorKind::Unauthorized,
            NexaError::WriteFailed(_) => ErrorKind::WriteFailed,
            NexaError::StorageDegraded(_) => ErrorKind::StorageDegraded,
            NexaError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<rmp_serde::encode::Error> for NexaError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        NexaError::Internal(format!("msgpack encode: {e}"))
    }
}

impl From<rmp_serde::decode::Error> for NexaError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        NexaError::BadPayload(format!("msgpack decode: {e}"))
    }
}
