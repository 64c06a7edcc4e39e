//! Error types for replistore

use crate::common::protocol;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    // === Protocol Errors ===
    #[error("Malformed message: {0}")]
    Protocol(String),

    #[error("Unexpected reply from {peer}: {line}")]
    UnexpectedReply { peer: String, line: String },

    // === Admission Errors ===
    #[error("Not enough dstores: need {needed}, have {available}")]
    NotEnoughDstores { needed: usize, available: usize },

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("File does not exist: {0}")]
    FileDoesNotExist(String),

    #[error("Load failed on every replica of {0}")]
    LoadExhausted(String),

    #[error("Request rejected by controller: {0}")]
    Rejected(String),

    // === Quorum Errors ===
    #[error("Quorum not reached for {token}: {received}/{expected}")]
    QuorumNotReached {
        token: String,
        expected: usize,
        received: usize,
    },

    #[error("Wait already outstanding for token {0}")]
    DuplicateWait(String),

    // === Node Errors ===
    #[error("Dstore {0} failed")]
    NodeFailed(u16),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wire token reported to a client for admission errors.
    pub fn wire_token(&self) -> Option<&'static str> {
        match self {
            Error::NotEnoughDstores { .. } => Some(protocol::ERROR_NOT_ENOUGH_DSTORES),
            Error::FileAlreadyExists(_) => Some(protocol::ERROR_FILE_ALREADY_EXISTS),
            Error::FileDoesNotExist(_) => Some(protocol::ERROR_FILE_DOES_NOT_EXIST),
            Error::LoadExhausted(_) => Some(protocol::ERROR_LOAD),
            _ => None,
        }
    }

    /// Client-side reading of an error token sent in reply to a request on `name`.
    pub fn from_wire_token(token: &str, name: &str) -> Option<Self> {
        match token {
            protocol::ERROR_NOT_ENOUGH_DSTORES => Some(Error::Rejected(token.to_string())),
            protocol::ERROR_FILE_ALREADY_EXISTS => Some(Error::FileAlreadyExists(name.to_string())),
            protocol::ERROR_FILE_DOES_NOT_EXIST => Some(Error::FileDoesNotExist(name.to_string())),
            protocol::ERROR_LOAD => Some(Error::LoadExhausted(name.to_string())),
            _ => None,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
