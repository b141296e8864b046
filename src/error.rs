use thiserror::Error;

use crate::protocol::CodecError;

#[derive(Error, Debug)]
pub enum GearError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Server error {code}: {message}")]
    Server { code: String, message: String },

    #[error("No servers configured")]
    NoAgents,

    #[error("No functions registered")]
    NoFuncs,

    #[error("Function already registered: {0}")]
    FuncExists(String),

    #[error("Function not registered: {0}")]
    FuncMissing(String),

    #[error("Executing timed out")]
    TimedOut,

    #[error("Timed out waiting for job creation")]
    ResponseTimeout,

    #[error("Connection lost to {addr}")]
    Disconnected { addr: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GearError>;
