use thiserror::Error;
use uuid::Uuid;

use crate::bag::BagError;
use crate::protocol::Command;
use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum HerdError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid job definition: {0}")]
    InvalidJob(String),

    #[error("Job {id} can't move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job store is full ({0} jobs)")]
    StoreFull(usize),

    #[error("Job journal entry could not be encoded: {0}")]
    Journal(#[from] serde_json::Error),

    #[error("Handshake refused: {0}")]
    HandshakeRefused(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HerdError>;

/// Failures of the wire codec and the framed transport. All of them are fatal
/// to the connection they occur on.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown command tag {0}")]
    UnknownCommand(u64),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame longer than {0} bytes")]
    FrameTooLong(usize),

    #[error("expected {expected} but received {got}")]
    Unexpected { expected: Command, got: Command },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("peer did not drain its outbox within {0:?}")]
    Stalled(std::time::Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("driver {0} not registered")]
    UnknownDriver(String),

    #[error("no {0} found in driver config")]
    MissingConfig(&'static str),

    #[error("invalid driver config: {0}")]
    Config(#[from] BagError),

    #[error("invalid environment assignment {0:?}, expected KEY=VALUE")]
    InvalidEnv(String),

    #[error("job {0} is already executing")]
    AlreadyRunning(Uuid),

    #[error("job {0} is not executing")]
    NotRunning(Uuid),

    #[error("failed to spawn process: {0}")]
    Spawn(std::io::Error),

    #[error("process interrupted ({0})")]
    Interrupted(String),

    #[error("process exited unsuccessfully ({0})")]
    ExitStatus(String),

    #[error("failed to signal process: {0}")]
    Signal(String),

    #[error("exception while running job: {0}")]
    Panicked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
