use std::io;

use thiserror::Error;
use transport::BusError;

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to start worker thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    #[error("run loop {0} is not running")]
    LoopStopped(String),

    #[error("service registration failed: {0}")]
    Registration(#[source] BusError),

    #[error("service lookup failed: {0}")]
    Lookup(#[source] BusError),

    #[error("signal match registration failed: {0}")]
    Match(#[source] BusError),

    #[error("node object construction failed: {0}")]
    Create(String),

    #[error("relayed message on {0} was dropped before its handler ran")]
    RelayAbandoned(String),

    #[error("node was already initialized")]
    AlreadyInitialized,
}

impl NodeError {
    pub fn create(msg: impl Into<String>) -> Self {
        NodeError::Create(msg.into())
    }
}
