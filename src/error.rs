//! Error types for quorumq.

use thiserror::Error;

use crate::coordination::CoordinationError;
use crate::model::Operation;

#[derive(Debug, Error)]
pub enum Error {
    #[error("queue is closed, cannot {0}")]
    Closed(Operation),

    #[error("queue is not ready, cannot {0}")]
    NotReady(Operation),

    #[error("{operation} reached {acknowledged} of {required} required replicas")]
    Quorum {
        operation: Operation,
        required: usize,
        acknowledged: usize,
    },

    #[error("no available replica")]
    NoReplicaAvailable,

    #[error("cannot determine queue size: no replica reachable")]
    SizeUnavailable,

    #[error("items must not be empty")]
    EmptyItem,

    #[error("lock error: {0}")]
    Lock(#[from] CoordinationError),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
