//! The `error` module defines the broker-level error types.
//!
//! Decode, storage and routing errors live next to the code that raises them;
//! [`BrokerError`] collects whatever can escape a public broker call.

use thiserror::Error;

use crate::broker::{LifecycleState, RouterError, TransactionError};
use crate::persistence::StorageError;
use crate::transport::Code;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("broker cannot run from the {0:?} state")]
    InvalidState(LifecycleState),
    #[error("broker is not running")]
    NotRunning,
    #[error("{0} is not a request code")]
    NotARequest(Code),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("router error: {0}")]
    Router(#[from] RouterError),
}

/// How an outbound exchange ended without a response.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("exchange timed out")]
    Timeout,
    #[error("peer reset the exchange")]
    Reset,
    #[error("broker stopped before the exchange completed")]
    Cancelled,
}
