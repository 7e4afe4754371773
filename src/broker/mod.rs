//! The `broker` module is the CoAP protocol engine.
//!
//! - `transaction`: open exchanges, deduplication and token matching.
//! - `scheduler`: confirmable retransmission with exponential backoff.
//! - `router`: path and method dispatch to resource handlers.
//! - `resources`: the stored and collection handlers, and config-driven registration.
//! - `observe`: resource observation and notification bookkeeping.
//! - `engine`: the [`Broker`] itself, with its receive loop and lifecycle.

pub mod engine;
pub mod observe;
pub mod resources;
pub mod router;
pub mod scheduler;
pub mod transaction;

pub use engine::{Broker, LifecycleState};
pub use observe::{Observer, ObserverRegistry};
pub use resources::{CollectionResource, StoredResource, build_router};
pub use router::{
    HandlerError, MethodSet, Reply, Request, ResourceHandler, Router, RouterError, WELL_KNOWN_CORE,
};
pub use scheduler::{RetransmissionScheduler, TransmissionParams};
pub use transaction::{Role, Transaction, TransactionError, TransactionState, TransactionTable};
