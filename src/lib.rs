//! # fogcoap
//!
//! `fogcoap` is a CoAP broker for fog devices. Sensors and actuators exchange
//! small binary CoAP messages with it over UDP, and it persists and serves
//! resource state through a pluggable storage adapter.
//!
//! ## Core Modules
//!
//! - `transport`: the CoAP message model and the binary wire codec.
//! - `broker`: transaction table, retransmission scheduler, resource router
//!   and the broker loop with its run/stop lifecycle.
//! - `persistence`: the storage adapter interface and a `sled` document store.
//! - `config`: layered configuration from defaults, files and the environment.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
