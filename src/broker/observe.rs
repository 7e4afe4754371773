//! Observer registry (RFC 7641)
//!
//! A client observes a resource by sending GET with Observe 0. The broker
//! remembers the peer and token, and after every successful change to that
//! path sends the current state as a non-confirmable notification carrying
//! the same token and an increasing Observe sequence number.
//!
//! An observation ends when the client deregisters (Observe 1), answers a
//! notification with Reset, or the resource stops existing.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::transport::Token;

/// Observe sequence numbers are 24 bits wide.
const SEQUENCE_MASK: u32 = 0xFF_FFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observer {
    pub peer: SocketAddr,
    pub token: Token,
    pub path: String,
    /// Message ID of the last notification, so a Reset to it can be matched.
    pub last_message_id: Option<u16>,
}

#[derive(Debug)]
pub struct ObserverRegistry {
    observers: HashMap<(SocketAddr, Token), Observer>,
    capacity: usize,
    sequence: u32,
}

impl ObserverRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            observers: HashMap::new(),
            capacity,
            sequence: 0,
        }
    }

    /// Registers `peer`/`token` as an observer of `path`, replacing an earlier
    /// registration with the same token. Returns false when the registry is
    /// full.
    pub fn register(&mut self, peer: SocketAddr, token: Token, path: &str) -> bool {
        let key = (peer, token);
        if !self.observers.contains_key(&key) && self.observers.len() >= self.capacity {
            return false;
        }
        let observer = Observer {
            peer,
            token: key.1.clone(),
            path: path.to_string(),
            last_message_id: None,
        };
        self.observers.insert(key, observer);
        true
    }

    pub fn deregister(&mut self, peer: SocketAddr, token: &Token) -> Option<Observer> {
        self.observers.remove(&(peer, token.clone()))
    }

    /// Everyone observing `path`, as (peer, token) pairs.
    pub fn observers_of(&self, path: &str) -> Vec<(SocketAddr, Token)> {
        self.observers
            .values()
            .filter(|o| o.path == path)
            .map(|o| (o.peer, o.token.clone()))
            .collect()
    }

    pub fn record_notification(&mut self, peer: SocketAddr, token: &Token, message_id: u16) {
        if let Some(observer) = self.observers.get_mut(&(peer, token.clone())) {
            observer.last_message_id = Some(message_id);
        }
    }

    /// Drops the observation whose last notification `peer` answered with Reset.
    pub fn cancel_by_message_id(&mut self, peer: SocketAddr, message_id: u16) -> Option<Observer> {
        let key = self
            .observers
            .iter()
            .find(|(_, o)| o.peer == peer && o.last_message_id == Some(message_id))
            .map(|(key, _)| key.clone())?;
        self.observers.remove(&key)
    }

    /// Next notification sequence number, wrapping at 24 bits.
    pub fn next_sequence(&mut self) -> u32 {
        self.sequence = (self.sequence + 1) & SEQUENCE_MASK;
        self.sequence
    }

    pub fn clear(&mut self) {
        self.observers.clear();
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}
