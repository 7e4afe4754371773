//! Transaction table
//!
//! Tracks every open exchange, keyed by (peer, message ID) and, for the
//! exchanges the broker originates, by token. Message IDs are only used for
//! deduplication and the ACK/Reset layer; responses are correlated by token.
//!
//! Received and sent message IDs live in separate namespaces: a peer's
//! message ID 7 says nothing about the broker's own message ID 7 towards that
//! peer.
//!
//! The table is plain data. The broker keeps it behind a single mutex and the
//! retransmission scheduler only touches deadlines through the methods here.
//!
//! Dedup entries for received messages can be capped. When the cap is hit,
//! the entry closest to expiry makes room for the new one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::transport::{Message, Token};
use crate::utils::ExchangeError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("message id {message_id} already open with {peer}")]
    DuplicateMessageId { peer: SocketAddr, message_id: u16 },
    #[error("token {0} already in use")]
    DuplicateToken(Token),
}

/// Which end of the exchange the broker is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The broker sent the request.
    Originator,
    /// The broker received the request, or a separate response it has
    /// acknowledged. Only tracked for deduplication.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Request sent (or received), nothing heard back yet.
    Pending,
    /// Empty ACK received; still waiting for the separate response.
    Acknowledged,
    /// Matching response received.
    Completed,
    /// Retransmission budget exhausted.
    Failed,
}

pub type Completion = oneshot::Sender<Result<Message, ExchangeError>>;

#[derive(Debug)]
pub struct Transaction {
    pub peer: SocketAddr,
    pub message_id: u16,
    pub token: Token,
    pub role: Role,
    pub state: TransactionState,
    pub retransmissions: u8,
    /// When the next retransmission is due; `None` when nothing will be resent.
    pub next_deadline: Option<Instant>,
    /// Wait before the upcoming retransmission. Doubles after every resend.
    pub timeout: Duration,
    /// Entry is dropped by [`TransactionTable::sweep_expired`] once this passes.
    pub expires_at: Instant,
    /// Encoded request, kept for retransmission.
    pub request: Vec<u8>,
    /// Encoded response, kept so duplicates are answered without redispatch.
    pub response: Option<Vec<u8>>,
    completion: Option<Completion>,
}

impl Transaction {
    /// An outbound confirmable request awaiting ACK. The first retransmission is
    /// due `initial_timeout` from `now`.
    pub fn confirmable(
        peer: SocketAddr,
        message_id: u16,
        token: Token,
        request: Vec<u8>,
        initial_timeout: Duration,
        lifetime: Duration,
        now: Instant,
    ) -> Self {
        Self {
            peer,
            message_id,
            token,
            role: Role::Originator,
            state: TransactionState::Pending,
            retransmissions: 0,
            next_deadline: Some(now + initial_timeout),
            timeout: initial_timeout,
            expires_at: now + lifetime,
            request,
            response: None,
            completion: None,
        }
    }

    /// An outbound non-confirmable request: never retransmitted, only expires.
    pub fn non_confirmable(
        peer: SocketAddr,
        message_id: u16,
        token: Token,
        request: Vec<u8>,
        lifetime: Duration,
        now: Instant,
    ) -> Self {
        Self {
            peer,
            message_id,
            token,
            role: Role::Originator,
            state: TransactionState::Pending,
            retransmissions: 0,
            next_deadline: None,
            timeout: Duration::ZERO,
            expires_at: now + lifetime,
            request,
            response: None,
            completion: None,
        }
    }

    /// A received confirmable message, remembered for the dedup window.
    pub fn inbound(peer: SocketAddr, message_id: u16, token: Token, window: Duration, now: Instant) -> Self {
        Self {
            peer,
            message_id,
            token,
            role: Role::Responder,
            state: TransactionState::Pending,
            retransmissions: 0,
            next_deadline: None,
            timeout: Duration::ZERO,
            expires_at: now + window,
            request: Vec::new(),
            response: None,
            completion: None,
        }
    }

    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Empty ACK received: stop retransmitting and wait for the separate response.
    pub fn acknowledge(&mut self, lifetime: Duration, now: Instant) {
        self.state = TransactionState::Acknowledged;
        self.next_deadline = None;
        self.expires_at = now + lifetime;
    }

    /// Marks the transaction failed; the next sweep removes it.
    pub fn fail(&mut self) {
        self.state = TransactionState::Failed;
        self.next_deadline = None;
    }

    /// Hands the outcome to whoever is waiting on this exchange, if anyone.
    pub fn resolve(mut self, outcome: Result<Message, ExchangeError>) {
        self.state = match outcome {
            Ok(_) => TransactionState::Completed,
            Err(_) => TransactionState::Failed,
        };
        if let Some(completion) = self.completion.take() {
            // The requester may have given up already.
            let _ = completion.send(outcome);
        }
    }

    fn key(&self) -> Key {
        (self.role, self.peer, self.message_id)
    }
}

type Key = (Role, SocketAddr, u16);

#[derive(Debug, Default)]
pub struct TransactionTable {
    by_message_id: HashMap<Key, Transaction>,
    by_token: HashMap<Token, Key>,
    responders: usize,
    dedup_limit: Option<usize>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding at most `limit` responder entries.
    pub fn with_dedup_limit(limit: usize) -> Self {
        Self {
            dedup_limit: Some(limit.max(1)),
            ..Self::default()
        }
    }

    /// Inserts a transaction. Originated transactions are also indexed by token,
    /// which must be unique among open exchanges.
    pub fn open(&mut self, transaction: Transaction) -> Result<(), TransactionError> {
        let key = transaction.key();
        if self.by_message_id.contains_key(&key) {
            return Err(TransactionError::DuplicateMessageId {
                peer: transaction.peer,
                message_id: transaction.message_id,
            });
        }
        if transaction.role == Role::Originator {
            if self.by_token.contains_key(&transaction.token) {
                return Err(TransactionError::DuplicateToken(transaction.token.clone()));
            }
            self.by_token.insert(transaction.token.clone(), key);
        } else {
            if self.dedup_limit.is_some_and(|limit| self.responders >= limit) {
                self.evict_oldest_responder();
            }
            self.responders += 1;
        }
        self.by_message_id.insert(key, transaction);
        Ok(())
    }

    fn evict_oldest_responder(&mut self) {
        let oldest = self
            .by_message_id
            .iter()
            .filter(|(_, t)| t.role == Role::Responder)
            .min_by_key(|(_, t)| t.expires_at)
            .map(|(key, _)| *key);
        if let Some((role, peer, message_id)) = oldest {
            debug!(%peer, message_id, "dedup cache full, evicting oldest entry");
            self.close_by_message_id(role, peer, message_id);
        }
    }

    /// Originated transaction waiting for a response with this token.
    pub fn lookup(&self, token: &Token) -> Option<&Transaction> {
        self.by_token
            .get(token)
            .and_then(|key| self.by_message_id.get(key))
    }

    pub fn lookup_by_message_id(
        &self,
        role: Role,
        peer: SocketAddr,
        message_id: u16,
    ) -> Option<&Transaction> {
        self.by_message_id.get(&(role, peer, message_id))
    }

    pub fn lookup_by_message_id_mut(
        &mut self,
        role: Role,
        peer: SocketAddr,
        message_id: u16,
    ) -> Option<&mut Transaction> {
        self.by_message_id.get_mut(&(role, peer, message_id))
    }

    /// Remembers the encoded response to a received request so duplicates can
    /// be answered identically.
    pub fn record_response(&mut self, peer: SocketAddr, message_id: u16, response: Vec<u8>) {
        if let Some(transaction) = self.lookup_by_message_id_mut(Role::Responder, peer, message_id) {
            transaction.state = TransactionState::Completed;
            transaction.response = Some(response);
        }
    }

    /// Removes the originated transaction with this token.
    pub fn close(&mut self, token: &Token) -> Option<Transaction> {
        let key = self.by_token.remove(token)?;
        self.by_message_id.remove(&key)
    }

    /// Removes a transaction by message ID, whatever its role.
    pub fn close_by_message_id(
        &mut self,
        role: Role,
        peer: SocketAddr,
        message_id: u16,
    ) -> Option<Transaction> {
        let transaction = self.by_message_id.remove(&(role, peer, message_id))?;
        match role {
            Role::Originator => {
                self.by_token.remove(&transaction.token);
            }
            Role::Responder => self.responders -= 1,
        }
        Some(transaction)
    }

    /// Originated confirmable transactions whose retransmission deadline has passed.
    pub fn due_for_retransmission(&mut self, now: Instant) -> impl Iterator<Item = &mut Transaction> {
        self.by_message_id.values_mut().filter(move |t| {
            t.role == Role::Originator
                && t.state == TransactionState::Pending
                && t.next_deadline.is_some_and(|deadline| deadline <= now)
        })
    }

    /// Removes failed transactions and those past their lifetime.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<Transaction> {
        let expired: Vec<Key> = self
            .by_message_id
            .iter()
            .filter(|(_, t)| t.state == TransactionState::Failed || t.expires_at <= now)
            .map(|(key, _)| *key)
            .collect();

        expired
            .into_iter()
            .filter_map(|(role, peer, message_id)| self.close_by_message_id(role, peer, message_id))
            .collect()
    }

    /// Empties the table, e.g. on shutdown.
    pub fn drain(&mut self) -> Vec<Transaction> {
        self.by_token.clear();
        self.responders = 0;
        self.by_message_id.drain().map(|(_, t)| t).collect()
    }

    pub fn contains_token(&self, token: &Token) -> bool {
        self.by_token.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.by_message_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_message_id.is_empty()
    }

    /// Number of dedup entries for received messages.
    pub fn responder_count(&self) -> usize {
        self.responders
    }
}
