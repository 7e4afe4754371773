//! Retransmission scheduler
//!
//! Walks the transaction table on every tick, resends confirmable requests
//! whose deadline passed and fails those that ran out of retries. The
//! scheduler never touches the socket: it hands back what should be sent and
//! the transactions that ended, and the broker does the I/O after releasing
//! the table lock.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use crate::broker::transaction::{Transaction, TransactionTable};
use crate::config::TransmissionSettings;

/// Reliability parameters of the message layer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionParams {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u8,
    pub exchange_lifetime: Duration,
    pub non_lifetime: Duration,
    pub tick_interval: Duration,
    /// Capacity of the dedup cache for received messages.
    pub max_dedup_entries: usize,
}

impl Default for TransmissionParams {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            exchange_lifetime: Duration::from_secs(247),
            non_lifetime: Duration::from_secs(145),
            tick_interval: Duration::from_millis(100),
            max_dedup_entries: 4096,
        }
    }
}

impl From<&TransmissionSettings> for TransmissionParams {
    fn from(settings: &TransmissionSettings) -> Self {
        Self {
            ack_timeout: Duration::from_millis(settings.ack_timeout_ms),
            ack_random_factor: settings.ack_random_factor,
            max_retransmit: settings.max_retransmit,
            exchange_lifetime: Duration::from_secs(settings.exchange_lifetime_secs),
            non_lifetime: Duration::from_secs(settings.non_lifetime_secs),
            tick_interval: Duration::from_millis(settings.tick_interval_ms),
            max_dedup_entries: settings.max_dedup_entries,
        }
    }
}

impl TransmissionParams {
    /// First retransmission timeout of a new exchange: `ack_timeout` scaled by a
    /// random factor in `[1, ack_random_factor]`. Later timeouts double this value.
    pub fn initial_timeout(&self) -> Duration {
        let factor = if self.ack_random_factor > 1.0 {
            rand::thread_rng().gen_range(1.0..=self.ack_random_factor)
        } else {
            1.0
        };
        self.ack_timeout.mul_f64(factor)
    }
}

/// What one scheduler tick decided.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Encoded messages to resend, with their destination.
    pub retransmit: Vec<(SocketAddr, Vec<u8>)>,
    /// Transactions removed from the table: retries exhausted or lifetime over.
    pub expired: Vec<Transaction>,
}

#[derive(Debug, Clone)]
pub struct RetransmissionScheduler {
    max_retransmit: u8,
}

impl RetransmissionScheduler {
    pub fn new(params: &TransmissionParams) -> Self {
        Self {
            max_retransmit: params.max_retransmit,
        }
    }

    /// Advances every due transaction. A transaction that already used
    /// `max_retransmit` retries is failed instead of resent; its waiter sees a
    /// timeout once the broker resolves the expired list.
    pub fn tick(&self, table: &mut TransactionTable, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        for transaction in table.due_for_retransmission(now) {
            if transaction.retransmissions >= self.max_retransmit {
                debug!(
                    peer = %transaction.peer,
                    message_id = transaction.message_id,
                    "retransmissions exhausted"
                );
                transaction.fail();
                continue;
            }

            transaction.retransmissions += 1;
            transaction.timeout *= 2;
            transaction.next_deadline = Some(now + transaction.timeout);
            debug!(
                peer = %transaction.peer,
                message_id = transaction.message_id,
                attempt = transaction.retransmissions,
                "retransmitting"
            );
            outcome
                .retransmit
                .push((transaction.peer, transaction.request.clone()));
        }

        outcome.expired = table.sweep_expired(now);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::transaction::{Role, TransactionState};
    use crate::transport::Token;

    fn params() -> TransmissionParams {
        TransmissionParams {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.0,
            max_retransmit: 4,
            ..Default::default()
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5683))
    }

    fn open_confirmable(table: &mut TransactionTable, params: &TransmissionParams, now: Instant) {
        table
            .open(Transaction::confirmable(
                peer(),
                42,
                Token::new(vec![1, 2]).unwrap(),
                vec![0x40, 0x01, 0x00, 0x2A],
                params.initial_timeout(),
                params.exchange_lifetime,
                now,
            ))
            .unwrap();
    }

    #[test]
    fn test_initial_timeout_within_jitter_bounds() {
        let params = TransmissionParams::default();
        for _ in 0..100 {
            let timeout = params.initial_timeout();
            assert!(timeout >= Duration::from_secs(2));
            assert!(timeout <= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_params_from_settings() {
        let settings = crate::config::Settings::default();
        let params = TransmissionParams::from(&settings.transmission);
        assert_eq!(params, TransmissionParams::default());
    }

    #[test]
    fn test_nothing_due_before_deadline() {
        let params = params();
        let scheduler = RetransmissionScheduler::new(&params);
        let mut table = TransactionTable::new();
        let start = Instant::now();
        open_confirmable(&mut table, &params, start);

        let outcome = scheduler.tick(&mut table, start + Duration::from_millis(1999));

        assert!(outcome.retransmit.is_empty());
        assert!(outcome.expired.is_empty());
    }

    #[test]
    fn test_exponential_backoff_then_failure() {
        let params = params();
        let scheduler = RetransmissionScheduler::new(&params);
        let mut table = TransactionTable::new();
        let start = Instant::now();
        open_confirmable(&mut table, &params, start);

        // Deadlines at 2, 2+4, 6+8, 14+16 seconds; the fifth timeout (32s) fails it.
        let mut now = start;
        for (attempt, wait) in [2u64, 4, 8, 16].into_iter().enumerate() {
            now += Duration::from_secs(wait);
            let outcome = scheduler.tick(&mut table, now);
            assert_eq!(outcome.retransmit.len(), 1, "attempt {attempt}");
            assert_eq!(outcome.retransmit[0].0, peer());
            assert_eq!(outcome.retransmit[0].1, vec![0x40, 0x01, 0x00, 0x2A]);

            let transaction = table.lookup_by_message_id(Role::Originator, peer(), 42).unwrap();
            assert_eq!(transaction.retransmissions as usize, attempt + 1);
            assert_eq!(transaction.timeout, Duration::from_secs(wait * 2));
        }

        now += Duration::from_secs(32);
        let outcome = scheduler.tick(&mut table, now);
        assert!(outcome.retransmit.is_empty());
        assert_eq!(outcome.expired.len(), 1);
        assert_eq!(outcome.expired[0].state, TransactionState::Failed);
        assert!(table.is_empty());
    }

    #[test]
    fn test_acknowledged_transaction_is_not_resent() {
        let params = params();
        let scheduler = RetransmissionScheduler::new(&params);
        let mut table = TransactionTable::new();
        let start = Instant::now();
        open_confirmable(&mut table, &params, start);
        table
            .lookup_by_message_id_mut(Role::Originator, peer(), 42)
            .unwrap()
            .acknowledge(params.exchange_lifetime, start);

        let outcome = scheduler.tick(&mut table, start + Duration::from_secs(60));

        assert!(outcome.retransmit.is_empty());
        assert!(outcome.expired.is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_dedup_entries_expire_after_window() {
        let params = params();
        let scheduler = RetransmissionScheduler::new(&params);
        let mut table = TransactionTable::new();
        let start = Instant::now();
        table
            .open(Transaction::inbound(
                peer(),
                7,
                Token::empty(),
                params.exchange_lifetime,
                start,
            ))
            .unwrap();

        assert!(scheduler.tick(&mut table, start + Duration::from_secs(246)).expired.is_empty());
        let outcome = scheduler.tick(&mut table, start + Duration::from_secs(247));
        assert_eq!(outcome.expired.len(), 1);
        assert!(table.is_empty());
    }
}
