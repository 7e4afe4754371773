//! Broker engine
//!
//! [`Broker`] owns the UDP socket and runs a single receive loop. Every
//! datagram is decoded, deduplicated against the transaction table and then
//! dispatched to the router (requests), matched to an open exchange
//! (responses, ACKs, Resets) or answered with Reset. Handlers run on the
//! blocking pool. A separate task ticks the retransmission scheduler.
//!
//! Shared state sits behind one mutex that is never held across an await.
//! Once shutdown is requested no new exchange is opened, and every pending
//! one is resolved as cancelled when the socket is released.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::broker::observe::ObserverRegistry;
use crate::broker::router::Router;
use crate::broker::scheduler::{RetransmissionScheduler, TransmissionParams};
use crate::broker::transaction::{Role, Transaction, TransactionState, TransactionTable};
use crate::config::Settings;
use crate::transport::{Code, Message, MessageType, Method, Token, decode, encode};
use crate::utils::{BrokerError, ExchangeError};

/// Large enough for any UDP payload.
const RECV_BUFFER_LEN: usize = 65_535;

/// Lifecycle of a [`Broker`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// State shared by the receive loop, the retransmission ticker and outbound
/// requests. Always locked briefly and never across an await or a storage call.
struct Exchanges {
    table: TransactionTable,
    scheduler: RetransmissionScheduler,
    observers: ObserverRegistry,
    next_message_id: u16,
}

impl Exchanges {
    /// Next message ID not already used by an open exchange towards `peer`.
    fn allocate_message_id(&mut self, peer: SocketAddr) -> u16 {
        for _ in 0..=u16::MAX {
            let id = self.next_message_id;
            self.next_message_id = id.wrapping_add(1);
            if self
                .table
                .lookup_by_message_id(Role::Originator, peer, id)
                .is_none()
            {
                return id;
            }
        }
        // Every ID is taken; opening the transaction reports the clash.
        self.next_message_id
    }

    fn allocate_token(&self) -> Token {
        loop {
            let token = Token::random();
            if !self.table.contains_token(&token) {
                return token;
            }
        }
    }
}

/// The CoAP broker: owns the datagram socket, the transaction table, the
/// retransmission scheduler and the resource router.
///
/// `run()` drives everything until `stop()` (or `request_stop()`) is called
/// from another task. Both take `&self`, so a broker is usually shared as
/// `Arc<Broker>`.
pub struct Broker {
    host: String,
    port: u16,
    params: TransmissionParams,
    router: Arc<Router>,
    exchanges: Arc<Mutex<Exchanges>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    shutdown: CancellationToken,
    state: watch::Sender<LifecycleState>,
    started: AtomicBool,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state())
            .field("router", &self.router)
            .finish()
    }
}

impl Broker {
    pub fn new(settings: &Settings, router: Router) -> Self {
        let params = TransmissionParams::from(&settings.transmission);
        let exchanges = Exchanges {
            table: TransactionTable::with_dedup_limit(params.max_dedup_entries),
            scheduler: RetransmissionScheduler::new(&params),
            observers: ObserverRegistry::new(settings.server.max_observers),
            next_message_id: rand::random(),
        };
        let (state, _) = watch::channel(LifecycleState::Created);

        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            params,
            router: Arc::new(router),
            exchanges: Arc::new(Mutex::new(exchanges)),
            socket: Mutex::new(None),
            shutdown: CancellationToken::new(),
            state,
            started: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Subscribes to lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Address the socket is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket().and_then(|socket| socket.local_addr().ok())
    }

    /// Binds the socket and serves datagrams until stopped.
    ///
    /// Fails immediately if the socket cannot be bound. Receive errors and
    /// malformed datagrams are logged and skipped. A broker runs at most once.
    pub async fn run(&self) -> Result<(), BrokerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::InvalidState(self.state()));
        }
        if self.shutdown.is_cancelled() {
            self.state.send_replace(LifecycleState::Stopped);
            return Ok(());
        }

        let socket = match UdpSocket::bind((self.host.as_str(), self.port)).await {
            Ok(socket) => Arc::new(socket),
            Err(source) => {
                let addr = format!("{}:{}", self.host, self.port);
                error!(%addr, error = %source, "failed to bind");
                self.state.send_replace(LifecycleState::Stopped);
                return Err(BrokerError::Bind { addr, source });
            }
        };
        *lock(&self.socket) = Some(Arc::clone(&socket));
        let mut guard = RunGuard {
            broker: self,
            ticker: None,
        };

        // stop() raced with the bind
        if self.shutdown.is_cancelled() {
            drop(socket);
            return Ok(());
        }

        guard.ticker = Some(tokio::spawn(retransmit_loop(
            Arc::clone(&self.exchanges),
            Arc::clone(&socket),
            self.params.tick_interval,
            self.shutdown.clone(),
        )));
        self.state.send_replace(LifecycleState::Running);
        info!(addr = ?socket.local_addr().ok(), "broker running");

        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            let (len, peer) = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(error = %err, "receive failed");
                        continue;
                    }
                },
            };
            self.handle_datagram(&socket, &buf[..len], peer).await;
        }

        self.state.send_replace(LifecycleState::Stopping);
        info!("broker stopping");
        if let Some(ticker) = guard.ticker.take() {
            if let Err(err) = ticker.await {
                warn!(error = %err, "retransmission task ended abnormally");
            }
        }
        drop(socket);
        drop(guard);
        Ok(())
    }

    /// Stops the broker and waits until the socket is released. Idempotent,
    /// and safe to call before, during or after `run()`.
    pub async fn stop(&self) {
        self.request_stop();
        let mut state = self.state.subscribe();
        // The sender lives in `self`, so this only ends on Stopped.
        let _ = state.wait_for(|s| *s == LifecycleState::Stopped).await;
    }

    /// Asks a running broker to stop without waiting for it.
    pub fn request_stop(&self) {
        self.shutdown.cancel();
        if !self.started.load(Ordering::SeqCst) {
            self.state.send_if_modified(|state| {
                if *state == LifecycleState::Created {
                    *state = LifecycleState::Stopped;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Sends a request to `peer` and waits for its response.
    ///
    /// The message ID and token are assigned here. Confirmable requests are
    /// retransmitted until acknowledged; a non-confirmable request is sent once
    /// and times out after the non-confirmable lifetime.
    pub async fn request(&self, peer: SocketAddr, mut message: Message) -> Result<Message, BrokerError> {
        if !message.code.is_request() {
            return Err(BrokerError::NotARequest(message.code));
        }
        let socket = self.socket().ok_or(BrokerError::NotRunning)?;
        if message.mtype != MessageType::NonConfirmable {
            message.mtype = MessageType::Confirmable;
        }

        let (completion, outcome) = oneshot::channel();
        let bytes = {
            let mut exchanges = lock(&self.exchanges);
            // release() drains the table after cancelling, under this lock
            if self.shutdown.is_cancelled() {
                return Err(BrokerError::NotRunning);
            }
            message.message_id = exchanges.allocate_message_id(peer);
            message.token = exchanges.allocate_token();
            let bytes = encode(&message);
            let now = Instant::now();
            let transaction = match message.mtype {
                MessageType::NonConfirmable => Transaction::non_confirmable(
                    peer,
                    message.message_id,
                    message.token.clone(),
                    bytes.clone(),
                    self.params.non_lifetime,
                    now,
                ),
                _ => Transaction::confirmable(
                    peer,
                    message.message_id,
                    message.token.clone(),
                    bytes.clone(),
                    self.params.initial_timeout(),
                    self.params.exchange_lifetime,
                    now,
                ),
            };
            exchanges.table.open(transaction.with_completion(completion))?;
            bytes
        };

        debug!(
            %peer,
            message_id = message.message_id,
            token = %message.token,
            code = %message.code,
            "sending request"
        );
        if let Err(err) = socket.send_to(&bytes, peer).await {
            lock(&self.exchanges).table.close(&message.token);
            return Err(err.into());
        }
        drop(socket);

        match outcome.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ExchangeError::Cancelled.into()),
        }
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        lock(&self.socket).clone()
    }

    async fn handle_datagram(&self, socket: &UdpSocket, bytes: &[u8], peer: SocketAddr) {
        let message = match decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                debug!(%peer, error = %err, len = bytes.len(), "dropping malformed datagram");
                return;
            }
        };
        trace!(
            %peer,
            kind = ?message.mtype,
            code = %message.code,
            message_id = message.message_id,
            token = %message.token,
            "datagram received"
        );

        match message.mtype {
            MessageType::Confirmable | MessageType::NonConfirmable => {
                if message.code.is_empty() {
                    if message.mtype == MessageType::Confirmable {
                        debug!(%peer, message_id = message.message_id, "ping");
                        send(socket, &encode(&Message::reset(message.message_id)), peer).await;
                    }
                    return;
                }
                if message.mtype == MessageType::Confirmable && self.replay_duplicate(socket, &message, peer).await {
                    return;
                }
                if message.code.is_request() {
                    self.handle_request(socket, message, peer).await;
                } else if message.code.is_response() {
                    self.handle_separate_response(socket, message, peer).await;
                } else if message.mtype == MessageType::Confirmable {
                    debug!(%peer, code = %message.code, "rejecting reserved code");
                    send(socket, &encode(&Message::reset(message.message_id)), peer).await;
                }
            }
            MessageType::Acknowledgement => self.handle_ack(message, peer),
            MessageType::Reset => self.handle_reset(&message, peer),
        }
    }

    /// Answers a repeated confirmable message from the dedup cache. Returns
    /// false if the message is new.
    async fn replay_duplicate(&self, socket: &UdpSocket, message: &Message, peer: SocketAddr) -> bool {
        let cached = lock(&self.exchanges)
            .table
            .lookup_by_message_id(Role::Responder, peer, message.message_id)
            .map(|transaction| transaction.response.clone());

        match cached {
            None => false,
            Some(Some(response)) => {
                debug!(%peer, message_id = message.message_id, "duplicate, replaying response");
                send(socket, &response, peer).await;
                true
            }
            Some(None) => {
                debug!(%peer, message_id = message.message_id, "duplicate of request in progress");
                true
            }
        }
    }

    async fn handle_request(&self, socket: &UdpSocket, request: Message, peer: SocketAddr) {
        let confirmable = request.mtype == MessageType::Confirmable;
        let message_id = request.message_id;
        let token = request.token.clone();
        let method = Method::from_code(request.code);
        let observe = request.observe();
        let path = request.uri_path();

        if confirmable {
            let inbound = Transaction::inbound(
                peer,
                message_id,
                token.clone(),
                self.params.exchange_lifetime,
                Instant::now(),
            );
            if let Err(err) = lock(&self.exchanges).table.open(inbound) {
                warn!(%peer, error = %err, "could not track request");
            }
        }

        let router = Arc::clone(&self.router);
        let mut response = match tokio::task::spawn_blocking(move || router.dispatch(&request)).await {
            Ok(response) => response,
            Err(err) => {
                error!(%peer, message_id, error = %err, "request handler failed");
                Message::response(Code::INTERNAL_SERVER_ERROR)
            }
        };

        if confirmable {
            response.mtype = MessageType::Acknowledgement;
            response.message_id = message_id;
        } else {
            response.mtype = MessageType::NonConfirmable;
            response.message_id = lock(&self.exchanges).allocate_message_id(peer);
        }
        response.token = token.clone();

        if method == Some(Method::Get) && observe.is_some() {
            self.update_observation(&mut response, observe, peer, token, &path);
        }

        let bytes = encode(&response);
        if confirmable {
            lock(&self.exchanges)
                .table
                .record_response(peer, message_id, bytes.clone());
        }
        debug!(%peer, message_id, code = %response.code, "response");
        send(socket, &bytes, peer).await;

        if method.is_some_and(|m| m != Method::Get) && response.code.is_success() {
            self.notify_observers(socket, &path).await;
        }
    }

    /// Registers or drops an observation for a GET carrying Observe. Only a
    /// successful GET with Observe 0 registers; the response then carries the
    /// first sequence number.
    fn update_observation(
        &self,
        response: &mut Message,
        observe: Option<u32>,
        peer: SocketAddr,
        token: Token,
        path: &str,
    ) {
        let mut exchanges = lock(&self.exchanges);
        if observe == Some(0) && response.code.is_success() {
            if exchanges.observers.register(peer, token.clone(), path) {
                response.set_observe(exchanges.observers.next_sequence());
                debug!(%peer, %token, path, "observer registered");
            } else {
                warn!(%peer, path, "observer limit reached, serving plain GET");
            }
        } else if exchanges.observers.deregister(peer, &token).is_some() {
            debug!(%peer, %token, path, "observer deregistered");
        }
    }

    /// Sends the current state of `path` to everyone observing it. A
    /// non-success state (e.g. 4.04 after DELETE) is sent once and ends the
    /// observations.
    async fn notify_observers(&self, socket: &UdpSocket, path: &str) {
        let observers = lock(&self.exchanges).observers.observers_of(path);
        if observers.is_empty() {
            return;
        }

        let router = Arc::clone(&self.router);
        let target = path.to_string();
        let current = match tokio::task::spawn_blocking(move || {
            router.dispatch(&Message::request(Method::Get, &target))
        })
        .await
        {
            Ok(current) => current,
            Err(err) => {
                error!(path, error = %err, "failed to read resource for observers");
                return;
            }
        };
        let ended = !current.code.is_success();

        for (peer, token) in observers {
            let mut notification = current.clone();
            notification.mtype = MessageType::NonConfirmable;
            notification.token = token.clone();
            let bytes = {
                let mut exchanges = lock(&self.exchanges);
                notification.message_id = exchanges.allocate_message_id(peer);
                if ended {
                    exchanges.observers.deregister(peer, &token);
                } else {
                    notification.set_observe(exchanges.observers.next_sequence());
                    exchanges
                        .observers
                        .record_notification(peer, &token, notification.message_id);
                }
                encode(&notification)
            };
            debug!(%peer, %token, path, code = %notification.code, "notification");
            send(socket, &bytes, peer).await;
        }
    }

    /// A response arriving in its own CON or NON message after an empty ACK.
    async fn handle_separate_response(&self, socket: &UdpSocket, response: Message, peer: SocketAddr) {
        let confirmable = response.mtype == MessageType::Confirmable;
        let matched = {
            let mut exchanges = lock(&self.exchanges);
            let ours = exchanges
                .table
                .lookup(&response.token)
                .is_some_and(|transaction| transaction.peer == peer);
            let matched = if ours { exchanges.table.close(&response.token) } else { None };

            if matched.is_some() && confirmable {
                let ack = encode(&Message::empty_ack(response.message_id));
                let inbound = Transaction::inbound(
                    peer,
                    response.message_id,
                    response.token.clone(),
                    self.params.exchange_lifetime,
                    Instant::now(),
                );
                if exchanges.table.open(inbound).is_ok() {
                    exchanges
                        .table
                        .record_response(peer, response.message_id, ack);
                }
            }
            matched
        };

        match matched {
            Some(transaction) => {
                debug!(%peer, token = %response.token, code = %response.code, "separate response");
                if confirmable {
                    send(socket, &encode(&Message::empty_ack(response.message_id)), peer).await;
                }
                transaction.resolve(Ok(response));
            }
            None if confirmable => {
                debug!(%peer, token = %response.token, "unexpected response, resetting");
                send(socket, &encode(&Message::reset(response.message_id)), peer).await;
            }
            None => debug!(%peer, token = %response.token, "unexpected response dropped"),
        }
    }

    fn handle_ack(&self, ack: Message, peer: SocketAddr) {
        let mut exchanges = lock(&self.exchanges);

        if ack.code.is_empty() {
            if let Some(transaction) =
                exchanges
                    .table
                    .lookup_by_message_id_mut(Role::Originator, peer, ack.message_id)
            {
                if transaction.state == TransactionState::Pending {
                    transaction.acknowledge(self.params.exchange_lifetime, Instant::now());
                    debug!(%peer, message_id = ack.message_id, "acknowledged, awaiting response");
                }
            }
            return;
        }
        if !ack.code.is_response() {
            return;
        }

        let ours = exchanges
            .table
            .lookup(&ack.token)
            .is_some_and(|transaction| transaction.peer == peer);
        let matched = if ours { exchanges.table.close(&ack.token) } else { None };
        drop(exchanges);

        match matched {
            Some(transaction) => {
                debug!(%peer, token = %ack.token, code = %ack.code, "piggybacked response");
                transaction.resolve(Ok(ack));
            }
            None => debug!(%peer, message_id = ack.message_id, "unmatched acknowledgement"),
        }
    }

    fn handle_reset(&self, reset: &Message, peer: SocketAddr) {
        let closed = {
            let mut exchanges = lock(&self.exchanges);
            if let Some(observer) = exchanges.observers.cancel_by_message_id(peer, reset.message_id) {
                debug!(%peer, path = %observer.path, "observation cancelled by reset");
            }
            exchanges
                .table
                .close_by_message_id(Role::Originator, peer, reset.message_id)
        };
        if let Some(transaction) = closed {
            debug!(%peer, message_id = reset.message_id, "exchange reset by peer");
            transaction.resolve(Err(ExchangeError::Reset));
        }
    }

    /// Cancels outstanding exchanges and releases the socket.
    fn release(&self) {
        let drained = {
            let mut exchanges = lock(&self.exchanges);
            exchanges.observers.clear();
            exchanges.table.drain()
        };
        for transaction in drained {
            transaction.resolve(Err(ExchangeError::Cancelled));
        }
        lock(&self.socket).take();
        self.state.send_replace(LifecycleState::Stopped);
        info!("broker stopped");
    }
}

/// Puts the broker into Stopped however `run()` ends, including when its
/// future is dropped.
struct RunGuard<'a> {
    broker: &'a Broker,
    ticker: Option<JoinHandle<()>>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.broker.shutdown.cancel();
        self.broker.release();
    }
}

/// Drives the retransmission scheduler until `shutdown` fires.
async fn retransmit_loop(
    exchanges: Arc<Mutex<Exchanges>>,
    socket: Arc<UdpSocket>,
    tick: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let outcome = {
            let mut guard = lock(&exchanges);
            let exchanges = &mut *guard;
            exchanges.scheduler.tick(&mut exchanges.table, Instant::now())
        };

        for (peer, bytes) in &outcome.retransmit {
            send(&socket, bytes, *peer).await;
        }
        for transaction in outcome.expired {
            if transaction.role == Role::Originator {
                warn!(
                    peer = %transaction.peer,
                    message_id = transaction.message_id,
                    token = %transaction.token,
                    "exchange timed out"
                );
            }
            transaction.resolve(Err(ExchangeError::Timeout));
        }
    }
}

async fn send(socket: &UdpSocket, bytes: &[u8], peer: SocketAddr) {
    if let Err(err) = socket.send_to(bytes, peer).await {
        warn!(%peer, error = %err, "send failed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
