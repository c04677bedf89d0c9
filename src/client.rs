//! Connection manager multiplexing many logical waiters over one physical
//! connection per URL.
//!
//! Waiters are registered under a message hash. The first waiter for a hash sends
//! the subscription message, later ones attach to the existing registration.
//! Inbound frames are decoded by the [FrameHandler](FrameHandler), which routes the
//! results back with [resolve](Client::resolve) and [reject](Client::reject).
//!
//! The client never reconnects on its own: a failed connection rejects its
//! waiters with a [Network](StreamError::Network) error, and the next request for
//! the same URL opens a brand-new connection.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use log::{debug, error, info, warn};
use futures::prelude::*;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::completion::Completion;
use crate::config::ClientConfig;
use crate::core::*;
use crate::exchange::{Connector, FrameHandler, FrameSink, Transport};
use crate::throttle::Throttle;


type RequestId = u64;

/// Lifecycle of a physical connection. States are never re-entered.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

enum Waiter<V> {
    /// Completed by the first reply, then unregistered.
    Once(Completion<V>),
    /// Receives every reply until the subscription is dropped or the connection ends.
    Stream(mpsc::UnboundedSender<Result<V>>),
}

struct PendingRequest<V> {
    message_hash: String,
    waiter: Waiter<V>,
    created_at: Instant,
}

/// Replies delivered by one routing pass. Single-shot completions are resolved
/// once the connection table is unlocked.
struct Delivery<V> {
    completions: Vec<Completion<V>>,
    streamed: usize,
}

struct Connection<V> {
    id: u64,
    state: ConnectionState,
    /// Queue drained by the writer task; frames sent while connecting are flushed on open.
    outbound: mpsc::UnboundedSender<Frame>,
    shutdown: Option<oneshot::Sender<()>>,
    routes: HashMap<String, Vec<RequestId>>,
    pending: HashMap<RequestId, PendingRequest<V>>,
    next_request_id: RequestId,
}

impl<V: Clone> Connection<V> {
    fn new(id: u64, outbound: mpsc::UnboundedSender<Frame>, shutdown: oneshot::Sender<()>) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
            outbound,
            shutdown: Some(shutdown),
            routes: HashMap::new(),
            pending: HashMap::new(),
            next_request_id: 0,
        }
    }

    fn is_live(&self) -> bool {
        matches!(self.state, ConnectionState::Connecting | ConnectionState::Open)
    }

    /// Register a waiter under a message hash.
    ///
    /// # Returns
    ///
    /// The id of the request, and [true](true) if no other waiter was registered
    /// for the hash.
    fn register(&mut self, message_hash: &str, waiter: Waiter<V>) -> (RequestId, bool) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let route = self.routes.entry(message_hash.to_string()).or_default();
        let first = route.is_empty();
        route.push(request_id);
        self.pending.insert(request_id, PendingRequest {
            message_hash: message_hash.to_string(),
            waiter,
            created_at: Instant::now(),
        });
        (request_id, first)
    }

    fn unregister(&mut self, request_id: RequestId) {
        let Some(request) = self.pending.remove(&request_id) else {
            return;
        };
        if let Some(route) = self.routes.get_mut(&request.message_hash) {
            route.retain(|id| *id != request_id);
            if route.is_empty() {
                self.routes.remove(&request.message_hash);
            }
        }
    }

    fn deliver(&mut self, message_hash: &str, outcome: &Result<V>, delivery: &mut Delivery<V>) {
        let Some(route) = self.routes.get_mut(message_hash) else {
            return;
        };
        let pending = &mut self.pending;
        route.retain(|request_id| {
            let keep = match pending.get(request_id).map(|request| &request.waiter) {
                Some(Waiter::Once(completion)) => {
                    delivery.completions.push(completion.clone());
                    false
                }
                Some(Waiter::Stream(sender)) => {
                    let sent = sender.send(outcome.clone()).is_ok();
                    if sent {
                        delivery.streamed += 1;
                    }
                    sent
                }
                None => false,
            };
            if !keep {
                if let Some(request) = pending.remove(request_id) {
                    debug!("Request for {} completed after {:?}", request.message_hash, request.created_at.elapsed());
                }
            }
            keep
        });
        if route.is_empty() {
            self.routes.remove(message_hash);
        }
    }

    /// Unregister every waiter, sending the error to subscriptions.
    ///
    /// # Returns
    ///
    /// The single-shot completions, to be rejected by the caller.
    fn fail_all(&mut self, error: &StreamError) -> Vec<Completion<V>> {
        self.routes.clear();
        let mut completions = vec![];
        for (_, request) in self.pending.drain() {
            match request.waiter {
                Waiter::Once(completion) => completions.push(completion),
                Waiter::Stream(sender) => {
                    let _ = sender.send(Err(error.clone()));
                }
            }
        }
        completions
    }
}

/// Stream of replies of a multi-shot registration.
///
/// The registration ends when the subscription is dropped, or when its connection
/// ends, in which case the last item is the error that ended it.
pub struct Subscription<V> {
    message_hash: String,
    replies: UnboundedReceiverStream<Result<V>>,
}

impl<V> Subscription<V> {
    pub fn message_hash(&self) -> &str {
        &self.message_hash
    }
}

impl<V> Stream for Subscription<V> {
    type Item = Result<V>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.replies).poll_next(cx)
    }
}

struct Shared<V> {
    connector: Arc<dyn Connector>,
    handler: Arc<dyn FrameHandler<V>>,
    config: ClientConfig,
    throttle: Option<Throttle>,
    connections: Mutex<HashMap<String, Connection<V>>>,
    next_connection_id: AtomicU64,
}

/// Handle to the connection manager. Clones share the same connections.
pub struct Client<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for Client<V> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<V: Clone + Send + 'static> Client<V> {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `connector` - Opens the transports.
    ///
    /// * `handler` - Exchange-specific frame handler.
    ///
    /// * `config` - Keepalive and handshake settings.
    pub fn new(
            connector: Arc<dyn Connector>,
            handler: Arc<dyn FrameHandler<V>>,
            config: ClientConfig) -> Result<Self> {
        Self::build(connector, handler, config, None)
    }

    /// Create a new client whose outbound text and binary frames are paced by `throttle`.
    pub fn with_throttle(
            connector: Arc<dyn Connector>,
            handler: Arc<dyn FrameHandler<V>>,
            config: ClientConfig,
            throttle: Throttle) -> Result<Self> {
        Self::build(connector, handler, config, Some(throttle))
    }

    fn build(
            connector: Arc<dyn Connector>,
            handler: Arc<dyn FrameHandler<V>>,
            config: ClientConfig,
            throttle: Option<Throttle>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                connector,
                handler,
                config,
                throttle,
                connections: Mutex::new(HashMap::new()),
                next_connection_id: AtomicU64::new(1),
            })
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Wait for the next reply routed under `message_hash` on the connection to `url`.
    ///
    /// Opens the connection if needed. `subscribe_message` is sent only if no
    /// other waiter is registered under the same hash on that connection.
    /// Must be called from within a tokio runtime.
    ///
    /// # Returns
    ///
    /// A [Completion](Completion) resolved by the first reply, or rejected when the
    /// connection fails or is closed.
    pub fn request(&self, url: &str, message_hash: &str, subscribe_message: Option<Frame>) -> Completion<V> {
        let completion = Completion::new();
        if let Err(error) = self.register(url, message_hash, subscribe_message, Waiter::Once(completion.clone())) {
            completion.reject(error);
        }
        completion
    }

    /// Receive every reply routed under `message_hash`, until the subscription
    /// is dropped or the connection ends.
    pub fn subscribe(&self, url: &str, message_hash: &str, subscribe_message: Option<Frame>) -> Subscription<V> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Err(error) = self.register(url, message_hash, subscribe_message, Waiter::Stream(sender.clone())) {
            let _ = sender.send(Err(error));
        }
        Subscription {
            message_hash: message_hash.to_string(),
            replies: UnboundedReceiverStream::new(receiver),
        }
    }

    fn register(&self, url: &str, message_hash: &str, subscribe_message: Option<Frame>, waiter: Waiter<V>) -> Result<()> {
        let mut connections = self.shared.connections.lock();
        let connection = match connections.entry(url.to_string()) {
            Entry::Occupied(entry) if entry.get().is_live() => entry.into_mut(),
            Entry::Occupied(mut entry) => {
                // superseded: the old driver only tears down its own id
                entry.insert(self.open_connection(url)?);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(self.open_connection(url)?),
        };
        let (request_id, first) = connection.register(message_hash, waiter);
        if let (true, Some(frame)) = (first, subscribe_message) {
            debug!("Subscribing to {} on {}", message_hash, url);
            if connection.outbound.send(frame).is_err() {
                connection.unregister(request_id);
                return Err(StreamError::Network(format!("connection to {} is not writable", url)));
            }
        }
        Ok(())
    }

    fn open_connection(&self, url: &str) -> Result<Connection<V>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| StreamError::Config("client requires a tokio runtime".to_string()))?;
        let id = self.shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (outbound, outbound_receiver) = mpsc::unbounded_channel();
        let (shutdown, shutdown_receiver) = oneshot::channel();
        info!("Opening connection {} to {}", id, url);
        runtime.spawn(self.clone().drive(url.to_string(), id, outbound.clone(), outbound_receiver, shutdown_receiver));
        Ok(Connection::new(id, outbound, shutdown))
    }

    /// Complete every waiter registered under `message_hash` on the connection
    /// to `url` with a value. Waiters on other connections are not affected,
    /// even when they share the hash.
    ///
    /// # Arguments
    ///
    /// * `url` - Connection the reply arrived on, as passed to [FrameHandler::on_frame].
    ///
    /// * `message_hash` - Routing key of the reply.
    ///
    /// * `value` - Decoded reply.
    ///
    /// # Returns
    ///
    /// The number of waiters that received the value.
    pub fn resolve(&self, url: &str, message_hash: &str, value: V) -> usize {
        self.complete(url, message_hash, Ok(value))
    }

    /// Complete every waiter registered under `message_hash` on the connection
    /// to `url` with an error.
    pub fn reject(&self, url: &str, message_hash: &str, error: StreamError) -> usize {
        self.complete(url, message_hash, Err(error))
    }

    fn complete(&self, url: &str, message_hash: &str, outcome: Result<V>) -> usize {
        let mut delivery = Delivery { completions: vec![], streamed: 0 };
        {
            let mut connections = self.shared.connections.lock();
            match connections.get_mut(url) {
                Some(connection) if connection.is_live() => {
                    connection.deliver(message_hash, &outcome, &mut delivery);
                }
                _ => debug!("No live connection to {} for {}", url, message_hash),
            }
        }
        let count = delivery.completions.len() + delivery.streamed;
        for completion in delivery.completions {
            match &outcome {
                Ok(value) => completion.resolve(value.clone()),
                Err(error) => completion.reject(error.clone()),
            };
        }
        count
    }

    /// Queue a frame on the connection to `url`, without registering any waiter.
    pub fn send(&self, url: &str, frame: Frame) -> Result<()> {
        let connections = self.shared.connections.lock();
        match connections.get(url) {
            Some(connection) if connection.is_live() => connection.outbound.send(frame)
                .map_err(|_| StreamError::Network(format!("connection to {} is not writable", url))),
            _ => Err(StreamError::Network(format!("no open connection to {}", url))),
        }
    }

    /// Close the connection to `url`, rejecting its waiters with
    /// [ClosedByUser](StreamError::ClosedByUser).
    ///
    /// # Returns
    ///
    /// The number of waiters rejected.
    pub fn close_connection(&self, url: &str) -> usize {
        let (orphans, shutdown) = {
            let mut connections = self.shared.connections.lock();
            match connections.get_mut(url) {
                Some(connection) if connection.is_live() => {
                    connection.state = ConnectionState::Closing;
                    let waiters = connection.pending.len();
                    let orphans = connection.fail_all(&StreamError::ClosedByUser);
                    info!("Closing connection {} to {} ({} waiters)", connection.id, url, waiters);
                    (orphans, connection.shutdown.take())
                }
                _ => return 0,
            }
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        let count = orphans.len();
        for completion in orphans {
            completion.reject(StreamError::ClosedByUser);
        }
        count
    }

    /// Close every connection.
    ///
    /// # Returns
    ///
    /// The number of single-shot waiters rejected.
    pub fn close(&self) -> usize {
        let urls: Vec<String> = self.shared.connections.lock().keys().cloned().collect();
        urls.iter().map(|url| self.close_connection(url)).sum()
    }

    pub fn connection_state(&self, url: &str) -> Option<ConnectionState> {
        self.shared.connections.lock().get(url).map(|connection| connection.state)
    }

    /// Number of waiters registered on the connection to `url`.
    pub fn pending_count(&self, url: &str) -> usize {
        self.shared.connections.lock().get(url).map_or(0, |connection| connection.pending.len())
    }

    fn mark_open(&self, url: &str, id: u64) -> bool {
        let mut connections = self.shared.connections.lock();
        match connections.get_mut(url) {
            Some(connection) if connection.id == id && connection.state == ConnectionState::Connecting => {
                connection.state = ConnectionState::Open;
                true
            }
            _ => false,
        }
    }

    /// Remove the connection `id` and reject whatever is still registered on it.
    fn teardown(&self, url: &str, id: u64, reason: StreamError) {
        let orphans = {
            let mut connections = self.shared.connections.lock();
            let owned = connections.get(url).map_or(false, |connection| connection.id == id);
            match owned.then(|| connections.remove(url)).flatten() {
                Some(mut connection) => {
                    connection.state = ConnectionState::Closed;
                    connection.fail_all(&reason)
                }
                None => vec![],
            }
        };
        if reason.is_closed_by_user() {
            info!("Connection {} to {} closed", id, url);
        } else {
            warn!("Connection {} to {} failed: {} ({} waiters rejected)", id, url, reason, orphans.len());
        }
        for completion in orphans {
            completion.reject(reason.clone());
        }
        self.shared.handler.on_close(self, url, &reason);
    }

    /// Connection task: handshake, then inbound loop and keepalive until the
    /// connection fails or is closed.
    async fn drive(
            self,
            url: String,
            id: u64,
            outbound: mpsc::UnboundedSender<Frame>,
            outbound_receiver: mpsc::UnboundedReceiver<Frame>,
            mut shutdown: oneshot::Receiver<()>) {
        let config = &self.shared.config;
        let handshake = timeout(config.connect_timeout, self.shared.connector.connect(&url));
        let transport = tokio::select! {
            _ = &mut shutdown => {
                self.teardown(&url, id, StreamError::ClosedByUser);
                return;
            }
            result = handshake => match result {
                Ok(Ok(transport)) => transport,
                Ok(Err(error)) => {
                    self.teardown(&url, id, error);
                    return;
                }
                Err(_) => {
                    let error = StreamError::Network(format!("connect timed out after {:?}", config.connect_timeout));
                    self.teardown(&url, id, error);
                    return;
                }
            },
        };
        if !self.mark_open(&url, id) {
            let Transport { mut sink, .. } = transport;
            if let Err(error) = sink.close().await {
                debug!("Error releasing transport to {}: {}", url, error);
            }
            self.teardown(&url, id, StreamError::ClosedByUser);
            return;
        }
        info!("Connection {} to {} open", id, url);
        self.shared.handler.on_open(&self, &url);

        let Transport { sink, mut stream } = transport;
        let mut writer = tokio::spawn(Self::write(
            sink,
            outbound_receiver,
            self.shared.throttle.clone(),
            config.send_cost,
        ));
        let keep_alive = config.keep_alive_interval;
        let mut ticker = interval_at(Instant::now() + keep_alive, keep_alive);
        let mut last_inbound = Instant::now();

        let reason = loop {
            tokio::select! {
                _ = &mut shutdown => break StreamError::ClosedByUser,
                result = &mut writer => break match result {
                    Ok(Ok(())) => StreamError::Network("writer stopped".to_string()),
                    Ok(Err(error)) => error,
                    Err(join_error) => StreamError::Network(join_error.to_string()),
                },
                _ = ticker.tick() => {
                    if last_inbound.elapsed() > keep_alive * 2 {
                        break StreamError::Network(format!("no inbound frame for {:?}", last_inbound.elapsed()));
                    }
                    let _ = outbound.send(self.shared.handler.keepalive_frame());
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(Frame::Close)) => break StreamError::Network("connection closed by peer".to_string()),
                    Some(Ok(frame)) => {
                        last_inbound = Instant::now();
                        if let Frame::Ping(data) = &frame {
                            let _ = outbound.send(Frame::Pong(data.clone()));
                        }
                        self.shared.handler.on_frame(&self, &url, frame);
                    }
                    Some(Err(error)) => break error,
                    None => break StreamError::Network("connection ended".to_string()),
                },
            }
        };

        if reason.is_closed_by_user() {
            let _ = outbound.send(Frame::Close);
            if timeout(config.connect_timeout, &mut writer).await.is_err() {
                writer.abort();
            }
        } else {
            writer.abort();
        }
        // an aborted writer withdraws its pending throttle admission once dropped
        if !writer.is_finished() {
            let _ = writer.await;
        }
        self.teardown(&url, id, reason);
    }

    /// Writer task: drain the outbound queue to the sink, pacing data frames.
    async fn write(
            mut sink: FrameSink,
            mut outbound: mpsc::UnboundedReceiver<Frame>,
            throttle: Option<Throttle>,
            cost: f64) -> Result<()> {
        while let Some(frame) = outbound.recv().await {
            if let (Some(throttle), false) = (&throttle, frame.is_control()) {
                if let Err(error) = throttle.admit(cost).await {
                    error!("Dropping outbound frame: {}", error);
                    continue;
                }
            }
            let closing = frame == Frame::Close;
            sink.send(frame).await?;
            if closing {
                break;
            }
        }
        sink.close().await
    }
}
