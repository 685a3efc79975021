use super::{Conn, Connector, TransportError, TransportStatus};
use crate::config::{CONNECT_TIMEOUT, RECONNECT_ATTEMPTS, RECONNECT_DELAY};
use crate::protocol::Envelope;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

type Handler = Arc<dyn Fn(&Value) + Send + Sync + 'static>;

struct ListenerEntry {
    id: u64,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct ListenerTable {
    entries: HashMap<String, Vec<ListenerEntry>>,
}

impl ListenerTable {
    fn insert(&mut self, event: &str, entry: ListenerEntry) {
        self.entries.entry(event.to_string()).or_default().push(entry);
    }

    fn remove(&mut self, event: &str, id: u64) {
        if let Some(entries) = self.entries.get_mut(event) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                self.entries.remove(event);
            }
        }
    }

    /// Handlers for `event` in registration order. One-shot entries are
    /// removed from the table before their handler runs.
    fn collect(&mut self, event: &str) -> Vec<Handler> {
        let Some(entries) = self.entries.get_mut(event) else {
            return Vec::new();
        };
        let handlers = entries.iter().map(|entry| entry.handler.clone()).collect();
        entries.retain(|entry| !entry.once);
        if entries.is_empty() {
            self.entries.remove(event);
        }
        handlers
    }
}

struct Shared {
    connector: Arc<dyn Connector>,
    listeners: Mutex<ListenerTable>,
    status_tx: watch::Sender<TransportStatus>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    io_task: Mutex<Option<JoinHandle<()>>>,
    open_lock: AsyncMutex<()>,
    caller_closed: AtomicBool,
    next_listener_id: AtomicU64,
}

/// Owns exactly one logical connection to the session server and hides
/// retry timing from callers, who only see the coarse [`TransportStatus`].
/// Inbound envelopes are delivered to registered listeners strictly in
/// order, one frame fully handled before the next is dequeued.
#[derive(Clone)]
pub struct TransportHandle {
    shared: Arc<Shared>,
}

impl TransportHandle {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (status_tx, _) = watch::channel(TransportStatus::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                listeners: Mutex::new(ListenerTable::default()),
                status_tx,
                outbound: Mutex::new(None),
                io_task: Mutex::new(None),
                open_lock: AsyncMutex::new(()),
                caller_closed: AtomicBool::new(false),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn status(&self) -> TransportStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn status_stream(&self) -> watch::Receiver<TransportStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Idempotent: if a connection attempt is already in flight or a
    /// connection is established, returns without creating a second one.
    pub async fn open(&self, url: &Url) -> Result<(), TransportError> {
        let _permit = self.shared.open_lock.lock().await;
        if matches!(
            self.status(),
            TransportStatus::Connecting | TransportStatus::Connected
        ) {
            return Ok(());
        }

        self.shared.caller_closed.store(false, Ordering::SeqCst);
        self.shared
            .status_tx
            .send_replace(TransportStatus::Connecting);

        let mut conn = match connect_bounded(&self.shared.connector, url).await {
            Ok(conn) => conn,
            Err(err) => {
                self.shared
                    .status_tx
                    .send_replace(TransportStatus::Disconnected);
                return Err(err);
            }
        };

        // A close() issued while the connect was in flight wins: tear the
        // fresh connection down instead of resurrecting it.
        if self.shared.caller_closed.load(Ordering::SeqCst) {
            conn.close().await;
            self.shared
                .status_tx
                .send_replace(TransportStatus::Disconnected);
            return Err(TransportError::Closed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.outbound.lock() = Some(tx);
        self.shared
            .status_tx
            .send_replace(TransportStatus::Connected);
        info!(target: "podium::transport", %url, "connected");

        let shared = self.shared.clone();
        let url = url.clone();
        let task = tokio::spawn(run_io(shared, url, conn, rx));
        *self.shared.io_task.lock() = Some(task);
        Ok(())
    }

    /// Best-effort teardown: cancels any pending reconnect timer and
    /// transitions to `Disconnected`. Always succeeds.
    pub fn close(&self) {
        self.shared.caller_closed.store(true, Ordering::SeqCst);
        self.shared.outbound.lock().take();
        if let Some(task) = self.shared.io_task.lock().take() {
            task.abort();
        }
        self.shared
            .status_tx
            .send_replace(TransportStatus::Disconnected);
        debug!(target: "podium::transport", "closed by caller");
    }

    /// Enqueues one outbound envelope. Callers that care about delivery
    /// must check [`TransportHandle::status`] first.
    pub fn send(&self, event: &str, data: Value) -> Result<(), TransportError> {
        if self.status() != TransportStatus::Connected {
            return Err(TransportError::NotConnected);
        }
        let guard = self.shared.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        tx.send(Envelope::new(event, data))
            .map_err(|_| TransportError::Closed)
    }

    /// Registers a handler for a named event. Multiple handlers per event
    /// are invoked in registration order; dropping the guard unsubscribes.
    pub fn on(
        &self,
        event: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let id = self.next_id();
        self.shared.listeners.lock().insert(
            event,
            ListenerEntry {
                id,
                once: false,
                handler: Arc::new(handler),
            },
        );
        self.guard(event, id)
    }

    /// One-shot subscription: resolves with the first matching payload,
    /// auto-removing itself on delivery or after `ttl`, whichever comes
    /// first. After removal the receiver resolves with an error and no
    /// later arrival can fire.
    pub fn once_with_expiry(&self, event: &str, ttl: Duration) -> OneShotListener {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let id = self.next_id();
        self.shared.listeners.lock().insert(
            event,
            ListenerEntry {
                id,
                once: true,
                handler: Arc::new(move |value: &Value| {
                    if let Some(tx) = slot.lock().take() {
                        let _ = tx.send(value.clone());
                    }
                }),
            },
        );

        let weak = Arc::downgrade(&self.shared);
        let event_name = event.to_string();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(shared) = weak.upgrade() {
                shared.listeners.lock().remove(&event_name, id);
            }
        });

        OneShotListener {
            rx,
            _guard: self.guard(event, id),
            expiry,
        }
    }

    fn next_id(&self) -> u64 {
        self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed)
    }

    fn guard(&self, event: &str, id: u64) -> ListenerGuard {
        ListenerGuard {
            shared: Arc::downgrade(&self.shared),
            event: event.to_string(),
            id,
        }
    }
}

/// Unsubscribe handle; dropping it removes the listener.
pub struct ListenerGuard {
    shared: Weak<Shared>,
    event: String,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.listeners.lock().remove(&self.event, self.id);
        }
    }
}

pub struct OneShotListener {
    rx: oneshot::Receiver<Value>,
    _guard: ListenerGuard,
    expiry: JoinHandle<()>,
}

impl OneShotListener {
    /// The underlying receiver, for use inside `tokio::select!`. Resolves
    /// `Ok(payload)` on delivery, `Err(_)` once the listener was removed
    /// without firing.
    pub fn recv(&mut self) -> &mut oneshot::Receiver<Value> {
        &mut self.rx
    }
}

impl Drop for OneShotListener {
    fn drop(&mut self) {
        self.expiry.abort();
    }
}

async fn connect_bounded(
    connector: &Arc<dyn Connector>,
    url: &Url,
) -> Result<Box<dyn Conn>, TransportError> {
    match tokio::time::timeout(CONNECT_TIMEOUT, connector.connect(url)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::ConnectTimeout {
            url: url.to_string(),
            seconds: CONNECT_TIMEOUT.as_secs(),
        }),
    }
}

async fn run_io(
    shared: Arc<Shared>,
    url: Url,
    mut conn: Box<dyn Conn>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) {
    loop {
        pump(&shared, conn.as_mut(), &mut outbound).await;

        if shared.caller_closed.load(Ordering::SeqCst) {
            shared.status_tx.send_replace(TransportStatus::Disconnected);
            return;
        }

        warn!(target: "podium::transport", "connection dropped unexpectedly");
        shared.status_tx.send_replace(TransportStatus::Connecting);
        match reconnect(&shared, &url).await {
            Some(next) => {
                conn = next;
                shared.status_tx.send_replace(TransportStatus::Connected);
            }
            None => {
                shared.outbound.lock().take();
                if shared.caller_closed.load(Ordering::SeqCst) {
                    shared.status_tx.send_replace(TransportStatus::Disconnected);
                } else {
                    shared.status_tx.send_replace(TransportStatus::Error);
                }
                return;
            }
        }
    }
}

/// Drives one live connection until it ends: forwards queued outbound
/// envelopes and dispatches inbound frames serially.
async fn pump(
    shared: &Arc<Shared>,
    conn: &mut dyn Conn,
    outbound: &mut mpsc::UnboundedReceiver<Envelope>,
) {
    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(envelope) => match envelope.encode() {
                    Ok(text) => {
                        if conn.send(text).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(
                            target: "podium::transport",
                            event = %envelope.event,
                            error = %err,
                            "dropping unencodable outbound envelope"
                        );
                    }
                },
                None => {
                    conn.close().await;
                    return;
                }
            },
            frame = conn.recv() => match frame {
                Some(text) => dispatch(shared, &text),
                None => return,
            },
        }
    }
}

fn dispatch(shared: &Arc<Shared>, text: &str) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(
                target: "podium::transport",
                error = %err,
                "dropping malformed inbound frame"
            );
            return;
        }
    };
    let handlers = shared.listeners.lock().collect(&envelope.event);
    if handlers.is_empty() {
        debug!(
            target: "podium::transport",
            event = %envelope.event,
            "no listener for inbound event"
        );
        return;
    }
    for handler in handlers {
        handler(&envelope.data);
    }
}

async fn reconnect(shared: &Arc<Shared>, url: &Url) -> Option<Box<dyn Conn>> {
    for attempt in 1..=RECONNECT_ATTEMPTS {
        tokio::time::sleep(RECONNECT_DELAY).await;
        if shared.caller_closed.load(Ordering::SeqCst) {
            return None;
        }
        match connect_bounded(&shared.connector, url).await {
            Ok(conn) => {
                info!(target: "podium::transport", attempt, "reconnected");
                return Some(conn);
            }
            Err(err) => {
                warn!(
                    target: "podium::transport",
                    attempt,
                    error = %err,
                    "reconnect attempt failed"
                );
            }
        }
    }
    error!(
        target: "podium::transport",
        attempts = RECONNECT_ATTEMPTS,
        "exhausted reconnect attempts"
    );
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::event;
    use crate::transport::mock::MockConnector;
    use serde_json::json;

    fn url() -> Url {
        Url::parse("ws://127.0.0.1:9/ws").unwrap()
    }

    async fn settle() {
        // Let spawned IO tasks run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn open_is_idempotent() {
        let (connector, server) = MockConnector::pair();
        let handle = TransportHandle::new(connector);
        handle.open(&url()).await.unwrap();
        handle.open(&url()).await.unwrap();
        assert_eq!(server.connect_count(), 1);
        assert_eq!(handle.status(), TransportStatus::Connected);
    }

    #[test_timeout::tokio_timeout_test]
    async fn open_failure_surfaces_and_resets_status() {
        let (connector, server) = MockConnector::pair();
        server.refuse_connects(true);
        let handle = TransportHandle::new(connector);
        let err = handle.open(&url()).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
        assert_eq!(handle.status(), TransportStatus::Disconnected);
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_during_open_wins_the_race() {
        let (connector, server) = MockConnector::pair();
        let handle = TransportHandle::new(connector);

        server.hold_connects(true);
        let opening = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.open(&url()).await })
        };
        // Let the open reach the suspended connect before closing.
        while server.connect_count() == 0 {
            tokio::task::yield_now().await;
        }
        handle.close();
        server.hold_connects(false);

        let result = opening.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert_eq!(handle.status(), TransportStatus::Disconnected);
        settle().await;
        assert_eq!(handle.status(), TransportStatus::Disconnected);
    }

    #[test_timeout::tokio_timeout_test]
    async fn send_without_connection_is_rejected() {
        let (connector, _server) = MockConnector::pair();
        let handle = TransportHandle::new(connector);
        let err = handle.send(event::LEAVE_REQUEST, json!({})).unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[test_timeout::tokio_timeout_test]
    async fn handlers_fire_in_registration_order() {
        let (connector, server) = MockConnector::pair();
        let handle = TransportHandle::new(connector);
        handle.open(&url()).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = {
            let seen = seen.clone();
            handle.on("ping", move |_| seen.lock().push(1))
        };
        let second = {
            let seen = seen.clone();
            handle.on("ping", move |_| seen.lock().push(2))
        };

        server.emit("ping", json!({}));
        settle().await;
        assert_eq!(*seen.lock(), vec![1, 2]);
        drop(first);
        drop(second);
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropping_guard_unsubscribes() {
        let (connector, server) = MockConnector::pair();
        let handle = TransportHandle::new(connector);
        handle.open(&url()).await.unwrap();

        let seen = Arc::new(Mutex::new(0u32));
        let guard = {
            let seen = seen.clone();
            handle.on("ping", move |_| *seen.lock() += 1)
        };
        server.emit("ping", json!({}));
        settle().await;
        drop(guard);
        server.emit("ping", json!({}));
        settle().await;
        assert_eq!(*seen.lock(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_frames_are_dropped() {
        let (connector, server) = MockConnector::pair();
        let handle = TransportHandle::new(connector);
        handle.open(&url()).await.unwrap();

        let seen = Arc::new(Mutex::new(0u32));
        let _guard = {
            let seen = seen.clone();
            handle.on("ping", move |_| *seen.lock() += 1)
        };
        server.emit_raw("{not json");
        server.emit("ping", json!({}));
        settle().await;
        assert_eq!(*seen.lock(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn once_listener_fires_at_most_once() {
        let (connector, server) = MockConnector::pair();
        let handle = TransportHandle::new(connector);
        handle.open(&url()).await.unwrap();

        let mut listener = handle.once_with_expiry("pong", Duration::from_secs(5));
        server.emit("pong", json!({"n": 1}));
        server.emit("pong", json!({"n": 2}));
        settle().await;
        let payload = listener.recv().await.unwrap();
        assert_eq!(payload, json!({"n": 1}));
    }

    #[test_timeout::tokio_timeout_test]
    async fn once_listener_expires() {
        tokio::time::pause();
        let (connector, _server) = MockConnector::pair();
        let handle = TransportHandle::new(connector);
        handle.open(&url()).await.unwrap();

        let mut listener = handle.once_with_expiry("pong", Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(listener.recv().await.is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn reconnects_after_unexpected_drop() {
        tokio::time::pause();
        let (connector, server) = MockConnector::pair();
        let handle = TransportHandle::new(connector);
        handle.open(&url()).await.unwrap();
        let mut status = handle.status_stream();

        server.drop_connection();
        // One retry with the fixed delay should restore the connection.
        loop {
            status.changed().await.unwrap();
            if *status.borrow() == TransportStatus::Connected {
                break;
            }
        }
        assert_eq!(server.connect_count(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn five_failed_reconnects_end_in_terminal_error() {
        tokio::time::pause();
        let (connector, server) = MockConnector::pair();
        let handle = TransportHandle::new(connector);
        handle.open(&url()).await.unwrap();
        let mut status = handle.status_stream();

        server.refuse_connects(true);
        server.drop_connection();
        loop {
            status.changed().await.unwrap();
            if *status.borrow() == TransportStatus::Error {
                break;
            }
        }
        // Initial connect plus exactly five retries, then nothing further.
        assert_eq!(server.connect_count(), 1 + RECONNECT_ATTEMPTS as usize);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(server.connect_count(), 1 + RECONNECT_ATTEMPTS as usize);
        assert_eq!(handle.status(), TransportStatus::Error);
    }

    #[test_timeout::tokio_timeout_test]
    async fn caller_close_does_not_reconnect() {
        tokio::time::pause();
        let (connector, server) = MockConnector::pair();
        let handle = TransportHandle::new(connector);
        handle.open(&url()).await.unwrap();

        handle.close();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(server.connect_count(), 1);
        assert_eq!(handle.status(), TransportStatus::Disconnected);
    }

    #[test_timeout::tokio_timeout_test]
    async fn fresh_open_allowed_after_terminal_error() {
        tokio::time::pause();
        let (connector, server) = MockConnector::pair();
        let handle = TransportHandle::new(connector);
        handle.open(&url()).await.unwrap();

        server.refuse_connects(true);
        server.drop_connection();
        let mut status = handle.status_stream();
        loop {
            status.changed().await.unwrap();
            if *status.borrow() == TransportStatus::Error {
                break;
            }
        }

        server.refuse_connects(false);
        handle.open(&url()).await.unwrap();
        assert_eq!(handle.status(), TransportStatus::Connected);
    }
}
