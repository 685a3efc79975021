//! In-memory connector used by tests: the "server" half scripts inbound
//! events, records every outbound envelope, and can refuse connection
//! attempts or drop a live connection to exercise the reconnect policy.

use super::{Conn, Connector, TransportError};
use crate::protocol::Envelope;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use url::Url;

struct MockState {
    refuse: AtomicBool,
    hold: AtomicBool,
    hold_notify: Notify,
    connects: AtomicUsize,
    sent: Mutex<Vec<Envelope>>,
    sent_notify: Notify,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    /// Client-side connector plus the scripting handle for the server side.
    pub fn pair() -> (Arc<dyn Connector>, MockServerHandle) {
        let state = Arc::new(MockState {
            refuse: AtomicBool::new(false),
            hold: AtomicBool::new(false),
            hold_notify: Notify::new(),
            connects: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            sent_notify: Notify::new(),
            inbound_tx: Mutex::new(None),
        });
        (
            Arc::new(MockConnector {
                state: state.clone(),
            }),
            MockServerHandle { state },
        )
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Conn>, TransportError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        loop {
            let released = self.state.hold_notify.notified();
            if !self.state.hold.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed {
                url: url.to_string(),
                reason: "mock refused connection".into(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.inbound_tx.lock() = Some(tx);
        Ok(Box::new(MockConn {
            state: self.state.clone(),
            rx,
        }))
    }
}

struct MockConn {
    state: Arc<MockState>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Conn for MockConn {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let envelope = Envelope::decode(&frame).map_err(|_| TransportError::Closed)?;
        self.state.sent.lock().push(envelope);
        self.state.sent_notify.notify_waiters();
        Ok(())
    }

    async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

#[derive(Clone)]
pub struct MockServerHandle {
    state: Arc<MockState>,
}

impl MockServerHandle {
    /// Push a framed event to the client, if a connection is live.
    pub fn emit(&self, event: &str, data: Value) {
        let text = Envelope::new(event, data)
            .encode()
            .expect("mock envelope must encode");
        self.emit_raw(&text);
    }

    /// Push an arbitrary text frame, including malformed ones.
    pub fn emit_raw(&self, text: &str) {
        if let Some(tx) = self.state.inbound_tx.lock().as_ref() {
            let _ = tx.send(text.to_string());
        }
    }

    /// Simulate an unexpected network drop.
    pub fn drop_connection(&self) {
        self.state.inbound_tx.lock().take();
    }

    /// Make subsequent connection attempts fail.
    pub fn refuse_connects(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Suspend connection attempts mid-flight until released.
    pub fn hold_connects(&self, hold: bool) {
        self.state.hold.store(hold, Ordering::SeqCst);
        if !hold {
            self.state.hold_notify.notify_waiters();
        }
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Every envelope the client has sent, in order.
    pub fn sent(&self) -> Vec<Envelope> {
        self.state.sent.lock().clone()
    }

    pub fn sent_events(&self) -> Vec<String> {
        self.sent().into_iter().map(|env| env.event).collect()
    }

    /// Waits until the client has sent an envelope with the given event
    /// name and returns the first match.
    pub async fn wait_for(&self, event: &str) -> Envelope {
        loop {
            let notified = self.state.sent_notify.notified();
            if let Some(envelope) = self
                .state
                .sent
                .lock()
                .iter()
                .find(|env| env.event == event)
                .cloned()
            {
                return envelope;
            }
            notified.await;
        }
    }
}
