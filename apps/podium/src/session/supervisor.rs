use super::store::SessionStore;
use crate::transport::{TransportError, TransportHandle, TransportStatus};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

/// Coarse connection lifecycle presented to rendering collaborators:
/// `Idle → Connecting → Connected → (Reconnecting ↔ Connected) → Failed`.
/// `Failed` is terminal until an explicit [`ConnectionSupervisor::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Derives [`ConnectionState`] from transport status transitions and
/// destroys session state once the reconnect budget is exhausted. Does not
/// re-join a prior session after reconnection; re-joining stays an
/// explicit user action.
pub struct ConnectionSupervisor {
    transport: TransportHandle,
    server: Url,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    task: JoinHandle<()>,
}

impl ConnectionSupervisor {
    pub fn spawn(transport: TransportHandle, store: Arc<SessionStore>, server: Url) -> Self {
        let initial = map_initial(transport.status());
        let (state_tx, _) = watch::channel(initial);
        let state_tx = Arc::new(state_tx);

        let tx = state_tx.clone();
        let mut status_rx = transport.status_stream();
        let task = tokio::spawn(async move {
            let mut last = *status_rx.borrow();
            while status_rx.changed().await.is_ok() {
                let status = *status_rx.borrow();
                let next = match status {
                    TransportStatus::Disconnected => ConnectionState::Idle,
                    TransportStatus::Connecting => {
                        // An unexpected drop while a session is held is a
                        // reconnect from the participant's point of view.
                        if last == TransportStatus::Connected && store.session_held() {
                            ConnectionState::Reconnecting
                        } else if *tx.borrow() == ConnectionState::Reconnecting {
                            ConnectionState::Reconnecting
                        } else {
                            ConnectionState::Connecting
                        }
                    }
                    TransportStatus::Connected => ConnectionState::Connected,
                    TransportStatus::Error => {
                        warn!(
                            target: "podium::supervisor",
                            "connection failed terminally; explicit reconnect required"
                        );
                        // A session cannot outlive its connection: clear it
                        // before anyone observes `Failed`.
                        store.reset();
                        ConnectionState::Failed
                    }
                };
                if *tx.borrow() != next {
                    debug!(target: "podium::supervisor", state = ?next, "connection state");
                }
                tx.send_replace(next);
                last = status;
            }
        });

        Self {
            transport,
            server,
            state_tx,
            task,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Explicit connect request; also the only way out of `Failed`.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.transport.open(&self.server).await
    }

    pub fn disconnect(&self) {
        self.transport.close();
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn map_initial(status: TransportStatus) -> ConnectionState {
    match status {
        TransportStatus::Disconnected => ConnectionState::Idle,
        TransportStatus::Connecting => ConnectionState::Connecting,
        TransportStatus::Connected => ConnectionState::Connected,
        TransportStatus::Error => ConnectionState::Failed,
    }
}
