pub mod store;
pub mod supervisor;

use crate::config::JOIN_TIMEOUT;
use crate::protocol::{
    event, validate_avatar_id, validate_display_name, AnswerRequest, ErrorPayload, JoinRequest,
    QuestionReveal, QuestionStart, SessionCode, SessionSnapshot, ValidationError,
};
use crate::transport::{ListenerGuard, TransportError, TransportHandle, TransportStatus};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub use store::{CurrentQuestion, Participant, QuizState, RevealedQuestion, Session, SessionStore};
pub use supervisor::{ConnectionState, ConnectionSupervisor};

#[derive(Debug, Error)]
pub enum ClientError {
    /// Bad local input; never reaches the network and is not retried.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Transport could not establish or hold a connection.
    #[error("connection failed: {0}")]
    Connection(#[from] TransportError),
    /// No timely server response to a specific request. Not retried
    /// automatically; the user retries explicitly.
    #[error("no response from the session server within {}s", .0.as_secs())]
    Timeout(Duration),
    /// The server explicitly rejected the operation; shown verbatim.
    #[error("{0}")]
    Session(String),
    /// Request correlation allows exactly one in-flight join.
    #[error("another join attempt is already in flight")]
    Pending,
    #[error("malformed server payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Translates domain intents into wire events and validates/forwards wire
/// responses. Owns request/response correlation for operations that
/// expect a timely answer.
pub struct SessionClient {
    transport: TransportHandle,
    store: Arc<SessionStore>,
    server: Url,
    join_timeout: Duration,
    join_pending: Arc<AtomicBool>,
    _handlers: Vec<ListenerGuard>,
}

impl SessionClient {
    pub fn new(transport: TransportHandle, store: Arc<SessionStore>, server: Url) -> Self {
        let join_pending = Arc::new(AtomicBool::new(false));
        let handlers = install_handlers(&transport, &store, &join_pending);
        Self {
            transport,
            store,
            server,
            join_timeout: JOIN_TIMEOUT,
            join_pending,
            _handlers: handlers,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Joins a session: local validation, transport open if needed, then a
    /// single-winner race between `session-ready`, `session-error` and the
    /// response timeout. The losing paths' listeners are dropped, so a
    /// late arrival after a local timeout can never write the store.
    pub async fn join(
        &self,
        code: &str,
        display_name: &str,
        avatar_id: u8,
    ) -> Result<Session, ClientError> {
        let code = SessionCode::parse(code)?;
        let display_name = validate_display_name(display_name)?;
        let avatar_id = validate_avatar_id(avatar_id)?;

        if self.transport.status() != TransportStatus::Connected {
            self.transport.open(&self.server).await?;
        }

        if self.join_pending.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Pending);
        }
        // Clears the pending flag on every exit path. While the flag is
        // down, a session-ready with no session held is treated as a late
        // arrival and never written.
        let _attempt = JoinAttempt {
            pending: self.join_pending.clone(),
        };

        // Profile is resent on every (re)join attempt; record it before
        // the request goes out. A rejected concurrent join never gets here.
        self.store.set_participant(Participant {
            display_name: display_name.clone(),
            avatar_id,
        });

        let mut ready = self
            .transport
            .once_with_expiry(event::SESSION_READY, self.join_timeout);
        let mut rejected = self
            .transport
            .once_with_expiry(event::SESSION_ERROR, self.join_timeout);
        let mut conn_failed = self
            .transport
            .once_with_expiry(event::CONNECTION_ERROR, self.join_timeout);

        let request = JoinRequest {
            code,
            display_name,
            avatar_id,
        };
        self.transport
            .send(event::JOIN_REQUEST, serde_json::to_value(&request)?)?;
        info!(target: "podium::session", code = %request.code, "join requested");

        tokio::select! {
            payload = ready.recv() => match payload {
                Ok(value) => {
                    // The standing handler already applied the snapshot in
                    // dispatch order; this path only reports the outcome.
                    let snapshot: SessionSnapshot = serde_json::from_value(value)?;
                    let session = Session::from(snapshot);
                    info!(
                        target: "podium::session",
                        code = %session.code,
                        status = %session.status,
                        "joined session"
                    );
                    Ok(session)
                }
                Err(_) => Err(ClientError::Timeout(self.join_timeout)),
            },
            payload = rejected.recv() => Err(rejection(payload)),
            payload = conn_failed.recv() => Err(rejection(payload)),
            _ = tokio::time::sleep(self.join_timeout) => {
                Err(ClientError::Timeout(self.join_timeout))
            }
        }
    }

    /// Fire-and-forget departure: the leave notice is best-effort, but the
    /// local store is cleared unconditionally and synchronously — local
    /// state is the source of truth for the UI either way.
    pub fn leave(&self) {
        if self.transport.status() == TransportStatus::Connected {
            if let Err(err) = self.transport.send(event::LEAVE_REQUEST, json!({})) {
                debug!(
                    target: "podium::session",
                    error = %err,
                    "leave notice not delivered"
                );
            }
        }
        self.store.reset();
        info!(target: "podium::session", "left session");
    }

    /// Submits an answer for the in-flight question. No acknowledgement is
    /// defined on the wire, so this validates locally and requires a live
    /// connection.
    pub fn answer(&self, option_index: u32) -> Result<(), ClientError> {
        let Some(question) = self.store.current_question() else {
            return Err(ValidationError {
                field: "optionIndex",
                reason: "no question is in flight".into(),
            }
            .into());
        };
        if option_index as usize >= question.options.len() {
            return Err(ValidationError {
                field: "optionIndex",
                reason: format!(
                    "option {option_index} out of range for {} options",
                    question.options.len()
                ),
            }
            .into());
        }
        let request = AnswerRequest {
            question_index: question.index,
            option_index,
        };
        self.transport
            .send(event::ANSWER_REQUEST, serde_json::to_value(&request)?)?;
        debug!(
            target: "podium::session",
            question = question.index,
            option = option_index,
            "answer submitted"
        );
        Ok(())
    }
}

struct JoinAttempt {
    pending: Arc<AtomicBool>,
}

impl Drop for JoinAttempt {
    fn drop(&mut self) {
        self.pending.store(false, Ordering::SeqCst);
    }
}

fn rejection(payload: Result<Value, tokio::sync::oneshot::error::RecvError>) -> ClientError {
    match payload {
        Ok(value) => match serde_json::from_value::<ErrorPayload>(value) {
            Ok(error) => ClientError::Session(error.message),
            Err(err) => ClientError::Payload(err),
        },
        Err(_) => ClientError::Timeout(JOIN_TIMEOUT),
    }
}

/// Standing server→client handlers. Each payload is shape-validated
/// before it reaches the store; malformed payloads are logged and
/// dropped, never applied.
fn install_handlers(
    transport: &TransportHandle,
    store: &Arc<SessionStore>,
    join_pending: &Arc<AtomicBool>,
) -> Vec<ListenerGuard> {
    let mut guards = Vec::new();

    {
        // Snapshots are applied here, in dispatch order, so a
        // question-start queued right behind one observes the new session.
        // Accepted while a join is pending or a session is held; anything
        // else is a late arrival (e.g. after a timed-out join) and must
        // not write.
        let store = store.clone();
        let join_pending = join_pending.clone();
        guards.push(transport.on(event::SESSION_READY, move |data| {
            if !join_pending.load(Ordering::SeqCst) && !store.session_held() {
                debug!(
                    target: "podium::session",
                    "ignoring stale session snapshot"
                );
                return;
            }
            match serde_json::from_value::<SessionSnapshot>(data.clone()) {
                Ok(snapshot) => store.apply_snapshot(snapshot),
                Err(err) => warn!(
                    target: "podium::session",
                    error = %err,
                    "dropping malformed session snapshot"
                ),
            }
        }));
    }

    {
        let store = store.clone();
        guards.push(transport.on(event::QUESTION_START, move |data| {
            match serde_json::from_value::<QuestionStart>(data.clone()) {
                Ok(start) => {
                    store.apply_question_start(start);
                }
                Err(err) => warn!(
                    target: "podium::session",
                    error = %err,
                    "dropping malformed question-start"
                ),
            }
        }));
    }

    {
        let store = store.clone();
        guards.push(transport.on(event::QUESTION_REVEAL, move |data| {
            match serde_json::from_value::<QuestionReveal>(data.clone()) {
                Ok(reveal) => store.apply_question_reveal(reveal),
                Err(err) => warn!(
                    target: "podium::session",
                    error = %err,
                    "dropping malformed question-reveal"
                ),
            }
        }));
    }

    {
        let store = store.clone();
        guards.push(transport.on(event::SESSION_END, move |_| {
            store.apply_session_end();
        }));
    }

    // With no pending join these are informational only; a pending join's
    // one-shot listener is the party that surfaces them.
    for name in [event::SESSION_ERROR, event::CONNECTION_ERROR] {
        guards.push(transport.on(name, move |data| {
            let message = data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("<no message>");
            debug!(
                target: "podium::session",
                event = name,
                message,
                "server error outside any pending operation"
            );
        }));
    }

    guards
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionStatus;
    use crate::transport::mock::{MockConnector, MockServerHandle};
    use serde_json::json;

    fn setup() -> (SessionClient, MockServerHandle, Arc<SessionStore>) {
        let (connector, server) = MockConnector::pair();
        let transport = TransportHandle::new(connector);
        let store = Arc::new(SessionStore::new());
        let client = SessionClient::new(
            transport,
            store.clone(),
            Url::parse("ws://127.0.0.1:9/ws").unwrap(),
        );
        (client, server, store)
    }

    fn ready_payload(code: &str) -> Value {
        json!({
            "code": code,
            "title": "Friday Quiz",
            "hostName": "Dana",
            "totalQuestions": 10,
            "status": "lobby",
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn answer_host(server: &MockServerHandle, code: &'static str) {
        let server = server.clone();
        tokio::spawn(async move {
            server.wait_for(event::JOIN_REQUEST).await;
            server.emit(event::SESSION_READY, ready_payload(code));
        });
    }

    #[test_timeout::tokio_timeout_test]
    async fn join_happy_path_populates_store() {
        let (client, server, store) = setup();
        answer_host(&server, "AB12");

        let session = client.join("ab12", "Alice", 3).await.unwrap();
        assert_eq!(session.code, "AB12");
        assert_eq!(session.status, SessionStatus::Lobby);
        assert_eq!(session.total_questions, 10);

        let held = store.session().unwrap();
        assert_eq!(held.code, "AB12");
        assert_eq!(held.status, SessionStatus::Lobby);

        let request = server.wait_for(event::JOIN_REQUEST).await;
        assert_eq!(
            request.data,
            json!({"code": "AB12", "displayName": "Alice", "avatarId": 3})
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn short_code_fails_locally_with_zero_network_activity() {
        let (client, server, store) = setup();
        let err = client.join("A", "Alice", 3).await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(ref v) if v.field == "code"));
        assert_eq!(server.connect_count(), 0);
        assert!(server.sent().is_empty());
        assert!(store.session().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn overlong_code_and_bad_name_fail_locally() {
        let (client, server, _store) = setup();
        let err = client.join("A1B2C3D4E", "Alice", 3).await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(ref v) if v.field == "code"));
        let err = client.join("AB12", "", 3).await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(ref v) if v.field == "displayName"));
        let err = client.join("AB12", "Alice", 0).await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(ref v) if v.field == "avatarId"));
        assert_eq!(server.connect_count(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn join_times_out_when_server_stays_silent() {
        tokio::time::pause();
        let (client, server, store) = setup();

        let err = client.join("AB12", "Alice", 3).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
        assert!(store.session().is_none());
        assert_eq!(server.sent_events(), vec![event::JOIN_REQUEST.to_string()]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn late_arrivals_after_timeout_do_not_write_the_store() {
        tokio::time::pause();
        let (client, server, store) = setup();

        let err = client.join("AB12", "Alice", 3).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));

        // The server resolves the request late; the attempt's listeners
        // are gone and the standing handler refuses a session-less write.
        server.emit(event::SESSION_ERROR, json!({"message": "unknown code"}));
        server.emit(event::SESSION_READY, ready_payload("AB12"));
        settle().await;
        assert!(store.session().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn server_rejection_is_surfaced_verbatim() {
        let (client, server, store) = setup();
        {
            let server = server.clone();
            tokio::spawn(async move {
                server.wait_for(event::JOIN_REQUEST).await;
                server.emit(event::SESSION_ERROR, json!({"message": "session full"}));
            });
        }

        let err = client.join("AB12", "Alice", 3).await.unwrap_err();
        match err {
            ClientError::Session(message) => assert_eq!(message, "session full"),
            other => panic!("expected session error, got {other:?}"),
        }
        assert!(store.session().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn leave_clears_state_synchronously() {
        let (client, server, store) = setup();
        answer_host(&server, "AB12");
        client.join("AB12", "Alice", 3).await.unwrap();

        client.leave();
        assert!(store.session().is_none());
        assert!(store.current_question().is_none());
        settle().await;
        assert!(server
            .sent_events()
            .contains(&event::LEAVE_REQUEST.to_string()));
    }

    #[test_timeout::tokio_timeout_test]
    async fn leave_works_without_connectivity() {
        let (client, server, store) = setup();
        answer_host(&server, "AB12");
        client.join("AB12", "Alice", 3).await.unwrap();

        client.transport().close();
        client.leave();
        assert!(store.session().is_none());
        // No leave-request made it out; only the join did.
        assert_eq!(server.sent_events(), vec![event::JOIN_REQUEST.to_string()]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stale_snapshot_mid_question_replaces_wholesale() {
        let (client, server, store) = setup();
        answer_host(&server, "AB12");
        client.join("AB12", "Alice", 3).await.unwrap();

        server.emit(
            event::QUESTION_START,
            json!({
                "index": 0,
                "prompt": "Capital of France?",
                "options": ["Paris", "Lyon"],
                "deadlineMs": 20000,
            }),
        );
        settle().await;
        assert_eq!(store.current_question().unwrap().index, 0);

        // A stale/duplicate snapshot still fully replaces the session —
        // no merge — and the lobby status clears the question.
        server.emit(event::SESSION_READY, ready_payload("AB12"));
        settle().await;
        let session = store.session().unwrap();
        assert_eq!(session.status, SessionStatus::Lobby);
        assert!(store.current_question().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn question_right_behind_ready_is_not_lost() {
        let (client, server, store) = setup();
        {
            let server = server.clone();
            tokio::spawn(async move {
                server.wait_for(event::JOIN_REQUEST).await;
                // Back-to-back frames: the snapshot must land before the
                // question is dequeued.
                server.emit(event::SESSION_READY, ready_payload("AB12"));
                server.emit(
                    event::QUESTION_START,
                    json!({
                        "index": 0,
                        "prompt": "Capital of France?",
                        "options": ["Paris", "Lyon"],
                        "deadlineMs": 20000,
                    }),
                );
            });
        }

        client.join("AB12", "Alice", 3).await.unwrap();
        settle().await;
        assert_eq!(store.current_question().unwrap().index, 0);
        assert_eq!(store.session().unwrap().status, SessionStatus::Active);
    }

    #[test_timeout::tokio_timeout_test]
    async fn question_events_flow_into_the_store() {
        let (client, server, store) = setup();
        answer_host(&server, "AB12");
        client.join("AB12", "Alice", 3).await.unwrap();

        server.emit(
            event::QUESTION_START,
            json!({
                "index": 0,
                "prompt": "Capital of France?",
                "options": ["Paris", "Lyon"],
                "deadlineMs": 20000,
            }),
        );
        settle().await;
        assert_eq!(store.session().unwrap().status, SessionStatus::Active);

        server.emit(
            event::QUESTION_REVEAL,
            json!({"correctOption": 0, "stats": {"counts": [7, 2]}}),
        );
        settle().await;
        assert!(store.current_question().is_none());
        assert_eq!(store.reveals().len(), 1);

        server.emit(event::SESSION_END, json!({}));
        settle().await;
        assert_eq!(store.session().unwrap().status, SessionStatus::Finished);
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_inbound_payloads_are_dropped() {
        let (client, server, store) = setup();
        answer_host(&server, "AB12");
        client.join("AB12", "Alice", 3).await.unwrap();

        server.emit(event::QUESTION_START, json!({"index": "zero"}));
        server.emit(event::SESSION_READY, json!({"code": 7}));
        settle().await;
        assert!(store.current_question().is_none());
        assert_eq!(store.session().unwrap().code, "AB12");
    }

    #[test_timeout::tokio_timeout_test]
    async fn answer_is_validated_and_sent() {
        let (client, server, store) = setup();
        answer_host(&server, "AB12");
        client.join("AB12", "Alice", 3).await.unwrap();

        // No question yet.
        assert!(matches!(
            client.answer(0),
            Err(ClientError::Validation(_))
        ));

        server.emit(
            event::QUESTION_START,
            json!({
                "index": 4,
                "prompt": "2 + 2?",
                "options": ["3", "4"],
                "deadlineMs": 10000,
            }),
        );
        settle().await;
        assert!(store.current_question().is_some());

        assert!(matches!(
            client.answer(2),
            Err(ClientError::Validation(_))
        ));
        client.answer(1).unwrap();
        let sent = server.wait_for(event::ANSWER_REQUEST).await;
        assert_eq!(sent.data, json!({"questionIndex": 4, "optionIndex": 1}));
    }

    #[test_timeout::tokio_timeout_test]
    async fn concurrent_join_is_rejected_without_touching_profile() {
        tokio::time::pause();
        let (client, _server, store) = setup();

        let first = client.join("AB12", "Alice", 3);
        tokio::pin!(first);
        // Drive the first join until its request is pending, then leave it
        // parked on the response race.
        tokio::select! {
            outcome = &mut first => panic!("join resolved early: {outcome:?}"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }

        let err = client.join("AB12", "Bob", 4).await.unwrap_err();
        assert!(matches!(err, ClientError::Pending));
        let participant = store.participant().unwrap();
        assert_eq!(participant.display_name, "Alice");
        assert_eq!(participant.avatar_id, 3);
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejoin_resends_profile() {
        let (client, server, store) = setup();
        answer_host(&server, "AB12");
        client.join("AB12", "Alice", 3).await.unwrap();
        client.leave();

        answer_host(&server, "ZZ99");
        client.join("ZZ99", "Alice", 3).await.unwrap();
        assert_eq!(store.session().unwrap().code, "ZZ99");

        let joins: Vec<_> = server
            .sent()
            .into_iter()
            .filter(|env| env.event == event::JOIN_REQUEST)
            .collect();
        assert_eq!(joins.len(), 2);
        assert_eq!(joins[1].data["displayName"], json!("Alice"));
    }
}
