use crate::protocol::{QuestionReveal, QuestionStart, SessionSnapshot, SessionStatus};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// The session this device currently believes it is in. Created on a
/// successful join, replaced wholesale by every authoritative snapshot,
/// destroyed on leave or terminal failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub code: String,
    pub title: String,
    pub host_name: String,
    pub total_questions: u32,
    pub status: SessionStatus,
}

impl From<SessionSnapshot> for Session {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            code: snapshot.code.as_str().to_string(),
            title: snapshot.title,
            host_name: snapshot.host_name,
            total_questions: snapshot.total_questions,
            status: snapshot.status,
        }
    }
}

/// This device's own participant profile. Never mutated by session
/// events; survives `reset()` so a re-join can resend it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub display_name: String,
    pub avatar_id: u8,
}

/// The single in-flight question. Replaced, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentQuestion {
    pub index: u32,
    pub prompt: String,
    pub options: Vec<String>,
    pub deadline: Duration,
    pub issued_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RevealedQuestion {
    pub index: u32,
    pub correct_option: u32,
    pub stats: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct QuizState {
    pub session: Option<Session>,
    pub question: Option<CurrentQuestion>,
    pub reveals: Vec<RevealedQuestion>,
    pub participant: Option<Participant>,
}

/// Single source of truth for the participant's view of the quiz.
/// Single-writer discipline: only the protocol client's event handlers
/// and explicit `reset`/profile calls mutate it; everything else holds a
/// read-only `watch::Receiver`.
pub struct SessionStore {
    state: watch::Sender<QuizState>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(QuizState::default());
        Self { state }
    }

    pub fn subscribe(&self) -> watch::Receiver<QuizState> {
        self.state.subscribe()
    }

    pub fn session(&self) -> Option<Session> {
        self.state.borrow().session.clone()
    }

    pub fn session_held(&self) -> bool {
        self.state.borrow().session.is_some()
    }

    pub fn current_question(&self) -> Option<CurrentQuestion> {
        self.state.borrow().question.clone()
    }

    pub fn reveals(&self) -> Vec<RevealedQuestion> {
        self.state.borrow().reveals.clone()
    }

    pub fn participant(&self) -> Option<Participant> {
        self.state.borrow().participant.clone()
    }

    /// Explicit profile write; the only way participant identity changes.
    pub fn set_participant(&self, participant: Participant) {
        self.state.send_modify(|state| {
            state.participant = Some(participant);
        });
    }

    /// Wholesale replace: the snapshot supersedes the prior Session
    /// entirely, never merging. The in-flight question survives only if
    /// the snapshot still reports the session as active.
    pub fn apply_snapshot(&self, snapshot: SessionSnapshot) {
        self.state.send_modify(|state| {
            let session = Session::from(snapshot);
            if session.status != SessionStatus::Active {
                state.question = None;
            }
            debug!(
                target: "podium::store",
                code = %session.code,
                status = %session.status,
                "applied session snapshot"
            );
            state.session = Some(session);
        });
    }

    /// Returns false when the event is not applicable (no session held,
    /// or the session already finished) and was dropped.
    pub fn apply_question_start(&self, start: QuestionStart) -> bool {
        let mut applied = false;
        self.state.send_modify(|state| {
            let Some(session) = state.session.as_mut() else {
                return;
            };
            if session.status == SessionStatus::Finished {
                return;
            }
            // A question arriving in the lobby moves the session to
            // active as part of the same event.
            session.status = SessionStatus::Active;
            state.question = Some(CurrentQuestion {
                index: start.index,
                prompt: start.prompt.clone(),
                options: start.options.clone(),
                deadline: Duration::from_millis(start.deadline_ms),
                issued_at: Instant::now(),
            });
            applied = true;
        });
        if !applied {
            debug!(
                target: "podium::store",
                index = start.index,
                "dropped question-start with no applicable session"
            );
        }
        applied
    }

    pub fn apply_question_reveal(&self, reveal: QuestionReveal) {
        self.state.send_modify(|state| {
            let index = state.question.take().map(|q| q.index).unwrap_or_else(|| {
                state.reveals.len() as u32
            });
            state.reveals.push(RevealedQuestion {
                index,
                correct_option: reveal.correct_option,
                stats: reveal.stats.clone(),
            });
        });
    }

    pub fn apply_session_end(&self) {
        self.state.send_modify(|state| {
            if let Some(session) = state.session.as_mut() {
                session.status = SessionStatus::Finished;
            }
            state.question = None;
        });
    }

    /// Clears Session and Current Question unconditionally. Used on
    /// explicit leave and on fatal connection failure. The participant
    /// profile is identity, not session state, and is kept.
    pub fn reset(&self) {
        self.state.send_modify(|state| {
            state.session = None;
            state.question = None;
            state.reveals.clear();
        });
    }
}
