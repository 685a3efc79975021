//! Wire protocol for the quiz session server: named JSON events over a
//! persistent WebSocket, one envelope per text frame. Payload fields are
//! camelCase on the wire to match the session server.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Event names exchanged with the session server.
pub mod event {
    pub const JOIN_REQUEST: &str = "join-request";
    pub const LEAVE_REQUEST: &str = "leave-request";
    pub const ANSWER_REQUEST: &str = "answer-request";
    pub const SESSION_READY: &str = "session-ready";
    pub const SESSION_ERROR: &str = "session-error";
    pub const CONNECTION_ERROR: &str = "connection-error";
    pub const QUESTION_START: &str = "question-start";
    pub const QUESTION_REVEAL: &str = "question-reveal";
    pub const SESSION_END: &str = "session-end";
}

/// One wire frame: `{"event": "<name>", "data": {…}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Local input rejected before any network activity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

pub const CODE_MIN_LEN: usize = 4;
pub const CODE_MAX_LEN: usize = 8;
pub const DISPLAY_NAME_MAX_LEN: usize = 20;

/// A session join code, always held canonicalized (trimmed, upper-case).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionCode(String);

impl SessionCode {
    /// Trim and upper-case. Idempotent.
    pub fn canonicalize(raw: &str) -> String {
        raw.trim().to_ascii_uppercase()
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let canon = Self::canonicalize(raw);
        if canon.len() < CODE_MIN_LEN || canon.len() > CODE_MAX_LEN {
            return Err(ValidationError::new(
                "code",
                format!(
                    "must be {CODE_MIN_LEN}-{CODE_MAX_LEN} characters, got {}",
                    canon.len()
                ),
            ));
        }
        if !canon.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ValidationError::new(
                "code",
                "must contain only letters and digits",
            ));
        }
        Ok(Self(canon))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for SessionCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionCode {
    // Inbound codes are canonicalized and validated on ingest so the store
    // never holds a non-canonical code.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SessionCode::parse(&raw).map_err(D::Error::custom)
    }
}

pub fn validate_display_name(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    let len = trimmed.chars().count();
    if len == 0 {
        return Err(ValidationError::new("displayName", "must not be empty"));
    }
    if len > DISPLAY_NAME_MAX_LEN {
        return Err(ValidationError::new(
            "displayName",
            format!("must be at most {DISPLAY_NAME_MAX_LEN} characters, got {len}"),
        ));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(ValidationError::new(
            "displayName",
            "must not contain control characters",
        ));
    }
    Ok(trimmed.to_string())
}

pub fn validate_avatar_id(id: u8) -> Result<u8, ValidationError> {
    if id == 0 {
        return Err(ValidationError::new("avatarId", "must be positive"));
    }
    Ok(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Lobby,
    Active,
    Finished,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Lobby => "lobby",
            SessionStatus::Active => "active",
            SessionStatus::Finished => "finished",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub code: SessionCode,
    pub display_name: String,
    pub avatar_id: u8,
}

/// Authoritative session snapshot; replaces prior state rather than
/// patching it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub code: SessionCode,
    pub title: String,
    pub host_name: String,
    pub total_questions: u32,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionStart {
    pub index: u32,
    pub prompt: String,
    pub options: Vec<String>,
    /// Server-issued answer budget for this question, in milliseconds.
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionReveal {
    pub correct_option: u32,
    #[serde(default)]
    pub stats: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRequest {
    pub question_index: u32,
    pub option_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}
