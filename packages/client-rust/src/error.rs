//! Error taxonomy for backend calls, session operations, and saves.

use std::time::Duration;

use docform_core::{FieldError, FormError};
use serde_json::Value;

/// Failure reported by a document backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// Server-side validation rejected the document.
    #[error("validation failed: {}", messages.join("; "))]
    Validation { messages: Vec<String> },
    /// A document with the same unique value already exists.
    #[error("duplicate entry: {message}")]
    Duplicate { message: String },
    /// Not permitted; re-authentication is required. Never retried.
    #[error("not permitted: {message}")]
    Authorization { message: String },
    #[error("{doctype} {name} not found")]
    NotFound { doctype: String, name: String },
    /// The document changed on the server since it was loaded.
    #[error("document was modified by someone else: {message}")]
    Conflict { message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("server error {status}: {}", messages.join("; "))]
    Server { status: u16, messages: Vec<String> },
}

impl BackendError {
    /// Only transport failures are worth retrying; everything else needs the
    /// user (re-auth, reload, fix input).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transport(_))
    }

    /// User-facing messages, one per line of feedback.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        match self {
            BackendError::Validation { messages } | BackendError::Server { messages, .. } => {
                messages.clone()
            }
            other => vec![other.to_string()],
        }
    }

    /// Maps an error response onto the taxonomy, using the server's exception
    /// type first and the HTTP status second.
    #[must_use]
    pub fn from_response(status: u16, body: &Value, doctype: &str, name: &str) -> Self {
        let exc_type = body.get("exc_type").and_then(Value::as_str).unwrap_or_default();
        let mut messages = flatten_server_messages(body);
        let first = |messages: &mut Vec<String>, fallback: &str| {
            if messages.is_empty() {
                fallback.to_string()
            } else {
                messages.remove(0)
            }
        };
        match (exc_type, status) {
            ("DuplicateEntryError", _) | ("UniqueValidationError", _) | (_, 409) => BackendError::Duplicate {
                message: first(&mut messages, "duplicate entry"),
            },
            ("TimestampMismatchError", _) => BackendError::Conflict {
                message: first(&mut messages, "document has been modified after you opened it"),
            },
            ("PermissionError", _) | ("AuthenticationError", _) | ("CSRFTokenError", _) | (_, 401 | 403) => {
                BackendError::Authorization {
                    message: first(&mut messages, "not permitted"),
                }
            }
            ("DoesNotExistError", _) | (_, 404) => BackendError::NotFound {
                doctype: doctype.to_string(),
                name: name.to_string(),
            },
            ("ValidationError" | "MandatoryError" | "LinkValidationError", _) | (_, 417) => {
                BackendError::Validation { messages }
            }
            _ => BackendError::Server { status, messages },
        }
    }
}

/// Flattens the message fields of an error body into a plain list.
///
/// `_server_messages` is a JSON string holding an array whose items are
/// themselves JSON strings of `{"message": ...}` objects (or bare strings).
/// `exception` (`module.ExcType: text`) and `message` are used as fallbacks.
#[must_use]
pub fn flatten_server_messages(body: &Value) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(raw) = body.get("_server_messages").and_then(Value::as_str) {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) {
            for item in items {
                let decoded = match &item {
                    Value::String(s) => serde_json::from_str::<Value>(s).unwrap_or(item.clone()),
                    _ => item.clone(),
                };
                if let Some(text) = message_text(&decoded) {
                    out.push(text);
                }
            }
        }
    }
    if out.is_empty() {
        if let Some(exception) = body.get("exception").and_then(Value::as_str) {
            let text = exception
                .split_once(": ")
                .map_or(exception, |(_, rest)| rest)
                .trim();
            if !text.is_empty() {
                out.push(text.to_string());
            }
        }
    }
    if out.is_empty() {
        if let Some(text) = body.get("message").and_then(message_text) {
            out.push(text);
        }
    }
    out
}

fn message_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("message").and_then(Value::as_str)?,
        _ => return None,
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Failure of a session operation other than save.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("form session is closed")]
    Closed,
    #[error("a save is in progress")]
    Busy,
    #[error(transparent)]
    Form(#[from] FormError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Failure of [`crate::FormSession::save`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SaveError {
    #[error("{} field(s) need attention", .0.len())]
    Invalid(Vec<FieldError>),
    #[error(transparent)]
    Backend(BackendError),
    /// The rename step failed; nothing else was sent.
    #[error("could not rename {from} to {to}: {source}")]
    Rename {
        from: String,
        to: String,
        #[source]
        source: BackendError,
    },
    /// Pending lookups feeding the payload did not settle in time.
    #[error("pending lookups did not settle within {waited:?}")]
    Stale { waited: Duration },
    #[error("a save is already in progress")]
    InProgress,
    #[error("form session is closed")]
    Closed,
}
