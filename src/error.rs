use thiserror::Error;

/// Typed error hierarchy shared by the store, the writer, the model callers
/// and the job executor.
///
/// Serializes as a plain string so command results can be handed to any
/// JSON consumer unchanged, while Rust code keeps typed variants that can be
/// matched or propagated with `?`.
#[derive(Debug, Error)]
pub enum AppError {
    /// Timeout, rate limit, temporary unavailability. Retried by the caller.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Auth failure, malformed request, model refusal. Never retried.
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Missing or corrupt audio/transcript. Fails the job, never retried.
    #[error("Invalid input: {0}")]
    InputData(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// A recorded model call failed; carries the call id for audit.
    #[error("Model call {call_id} failed: {message}")]
    ModelCall { call_id: i64, message: String },

    #[error("writer unavailable")]
    WriterUnavailable,

    /// Another process owns the writer for this data directory.
    #[error("writer unavailable: another instance is running ({0})")]
    InstanceLocked(String),

    /// The writer received the action but the transaction was rejected.
    #[error("Write rejected: {0}")]
    Arbitration(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("already terminal: {0}")]
    AlreadyTerminal(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Database(String),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// Whether a model caller may retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Transient(_))
    }

    /// Whether the job executor may re-run the current stage.
    ///
    /// Only rejected writes qualify; an unreachable writer is fatal.
    pub fn is_arbitration(&self) -> bool {
        matches!(self, AppError::Arbitration(_) | AppError::Database(_))
    }
}

/// Serialize as a plain string.
impl serde::Serialize for AppError {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

// ── From impls ─────────────────────────────────────────────────────────────

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<AppError>() {
            Ok(app) => app,
            Err(e) => AppError::Database(e.to_string()),
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(e: serde_yaml::Error) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<hound::Error> for AppError {
    fn from(e: hound::Error) -> Self {
        match e {
            hound::Error::IoError(io) => AppError::Io(io.to_string()),
            other => AppError::InputData(format!("Malformed audio: {}", other)),
        }
    }
}

/// Network failures are transient unless the server rejected the request
/// itself (4xx other than 408/429).
impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return classify_http_status(status.as_u16(), &e.to_string());
        }
        if e.is_builder() || e.is_decode() {
            AppError::Permanent(e.to_string())
        } else {
            AppError::Transient(e.to_string())
        }
    }
}

/// Map an HTTP status from an external collaborator onto the error taxonomy.
pub fn classify_http_status(status: u16, body: &str) -> AppError {
    match status {
        408 | 425 | 429 => AppError::Transient(format!("HTTP {}: {}", status, body)),
        500..=599 => AppError::Transient(format!("HTTP {}: {}", status, body)),
        _ => AppError::Permanent(format!("HTTP {}: {}", status, body)),
    }
}

/// Allows `.map_err(|e| format!("…", e))?` and `ok_or_else(|| format!(…))?`
/// to coerce into AppError without changing the call sites.
impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Other(s)
    }
}

/// Allows `.ok_or("literal string")?` to coerce into AppError.
impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Other(s.to_string())
    }
}
