use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

// ─── Core error kinds ───────────────────────────────────────────────────────

/// Application-wide error type.
///
/// Each variant is an error *kind* with a stable wire code; the carried
/// string is the human-readable detail. Per-session errors never terminate
/// other sessions or the process — the only fatal conditions (SFU worker
/// death, relational-store corruption) are handled at the call site with an
/// explicit process exit.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed JSON, unknown action, or an action against the wrong role.
    #[error("{0}")]
    Protocol(String),

    /// No free UDP port, no free model slot. Retry is the caller's problem.
    #[error("{0}")]
    ResourceExhausted(String),

    /// A transport/produce/consume call into the media engine failed.
    #[error("{0}")]
    Sfu(String),

    /// No usable transcription model artifact on disk.
    #[error("{0}")]
    ModelMissing(String),

    /// The transcription adapter died; the session is unrecoverable.
    #[error("{0}")]
    AdapterFatal(String),

    /// Embedding generation failed; the transcript row stays un-indexed.
    #[error("{0}")]
    Embedding(String),

    /// A converter or writer sink crashed; isolated to that sink.
    #[error("{0}")]
    Sink(String),

    /// Bad API key, bad join token.
    #[error("{0}")]
    Auth(String),

    /// Duplicate name per tenant, already-recording room.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Stable machine-readable code used in REST envelopes and signaling
    /// `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol_error",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::Sfu(_) => "sfu_failure",
            Self::ModelMissing(_) => "model_missing",
            Self::AdapterFatal(_) => "adapter_fatal",
            Self::Embedding(_) => "embedding_failure",
            Self::Sink(_) => "sink_failure",
            Self::Auth(_) => "auth_failure",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Db(_) => "database_error",
            Self::Io(_) => "io_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Protocol(_) => StatusCode::BAD_REQUEST,
            Self::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Sfu(_)
            | Self::ModelMissing(_)
            | Self::AdapterFatal(_)
            | Self::Embedding(_)
            | Self::Sink(_)
            | Self::Db(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    // ─── Convenience constructors ───────────────────────────────────────

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn sfu(msg: impl Into<String>) -> Self {
        Self::Sfu(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn ports_exhausted(range: (u16, u16)) -> Self {
        Self::ResourceExhausted(format!(
            "no free UDP port in range {}-{}",
            range.0, range.1
        ))
    }
}

// ─── REST boundary envelope ─────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(code = self.code(), status = status.as_u16(), "{message}");
        } else {
            tracing::warn!(code = self.code(), status = status.as_u16(), "{message}");
        }

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code(),
                message,
                status: status.as_u16(),
            },
        };

        (status, Json(envelope)).into_response()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
