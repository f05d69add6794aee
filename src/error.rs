//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the engine, persistence layer, identity
//! store, and transport returns `Result<_, AppError>`.  REST handlers
//! convert an `AppError` into a status code and `{detail}` body; the
//! real-time transport converts it into an `error` frame.  Both surfaces
//! key off `AppError::kind()`, never off the `Display` text.
use hyper::StatusCode;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
  #[error("authentication failed")]
  Authentication,

  #[error("permission denied: {0}")]
  Authorization(String),

  #[error("validation failed: {0}")]
  Validation(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("gone: {0}")]
  Gone(String),

  #[error("conflict: {0}")]
  Conflict(String),

  #[error("rate limited, retry after {retry_after_secs}s")]
  RateLimited { retry_after_secs: u64 },

  #[error("transient failure: {0}")]
  Transient(String),

  #[error("fatal error: {0}")]
  Fatal(String),
}

impl AppError {
  /// Stable, machine-readable tag surfaced to clients (never the `Display` text).
  #[must_use]
  pub fn kind(&self) -> &'static str {
    match self {
      AppError::Authentication => "authentication",
      AppError::Authorization(_) => "authorization",
      AppError::Validation(_) => "validation",
      AppError::NotFound(_) => "not_found",
      AppError::Gone(_) => "gone",
      AppError::Conflict(_) => "conflict",
      AppError::RateLimited { .. } => "rate_limited",
      AppError::Transient(_) => "transient",
      AppError::Fatal(_) => "fatal",
    }
  }

  #[must_use]
  pub fn status(&self) -> StatusCode {
    match self {
      AppError::Authentication => StatusCode::UNAUTHORIZED,
      AppError::Authorization(_) => StatusCode::FORBIDDEN,
      AppError::Validation(_) => StatusCode::BAD_REQUEST,
      AppError::NotFound(_) => StatusCode::NOT_FOUND,
      AppError::Gone(_) => StatusCode::GONE,
      AppError::Conflict(_) => StatusCode::CONFLICT,
      AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
      AppError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
      AppError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  #[must_use]
  pub fn not_found(what: impl Into<String>) -> Self {
    AppError::NotFound(what.into())
  }

  #[must_use]
  pub fn conflict(what: impl Into<String>) -> Self {
    AppError::Conflict(what.into())
  }

  #[must_use]
  pub fn gone(what: impl Into<String>) -> Self {
    AppError::Gone(what.into())
  }

  #[must_use]
  pub fn validation(what: impl Into<String>) -> Self {
    AppError::Validation(what.into())
  }

  #[must_use]
  pub fn forbidden(what: impl Into<String>) -> Self {
    AppError::Authorization(what.into())
  }

  /// Shape sent on the wire, both as a REST JSON body and as the `data`
  /// of a real-time `error` frame.
  #[must_use]
  pub fn to_wire(&self) -> ErrorBody {
    ErrorBody {
      kind: self.kind(),
      message: self.to_string(),
      detail: None,
    }
  }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
  pub kind: &'static str,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub detail: Option<String>,
}

impl From<sqlx::Error> for AppError {
  fn from(e: sqlx::Error) -> Self {
    match e {
      sqlx::Error::RowNotFound => AppError::NotFound("row not found".to_string()),
      other => AppError::Transient(other.to_string()),
    }
  }
}

impl From<sqlx::migrate::MigrateError> for AppError {
  fn from(e: sqlx::migrate::MigrateError) -> Self {
    AppError::Fatal(format!("migration error: {e}"))
  }
}

impl From<jsonwebtoken::errors::Error> for AppError {
  fn from(_: jsonwebtoken::errors::Error) -> Self {
    AppError::Authentication
  }
}

impl From<bcrypt::BcryptError> for AppError {
  fn from(e: bcrypt::BcryptError) -> Self {
    AppError::Transient(format!("password hashing error: {e}"))
  }
}

impl From<serde_json::Error> for AppError {
  fn from(e: serde_json::Error) -> Self {
    AppError::Validation(format!("malformed json: {e}"))
  }
}

pub type AppResult<T> = Result<T, AppError>;
