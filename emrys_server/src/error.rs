use std::io::Cursor;

use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use thiserror::Error;

/// A report that failed validation at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    Missing(String),

    #[error("field `{field}` must be within [0, 1], got {value}")]
    OutOfRange { field: String, value: f64 },
}

/// Failure to read a snapshot file back at startup.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to read snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed status snapshot: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed gpu log at line {line}: {reason}")]
    Csv { line: usize, reason: String },
}

/// Errors surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid credential")]
    InvalidCredential,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown machine `{0}`")]
    NotFound(String),

    #[error("internal error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::InvalidCredential => Status::Unauthorized,
            ApiError::Validation(_) => Status::BadRequest,
            ApiError::NotFound(_) => Status::NotFound,
            ApiError::Internal => Status::InternalServerError,
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let body = serde_json::json!({ "detail": self.to_string() }).to_string();
        Response::build()
            .status(self.status())
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}
