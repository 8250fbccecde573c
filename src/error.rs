//! Application error model shared by the HTTP surface and the binaries.
//! Storage and mail errors are folded into `AppError`, which knows its HTTP status and
//! renders as a JSON body `{status, code, message}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::notify::EmailError;
use crate::storage::FsError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    UserInput { code: String, message: String },
    NotFound { code: String, message: String },
    Conflict { code: String, message: String },
    Forbidden { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::UserInput { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Conflict { code, .. }
            | AppError::Forbidden { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::UserInput { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Conflict { message, .. }
            | AppError::Forbidden { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn user<S: Into<String>>(code: S, msg: S) -> Self { AppError::UserInput { code: code.into(), message: msg.into() } }
    pub fn not_found<S: Into<String>>(code: S, msg: S) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn conflict<S: Into<String>>(code: S, msg: S) -> Self { AppError::Conflict { code: code.into(), message: msg.into() } }
    pub fn forbidden<S: Into<String>>(code: S, msg: S) -> Self { AppError::Forbidden { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::UserInput { .. } => 400,
            AppError::NotFound { .. } => 404,
            AppError::Conflict { .. } => 409,
            AppError::Forbidden { .. } => 403,
            AppError::Internal { .. } => 500,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<FsError> for AppError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound(p) => AppError::not_found("not_found".to_string(), format!("no such file or directory: {}", p)),
            FsError::AlreadyExists(_) => AppError::conflict("file_exists", "A file with the same name already exists"),
            FsError::InvalidToken(_) => AppError::user("invalid_token", "The confirmation token is not valid"),
            FsError::InvalidPath(why) => AppError::user("invalid_path".to_string(), why),
            FsError::PermissionDenied(p) => AppError::forbidden("permission_denied".to_string(), format!("permission denied: {}", p)),
            FsError::Store(e) => AppError::internal("storage_error".to_string(), e.to_string()),
        }
    }
}

impl From<EmailError> for AppError {
    fn from(err: EmailError) -> Self {
        let message = match err {
            EmailError::Malformed(_) => "The email provided was not valid".to_string(),
            EmailError::DomainNotAllowed(_) => "The email provided was not valid. Only addresses from the accepted domains can upload".to_string(),
        };
        AppError::UserInput { code: "invalid_email".into(), message }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal { code: "internal".into(), message: format!("{:#}", err) }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    status: &'a str,
    code: &'a str,
    message: &'a str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody { status: "error", code: self.code_str(), message: self.message() };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreError;

    #[test]
    fn http_status_mapping() {
        assert_eq!(AppError::user("bad_input", "oops").http_status(), 400);
        assert_eq!(AppError::not_found("not_found", "missing").http_status(), 404);
        assert_eq!(AppError::conflict("conflict", "dup").http_status(), 409);
        assert_eq!(AppError::forbidden("forbidden", "no").http_status(), 403);
        assert_eq!(AppError::internal("internal", "panic").http_status(), 500);
    }

    #[test]
    fn storage_errors_map_to_statuses() {
        assert_eq!(AppError::from(FsError::NotFound("a".into())).http_status(), 404);
        assert_eq!(AppError::from(FsError::AlreadyExists("a".into())).http_status(), 409);
        assert_eq!(AppError::from(FsError::InvalidToken("t".into())).http_status(), 400);
        assert_eq!(AppError::from(FsError::InvalidPath("..".into())).http_status(), 400);
        assert_eq!(AppError::from(FsError::PermissionDenied("a".into())).http_status(), 403);
        let io = FsError::Store(StoreError::CorruptLog("bad crc".into()));
        let mapped = AppError::from(io);
        assert_eq!(mapped.http_status(), 500);
        assert_eq!(mapped.code_str(), "storage_error");
    }

    #[test]
    fn email_errors_are_user_input() {
        let e = AppError::from(EmailError::DomainNotAllowed("x@gmail.com".into()));
        assert_eq!(e.http_status(), 400);
        assert_eq!(e.code_str(), "invalid_email");
    }
}
