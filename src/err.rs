#![allow(non_snake_case)]

use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;

use serde::Serialize;

use crate::engine::AttendanceError;
use crate::store::StoreError;

pub async fn handler404(path: Uri) -> (StatusCode, Json<Error>) {
    (
        StatusCode::NOT_FOUND,
        Json(Error::NotFound {
            message: format!("Invalid path: {}", path),
        }),
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Maybe<T> {
    Nothing(Error),
    Fine(Success<T>),
}

pub fn Fine<V>(v: V) -> Maybe<V>
where
    V: Serialize,
{
    Maybe::Fine(Success::of(v))
}

pub fn Nothing<V>(err: Error) -> Maybe<V> {
    Maybe::Nothing(err)
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<T> IntoResponse for Maybe<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        match self {
            Maybe::Nothing(err) => err.into_response(),
            Maybe::Fine(success) => Json::into_response(Json(success)),
        }
    }
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error")]
pub enum Error {
    NotFound { message: String },
    NoOtpIssued { message: String },
    AlreadyUsed { message: String },
    Expired { message: String },
    Mismatch { message: String },
    TooEarly { message: String, retry_after_seconds: Option<i64> },
    AlreadyMarked { message: String },
    AlreadyExists { message: String },
    BroadcastInProgress { message: String },
    InvalidPayload { message: String },
    InternalError { kind: &'static str, message: String },
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            // informational: the student is already counted
            Error::AlreadyUsed { .. } | Error::AlreadyMarked { .. } => StatusCode::OK,
            Error::TooEarly { .. } => StatusCode::FORBIDDEN,
            Error::AlreadyExists { .. } | Error::BroadcastInProgress { .. } => StatusCode::CONFLICT,
            Error::InternalError { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::NoOtpIssued { .. }
            | Error::Expired { .. }
            | Error::Mismatch { .. }
            | Error::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
        }
    }

    pub fn invalid<S: Into<String>>(msg: S) -> Error {
        Error::InvalidPayload {
            message: msg.into(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<AttendanceError> for Error {
    fn from(err: AttendanceError) -> Self {
        let message = err.to_string();
        match err {
            AttendanceError::NotFound(_) => Self::NotFound { message },
            AttendanceError::NoOtpIssued => Self::NoOtpIssued { message },
            AttendanceError::AlreadyUsed => Self::AlreadyUsed { message },
            AttendanceError::Expired => Self::Expired { message },
            AttendanceError::Mismatch => Self::Mismatch { message },
            AttendanceError::TooEarly {
                retry_after_seconds,
            } => Self::TooEarly {
                message,
                retry_after_seconds,
            },
            AttendanceError::AlreadyMarked => Self::AlreadyMarked { message },
            AttendanceError::AlreadyExists(_) => Self::AlreadyExists { message },
            AttendanceError::InvalidInput(_) => Self::InvalidPayload { message },
            AttendanceError::BroadcastInProgress => Self::BroadcastInProgress { message },
            AttendanceError::StoreUnavailable(store) => store.into(),
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        log::error!("Store failure: {}", err);
        Self::InternalError {
            kind: "StoreUnavailable",
            message: err.to_string(),
        }
    }
}

impl From<uuid::Error> for Error {
    fn from(id: uuid::Error) -> Self {
        Self::InvalidPayload {
            message: format!("invalid student id: {}", id),
        }
    }
}
