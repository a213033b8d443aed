use std::borrow::Cow;

use http::StatusCode;

/// ErrorMetadata can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It tags an error with the information
/// needed to classify it at the boundary of the system.
///
/// The `msg` is conveyed as the user-facing error message if the error makes
/// it to a client.
///
/// The `short_msg` is a stable tag, resilient to changes in copy. Tests match
/// on it, and the HTTP layer sends it as a machine-readable code alongside
/// `msg`.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// Short ScreamingCamelCase tag, e.g. `FileNameConflict`. Usable in tests
    /// for string matching.
    pub short_msg: Cow<'static, str>,
    /// Human readable description, e.g. "a file named notes.txt already
    /// exists in this folder".
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    /// A body or reservation does not fit: oversize streams and exceeded
    /// storage quotas.
    PayloadTooLarge,
    /// Transient failure talking to a storage provider or the metadata
    /// store. Clients may retry.
    Overloaded,
    InternalServerError,
}

impl ErrorCode {
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a client can expect the same request to eventually succeed
    /// without changing anything on their side.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::Overloaded)
    }
}

impl ErrorMetadata {
    /// Bad Request. Maps to 400 in HTTP.
    ///
    /// The short_msg should be CapitalCamelCase describing the error. The msg
    /// should be a descriptive message targeted toward the developer.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Resource not found. Maps to 404 in HTTP.
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Not authenticated. Maps to 401 in HTTP.
    pub fn unauthenticated(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unauthenticated,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Authenticated but not allowed to touch the target. Maps to 403.
    pub fn forbidden(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Forbidden,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The operation is forbidden by current state: duplicate multipart
    /// completion, sibling name collisions, moving a folder into its own
    /// subtree. Maps to 409.
    pub fn conflict(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Conflict,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A stream or reservation exceeded a declared maximum. Maps to 413.
    pub fn payload_too_large(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::PayloadTooLarge,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A reservation would push the user past their tier limit.
    pub fn quota_exceeded(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::PayloadTooLarge,
            short_msg: QUOTA_EXCEEDED.into(),
            msg: msg.into(),
        }
    }

    /// Transient provider or metadata-store failure. Maps to 503; the client
    /// retries.
    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

pub const QUOTA_EXCEEDED: &str = "QuotaExceeded";

/// Extension trait to look through an anyhow chain for an attached
/// ErrorMetadata. The outermost attachment wins, so a later `.context()` can
/// reclassify an error on its way up.
pub trait ErrorMetadataAnyhowExt {
    fn error_metadata(&self) -> Option<&ErrorMetadata>;
    fn short_msg(&self) -> Option<&str>;
    fn user_facing_message(&self) -> String;
    fn http_status(&self) -> StatusCode;
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
    fn is_quota_exceeded(&self) -> bool;
    fn is_retryable(&self) -> bool;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn error_metadata(&self) -> Option<&ErrorMetadata> {
        self.chain()
            .find_map(|e| e.downcast_ref::<ErrorMetadata>())
    }

    fn short_msg(&self) -> Option<&str> {
        self.error_metadata().map(|m| &*m.short_msg)
    }

    /// What to show a caller. Untagged errors collapse to a generic message;
    /// the detail stays in the server logs.
    fn user_facing_message(&self) -> String {
        match self.error_metadata() {
            Some(m) => m.msg.to_string(),
            None => "Internal server error".to_string(),
        }
    }

    fn http_status(&self) -> StatusCode {
        self.error_metadata()
            .map(|m| m.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn is_not_found(&self) -> bool {
        self.error_metadata()
            .map(|m| m.code == ErrorCode::NotFound)
            .unwrap_or(false)
    }

    fn is_conflict(&self) -> bool {
        self.error_metadata()
            .map(|m| m.code == ErrorCode::Conflict)
            .unwrap_or(false)
    }

    fn is_quota_exceeded(&self) -> bool {
        self.short_msg() == Some(QUOTA_EXCEEDED)
    }

    fn is_retryable(&self) -> bool {
        self.error_metadata()
            .map(|m| m.is_retryable())
            .unwrap_or(false)
    }
}

/// Log an error that is being swallowed on a best-effort path. The operation
/// reports success to its caller; the sweeper or an operator picks up the
/// pieces.
pub fn report_error(err: &anyhow::Error) {
    tracing::error!("Caught error (actual behavior may vary based on error type): {err:#}");
}
