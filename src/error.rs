//! Error types for the purchases SDK.

use thiserror::Error;

/// Machine-readable error codes.
///
/// Retryability is a property of the code, not of the individual error:
/// callers branch on [`ErrorCode::is_retryable`] to decide whether a failed
/// operation is worth re-attempting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The current user identifier is empty or blank; rejected locally,
    /// never sent over the wire.
    MissingUserIdentifier,
    /// Transport-level failure (unreachable host, timeout). Retryable.
    NetworkUnavailable,
    /// Backend returned a 5xx status. Retryable.
    ServerError,
    /// Backend returned a 4xx status other than 429. Non-retryable.
    ClientRequestError,
    /// Backend returned 429. Retryable with backoff.
    RateLimited,
    /// Response body did not decode into the expected shape. Non-retryable;
    /// indicates protocol drift between SDK and backend.
    MalformedResponse,
    /// The user cancelled the platform purchase flow. Non-fatal.
    PurchaseCancelled,
    /// A purchase attempt for the same product is already in flight.
    PurchaseAlreadyInProgress,
    /// The platform deferred the purchase (e.g. pending external approval).
    PurchaseDeferred,
    /// The backend rejected an attribute value (per-key). Non-retryable.
    InvalidAttributeValue,
    /// Posting the receipt failed after a confirmed platform transaction.
    /// Retryable; the transaction is intentionally left unfinalized so the
    /// platform redelivers it.
    ReceiptPostFailed,
}

impl ErrorCode {
    /// Whether an operation that failed with this code may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable
                | Self::ServerError
                | Self::RateLimited
                | Self::ReceiptPostFailed
        )
    }
}

/// Error returned by SDK operations.
///
/// Carries a code for programmatic handling, a human-readable message, and
/// the underlying HTTP status when the error originated from the backend.
/// `Clone` so the request deduplicator can fan a single failure out to every
/// waiter of an in-flight call.
#[derive(Debug, Clone, Error)]
#[error("{code:?}: {message}")]
pub struct PurchasesError {
    code: ErrorCode,
    message: String,
    status: Option<u16>,
}

impl PurchasesError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
        }
    }

    /// Create a new error carrying the originating HTTP status.
    pub fn with_status(code: ErrorCode, message: impl Into<String>, status: u16) -> Self {
        Self {
            code,
            message: message.into(),
            status: Some(status),
        }
    }

    /// Transport-level failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkUnavailable, message)
    }

    /// Response decode failure.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MalformedResponse, message)
    }

    /// Empty or blank user identifier.
    pub fn missing_user_id() -> Self {
        Self::new(
            ErrorCode::MissingUserIdentifier,
            "user identifier is empty or blank",
        )
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// HTTP status of the backend response, if the error came from one.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Whether the failed operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

/// Map an HTTP status code to an error code.
///
/// 429 is rate limiting, other 4xx are non-retryable client errors, and
/// everything else that reaches this function (5xx and unexpected codes) is
/// treated as a retryable server-side problem.
pub fn map_status_to_error_code(status: u16) -> ErrorCode {
    match status {
        429 => ErrorCode::RateLimited,
        400..=499 => ErrorCode::ClientRequestError,
        _ => ErrorCode::ServerError,
    }
}

/// Result alias used throughout the SDK.
pub type Result<T> = std::result::Result<T, PurchasesError>;
