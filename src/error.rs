use crate::action::ActionKind;
use actix_web::http::header::{HeaderValue, RETRY_AFTER};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures surfaced by the [RateLimitChecker](crate::RateLimitChecker).
///
/// An ordinary "limited" decision is not an error; only
/// [RateLimitChecker::check_limit()](crate::RateLimitChecker::check_limit) turns it into
/// [Error::LimitReached].
#[derive(Debug, Error)]
pub enum Error {
    /// The counter store could not be reached, the caller decides whether to fail open or closed.
    #[error("Rate limit backend unavailable: {0}")]
    BackendUnavailable(#[source] BoxError),
    #[error("Invalid actor: {0}")]
    InvalidActor(String),
    #[error("Rate limit reached for {action}, retry after {retry_after} seconds")]
    LimitReached {
        action: ActionKind,
        /// Seconds until the current window resets.
        retry_after: u64,
    },
}

impl Error {
    pub(crate) fn backend<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::BackendUnavailable(Box::new(e))
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::InvalidActor(_) => StatusCode::BAD_REQUEST,
            Error::LimitReached { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = HttpResponse::build(self.status_code()).finish();
        if let Error::LimitReached { retry_after, .. } = self {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(*retry_after));
        }
        response
    }
}
