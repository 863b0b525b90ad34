use crate::action::ActionKind;
use crate::backend::{Backend, WindowStatus};
use crate::checker::{Evaluation, RateLimitChecker};
use crate::error::Error;
use crate::middleware::{
    ActionRateLimiter, AllowedTransformation, DeniedResponse, RollbackCondition,
};
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use once_cell::sync::Lazy;
use std::rc::Rc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

pub struct ActionRateLimiterBuilder<B, F> {
    checker: RateLimitChecker<B>,
    action: ActionKind,
    actor_fn: F,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

fn limit_reached_response(evaluation: &Evaluation) -> HttpResponse {
    Error::LimitReached {
        action: evaluation.action.clone(),
        retry_after: evaluation.retry_after().unwrap_or_default(),
    }
    .error_response()
}

fn insert_status_headers(map: &mut HeaderMap, limit: u64, remaining: u64, reset: u64) {
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(limit));
    map.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(remaining));
    map.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(reset));
}

impl<B, F> ActionRateLimiterBuilder<B, F>
where
    B: Backend,
{
    pub(super) fn new(checker: RateLimitChecker<B>, action: ActionKind, actor_fn: F) -> Self {
        Self {
            checker,
            action,
            actor_fn,
            fail_open: false,
            allowed_transformation: None,
            denied_response: Rc::new(limit_reached_response),
            rollback_condition: None,
        }
    }

    /// Choose whether to allow a request if the backend is unavailable.
    ///
    /// Default is false, the request is answered with 503.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Sets the [ActionRateLimiterBuilder::request_allowed_transformation] and
    /// [ActionRateLimiterBuilder::request_denied_response] functions, such that the following
    /// headers are set in both the allowed and denied responses:
    ///
    /// - `x-ratelimit-limit`\
    /// - `x-ratelimit-remaining`\
    /// - `x-ratelimit-reset` (seconds until the reset)
    /// - `retry-after` (denied only, seconds until the reset)
    ///
    /// Nothing is added for unconfigured actions and exempt actors.
    pub fn add_headers(mut self) -> Self {
        self.allowed_transformation = Some(Rc::new(
            |map: &mut HeaderMap, status: Option<&WindowStatus>, rolled_back: bool| {
                if let Some(status) = status {
                    let remaining = if rolled_back {
                        (status.remaining + 1).min(status.limit)
                    } else {
                        status.remaining
                    };
                    insert_status_headers(map, status.limit, remaining, status.seconds_until_reset());
                }
            },
        ));
        self.denied_response = Rc::new(|evaluation: &Evaluation| {
            let mut response = limit_reached_response(evaluation);
            if let Some(status) = &evaluation.status {
                insert_status_headers(
                    response.headers_mut(),
                    status.limit,
                    status.remaining,
                    status.seconds_until_reset(),
                );
            }
            response
        });
        self
    }

    /// In the event that the request is allowed:
    ///
    /// You can optionally mutate the response headers to include the window status.
    ///
    /// By default no changes are made to the response.
    ///
    /// Note the [WindowStatus] will be [None] if no window was consulted, or if the backend failed
    /// and [ActionRateLimiterBuilder::fail_open] is enabled.
    pub fn request_allowed_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, Option<&WindowStatus>, bool) + 'static,
    {
        self.allowed_transformation = mutation.map(|m| Rc::new(m) as Rc<AllowedTransformation>);
        self
    }

    /// In the event that the request is denied, configure the [HttpResponse] returned.
    ///
    /// Defaults to an empty body with status 429 and a `retry-after` header.
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&Evaluation) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    /// After processing a request, attempt to rollback the attempt count based on the status code
    /// of the returned response.
    ///
    /// By default the count is never rolled back.
    pub fn rollback_condition<C>(mut self, condition: Option<C>) -> Self
    where
        C: Fn(StatusCode) -> bool + 'static,
    {
        self.rollback_condition = condition.map(|m| Rc::new(m) as Rc<RollbackCondition>);
        self
    }

    /// Configures the [ActionRateLimiterBuilder::rollback_condition] to rollback if the status
    /// code is a server error (5xx).
    pub fn rollback_server_errors(mut self) -> Self {
        self.rollback_condition = Some(Rc::new(|status: StatusCode| status.is_server_error()));
        self
    }

    pub fn build(self) -> ActionRateLimiter<B, F> {
        ActionRateLimiter {
            checker: self.checker,
            action: self.action,
            actor_fn: Rc::new(self.actor_fn),
            fail_open: self.fail_open,
            allowed_transformation: self.allowed_transformation,
            denied_response: self.denied_response,
            rollback_condition: self.rollback_condition,
        }
    }
}
