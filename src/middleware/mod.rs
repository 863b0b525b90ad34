pub mod builder;

use crate::action::ActionKind;
use crate::actor::Actor;
use crate::backend::{Backend, WindowStatus};
use crate::checker::{Evaluation, RateLimitChecker};
use crate::error::Error;
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use builder::ActionRateLimiterBuilder;
use futures::future::{ok, LocalBoxFuture, Ready};
use std::cell::RefCell;
use std::{future::Future, rc::Rc};

type AllowedTransformation = dyn Fn(&mut HeaderMap, Option<&WindowStatus>, bool);
type DeniedResponse = dyn Fn(&Evaluation) -> HttpResponse;
type RollbackCondition = dyn Fn(StatusCode) -> bool;

/// Middleware that applies the limit of one [ActionKind] to the wrapped routes.
pub struct ActionRateLimiter<B, F> {
    checker: RateLimitChecker<B>,
    action: ActionKind,
    actor_fn: Rc<F>,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<B, F> Clone for ActionRateLimiter<B, F>
where
    B: Backend,
{
    fn clone(&self) -> Self {
        Self {
            checker: self.checker.clone(),
            action: self.action.clone(),
            actor_fn: self.actor_fn.clone(),
            fail_open: self.fail_open,
            allowed_transformation: self.allowed_transformation.clone(),
            denied_response: self.denied_response.clone(),
            rollback_condition: self.rollback_condition.clone(),
        }
    }
}

impl<B, F, O> ActionRateLimiter<B, F>
where
    B: Backend,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<Actor, actix_web::Error>>,
{
    /// # Arguments
    ///
    /// * `checker`: The checker holding the policies and counter store.
    /// * `action`: The action kind to count requests against.
    /// * `actor_fn`: A future that resolves the acting user from the incoming request.
    pub fn builder(
        checker: RateLimitChecker<B>,
        action: ActionKind,
        actor_fn: F,
    ) -> ActionRateLimiterBuilder<B, F> {
        ActionRateLimiterBuilder::new(checker, action, actor_fn)
    }
}

impl<S, Bd, B, F, O> Transform<S, ServiceRequest> for ActionRateLimiter<B, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<Bd>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    Bd: 'static,
    B: Backend,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<Actor, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<Bd>>;
    type Error = actix_web::Error;
    type Transform = ActionRateLimiterMiddleware<S, B, F>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(ActionRateLimiterMiddleware {
            service: Rc::new(RefCell::new(service)),
            checker: self.checker.clone(),
            action: self.action.clone(),
            actor_fn: Rc::clone(&self.actor_fn),
            fail_open: self.fail_open,
            allowed_transformation: self.allowed_transformation.clone(),
            denied_response: self.denied_response.clone(),
            rollback_condition: self.rollback_condition.clone(),
        })
    }
}

pub struct ActionRateLimiterMiddleware<S, B, F> {
    service: Rc<RefCell<S>>,
    checker: RateLimitChecker<B>,
    action: ActionKind,
    actor_fn: Rc<F>,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<S, Bd, B, F, O> Service<ServiceRequest> for ActionRateLimiterMiddleware<S, B, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<Bd>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    Bd: 'static,
    B: Backend,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<Actor, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<Bd>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let checker = self.checker.clone();
        let action = self.action.clone();
        let actor_fn = self.actor_fn.clone();
        let fail_open = self.fail_open;
        let allowed_transformation = self.allowed_transformation.clone();
        let denied_response = self.denied_response.clone();
        let rollback_condition = self.rollback_condition.clone();

        Box::pin(async move {
            let actor = match (actor_fn)(&req).await {
                Ok(actor) => actor,
                Err(e) => {
                    log::error!("Rate limiter actor function failed: {e}");
                    return Ok(req.into_response(e.error_response()).map_into_right_body());
                }
            };

            let evaluation = match checker.evaluate(&actor, &action).await {
                Ok(evaluation) => {
                    if evaluation.is_limited() {
                        let response: HttpResponse = (denied_response)(&evaluation);
                        return Ok(req.into_response(response).map_into_right_body());
                    }
                    Some(evaluation)
                }
                // Unable to query rate limiter backend
                Err(e @ Error::BackendUnavailable(_)) => {
                    if fail_open {
                        log::warn!("Rate limiter failed: {e}, allowing {actor} anyway");
                        None
                    } else {
                        log::error!("Rate limiter failed: {e}");
                        return Ok(req.into_response(e.error_response()).map_into_right_body());
                    }
                }
                Err(e) => {
                    log::warn!("Rate limiter rejected {actor} on {action}: {e}");
                    return Ok(req.into_response(e.error_response()).map_into_right_body());
                }
            };

            let mut service_response = service.call(req).await?;

            let mut rolled_back = false;
            if let (Some(evaluation), Some(rollback_condition)) = (&evaluation, rollback_condition) {
                let status = service_response.status();
                if rollback_condition(status) {
                    if let Err(e) = checker.rollback(evaluation).await {
                        log::error!("Unable to rollback rate-limit count for response: {:?}, error: {e}", status);
                    } else {
                        rolled_back = true;
                    };
                }
            }

            if let Some(transformation) = allowed_transformation {
                let status = evaluation.as_ref().and_then(|e| e.status.as_ref());
                (transformation)(service_response.headers_mut(), status, rolled_back);
            }

            Ok(service_response.map_into_left_body())
        })
    }
}
