//! Per-actor, per-action rate limiting.
//!
//! A [RateLimitChecker] looks up the [ThresholdPolicy] of an [ActionKind], picks the threshold
//! for the actor's [TrustTier], and counts the attempt in a shared fixed window [Backend].
//! The [ActionRateLimiter] middleware applies the same check to actix-web routes.
#![cfg_attr(docsrs, feature(doc_cfg))]

mod action;
mod actor;
pub mod backend;
mod checker;
pub mod config;
mod error;
mod middleware;
pub mod policy;
mod spam;

pub use action::ActionKind;
pub use actor::{Actor, ActorId, Role};
pub use backend::{Backend, Decision, WindowInput, WindowStatus};
pub use checker::{Evaluation, RateLimitChecker};
pub use error::{BoxError, Error};
pub use middleware::builder::ActionRateLimiterBuilder;
pub use middleware::{ActionRateLimiter, ActionRateLimiterMiddleware};
pub use policy::{PolicyTable, ThresholdPolicy, TrustTier};
pub use spam::SpamTriggerTerms;
