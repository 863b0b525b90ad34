use crate::action::ActionKind;
use crate::actor::Actor;
use crate::backend::{Backend, Decision, WindowInput, WindowStatus};
use crate::config::{ConfigError, RateLimitConfig};
use crate::error::Error;
use crate::policy::{PolicyError, PolicyTable, Resolution, ThresholdPolicy, TrustTier};
use crate::spam::SpamTriggerTerms;
use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

type Clock = dyn Fn() -> DateTime<Utc> + Send + Sync;

/// Decides whether an actor may perform an action now, counting the attempts it allows.
///
/// Clones share the same backend and policy table.
#[derive(Clone)]
pub struct RateLimitChecker<B> {
    backend: B,
    policies: Arc<RwLock<PolicyTable>>,
    spam_terms: Arc<SpamTriggerTerms>,
    clock: Arc<Clock>,
}

/// The result of checking one attempt.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub action: ActionKind,
    pub decision: Decision,
    /// [None] when the action kind is unconfigured.
    pub tier: Option<TrustTier>,
    /// [None] when no window was consulted (unconfigured kinds and exempt actors).
    pub status: Option<WindowStatus>,
    key: Option<String>,
}

impl Evaluation {
    fn unlimited(action: &ActionKind, tier: Option<TrustTier>) -> Self {
        Self {
            action: action.clone(),
            decision: Decision::Allowed,
            tier,
            status: None,
            key: None,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.decision.is_denied()
    }

    /// Seconds until the window resets.
    pub fn retry_after(&self) -> Option<u64> {
        self.status.as_ref().map(|s| s.seconds_until_reset())
    }
}

impl<B: Backend> RateLimitChecker<B> {
    pub fn new(backend: B, policies: PolicyTable) -> Self {
        Self {
            backend,
            policies: Arc::new(RwLock::new(policies)),
            spam_terms: Arc::new(SpamTriggerTerms::default()),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn from_config(backend: B, config: &RateLimitConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(backend, config.policy_table()?)
            .with_spam_terms(config.spam_trigger_terms.clone()))
    }

    pub fn with_spam_terms(mut self, terms: SpamTriggerTerms) -> Self {
        self.spam_terms = Arc::new(terms);
        self
    }

    /// Override the wall clock used to measure account age against the new account cutoff.
    ///
    /// Windows are always timed with the Tokio clock.
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    fn policies(&self) -> RwLockReadGuard<'_, PolicyTable> {
        self.policies.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` when the actor has exceeded the threshold for `action` and must be refused.
    ///
    /// An allowed attempt is counted. Unconfigured action kinds are never limited.
    pub async fn limit_by_action(&self, actor: &Actor, action: &ActionKind) -> Result<bool, Error> {
        Ok(self.evaluate(actor, action).await?.is_limited())
    }

    /// Like [RateLimitChecker::limit_by_action()] but returns the full [Evaluation].
    pub async fn evaluate(&self, actor: &Actor, action: &ActionKind) -> Result<Evaluation, Error> {
        let actor_key = actor.cache_key()?;
        let (tier, resolution) = {
            let table = self.policies();
            let tier = table.tier_for(actor, (self.clock)());
            (tier, table.resolve(action, tier))
        };
        self.count_attempt(actor, &actor_key, action, tier, resolution)
            .await
    }

    async fn count_attempt(
        &self,
        actor: &Actor,
        actor_key: &str,
        action: &ActionKind,
        tier: TrustTier,
        resolution: Resolution,
    ) -> Result<Evaluation, Error> {
        let (max_requests, interval) = match resolution {
            Resolution::Unconfigured => {
                log::debug!("No rate limit configured for {action}, allowing {actor}");
                return Ok(Evaluation::unlimited(action, None));
            }
            Resolution::Exempt => return Ok(Evaluation::unlimited(action, Some(tier))),
            Resolution::Limited {
                max_requests,
                interval,
            } => (max_requests, interval),
        };

        let key = window_key(action, actor_key);
        let (decision, status) = self
            .backend
            .request(WindowInput {
                interval,
                max_requests,
                key: key.clone(),
            })
            .await
            .map_err(Error::backend)?;

        if decision.is_denied() {
            log::info!(
                "Rate limit reached for {actor} on {action} ({max_requests} per {}s, {tier:?})",
                interval.as_secs()
            );
        } else {
            log::debug!(
                "Allowed {actor} on {action}, {} of {max_requests} remaining",
                status.remaining
            );
        }

        Ok(Evaluation {
            action: action.clone(),
            decision,
            tier: Some(tier),
            status: Some(status),
            key: Some(key),
        })
    }

    /// Fails with [Error::LimitReached] when the actor is limited.
    pub async fn check_limit(&self, actor: &Actor, action: &ActionKind) -> Result<Evaluation, Error> {
        let evaluation = self.evaluate(actor, action).await?;
        if evaluation.is_limited() {
            return Err(Error::LimitReached {
                action: evaluation.action.clone(),
                retry_after: evaluation.retry_after().unwrap_or_default(),
            });
        }
        Ok(evaluation)
    }

    /// Un-count an allowed attempt, e.g. when the action itself failed.
    ///
    /// Denied and unlimited evaluations are left alone, as are attempts whose window has
    /// since elapsed.
    pub async fn rollback(&self, evaluation: &Evaluation) -> Result<(), Error> {
        match (&evaluation.key, &evaluation.status) {
            (Some(key), Some(status)) if evaluation.decision.is_allowed() => self
                .backend
                .rollback(key, status.window)
                .await
                .map_err(Error::backend),
            _ => Ok(()),
        }
    }

    /// The actor's current window for `action`, without counting an attempt.
    pub async fn status(
        &self,
        actor: &Actor,
        action: &ActionKind,
    ) -> Result<Option<WindowStatus>, Error> {
        let actor_key = actor.cache_key()?;
        let resolution = {
            let table = self.policies();
            table.resolve(action, table.tier_for(actor, (self.clock)()))
        };
        match resolution {
            Resolution::Limited { max_requests, .. } => self
                .backend
                .peek(&window_key(action, &actor_key), max_requests)
                .await
                .map_err(Error::backend),
            Resolution::Unconfigured | Resolution::Exempt => Ok(None),
        }
    }

    /// Clears the actor's window for `action`.
    pub async fn reset(&self, actor: &Actor, action: &ActionKind) -> Result<(), Error> {
        let key = window_key(action, &actor.cache_key()?);
        self.backend
            .remove_key(&key)
            .await
            .map_err(Error::backend)
    }

    /// Limits how many messages a single email address receives.
    ///
    /// Addresses are compared case-insensitively. Recipients are always held to the
    /// [TrustTier::Established] threshold, the new account override of
    /// [ActionKind::EMAIL_RECIPIENT] never applies to them.
    pub async fn limit_by_email_recipient(&self, address: &str) -> Result<bool, Error> {
        let address = address.trim().to_lowercase();
        if address.is_empty() {
            return Err(Error::InvalidActor("email address is blank".into()));
        }
        let actor = Actor::anonymous(format!("email:{address}"));
        let actor_key = actor.cache_key()?;
        let action = ActionKind::EMAIL_RECIPIENT;
        let tier = TrustTier::Established;
        let resolution = self.policies().resolve(&action, tier);
        Ok(self
            .count_attempt(&actor, &actor_key, &action, tier, resolution)
            .await?
            .is_limited())
    }

    pub fn is_spam(&self, text: &str) -> bool {
        self.spam_terms.matches(text)
    }

    /// Replace the policy for one action kind.
    ///
    /// Windows that are already open keep their current interval until they expire.
    pub fn set_policy(
        &self,
        action: ActionKind,
        policy: ThresholdPolicy,
    ) -> Result<Option<ThresholdPolicy>, PolicyError> {
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(action, policy)
    }

    /// Stop limiting an action kind.
    pub fn remove_policy(&self, action: &ActionKind) -> Option<ThresholdPolicy> {
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(action)
    }
}

fn window_key(action: &ActionKind, actor_key: &str) -> String {
    format!("rate_limit:{action}:{actor_key}")
}
