use crate::action::ActionKind;
use crate::actor::{Actor, Role};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// The threshold applied to one [ActionKind].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdPolicy {
    /// The total attempts to be allowed within the interval.
    pub max_requests: u64,
    /// The rate limiting interval.
    pub interval: Duration,
    /// A stricter limit for actors in the [TrustTier::New] tier.
    pub new_account_max_requests: Option<u64>,
}

impl ThresholdPolicy {
    pub fn new(max_requests: u64, interval: Duration) -> Self {
        Self {
            max_requests,
            interval,
            new_account_max_requests: None,
        }
    }

    pub fn with_new_account_max_requests(mut self, max_requests: u64) -> Self {
        self.new_account_max_requests = Some(max_requests);
        self
    }

    fn validate(&self, action: &ActionKind) -> Result<(), PolicyError> {
        if self.interval.is_zero() {
            return Err(PolicyError::ZeroInterval(action.clone()));
        }
        match self.new_account_max_requests {
            Some(stricter) if stricter > self.max_requests => Err(PolicyError::PermissiveOverride {
                action: action.clone(),
                new_account_max_requests: stricter,
                max_requests: self.max_requests,
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Interval for {0} must be non-zero")]
    ZeroInterval(ActionKind),
    #[error(
        "New account limit for {action} ({new_account_max_requests}) exceeds the normal limit ({max_requests})"
    )]
    PermissiveOverride {
        action: ActionKind,
        new_account_max_requests: u64,
        max_requests: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustTier {
    /// Never limited.
    Exempt,
    /// Recently created accounts and anonymous actors.
    New,
    Established,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierPredicate {
    HasRole(Role),
    /// The account was created less than this long ago.
    AccountYoungerThan(chrono::Duration),
    Anonymous,
}

impl TierPredicate {
    pub fn matches(&self, actor: &Actor, now: DateTime<Utc>) -> bool {
        match self {
            TierPredicate::HasRole(role) => actor.has_role(*role),
            TierPredicate::AccountYoungerThan(age) => actor
                .created_at
                .is_some_and(|created_at| now - created_at < *age),
            TierPredicate::Anonymous => actor.is_anonymous(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierRule {
    pub predicate: TierPredicate,
    pub tier: TrustTier,
}

impl TierRule {
    pub fn new(predicate: TierPredicate, tier: TrustTier) -> Self {
        Self { predicate, tier }
    }
}

/// The outcome of looking up the limit for an actor's tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No policy exists for the action kind.
    Unconfigured,
    Exempt,
    Limited {
        max_requests: u64,
        interval: Duration,
    },
}

/// Threshold policies keyed by [ActionKind], plus the ordered rules used to place actors into
/// trust tiers.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<ActionKind, ThresholdPolicy>,
    tier_rules: Vec<TierRule>,
}

pub const DEFAULT_NEW_ACCOUNT_AGE_SECONDS: u64 = 60 * 60 * 24 * 7;

impl Default for PolicyTable {
    fn default() -> Self {
        let age = chrono::Duration::seconds(DEFAULT_NEW_ACCOUNT_AGE_SECONDS as i64);
        Self::new(Self::default_tier_rules(age, &[]))
    }
}

impl PolicyTable {
    pub fn new(tier_rules: Vec<TierRule>) -> Self {
        Self {
            policies: HashMap::new(),
            tier_rules,
        }
    }

    /// Exempt roles first, then accounts younger than `new_account_age` and anonymous actors
    /// are treated as new.
    pub fn default_tier_rules(
        new_account_age: chrono::Duration,
        exempt_roles: &[Role],
    ) -> Vec<TierRule> {
        exempt_roles
            .iter()
            .map(|role| TierRule::new(TierPredicate::HasRole(*role), TrustTier::Exempt))
            .chain([
                TierRule::new(
                    TierPredicate::AccountYoungerThan(new_account_age),
                    TrustTier::New,
                ),
                TierRule::new(TierPredicate::Anonymous, TrustTier::New),
            ])
            .collect()
    }

    pub fn insert(
        &mut self,
        action: ActionKind,
        policy: ThresholdPolicy,
    ) -> Result<Option<ThresholdPolicy>, PolicyError> {
        policy.validate(&action)?;
        Ok(self.policies.insert(action, policy))
    }

    pub fn with_policy(
        mut self,
        action: ActionKind,
        policy: ThresholdPolicy,
    ) -> Result<Self, PolicyError> {
        self.insert(action, policy)?;
        Ok(self)
    }

    pub fn remove(&mut self, action: &ActionKind) -> Option<ThresholdPolicy> {
        self.policies.remove(action)
    }

    pub fn get(&self, action: &ActionKind) -> Option<&ThresholdPolicy> {
        self.policies.get(action)
    }

    pub fn tier_rules(&self) -> &[TierRule] {
        &self.tier_rules
    }

    pub fn tier_for(&self, actor: &Actor, now: DateTime<Utc>) -> TrustTier {
        self.tier_rules
            .iter()
            .find(|rule| rule.predicate.matches(actor, now))
            .map(|rule| rule.tier)
            .unwrap_or(TrustTier::Established)
    }

    pub fn resolve(&self, action: &ActionKind, tier: TrustTier) -> Resolution {
        let Some(policy) = self.policies.get(action) else {
            return Resolution::Unconfigured;
        };
        let max_requests = match tier {
            TrustTier::Exempt => return Resolution::Exempt,
            TrustTier::New => policy
                .new_account_max_requests
                .unwrap_or(policy.max_requests),
            TrustTier::Established => policy.max_requests,
        };
        Resolution::Limited {
            max_requests,
            interval: policy.interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MINUTE: Duration = Duration::from_secs(60);

    fn table() -> PolicyTable {
        let rules = PolicyTable::default_tier_rules(chrono::Duration::days(7), &[Role::Admin]);
        PolicyTable::new(rules)
            .with_policy(
                ActionKind::FEEDBACK_MESSAGE_CREATION,
                ThresholdPolicy::new(5, MINUTE).with_new_account_max_requests(1),
            )
            .unwrap()
            .with_policy(ActionKind::COMMENT_CREATION, ThresholdPolicy::new(9, MINUTE))
            .unwrap()
    }

    #[rstest]
    #[case::new_account(Actor::user(1, Utc::now() - chrono::Duration::days(1)), TrustTier::New)]
    #[case::established(Actor::user(2, Utc::now() - chrono::Duration::days(30)), TrustTier::Established)]
    #[case::anonymous(Actor::anonymous("10.0.0.1"), TrustTier::New)]
    #[case::new_admin(
        Actor::user(3, Utc::now()).with_role(Role::Admin),
        TrustTier::Exempt
    )]
    #[case::moderator(
        Actor::user(4, Utc::now() - chrono::Duration::days(30)).with_role(Role::Moderator),
        TrustTier::Established
    )]
    fn test_tier_for(#[case] actor: Actor, #[case] expected: TrustTier) {
        assert_eq!(table().tier_for(&actor, Utc::now()), expected);
    }

    #[rstest]
    #[case(TrustTier::New, Resolution::Limited { max_requests: 1, interval: MINUTE })]
    #[case(TrustTier::Established, Resolution::Limited { max_requests: 5, interval: MINUTE })]
    #[case(TrustTier::Exempt, Resolution::Exempt)]
    fn test_resolve_override(#[case] tier: TrustTier, #[case] expected: Resolution) {
        assert_eq!(
            table().resolve(&ActionKind::FEEDBACK_MESSAGE_CREATION, tier),
            expected
        );
    }

    #[test]
    fn test_new_tier_without_override_uses_normal_limit() {
        assert_eq!(
            table().resolve(&ActionKind::COMMENT_CREATION, TrustTier::New),
            Resolution::Limited {
                max_requests: 9,
                interval: MINUTE
            }
        );
    }

    #[test]
    fn test_unconfigured() {
        assert_eq!(
            table().resolve(
                &ActionKind::from("totally_unconfigured_action"),
                TrustTier::Established
            ),
            Resolution::Unconfigured
        );
    }

    #[test]
    fn test_override_must_be_stricter() {
        let err = PolicyTable::default()
            .with_policy(
                ActionKind::IMAGE_UPLOAD,
                ThresholdPolicy::new(3, MINUTE).with_new_account_max_requests(4),
            )
            .unwrap_err();
        assert_eq!(
            err,
            PolicyError::PermissiveOverride {
                action: ActionKind::IMAGE_UPLOAD,
                new_account_max_requests: 4,
                max_requests: 3,
            }
        );
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = PolicyTable::default()
            .with_policy(ActionKind::USER_UPDATE, ThresholdPolicy::new(3, Duration::ZERO))
            .unwrap_err();
        assert_eq!(err, PolicyError::ZeroInterval(ActionKind::USER_UPDATE));
    }
}
