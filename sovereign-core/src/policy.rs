//! Policy evaluation: allow/deny/conditional decisions over verified tokens.
//!
//! Rules form an ordered sequence and evaluation order is significant: the
//! first rule whose subject pattern matches and whose condition currently
//! holds determines the effect. No matching rule means deny (fail-closed).
//!
//! Conditions are a closed set of tagged variants evaluated against an
//! explicit [`EvaluationContext`]; there is no runtime reflection and no
//! implicit retry. A condition that cannot be evaluated synchronously (a
//! device-state key absent from the context) yields
//! [`Decision::Conditional`] and the caller re-submits once resolved.

use crate::error::{PolicyError, TokenError};
use crate::token::VerifiedClaim;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

/// Why a token failed verification, in a form that can be recorded in the
/// audit ledger and returned across the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenInvalidKind {
    Expired,
    NotYetValid,
    Revoked,
    BadSignature,
    Malformed,
    IssuerUnknown,
}

impl From<&TokenError> for TokenInvalidKind {
    fn from(e: &TokenError) -> Self {
        match e {
            TokenError::Expired(_) => Self::Expired,
            TokenError::NotYetValid(_) => Self::NotYetValid,
            TokenError::Revoked(_) => Self::Revoked,
            TokenError::BadSignature => Self::BadSignature,
            TokenError::Keystore(_) => Self::IssuerUnknown,
            _ => Self::Malformed,
        }
    }
}

/// Reason attached to a deny decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DenyReason {
    /// The presented token failed verification; no rule scan was performed.
    TokenInvalid(TokenInvalidKind),
    /// An allow rule matched but the token's permissions do not cover the
    /// rule's requirements or the requested operations.
    InsufficientPermissions,
    /// No rule matched the subject (fail-closed default).
    NoMatchingPolicy,
    /// A deny rule matched.
    ExplicitDeny { rule_id: String },
}

/// What the caller must resolve before re-submitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Requirement {
    /// A fresh device-state probe for the named key.
    DeviceStateProbe { key: String },
}

/// Terminal or conditional outcome of an access evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    /// Access granted under the named rule.
    Allow { rule_id: String },
    /// Access denied.
    Deny(DenyReason),
    /// Undecidable synchronously; re-submit once the requirement resolves.
    Conditional(Requirement),
}

impl Decision {
    /// Map a token verification failure straight to its deny decision.
    pub fn from_token_error(e: &TokenError) -> Self {
        Decision::Deny(DenyReason::TokenInvalid(e.into()))
    }
}

/// Rule effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

/// Condition guarding a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Always holds.
    Always,
    /// Holds between two minutes-of-day (UTC), inclusive start, exclusive
    /// end. A range with `start > end` wraps midnight.
    TimeOfDay { start_minute: u32, end_minute: u32 },
    /// Holds when the device-state key has the expected value. Unevaluable
    /// when the key is absent from the context.
    DeviceState { key: String, expected: String },
}

/// One ordered policy rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub rule_id: String,
    /// Glob pattern matched against the request subject.
    pub subject_pattern: String,
    /// Permissions the token must carry for an allow rule to fire.
    pub required_permissions: BTreeSet<String>,
    pub condition: Condition,
    pub effect: Effect,
}

/// Inputs a condition may consult. Passing these explicitly keeps
/// evaluation deterministic and testable.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub now: DateTime<Utc>,
    /// Device-state probe results supplied by the shell.
    pub device_state: BTreeMap<String, String>,
}

impl EvaluationContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            device_state: BTreeMap::new(),
        }
    }

    pub fn with_state(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.device_state.insert(key.into(), value.into());
        self
    }
}

enum ConditionOutcome {
    Holds,
    DoesNotHold,
    Unevaluable(Requirement),
}

fn evaluate_condition(condition: &Condition, ctx: &EvaluationContext) -> ConditionOutcome {
    match condition {
        Condition::Always => ConditionOutcome::Holds,
        Condition::TimeOfDay {
            start_minute,
            end_minute,
        } => {
            let minute = ctx.now.hour() * 60 + ctx.now.minute();
            let holds = if start_minute <= end_minute {
                minute >= *start_minute && minute < *end_minute
            } else {
                minute >= *start_minute || minute < *end_minute
            };
            if holds {
                ConditionOutcome::Holds
            } else {
                ConditionOutcome::DoesNotHold
            }
        }
        Condition::DeviceState { key, expected } => match ctx.device_state.get(key) {
            Some(actual) if actual == expected => ConditionOutcome::Holds,
            Some(_) => ConditionOutcome::DoesNotHold,
            None => ConditionOutcome::Unevaluable(Requirement::DeviceStateProbe {
                key: key.clone(),
            }),
        },
    }
}

struct CompiledRule {
    rule: PolicyRule,
    pattern: glob::Pattern,
}

/// The policy evaluator: an ordered, compiled rule sequence.
pub struct PolicyEvaluator {
    rules: Vec<CompiledRule>,
}

impl std::fmt::Debug for PolicyEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEvaluator")
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl PolicyEvaluator {
    /// Compile an ordered rule list. Bad patterns and duplicate rule ids are
    /// rejected up front so evaluation itself cannot fail.
    pub fn new(rules: Vec<PolicyRule>) -> Result<Self, PolicyError> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if !seen.insert(rule.rule_id.clone()) {
                return Err(PolicyError::DuplicateRuleId(rule.rule_id));
            }
            let pattern = glob::Pattern::new(&rule.subject_pattern).map_err(|e| {
                PolicyError::InvalidPattern {
                    rule_id: rule.rule_id.clone(),
                    reason: e.to_string(),
                }
            })?;
            compiled.push(CompiledRule { rule, pattern });
        }
        Ok(Self { rules: compiled })
    }

    /// Load an ordered rule list from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PolicyError::RuleFileUnreadable(e.to_string()))?;
        let rules: Vec<PolicyRule> =
            serde_json::from_str(&raw).map_err(|e| PolicyError::RuleFileUnreadable(e.to_string()))?;
        Self::new(rules)
    }

    /// Number of compiled rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate an access request against an already-verified claim.
    ///
    /// Token verification happens before this point; a verification failure
    /// short-circuits to `Deny(TokenInvalid(_))` with no rule scan (see
    /// [`Decision::from_token_error`]). Deterministic: identical inputs
    /// always yield the same decision.
    pub fn evaluate(
        &self,
        subject: &str,
        requested_permissions: &BTreeSet<String>,
        claim: &VerifiedClaim,
        ctx: &EvaluationContext,
    ) -> Decision {
        for compiled in &self.rules {
            if !compiled.pattern.matches(subject) {
                continue;
            }
            match evaluate_condition(&compiled.rule.condition, ctx) {
                ConditionOutcome::DoesNotHold => continue,
                ConditionOutcome::Unevaluable(requirement) => {
                    return Decision::Conditional(requirement);
                }
                ConditionOutcome::Holds => {
                    return match compiled.rule.effect {
                        Effect::Deny => Decision::Deny(DenyReason::ExplicitDeny {
                            rule_id: compiled.rule.rule_id.clone(),
                        }),
                        Effect::Allow => {
                            let covers_required = compiled
                                .rule
                                .required_permissions
                                .is_subset(&claim.permissions);
                            let covers_requested =
                                requested_permissions.is_subset(&claim.permissions);
                            if covers_required && covers_requested {
                                Decision::Allow {
                                    rule_id: compiled.rule.rule_id.clone(),
                                }
                            } else {
                                Decision::Deny(DenyReason::InsufficientPermissions)
                            }
                        }
                    };
                }
            }
        }
        Decision::Deny(DenyReason::NoMatchingPolicy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::IdentityId;
    use crate::token::TokenId;
    use chrono::TimeZone;

    fn claim(permissions: &[&str]) -> VerifiedClaim {
        let now = Utc::now();
        VerifiedClaim {
            token_id: TokenId::new(),
            issuer_identity_id: IdentityId::new(),
            subject: "file:/secrets/db".into(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            not_before: now,
            not_after: now + chrono::Duration::hours(1),
        }
    }

    fn perms(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    fn allow_rule(id: &str, pattern: &str, required: &[&str]) -> PolicyRule {
        PolicyRule {
            rule_id: id.into(),
            subject_pattern: pattern.into(),
            required_permissions: perms(required),
            condition: Condition::Always,
            effect: Effect::Allow,
        }
    }

    #[test]
    fn first_match_wins() {
        let evaluator = PolicyEvaluator::new(vec![
            PolicyRule {
                rule_id: "deny-secrets".into(),
                subject_pattern: "file:/secrets/*".into(),
                required_permissions: BTreeSet::new(),
                condition: Condition::Always,
                effect: Effect::Deny,
            },
            allow_rule("allow-everything", "file:/*", &[]),
        ])
        .unwrap();

        let ctx = EvaluationContext::at(Utc::now());
        let d = evaluator.evaluate("file:/secrets/db", &perms(&["read"]), &claim(&["read"]), &ctx);
        assert_eq!(
            d,
            Decision::Deny(DenyReason::ExplicitDeny {
                rule_id: "deny-secrets".into()
            })
        );

        let d = evaluator.evaluate("file:/public/doc", &perms(&["read"]), &claim(&["read"]), &ctx);
        assert_eq!(
            d,
            Decision::Allow {
                rule_id: "allow-everything".into()
            }
        );
    }

    #[test]
    fn no_matching_rule_fails_closed() {
        let evaluator =
            PolicyEvaluator::new(vec![allow_rule("files-only", "file:/*", &[])]).unwrap();
        let ctx = EvaluationContext::at(Utc::now());
        let d = evaluator.evaluate("net:tcp/443", &perms(&["connect"]), &claim(&["connect"]), &ctx);
        assert_eq!(d, Decision::Deny(DenyReason::NoMatchingPolicy));
    }

    #[test]
    fn insufficient_permissions_on_allow_rule() {
        let evaluator =
            PolicyEvaluator::new(vec![allow_rule("reads", "file:/*", &["read"])]).unwrap();
        let ctx = EvaluationContext::at(Utc::now());

        // Token carries read only; request asks for write.
        let d = evaluator.evaluate("file:/secrets/db", &perms(&["write"]), &claim(&["read"]), &ctx);
        assert_eq!(d, Decision::Deny(DenyReason::InsufficientPermissions));

        // Token missing the rule's own requirement.
        let d = evaluator.evaluate("file:/secrets/db", &perms(&[]), &claim(&["list"]), &ctx);
        assert_eq!(d, Decision::Deny(DenyReason::InsufficientPermissions));
    }

    #[test]
    fn time_of_day_window() {
        let mut rule = allow_rule("office-hours", "door:*", &[]);
        rule.condition = Condition::TimeOfDay {
            start_minute: 9 * 60,
            end_minute: 17 * 60,
        };
        let evaluator = PolicyEvaluator::new(vec![rule]).unwrap();

        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let ctx = EvaluationContext::at(noon);
        assert!(matches!(
            evaluator.evaluate("door:front", &perms(&[]), &claim(&[]), &ctx),
            Decision::Allow { .. }
        ));

        let midnight = Utc.with_ymd_and_hms(2026, 3, 1, 0, 30, 0).unwrap();
        let ctx = EvaluationContext::at(midnight);
        assert_eq!(
            evaluator.evaluate("door:front", &perms(&[]), &claim(&[]), &ctx),
            Decision::Deny(DenyReason::NoMatchingPolicy)
        );
    }

    #[test]
    fn wrapping_time_window_crosses_midnight() {
        let mut rule = allow_rule("night-shift", "door:*", &[]);
        rule.condition = Condition::TimeOfDay {
            start_minute: 22 * 60,
            end_minute: 6 * 60,
        };
        let evaluator = PolicyEvaluator::new(vec![rule]).unwrap();

        let late = Utc.with_ymd_and_hms(2026, 3, 1, 23, 0, 0).unwrap();
        assert!(matches!(
            evaluator.evaluate("door:x", &perms(&[]), &claim(&[]), &EvaluationContext::at(late)),
            Decision::Allow { .. }
        ));
        let early = Utc.with_ymd_and_hms(2026, 3, 1, 5, 0, 0).unwrap();
        assert!(matches!(
            evaluator.evaluate("door:x", &perms(&[]), &claim(&[]), &EvaluationContext::at(early)),
            Decision::Allow { .. }
        ));
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            evaluator.evaluate("door:x", &perms(&[]), &claim(&[]), &EvaluationContext::at(noon)),
            Decision::Deny(DenyReason::NoMatchingPolicy)
        );
    }

    #[test]
    fn absent_device_state_is_conditional() {
        let mut rule = allow_rule("unlocked-only", "file:/*", &[]);
        rule.condition = Condition::DeviceState {
            key: "screen".into(),
            expected: "unlocked".into(),
        };
        let evaluator = PolicyEvaluator::new(vec![rule]).unwrap();

        let ctx = EvaluationContext::at(Utc::now());
        let d = evaluator.evaluate("file:/a", &perms(&[]), &claim(&[]), &ctx);
        assert_eq!(
            d,
            Decision::Conditional(Requirement::DeviceStateProbe {
                key: "screen".into()
            })
        );

        // Re-submission with the probe resolved.
        let ctx = EvaluationContext::at(Utc::now()).with_state("screen", "unlocked");
        assert!(matches!(
            evaluator.evaluate("file:/a", &perms(&[]), &claim(&[]), &ctx),
            Decision::Allow { .. }
        ));

        let ctx = EvaluationContext::at(Utc::now()).with_state("screen", "locked");
        assert_eq!(
            evaluator.evaluate("file:/a", &perms(&[]), &claim(&[]), &ctx),
            Decision::Deny(DenyReason::NoMatchingPolicy)
        );
    }

    #[test]
    fn evaluation_is_deterministic() {
        let evaluator =
            PolicyEvaluator::new(vec![allow_rule("r", "file:/*", &["read"])]).unwrap();
        let fixed = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let ctx = EvaluationContext::at(fixed);
        let c = claim(&["read"]);
        let first = evaluator.evaluate("file:/a", &perms(&["read"]), &c, &ctx);
        for _ in 0..10 {
            assert_eq!(first, evaluator.evaluate("file:/a", &perms(&["read"]), &c, &ctx));
        }
    }

    #[test]
    fn bad_pattern_and_duplicate_ids_rejected() {
        let err = PolicyEvaluator::new(vec![allow_rule("bad", "file:[", &[])]).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidPattern { .. }));

        let err = PolicyEvaluator::new(vec![
            allow_rule("dup", "a", &[]),
            allow_rule("dup", "b", &[]),
        ])
        .unwrap_err();
        assert_eq!(err, PolicyError::DuplicateRuleId("dup".into()));
    }

    #[test]
    fn rule_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        let rules = vec![allow_rule("from-file", "file:/*", &["read"])];
        std::fs::write(&path, serde_json::to_string_pretty(&rules).unwrap()).unwrap();

        let evaluator = PolicyEvaluator::load(&path).unwrap();
        assert_eq!(evaluator.len(), 1);
    }
}
