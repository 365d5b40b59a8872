//! End-to-end integration tests.
//!
//! These exercise the assembled engine through its public surface:
//! - Identity lifecycle across engine restarts
//! - Token issuance, verification, and rotation continuity
//! - Policy evaluation with rules loaded from disk
//! - The secure channel bridge as the external entry point

use sovereign_core::{
    AuditEvent, BridgeError, BridgeOperation, BridgeReply, BridgeRequest, Condition, Decision,
    Effect, EnginePaths, EngineState, Error, EvaluationContext, PolicyRule, SecureChannelBridge,
    TrustEngine, WrappingKey, CORE_VERSION,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tempfile::tempdir;

fn perms(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn write_rules(paths: &EnginePaths, rules: &[PolicyRule]) {
    std::fs::write(&paths.rules, serde_json::to_string_pretty(rules).unwrap()).unwrap();
}

fn allow_rule(rule_id: &str, pattern: &str, required: &[&str]) -> PolicyRule {
    PolicyRule {
        rule_id: rule_id.to_string(),
        subject_pattern: pattern.to_string(),
        required_permissions: perms(required),
        condition: Condition::Always,
        effect: Effect::Allow,
    }
}

// ============================================================================
// Identity lifecycle across restarts
// ============================================================================

/// An identity created in one engine session is usable in the next, with the
/// same id, public key, and generation.
#[test]
fn test_identity_survives_engine_restart() {
    let dir = tempdir().unwrap();
    let paths = EnginePaths::under(dir.path());
    let wrapping = WrappingKey::generate().unwrap();

    let (id, fingerprint) = {
        let engine = TrustEngine::open(&paths, wrapping.clone()).unwrap();
        let identity = engine.create_identity("device-owner").unwrap();
        let out = (
            identity.identity_id.clone(),
            identity.public_key.fingerprint(),
        );
        engine.close().unwrap();
        out
    };

    let engine = TrustEngine::open(&paths, wrapping).unwrap();
    assert_eq!(engine.state(), EngineState::Active);
    let token = engine
        .issue_token(&id, "file:/data", perms(&["read"]), Duration::from_secs(60))
        .unwrap();
    assert_eq!(token.issuer(), &id);

    // The original creation record is still in the chain with the
    // fingerprint of the persisted key.
    let records = engine.query_audit_range(0, 3).unwrap();
    assert!(records.iter().any(|r| matches!(
        &r.payload,
        AuditEvent::IdentityCreated { fingerprint: f, .. } if *f == fingerprint
    )));
    engine.close().unwrap();
}

/// The wrong wrapping key cannot open a populated keystore.
#[test]
fn test_wrong_wrapping_key_is_rejected() {
    let dir = tempdir().unwrap();
    let paths = EnginePaths::under(dir.path());
    {
        let engine = TrustEngine::open(&paths, WrappingKey::generate().unwrap()).unwrap();
        engine.create_identity("owner").unwrap();
        engine.close().unwrap();
    }
    let result = TrustEngine::open(&paths, WrappingKey::generate().unwrap());
    assert!(result.is_err());
}

// ============================================================================
// Rotation continuity
// ============================================================================

/// Tokens signed before a rotation keep verifying during the grace window,
/// and new tokens are signed with the new generation.
#[test]
fn test_rotation_preserves_outstanding_tokens() {
    let dir = tempdir().unwrap();
    let paths = EnginePaths::under(dir.path());
    write_rules(&paths, &[allow_rule("all", "*", &[])]);
    let engine = TrustEngine::open(&paths, WrappingKey::generate().unwrap()).unwrap();

    let owner = engine.create_identity("owner").unwrap();
    let old_token = engine
        .issue_token(
            &owner.identity_id,
            "sensor:gps",
            perms(&["read"]),
            Duration::from_secs(3600),
        )
        .unwrap();
    assert_eq!(old_token.issuer_generation(), 0);

    let rotated = engine.rotate_identity(&owner.identity_id, 0).unwrap();
    assert_eq!(rotated.rotation_generation, 1);

    let new_token = engine
        .issue_token(
            &owner.identity_id,
            "sensor:gps",
            perms(&["read"]),
            Duration::from_secs(3600),
        )
        .unwrap();
    assert_eq!(new_token.issuer_generation(), 1);

    let ctx = EvaluationContext::at(chrono::Utc::now());
    for token in [&old_token, &new_token] {
        let decision = engine
            .evaluate_access("sensor:gps", &perms(&["read"]), token, &ctx)
            .unwrap();
        assert!(matches!(decision, Decision::Allow { .. }), "{:?}", decision);
    }
    engine.close().unwrap();
}

/// A stale expected generation loses the rotation race.
#[test]
fn test_rotation_compare_and_swap() {
    let dir = tempdir().unwrap();
    let paths = EnginePaths::under(dir.path());
    let engine = TrustEngine::open(&paths, WrappingKey::generate().unwrap()).unwrap();
    let owner = engine.create_identity("owner").unwrap();

    engine.rotate_identity(&owner.identity_id, 0).unwrap();
    let err = engine.rotate_identity(&owner.identity_id, 0).unwrap_err();
    assert!(err.to_string().contains("generation"));
    engine.close().unwrap();
}

// ============================================================================
// Policy evaluation through the engine
// ============================================================================

/// Ordered rules: an early deny shadows a later allow for the same subject.
#[test]
fn test_rule_order_first_match_wins() {
    let dir = tempdir().unwrap();
    let paths = EnginePaths::under(dir.path());
    let deny = PolicyRule {
        rule_id: "deny-secrets".into(),
        subject_pattern: "file:/secrets/*".into(),
        required_permissions: BTreeSet::new(),
        condition: Condition::Always,
        effect: Effect::Deny,
    };
    write_rules(&paths, &[deny, allow_rule("allow-files", "file:/*", &[])]);
    let engine = TrustEngine::open(&paths, WrappingKey::generate().unwrap()).unwrap();

    let owner = engine.create_identity("owner").unwrap();
    let token = engine
        .issue_token(
            &owner.identity_id,
            "file:/secrets/db",
            perms(&["read"]),
            Duration::from_secs(600),
        )
        .unwrap();

    let ctx = EvaluationContext::at(chrono::Utc::now());
    let denied = engine
        .evaluate_access("file:/secrets/db", &perms(&["read"]), &token, &ctx)
        .unwrap();
    assert!(matches!(denied, Decision::Deny(_)), "{:?}", denied);

    let token2 = engine
        .issue_token(
            &owner.identity_id,
            "file:/public/readme",
            perms(&["read"]),
            Duration::from_secs(600),
        )
        .unwrap();
    let allowed = engine
        .evaluate_access("file:/public/readme", &perms(&["read"]), &token2, &ctx)
        .unwrap();
    assert!(matches!(allowed, Decision::Allow { .. }), "{:?}", allowed);
    engine.close().unwrap();
}

/// A device-state condition with no probe result comes back `Conditional`,
/// and resolves once the probe value is supplied.
#[test]
fn test_conditional_resolves_with_device_state() {
    let dir = tempdir().unwrap();
    let paths = EnginePaths::under(dir.path());
    let rule = PolicyRule {
        rule_id: "screen-locked-only".into(),
        subject_pattern: "camera:*".into(),
        required_permissions: BTreeSet::new(),
        condition: Condition::DeviceState {
            key: "screen".into(),
            expected: "unlocked".into(),
        },
        effect: Effect::Allow,
    };
    write_rules(&paths, &[rule]);
    let engine = TrustEngine::open(&paths, WrappingKey::generate().unwrap()).unwrap();
    let owner = engine.create_identity("owner").unwrap();
    let token = engine
        .issue_token(
            &owner.identity_id,
            "camera:front",
            perms(&["capture"]),
            Duration::from_secs(600),
        )
        .unwrap();

    let ctx = EvaluationContext::at(chrono::Utc::now());
    let pending = engine
        .evaluate_access("camera:front", &perms(&["capture"]), &token, &ctx)
        .unwrap();
    assert!(matches!(pending, Decision::Conditional(_)), "{:?}", pending);

    let ctx = EvaluationContext::at(chrono::Utc::now()).with_state("screen", "unlocked");
    let resolved = engine
        .evaluate_access("camera:front", &perms(&["capture"]), &token, &ctx)
        .unwrap();
    assert!(matches!(resolved, Decision::Allow { .. }), "{:?}", resolved);
    engine.close().unwrap();
}

// ============================================================================
// Bridge round trips
// ============================================================================

/// Drive the full issue-then-evaluate flow through the bridge, the way the
/// shell does.
#[test]
fn test_bridge_end_to_end() {
    let dir = tempdir().unwrap();
    let paths = EnginePaths::under(dir.path());
    write_rules(&paths, &[allow_rule("all", "*", &[])]);
    let engine = TrustEngine::open(&paths, WrappingKey::generate().unwrap()).unwrap();
    assert_eq!(engine.version(), CORE_VERSION);
    let bridge = SecureChannelBridge::start(engine).unwrap();

    let response = bridge
        .call(BridgeRequest::new(
            1,
            BridgeOperation::CreateIdentity {
                label: "device-owner".into(),
            },
        ))
        .unwrap();
    let identity_id = match response.result.unwrap() {
        BridgeReply::IdentityHandle { identity_id, .. } => identity_id,
        other => panic!("unexpected reply: {:?}", other),
    };

    let response = bridge
        .call(BridgeRequest::new(
            2,
            BridgeOperation::IssueToken {
                identity_id,
                subject: "file:/data".into(),
                permissions: perms(&["read"]),
                ttl_secs: 600,
            },
        ))
        .unwrap();
    let token_bytes = match response.result.unwrap() {
        BridgeReply::TokenBytes(bytes) => bytes,
        other => panic!("unexpected reply: {:?}", other),
    };

    let response = bridge
        .call(BridgeRequest::new(
            3,
            BridgeOperation::EvaluateAccess {
                subject: "file:/data".into(),
                permissions: perms(&["read"]),
                token_bytes,
                device_state: Default::default(),
            },
        ))
        .unwrap();
    match response.result.unwrap() {
        BridgeReply::Decision(Decision::Allow { .. }) => {}
        other => panic!("unexpected reply: {:?}", other),
    }

    let response = bridge
        .call(BridgeRequest::new(
            4,
            BridgeOperation::QueryAuditRange { from: 0, to: 2 },
        ))
        .unwrap();
    match response.result.unwrap() {
        BridgeReply::AuditRecords(records) => assert_eq!(records.len(), 3),
        other => panic!("unexpected reply: {:?}", other),
    }

    bridge.shutdown().unwrap();
}

/// A replayed sequence number never reaches the engine.
#[test]
fn test_bridge_rejects_replayed_sequence() {
    let dir = tempdir().unwrap();
    let paths = EnginePaths::under(dir.path());
    let engine = TrustEngine::open(&paths, WrappingKey::generate().unwrap()).unwrap();
    let bridge = SecureChannelBridge::start(engine).unwrap();

    bridge
        .call(BridgeRequest::new(
            1,
            BridgeOperation::QueryAuditRange { from: 0, to: 0 },
        ))
        .unwrap();
    let err = bridge
        .call(BridgeRequest::new(
            1,
            BridgeOperation::QueryAuditRange { from: 0, to: 0 },
        ))
        .unwrap_err();
    assert!(err.to_string().contains("replay"), "{}", err);

    bridge.shutdown().unwrap();
}

/// Operation failures come back as structured faults, not channel errors.
#[test]
fn test_bridge_surfaces_operation_faults() {
    let dir = tempdir().unwrap();
    let paths = EnginePaths::under(dir.path());
    let engine = TrustEngine::open(&paths, WrappingKey::generate().unwrap()).unwrap();
    let bridge = SecureChannelBridge::start(engine).unwrap();

    let response = bridge
        .call(BridgeRequest::new(
            1,
            BridgeOperation::RevokeToken {
                token_id: "not-a-token-id".into(),
                reason: "test".into(),
            },
        ))
        .unwrap();
    // Revocation by unknown id is idempotent and succeeds; an out-of-range
    // audit query is a real fault.
    assert!(response.result.is_ok());

    let response = bridge
        .call(BridgeRequest::new(
            2,
            BridgeOperation::QueryAuditRange { from: 50, to: 60 },
        ))
        .unwrap();
    let fault = response.result.unwrap_err();
    assert_eq!(fault.family, "ledger");

    bridge.shutdown().unwrap();
}

/// A call that outlives the bridge timeout returns `BridgeError::Timeout`;
/// the engine still completes the operation, its result just goes undelivered.
#[test]
fn test_bridge_call_times_out() {
    let dir = tempdir().unwrap();
    let paths = EnginePaths::under(dir.path());
    let engine = TrustEngine::open(&paths, WrappingKey::generate().unwrap()).unwrap();
    let bridge = SecureChannelBridge::start_with_timeout(engine, Duration::ZERO).unwrap();

    let err = bridge
        .call(BridgeRequest::new(
            1,
            BridgeOperation::CreateIdentity {
                label: "slowpoke".into(),
            },
        ))
        .unwrap_err();
    assert!(
        matches!(err, Error::Bridge(BridgeError::Timeout(_))),
        "{:?}",
        err
    );

    bridge.shutdown().unwrap();
}
