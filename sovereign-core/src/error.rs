//! Error types for the sovereign core.
//!
//! Errors are grouped into five families matching the engine's components,
//! so callers across the bridge can match on the family and log the precise
//! variant. Cryptographic and policy failures are always surfaced, never
//! silently downgraded.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Keystore errors
// ============================================================================

/// Errors from the keystore manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum KeystoreError {
    /// The platform RNG could not be sourced.
    #[error("entropy unavailable: {0}")]
    EntropyUnavailable(String),

    /// No identity with the given id exists.
    #[error("identity not found: {0}")]
    NotFound(String),

    /// The key-wrapping key is unavailable (device locked).
    #[error("keystore locked: wrapping key unavailable")]
    Locked,

    /// A concurrent rotation already advanced this generation.
    #[error("identity {identity_id} already rotated: expected generation {expected}, current is {current}")]
    AlreadyRotated {
        identity_id: String,
        expected: u32,
        current: u32,
    },

    /// The requested key generation is unknown or already pruned.
    #[error("identity {identity_id} has no generation {generation}")]
    UnknownGeneration { identity_id: String, generation: u32 },

    /// A sealed private-key blob failed to decrypt or authenticate.
    #[error("sealed key blob corrupt for {0}")]
    SealedBlobCorrupt(String),

    /// Malformed identity id.
    #[error("invalid identity id: {0}")]
    InvalidIdentityId(String),

    /// The identity exists in the keystore but has no creation record in
    /// the audit ledger (write-ahead reconciliation flagged it). It cannot
    /// issue or sign until an operator resolves the discrepancy.
    #[error("identity quarantined pending reconciliation: {0}")]
    Quarantined(String),

    /// Persistent storage failed after bounded retries.
    #[error("keystore storage failed: {0}")]
    StorageFailed(String),
}

// ============================================================================
// Token errors
// ============================================================================

/// Errors from capability-token issuance and verification.
///
/// Each verification failure is a distinct variant so callers can log
/// precisely which check rejected the token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TokenError {
    /// Requested validity window exceeds the configured maximum lifetime.
    #[error("validity window {requested_secs}s exceeds maximum {max_secs}s")]
    WindowTooLong { requested_secs: i64, max_secs: i64 },

    /// Validity window is empty or negative.
    #[error("validity window is not positive")]
    WindowNotPositive,

    /// Token has expired.
    #[error("token expired at {0}")]
    Expired(chrono::DateTime<chrono::Utc>),

    /// Token is not yet within its validity window.
    #[error("token not valid before {0}")]
    NotYetValid(chrono::DateTime<chrono::Utc>),

    /// Token appears in the revocation index.
    #[error("token revoked: {0}")]
    Revoked(String),

    /// Signature does not verify under the issuing generation's public key.
    #[error("token signature invalid")]
    BadSignature,

    /// Malformed token id.
    #[error("invalid token id: {0}")]
    InvalidTokenId(String),

    /// The token's encoded form could not be parsed.
    #[error("token malformed: {0}")]
    Malformed(String),

    /// Serialized token exceeds the wire size cap.
    #[error("token size {size} bytes exceeds maximum {max} bytes")]
    TooLarge { size: usize, max: usize },

    /// The issuing identity or generation could not be resolved.
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
}

// ============================================================================
// Policy errors
// ============================================================================

/// Errors from the policy evaluator.
///
/// Terminal deny decisions are values, not errors ([`crate::policy::Decision`]);
/// this family covers rule-set loading and malformed rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PolicyError {
    /// A rule's subject pattern failed to compile.
    #[error("invalid subject pattern in rule {rule_id}: {reason}")]
    InvalidPattern { rule_id: String, reason: String },

    /// The rule file could not be read or parsed.
    #[error("policy rule file unreadable: {0}")]
    RuleFileUnreadable(String),

    /// Duplicate rule id within one rule set.
    #[error("duplicate rule id: {0}")]
    DuplicateRuleId(String),
}

// ============================================================================
// Ledger errors
// ============================================================================

/// Errors from the audit ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LedgerError {
    /// Persistent storage rejected the append after bounded retries.
    /// The triggering operation must itself fail rather than proceed
    /// un-logged.
    #[error("ledger write failed: {0}")]
    WriteFailed(String),

    /// Hash-chain verification failed at the given sequence number.
    #[error("ledger chain broken at sequence {0}")]
    ChainBroken(u64),

    /// The requested range is outside the retained chain.
    #[error("sequence range {from}..={to} outside retained chain")]
    RangeUnavailable { from: u64, to: u64 },

    /// Compaction attestation missing or not signed by the designated
    /// identity.
    #[error("compaction unauthorized: {0}")]
    Unauthorized(String),

    /// The on-disk ledger file is malformed.
    #[error("ledger file corrupt: {0}")]
    FileCorrupt(String),
}

// ============================================================================
// Bridge errors
// ============================================================================

/// Errors produced at the secure channel bridge boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BridgeError {
    /// Duplicate or rewound sequence number within the session window.
    #[error("replayed sequence number {0}")]
    Replay(u64),

    /// The operation did not complete within the bounded timeout. If the
    /// operation already passed its audit-write point it completes
    /// asynchronously, but its result is not delivered.
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// The engine thread is gone; no further requests can be served.
    #[error("bridge channel closed")]
    ChannelClosed,

    /// Request frame failed to decode or exceeded the frame size cap.
    #[error("malformed request frame: {0}")]
    BadFrame(String),

    /// The engine thread could not be started.
    #[error("engine worker unavailable: {0}")]
    WorkerUnavailable(String),
}

// ============================================================================
// Umbrella error
// ============================================================================

/// Top-level error for engine and bridge operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// The engine is locked after a failed chain verification. Mutating
    /// operations refuse until compaction-with-attestation or an
    /// operator-approved re-genesis.
    #[error("engine locked: {0}")]
    EngineLocked(String),

    /// Serialization of an internal structure failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_errors_stay_distinct_through_umbrella() {
        let e: Error = TokenError::BadSignature.into();
        assert!(matches!(e, Error::Token(TokenError::BadSignature)));

        let e: Error = TokenError::Revoked("svrn_tok_x".into()).into();
        assert!(matches!(e, Error::Token(TokenError::Revoked(_))));
    }

    #[test]
    fn rotation_race_error_names_both_generations() {
        let e = KeystoreError::AlreadyRotated {
            identity_id: "svrn_idn_a".into(),
            expected: 3,
            current: 4,
        };
        let msg = e.to_string();
        assert!(msg.contains("expected generation 3"));
        assert!(msg.contains("current is 4"));
    }
}
