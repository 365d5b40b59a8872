//! # Sovereign Core
//!
//! On-device sovereign trust core.
//!
//! Sovereign Core keeps a device's root of trust local: device identities
//! live sealed in an encrypted keystore, capability tokens are issued and
//! verified against those identities, access is decided by an ordered
//! fail-closed policy, and every security-relevant action lands in a
//! tamper-evident hash-chained audit ledger before its result is returned.
//! No network, no remote authority.
//!
//! ## Key Concepts
//!
//! - **Identity**: an Ed25519 keypair sealed at rest, addressed by a
//!   `svrn_idn_` id and a rotation generation
//! - **Capability token**: a signed, time-bounded grant of permissions to a
//!   subject, revocable by id
//! - **Policy**: ordered rules with glob subject patterns, first match wins,
//!   no match denies
//! - **Ledger**: append-only hash chain; a broken chain locks the engine
//!   until an authorized compaction re-anchors it
//!
//! ## Example
//!
//! ```rust,ignore
//! use sovereign_core::{TrustEngine, EnginePaths, EvaluationContext, WrappingKey};
//! use std::time::Duration;
//!
//! let engine = TrustEngine::open(
//!     &EnginePaths::under("/data/sovereign"),
//!     WrappingKey::generate()?,
//! )?;
//!
//! let owner = engine.create_identity("device-owner")?;
//! let token = engine.issue_token(
//!     &owner.identity_id,
//!     "app.backup",
//!     ["storage.read".into()].into(),
//!     Duration::from_secs(3600),
//! )?;
//!
//! let ctx = EvaluationContext::at(chrono::Utc::now());
//! let decision = engine.evaluate_access(
//!     "app.backup",
//!     &["storage.read".into()].into(),
//!     &token,
//!     &ctx,
//! )?;
//! ```

pub mod bridge;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod keystore;
pub mod ledger;
pub mod policy;
pub mod storage;
pub mod token;
pub mod wire;

// Re-exports for convenience
pub use bridge::{
    BridgeOperation, BridgeReply, BridgeRequest, BridgeResponse, SecureChannelBridge,
    DEFAULT_REQUEST_TIMEOUT, REPLAY_WINDOW_SIZE,
};
pub use crypto::{PublicKey, Signature, SigningKey, WrappingKey};
pub use engine::{EnginePaths, EngineState, TrustEngine, CORE_VERSION};
pub use error::{
    BridgeError, Error, KeystoreError, LedgerError, PolicyError, Result, TokenError,
};
pub use keystore::{
    Identity, IdentityAttestation, IdentityId, KeystoreManager, DEFAULT_ROTATION_GRACE,
    IDENTITY_ID_PREFIX,
};
pub use ledger::{
    genesis_hash, AuditEvent, AuditLedger, AuditRecord, ChainHash, CompactionAttestation,
};
pub use policy::{
    Condition, Decision, DenyReason, Effect, EvaluationContext, PolicyEvaluator, PolicyRule,
    Requirement,
};
pub use token::{
    CapabilityToken, RevocationCheck, TokenEngine, TokenId, TokenPayload, VerifiedClaim,
    DEFAULT_MAX_TOKEN_LIFETIME, TOKEN_ID_PREFIX,
};
pub use wire::{MAX_FRAME_SIZE, MAX_TOKEN_SIZE};

/// Context string for Ed25519 signatures (prevents cross-protocol attacks).
///
/// All signatures are computed over: `SIGNATURE_CONTEXT || payload`
pub const SIGNATURE_CONTEXT: &[u8] = b"sovereign-core-v1";
