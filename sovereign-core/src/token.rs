//! Capability tokens: signed, scoped, time-boxed grants.
//!
//! A token carries a subject (resource or scope identifier), a set of
//! permission tags, and a validity window, signed by the issuing identity's
//! key generation active at issuance. Tokens are immutable once issued;
//! expiry or a revocation record in the audit ledger ends their life.
//!
//! The signature covers the canonical CBOR serialization of the payload,
//! which is retained alongside the signature so verification is byte-exact
//! regardless of re-serialization.

use crate::crypto::Signature;
use crate::error::TokenError;
use crate::keystore::{IdentityId, KeystoreManager};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

/// The required prefix for token ids.
pub const TOKEN_ID_PREFIX: &str = "svrn_tok_";

/// Default cap on token validity windows.
pub const DEFAULT_MAX_TOKEN_LIFETIME: Duration = Duration::days(30);

type TkResult<T> = std::result::Result<T, TokenError>;

/// A unique token id (`svrn_tok_` + UUIDv7).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TokenId(String);

impl<'de> Deserialize<'de> for TokenId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        TokenId::from_string(s).map_err(serde::de::Error::custom)
    }
}

impl TokenId {
    /// Generate a new time-ordered token id.
    pub fn new() -> Self {
        Self(format!("{}{}", TOKEN_ID_PREFIX, uuid::Uuid::now_v7().simple()))
    }

    /// Parse a token id, enforcing the prefix.
    pub fn from_string(s: impl Into<String>) -> TkResult<Self> {
        let s = s.into();
        if !s.starts_with(TOKEN_ID_PREFIX) {
            return Err(TokenError::InvalidTokenId(s));
        }
        Ok(Self(s))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The signed portion of a capability token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub token_id: TokenId,
    pub issuer_identity_id: IdentityId,
    /// Key generation active at issuance; verification resolves the public
    /// key for exactly this generation.
    pub issuer_generation: u32,
    /// Resource or scope identifier the grant applies to.
    pub subject: String,
    /// Operation tags granted over the subject.
    pub permissions: BTreeSet<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// A signed capability token. Immutable once issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityToken {
    payload: TokenPayload,
    signature: Signature,
    /// Canonical payload bytes the signature covers.
    #[serde(with = "serde_bytes")]
    payload_bytes: Vec<u8>,
}

impl CapabilityToken {
    pub fn id(&self) -> &TokenId {
        &self.payload.token_id
    }

    pub fn issuer(&self) -> &IdentityId {
        &self.payload.issuer_identity_id
    }

    pub fn issuer_generation(&self) -> u32 {
        self.payload.issuer_generation
    }

    pub fn subject(&self) -> &str {
        &self.payload.subject
    }

    pub fn permissions(&self) -> &BTreeSet<String> {
        &self.payload.permissions
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.payload.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.payload.not_after
    }

    pub fn payload(&self) -> &TokenPayload {
        &self.payload
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The canonical payload bytes the signature covers.
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload_bytes
    }

    /// Reassemble a token from its parts. Grants nothing by itself; the
    /// result still has to pass verification.
    pub fn from_parts(payload: TokenPayload, signature: Signature, payload_bytes: Vec<u8>) -> Self {
        Self {
            payload,
            signature,
            payload_bytes,
        }
    }
}

/// The claim established by a successful verification.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedClaim {
    pub token_id: TokenId,
    pub issuer_identity_id: IdentityId,
    pub subject: String,
    pub permissions: BTreeSet<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Seam for revocation membership checks, so verification consults the
/// ledger's derived index without owning it.
pub trait RevocationCheck {
    fn is_revoked(&self, token_id: &str) -> bool;
}

impl RevocationCheck for crate::ledger::AuditLedger {
    fn is_revoked(&self, token_id: &str) -> bool {
        crate::ledger::AuditLedger::is_revoked(self, token_id)
    }
}

impl RevocationCheck for std::collections::HashSet<String> {
    fn is_revoked(&self, token_id: &str) -> bool {
        self.contains(token_id)
    }
}

/// Issues and verifies capability tokens.
#[derive(Debug, Clone)]
pub struct TokenEngine {
    max_lifetime: Duration,
}

impl Default for TokenEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEngine {
    pub fn new() -> Self {
        Self {
            max_lifetime: DEFAULT_MAX_TOKEN_LIFETIME,
        }
    }

    /// Override the maximum validity window.
    pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }

    /// Issue a token for `subject` with the given permission tags and TTL,
    /// signed by the issuer's current key generation.
    ///
    /// The validity window starts now. A zero or negative TTL is
    /// [`TokenError::WindowNotPositive`]; one past the configured maximum is
    /// [`TokenError::WindowTooLong`].
    pub fn issue(
        &self,
        keystore: &KeystoreManager,
        issuer: &IdentityId,
        subject: impl Into<String>,
        permissions: BTreeSet<String>,
        ttl: std::time::Duration,
    ) -> TkResult<CapabilityToken> {
        let ttl = Duration::from_std(ttl).map_err(|_| TokenError::WindowTooLong {
            requested_secs: i64::MAX,
            max_secs: self.max_lifetime.num_seconds(),
        })?;
        if ttl <= Duration::zero() {
            return Err(TokenError::WindowNotPositive);
        }
        if ttl > self.max_lifetime {
            return Err(TokenError::WindowTooLong {
                requested_secs: ttl.num_seconds(),
                max_secs: self.max_lifetime.num_seconds(),
            });
        }

        let identity = keystore.identity(issuer)?;
        let now = Utc::now();
        let payload = TokenPayload {
            token_id: TokenId::new(),
            issuer_identity_id: issuer.clone(),
            issuer_generation: identity.rotation_generation,
            subject: subject.into(),
            permissions,
            not_before: now,
            not_after: now + ttl,
        };

        let mut payload_bytes = Vec::new();
        ciborium::ser::into_writer(&payload, &mut payload_bytes)
            .map_err(|e| TokenError::Malformed(format!("payload encode: {}", e)))?;
        let signature = keystore.sign(issuer, &payload_bytes)?;

        tracing::debug!(token_id = %payload.token_id, subject = %payload.subject, "token issued");
        Ok(CapabilityToken {
            payload,
            signature,
            payload_bytes,
        })
    }

    /// Verify a token and return the claim it establishes.
    ///
    /// Checks, in order: the retained payload bytes match the payload (a
    /// mismatch means the envelope was tampered), the signature under the
    /// public key of the generation recorded in the token, the validity
    /// window against `now`, and revocation-set membership. Each failure is
    /// a distinct [`TokenError`] so callers can log precisely.
    pub fn verify(
        &self,
        token: &CapabilityToken,
        keystore: &KeystoreManager,
        revocation: &impl RevocationCheck,
        now: DateTime<Utc>,
    ) -> TkResult<VerifiedClaim> {
        let reparsed: TokenPayload = ciborium::de::from_reader(token.payload_bytes.as_slice())
            .map_err(|_| TokenError::BadSignature)?;
        if reparsed != token.payload {
            return Err(TokenError::BadSignature);
        }

        let issuer_key = keystore.public_key_for(
            &token.payload.issuer_identity_id,
            token.payload.issuer_generation,
        )?;
        if !issuer_key.verify(&token.payload_bytes, &token.signature) {
            return Err(TokenError::BadSignature);
        }

        if now < token.payload.not_before {
            return Err(TokenError::NotYetValid(token.payload.not_before));
        }
        if now > token.payload.not_after {
            return Err(TokenError::Expired(token.payload.not_after));
        }

        if revocation.is_revoked(token.payload.token_id.as_str()) {
            return Err(TokenError::Revoked(token.payload.token_id.to_string()));
        }

        Ok(VerifiedClaim {
            token_id: token.payload.token_id.clone(),
            issuer_identity_id: token.payload.issuer_identity_id.clone(),
            subject: token.payload.subject.clone(),
            permissions: token.payload.permissions.clone(),
            not_before: token.payload.not_before,
            not_after: token.payload.not_after,
        })
    }
}
