//! The process-wide trust engine.
//!
//! One engine per process, created by explicit [`TrustEngine::open`] (load
//! persisted state, verify the full audit chain, reconcile write-ahead
//! ordering) and torn down by explicit [`TrustEngine::close`] (flush, final
//! chain head persisted). There is no ambient singleton: callers hold the
//! handle, and external requests reach it only through the
//! [`crate::bridge::SecureChannelBridge`].
//!
//! The keystore and ledger each sit behind their own exclusive region.
//! Rotation and signing for the same identity both run under the keystore
//! lock, so a rotation can never interleave with an in-flight sign against
//! the generation it supersedes.
//!
//! ## Locked state
//!
//! A broken audit chain at startup locks the engine: every mutating
//! operation (create, rotate, issue, revoke, evaluate) fails with
//! [`Error::EngineLocked`] while read-only audit inspection keeps working.
//! Recovery is an authorized compaction that discards the damaged prefix,
//! after which the chain is re-verified and the engine unlocks.

use crate::crypto::WrappingKey;
use crate::error::{Error, KeystoreError, LedgerError, Result};
use crate::keystore::{Identity, IdentityAttestation, IdentityId, KeystoreManager};
use crate::ledger::{AuditEvent, AuditLedger, AuditRecord, CompactionAttestation};
use crate::policy::{Decision, EvaluationContext, PolicyEvaluator};
use crate::token::{CapabilityToken, TokenEngine};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError, RwLock};

/// Core version reported across the bridge.
pub const CORE_VERSION: u32 = 1;

/// Device-protected storage paths, supplied by the shell at initialization.
/// The core never chooses its own paths.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub keystore: PathBuf,
    pub ledger: PathBuf,
    pub rules: PathBuf,
}

impl EnginePaths {
    /// Standard file layout under a single device-protected directory.
    pub fn under(dir: impl AsRef<std::path::Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            keystore: dir.join("keys.store"),
            ledger: dir.join("audit.log"),
            rules: dir.join("rules.json"),
        }
    }
}

/// Whether the engine accepts mutating operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Active,
    /// Chain verification failed; carries the operator-facing reason.
    Locked(String),
}

/// The assembled trust core.
pub struct TrustEngine {
    keystore: Mutex<KeystoreManager>,
    ledger: RwLock<AuditLedger>,
    evaluator: PolicyEvaluator,
    tokens: TokenEngine,
    state: RwLock<EngineState>,
    quarantined: HashSet<String>,
    /// Identity designated to authorize ledger compaction.
    compaction_authority: Mutex<Option<IdentityId>>,
}

impl std::fmt::Debug for TrustEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustEngine")
            .field("state", &*self.state.read().unwrap_or_else(PoisonError::into_inner))
            .finish()
    }
}

impl TrustEngine {
    /// Load persisted state and bring the engine up.
    ///
    /// Order matters: the ledger is opened and chain-verified first; then
    /// the keystore is reconciled against it (an identity on disk without a
    /// creation record means power was lost between the key write and the
    /// audit append, and that identity is quarantined). A broken chain
    /// yields a locked but inspectable engine rather than an error.
    pub fn open(paths: &EnginePaths, wrapping_key: WrappingKey) -> Result<Self> {
        let (mut ledger, chain_fault) = if paths.ledger.exists() {
            AuditLedger::open_tolerant(&paths.ledger)?
        } else {
            (AuditLedger::create(&paths.ledger)?, None)
        };

        let keystore = KeystoreManager::open(&paths.keystore, wrapping_key)?;
        let evaluator = if paths.rules.exists() {
            PolicyEvaluator::load(&paths.rules)?
        } else {
            PolicyEvaluator::new(Vec::new())?
        };

        let state = match &chain_fault {
            None => EngineState::Active,
            Some(e) => {
                tracing::error!(error = %e, "audit chain verification failed; engine locked");
                EngineState::Locked(e.to_string())
            }
        };

        let mut quarantined = HashSet::new();
        if state == EngineState::Active {
            // Recorded ids include creation records discarded by compaction,
            // carried forward in the anchor.
            let recorded = ledger.known_identities();
            for id in keystore.identity_ids() {
                if !recorded.contains(id.as_str()) {
                    tracing::warn!(identity_id = %id, "identity missing creation record; quarantined");
                    ledger.append(AuditEvent::IdentityQuarantined {
                        identity_id: id.to_string(),
                    })?;
                    quarantined.insert(id.to_string());
                }
            }
            ledger.append(AuditEvent::EngineStarted {
                core_version: CORE_VERSION,
            })?;
        }

        Ok(Self {
            keystore: Mutex::new(keystore),
            ledger: RwLock::new(ledger),
            evaluator,
            tokens: TokenEngine::new(),
            state: RwLock::new(state),
            quarantined,
            compaction_authority: Mutex::new(None),
        })
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Core version constant, for the shell's bootstrap probe.
    pub fn version(&self) -> u32 {
        CORE_VERSION
    }

    /// Override the token engine configuration (maximum lifetime).
    pub fn with_token_engine(mut self, tokens: TokenEngine) -> Self {
        self.tokens = tokens;
        self
    }

    /// Designate the identity whose signature authorizes compaction.
    pub fn designate_compaction_authority(&self, identity: IdentityId) {
        *self
            .compaction_authority
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(identity);
    }

    fn ensure_active(&self) -> Result<()> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            EngineState::Active => Ok(()),
            EngineState::Locked(reason) => Err(Error::EngineLocked(reason.clone())),
        }
    }

    fn ensure_not_quarantined(&self, identity: &IdentityId) -> Result<()> {
        if self.quarantined.contains(identity.as_str()) {
            return Err(Error::Keystore(KeystoreError::Quarantined(
                identity.to_string(),
            )));
        }
        Ok(())
    }

    /// Create a new identity. The key is persisted first, then the audit
    /// record; failure of the append fails the operation (the orphaned key
    /// is caught by reconciliation at next start).
    pub fn create_identity(&self, label: &str) -> Result<Identity> {
        self.ensure_active()?;
        let identity = {
            let mut keystore = self.keystore.lock().unwrap_or_else(PoisonError::into_inner);
            keystore.create_identity(label)?
        };
        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
        ledger.append(AuditEvent::IdentityCreated {
            identity_id: identity.identity_id.to_string(),
            label: identity.label.clone(),
            generation: identity.rotation_generation,
            fingerprint: identity.public_key.fingerprint(),
        })?;
        Ok(identity)
    }

    /// Rotate an identity to its next key generation (compare-and-swap on
    /// `expected_generation`).
    pub fn rotate_identity(
        &self,
        identity: &IdentityId,
        expected_generation: u32,
    ) -> Result<Identity> {
        self.ensure_active()?;
        self.ensure_not_quarantined(identity)?;
        let rotated = {
            let mut keystore = self.keystore.lock().unwrap_or_else(PoisonError::into_inner);
            keystore.rotate_identity(identity, expected_generation)?
        };
        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
        ledger.append(AuditEvent::IdentityRotated {
            identity_id: rotated.identity_id.to_string(),
            old_generation: expected_generation,
            new_generation: rotated.rotation_generation,
            fingerprint: rotated.public_key.fingerprint(),
        })?;
        Ok(rotated)
    }

    /// Issue a capability token. The issuance record is appended before the
    /// token is returned; if the append fails the token is never released.
    pub fn issue_token(
        &self,
        issuer: &IdentityId,
        subject: &str,
        permissions: BTreeSet<String>,
        ttl: std::time::Duration,
    ) -> Result<CapabilityToken> {
        self.ensure_active()?;
        self.ensure_not_quarantined(issuer)?;
        let token = {
            let keystore = self.keystore.lock().unwrap_or_else(PoisonError::into_inner);
            self.tokens
                .issue(&keystore, issuer, subject, permissions, ttl)?
        };
        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
        ledger.append(AuditEvent::TokenIssued {
            token_id: token.id().to_string(),
            issuer_identity_id: token.issuer().to_string(),
            issuer_generation: token.issuer_generation(),
            subject: token.subject().to_string(),
            permissions: token.permissions().clone(),
            not_before: token.not_before(),
            not_after: token.not_after(),
        })?;
        Ok(token)
    }

    /// Revoke a token by id. Idempotent: revoking an already-revoked token
    /// succeeds without appending a duplicate record. An expired token may
    /// still be revoked for audit completeness.
    pub fn revoke_token(&self, token_id: &str, reason: &str) -> Result<()> {
        self.ensure_active()?;
        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
        if ledger.is_revoked(token_id) {
            return Ok(());
        }
        ledger.append(AuditEvent::TokenRevoked {
            token_id: token_id.to_string(),
            reason: reason.to_string(),
        })?;
        Ok(())
    }

    /// Evaluate an access request.
    ///
    /// The token is verified first; on failure the decision is
    /// `Deny(TokenInvalid(_))` with no rule scan. Terminal decisions are
    /// appended to the ledger before being returned; if the append fails,
    /// the caller gets the ledger error, not an un-logged decision.
    /// `Conditional` outcomes are not terminal and are not logged.
    pub fn evaluate_access(
        &self,
        subject: &str,
        requested_permissions: &BTreeSet<String>,
        token: &CapabilityToken,
        ctx: &EvaluationContext,
    ) -> Result<Decision> {
        self.ensure_active()?;

        let decision = {
            let keystore = self.keystore.lock().unwrap_or_else(PoisonError::into_inner);
            let ledger = self.ledger.read().unwrap_or_else(PoisonError::into_inner);
            match self.tokens.verify(token, &keystore, &*ledger, ctx.now) {
                Err(e) => Decision::from_token_error(&e),
                Ok(claim) => self
                    .evaluator
                    .evaluate(subject, requested_permissions, &claim, ctx),
            }
        };

        if !matches!(decision, Decision::Conditional(_)) {
            let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
            ledger.append(AuditEvent::PolicyDecision {
                subject: subject.to_string(),
                requested: requested_permissions.clone(),
                token_id: Some(token.id().to_string()),
                decision: decision.clone(),
            })?;
        }
        Ok(decision)
    }

    /// Read-only audit inspection. Permitted even while locked.
    pub fn query_audit_range(&self, from: u64, to: u64) -> Result<Vec<AuditRecord>> {
        let ledger = self.ledger.read().unwrap_or_else(PoisonError::into_inner);
        Ok(ledger.range(from, to)?.to_vec())
    }

    /// Verify a chain range on demand.
    pub fn verify_chain(&self, from: u64, to: u64) -> Result<bool> {
        let ledger = self.ledger.read().unwrap_or_else(PoisonError::into_inner);
        Ok(ledger.verify_chain(from, to)?)
    }

    /// Produce a self-signed attestation for an identity.
    pub fn create_attestation(&self, identity: &IdentityId) -> Result<IdentityAttestation> {
        self.ensure_not_quarantined(identity)?;
        let keystore = self.keystore.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(keystore.create_attestation(identity)?)
    }

    /// Sign a compaction attestation with the designated authority.
    pub fn sign_compaction_attestation(
        &self,
        discarded_from: u64,
        discarded_to: u64,
    ) -> Result<CompactionAttestation> {
        let authority = self
            .compaction_authority
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                Error::Ledger(LedgerError::Unauthorized(
                    "no compaction authority designated".into(),
                ))
            })?;
        let head_hash = {
            let ledger = self.ledger.read().unwrap_or_else(PoisonError::into_inner);
            ledger
                .range(discarded_to, discarded_to)?
                .first()
                .map(|r| r.record_hash)
                .ok_or(LedgerError::RangeUnavailable {
                    from: discarded_from,
                    to: discarded_to,
                })?
        };
        let keystore = self.keystore.lock().unwrap_or_else(PoisonError::into_inner);
        // Sign over the attestation bytes with the authority's current key.
        let attestation = CompactionAttestation::sign_with(
            authority.to_string(),
            discarded_from,
            discarded_to,
            head_hash,
            |bytes| keystore.sign(&authority, bytes),
        )?;
        Ok(attestation)
    }

    /// Compact the ledger prefix before `before_sequence` under a signed
    /// attestation. This is also the recovery path out of the locked state:
    /// once the damaged prefix is discarded and the remaining chain
    /// verifies, the engine unlocks.
    pub fn compact_ledger(
        &self,
        before_sequence: u64,
        attestation: CompactionAttestation,
    ) -> Result<()> {
        let authority_id = self
            .compaction_authority
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                Error::Ledger(LedgerError::Unauthorized(
                    "no compaction authority designated".into(),
                ))
            })?;
        let authority_key = {
            let keystore = self.keystore.lock().unwrap_or_else(PoisonError::into_inner);
            let identity = keystore.identity(&authority_id)?;
            identity.public_key.clone()
        };

        {
            let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
            ledger.compact(before_sequence, attestation, &authority_key)?;
        }

        // Recovery: if the engine was locked and the retained chain now
        // verifies, unlock.
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, EngineState::Locked(_)) {
            let ledger = self.ledger.read().unwrap_or_else(PoisonError::into_inner);
            if ledger.verify_retained_chain().is_ok() {
                tracing::info!("chain verified after compaction; engine unlocked");
                *state = EngineState::Active;
            }
        }
        Ok(())
    }

    /// Drop the wrapping key: subsequent signing and mutation report the
    /// keystore as locked until [`unlock_keystore`](Self::unlock_keystore).
    pub fn lock_keystore(&self) {
        self.keystore
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lock();
    }

    /// Restore the wrapping key.
    pub fn unlock_keystore(&self, wrapping_key: WrappingKey) -> Result<()> {
        Ok(self
            .keystore
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unlock(wrapping_key)?)
    }

    /// Explicit teardown: flush the ledger so the final chain head is
    /// durable.
    pub fn close(self) -> Result<()> {
        let mut ledger = self.ledger.into_inner().unwrap_or_else(PoisonError::into_inner);
        ledger.flush()?;
        Ok(())
    }
}
