//! Append-only, hash-chained audit ledger.
//!
//! Every security-relevant state change (identity creation/rotation, token
//! issuance/revocation, policy decisions, compaction) lands here as an
//! [`AuditRecord`] whose hash covers the previous record's hash, the
//! canonical payload bytes, and the timestamp. The chain is rooted at a
//! fixed genesis hash; any byte flip in a stored record breaks verification
//! for that record and every record after it.
//!
//! ## Persistence
//!
//! One file: an anchor frame followed by record frames, each frame a u32
//! big-endian length prefix and a CBOR body. The anchor carries the hash the
//! chain is rooted at; after compaction it carries the re-anchored hash plus
//! the signed attestation covering the discarded range.
//!
//! ## Fail-closed
//!
//! `append` performs the durable write before mutating in-memory state. If
//! storage rejects the write after bounded retries, the append fails with
//! [`LedgerError::WriteFailed`] and the triggering operation must fail too.

use crate::crypto::{PublicKey, Signature, SigningKey};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;

/// A chain hash (SHA-256).
pub type ChainHash = [u8; 32];

/// Label hashed to produce the initial genesis anchor.
const GENESIS_LABEL: &[u8] = b"sovereign-ledger-genesis-v1";

/// Storage retry bound for transient write contention.
const WRITE_ATTEMPTS: u32 = 3;
const WRITE_BACKOFF_MS: u64 = 10;

/// The fixed genesis hash a fresh ledger is rooted at.
pub fn genesis_hash() -> ChainHash {
    Sha256::digest(GENESIS_LABEL).into()
}

/// A security-relevant event recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuditEvent {
    /// A new identity was created.
    IdentityCreated {
        identity_id: String,
        label: String,
        generation: u32,
        fingerprint: String,
    },
    /// An identity advanced to a new key generation.
    IdentityRotated {
        identity_id: String,
        old_generation: u32,
        new_generation: u32,
        fingerprint: String,
    },
    /// An identity found in the keystore without a matching creation record
    /// (write-ahead reconciliation at startup).
    IdentityQuarantined { identity_id: String },
    /// A capability token was issued. Recorded before the token is returned
    /// to the caller; a token with no issuance record is not usable.
    TokenIssued {
        token_id: String,
        issuer_identity_id: String,
        issuer_generation: u32,
        subject: String,
        permissions: BTreeSet<String>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    },
    /// A capability token was revoked. Idempotent at the engine level; the
    /// ledger may carry several records for the same id.
    TokenRevoked { token_id: String, reason: String },
    /// A terminal policy decision. Recorded before the decision is returned.
    PolicyDecision {
        subject: String,
        requested: BTreeSet<String>,
        token_id: Option<String>,
        decision: crate::policy::Decision,
    },
    /// A hash-chain prefix was discarded under a signed attestation.
    Compacted {
        discarded_from: u64,
        discarded_to: u64,
        authorized_by: String,
    },
    /// Engine startup marker, recording the core version.
    EngineStarted { core_version: u32 },
}

impl AuditEvent {
    /// Short tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IdentityCreated { .. } => "identity-created",
            Self::IdentityRotated { .. } => "identity-rotated",
            Self::IdentityQuarantined { .. } => "identity-quarantined",
            Self::TokenIssued { .. } => "token-issued",
            Self::TokenRevoked { .. } => "token-revoked",
            Self::PolicyDecision { .. } => "policy-decision",
            Self::Compacted { .. } => "compacted",
            Self::EngineStarted { .. } => "engine-started",
        }
    }
}

/// One entry in the hash chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic sequence number.
    pub sequence: u64,
    /// Hash of the previous record (or the anchor hash for the first
    /// retained record).
    pub prev_hash: ChainHash,
    /// The recorded event.
    pub payload: AuditEvent,
    /// When the record was appended.
    pub timestamp: DateTime<Utc>,
    /// `SHA-256(prev_hash || canonical(payload) || timestamp_micros_be)`.
    pub record_hash: ChainHash,
}

impl AuditRecord {
    fn compute_hash(
        prev_hash: &ChainHash,
        payload: &AuditEvent,
        timestamp: DateTime<Utc>,
    ) -> Result<ChainHash, LedgerError> {
        let mut payload_bytes = Vec::new();
        ciborium::ser::into_writer(payload, &mut payload_bytes)
            .map_err(|e| LedgerError::WriteFailed(format!("payload encode: {}", e)))?;
        let mut hasher = Sha256::new();
        hasher.update(prev_hash);
        hasher.update(&payload_bytes);
        hasher.update(timestamp.timestamp_micros().to_be_bytes());
        Ok(hasher.finalize().into())
    }

    /// Recompute this record's hash and compare constant-time.
    pub fn hash_is_valid(&self) -> bool {
        match Self::compute_hash(&self.prev_hash, &self.payload, self.timestamp) {
            Ok(computed) => computed.ct_eq(&self.record_hash).into(),
            Err(_) => false,
        }
    }
}

/// Signed authorization for discarding a hash-chain prefix.
///
/// The designated compaction authority signs the discarded range bounds and
/// the head hash of the discarded prefix, attesting that the range was
/// inspected before removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionAttestation {
    /// Identity id of the authority that signed.
    pub authorized_by: String,
    /// First discarded sequence number.
    pub discarded_from: u64,
    /// Last discarded sequence number (inclusive).
    pub discarded_to: u64,
    /// `record_hash` of the last discarded record; becomes the new anchor.
    pub head_hash: ChainHash,
    /// When the attestation was signed.
    pub signed_at: DateTime<Utc>,
    signature: Signature,
}

impl CompactionAttestation {
    fn signing_bytes(
        authorized_by: &str,
        from: u64,
        to: u64,
        head_hash: &ChainHash,
        signed_at: DateTime<Utc>,
    ) -> Result<Vec<u8>, LedgerError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(
            &(authorized_by, from, to, serde_bytes::Bytes::new(head_hash), signed_at.timestamp_micros()),
            &mut buf,
        )
        .map_err(|e| LedgerError::Unauthorized(format!("attestation encode: {}", e)))?;
        Ok(buf)
    }

    /// Sign a new attestation over the given discarded range.
    pub fn sign(
        authorized_by: impl Into<String>,
        discarded_from: u64,
        discarded_to: u64,
        head_hash: ChainHash,
        key: &SigningKey,
    ) -> Result<Self, LedgerError> {
        let authorized_by = authorized_by.into();
        let signed_at = Utc::now();
        let bytes = Self::signing_bytes(
            &authorized_by,
            discarded_from,
            discarded_to,
            &head_hash,
            signed_at,
        )?;
        Ok(Self {
            authorized_by,
            discarded_from,
            discarded_to,
            head_hash,
            signed_at,
            signature: key.sign(&bytes),
        })
    }

    /// Sign an attestation with a caller-supplied signing function, for
    /// authorities whose keys never leave the keystore.
    pub fn sign_with<F>(
        authorized_by: String,
        discarded_from: u64,
        discarded_to: u64,
        head_hash: ChainHash,
        sign: F,
    ) -> Result<Self, LedgerError>
    where
        F: FnOnce(&[u8]) -> std::result::Result<Signature, crate::error::KeystoreError>,
    {
        let signed_at = Utc::now();
        let bytes = Self::signing_bytes(
            &authorized_by,
            discarded_from,
            discarded_to,
            &head_hash,
            signed_at,
        )?;
        let signature =
            sign(&bytes).map_err(|e| LedgerError::Unauthorized(format!("authority key: {}", e)))?;
        Ok(Self {
            authorized_by,
            discarded_from,
            discarded_to,
            head_hash,
            signed_at,
            signature,
        })
    }

    /// Verify the attestation against the designated authority's key.
    pub fn verify(&self, authority: &PublicKey) -> Result<(), LedgerError> {
        let bytes = Self::signing_bytes(
            &self.authorized_by,
            self.discarded_from,
            self.discarded_to,
            &self.head_hash,
            self.signed_at,
        )?;
        if authority.verify(&bytes, &self.signature) {
            Ok(())
        } else {
            Err(LedgerError::Unauthorized(
                "attestation signature invalid".into(),
            ))
        }
    }
}

/// Anchor frame at the head of the ledger file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerAnchor {
    /// Sequence number of the first retained record.
    base_sequence: u64,
    /// Hash the first retained record's `prev_hash` must equal.
    anchor_hash: ChainHash,
    /// Present after compaction: the signed summary of the discarded range.
    attestation: Option<CompactionAttestation>,
    /// Revoked token ids whose revocation records were in a discarded
    /// prefix. Revocation must outlive compaction.
    carried_revocations: BTreeSet<String>,
    /// Identity ids whose creation records were in a discarded prefix.
    /// Startup reconciliation must still recognize them as recorded.
    carried_identities: BTreeSet<String>,
}

/// The append-only audit ledger.
///
/// Owns the retained chain in memory plus the backing file, and maintains
/// the derived revocation index so token verification never rescans the
/// chain.
#[derive(Debug)]
pub struct AuditLedger {
    path: PathBuf,
    file: File,
    anchor: LedgerAnchor,
    records: Vec<AuditRecord>,
    revoked: HashSet<String>,
}

impl AuditLedger {
    /// Create a fresh ledger file rooted at the fixed genesis hash.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let anchor = LedgerAnchor {
            base_sequence: 0,
            anchor_hash: genesis_hash(),
            attestation: None,
            carried_revocations: BTreeSet::new(),
            carried_identities: BTreeSet::new(),
        };
        let file = Self::write_fresh_file(&path, &anchor, &[])?;
        Ok(Self {
            path,
            file,
            anchor,
            records: Vec::new(),
            revoked: HashSet::new(),
        })
    }

    /// Open an existing ledger file and verify the full retained chain.
    ///
    /// Returns [`LedgerError::ChainBroken`] on any hash mismatch; the caller
    /// (the engine) translates that into the `Locked` state.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let (ledger, chain_fault) = Self::open_tolerant(path)?;
        match chain_fault {
            None => Ok(ledger),
            Some(e) => Err(e),
        }
    }

    /// Open an existing ledger file, keeping it readable even when the
    /// chain is broken.
    ///
    /// The engine needs the records for read-only inspection while locked,
    /// so a hash mismatch is returned alongside the ledger rather than
    /// instead of it. An unparseable file is still a hard
    /// [`LedgerError::FileCorrupt`].
    pub fn open_tolerant(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Option<LedgerError>), LedgerError> {
        let path = path.as_ref().to_path_buf();
        let mut raw = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut raw))
            .map_err(|e| LedgerError::FileCorrupt(format!("read {}: {}", path.display(), e)))?;

        let mut frames = FrameReader::new(&raw);
        let anchor: LedgerAnchor = frames
            .next_frame()?
            .ok_or_else(|| LedgerError::FileCorrupt("missing anchor frame".into()))?;
        let mut records = Vec::new();
        while let Some(record) = frames.next_frame::<AuditRecord>()? {
            records.push(record);
        }

        let mut revoked = Self::project_revocations(&records);
        revoked.extend(anchor.carried_revocations.iter().cloned());
        let ledger = Self {
            file: OpenOptions::new().append(true).open(&path).map_err(|e| {
                LedgerError::FileCorrupt(format!("open {}: {}", path.display(), e))
            })?,
            path,
            anchor,
            revoked,
            records,
        };
        let chain_fault = ledger.verify_retained_chain().err();
        Ok((ledger, chain_fault))
    }

    fn write_fresh_file(
        path: &Path,
        anchor: &LedgerAnchor,
        records: &[AuditRecord],
    ) -> Result<File, LedgerError> {
        let tmp = path.with_extension("tmp");
        {
            let mut f = File::create(&tmp)
                .map_err(|e| LedgerError::WriteFailed(format!("create {}: {}", tmp.display(), e)))?;
            write_frame(&mut f, anchor)?;
            for record in records {
                write_frame(&mut f, record)?;
            }
            f.sync_all()
                .map_err(|e| LedgerError::WriteFailed(e.to_string()))?;
        }
        std::fs::rename(&tmp, path).map_err(|e| LedgerError::WriteFailed(e.to_string()))?;
        OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| LedgerError::WriteFailed(e.to_string()))
    }

    fn project_revocations(records: &[AuditRecord]) -> HashSet<String> {
        records
            .iter()
            .filter_map(|r| match &r.payload {
                AuditEvent::TokenRevoked { token_id, .. } => Some(token_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn project_identities(records: &[AuditRecord]) -> HashSet<String> {
        records
            .iter()
            .filter_map(|r| match &r.payload {
                AuditEvent::IdentityCreated { identity_id, .. } => Some(identity_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Identity ids with a creation record anywhere in the chain's history,
    /// including records discarded by compaction (carried in the anchor).
    pub fn known_identities(&self) -> HashSet<String> {
        let mut ids = Self::project_identities(&self.records);
        ids.extend(self.anchor.carried_identities.iter().cloned());
        ids
    }

    /// Hash the next appended record must link to.
    pub fn head_hash(&self) -> ChainHash {
        self.records
            .last()
            .map(|r| r.record_hash)
            .unwrap_or(self.anchor.anchor_hash)
    }

    /// Sequence number the next appended record will take.
    pub fn next_sequence(&self) -> u64 {
        self.records
            .last()
            .map(|r| r.sequence + 1)
            .unwrap_or(self.anchor.base_sequence)
    }

    /// Append an event to the chain.
    ///
    /// The durable write happens first, with a small bounded retry on
    /// transient failure; in-memory state (chain and revocation index) is
    /// only updated once the bytes are on disk.
    pub fn append(&mut self, payload: AuditEvent) -> Result<AuditRecord, LedgerError> {
        let timestamp = Utc::now();
        let prev_hash = self.head_hash();
        let record_hash = AuditRecord::compute_hash(&prev_hash, &payload, timestamp)?;
        let record = AuditRecord {
            sequence: self.next_sequence(),
            prev_hash,
            payload,
            timestamp,
            record_hash,
        };

        let mut frame = Vec::new();
        encode_frame(&mut frame, &record)?;

        let mut last_err = None;
        let mut written = false;
        for attempt in 0..WRITE_ATTEMPTS {
            match self.file.write_all(&frame).and_then(|_| self.file.sync_data()) {
                Ok(()) => {
                    written = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "ledger append retry");
                    last_err = Some(e);
                    std::thread::sleep(std::time::Duration::from_millis(
                        WRITE_BACKOFF_MS * (attempt as u64 + 1),
                    ));
                }
            }
        }
        if !written {
            return Err(LedgerError::WriteFailed(
                last_err
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown I/O failure".into()),
            ));
        }

        if let AuditEvent::TokenRevoked { token_id, .. } = &record.payload {
            self.revoked.insert(token_id.clone());
        }
        tracing::debug!(
            sequence = record.sequence,
            kind = record.payload.kind(),
            "audit record appended"
        );
        self.records.push(record.clone());
        Ok(record)
    }

    /// Whether a token id appears in the revocation projection.
    pub fn is_revoked(&self, token_id: &str) -> bool {
        self.revoked.contains(token_id)
    }

    /// Verify the chain over an inclusive sequence range.
    ///
    /// Returns `Ok(true)` when every record in the range links correctly and
    /// hashes to its stored `record_hash`, `Ok(false)` on any mismatch.
    pub fn verify_chain(&self, from: u64, to: u64) -> Result<bool, LedgerError> {
        if from < self.anchor.base_sequence || to >= self.next_sequence() || from > to {
            return Err(LedgerError::RangeUnavailable { from, to });
        }
        let start = (from - self.anchor.base_sequence) as usize;
        let end = (to - self.anchor.base_sequence) as usize;
        for (offset, record) in self.records[start..=end].iter().enumerate() {
            let idx = start + offset;
            let expected_prev = if idx == 0 {
                self.anchor.anchor_hash
            } else {
                self.records[idx - 1].record_hash
            };
            let prev_ok: bool = record.prev_hash.ct_eq(&expected_prev).into();
            if !prev_ok || !record.hash_is_valid() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Verify the entire retained chain, naming the first broken sequence.
    pub fn verify_retained_chain(&self) -> Result<(), LedgerError> {
        if self.records.is_empty() {
            return Ok(());
        }
        let from = self.anchor.base_sequence;
        let to = self.next_sequence() - 1;
        for seq in from..=to {
            // Re-walk record by record so the error names the first broken
            // sequence, which the operator needs for recovery.
            if !self.verify_chain(seq, seq)? {
                return Err(LedgerError::ChainBroken(seq));
            }
        }
        Ok(())
    }

    /// Read-only slice of records in an inclusive sequence range.
    pub fn range(&self, from: u64, to: u64) -> Result<&[AuditRecord], LedgerError> {
        if from < self.anchor.base_sequence || to >= self.next_sequence() || from > to {
            return Err(LedgerError::RangeUnavailable { from, to });
        }
        let start = (from - self.anchor.base_sequence) as usize;
        let end = (to - self.anchor.base_sequence) as usize;
        Ok(&self.records[start..=end])
    }

    /// All retained records.
    pub fn records(&self) -> &[AuditRecord] {
        &self.records
    }

    /// First retained sequence number.
    pub fn base_sequence(&self) -> u64 {
        self.anchor.base_sequence
    }

    /// Discard the chain prefix strictly before `before_sequence`, re-anchoring
    /// at the last discarded record's hash.
    ///
    /// Requires an attestation signed by the designated compaction authority
    /// covering exactly the discarded range and its head hash; anything else
    /// is [`LedgerError::Unauthorized`]. A `Compacted` record is appended
    /// after re-anchoring so the discard itself is audited.
    pub fn compact(
        &mut self,
        before_sequence: u64,
        attestation: CompactionAttestation,
        authority: &PublicKey,
    ) -> Result<(), LedgerError> {
        if before_sequence <= self.anchor.base_sequence {
            return Ok(()); // nothing to discard
        }
        if before_sequence > self.next_sequence() {
            return Err(LedgerError::RangeUnavailable {
                from: self.anchor.base_sequence,
                to: before_sequence,
            });
        }

        attestation.verify(authority)?;

        let discard_count = (before_sequence - self.anchor.base_sequence) as usize;
        let last_discarded = &self.records[discard_count - 1];
        if attestation.discarded_from != self.anchor.base_sequence
            || attestation.discarded_to != last_discarded.sequence
        {
            return Err(LedgerError::Unauthorized(
                "attestation range does not match compaction request".into(),
            ));
        }
        let head_ok: bool = attestation
            .head_hash
            .ct_eq(&last_discarded.record_hash)
            .into();
        if !head_ok {
            return Err(LedgerError::Unauthorized(
                "attestation head hash does not match discarded prefix".into(),
            ));
        }

        let mut carried_revocations = self.anchor.carried_revocations.clone();
        carried_revocations.extend(
            Self::project_revocations(&self.records[..discard_count]),
        );
        let mut carried_identities = self.anchor.carried_identities.clone();
        carried_identities.extend(
            Self::project_identities(&self.records[..discard_count]),
        );
        let new_anchor = LedgerAnchor {
            base_sequence: before_sequence,
            anchor_hash: last_discarded.record_hash,
            attestation: Some(attestation.clone()),
            carried_revocations,
            carried_identities,
        };
        let retained: Vec<AuditRecord> = self.records[discard_count..].to_vec();
        self.file = Self::write_fresh_file(&self.path, &new_anchor, &retained)?;
        self.anchor = new_anchor;
        self.records = retained;
        tracing::info!(
            before_sequence,
            authorized_by = %attestation.authorized_by,
            "ledger compacted"
        );

        self.append(AuditEvent::Compacted {
            discarded_from: attestation.discarded_from,
            discarded_to: attestation.discarded_to,
            authorized_by: attestation.authorized_by,
        })?;
        Ok(())
    }

    /// Flush and sync the backing file. Called at explicit engine teardown.
    pub fn flush(&mut self) -> Result<(), LedgerError> {
        self.file
            .sync_all()
            .map_err(|e| LedgerError::WriteFailed(e.to_string()))
    }
}

// ============================================================================
// Frame I/O: u32 big-endian length prefix + CBOR body
// ============================================================================

fn encode_frame<T: Serialize>(buf: &mut Vec<u8>, value: &T) -> Result<(), LedgerError> {
    let mut body = Vec::new();
    ciborium::ser::into_writer(value, &mut body)
        .map_err(|e| LedgerError::WriteFailed(format!("frame encode: {}", e)))?;
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(())
}

fn write_frame<T: Serialize, W: Write>(w: &mut W, value: &T) -> Result<(), LedgerError> {
    let mut buf = Vec::new();
    encode_frame(&mut buf, value)?;
    w.write_all(&buf)
        .map_err(|e| LedgerError::WriteFailed(e.to_string()))
}

struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn next_frame<T: serde::de::DeserializeOwned>(&mut self) -> Result<Option<T>, LedgerError> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        if self.data.len() - self.pos < 4 {
            return Err(LedgerError::FileCorrupt("truncated frame length".into()));
        }
        let len = u32::from_be_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap()) as usize;
        self.pos += 4;
        if self.data.len() - self.pos < len {
            return Err(LedgerError::FileCorrupt("truncated frame body".into()));
        }
        let body = &self.data[self.pos..self.pos + len];
        self.pos += len;
        let value = ciborium::de::from_reader(body)
            .map_err(|e| LedgerError::FileCorrupt(format!("frame decode: {}", e)))?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(n: u32) -> AuditEvent {
        AuditEvent::EngineStarted { core_version: n }
    }

    #[test]
    fn fresh_ledger_roots_at_genesis() {
        let dir = tempdir().unwrap();
        let ledger = AuditLedger::create(dir.path().join("audit.log")).unwrap();
        assert_eq!(ledger.head_hash(), genesis_hash());
        assert_eq!(ledger.next_sequence(), 0);
    }

    #[test]
    fn append_links_records() {
        let dir = tempdir().unwrap();
        let mut ledger = AuditLedger::create(dir.path().join("audit.log")).unwrap();
        let a = ledger.append(event(1)).unwrap();
        let b = ledger.append(event(2)).unwrap();
        assert_eq!(a.prev_hash, genesis_hash());
        assert_eq!(b.prev_hash, a.record_hash);
        assert_eq!(b.sequence, 1);
        assert!(ledger.verify_chain(0, 1).unwrap());
    }

    #[test]
    fn reopen_verifies_and_preserves_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let head = {
            let mut ledger = AuditLedger::create(&path).unwrap();
            for i in 0..5 {
                ledger.append(event(i)).unwrap();
            }
            ledger.head_hash()
        };
        let ledger = AuditLedger::open(&path).unwrap();
        assert_eq!(ledger.records().len(), 5);
        assert_eq!(ledger.head_hash(), head);
        assert!(ledger.verify_chain(0, 4).unwrap());
    }

    #[test]
    fn revocation_projection_rebuilds_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        {
            let mut ledger = AuditLedger::create(&path).unwrap();
            ledger
                .append(AuditEvent::TokenRevoked {
                    token_id: "svrn_tok_x".into(),
                    reason: "compromised".into(),
                })
                .unwrap();
        }
        let ledger = AuditLedger::open(&path).unwrap();
        assert!(ledger.is_revoked("svrn_tok_x"));
        assert!(!ledger.is_revoked("svrn_tok_y"));
    }

    #[test]
    fn tampered_payload_breaks_chain_from_that_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        {
            let mut ledger = AuditLedger::create(&path).unwrap();
            for i in 0..3 {
                ledger
                    .append(AuditEvent::TokenRevoked {
                        token_id: format!("svrn_tok_{}", i),
                        reason: "r".into(),
                    })
                    .unwrap();
            }
        }
        // Flip one byte of a token id inside the middle record's frame.
        let mut raw = std::fs::read(&path).unwrap();
        let needle = b"svrn_tok_1";
        let pos = raw
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap();
        raw[pos + needle.len() - 1] = b'9';
        std::fs::write(&path, &raw).unwrap();

        let err = AuditLedger::open(&path).unwrap_err();
        assert_eq!(err, LedgerError::ChainBroken(1));
    }

    #[test]
    fn truncated_file_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        {
            let mut ledger = AuditLedger::create(&path).unwrap();
            ledger.append(event(1)).unwrap();
        }
        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 3]).unwrap();
        let err = AuditLedger::open(&path).unwrap_err();
        assert!(matches!(err, LedgerError::FileCorrupt(_)));
    }

    #[test]
    fn compaction_requires_valid_attestation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let mut ledger = AuditLedger::create(&path).unwrap();
        for i in 0..4 {
            ledger.append(event(i)).unwrap();
        }
        let authority = crate::crypto::SigningKey::generate().unwrap();
        let intruder = crate::crypto::SigningKey::generate().unwrap();
        let head = ledger.records()[1].record_hash;

        let forged =
            CompactionAttestation::sign("svrn_idn_evil", 0, 1, head, &intruder).unwrap();
        let err = ledger
            .compact(2, forged, &authority.public_key())
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        let good = CompactionAttestation::sign("svrn_idn_auth", 0, 1, head, &authority).unwrap();
        ledger.compact(2, good, &authority.public_key()).unwrap();
        assert_eq!(ledger.base_sequence(), 2);
        // Retained suffix still verifies against the re-anchored genesis.
        let last = ledger.next_sequence() - 1;
        assert!(ledger.verify_chain(2, last).unwrap());
        // Discarded range is gone.
        assert!(ledger.range(0, 1).is_err());
        // The compaction itself was audited.
        assert!(matches!(
            ledger.records().last().unwrap().payload,
            AuditEvent::Compacted { .. }
        ));
    }

    #[test]
    fn compaction_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let authority = crate::crypto::SigningKey::generate().unwrap();
        {
            let mut ledger = AuditLedger::create(&path).unwrap();
            for i in 0..4 {
                ledger.append(event(i)).unwrap();
            }
            let head = ledger.records()[1].record_hash;
            let att =
                CompactionAttestation::sign("svrn_idn_auth", 0, 1, head, &authority).unwrap();
            ledger.compact(2, att, &authority.public_key()).unwrap();
        }
        let ledger = AuditLedger::open(&path).unwrap();
        assert_eq!(ledger.base_sequence(), 2);
        let last = ledger.next_sequence() - 1;
        assert!(ledger.verify_chain(2, last).unwrap());
    }

    #[test]
    fn revocation_outlives_compaction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let authority = crate::crypto::SigningKey::generate().unwrap();
        {
            let mut ledger = AuditLedger::create(&path).unwrap();
            ledger
                .append(AuditEvent::TokenRevoked {
                    token_id: "svrn_tok_old".into(),
                    reason: "compromised".into(),
                })
                .unwrap();
            ledger.append(event(1)).unwrap();
            ledger.append(event(2)).unwrap();
            let head = ledger.records()[1].record_hash;
            let att =
                CompactionAttestation::sign("svrn_idn_auth", 0, 1, head, &authority).unwrap();
            ledger.compact(2, att, &authority.public_key()).unwrap();
            assert!(ledger.is_revoked("svrn_tok_old"));
        }
        let ledger = AuditLedger::open(&path).unwrap();
        assert!(ledger.is_revoked("svrn_tok_old"));
    }

    #[test]
    fn identity_records_outlive_compaction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let authority = crate::crypto::SigningKey::generate().unwrap();
        {
            let mut ledger = AuditLedger::create(&path).unwrap();
            ledger
                .append(AuditEvent::IdentityCreated {
                    identity_id: "svrn_idn_old".into(),
                    label: "old".into(),
                    generation: 0,
                    fingerprint: "f".into(),
                })
                .unwrap();
            ledger.append(event(1)).unwrap();
            ledger.append(event(2)).unwrap();
            let head = ledger.records()[1].record_hash;
            let att =
                CompactionAttestation::sign("svrn_idn_auth", 0, 1, head, &authority).unwrap();
            ledger.compact(2, att, &authority.public_key()).unwrap();
            assert!(ledger.known_identities().contains("svrn_idn_old"));
        }
        let ledger = AuditLedger::open(&path).unwrap();
        assert!(ledger.known_identities().contains("svrn_idn_old"));
    }

    #[test]
    fn attestation_range_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let mut ledger = AuditLedger::create(dir.path().join("audit.log")).unwrap();
        for i in 0..4 {
            ledger.append(event(i)).unwrap();
        }
        let authority = crate::crypto::SigningKey::generate().unwrap();
        // Attestation covers 0..=0 but the request discards 0..=1.
        let head = ledger.records()[0].record_hash;
        let att = CompactionAttestation::sign("svrn_idn_auth", 0, 0, head, &authority).unwrap();
        let err = ledger.compact(2, att, &authority.public_key()).unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));
    }
}
