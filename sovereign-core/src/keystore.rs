//! Keystore manager: sole owner of raw key material.
//!
//! Identities are Ed25519 key pairs with a rotation generation. Private
//! seeds live sealed under the device-bound wrapping key inside a
//! [`SecureStore`]; they are unsealed into memory only while the keystore is
//! unlocked, and plaintext key material never leaves this module.
//!
//! Superseded generations are retained (not wiped) so historical token
//! signatures stay verifiable, and pruned only after a grace period sized by
//! the engine to exceed the maximum token lifetime.

use crate::crypto::{PublicKey, Signature, SigningKey, WrappingKey};
use crate::error::KeystoreError;
use crate::storage::SecureStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use zeroize::Zeroize;

/// The required prefix for identity ids.
pub const IDENTITY_ID_PREFIX: &str = "svrn_idn_";

/// Default retention for superseded key generations.
pub const DEFAULT_ROTATION_GRACE: Duration = Duration::days(30);

type KsResult<T> = std::result::Result<T, KeystoreError>;

/// A unique, opaque identity id (`svrn_idn_` + UUIDv7).
///
/// UUIDv7 is time-ordered, which keeps audit trails readable; the prefix is
/// enforced on construction and on deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IdentityId(String);

impl<'de> Deserialize<'de> for IdentityId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        IdentityId::from_string(s).map_err(serde::de::Error::custom)
    }
}

impl IdentityId {
    /// Generate a new time-ordered identity id.
    pub fn new() -> Self {
        Self(format!("{}{}", IDENTITY_ID_PREFIX, uuid::Uuid::now_v7().simple()))
    }

    /// Parse an identity id, enforcing the prefix.
    pub fn from_string(s: impl Into<String>) -> KsResult<Self> {
        let s = s.into();
        if !s.starts_with(IDENTITY_ID_PREFIX) {
            return Err(KeystoreError::InvalidIdentityId(s));
        }
        Ok(Self(s))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for IdentityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A superseded key generation, retained for historical verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupersededGeneration {
    pub generation: u32,
    pub public_key: PublicKey,
    pub superseded_at: DateTime<Utc>,
}

/// Public identity record. Private key material is held separately and never
/// appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub identity_id: IdentityId,
    pub label: String,
    /// Public key of the current generation.
    pub public_key: PublicKey,
    pub creation_time: DateTime<Utc>,
    pub rotation_generation: u32,
    /// Prior generations, newest last.
    pub superseded: Vec<SupersededGeneration>,
}

/// Sealed per-identity record as persisted: the public identity plus the
/// secret seeds for every retained generation.
#[derive(Serialize, Deserialize)]
struct SealedIdentityRecord {
    identity: Identity,
    /// generation -> 32-byte Ed25519 seed
    seeds: BTreeMap<u32, serde_bytes::ByteBuf>,
}

struct LoadedIdentity {
    identity: Identity,
    keys: BTreeMap<u32, SigningKey>,
}

/// A device attestation: a self-signed statement of an identity's public
/// key, fingerprint, and creation time, suitable for showing to a peer or
/// an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityAttestation {
    pub identity_id: IdentityId,
    pub generation: u32,
    pub public_key: PublicKey,
    pub fingerprint: String,
    pub creation_time: DateTime<Utc>,
    pub attested_at: DateTime<Utc>,
    pub signature: Signature,
}

impl IdentityAttestation {
    fn signing_bytes(&self) -> KsResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(
            &(
                self.identity_id.as_str(),
                self.generation,
                serde_bytes::Bytes::new(&self.public_key.to_bytes()),
                &self.fingerprint,
                self.creation_time.timestamp_micros(),
                self.attested_at.timestamp_micros(),
            ),
            &mut buf,
        )
        .map_err(|e| KeystoreError::StorageFailed(format!("attestation encode: {}", e)))?;
        Ok(buf)
    }

    /// Verify the attestation is self-signed by the named generation.
    pub fn verify(&self) -> bool {
        match self.signing_bytes() {
            Ok(bytes) => self.public_key.verify(&bytes, &self.signature),
            Err(_) => false,
        }
    }
}

/// The keystore manager.
///
/// One writer at a time: the engine holds this behind its exclusive region,
/// which also guarantees rotation never interleaves with an in-flight sign
/// against the same generation.
pub struct KeystoreManager {
    store: SecureStore,
    wrapping_key: Option<WrappingKey>,
    loaded: HashMap<String, LoadedIdentity>,
    rotation_grace: Duration,
}

impl std::fmt::Debug for KeystoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreManager")
            .field("identities", &self.loaded.len())
            .field("locked", &self.wrapping_key.is_none())
            .finish()
    }
}

impl KeystoreManager {
    /// Open the keystore file and unseal every identity with the given
    /// wrapping key.
    pub fn open(path: impl AsRef<Path>, wrapping_key: WrappingKey) -> KsResult<Self> {
        let store = SecureStore::open(path)?;
        let mut manager = Self {
            store,
            wrapping_key: Some(wrapping_key),
            loaded: HashMap::new(),
            rotation_grace: DEFAULT_ROTATION_GRACE,
        };
        manager.unseal_all()?;
        Ok(manager)
    }

    /// Override the retention grace for superseded generations.
    pub fn with_rotation_grace(mut self, grace: Duration) -> Self {
        self.rotation_grace = grace;
        self
    }

    fn unseal_all(&mut self) -> KsResult<()> {
        let wrapping_key = self.wrapping_key.clone().ok_or(KeystoreError::Locked)?;
        let ids: Vec<String> = self.store.keys().map(|s| s.to_string()).collect();
        for id in ids {
            let sealed = self
                .store
                .get(&id)
                .ok_or_else(|| KeystoreError::NotFound(id.clone()))?;
            let mut plaintext = wrapping_key.open(sealed, &id)?;
            let record: SealedIdentityRecord = ciborium::de::from_reader(plaintext.as_slice())
                .map_err(|_| KeystoreError::SealedBlobCorrupt(id.clone()))?;
            plaintext.zeroize();
            let mut keys = BTreeMap::new();
            for (generation, seed) in &record.seeds {
                let seed_arr: [u8; 32] = seed
                    .as_slice()
                    .try_into()
                    .map_err(|_| KeystoreError::SealedBlobCorrupt(id.clone()))?;
                keys.insert(*generation, SigningKey::from_bytes(&seed_arr));
            }
            self.loaded.insert(
                id,
                LoadedIdentity {
                    identity: record.identity,
                    keys,
                },
            );
        }
        Ok(())
    }

    /// Drop the wrapping key and all unsealed material. Subsequent signing
    /// and mutation fail with [`KeystoreError::Locked`] until
    /// [`unlock`](Self::unlock).
    pub fn lock(&mut self) {
        self.wrapping_key = None;
        self.loaded.clear();
    }

    /// Restore the wrapping key and re-unseal.
    pub fn unlock(&mut self, wrapping_key: WrappingKey) -> KsResult<()> {
        self.wrapping_key = Some(wrapping_key);
        self.unseal_all()
    }

    /// Whether the keystore is currently locked.
    pub fn is_locked(&self) -> bool {
        self.wrapping_key.is_none()
    }

    fn persist_identity(&mut self, id: &str) -> KsResult<()> {
        let wrapping_key = self.wrapping_key.clone().ok_or(KeystoreError::Locked)?;
        let loaded = self
            .loaded
            .get(id)
            .ok_or_else(|| KeystoreError::NotFound(id.to_string()))?;
        let record = SealedIdentityRecord {
            identity: loaded.identity.clone(),
            seeds: loaded
                .keys
                .iter()
                .map(|(gen, key)| {
                    (*gen, serde_bytes::ByteBuf::from(key.secret_key_bytes().to_vec()))
                })
                .collect(),
        };
        let mut plaintext = Vec::new();
        ciborium::ser::into_writer(&record, &mut plaintext)
            .map_err(|e| KeystoreError::StorageFailed(format!("record encode: {}", e)))?;
        let sealed = wrapping_key.seal(&plaintext)?;
        plaintext.zeroize();
        self.store.put(id, sealed)
    }

    /// Generate a fresh identity at generation 0 and persist it sealed.
    ///
    /// The caller (the engine) appends the corresponding audit record; key
    /// write happens first so a crash between the two is detectable by
    /// reconciliation at next start.
    pub fn create_identity(&mut self, label: impl Into<String>) -> KsResult<Identity> {
        if self.is_locked() {
            return Err(KeystoreError::Locked);
        }
        let key = SigningKey::generate()?;
        let identity = Identity {
            identity_id: IdentityId::new(),
            label: label.into(),
            public_key: key.public_key(),
            creation_time: Utc::now(),
            rotation_generation: 0,
            superseded: Vec::new(),
        };
        let id = identity.identity_id.as_str().to_string();
        let mut keys = BTreeMap::new();
        keys.insert(0, key);
        self.loaded.insert(
            id.clone(),
            LoadedIdentity {
                identity: identity.clone(),
                keys,
            },
        );
        self.persist_identity(&id)?;
        tracing::info!(
            identity_id = %id,
            fingerprint = %identity.public_key.short_fingerprint(),
            "identity created"
        );
        Ok(identity)
    }

    /// Advance an identity to a new key generation.
    ///
    /// `expected_generation` makes the rotation a compare-and-swap: if a
    /// concurrent rotation already advanced the generation, the caller gets
    /// [`KeystoreError::AlreadyRotated`] with the current value instead of a
    /// lost update or a duplicate generation number.
    ///
    /// The prior generation is marked superseded and retained; generations
    /// past the grace period are pruned here.
    pub fn rotate_identity(
        &mut self,
        identity_id: &IdentityId,
        expected_generation: u32,
    ) -> KsResult<Identity> {
        if self.is_locked() {
            return Err(KeystoreError::Locked);
        }
        let new_key = SigningKey::generate()?;
        let now = Utc::now();
        let grace = self.rotation_grace;
        let loaded = self
            .loaded
            .get_mut(identity_id.as_str())
            .ok_or_else(|| KeystoreError::NotFound(identity_id.to_string()))?;

        let current = loaded.identity.rotation_generation;
        if current != expected_generation {
            return Err(KeystoreError::AlreadyRotated {
                identity_id: identity_id.to_string(),
                expected: expected_generation,
                current,
            });
        }

        loaded.identity.superseded.push(SupersededGeneration {
            generation: current,
            public_key: loaded.identity.public_key.clone(),
            superseded_at: now,
        });
        loaded.identity.rotation_generation = current + 1;
        loaded.identity.public_key = new_key.public_key();
        loaded.keys.insert(current + 1, new_key);

        // Prune generations whose grace period has elapsed.
        let cutoff = now - grace;
        let expired: Vec<u32> = loaded
            .identity
            .superseded
            .iter()
            .filter(|s| s.superseded_at < cutoff)
            .map(|s| s.generation)
            .collect();
        loaded
            .identity
            .superseded
            .retain(|s| s.superseded_at >= cutoff);
        for gen in expired {
            loaded.keys.remove(&gen);
        }

        let identity = loaded.identity.clone();
        self.persist_identity(identity_id.as_str())?;
        tracing::info!(
            identity_id = %identity_id,
            generation = identity.rotation_generation,
            fingerprint = %identity.public_key.short_fingerprint(),
            "identity rotated"
        );
        Ok(identity)
    }

    /// Sign a message with the identity's current generation.
    pub fn sign(&self, identity_id: &IdentityId, message: &[u8]) -> KsResult<Signature> {
        if self.is_locked() {
            return Err(KeystoreError::Locked);
        }
        let loaded = self
            .loaded
            .get(identity_id.as_str())
            .ok_or_else(|| KeystoreError::NotFound(identity_id.to_string()))?;
        let generation = loaded.identity.rotation_generation;
        let key = loaded
            .keys
            .get(&generation)
            .ok_or_else(|| KeystoreError::UnknownGeneration {
                identity_id: identity_id.to_string(),
                generation,
            })?;
        Ok(key.sign(message))
    }

    /// Verify a signature against a public key. Pure, side-effect-free.
    pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
        public_key.verify(message, signature)
    }

    /// Look up the public key for a specific generation, current or
    /// superseded. Used to verify tokens against the generation active at
    /// issuance time.
    pub fn public_key_for(
        &self,
        identity_id: &IdentityId,
        generation: u32,
    ) -> KsResult<PublicKey> {
        let loaded = self
            .loaded
            .get(identity_id.as_str())
            .ok_or_else(|| KeystoreError::NotFound(identity_id.to_string()))?;
        if loaded.identity.rotation_generation == generation {
            return Ok(loaded.identity.public_key.clone());
        }
        loaded
            .identity
            .superseded
            .iter()
            .find(|s| s.generation == generation)
            .map(|s| s.public_key.clone())
            .ok_or(KeystoreError::UnknownGeneration {
                identity_id: identity_id.to_string(),
                generation,
            })
    }

    /// Fetch the public identity record.
    pub fn identity(&self, identity_id: &IdentityId) -> KsResult<&Identity> {
        self.loaded
            .get(identity_id.as_str())
            .map(|l| &l.identity)
            .ok_or_else(|| KeystoreError::NotFound(identity_id.to_string()))
    }

    /// Ids of every stored identity.
    pub fn identity_ids(&self) -> Vec<IdentityId> {
        self.loaded
            .values()
            .map(|l| l.identity.identity_id.clone())
            .collect()
    }

    /// Produce a self-signed attestation for an identity's current
    /// generation.
    pub fn create_attestation(&self, identity_id: &IdentityId) -> KsResult<IdentityAttestation> {
        if self.is_locked() {
            return Err(KeystoreError::Locked);
        }
        let loaded = self
            .loaded
            .get(identity_id.as_str())
            .ok_or_else(|| KeystoreError::NotFound(identity_id.to_string()))?;
        let identity = &loaded.identity;
        let mut attestation = IdentityAttestation {
            identity_id: identity.identity_id.clone(),
            generation: identity.rotation_generation,
            public_key: identity.public_key.clone(),
            fingerprint: identity.public_key.fingerprint(),
            creation_time: identity.creation_time,
            attested_at: Utc::now(),
            // placeholder, replaced below
            signature: Signature::from_bytes(&[0u8; 64]),
        };
        let bytes = attestation.signing_bytes()?;
        let key = loaded
            .keys
            .get(&identity.rotation_generation)
            .ok_or(KeystoreError::UnknownGeneration {
                identity_id: identity_id.to_string(),
                generation: identity.rotation_generation,
            })?;
        attestation.signature = key.sign(&bytes);
        Ok(attestation)
    }
}
