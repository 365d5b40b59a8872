//! Cryptographic primitives for the sovereign core.
//!
//! Uses Ed25519 with a context string for domain separation: every signature
//! covers `sovereign-core-v1 || message`, so a signature produced here can
//! never verify in another protocol (and vice versa).
//!
//! Private keys are wrapped in `Secret` for guaranteed zeroization on drop
//! and a redacted `Debug`. At-rest encryption of private keys uses
//! ChaCha20-Poly1305 under a device-bound wrapping key supplied by the shell
//! at initialization; the wrapping key itself never persists.

use crate::error::{Error, KeystoreError, Result};
use crate::SIGNATURE_CONTEXT;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey as Ed25519SigningKey, Verifier, VerifyingKey,
};
use pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{CloneableSecret, ExposeSecret, Secret, Zeroize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A signing key backing one generation of an identity.
#[derive(Clone)]
pub struct SigningKey {
    signing_key: Secret<Ed25519SigningKeyWrapper>,
}

// Wrapper so Secret<T> gets Zeroize + Clone. ed25519-dalek 2.x SigningKey
// already zeroizes on Drop, so the Zeroize impl is a no-op.
struct Ed25519SigningKeyWrapper(Ed25519SigningKey);

impl Clone for Ed25519SigningKeyWrapper {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Zeroize for Ed25519SigningKeyWrapper {
    fn zeroize(&mut self) {}
}

impl CloneableSecret for Ed25519SigningKeyWrapper {}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("signing_key", &"***SECRET***")
            .finish()
    }
}

impl SigningKey {
    /// Generate a new random signing key.
    ///
    /// Fails with `KeystoreError::EntropyUnavailable` if the platform RNG
    /// cannot be sourced, rather than panicking inside the engine.
    pub fn generate() -> std::result::Result<Self, KeystoreError> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| KeystoreError::EntropyUnavailable(e.to_string()))?;
        let key = Self::from_bytes(&seed);
        seed.zeroize();
        Ok(key)
    }

    /// Create a signing key from secret key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = Ed25519SigningKey::from_bytes(bytes);
        Self {
            signing_key: Secret::new(Ed25519SigningKeyWrapper(signing_key)),
        }
    }

    /// Get the public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.expose_secret().0.verifying_key(),
        }
    }

    /// Sign a message. The signed bytes are `SIGNATURE_CONTEXT || message`.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let prefixed = Self::prefix_message(message);
        let sig = self.signing_key.expose_secret().0.sign(&prefixed);
        Signature { inner: sig }
    }

    /// Get the secret key bytes.
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.expose_secret().0.to_bytes()
    }

    /// Prefix a message with the context string for domain separation.
    pub(crate) fn prefix_message(message: &[u8]) -> Vec<u8> {
        let mut prefixed = Vec::with_capacity(SIGNATURE_CONTEXT.len() + message.len());
        prefixed.extend_from_slice(SIGNATURE_CONTEXT);
        prefixed.extend_from_slice(message);
        prefixed
    }

    /// Create a signing key from a PKCS#8 PEM string.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let signing_key = Ed25519SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| Error::Serialization(format!("invalid private key PEM: {}", e)))?;
        Ok(Self {
            signing_key: Secret::new(Ed25519SigningKeyWrapper(signing_key)),
        })
    }

    /// Export as a PKCS#8 PEM string.
    pub fn to_pem(&self) -> Result<String> {
        self.signing_key
            .expose_secret()
            .0
            .to_pkcs8_pem(LineEnding::LF)
            .map(|s| s.to_string())
            .map_err(|e| Error::Serialization(format!("private key PEM encode: {}", e)))
    }
}

/// A public key for verifying signatures from one identity generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    verifying_key: VerifyingKey,
}

impl PublicKey {
    /// Create a public key from bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes)
            .map_err(|e| Error::Serialization(format!("invalid public key: {}", e)))?;
        Ok(Self { verifying_key })
    }

    /// Get the public key as bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Full SHA-256 fingerprint of the public key, hex-encoded.
    ///
    /// This is the identity fingerprint recorded in audit events.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.to_bytes());
        hex::encode(digest)
    }

    /// Short fingerprint (first 16 hex chars) for log lines.
    pub fn short_fingerprint(&self) -> String {
        let mut fp = self.fingerprint();
        fp.truncate(16);
        fp
    }

    /// Verify a signature against a message. Pure and side-effect free.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let prefixed = SigningKey::prefix_message(message);
        self.verifying_key.verify(&prefixed, &signature.inner).is_ok()
    }

    /// Create a public key from a SPKI PEM string.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let verifying_key = VerifyingKey::from_public_key_pem(pem)
            .map_err(|e| Error::Serialization(format!("invalid public key PEM: {}", e)))?;
        Ok(Self { verifying_key })
    }

    /// Export as a SPKI PEM string.
    pub fn to_pem(&self) -> Result<String> {
        self.verifying_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Serialization(format!("public key PEM encode: {}", e)))
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let bytes = self.to_bytes();
        if serializer.is_human_readable() {
            serializer.serialize_str(&base64::Engine::encode(
                &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                bytes,
            ))
        } else {
            serializer.serialize_bytes(&bytes)
        }
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, &s)
                .map_err(serde::de::Error::custom)?
        } else {
            serde_bytes::ByteBuf::deserialize(deserializer)?.into_vec()
        };
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("invalid public key length"))?;
        PublicKey::from_bytes(&arr).map_err(serde::de::Error::custom)
    }
}

/// An Ed25519 signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    inner: DalekSignature,
}

impl Signature {
    /// Create a signature from bytes.
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self {
            inner: DalekSignature::from_bytes(bytes),
        }
    }

    /// Get the signature as bytes.
    pub fn to_bytes(&self) -> [u8; 64] {
        self.inner.to_bytes()
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let bytes = self.to_bytes();
        if serializer.is_human_readable() {
            serializer.serialize_str(&base64::Engine::encode(
                &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                bytes,
            ))
        } else {
            serializer.serialize_bytes(&bytes)
        }
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, &s)
                .map_err(serde::de::Error::custom)?
        } else {
            serde_bytes::ByteBuf::deserialize(deserializer)?.into_vec()
        };
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("invalid signature length"))?;
        Ok(Signature::from_bytes(&arr))
    }
}

/// Size of a ChaCha20-Poly1305 nonce in bytes.
const WRAP_NONCE_LEN: usize = 12;

/// The device-bound key-wrapping key.
///
/// Seals private key material before it touches persistent storage. The
/// shell derives this from platform hardware-backed storage and hands it to
/// the engine at initialization; when the device is locked the shell
/// withholds it and the keystore reports `KeystoreError::Locked`.
#[derive(Clone)]
pub struct WrappingKey {
    key: Secret<WrappingKeyBytes>,
}

#[derive(Clone)]
struct WrappingKeyBytes([u8; 32]);

impl Zeroize for WrappingKeyBytes {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl CloneableSecret for WrappingKeyBytes {}

impl std::fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappingKey")
            .field("key", &"***SECRET***")
            .finish()
    }
}

impl WrappingKey {
    /// Wrap existing 32-byte key material.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: Secret::new(WrappingKeyBytes(bytes)),
        }
    }

    /// Generate a fresh wrapping key (primarily for tests and first-run
    /// provisioning; production keys come from the shell).
    pub fn generate() -> std::result::Result<Self, KeystoreError> {
        let mut bytes = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| KeystoreError::EntropyUnavailable(e.to_string()))?;
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key.expose_secret().0))
    }

    /// Seal plaintext into `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> std::result::Result<Vec<u8>, KeystoreError> {
        let mut nonce_bytes = [0u8; WRAP_NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| KeystoreError::EntropyUnavailable(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext)
            .map_err(|_| KeystoreError::StorageFailed("AEAD seal failed".into()))?;
        let mut out = Vec::with_capacity(WRAP_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a blob produced by [`seal`](Self::seal). Authentication failure
    /// is reported as a corrupt blob, never as partially decrypted data.
    pub fn open(&self, blob: &[u8], context: &str) -> std::result::Result<Vec<u8>, KeystoreError> {
        if blob.len() < WRAP_NONCE_LEN + 16 {
            return Err(KeystoreError::SealedBlobCorrupt(context.to_string()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(WRAP_NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher()
            .decrypt(nonce, ciphertext)
            .map_err(|_| KeystoreError::SealedBlobCorrupt(context.to_string()))
    }
}
