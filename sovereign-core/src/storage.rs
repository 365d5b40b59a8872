//! Encrypted keystore file.
//!
//! A small sealed key-value store: each entry is an identity id mapped to a
//! ChaCha20-Poly1305-sealed blob (sealed by [`crate::crypto::WrappingKey`]
//! before it ever reaches this layer; this module never sees plaintext key
//! material). On-disk layout is a header frame followed by entry frames,
//! every frame a u32 big-endian length prefix and a CBOR body.
//!
//! Writes are atomic (temp file + rename) with a bounded retry on transient
//! contention.

use crate::error::KeystoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const STORE_MAGIC: &str = "SVRN-KEYSTORE";
const STORE_VERSION: u32 = 1;

const WRITE_ATTEMPTS: u32 = 3;
const WRITE_BACKOFF_MS: u64 = 10;

#[derive(Debug, Serialize, Deserialize)]
struct StoreHeader {
    magic: String,
    version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreEntry {
    key: String,
    #[serde(with = "serde_bytes")]
    sealed: Vec<u8>,
}

/// Persistent map of identity id to sealed blob.
#[derive(Debug)]
pub struct SecureStore {
    path: PathBuf,
    entries: BTreeMap<String, Vec<u8>>,
}

impl SecureStore {
    /// Open the store file, creating an empty one if absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KeystoreError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            let store = Self {
                path,
                entries: BTreeMap::new(),
            };
            store.persist()?;
            return Ok(store);
        }

        let mut raw = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut raw))
            .map_err(|e| KeystoreError::StorageFailed(format!("read {}: {}", path.display(), e)))?;

        let mut pos = 0usize;
        let header: StoreHeader = read_frame(&raw, &mut pos)?
            .ok_or_else(|| KeystoreError::StorageFailed("missing keystore header".into()))?;
        if header.magic != STORE_MAGIC || header.version != STORE_VERSION {
            return Err(KeystoreError::StorageFailed(format!(
                "unrecognized keystore header: {} v{}",
                header.magic, header.version
            )));
        }

        let mut entries = BTreeMap::new();
        while let Some(entry) = read_frame::<StoreEntry>(&raw, &mut pos)? {
            entries.insert(entry.key, entry.sealed);
        }
        Ok(Self { path, entries })
    }

    /// Store a sealed blob under a key and persist.
    pub fn put(&mut self, key: impl Into<String>, sealed: Vec<u8>) -> Result<(), KeystoreError> {
        self.entries.insert(key.into(), sealed);
        self.persist()
    }

    /// Fetch a sealed blob.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    /// Remove a blob and persist. Returns whether the key existed.
    pub fn remove(&mut self, key: &str) -> Result<bool, KeystoreError> {
        let existed = self.entries.remove(key).is_some();
        if existed {
            self.persist()?;
        }
        Ok(existed)
    }

    /// All stored keys, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    fn persist(&self) -> Result<(), KeystoreError> {
        let mut buf = Vec::new();
        write_frame(
            &mut buf,
            &StoreHeader {
                magic: STORE_MAGIC.into(),
                version: STORE_VERSION,
            },
        )?;
        for (key, sealed) in &self.entries {
            write_frame(
                &mut buf,
                &StoreEntry {
                    key: key.clone(),
                    sealed: sealed.clone(),
                },
            )?;
        }

        let tmp = self.path.with_extension("tmp");
        let mut last_err = None;
        for attempt in 0..WRITE_ATTEMPTS {
            let result = File::create(&tmp)
                .and_then(|mut f| {
                    f.write_all(&buf)?;
                    f.sync_all()
                })
                .and_then(|_| std::fs::rename(&tmp, &self.path));
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "keystore persist retry");
                    last_err = Some(e);
                    std::thread::sleep(std::time::Duration::from_millis(
                        WRITE_BACKOFF_MS * (attempt as u64 + 1),
                    ));
                }
            }
        }
        Err(KeystoreError::StorageFailed(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown I/O failure".into()),
        ))
    }
}

fn write_frame<T: Serialize>(buf: &mut Vec<u8>, value: &T) -> Result<(), KeystoreError> {
    let mut body = Vec::new();
    ciborium::ser::into_writer(value, &mut body)
        .map_err(|e| KeystoreError::StorageFailed(format!("frame encode: {}", e)))?;
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(())
}

fn read_frame<T: serde::de::DeserializeOwned>(
    data: &[u8],
    pos: &mut usize,
) -> Result<Option<T>, KeystoreError> {
    if *pos == data.len() {
        return Ok(None);
    }
    if data.len() - *pos < 4 {
        return Err(KeystoreError::StorageFailed("truncated frame length".into()));
    }
    let len = u32::from_be_bytes(data[*pos..*pos + 4].try_into().unwrap()) as usize;
    *pos += 4;
    if data.len() - *pos < len {
        return Err(KeystoreError::StorageFailed("truncated frame body".into()));
    }
    let value = ciborium::de::from_reader(&data[*pos..*pos + len])
        .map_err(|e| KeystoreError::StorageFailed(format!("frame decode: {}", e)))?;
    *pos += len;
    Ok(Some(value))
}
