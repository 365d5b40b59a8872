//! Secure channel bridge: the only entry point reachable from the shell.
//!
//! The bridge serializes external requests into an internal queue consumed
//! by a dedicated engine thread; callers never touch component internals.
//! Every request carries a correlation id and a per-session monotonically
//! increasing sequence number. Duplicate or rewound sequence numbers inside
//! the session window are rejected with [`BridgeError::Replay`] before the
//! request reaches the engine.
//!
//! Every call has a bounded timeout. On timeout the caller gets
//! [`BridgeError::Timeout`]; if the operation already passed its
//! audit-write point the engine thread still completes it, but the result
//! is dropped and the caller must poll or re-request.

use crate::engine::TrustEngine;
use crate::error::{BridgeError, Error, Result};
use crate::ledger::AuditRecord;
use crate::policy::{Decision, EvaluationContext};
use crate::wire::{self, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Default per-request timeout enforced by the bridge.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Width of the anti-replay window in sequence numbers.
pub const REPLAY_WINDOW_SIZE: u64 = 64;

/// Operations the shell may invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BridgeOperation {
    CreateIdentity {
        label: String,
    },
    IssueToken {
        identity_id: String,
        subject: String,
        permissions: BTreeSet<String>,
        ttl_secs: u64,
    },
    RevokeToken {
        token_id: String,
        reason: String,
    },
    EvaluateAccess {
        subject: String,
        permissions: BTreeSet<String>,
        #[serde(with = "serde_bytes")]
        token_bytes: Vec<u8>,
        /// Device-state probe results for condition evaluation.
        device_state: BTreeMap<String, String>,
    },
    QueryAuditRange {
        from: u64,
        to: u64,
    },
}

/// A framed request from the shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRequest {
    /// Opaque id echoed back on the response.
    pub correlation_id: String,
    /// Monotonically increasing within the session.
    pub sequence: u64,
    pub operation: BridgeOperation,
}

impl BridgeRequest {
    /// Build a request with a fresh correlation id.
    pub fn new(sequence: u64, operation: BridgeOperation) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().simple().to_string(),
            sequence,
            operation,
        }
    }
}

/// Successful operation results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BridgeReply {
    IdentityHandle {
        identity_id: String,
        generation: u32,
        fingerprint: String,
    },
    TokenBytes(#[serde(with = "serde_bytes")] Vec<u8>),
    Ack,
    Decision(Decision),
    AuditRecords(Vec<AuditRecord>),
}

/// Structured error surfaced to the shell: the error family plus the
/// precise message. The shell never sees a raw crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeFault {
    pub family: String,
    pub message: String,
}

impl From<&Error> for BridgeFault {
    fn from(e: &Error) -> Self {
        let family = match e {
            Error::Keystore(_) => "keystore",
            Error::Token(_) => "token",
            Error::Policy(_) => "policy",
            Error::Ledger(_) => "ledger",
            Error::Bridge(_) => "bridge",
            Error::EngineLocked(_) => "locked",
            Error::Serialization(_) => "serialization",
        };
        Self {
            family: family.to_string(),
            message: e.to_string(),
        }
    }
}

/// A framed response to the shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub correlation_id: String,
    pub result: std::result::Result<BridgeReply, BridgeFault>,
}

/// Sliding anti-replay window over session sequence numbers.
///
/// Tracks a high-water mark plus a bitmap of the last
/// [`REPLAY_WINDOW_SIZE`] sequence numbers, so moderately out-of-order
/// delivery is tolerated while duplicates and anything older than the
/// window are rejected.
#[derive(Debug, Default)]
pub struct ReplayWindow {
    high_water: u64,
    bitmap: u64,
    seen_any: bool,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept or reject a sequence number, recording it if accepted.
    pub fn check(&mut self, sequence: u64) -> std::result::Result<(), BridgeError> {
        if !self.seen_any {
            self.seen_any = true;
            self.high_water = sequence;
            self.bitmap = 1;
            return Ok(());
        }
        if sequence > self.high_water {
            let shift = sequence - self.high_water;
            self.bitmap = if shift >= 64 { 0 } else { self.bitmap << shift };
            self.bitmap |= 1;
            self.high_water = sequence;
            return Ok(());
        }
        let age = self.high_water - sequence;
        if age >= REPLAY_WINDOW_SIZE {
            return Err(BridgeError::Replay(sequence));
        }
        let bit = 1u64 << age;
        if self.bitmap & bit != 0 {
            return Err(BridgeError::Replay(sequence));
        }
        self.bitmap |= bit;
        Ok(())
    }
}

type EngineJob = (BridgeRequest, mpsc::Sender<BridgeResponse>);

/// The bridge: request framing, replay protection, bounded timeouts, and
/// routing into the engine thread.
pub struct SecureChannelBridge {
    sender: Mutex<Option<mpsc::Sender<EngineJob>>>,
    window: Mutex<ReplayWindow>,
    timeout: Duration,
    worker: Mutex<Option<std::thread::JoinHandle<Result<()>>>>,
}

impl SecureChannelBridge {
    /// Take ownership of the engine and start the engine thread.
    pub fn start(engine: TrustEngine) -> Result<Self> {
        Self::start_with_timeout(engine, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn start_with_timeout(engine: TrustEngine, timeout: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<EngineJob>();
        let worker = std::thread::Builder::new()
            .name("sovereign-engine".into())
            .spawn(move || {
                while let Ok((request, reply_tx)) = rx.recv() {
                    let response = Self::dispatch(&engine, request);
                    // The caller may have timed out and gone; a dead
                    // receiver just means the result is dropped.
                    let _ = reply_tx.send(response);
                }
                engine.close()
            })
            .map_err(|e| Error::Bridge(BridgeError::WorkerUnavailable(e.to_string())))?;
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            window: Mutex::new(ReplayWindow::new()),
            timeout,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Submit a request and wait (bounded) for its response.
    pub fn call(&self, request: BridgeRequest) -> Result<BridgeResponse> {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check(request.sequence)
            .map_err(|e| {
                tracing::warn!(sequence = request.sequence, "rejected replayed sequence");
                Error::Bridge(e)
            })?;

        let correlation_id = request.correlation_id.clone();
        let (reply_tx, reply_rx) = mpsc::channel();
        {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            let sender = sender.as_ref().ok_or(Error::Bridge(BridgeError::ChannelClosed))?;
            sender
                .send((request, reply_tx))
                .map_err(|_| Error::Bridge(BridgeError::ChannelClosed))?;
        }
        reply_rx.recv_timeout(self.timeout).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "bridge request timed out; result will be dropped"
                );
                Error::Bridge(BridgeError::Timeout(self.timeout.as_millis() as u64))
            }
            mpsc::RecvTimeoutError::Disconnected => Error::Bridge(BridgeError::ChannelClosed),
        })
    }

    /// Submit an encoded frame and return the encoded response.
    pub fn call_frame(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let request = decode_request(frame)?;
        let response = self.call(request)?;
        encode_response(&response)
    }

    fn dispatch(engine: &TrustEngine, request: BridgeRequest) -> BridgeResponse {
        let correlation_id = request.correlation_id.clone();
        let result = Self::execute(engine, request.operation)
            .map_err(|e| BridgeFault::from(&e));
        BridgeResponse {
            correlation_id,
            result,
        }
    }

    fn execute(engine: &TrustEngine, operation: BridgeOperation) -> Result<BridgeReply> {
        match operation {
            BridgeOperation::CreateIdentity { label } => {
                let identity = engine.create_identity(&label)?;
                Ok(BridgeReply::IdentityHandle {
                    identity_id: identity.identity_id.to_string(),
                    generation: identity.rotation_generation,
                    fingerprint: identity.public_key.fingerprint(),
                })
            }
            BridgeOperation::IssueToken {
                identity_id,
                subject,
                permissions,
                ttl_secs,
            } => {
                let issuer = crate::keystore::IdentityId::from_string(identity_id)
                    .map_err(Error::Keystore)?;
                let token = engine.issue_token(
                    &issuer,
                    &subject,
                    permissions,
                    Duration::from_secs(ttl_secs),
                )?;
                Ok(BridgeReply::TokenBytes(wire::encode_token(&token)?))
            }
            BridgeOperation::RevokeToken { token_id, reason } => {
                engine.revoke_token(&token_id, &reason)?;
                Ok(BridgeReply::Ack)
            }
            BridgeOperation::EvaluateAccess {
                subject,
                permissions,
                token_bytes,
                device_state,
            } => {
                let token = wire::decode_token(&token_bytes)?;
                let mut ctx = EvaluationContext::at(chrono::Utc::now());
                ctx.device_state = device_state;
                let decision = engine.evaluate_access(&subject, &permissions, &token, &ctx)?;
                Ok(BridgeReply::Decision(decision))
            }
            BridgeOperation::QueryAuditRange { from, to } => {
                Ok(BridgeReply::AuditRecords(engine.query_audit_range(from, to)?))
            }
        }
    }

    /// Stop accepting requests, drain the queue, and tear the engine down.
    pub fn shutdown(&self) -> Result<()> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match worker {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::Bridge(BridgeError::ChannelClosed))?,
            None => Ok(()),
        }
    }
}

/// Decode a request frame (size-capped CBOR).
pub fn decode_request(frame: &[u8]) -> Result<BridgeRequest> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(Error::Bridge(BridgeError::BadFrame(format!(
            "frame size {} exceeds {}",
            frame.len(),
            MAX_FRAME_SIZE
        ))));
    }
    ciborium::de::from_reader(frame)
        .map_err(|e| Error::Bridge(BridgeError::BadFrame(e.to_string())))
}

/// Encode a request frame.
pub fn encode_request(request: &BridgeRequest) -> Result<Vec<u8>> {
    wire::to_vec(request)
}

/// Encode a response frame.
pub fn encode_response(response: &BridgeResponse) -> Result<Vec<u8>> {
    wire::to_vec(response)
}

/// Decode a response frame.
pub fn decode_response(frame: &[u8]) -> Result<BridgeResponse> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(Error::Bridge(BridgeError::BadFrame(format!(
            "frame size {} exceeds {}",
            frame.len(),
            MAX_FRAME_SIZE
        ))));
    }
    ciborium::de::from_reader(frame)
        .map_err(|e| Error::Bridge(BridgeError::BadFrame(e.to_string())))
}
