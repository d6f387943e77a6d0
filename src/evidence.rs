//! Content-Addressed Evidence Records
//!
//! Every input and decision in the pipeline is annotated with an immutable,
//! content-addressed evidence record so any later decision can be traced back
//! to its raw inputs. The durable blob backend is a collaborator behind
//! [`EvidenceStore`]; callers treat its unavailability as log-and-continue,
//! never as a failure of the operation being annotated.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::models::{Checkpoint, GameData, GameEvent};

/// Storage schema version embedded in every record. Increment on breaking changes.
pub const EVIDENCE_SCHEMA_VERSION: u32 = 1;

/// One provider's contribution inside a source bundle: raw payload plus the
/// normalized reading derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEvidence {
    pub source: String,
    pub raw: serde_json::Value,
    pub normalized: GameData,
    pub response_time_ms: u64,
}

/// Closed set of evidence record kinds, discriminated by a fixed `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvidencePayload {
    /// Full multi-source fetch bundle for one game.
    SourceBundle {
        game_id: String,
        fetched_at: DateTime<Utc>,
        sources: Vec<SourceEvidence>,
    },
    /// A detected game state change, wrapped in the monitor's fixed envelope.
    GameEvent {
        monitor_version: String,
        detected_at: DateTime<Utc>,
        event: GameEvent,
    },
    /// Monitoring progress marker.
    Checkpoint { checkpoint: Checkpoint },
    /// A promotion validation decision (success or terminal failure).
    Validation {
        validation_id: String,
        promotion_id: String,
        game_id: String,
        /// Hash of the consensus evidence this decision was based on, when one existed.
        consensus_evidence: Option<String>,
        is_valid: bool,
        confidence: f64,
        rationale: String,
        error: Option<String>,
    },
}

/// Stored record: payload plus schema version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub schema_version: u32,
    pub payload: EvidencePayload,
}

/// Compute the content address of a payload: sha256 over its canonical JSON.
///
/// Identical payloads always hash to the same address, which is what makes
/// the store write-once by construction.
pub fn content_hash(payload: &EvidencePayload) -> Result<String> {
    let bytes = serde_json::to_vec(payload).context("Failed to serialize evidence payload")?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Write-once, content-addressed evidence storage.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Persist a payload and return its content hash.
    async fn put_immutable(&self, payload: &EvidencePayload) -> Result<String>;

    /// Whether a record with this hash is present.
    async fn verify_stored(&self, hash: &str) -> Result<bool>;
}

/// In-memory evidence store used for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryEvidenceStore {
    records: RwLock<HashMap<String, EvidenceRecord>>,
}

impl InMemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn get(&self, hash: &str) -> Option<EvidenceRecord> {
        self.records.read().get(hash).cloned()
    }
}

#[async_trait]
impl EvidenceStore for InMemoryEvidenceStore {
    async fn put_immutable(&self, payload: &EvidencePayload) -> Result<String> {
        let hash = content_hash(payload)?;
        let mut records = self.records.write();
        // Same content hashes to the same address; re-puts are no-ops.
        records.entry(hash.clone()).or_insert_with(|| EvidenceRecord {
            schema_version: EVIDENCE_SCHEMA_VERSION,
            payload: payload.clone(),
        });
        Ok(hash)
    }

    async fn verify_stored(&self, hash: &str) -> Result<bool> {
        Ok(self.records.read().contains_key(hash))
    }
}
