//! Content-addressed Knowledge Store with text-similarity query (§4.B).
//!
//! Storage is grounded on `state::store::StateStore`'s RocksDB + bincode pattern
//! (column-family-style key prefixes, single `RwLock<DB>`); ranking uses a
//! keyword-containment / Jaccard-style scorer, the "degraded" mode §4.B explicitly
//! permits when no embedding backend is wired in, always tagged `confidence=LOW`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type KnowledgeStoreResult<T> = Result<T, KnowledgeStoreError>;

#[derive(Debug, Error)]
pub enum KnowledgeStoreError {
    #[error("rocksdb error: {0}")]
    Db(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("bincode encode error: {0}")]
    BincodeEncode(String),
    #[error("bincode decode error: {0}")]
    BincodeDecode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    ResearchReport,
    ArchitectureDecision,
    DeveloperSolution,
    ValidationResult,
    CodeReview,
    CodeReviewRetryFeedback,
    IssueResolution,
    LearnedSolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub card_id: String,
    pub title: String,
    pub content: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarArtifact {
    pub artifact_id: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub content: String,
    pub metadata: Value,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendations {
    pub based_on_history: Vec<String>,
    pub recommendations: Vec<String>,
    pub avoid: Vec<String>,
    pub confidence: Confidence,
    pub similar_tasks_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub total: usize,
    pub by_type: HashMap<String, usize>,
}

const CF_ARTIFACTS: &str = "artifacts";

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_string())
        .collect()
}

/// Jaccard similarity over lowercased alphanumeric tokens; 1.0 for identical text.
fn jaccard_similarity(a: &str, b: &str) -> f32 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

pub struct KnowledgeStore {
    db: RwLock<DB>,
}

pub type SharedKnowledgeStore = Arc<KnowledgeStore>;

impl KnowledgeStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> KnowledgeStoreResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cfs = vec![ColumnFamilyDescriptor::new(CF_ARTIFACTS, Options::default())];
        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(Self { db: RwLock::new(db) })
    }

    pub fn shared(self) -> SharedKnowledgeStore {
        Arc::new(self)
    }

    fn artifact_id(artifact_type: ArtifactType, card_id: &str) -> String {
        let ts = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let type_tag = serde_json::to_value(artifact_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        let digest = blake3::hash(format!("{type_tag}|{card_id}|{ts}").as_bytes());
        format!("{type_tag}-{card_id}-{}", &digest.to_hex()[..8])
    }

    /// Append-only store. Re-hashes on the (practically impossible) collision case.
    pub fn store(
        &self,
        artifact_type: ArtifactType,
        card_id: &str,
        title: &str,
        content: &str,
        metadata: Option<Value>,
    ) -> KnowledgeStoreResult<String> {
        let db = self.db.write().unwrap();
        let cf = db.cf_handle(CF_ARTIFACTS).expect("artifacts cf exists");

        let mut id = Self::artifact_id(artifact_type, card_id);
        while db.get_cf(cf, &id)?.is_some() {
            id = Self::artifact_id(artifact_type, card_id);
        }

        let artifact = Artifact {
            id: id.clone(),
            artifact_type,
            card_id: card_id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            metadata: metadata.unwrap_or(Value::Null),
            timestamp: Utc::now(),
        };
        let bytes = bincode::serialize(&artifact).map_err(|e| KnowledgeStoreError::BincodeEncode(e.to_string()))?;
        db.put_cf(cf, &id, bytes)?;
        Ok(id)
    }

    fn all_artifacts(&self) -> KnowledgeStoreResult<Vec<Artifact>> {
        let db = self.db.read().unwrap();
        let cf = db.cf_handle(CF_ARTIFACTS).expect("artifacts cf exists");
        let mut out = Vec::new();
        for item in db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_, value) = item?;
            let artifact: Artifact = bincode::deserialize(&value)
                .map_err(|e| KnowledgeStoreError::BincodeDecode(e.to_string()))?;
            out.push(artifact);
        }
        Ok(out)
    }

    pub fn query_similar(
        &self,
        query_text: &str,
        types: Option<&[ArtifactType]>,
        top_k: usize,
        filters: Option<&HashMap<String, Value>>,
    ) -> KnowledgeStoreResult<Vec<SimilarArtifact>> {
        let artifacts = self.all_artifacts()?;
        let mut scored: Vec<SimilarArtifact> = artifacts
            .into_iter()
            .filter(|a| types.map(|ts| ts.contains(&a.artifact_type)).unwrap_or(true))
            .filter(|a| {
                filters
                    .map(|f| {
                        f.iter().all(|(k, v)| {
                            a.metadata.get(k).map(|mv| mv == v).unwrap_or(false)
                        })
                    })
                    .unwrap_or(true)
            })
            .map(|a| SimilarArtifact {
                similarity: jaccard_similarity(query_text, &format!("{} {}", a.title, a.content)),
                artifact_id: a.id,
                artifact_type: a.artifact_type,
                content: a.content,
                metadata: a.metadata,
            })
            .collect();

        scored.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap());
        scored.truncate(top_k);
        Ok(scored)
    }

    /// Degraded keyword-containment recommendation mode: always `confidence=LOW`.
    pub fn get_recommendations(
        &self,
        task_description: &str,
        _context: Option<&Value>,
    ) -> KnowledgeStoreResult<Recommendations> {
        let similar = self.query_similar(
            task_description,
            Some(&[ArtifactType::LearnedSolution, ArtifactType::DeveloperSolution]),
            5,
            None,
        )?;

        let based_on_history: Vec<String> = similar.iter().map(|s| s.artifact_id.clone()).collect();
        let recommendations: Vec<String> = similar
            .iter()
            .filter(|s| s.similarity > 0.3)
            .map(|s| format!("Reuse approach from {}", s.artifact_id))
            .collect();
        let avoid: Vec<String> = similar
            .iter()
            .filter(|s| {
                s.metadata
                    .get("outcome")
                    .and_then(Value::as_str)
                    .map(|o| o == "failed")
                    .unwrap_or(false)
            })
            .map(|s| format!("Avoid repeating {}", s.artifact_id))
            .collect();

        Ok(Recommendations {
            similar_tasks_count: similar.len(),
            confidence: Confidence::Low,
            based_on_history,
            recommendations,
            avoid,
        })
    }

    pub fn extract_patterns(&self, pattern: &str, time_window_days: i64) -> KnowledgeStoreResult<Value> {
        let cutoff = Utc::now() - chrono::Duration::days(time_window_days);
        let matches: Vec<Artifact> = self
            .all_artifacts()?
            .into_iter()
            .filter(|a| a.timestamp >= cutoff)
            .filter(|a| a.content.to_lowercase().contains(&pattern.to_lowercase()))
            .collect();
        Ok(serde_json::json!({
            "pattern": pattern,
            "time_window_days": time_window_days,
            "matches": matches.len(),
            "artifact_ids": matches.iter().map(|a| a.id.clone()).collect::<Vec<_>>(),
        }))
    }

    pub fn stats(&self) -> KnowledgeStoreResult<Stats> {
        let artifacts = self.all_artifacts()?;
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for a in &artifacts {
            let key = serde_json::to_value(a.artifact_type)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            *by_type.entry(key).or_insert(0) += 1;
        }
        Ok(Stats {
            total: artifacts.len(),
            by_type,
        })
    }
}
