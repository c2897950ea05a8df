//! Snapshot store with two interchangeable backends (§4.M).
//!
//! The SQL backend is grounded on the original Python implementation's sqlite3
//! tables (two tables, card-keyed, JSON-serialized nested fields); the JSON
//! backend follows the same "one file per card, serde_json" shape the rest of the
//! core uses for simple file-backed storage. Both sit behind one `PersistenceBackend`
//! trait so callers can swap backends without touching the Orchestrator.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no persisted state for card {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    Completed,
    Failed,
    Paused,
}

impl PipelineStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Running | Self::Failed | Self::Paused)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStateRecord {
    pub card_id: String,
    pub status: PipelineStatus,
    pub current_stage: Option<String>,
    pub stages_completed: Vec<String>,
    pub stage_results: Value,
    pub developer_results: Value,
    pub metrics: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCheckpoint {
    pub card_id: String,
    pub stage_name: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Value,
    pub error: Option<String>,
}

pub trait PersistenceBackend: Send + Sync {
    fn save_pipeline_state(&self, state: &PipelineStateRecord) -> PersistenceResult<()>;
    fn load_pipeline_state(&self, card_id: &str) -> PersistenceResult<Option<PipelineStateRecord>>;
    fn save_stage_checkpoint(&self, checkpoint: &StageCheckpoint) -> PersistenceResult<()>;
    fn load_stage_checkpoints(&self, card_id: &str) -> PersistenceResult<Vec<StageCheckpoint>>;
    fn get_resumable_pipelines(&self) -> PersistenceResult<Vec<String>>;
    fn cleanup_old_states(&self, days: i64) -> PersistenceResult<usize>;
}

pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    pub fn open(path: impl AsRef<Path>) -> PersistenceResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pipeline_states (
                card_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                current_stage TEXT,
                stages_completed TEXT NOT NULL,
                stage_results TEXT NOT NULL,
                developer_results TEXT NOT NULL,
                metrics TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT,
                error TEXT
            );
            CREATE TABLE IF NOT EXISTS stage_checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                card_id TEXT NOT NULL,
                stage_name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                result TEXT NOT NULL,
                error TEXT,
                UNIQUE(card_id, stage_name, started_at)
            );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> PersistenceResult<Self> {
        Self::open(":memory:")
    }
}

impl PersistenceBackend for SqlitePersistence {
    fn save_pipeline_state(&self, state: &PipelineStateRecord) -> PersistenceResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pipeline_states
                (card_id, status, current_stage, stages_completed, stage_results, developer_results, metrics, created_at, updated_at, completed_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(card_id) DO UPDATE SET
                status=excluded.status,
                current_stage=excluded.current_stage,
                stages_completed=excluded.stages_completed,
                stage_results=excluded.stage_results,
                developer_results=excluded.developer_results,
                metrics=excluded.metrics,
                updated_at=excluded.updated_at,
                completed_at=excluded.completed_at,
                error=excluded.error",
            params![
                state.card_id,
                state.status.as_str(),
                state.current_stage,
                serde_json::to_string(&state.stages_completed)?,
                state.stage_results.to_string(),
                state.developer_results.to_string(),
                state.metrics.to_string(),
                state.created_at.to_rfc3339(),
                state.updated_at.to_rfc3339(),
                state.completed_at.map(|t| t.to_rfc3339()),
                state.error,
            ],
        )?;
        Ok(())
    }

    fn load_pipeline_state(&self, card_id: &str) -> PersistenceResult<Option<PipelineStateRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT card_id, status, current_stage, stages_completed, stage_results, developer_results, metrics, created_at, updated_at, completed_at, error
             FROM pipeline_states WHERE card_id = ?1",
        )?;
        let mut rows = stmt.query(params![card_id])?;
        let Some(row) = rows.next()? else { return Ok(None) };

        let status_str: String = row.get(1)?;
        let stages_completed: String = row.get(3)?;
        let stage_results: String = row.get(4)?;
        let developer_results: String = row.get(5)?;
        let metrics: String = row.get(6)?;
        let created_at: String = row.get(7)?;
        let updated_at: String = row.get(8)?;
        let completed_at: Option<String> = row.get(9)?;

        Ok(Some(PipelineStateRecord {
            card_id: row.get(0)?,
            status: PipelineStatus::parse(&status_str).unwrap_or(PipelineStatus::Failed),
            current_stage: row.get(2)?,
            stages_completed: serde_json::from_str(&stages_completed)?,
            stage_results: serde_json::from_str(&stage_results)?,
            developer_results: serde_json::from_str(&developer_results)?,
            metrics: serde_json::from_str(&metrics)?,
            created_at: DateTime::parse_from_rfc3339(&created_at).unwrap().with_timezone(&Utc),
            updated_at: DateTime::parse_from_rfc3339(&updated_at).unwrap().with_timezone(&Utc),
            completed_at: completed_at.map(|s| DateTime::parse_from_rfc3339(&s).unwrap().with_timezone(&Utc)),
            error: row.get(10)?,
        }))
    }

    fn save_stage_checkpoint(&self, checkpoint: &StageCheckpoint) -> PersistenceResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO stage_checkpoints (card_id, stage_name, status, started_at, completed_at, result, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(card_id, stage_name, started_at) DO UPDATE SET
                status=excluded.status,
                completed_at=excluded.completed_at,
                result=excluded.result,
                error=excluded.error",
            params![
                checkpoint.card_id,
                checkpoint.stage_name,
                checkpoint.status,
                checkpoint.started_at.to_rfc3339(),
                checkpoint.completed_at.map(|t| t.to_rfc3339()),
                checkpoint.result.to_string(),
                checkpoint.error,
            ],
        )?;
        Ok(())
    }

    fn load_stage_checkpoints(&self, card_id: &str) -> PersistenceResult<Vec<StageCheckpoint>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT card_id, stage_name, status, started_at, completed_at, result, error
             FROM stage_checkpoints WHERE card_id = ?1 ORDER BY started_at ASC",
        )?;
        let rows = stmt.query_map(params![card_id], |row| {
            let started_at: String = row.get(3)?;
            let completed_at: Option<String> = row.get(4)?;
            let result: String = row.get(5)?;
            Ok(StageCheckpoint {
                card_id: row.get(0)?,
                stage_name: row.get(1)?,
                status: row.get(2)?,
                started_at: DateTime::parse_from_rfc3339(&started_at).unwrap().with_timezone(&Utc),
                completed_at: completed_at.map(|s| DateTime::parse_from_rfc3339(&s).unwrap().with_timezone(&Utc)),
                result: serde_json::from_str(&result).unwrap_or(Value::Null),
                error: row.get(6)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(PersistenceError::from)
    }

    fn get_resumable_pipelines(&self) -> PersistenceResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT card_id FROM pipeline_states WHERE status IN ('running', 'failed', 'paused')",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(PersistenceError::from)
    }

    fn cleanup_old_states(&self, days: i64) -> PersistenceResult<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM pipeline_states WHERE updated_at < ?1", params![cutoff])?;
        Ok(n)
    }
}

pub struct JsonPersistence {
    dir: PathBuf,
}

impl JsonPersistence {
    pub fn open(dir: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn state_path(&self, card_id: &str) -> PathBuf {
        self.dir.join(format!("{card_id}_state.json"))
    }

    fn checkpoints_path(&self, card_id: &str) -> PathBuf {
        self.dir.join(format!("{card_id}_checkpoints.json"))
    }
}

impl PersistenceBackend for JsonPersistence {
    fn save_pipeline_state(&self, state: &PipelineStateRecord) -> PersistenceResult<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        fs::write(self.state_path(&state.card_id), bytes)?;
        Ok(())
    }

    fn load_pipeline_state(&self, card_id: &str) -> PersistenceResult<Option<PipelineStateRecord>> {
        let path = self.state_path(card_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn save_stage_checkpoint(&self, checkpoint: &StageCheckpoint) -> PersistenceResult<()> {
        let path = self.checkpoints_path(&checkpoint.card_id);
        let mut existing: Vec<StageCheckpoint> = if path.exists() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            Vec::new()
        };

        if let Some(slot) = existing
            .iter_mut()
            .find(|c| c.stage_name == checkpoint.stage_name && c.started_at == checkpoint.started_at)
        {
            *slot = checkpoint.clone();
        } else {
            existing.push(checkpoint.clone());
        }

        fs::write(path, serde_json::to_vec_pretty(&existing)?)?;
        Ok(())
    }

    fn load_stage_checkpoints(&self, card_id: &str) -> PersistenceResult<Vec<StageCheckpoint>> {
        let path = self.checkpoints_path(card_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    fn get_resumable_pipelines(&self) -> PersistenceResult<Vec<String>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(card_id) = name.strip_suffix("_state.json") else { continue };
            if let Some(state) = self.load_pipeline_state(card_id)? {
                if state.status.is_resumable() {
                    out.push(card_id.to_string());
                }
            }
        }
        Ok(out)
    }

    fn cleanup_old_states(&self, days: i64) -> PersistenceResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(card_id) = name.strip_suffix("_state.json") else { continue };
            if let Some(state) = self.load_pipeline_state(card_id)? {
                if state.updated_at < cutoff {
                    fs::remove_file(self.state_path(card_id))?;
                    let checkpoints = self.checkpoints_path(card_id);
                    if checkpoints.exists() {
                        fs::remove_file(checkpoints)?;
                    }
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

pub struct PersistenceStore {
    backend: Box<dyn PersistenceBackend>,
}

impl PersistenceStore {
    pub fn new(backend: Box<dyn PersistenceBackend>) -> Self {
        Self { backend }
    }

    pub fn save_pipeline_state(&self, state: &PipelineStateRecord) -> PersistenceResult<()> {
        self.backend.save_pipeline_state(state)
    }

    pub fn load_pipeline_state(&self, card_id: &str) -> PersistenceResult<Option<PipelineStateRecord>> {
        self.backend.load_pipeline_state(card_id)
    }

    pub fn save_stage_checkpoint(&self, checkpoint: &StageCheckpoint) -> PersistenceResult<()> {
        self.backend.save_stage_checkpoint(checkpoint)
    }

    pub fn load_stage_checkpoints(&self, card_id: &str) -> PersistenceResult<Vec<StageCheckpoint>> {
        self.backend.load_stage_checkpoints(card_id)
    }

    pub fn get_resumable_pipelines(&self) -> PersistenceResult<Vec<String>> {
        self.backend.get_resumable_pipelines()
    }

    pub fn cleanup_old_states(&self, days: i64) -> PersistenceResult<usize> {
        self.backend.cleanup_old_states(days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state(card_id: &str, status: PipelineStatus) -> PipelineStateRecord {
        let now = Utc::now();
        PipelineStateRecord {
            card_id: card_id.to_string(),
            status,
            current_stage: Some("development".to_string()),
            stages_completed: vec!["project_analysis".to_string()],
            stage_results: serde_json::json!({}),
            developer_results: serde_json::json!({}),
            metrics: serde_json::json!({}),
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }

    #[test]
    fn sqlite_round_trip_preserves_snapshot_fields() {
        let store = PersistenceStore::new(Box::new(SqlitePersistence::open_in_memory().unwrap()));
        let state = sample_state("card-1", PipelineStatus::Running);
        store.save_pipeline_state(&state).unwrap();
        let loaded = store.load_pipeline_state("card-1").unwrap().unwrap();
        assert_eq!(loaded.card_id, state.card_id);
        assert_eq!(loaded.stages_completed, state.stages_completed);
    }

    #[test]
    fn sqlite_checkpoint_with_same_started_at_replaces_not_duplicates() {
        let store = PersistenceStore::new(Box::new(SqlitePersistence::open_in_memory().unwrap()));
        let started_at = Utc::now();
        let mut checkpoint = StageCheckpoint {
            card_id: "card-1".to_string(),
            stage_name: "development".to_string(),
            status: "running".to_string(),
            started_at,
            completed_at: None,
            result: Value::Null,
            error: None,
        };
        store.save_stage_checkpoint(&checkpoint).unwrap();
        checkpoint.status = "completed".to_string();
        checkpoint.completed_at = Some(Utc::now());
        store.save_stage_checkpoint(&checkpoint).unwrap();

        let checkpoints = store.load_stage_checkpoints("card-1").unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].status, "completed");
    }

    #[test]
    fn sqlite_resumable_pipelines_exclude_completed() {
        let store = PersistenceStore::new(Box::new(SqlitePersistence::open_in_memory().unwrap()));
        store.save_pipeline_state(&sample_state("card-1", PipelineStatus::Running)).unwrap();
        store.save_pipeline_state(&sample_state("card-2", PipelineStatus::Completed)).unwrap();
        store.save_pipeline_state(&sample_state("card-3", PipelineStatus::Paused)).unwrap();

        let mut resumable = store.get_resumable_pipelines().unwrap();
        resumable.sort();
        assert_eq!(resumable, vec!["card-1".to_string(), "card-3".to_string()]);
    }

    #[test]
    fn json_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(Box::new(JsonPersistence::open(dir.path()).unwrap()));
        let state = sample_state("card-1", PipelineStatus::Failed);
        store.save_pipeline_state(&state).unwrap();
        let loaded = store.load_pipeline_state("card-1").unwrap().unwrap();
        assert_eq!(loaded.status, PipelineStatus::Failed);

        let resumable = store.get_resumable_pipelines().unwrap();
        assert_eq!(resumable, vec!["card-1".to_string()]);
    }

    #[test]
    fn load_missing_card_returns_none() {
        let store = PersistenceStore::new(Box::new(SqlitePersistence::open_in_memory().unwrap()));
        assert!(store.load_pipeline_state("does-not-exist").unwrap().is_none());
    }
}
