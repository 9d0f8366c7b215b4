use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};

/// A point-in-time snapshot of agent session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub agent_id:      String,
    pub session_id:    String,
    pub data:          Value,
    pub timestamp:     DateTime<Utc>,
}

impl Checkpoint {
    fn new(agent_id: &str, session_id: &str, data: Value) -> Self {
        Self {
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            agent_id:      agent_id.to_string(),
            session_id:    session_id.to_string(),
            data,
            timestamp:     Utc::now(),
        }
    }
}

/// Durable checkpoint storage for agent sessions.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Persist a snapshot; returns its checkpoint id.
    async fn save_checkpoint(
        &self,
        agent_id: &str,
        session_id: &str,
        data: Value,
    ) -> CoreResult<String>;

    /// Load a specific checkpoint, or the latest one when `checkpoint_id`
    /// is `None`.
    async fn load_checkpoint(
        &self,
        agent_id: &str,
        session_id: &str,
        checkpoint_id: Option<&str>,
    ) -> CoreResult<Option<Value>>;

    async fn list_checkpoints(&self, agent_id: &str, session_id: &str) -> CoreResult<Vec<String>>;
}

fn scope_key(agent_id: &str, session_id: &str) -> String {
    format!("{}:{}", agent_id, session_id)
}

/// In-memory store for tests and short-lived sessions.
pub struct MemoryCheckpointer {
    checkpoints: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self {
            checkpoints: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn save_checkpoint(
        &self,
        agent_id: &str,
        session_id: &str,
        data: Value,
    ) -> CoreResult<String> {
        let checkpoint = Checkpoint::new(agent_id, session_id, data);
        let id = checkpoint.checkpoint_id.clone();
        self.checkpoints
            .lock()
            .expect("checkpoint lock poisoned")
            .entry(scope_key(agent_id, session_id))
            .or_default()
            .push(checkpoint);
        Ok(id)
    }

    async fn load_checkpoint(
        &self,
        agent_id: &str,
        session_id: &str,
        checkpoint_id: Option<&str>,
    ) -> CoreResult<Option<Value>> {
        let checkpoints = self.checkpoints.lock().expect("checkpoint lock poisoned");
        let session = checkpoints.get(&scope_key(agent_id, session_id));
        Ok(match (session, checkpoint_id) {
            (Some(list), Some(id)) => list
                .iter()
                .find(|c| c.checkpoint_id == id)
                .map(|c| c.data.clone()),
            (Some(list), None) => list.last().map(|c| c.data.clone()),
            (None, _) => None,
        })
    }

    async fn list_checkpoints(&self, agent_id: &str, session_id: &str) -> CoreResult<Vec<String>> {
        let checkpoints = self.checkpoints.lock().expect("checkpoint lock poisoned");
        Ok(checkpoints
            .get(&scope_key(agent_id, session_id))
            .map(|list| list.iter().map(|c| c.checkpoint_id.clone()).collect())
            .unwrap_or_default())
    }
}

/// One JSON file per `(agent, session)` scope under a base directory.
pub struct FileCheckpointer {
    base_path: PathBuf,
}

impl FileCheckpointer {
    pub fn new(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let path = path.into();
        std::fs::create_dir_all(&path)
            .map_err(|e| CoreError::Execution(format!("cannot create checkpoint dir: {}", e)))?;
        Ok(Self { base_path: path })
    }

    fn scope_path(&self, agent_id: &str, session_id: &str) -> PathBuf {
        self.base_path
            .join(format!("{}_{}.json", agent_id, session_id))
    }

    fn read_scope(&self, agent_id: &str, session_id: &str) -> CoreResult<Vec<Checkpoint>> {
        let path = self.scope_path(agent_id, session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&path)
            .map_err(|e| CoreError::Execution(format!("cannot read checkpoints: {}", e)))?;
        serde_json::from_str(&data)
            .map_err(|e| CoreError::Execution(format!("corrupt checkpoint file: {}", e)))
    }

    fn write_scope(
        &self,
        agent_id: &str,
        session_id: &str,
        checkpoints: &[Checkpoint],
    ) -> CoreResult<()> {
        let data = serde_json::to_string_pretty(checkpoints)
            .map_err(|e| CoreError::Execution(format!("cannot serialize checkpoints: {}", e)))?;
        std::fs::write(self.scope_path(agent_id, session_id), data)
            .map_err(|e| CoreError::Execution(format!("cannot write checkpoints: {}", e)))
    }
}

#[async_trait]
impl Checkpointer for FileCheckpointer {
    async fn save_checkpoint(
        &self,
        agent_id: &str,
        session_id: &str,
        data: Value,
    ) -> CoreResult<String> {
        let mut checkpoints = self.read_scope(agent_id, session_id)?;
        let checkpoint = Checkpoint::new(agent_id, session_id, data);
        let id = checkpoint.checkpoint_id.clone();
        checkpoints.push(checkpoint);
        self.write_scope(agent_id, session_id, &checkpoints)?;
        Ok(id)
    }

    async fn load_checkpoint(
        &self,
        agent_id: &str,
        session_id: &str,
        checkpoint_id: Option<&str>,
    ) -> CoreResult<Option<Value>> {
        let checkpoints = self.read_scope(agent_id, session_id)?;
        Ok(match checkpoint_id {
            Some(id) => checkpoints
                .iter()
                .find(|c| c.checkpoint_id == id)
                .map(|c| c.data.clone()),
            None => checkpoints.last().map(|c| c.data.clone()),
        })
    }

    async fn list_checkpoints(&self, agent_id: &str, session_id: &str) -> CoreResult<Vec<String>> {
        Ok(self
            .read_scope(agent_id, session_id)?
            .iter()
            .map(|c| c.checkpoint_id.clone())
            .collect())
    }
}

/// SQLite-backed store. Connections are opened per call; checkpointing is
/// not on any hot path.
pub struct SqliteCheckpointer {
    path: PathBuf,
}

impl SqliteCheckpointer {
    pub fn new(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let path = path.into();
        let conn = rusqlite::Connection::open(&path)
            .map_err(|e| CoreError::Execution(format!("cannot open checkpoint db: {}", e)))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                checkpoint_id TEXT PRIMARY KEY,
                agent_id      TEXT NOT NULL,
                session_id    TEXT NOT NULL,
                data          TEXT NOT NULL,
                timestamp     TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| CoreError::Execution(format!("cannot create checkpoint table: {}", e)))?;
        Ok(Self { path })
    }

    fn connection(&self) -> CoreResult<rusqlite::Connection> {
        rusqlite::Connection::open(&self.path)
            .map_err(|e| CoreError::Execution(format!("cannot open checkpoint db: {}", e)))
    }
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    async fn save_checkpoint(
        &self,
        agent_id: &str,
        session_id: &str,
        data: Value,
    ) -> CoreResult<String> {
        let checkpoint = Checkpoint::new(agent_id, session_id, data);
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO checkpoints (checkpoint_id, agent_id, session_id, data, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                checkpoint.checkpoint_id,
                checkpoint.agent_id,
                checkpoint.session_id,
                checkpoint.data.to_string(),
                checkpoint.timestamp.to_rfc3339(),
            ],
        )
        .map_err(|e| CoreError::Execution(format!("cannot insert checkpoint: {}", e)))?;
        Ok(checkpoint.checkpoint_id)
    }

    async fn load_checkpoint(
        &self,
        agent_id: &str,
        session_id: &str,
        checkpoint_id: Option<&str>,
    ) -> CoreResult<Option<Value>> {
        let conn = self.connection()?;
        let (sql, params): (&str, Vec<&dyn rusqlite::ToSql>) = match checkpoint_id {
            Some(ref id) => (
                "SELECT data FROM checkpoints
                 WHERE agent_id = ?1 AND session_id = ?2 AND checkpoint_id = ?3",
                vec![&agent_id, &session_id, id],
            ),
            None => (
                "SELECT data FROM checkpoints
                 WHERE agent_id = ?1 AND session_id = ?2
                 ORDER BY timestamp DESC LIMIT 1",
                vec![&agent_id, &session_id],
            ),
        };

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| CoreError::Execution(format!("cannot prepare query: {}", e)))?;
        let mut rows = stmt
            .query(params.as_slice())
            .map_err(|e| CoreError::Execution(format!("cannot query checkpoints: {}", e)))?;

        match rows
            .next()
            .map_err(|e| CoreError::Execution(format!("cannot read checkpoint row: {}", e)))?
        {
            Some(row) => {
                let data: String = row
                    .get(0)
                    .map_err(|e| CoreError::Execution(format!("cannot read column: {}", e)))?;
                let value = serde_json::from_str(&data)
                    .map_err(|e| CoreError::Execution(format!("corrupt checkpoint data: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn list_checkpoints(&self, agent_id: &str, session_id: &str) -> CoreResult<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT checkpoint_id FROM checkpoints
                 WHERE agent_id = ?1 AND session_id = ?2 ORDER BY timestamp",
            )
            .map_err(|e| CoreError::Execution(format!("cannot prepare query: {}", e)))?;
        let ids = stmt
            .query_map(rusqlite::params![agent_id, session_id], |row| row.get(0))
            .map_err(|e| CoreError::Execution(format!("cannot query checkpoints: {}", e)))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| CoreError::Execution(format!("cannot read checkpoint ids: {}", e)))?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn exercise_store(store: &dyn Checkpointer) {
        let id1 = store
            .save_checkpoint("agent-1", "session-1", json!({"turn": 1}))
            .await
            .unwrap();
        let id2 = store
            .save_checkpoint("agent-1", "session-1", json!({"turn": 2}))
            .await
            .unwrap();

        // Latest wins without an explicit id.
        let latest = store
            .load_checkpoint("agent-1", "session-1", None)
            .await
            .unwrap();
        assert_eq!(latest, Some(json!({"turn": 2})));

        let first = store
            .load_checkpoint("agent-1", "session-1", Some(&id1))
            .await
            .unwrap();
        assert_eq!(first, Some(json!({"turn": 1})));

        let ids = store.list_checkpoints("agent-1", "session-1").await.unwrap();
        assert_eq!(ids, vec![id1, id2]);

        // Other scopes are empty.
        assert_eq!(
            store.load_checkpoint("agent-2", "session-1", None).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        exercise_store(&MemoryCheckpointer::new()).await;
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointer::new(dir.path()).unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn sqlite_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointer::new(dir.path().join("checkpoints.db")).unwrap();
        exercise_store(&store).await;
    }
}
