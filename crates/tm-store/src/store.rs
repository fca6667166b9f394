use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use tm_core::{MemoryModel, export_json, import_json};

use crate::error::{Result, StoreError};
use crate::schema;

/// Summary row for a named checkpoint. The record itself is not loaded.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointInfo {
    pub name: String,
    pub saved_at: String,
    pub steps: u64,
    pub bytes: usize,
}

/// Persisted transport session: the live memory vector and its counters.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionRecord {
    pub id: Uuid,
    /// Checkpoint this session was saved alongside, if any.
    pub checkpoint: Option<String>,
    pub memory: Vec<f64>,
    pub steps: u64,
    pub surprise_ema: f64,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        tracing::debug!(path = %path.display(), "opened store");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    // --- Checkpoints ---

    /// Store the model's full wire record under `name`, replacing any
    /// previous checkpoint of that name.
    pub fn save_checkpoint(&self, name: &str, model: &MemoryModel) -> Result<()> {
        let record = export_json(model)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO checkpoints (name, saved_at, steps, record)
             VALUES (?1, datetime('now'), ?2, ?3)",
            params![name, model.step_count() as i64, record],
        )?;
        tracing::info!(name, bytes = record.len(), "saved checkpoint");
        Ok(())
    }

    /// Load checkpoint `name` into `model`. Returns `false` when no such
    /// checkpoint exists; the model is untouched in that case.
    pub fn load_checkpoint(&self, name: &str, model: &mut MemoryModel) -> Result<bool> {
        let record: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM checkpoints WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;

        match record {
            Some(json) => {
                import_json(model, &json)?;
                tracing::info!(name, "loaded checkpoint");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, saved_at, steps, length(record) FROM checkpoints ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CheckpointInfo {
                    name: row.get(0)?,
                    saved_at: row.get(1)?,
                    steps: row.get::<_, i64>(2)? as u64,
                    bytes: row.get::<_, i64>(3)? as usize,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Returns `true` if a checkpoint was removed.
    pub fn delete_checkpoint(&self, name: &str) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE sessions SET checkpoint = NULL WHERE checkpoint = ?1",
            [name],
        )?;
        let removed = tx.execute("DELETE FROM checkpoints WHERE name = ?1", [name])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    // --- Sessions ---

    pub fn save_session(&self, session: &SessionRecord) -> Result<()> {
        let memory = serde_json::to_string(&session.memory)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO sessions (id, checkpoint, memory, steps, surprise_ema, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))",
            params![
                session.id.to_string(),
                session.checkpoint,
                memory,
                session.steps as i64,
                session.surprise_ema,
            ],
        )?;
        Ok(())
    }

    pub fn load_session(&self, id: Uuid) -> Result<Option<SessionRecord>> {
        self.query_session(
            "SELECT id, checkpoint, memory, steps, surprise_ema FROM sessions WHERE id = ?1",
            &id.to_string(),
        )
    }

    /// Most recently saved session linked to checkpoint `name`.
    pub fn latest_session_for(&self, name: &str) -> Result<Option<SessionRecord>> {
        self.query_session(
            "SELECT id, checkpoint, memory, steps, surprise_ema FROM sessions
             WHERE checkpoint = ?1 ORDER BY updated_at DESC, rowid DESC LIMIT 1",
            name,
        )
    }

    fn query_session(&self, sql: &str, key: &str) -> Result<Option<SessionRecord>> {
        let row = self
            .conn
            .query_row(sql, [key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, f64>(4)?,
                ))
            })
            .optional()?;

        let Some((id, checkpoint, memory, steps, surprise_ema)) = row else {
            return Ok(None);
        };
        Ok(Some(SessionRecord {
            id: parse_uuid(&id)?,
            checkpoint,
            memory: serde_json::from_str(&memory)?,
            steps: steps as u64,
            surprise_ema,
        }))
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::InvalidData(format!("invalid UUID '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use tm_core::{ModelConfig, ModelError};

    fn make_model(seed: u64) -> MemoryModel {
        let mut rng = SmallRng::seed_from_u64(seed);
        MemoryModel::new(ModelConfig::with_dims(3, 4, 2), &mut rng).unwrap()
    }

    fn session(checkpoint: Option<&str>, memory: Vec<f64>) -> SessionRecord {
        SessionRecord {
            id: Uuid::new_v4(),
            checkpoint: checkpoint.map(str::to_string),
            memory,
            steps: 7,
            surprise_ema: 0.125,
        }
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut original = make_model(1);
        original
            .train_step(&[0.1, 0.2, 0.3], &[0.3, 0.2, 0.1], &[0.5, -0.5])
            .unwrap();
        store.save_checkpoint("main", &original).unwrap();

        let mut loaded = make_model(2);
        assert!(store.load_checkpoint("main", &mut loaded).unwrap());
        assert_eq!(loaded.weights(), original.weights());
    }

    #[test]
    fn test_load_missing_checkpoint() {
        let store = Store::open_in_memory().unwrap();
        let mut model = make_model(1);
        let before = model.weights();
        assert!(!store.load_checkpoint("nope", &mut model).unwrap());
        assert_eq!(model.weights(), before);
    }

    #[test]
    fn test_checkpoint_shape_mismatch() {
        let store = Store::open_in_memory().unwrap();
        store.save_checkpoint("main", &make_model(1)).unwrap();

        let mut rng = SmallRng::seed_from_u64(3);
        let mut other = MemoryModel::new(ModelConfig::with_dims(3, 4, 5), &mut rng).unwrap();
        let err = store.load_checkpoint("main", &mut other).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Model(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_list_and_overwrite() {
        let store = Store::open_in_memory().unwrap();
        let mut model = make_model(1);
        store.save_checkpoint("b", &model).unwrap();
        store.save_checkpoint("a", &model).unwrap();
        model.train_step(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0], &[0.0, 0.0]).unwrap();
        store.save_checkpoint("a", &model).unwrap();

        let list = store.list_checkpoints().unwrap();
        let names: Vec<&str> = list.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(list[0].steps, 1);
        assert_eq!(list[1].steps, 0);
        assert!(list.iter().all(|c| c.bytes > 0 && !c.saved_at.is_empty()));
    }

    #[test]
    fn test_delete_checkpoint_unlinks_sessions() {
        let store = Store::open_in_memory().unwrap();
        store.save_checkpoint("main", &make_model(1)).unwrap();
        let s = session(Some("main"), vec![1.0, 2.0]);
        store.save_session(&s).unwrap();

        assert!(store.delete_checkpoint("main").unwrap());
        assert!(!store.delete_checkpoint("main").unwrap());
        assert!(store.list_checkpoints().unwrap().is_empty());
        assert_eq!(store.load_session(s.id).unwrap().unwrap().checkpoint, None);
    }

    #[test]
    fn test_session_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let s = session(None, vec![0.1, -0.2, 1.0 / 3.0]);
        store.save_session(&s).unwrap();
        assert_eq!(store.load_session(s.id).unwrap(), Some(s));
        assert_eq!(store.load_session(Uuid::new_v4()).unwrap(), None);
    }

    #[test]
    fn test_latest_session_for_checkpoint() {
        let store = Store::open_in_memory().unwrap();
        let first = session(Some("main"), vec![1.0, 1.0]);
        let second = session(Some("main"), vec![2.0, 2.0]);
        let unrelated = session(Some("other"), vec![3.0, 3.0]);
        store.save_session(&first).unwrap();
        store.save_session(&second).unwrap();
        store.save_session(&unrelated).unwrap();

        let latest = store.latest_session_for("main").unwrap().unwrap();
        assert_eq!(latest.memory, vec![2.0, 2.0]);
        assert_eq!(store.latest_session_for("missing").unwrap(), None);
    }

    #[test]
    fn test_corrupt_session_row() {
        let store = Store::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO sessions (id, memory) VALUES ('not-a-uuid', '[]')",
                [],
            )
            .unwrap();
        store
            .conn
            .execute(
                "UPDATE sessions SET checkpoint = 'main' WHERE id = 'not-a-uuid'",
                [],
            )
            .unwrap();
        let err = store.latest_session_for("main").unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
    }
}
