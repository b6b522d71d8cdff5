//! SQLite feedback store
//!
//! Four tables: training examples, new-product annotations, training session
//! history, and model backups. Appends dominate; the few mutations
//! (`mark_consumed`, approval, `is_active`) are transactional.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::error::{Error, Result};

use super::{
    ExampleFilter, FeedbackKind, FeedbackStats, ModelBackupRecord, NewAnnotation, NewBackupRecord,
    NewExample, NewProductAnnotation, NewSessionRecord, TrainingExample, TrainingSessionRecord,
};

// ============================================================================
// STORE
// ============================================================================

/// Durable log of labeled examples, annotations, sessions, and backups
pub struct FeedbackStore {
    conn: Mutex<Connection>,
}

impl FeedbackStore {
    /// Open (and initialize) the feedback database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        Self::init_schema(&conn)?;
        info!(path = %path.display(), "feedback store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS training_examples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                photo_fingerprint TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                username TEXT,
                feedback_kind TEXT NOT NULL,
                target_item_id TEXT,
                similarity_score REAL,
                user_comment TEXT,
                image_path TEXT,
                quality_rating INTEGER NOT NULL DEFAULT 5,
                created_at TEXT NOT NULL,
                consumed_by_session INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_examples_unconsumed
                ON training_examples(consumed_by_session)
                WHERE consumed_by_session IS NULL;

            CREATE TABLE IF NOT EXISTS new_product_annotations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                photo_fingerprint TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                username TEXT,
                product_name TEXT NOT NULL,
                product_category TEXT,
                product_description TEXT,
                image_path TEXT,
                created_at TEXT NOT NULL,
                admin_approved INTEGER NOT NULL DEFAULT 0,
                admin_id INTEGER,
                approval_date TEXT,
                added_to_catalog INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS model_training_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_version TEXT NOT NULL,
                examples_count INTEGER NOT NULL,
                positive_examples INTEGER NOT NULL,
                negative_examples INTEGER NOT NULL,
                accuracy_before REAL,
                accuracy_after REAL,
                duration_seconds INTEGER NOT NULL,
                hyperparameters TEXT NOT NULL,
                started_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                notes TEXT
            );

            CREATE TABLE IF NOT EXISTS model_backups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backup_version TEXT NOT NULL,
                source_version TEXT NOT NULL,
                path TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========================================================================
    // TRAINING EXAMPLES
    // ========================================================================

    /// Append a labeled example, returning its id
    pub fn add_example(&self, example: &NewExample) -> Result<i64> {
        let kind = example
            .feedback_kind
            .ok_or_else(|| Error::Internal("example without feedback kind".into()))?;
        if kind != FeedbackKind::NewItem && example.target_item_id.is_none() {
            return Err(Error::Internal(format!(
                "{kind} example requires a target item"
            )));
        }
        let conn = self.lock();
        conn.execute(
            "INSERT INTO training_examples
                 (photo_fingerprint, user_id, username, feedback_kind, target_item_id,
                  similarity_score, user_comment, image_path, quality_rating, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                example.photo_fingerprint,
                example.user_id,
                example.username,
                kind.as_str(),
                example.target_item_id,
                example.similarity_score,
                example.user_comment,
                example.image_path,
                example.quality_rating.unwrap_or(5).clamp(1, 5),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// List stored examples, oldest first (insertion order)
    pub fn list_examples(&self, filter: &ExampleFilter) -> Result<Vec<TrainingExample>> {
        let conn = self.lock();
        let mut sql = String::from(
            "SELECT id, photo_fingerprint, user_id, username, feedback_kind, target_item_id,
                    similarity_score, user_comment, image_path, quality_rating, created_at,
                    consumed_by_session
             FROM training_examples WHERE 1=1",
        );
        if filter.kind.is_some() {
            sql.push_str(" AND feedback_kind = ?1");
        }
        if filter.unconsumed_only {
            sql.push_str(" AND consumed_by_session IS NULL");
        }
        sql.push_str(" ORDER BY id");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let map = |row: &rusqlite::Row<'_>| Self::row_to_example(row);
        let mut out = Vec::new();
        match filter.kind {
            Some(kind) => {
                let rows = stmt.query_map(params![kind.as_str()], map)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let rows = stmt.query_map([], map)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Attribute examples to the session that trained on them
    ///
    /// Idempotent: rows already carrying a session id are left untouched, so
    /// a retried call cannot reassign history.
    pub fn mark_consumed(&self, ids: &[i64], session_id: i64) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE training_examples SET consumed_by_session = ?2
                 WHERE id = ?1 AND consumed_by_session IS NULL",
            )?;
            for id in ids {
                changed += stmt.execute(params![id, session_id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    // ========================================================================
    // NEW PRODUCT ANNOTATIONS
    // ========================================================================

    /// Append a new-product annotation, returning its id
    pub fn add_new_product(&self, annotation: &NewAnnotation) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO new_product_annotations
                 (photo_fingerprint, user_id, username, product_name, product_category,
                  product_description, image_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                annotation.photo_fingerprint,
                annotation.user_id,
                annotation.username,
                annotation.product_name,
                annotation.product_category,
                annotation.product_description,
                annotation.image_path,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Approve an annotation, making it training-eligible
    pub fn approve_new_product(&self, id: i64, admin_id: i64) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE new_product_annotations
             SET admin_approved = 1, admin_id = ?2, approval_date = ?3
             WHERE id = ?1",
            params![id, admin_id, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("annotation {id}")));
        }
        Ok(())
    }

    /// Annotations awaiting approval, oldest first
    pub fn pending_annotations(&self, limit: usize) -> Result<Vec<NewProductAnnotation>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, photo_fingerprint, user_id, username, product_name, product_category,
                    product_description, image_path, created_at, admin_approved, admin_id,
                    approval_date, added_to_catalog
             FROM new_product_annotations
             WHERE admin_approved = 0 ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_annotation)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ========================================================================
    // TRAINING SESSIONS
    // ========================================================================

    /// Record a training session; `is_active = true` atomically clears the
    /// flag on every other row
    pub fn log_training_session(&self, record: &NewSessionRecord) -> Result<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        if record.is_active {
            tx.execute("UPDATE model_training_history SET is_active = 0", [])?;
        }
        tx.execute(
            "INSERT INTO model_training_history
                 (model_version, examples_count, positive_examples, negative_examples,
                  accuracy_before, accuracy_after, duration_seconds, hyperparameters,
                  started_at, is_active, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.model_version,
                record.examples_count as i64,
                record.positive_examples as i64,
                record.negative_examples as i64,
                record.accuracy_before,
                record.accuracy_after,
                record.duration_seconds,
                record.hyperparameters.to_string(),
                Utc::now().to_rfc3339(),
                record.is_active,
                record.notes,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// The currently active session, if any
    pub fn active_session(&self) -> Result<Option<TrainingSessionRecord>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, model_version, examples_count, positive_examples, negative_examples,
                        accuracy_before, accuracy_after, duration_seconds, hyperparameters,
                        started_at, is_active, notes
                 FROM model_training_history WHERE is_active = 1",
                [],
                Self::row_to_session,
            )
            .optional()?;
        Ok(row)
    }

    /// All sessions, newest first
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<TrainingSessionRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, model_version, examples_count, positive_examples, negative_examples,
                    accuracy_before, accuracy_after, duration_seconds, hyperparameters,
                    started_at, is_active, notes
             FROM model_training_history ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_session)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ========================================================================
    // MODEL BACKUPS
    // ========================================================================

    /// Record a model backup
    pub fn log_model_backup(&self, record: &NewBackupRecord) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO model_backups
                 (backup_version, source_version, path, size_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.backup_version,
                record.source_version,
                record.path,
                record.size_bytes as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Recorded backups, newest first
    pub fn list_backups(&self) -> Result<Vec<ModelBackupRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, backup_version, source_version, path, size_bytes, created_at
             FROM model_backups ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ModelBackupRecord {
                id: row.get(0)?,
                backup_version: row.get(1)?,
                source_version: row.get(2)?,
                path: row.get(3)?,
                size_bytes: row.get::<_, i64>(4)? as u64,
                created_at: parse_ts(row.get::<_, String>(5)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ========================================================================
    // STATS
    // ========================================================================

    /// Aggregated counters for the admin surface and the retrain hint
    pub fn statistics(&self) -> Result<FeedbackStats> {
        let conn = self.lock();
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |r| r.get(0))?;
            Ok(n as usize)
        };
        let stats = FeedbackStats {
            total_examples: count("SELECT COUNT(*) FROM training_examples")?,
            correct: count(
                "SELECT COUNT(*) FROM training_examples WHERE feedback_kind = 'correct'",
            )?,
            incorrect: count(
                "SELECT COUNT(*) FROM training_examples WHERE feedback_kind = 'incorrect'",
            )?,
            new_item: count(
                "SELECT COUNT(*) FROM training_examples WHERE feedback_kind = 'new_item'",
            )?,
            unconsumed: count(
                "SELECT COUNT(*) FROM training_examples WHERE consumed_by_session IS NULL",
            )?,
            pending_annotations: count(
                "SELECT COUNT(*) FROM new_product_annotations WHERE admin_approved = 0",
            )?,
            active_session_version: conn
                .query_row(
                    "SELECT model_version FROM model_training_history WHERE is_active = 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?,
        };
        Ok(stats)
    }

    // ========================================================================
    // ROW MAPPERS
    // ========================================================================

    fn row_to_example(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrainingExample> {
        let kind: String = row.get(4)?;
        Ok(TrainingExample {
            id: row.get(0)?,
            photo_fingerprint: row.get(1)?,
            user_id: row.get(2)?,
            username: row.get(3)?,
            feedback_kind: FeedbackKind::parse(&kind).unwrap_or(FeedbackKind::Incorrect),
            target_item_id: row.get(5)?,
            similarity_score: row.get(6)?,
            user_comment: row.get(7)?,
            image_path: row.get(8)?,
            quality_rating: row.get::<_, i64>(9)? as u8,
            created_at: parse_ts(row.get::<_, String>(10)?),
            consumed_by_session: row.get(11)?,
        })
    }

    fn row_to_annotation(row: &rusqlite::Row<'_>) -> rusqlite::Result<NewProductAnnotation> {
        Ok(NewProductAnnotation {
            id: row.get(0)?,
            photo_fingerprint: row.get(1)?,
            user_id: row.get(2)?,
            username: row.get(3)?,
            product_name: row.get(4)?,
            product_category: row.get(5)?,
            product_description: row.get(6)?,
            image_path: row.get(7)?,
            created_at: parse_ts(row.get::<_, String>(8)?),
            admin_approved: row.get(9)?,
            admin_id: row.get(10)?,
            approval_date: row
                .get::<_, Option<String>>(11)?
                .map(parse_ts),
            added_to_catalog: row.get(12)?,
        })
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrainingSessionRecord> {
        let hyperparameters: String = row.get(8)?;
        Ok(TrainingSessionRecord {
            id: row.get(0)?,
            model_version: row.get(1)?,
            examples_count: row.get::<_, i64>(2)? as usize,
            positive_examples: row.get::<_, i64>(3)? as usize,
            negative_examples: row.get::<_, i64>(4)? as usize,
            accuracy_before: row.get(5)?,
            accuracy_after: row.get(6)?,
            duration_seconds: row.get(7)?,
            hyperparameters: serde_json::from_str(&hyperparameters)
                .unwrap_or(serde_json::Value::Null),
            started_at: parse_ts(row.get::<_, String>(9)?),
            is_active: row.get(10)?,
            notes: row.get(11)?,
        })
    }
}

fn parse_ts(raw: String) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// TESTS
// ============================================================================
