//! SQLite-backed state store for incidents, analyses and analyst feedback.
//!
//! Every operation opens its own connection and runs inside a single
//! transaction: open, act, commit (or roll back on drop), close. Nothing is
//! held open between calls, so a slow model call can never keep a write
//! transaction alive. Failures are logged here and returned to the caller,
//! which decides whether to retry next cycle or abort.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::types::{
    AggregateStats, Analysis, Feedback, FeedbackStats, Incident, IncidentStatus, NewAnalysis,
    NewFeedback, PurgeCounts, RelevanceScore, RetrievedFeedback,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS incidents (
    incident_id  TEXT PRIMARY KEY,
    file_name    TEXT,
    file_path    TEXT,
    file_type    TEXT,
    file_size    INTEGER,
    user_email   TEXT,
    vendor_data  TEXT NOT NULL DEFAULT '{}',
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS analysis (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    incident_id      TEXT NOT NULL REFERENCES incidents (incident_id),
    verdict          TEXT NOT NULL,
    confidence       REAL NOT NULL,
    reasoning        TEXT NOT NULL,
    raw_response     TEXT NOT NULL,
    processing_time  REAL NOT NULL,
    created_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS feedback (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    incident_id        TEXT NOT NULL REFERENCES incidents (incident_id),
    analysis_id        INTEGER NOT NULL REFERENCES analysis (id),
    original_verdict   TEXT NOT NULL,
    corrected_verdict  TEXT NOT NULL,
    analyst_comment    TEXT NOT NULL,
    relevance_score    REAL NOT NULL,
    created_at         TEXT NOT NULL
);
";

const INDEXES: &str = "
CREATE INDEX IF NOT EXISTS idx_incidents_status_created ON incidents (status, created_at);
CREATE INDEX IF NOT EXISTS idx_analysis_incident_created ON analysis (incident_id, created_at);
CREATE INDEX IF NOT EXISTS idx_feedback_rank ON feedback (relevance_score DESC, created_at DESC);
";

const INCIDENT_COLUMNS: &str = "incident_id, file_name, file_path, file_type, file_size, \
     user_email, vendor_data, status, created_at";

const ANALYSIS_COLUMNS: &str =
    "id, incident_id, verdict, confidence, reasoning, raw_response, processing_time, created_at";

/// Durable record of incidents, their analyses and analyst feedback.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Open (creating if needed) the database file and bring its schema up to date.
    ///
    /// This is the one store failure that is fatal to the process.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Open {
                path: path.clone(),
                message: format!("cannot create directory {}: {e}", parent.display()),
            })?;
        }

        let store = Self { path };
        let mut conn = store.connect().map_err(|e| StoreError::Open {
            path: store.path.clone(),
            message: e.to_string(),
        })?;
        init_schema(&mut conn).map_err(|e| StoreError::Open {
            path: store.path.clone(),
            message: format!("schema initialization failed: {e}"),
        })?;
        info!(path = %store.path.display(), "State store ready");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// Run `f` inside one transaction on a fresh connection.
    fn transact<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let result = self.connect().and_then(|mut conn| {
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        });
        result.map_err(|e| {
            let err = match e {
                rusqlite::Error::FromSqlConversionFailure(..) => StoreError::Corrupt {
                    message: format!("{operation}: {e}"),
                },
                other => StoreError::persistence(operation, other),
            };
            error!(operation, error = %err, "Store operation failed");
            err
        })
    }

    /// Run blocking store work on the blocking thread pool.
    pub async fn run_blocking<F, T>(self: &Arc<Self>, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&StateStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::TaskJoin {
                message: e.to_string(),
            })?
    }

    // --- Incidents ---

    /// Insert an incident. Returns `false` (without error) when the id already exists.
    pub fn put_incident(&self, incident: &Incident) -> Result<bool, StoreError> {
        let vendor_data = serde_json::to_string(&incident.vendor_data)
            .map_err(|e| StoreError::persistence("put_incident", e))?;
        let inserted = self.transact("put_incident", |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO incidents (
                    incident_id, file_name, file_path, file_type, file_size,
                    user_email, vendor_data, status, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    incident.incident_id,
                    incident.file_name,
                    incident
                        .file_path
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned()),
                    incident.file_type,
                    incident.file_size.map(|s| s as i64),
                    incident.user_email,
                    vendor_data,
                    incident.status.as_str(),
                    format_timestamp(&incident.created_at),
                ],
            )?;
            Ok(changed == 1)
        })?;

        if inserted {
            info!(incident_id = %incident.incident_id, "Incident stored");
        } else {
            warn!(incident_id = %incident.incident_id, "Duplicate incident ignored");
        }
        Ok(inserted)
    }

    pub fn get_incident(&self, incident_id: &str) -> Result<Option<Incident>, StoreError> {
        self.transact("get_incident", |conn| {
            conn.query_row(
                &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE incident_id = ?1"),
                params![incident_id],
                incident_from_row,
            )
            .optional()
        })
    }

    /// All incidents, newest first, optionally restricted to one status.
    pub fn list_incidents(
        &self,
        status: Option<IncidentStatus>,
    ) -> Result<Vec<Incident>, StoreError> {
        self.transact("list_incidents", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INCIDENT_COLUMNS} FROM incidents
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC, incident_id DESC"
            ))?;
            let rows = stmt.query_map(params![status.map(|s| s.as_str())], incident_from_row)?;
            rows.collect()
        })
    }

    /// Pending incidents created at or after `since`, oldest first.
    pub fn pending_incidents(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Incident>, StoreError> {
        self.transact("pending_incidents", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INCIDENT_COLUMNS} FROM incidents
                 WHERE status = 'pending' AND created_at >= ?1
                 ORDER BY created_at ASC, incident_id ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(
                params![format_timestamp(&since), limit as i64],
                incident_from_row,
            )?;
            rows.collect()
        })
    }

    pub fn count_pending(&self) -> Result<u64, StoreError> {
        self.transact("count_pending", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM incidents WHERE status = 'pending'",
                [],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|n| n as u64)
    }

    /// Returns `false` when no incident has that id.
    pub fn set_incident_status(
        &self,
        incident_id: &str,
        status: IncidentStatus,
    ) -> Result<bool, StoreError> {
        let updated = self.transact("set_incident_status", |conn| {
            conn.execute(
                "UPDATE incidents SET status = ?1 WHERE incident_id = ?2",
                params![status.as_str(), incident_id],
            )
        })?;
        debug!(incident_id, status = %status, updated, "Incident status updated");
        Ok(updated == 1)
    }

    /// Analysed incidents that no analyst has reviewed yet, newest first.
    pub fn analyzed_without_feedback(&self, limit: usize) -> Result<Vec<Incident>, StoreError> {
        self.transact("analyzed_without_feedback", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INCIDENT_COLUMNS} FROM incidents i
                 WHERE i.status = 'analyzed'
                   AND NOT EXISTS (SELECT 1 FROM feedback f WHERE f.incident_id = i.incident_id)
                 ORDER BY i.created_at DESC
                 LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit as i64], incident_from_row)?;
            rows.collect()
        })
    }

    // --- Analyses ---

    pub fn put_analysis(&self, analysis: &NewAnalysis) -> Result<i64, StoreError> {
        let id = self.transact("put_analysis", |conn| {
            conn.execute(
                "INSERT INTO analysis (
                    incident_id, verdict, confidence, reasoning,
                    raw_response, processing_time, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    analysis.incident_id,
                    analysis.verdict.as_str(),
                    analysis.confidence,
                    analysis.reasoning,
                    analysis.raw_response,
                    analysis.processing_time_secs,
                    format_timestamp(&analysis.created_at),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        info!(analysis_id = id, incident_id = %analysis.incident_id, "Analysis stored");
        Ok(id)
    }

    pub fn get_analysis(&self, analysis_id: i64) -> Result<Option<Analysis>, StoreError> {
        self.transact("get_analysis", |conn| {
            conn.query_row(
                &format!("SELECT {ANALYSIS_COLUMNS} FROM analysis WHERE id = ?1"),
                params![analysis_id],
                analysis_from_row,
            )
            .optional()
        })
    }

    /// Most recent analysis of an incident by creation time.
    pub fn latest_analysis(&self, incident_id: &str) -> Result<Option<Analysis>, StoreError> {
        self.transact("latest_analysis", |conn| {
            conn.query_row(
                &format!(
                    "SELECT {ANALYSIS_COLUMNS} FROM analysis
                     WHERE incident_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1"
                ),
                params![incident_id],
                analysis_from_row,
            )
            .optional()
        })
    }

    // --- Feedback ---

    /// Store one analyst review and return its id.
    pub fn put_feedback(&self, feedback: &NewFeedback) -> Result<i64, StoreError> {
        let id = self.transact("put_feedback", |conn| insert_feedback(conn, feedback))?;
        info!(feedback_id = id, incident_id = %feedback.incident_id, "Feedback stored");
        Ok(id)
    }

    /// Store an analyst review and move its incident to `status` in one
    /// transaction. Nothing is written if either step fails.
    pub fn record_feedback(
        &self,
        feedback: &NewFeedback,
        status: IncidentStatus,
    ) -> Result<i64, StoreError> {
        let id = self.transact("record_feedback", |conn| {
            let id = insert_feedback(conn, feedback)?;
            let updated = conn.execute(
                "UPDATE incidents SET status = ?1 WHERE incident_id = ?2",
                params![status.as_str(), feedback.incident_id],
            )?;
            if updated != 1 {
                return Err(rusqlite::Error::QueryReturnedNoRows);
            }
            Ok(id)
        })?;
        info!(
            feedback_id = id,
            incident_id = %feedback.incident_id,
            status = %status,
            "Feedback stored"
        );
        Ok(id)
    }

    /// Feedback ranked by relevance, then recency, joined with the incident's
    /// file identity and the reasoning of the analysis it reviewed.
    pub fn feedback_for_retrieval(
        &self,
        limit: usize,
    ) -> Result<Vec<RetrievedFeedback>, StoreError> {
        self.transact("feedback_for_retrieval", |conn| {
            let mut stmt = conn.prepare(
                "SELECT f.id, f.incident_id, f.analysis_id, f.original_verdict,
                        f.corrected_verdict, f.analyst_comment, f.relevance_score, f.created_at,
                        i.file_name, i.file_type, a.reasoning
                 FROM feedback f
                 JOIN incidents i ON f.incident_id = i.incident_id
                 LEFT JOIN analysis a ON f.analysis_id = a.id
                 ORDER BY f.relevance_score DESC, f.created_at DESC, f.id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(RetrievedFeedback {
                    feedback: feedback_from_row(row)?,
                    file_name: row.get(8)?,
                    file_type: row.get(9)?,
                    original_reasoning: row.get(10)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Operator view of recorded feedback, in retrieval order.
    pub fn feedback_history(&self, limit: usize) -> Result<Vec<RetrievedFeedback>, StoreError> {
        self.feedback_for_retrieval(limit)
    }

    pub fn feedback_stats(&self) -> Result<FeedbackStats, StoreError> {
        self.transact("feedback_stats", |conn| {
            conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN original_verdict != corrected_verdict THEN 1 ELSE 0 END), 0)
                 FROM feedback",
                [],
                |row| {
                    Ok(FeedbackStats {
                        total_feedback: row.get::<_, i64>(0)? as u64,
                        corrections: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
        })
    }

    // --- Aggregates & retention ---

    pub fn aggregate_stats(&self) -> Result<AggregateStats, StoreError> {
        self.transact("aggregate_stats", |conn| {
            let mut stats = AggregateStats::default();

            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM incidents GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                stats.incidents_by_status.insert(status, count as u64);
            }

            stats.total_analyses =
                conn.query_row("SELECT COUNT(*) FROM analysis", [], |row| row.get::<_, i64>(0))?
                    as u64;

            let (total, matching, mean_relevance) = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN original_verdict = corrected_verdict THEN 1 ELSE 0 END), 0),
                        COALESCE(AVG(relevance_score), 0.0)
                 FROM feedback",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                },
            )?;
            stats.total_feedback = total as u64;
            stats.accuracy = if total > 0 {
                matching as f64 / total as f64
            } else {
                0.0
            };
            stats.mean_relevance = mean_relevance;
            Ok(stats)
        })
    }

    /// Delete everything created more than `age` ago.
    ///
    /// Feedback goes first, then analyses, then incidents. Rows that would be
    /// left pointing at a purged parent are removed with it.
    pub fn purge_older_than(&self, age: chrono::Duration) -> Result<PurgeCounts, StoreError> {
        let cutoff = format_timestamp(&(Utc::now() - age));
        let counts = self.transact("purge_older_than", |conn| {
            let feedback = conn.execute(
                "DELETE FROM feedback
                 WHERE created_at < ?1
                    OR incident_id IN (SELECT incident_id FROM incidents WHERE created_at < ?1)
                    OR analysis_id IN (
                        SELECT id FROM analysis
                        WHERE created_at < ?1
                           OR incident_id IN (SELECT incident_id FROM incidents WHERE created_at < ?1)
                    )",
                params![cutoff],
            )?;
            let analyses = conn.execute(
                "DELETE FROM analysis
                 WHERE created_at < ?1
                    OR incident_id IN (SELECT incident_id FROM incidents WHERE created_at < ?1)",
                params![cutoff],
            )?;
            let incidents = conn.execute(
                "DELETE FROM incidents WHERE created_at < ?1",
                params![cutoff],
            )?;
            Ok(PurgeCounts {
                incidents,
                analyses,
                feedback,
            })
        })?;
        info!(cutoff = %cutoff, purged = %counts, "Retention purge finished");
        Ok(counts)
    }
}

fn insert_feedback(conn: &Connection, feedback: &NewFeedback) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO feedback (
            incident_id, analysis_id, original_verdict, corrected_verdict,
            analyst_comment, relevance_score, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            feedback.incident_id,
            feedback.analysis_id,
            feedback.original_verdict.as_str(),
            feedback.corrected_verdict.as_str(),
            feedback.analyst_comment,
            feedback.relevance_score.value(),
            format_timestamp(&feedback.created_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn init_schema(conn: &mut Connection) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA)?;
    migrate_legacy_layout(&tx)?;
    tx.execute_batch(INDEXES)?;
    tx.commit()
}

/// Bring a database written by the earlier tool up to the current layout.
///
/// That layout kept the vendor blob in `cyberhaven_data`, prefixed the
/// analysis columns with `gemini_`, allowed NULL almost everywhere and
/// stored `CURRENT_TIMESTAMP` text. Every step is a no-op on a current
/// database.
fn migrate_legacy_layout(conn: &Connection) -> rusqlite::Result<()> {
    for (column, definition) in [
        ("file_name", "TEXT"),
        ("file_path", "TEXT"),
        ("file_type", "TEXT"),
        ("file_size", "INTEGER"),
        ("user_email", "TEXT"),
        ("status", "TEXT NOT NULL DEFAULT 'pending'"),
    ] {
        ensure_column(conn, "incidents", column, definition)?;
    }
    if ensure_column(conn, "incidents", "vendor_data", "TEXT NOT NULL DEFAULT '{}'")?
        && has_column(conn, "incidents", "cyberhaven_data")?
    {
        conn.execute(
            "UPDATE incidents SET vendor_data = cyberhaven_data WHERE cyberhaven_data IS NOT NULL",
            [],
        )?;
    }
    conn.execute(
        "UPDATE incidents SET status = 'pending' WHERE status IS NULL",
        [],
    )?;

    for (column, legacy, definition) in [
        ("verdict", "gemini_verdict", "TEXT"),
        ("confidence", "gemini_confidence", "REAL"),
        ("reasoning", "gemini_reasoning", "TEXT"),
        ("raw_response", "gemini_raw_response", "TEXT"),
    ] {
        if ensure_column(conn, "analysis", column, definition)?
            && has_column(conn, "analysis", legacy)?
        {
            conn.execute(
                &format!("UPDATE analysis SET {column} = {legacy}"),
                [],
            )?;
        }
    }
    conn.execute_batch(
        "UPDATE analysis SET
             verdict = COALESCE(verdict, 'REQUIRES_REVIEW'),
             confidence = COALESCE(confidence, 0.0),
             reasoning = COALESCE(reasoning, ''),
             raw_response = COALESCE(raw_response, ''),
             processing_time = COALESCE(processing_time, 0.0)
         WHERE verdict IS NULL OR confidence IS NULL OR reasoning IS NULL
            OR raw_response IS NULL OR processing_time IS NULL;
         UPDATE feedback SET
             analyst_comment = COALESCE(analyst_comment, ''),
             relevance_score = COALESCE(relevance_score, 1.0)
         WHERE analyst_comment IS NULL OR relevance_score IS NULL;",
    )?;

    for table in ["incidents", "analysis", "feedback"] {
        let rewritten = conn.execute(
            &format!(
                "UPDATE {table}
                 SET created_at = strftime('%Y-%m-%dT%H:%M:%f', created_at) || '000Z'
                 WHERE created_at LIKE '____-__-__ __:__:__%'
                   AND strftime('%Y-%m-%dT%H:%M:%f', created_at) IS NOT NULL"
            ),
            [],
        )?;
        if rewritten > 0 {
            info!(table, rows = rewritten, "Migrating schema: rewrote timestamps as RFC 3339");
        }
    }
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|name| name == column))
}

/// Add a column to tables created before it existed. Returns `true` when added.
fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> rusqlite::Result<bool> {
    if has_column(conn, table, column)? {
        return Ok(false);
    }
    info!(table, column, "Migrating schema: adding column");
    conn.execute_batch(&format!(
        "ALTER TABLE {table} ADD COLUMN {column} {definition}"
    ))?;
    Ok(true)
}

/// RFC 3339 UTC with fixed microsecond precision, so text order is time order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            // SQLite CURRENT_TIMESTAMP format
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::other(message)),
    )
}

fn timestamp_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| conversion_error(idx, format!("bad timestamp '{raw}'")))
}

fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    let vendor_raw: String = row.get(6)?;
    let vendor_data = match serde_json::from_str(&vendor_raw) {
        Ok(value) => value,
        Err(_) => serde_json::Value::String(vendor_raw),
    };
    Ok(Incident {
        incident_id: row.get(0)?,
        file_name: row.get(1)?,
        file_path: row.get::<_, Option<String>>(2)?.map(PathBuf::from),
        file_type: row.get(3)?,
        file_size: row.get::<_, Option<i64>>(4)?.map(|s| s.max(0) as u64),
        user_email: row.get(5)?,
        vendor_data,
        status: parsed_col(row, 7)?,
        created_at: timestamp_col(row, 8)?,
    })
}

fn analysis_from_row(row: &Row<'_>) -> rusqlite::Result<Analysis> {
    Ok(Analysis {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        verdict: parsed_col(row, 2)?,
        confidence: row.get(3)?,
        reasoning: row.get(4)?,
        raw_response: row.get(5)?,
        processing_time_secs: row.get(6)?,
        created_at: timestamp_col(row, 7)?,
    })
}

fn feedback_from_row(row: &Row<'_>) -> rusqlite::Result<Feedback> {
    let relevance: f64 = row.get(6)?;
    Ok(Feedback {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        analysis_id: row.get(2)?,
        original_verdict: parsed_col(row, 3)?,
        corrected_verdict: parsed_col(row, 4)?,
        analyst_comment: row.get(5)?,
        relevance_score: RelevanceScore::new(relevance)
            .ok_or_else(|| conversion_error(6, format!("relevance {relevance} out of range")))?,
        created_at: timestamp_col(row, 7)?,
    })
}
