//! Storage for background-analysis results.
//!
//! Synthesis records, the per-user synthesis run marker, the surfacing log
//! consulted by the cooldown limiter, and learned style preferences. Writers
//! replace whole rows; readers never observe a half-written record.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use uuid::Uuid;

use compass_core::error::CompassError;
use compass_core::types::{
    Confidence, Domain, StylePreferences, SynthesisRecord, Timestamp, UserId,
};

use crate::db::{storage_err, Database};
use crate::repository::parse_uuid;

/// When the synthesis cache was last rebuilt, and how many conversations
/// the user had at that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynthesisRun {
    pub computed_at: Timestamp,
    pub conversation_count: u32,
}

/// One row of the surfacing log.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfacingEntry {
    pub conversation_id: Uuid,
    pub theme: String,
    pub surfaced_at: Timestamp,
}

/// Repository for cross-domain synthesis records.
pub struct SynthesisRepository {
    db: Arc<Database>,
}

impl SynthesisRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Upsert a batch of freshly computed records and stamp the run.
    ///
    /// Surfacing bookkeeping (`last_surfaced_at`, `surface_count`) on
    /// existing rows is preserved. Runs in one transaction.
    pub fn store_run(
        &self,
        user: &UserId,
        records: &[SynthesisRecord],
        conversation_count: u32,
    ) -> Result<(), CompassError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(storage_err)?;
            for record in records {
                tx.execute(
                    "INSERT INTO synthesis_records
                        (user_id, theme, domains, confidence, evidence, surface_count, computed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
                     ON CONFLICT(user_id, theme) DO UPDATE SET
                        domains = excluded.domains,
                        confidence = excluded.confidence,
                        evidence = excluded.evidence,
                        computed_at = excluded.computed_at",
                    rusqlite::params![
                        user.as_str(),
                        record.theme,
                        serde_json::to_string(&record.domains)?,
                        record.confidence.0,
                        serde_json::to_string(&record.evidence)?,
                        record.computed_at.0,
                    ],
                )
                .map_err(|e| {
                    CompassError::Storage(format!("Failed to save synthesis record: {}", e))
                })?;
            }
            tx.execute(
                "INSERT INTO synthesis_runs (user_id, computed_at, conversation_count)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                    computed_at = excluded.computed_at,
                    conversation_count = excluded.conversation_count",
                rusqlite::params![user.as_str(), Timestamp::now().0, conversation_count],
            )
            .map_err(storage_err)?;
            tx.commit().map_err(storage_err)?;
            Ok(())
        })
    }

    pub fn last_run(&self, user: &UserId) -> Result<Option<SynthesisRun>, CompassError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT computed_at, conversation_count FROM synthesis_runs WHERE user_id = ?1",
                rusqlite::params![user.as_str()],
                |row| {
                    Ok(SynthesisRun {
                        computed_at: Timestamp(row.get(0)?),
                        conversation_count: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(storage_err)
        })
    }

    /// All records for the user, highest confidence first.
    pub fn list(&self, user: &UserId) -> Result<Vec<SynthesisRecord>, CompassError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT user_id, theme, domains, confidence, evidence,
                            last_surfaced_at, surface_count, computed_at
                     FROM synthesis_records WHERE user_id = ?1
                     ORDER BY confidence DESC, theme ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![user.as_str()], |row| {
                    Ok(row_to_record(row))
                })
                .map_err(storage_err)?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(storage_err)??);
            }
            Ok(records)
        })
    }

    /// Log that `theme` was surfaced in `conversation_id` and bump the
    /// record's surfacing counters, atomically.
    pub fn mark_surfaced(
        &self,
        user: &UserId,
        conversation_id: Uuid,
        theme: &str,
    ) -> Result<(), CompassError> {
        self.db.with_conn(|conn| {
            let now = Timestamp::now().0;
            let tx = conn.unchecked_transaction().map_err(storage_err)?;
            tx.execute(
                "INSERT INTO surfacing_log (user_id, conversation_id, theme, surfaced_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![user.as_str(), conversation_id.to_string(), theme, now],
            )
            .map_err(storage_err)?;
            tx.execute(
                "UPDATE synthesis_records
                 SET last_surfaced_at = ?1, surface_count = surface_count + 1
                 WHERE user_id = ?2 AND theme = ?3",
                rusqlite::params![now, user.as_str(), theme],
            )
            .map_err(storage_err)?;
            tx.commit().map_err(storage_err)?;
            Ok(())
        })
    }

    /// Surfacing log entries for the given conversations.
    pub fn surfacing_history(
        &self,
        user: &UserId,
        conversations: &[Uuid],
    ) -> Result<Vec<SurfacingEntry>, CompassError> {
        if conversations.is_empty() {
            return Ok(Vec::new());
        }
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT conversation_id, theme, surfaced_at FROM surfacing_log
                     WHERE user_id = ?1 ORDER BY id DESC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![user.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(storage_err)?;

            let mut entries = Vec::new();
            for row in rows {
                let (conversation_id, theme, surfaced_at) = row.map_err(storage_err)?;
                let conversation_id = parse_uuid(&conversation_id)?;
                if conversations.contains(&conversation_id) {
                    entries.push(SurfacingEntry {
                        conversation_id,
                        theme,
                        surfaced_at: Timestamp(surfaced_at),
                    });
                }
            }
            Ok(entries)
        })
    }
}

/// Repository for learned style preferences.
pub struct StyleRepository {
    db: Arc<Database>,
}

impl StyleRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(&self, user: &UserId) -> Result<Option<StylePreferences>, CompassError> {
        self.db.with_conn(|conn| {
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM style_preferences WHERE user_id = ?1",
                    rusqlite::params![user.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            match data {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    /// Replace the stored preferences with a new snapshot.
    pub fn upsert(&self, user: &UserId, prefs: &StylePreferences) -> Result<(), CompassError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO style_preferences (user_id, data, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET data = excluded.data,
                                                    updated_at = excluded.updated_at",
                rusqlite::params![
                    user.as_str(),
                    serde_json::to_string(prefs)?,
                    prefs.analyzed_at.0
                ],
            )
            .map_err(|e| CompassError::Storage(format!("Failed to save style: {}", e)))?;
            Ok(())
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<SynthesisRecord, CompassError> {
    let user_id: String = row.get(0).map_err(storage_err)?;
    let theme: String = row.get(1).map_err(storage_err)?;
    let domains: String = row.get(2).map_err(storage_err)?;
    let confidence: f64 = row.get(3).map_err(storage_err)?;
    let evidence: String = row.get(4).map_err(storage_err)?;
    let last_surfaced_at: Option<i64> = row.get(5).map_err(storage_err)?;
    let surface_count: u32 = row.get(6).map_err(storage_err)?;
    let computed_at: i64 = row.get(7).map_err(storage_err)?;

    let domains: Vec<Domain> = serde_json::from_str(&domains)?;
    let evidence: Vec<String> = serde_json::from_str(&evidence)?;

    Ok(SynthesisRecord {
        user_id: UserId(user_id),
        theme,
        domains,
        confidence: Confidence::new(confidence),
        evidence,
        last_surfaced_at: last_surfaced_at.map(Timestamp),
        surface_count,
        computed_at: Timestamp(computed_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use compass_core::types::{Tone, Verbosity};

    fn make_db() -> Arc<Database> {
        Arc::new(Database::in_memory().unwrap())
    }

    fn user() -> UserId {
        UserId::new("user-1")
    }

    fn record(theme: &str, confidence: f64) -> SynthesisRecord {
        SynthesisRecord {
            user_id: user(),
            theme: theme.to_string(),
            domains: vec![Domain::Career, Domain::Family],
            confidence: Confidence::new(confidence),
            evidence: vec!["stayed quiet in the review".to_string()],
            last_surfaced_at: None,
            surface_count: 0,
            computed_at: Timestamp::now(),
        }
    }

    #[test]
    fn test_store_run_and_list() {
        let repo = SynthesisRepository::new(make_db());
        assert!(repo.last_run(&user()).unwrap().is_none());

        repo.store_run(
            &user(),
            &[record("perfectionism", 0.7), record("avoiding conflict", 0.9)],
            4,
        )
        .unwrap();

        let records = repo.list(&user()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].theme, "avoiding conflict");
        assert_eq!(records[0].domains, vec![Domain::Career, Domain::Family]);
        assert_eq!(repo.last_run(&user()).unwrap().unwrap().conversation_count, 4);
    }

    #[test]
    fn test_refresh_preserves_surfacing_counters() {
        let repo = SynthesisRepository::new(make_db());
        let conv = Uuid::new_v4();
        repo.store_run(&user(), &[record("avoiding conflict", 0.9)], 3)
            .unwrap();
        repo.mark_surfaced(&user(), conv, "avoiding conflict").unwrap();

        repo.store_run(&user(), &[record("avoiding conflict", 0.95)], 6)
            .unwrap();

        let stored = &repo.list(&user()).unwrap()[0];
        assert_eq!(stored.surface_count, 1);
        assert!(stored.last_surfaced_at.is_some());
        assert!((stored.confidence.0 - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_surfacing_history_filters_conversations() {
        let repo = SynthesisRepository::new(make_db());
        let (old, recent) = (Uuid::new_v4(), Uuid::new_v4());
        repo.mark_surfaced(&user(), old, "perfectionism").unwrap();
        repo.mark_surfaced(&user(), recent, "avoiding conflict").unwrap();

        let history = repo.surfacing_history(&user(), &[recent]).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].theme, "avoiding conflict");
        assert!(repo.surfacing_history(&user(), &[]).unwrap().is_empty());
    }

    #[test]
    fn test_style_upsert_replaces_snapshot() {
        let repo = StyleRepository::new(make_db());
        assert!(repo.get(&user()).unwrap().is_none());

        let mut prefs = StylePreferences {
            verbosity: Verbosity::Brief,
            tone: Tone::Direct,
            prefers_questions: false,
            analyzed_at_sessions: 5,
            analyzed_at: Timestamp::now(),
        };
        repo.upsert(&user(), &prefs).unwrap();
        prefs.verbosity = Verbosity::Detailed;
        prefs.analyzed_at_sessions = 10;
        repo.upsert(&user(), &prefs).unwrap();

        assert_eq!(repo.get(&user()).unwrap().unwrap(), prefs);
    }
}
