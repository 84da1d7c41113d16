//! Repositories for conversation data.
//!
//! ConversationRepository, TurnRepository, ProfileRepository,
//! MemoryRepository, and PatternRepository operate on the shared
//! Database using raw SQL.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use uuid::Uuid;

use compass_core::error::CompassError;
use compass_core::types::{ConversationTurn, Domain, Role, Timestamp, UserId, UserProfile};

use crate::db::{storage_err, Database};

/// Stored conversation header.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRow {
    pub id: Uuid,
    pub user_id: UserId,
    pub started_at: Timestamp,
    pub last_active_at: Timestamp,
    pub primary_domain: Option<Domain>,
    pub summary: Option<String>,
}

/// Repository for conversation headers.
pub struct ConversationRepository {
    db: Arc<Database>,
}

impl ConversationRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create the conversation on first use, otherwise bump its activity time.
    ///
    /// Returns `true` when the conversation was created by this call. A
    /// conversation owned by another user is reported as not found.
    pub fn touch(&self, user: &UserId, id: Uuid) -> Result<bool, CompassError> {
        self.db.with_conn(|conn| {
            let now = Timestamp::now().0;
            let owner: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM conversations WHERE id = ?1",
                    rusqlite::params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;

            match owner {
                Some(owner) if owner != user.as_str() => {
                    Err(CompassError::NotFound(format!("conversation {}", id)))
                }
                Some(_) => {
                    conn.execute(
                        "UPDATE conversations SET last_active_at = ?1 WHERE id = ?2",
                        rusqlite::params![now, id.to_string()],
                    )
                    .map_err(storage_err)?;
                    Ok(false)
                }
                None => {
                    conn.execute(
                        "INSERT INTO conversations (id, user_id, started_at, last_active_at)
                         VALUES (?1, ?2, ?3, ?3)",
                        rusqlite::params![id.to_string(), user.as_str(), now],
                    )
                    .map_err(|e| {
                        CompassError::Storage(format!("Failed to create conversation: {}", e))
                    })?;
                    Ok(true)
                }
            }
        })
    }

    /// Find a conversation by ID.
    pub fn find_by_id(&self, id: Uuid) -> Result<Option<ConversationRow>, CompassError> {
        self.db.with_conn(|conn| {
            let result = conn
                .query_row(
                    "SELECT id, user_id, started_at, last_active_at, primary_domain, summary
                     FROM conversations WHERE id = ?1",
                    rusqlite::params![id.to_string()],
                    |row| Ok(row_to_conversation(row)),
                )
                .optional()
                .map_err(storage_err)?;

            match result {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })
    }

    /// Number of conversations the user has had, including the current one.
    pub fn count_for_user(&self, user: &UserId) -> Result<u32, CompassError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM conversations WHERE user_id = ?1",
                    rusqlite::params![user.as_str()],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            Ok(count as u32)
        })
    }

    /// Conversations started strictly after `since`.
    pub fn count_started_after(
        &self,
        user: &UserId,
        since: Timestamp,
    ) -> Result<u32, CompassError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM conversations WHERE user_id = ?1 AND started_at > ?2",
                    rusqlite::params![user.as_str(), since.0],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            Ok(count as u32)
        })
    }

    /// Most recent conversation IDs for the user, newest first.
    pub fn recent_ids(&self, user: &UserId, limit: usize) -> Result<Vec<Uuid>, CompassError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM conversations WHERE user_id = ?1
                     ORDER BY rowid DESC LIMIT ?2",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![user.as_str(), limit as i64], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(storage_err)?;

            let mut ids = Vec::new();
            for row in rows {
                ids.push(parse_uuid(&row.map_err(storage_err)?)?);
            }
            Ok(ids)
        })
    }

    /// Summaries of the user's earlier conversations, newest first.
    pub fn recent_summaries(
        &self,
        user: &UserId,
        exclude: Uuid,
        limit: usize,
    ) -> Result<Vec<String>, CompassError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT summary FROM conversations
                     WHERE user_id = ?1 AND id != ?2 AND summary IS NOT NULL AND summary != ''
                     ORDER BY rowid DESC LIMIT ?3",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![user.as_str(), exclude.to_string(), limit as i64],
                    |row| row.get::<_, String>(0),
                )
                .map_err(storage_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
        })
    }

    pub fn set_summary(&self, id: Uuid, summary: &str) -> Result<(), CompassError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE conversations SET summary = ?1 WHERE id = ?2",
                rusqlite::params![summary, id.to_string()],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }

    /// How many of the user's conversations fall in each primary domain,
    /// most frequent first.
    pub fn domain_histogram(&self, user: &UserId) -> Result<Vec<(Domain, u32)>, CompassError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT primary_domain, COUNT(*) AS n FROM conversations
                     WHERE user_id = ?1 AND primary_domain IS NOT NULL
                     GROUP BY primary_domain ORDER BY n DESC, primary_domain ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![user.as_str()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
                })
                .map_err(storage_err)?;

            let mut histogram = Vec::new();
            for row in rows {
                let (domain, count) = row.map_err(storage_err)?;
                if let Some(domain) = Domain::parse(&domain) {
                    histogram.push((domain, count));
                }
            }
            Ok(histogram)
        })
    }

    /// Record the domain the conversation is mostly about. First write wins.
    pub fn set_primary_domain(&self, id: Uuid, domain: Domain) -> Result<(), CompassError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE conversations SET primary_domain = ?1
                 WHERE id = ?2 AND primary_domain IS NULL",
                rusqlite::params![domain.as_str(), id.to_string()],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }
}

/// Repository for conversation turns. Turns are append-only.
pub struct TurnRepository {
    db: Arc<Database>,
}

impl TurnRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn append(&self, user: &UserId, turn: &ConversationTurn) -> Result<(), CompassError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO turns (id, conversation_id, user_id, role, text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    turn.id.to_string(),
                    turn.conversation_id.to_string(),
                    user.as_str(),
                    turn.role.as_str(),
                    turn.text,
                    turn.created_at.0,
                ],
            )
            .map_err(|e| CompassError::Storage(format!("Failed to save turn: {}", e)))?;
            Ok(())
        })
    }

    /// All turns of a conversation in creation order.
    pub fn list(&self, conversation_id: Uuid) -> Result<Vec<ConversationTurn>, CompassError> {
        self.recent(conversation_id, usize::MAX)
    }

    /// The last `limit` turns of a conversation, in creation order.
    pub fn recent(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, CompassError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, conversation_id, role, text, created_at FROM (
                        SELECT rowid AS seq, id, conversation_id, role, text, created_at
                        FROM turns WHERE conversation_id = ?1
                        ORDER BY rowid DESC LIMIT ?2
                     ) ORDER BY seq ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id.to_string(), limit], |row| {
                    Ok(row_to_turn(row))
                })
                .map_err(storage_err)?;

            let mut turns = Vec::new();
            for row in rows {
                turns.push(row.map_err(storage_err)??);
            }
            Ok(turns)
        })
    }

    /// The most recent turn of a conversation.
    pub fn last(&self, conversation_id: Uuid) -> Result<Option<ConversationTurn>, CompassError> {
        Ok(self.recent(conversation_id, 1)?.pop())
    }

    /// The user's own messages across all conversations, newest first.
    pub fn user_texts(&self, user: &UserId, limit: usize) -> Result<Vec<String>, CompassError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT text FROM turns WHERE user_id = ?1 AND role = 'user'
                     ORDER BY rowid DESC LIMIT ?2",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![user.as_str(), limit as i64], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(storage_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
        })
    }
}

/// Repository for durable user profiles.
pub struct ProfileRepository {
    db: Arc<Database>,
}

impl ProfileRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(&self, user: &UserId) -> Result<Option<UserProfile>, CompassError> {
        self.db.with_conn(|conn| {
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM profiles WHERE user_id = ?1",
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

    /// Merge `update` into the stored profile and write the result as one row.
    ///
    /// Read and write happen under the same connection lock, so concurrent
    /// readers see either the old or the new snapshot.
    pub fn upsert_merge(
        &self,
        user: &UserId,
        update: UserProfile,
    ) -> Result<UserProfile, CompassError> {
        self.db.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT data FROM profiles WHERE user_id = ?1",
                    rusqlite::params![user.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;

            let mut profile: UserProfile = match existing {
                Some(json) => serde_json::from_str(&json)?,
                None => UserProfile::default(),
            };
            profile.merge(update);

            conn.execute(
                "INSERT INTO profiles (user_id, data, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET data = excluded.data,
                                                    updated_at = excluded.updated_at",
                rusqlite::params![
                    user.as_str(),
                    serde_json::to_string(&profile)?,
                    Timestamp::now().0
                ],
            )
            .map_err(|e| CompassError::Storage(format!("Failed to save profile: {}", e)))?;
            Ok(profile)
        })
    }
}

/// Repository for remembered details flagged with memory tags.
pub struct MemoryRepository {
    db: Arc<Database>,
}

impl MemoryRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn save(
        &self,
        user: &UserId,
        conversation_id: Uuid,
        payload: &str,
    ) -> Result<(), CompassError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO memories (id, user_id, conversation_id, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    user.as_str(),
                    conversation_id.to_string(),
                    payload,
                    Timestamp::now().0,
                ],
            )
            .map_err(|e| CompassError::Storage(format!("Failed to save memory: {}", e)))?;
            Ok(())
        })
    }

    /// Most recent memory payloads, newest first, without duplicates.
    pub fn recent(&self, user: &UserId, limit: usize) -> Result<Vec<String>, CompassError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT payload FROM memories WHERE user_id = ?1
                     GROUP BY payload ORDER BY MAX(rowid) DESC LIMIT ?2",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![user.as_str(), limit as i64], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(storage_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
        })
    }
}

/// A recurring theme the model flagged in one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternObservation {
    pub conversation_id: Uuid,
    pub theme: String,
    pub domain: Option<Domain>,
    pub created_at: Timestamp,
}

/// Repository for pattern observations.
pub struct PatternRepository {
    db: Arc<Database>,
}

impl PatternRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn record(
        &self,
        user: &UserId,
        conversation_id: Uuid,
        theme: &str,
        domain: Option<Domain>,
    ) -> Result<(), CompassError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pattern_observations (id, user_id, conversation_id, theme, domain, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    user.as_str(),
                    conversation_id.to_string(),
                    theme,
                    domain.map(|d| d.as_str()),
                    Timestamp::now().0,
                ],
            )
            .map_err(|e| CompassError::Storage(format!("Failed to save pattern: {}", e)))?;
            Ok(())
        })
    }

    /// Every observation for the user, oldest first.
    pub fn list_for_user(&self, user: &UserId) -> Result<Vec<PatternObservation>, CompassError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT conversation_id, theme, domain, created_at
                     FROM pattern_observations WHERE user_id = ?1 ORDER BY rowid ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![user.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .map_err(storage_err)?;

            let mut observations = Vec::new();
            for row in rows {
                let (conversation_id, theme, domain, created_at) = row.map_err(storage_err)?;
                observations.push(PatternObservation {
                    conversation_id: parse_uuid(&conversation_id)?,
                    theme,
                    domain: domain.as_deref().and_then(Domain::parse),
                    created_at: Timestamp(created_at),
                });
            }
            Ok(observations)
        })
    }
}

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid, CompassError> {
    Uuid::parse_str(value).map_err(|e| CompassError::Storage(format!("Invalid UUID: {}", e)))
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, CompassError> {
    let id: String = row.get(0).map_err(storage_err)?;
    let user_id: String = row.get(1).map_err(storage_err)?;
    let started_at: i64 = row.get(2).map_err(storage_err)?;
    let last_active_at: i64 = row.get(3).map_err(storage_err)?;
    let primary_domain: Option<String> = row.get(4).map_err(storage_err)?;
    let summary: Option<String> = row.get(5).map_err(storage_err)?;

    Ok(ConversationRow {
        id: parse_uuid(&id)?,
        user_id: UserId(user_id),
        started_at: Timestamp(started_at),
        last_active_at: Timestamp(last_active_at),
        primary_domain: primary_domain.as_deref().and_then(Domain::parse),
        summary,
    })
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> Result<ConversationTurn, CompassError> {
    let id: String = row.get(0).map_err(storage_err)?;
    let conversation_id: String = row.get(1).map_err(storage_err)?;
    let role: String = row.get(2).map_err(storage_err)?;
    let text: String = row.get(3).map_err(storage_err)?;
    let created_at: i64 = row.get(4).map_err(storage_err)?;

    Ok(ConversationTurn {
        id: parse_uuid(&id)?,
        conversation_id: parse_uuid(&conversation_id)?,
        role: Role::parse(&role)
            .ok_or_else(|| CompassError::Storage(format!("Invalid role: {}", role)))?,
        text,
        created_at: Timestamp(created_at),
    })
}
