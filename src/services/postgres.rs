use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::error::MatchingError;
use crate::models::{
    GroupMember, MatchingAuditEntry, MatchingGroup, MatchingRun, PaidAttendee, PersonalityProfile,
    RunState, TraitVector,
};
use crate::services::repository::{
    CommitBatch, GroupMutation, MatchingRepository, ParticipantDirectory,
};

/// Errors that can occur while setting up the PostgreSQL connection
#[derive(Debug, Error)]
pub enum PostgresError {
    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrateError(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<PostgresError> for MatchingError {
    fn from(err: PostgresError) -> Self {
        MatchingError::Storage(err.to_string())
    }
}

impl From<sqlx::Error> for MatchingError {
    fn from(err: sqlx::Error) -> Self {
        MatchingError::Storage(err.to_string())
    }
}

/// PostgreSQL-backed matching store
///
/// Owns the `matching_*` and `group_members` tables and reads the payment
/// (`events`, `transactions`) and personality (`personality_profiles`) tables
/// maintained by other subsystems. Every mutating call runs in one transaction;
/// dropping it before commit (e.g. on timeout) rolls everything back.
pub struct PostgresClient {
    pool: PgPool,
}

impl PostgresClient {
    /// Create a new PostgreSQL client from a connection string
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        acquire_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, PostgresError> {
        if max_connections < min_connections {
            return Err(PostgresError::InvalidInput(format!(
                "max_connections ({}) is below min_connections ({})",
                max_connections, min_connections
            )));
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(acquire_timeout)
            .idle_timeout(idle_timeout)
            .test_before_acquire(true)
            .connect(database_url)
            .await?;

        // Run migrations on startup
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Create a new PostgreSQL client from settings
    pub async fn from_settings(
        url: &str,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
        acquire_timeout_secs: Option<u64>,
        idle_timeout_secs: Option<u64>,
    ) -> Result<Self, PostgresError> {
        tracing::info!("Connecting to PostgreSQL");

        Self::new(
            url,
            max_connections.unwrap_or(10),
            min_connections.unwrap_or(1),
            Duration::from_secs(acquire_timeout_secs.unwrap_or(5)),
            Duration::from_secs(idle_timeout_secs.unwrap_or(600)),
        )
        .await
    }

    async fn load_run(&self, run_id: Uuid) -> Result<MatchingRun, MatchingError> {
        let row = sqlx::query(RUN_COLUMNS_BY_ID)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MatchingError::RunNotFound(run_id.to_string()))?;
        row_to_run(&row)
    }
}

const RUN_COLUMNS_BY_ID: &str = r#"
    SELECT id, event_id, status, created_at, created_by, committed_at, superseded_at
    FROM matching_runs
    WHERE id = $1
"#;

fn row_to_run(row: &PgRow) -> Result<MatchingRun, MatchingError> {
    let status: String = row.try_get("status")?;
    let state = match status.as_str() {
        "COMMITTED" => RunState::Committed {
            committed_at: row.try_get("committed_at")?,
        },
        "SUPERSEDED" => RunState::Superseded {
            superseded_at: row
                .try_get::<Option<DateTime<Utc>>, _>("superseded_at")?
                .unwrap_or(row.try_get("committed_at")?),
        },
        other => {
            return Err(MatchingError::Storage(format!("unknown run status: {}", other)));
        }
    };

    Ok(MatchingRun {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        state,
        created_at: row.try_get("created_at")?,
        created_by: row.try_get("created_by")?,
    })
}

fn row_to_member(row: &PgRow) -> Result<GroupMember, MatchingError> {
    let assigned_by: String = row.try_get("assigned_by")?;
    Ok(GroupMember {
        group_id: row.try_get("group_id")?,
        user_id: row.try_get("user_id")?,
        assigned_by: assigned_by.parse().map_err(MatchingError::Storage)?,
        assigned_at: row.try_get("assigned_at")?,
        removed_at: row.try_get("removed_at")?,
    })
}

fn row_to_group(row: &PgRow) -> Result<MatchingGroup, MatchingError> {
    let origin: String = row.try_get("origin")?;
    Ok(MatchingGroup {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        group_number: row.try_get::<i32, _>("group_number")? as u32,
        min_size: row.try_get::<i32, _>("min_size")? as usize,
        max_size: row.try_get::<i32, _>("max_size")? as usize,
        origin: origin.parse().map_err(MatchingError::Storage)?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        members: Vec::new(),
    })
}

fn row_to_audit(row: &PgRow) -> Result<MatchingAuditEntry, MatchingError> {
    let action: String = row.try_get("action")?;
    Ok(MatchingAuditEntry {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        actor_id: row.try_get("actor_id")?,
        action: action.parse().map_err(MatchingError::Storage)?,
        before_state: row.try_get("before_state")?,
        after_state: row.try_get("after_state")?,
        timestamp: row.try_get("created_at")?,
    })
}

/// Parse an enum stored as its serde string form
fn parse_enum<T: serde::de::DeserializeOwned>(user_id: &str, field: &str, raw: String) -> Result<T, MatchingError> {
    serde_json::from_value(serde_json::Value::String(raw.clone())).map_err(|_| {
        MatchingError::Storage(format!("user {} has unknown {} value: {}", user_id, field, raw))
    })
}

async fn insert_group(
    tx: &mut Transaction<'_, Postgres>,
    group: &MatchingGroup,
    group_number: u32,
) -> Result<(), MatchingError> {
    sqlx::query(
        r#"
        INSERT INTO matching_groups
            (id, run_id, group_number, min_size, max_size, origin, version, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(group.id)
    .bind(group.run_id)
    .bind(group_number as i32)
    .bind(group.min_size as i32)
    .bind(group.max_size as i32)
    .bind(group.origin.as_str())
    .bind(group.version)
    .bind(group.created_at)
    .bind(group.updated_at)
    .execute(&mut **tx)
    .await?;

    for member in &group.members {
        insert_member(tx, group.run_id, member).await?;
    }
    Ok(())
}

async fn insert_member(
    tx: &mut Transaction<'_, Postgres>,
    run_id: Uuid,
    member: &GroupMember,
) -> Result<(), MatchingError> {
    // A concurrent seat that committed after ensure_unseated lands on the partial index
    let inserted = sqlx::query(
        r#"
        INSERT INTO group_members (run_id, group_id, user_id, assigned_by, assigned_at, removed_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (run_id, user_id) WHERE removed_at IS NULL DO NOTHING
        "#,
    )
    .bind(run_id)
    .bind(member.group_id)
    .bind(&member.user_id)
    .bind(member.assigned_by.as_str())
    .bind(member.assigned_at)
    .bind(member.removed_at)
    .execute(&mut **tx)
    .await?;

    if inserted.rows_affected() == 0 {
        let group_id: Uuid = sqlx::query_scalar(
            "SELECT group_id FROM group_members WHERE run_id = $1 AND user_id = $2 AND removed_at IS NULL",
        )
        .bind(run_id)
        .bind(&member.user_id)
        .fetch_one(&mut **tx)
        .await?;
        return Err(MatchingError::ParticipantAlreadyAssigned {
            user_id: member.user_id.clone(),
            group_id,
        });
    }
    Ok(())
}

async fn insert_audit(
    tx: &mut Transaction<'_, Postgres>,
    entry: &MatchingAuditEntry,
) -> Result<(), MatchingError> {
    sqlx::query(
        r#"
        INSERT INTO matching_audit_entries
            (id, run_id, actor_id, action, before_state, after_state, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(entry.id)
    .bind(entry.run_id)
    .bind(&entry.actor_id)
    .bind(entry.action.as_str())
    .bind(&entry.before_state)
    .bind(&entry.after_state)
    .bind(entry.timestamp)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Reject incoming users that already hold an active seat in the run
async fn ensure_unseated(
    tx: &mut Transaction<'_, Postgres>,
    run_id: Uuid,
    user_ids: &[String],
) -> Result<(), MatchingError> {
    let mut seen = HashSet::new();
    for user_id in user_ids {
        if !seen.insert(user_id) {
            return Err(MatchingError::DuplicateMember(user_id.clone()));
        }
    }

    let existing = sqlx::query(
        r#"
        SELECT user_id, group_id
        FROM group_members
        WHERE run_id = $1 AND user_id = ANY($2) AND removed_at IS NULL
        LIMIT 1
        "#,
    )
    .bind(run_id)
    .bind(user_ids)
    .fetch_optional(&mut **tx)
    .await?;

    match existing {
        Some(row) => Err(MatchingError::ParticipantAlreadyAssigned {
            user_id: row.try_get("user_id")?,
            group_id: row.try_get("group_id")?,
        }),
        None => Ok(()),
    }
}

async fn max_group_number(tx: &mut Transaction<'_, Postgres>, run_id: Uuid) -> Result<u32, MatchingError> {
    let max: i32 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(group_number), 0) FROM matching_groups WHERE run_id = $1",
    )
    .bind(run_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(max as u32)
}

async fn load_groups(conn: &mut PgConnection, run_id: Uuid) -> Result<Vec<MatchingGroup>, MatchingError> {
    let group_rows = sqlx::query(
        r#"
        SELECT id, run_id, group_number, min_size, max_size, origin, version, created_at, updated_at
        FROM matching_groups
        WHERE run_id = $1
        ORDER BY group_number ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(&mut *conn)
    .await?;

    let member_rows = sqlx::query(
        r#"
        SELECT group_id, user_id, assigned_by, assigned_at, removed_at
        FROM group_members
        WHERE run_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut groups = group_rows
        .iter()
        .map(row_to_group)
        .collect::<Result<Vec<_>, _>>()?;
    for row in &member_rows {
        let member = row_to_member(row)?;
        if let Some(group) = groups.iter_mut().find(|g| g.id == member.group_id) {
            group.members.push(member);
        }
    }

    Ok(groups)
}

#[async_trait]
impl MatchingRepository for PostgresClient {
    async fn committed_run(&self, event_id: &str) -> Result<Option<MatchingRun>, MatchingError> {
        let row = sqlx::query(
            r#"
            SELECT id, event_id, status, created_at, created_by, committed_at, superseded_at
            FROM matching_runs
            WHERE event_id = $1 AND status = 'COMMITTED'
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_run).transpose()
    }

    async fn runs(&self, event_id: &str) -> Result<Vec<MatchingRun>, MatchingError> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, status, created_at, created_by, committed_at, superseded_at
            FROM matching_runs
            WHERE event_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_run).collect()
    }

    async fn groups(&self, run_id: Uuid) -> Result<Vec<MatchingGroup>, MatchingError> {
        let mut conn = self.pool.acquire().await?;
        load_groups(&mut conn, run_id).await
    }

    async fn commit_groups(&self, batch: CommitBatch) -> Result<Vec<MatchingGroup>, MatchingError> {
        let mut tx = self.pool.begin().await?;
        let event_id = batch.run.event_id.clone();

        // Cross-instance guard; the in-process lock covers this instance
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtext($1))")
            .bind(&event_id)
            .fetch_one(&mut *tx)
            .await?;
        if !locked {
            return Err(MatchingError::MatchingAlreadyInProgress(event_id));
        }

        if batch.create_run {
            let committed_at = match batch.run.state {
                RunState::Committed { committed_at } => committed_at,
                _ => {
                    return Err(MatchingError::Storage(
                        "only committed runs can be persisted".to_string(),
                    ))
                }
            };
            let inserted = sqlx::query(
                r#"
                INSERT INTO matching_runs (id, event_id, status, created_at, created_by, committed_at)
                VALUES ($1, $2, 'COMMITTED', $3, $4, $5)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(batch.run.id)
            .bind(&event_id)
            .bind(batch.run.created_at)
            .bind(&batch.run.created_by)
            .bind(committed_at)
            .execute(&mut *tx)
            .await?;
            if inserted.rows_affected() == 0 {
                return Err(MatchingError::MatchingAlreadyInProgress(event_id));
            }
        } else {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM matching_runs WHERE id = $1 FOR UPDATE")
                    .bind(batch.run.id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if status.as_deref() != Some("COMMITTED") {
                return Err(MatchingError::RunNotFound(event_id));
            }
        }

        let incoming: Vec<String> = batch
            .groups
            .iter()
            .flat_map(|g| g.active_member_ids())
            .collect();
        ensure_unseated(&mut tx, batch.run.id, &incoming).await?;

        let offset = max_group_number(&mut tx, batch.run.id).await?;
        let mut stored = Vec::with_capacity(batch.groups.len());
        for mut group in batch.groups {
            group.group_number += offset;
            insert_group(&mut tx, &group, group.group_number).await?;
            stored.push(group);
        }

        tx.commit().await?;

        tracing::debug!(
            "Committed {} groups for run {} (event {})",
            stored.len(),
            batch.run.id,
            event_id
        );

        Ok(stored)
    }

    async fn apply_mutation(&self, mutation: GroupMutation) -> Result<Vec<MatchingGroup>, MatchingError> {
        let mut tx = self.pool.begin().await?;

        // New groups need a stable max(group_number), so they take the run row exclusively
        let sql = if mutation.new_groups.is_empty() {
            "SELECT event_id, status FROM matching_runs WHERE id = $1 FOR SHARE"
        } else {
            "SELECT event_id, status FROM matching_runs WHERE id = $1 FOR UPDATE"
        };
        let run_row = sqlx::query(sql)
            .bind(mutation.run_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| MatchingError::RunNotFound(mutation.run_id.to_string()))?;
        let status: String = run_row.try_get("status")?;
        if status != "COMMITTED" {
            return Err(MatchingError::RunNotFound(run_row.try_get("event_id")?));
        }

        for (group_id, expected) in &mutation.expected_versions {
            let actual: Option<i64> = sqlx::query_scalar(
                "SELECT version FROM matching_groups WHERE id = $1 AND run_id = $2 FOR UPDATE",
            )
            .bind(group_id)
            .bind(mutation.run_id)
            .fetch_optional(&mut *tx)
            .await?;
            match actual {
                None => return Err(MatchingError::GroupNotFound(*group_id)),
                Some(actual) if actual != *expected => {
                    return Err(MatchingError::ConcurrentModification {
                        group_id: *group_id,
                        expected: *expected,
                        actual,
                    })
                }
                Some(_) => {}
            }
        }

        for removal in &mutation.removals {
            let result = sqlx::query(
                r#"
                UPDATE group_members
                SET removed_at = $1
                WHERE group_id = $2 AND user_id = $3 AND removed_at IS NULL
                "#,
            )
            .bind(mutation.applied_at)
            .bind(removal.group_id)
            .bind(&removal.user_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MatchingError::ParticipantNotInGroup {
                    user_id: removal.user_id.clone(),
                    group_id: removal.group_id,
                });
            }
        }

        let incoming: Vec<String> = mutation
            .additions
            .iter()
            .map(|m| m.user_id.clone())
            .chain(mutation.new_groups.iter().flat_map(|g| g.active_member_ids()))
            .collect();
        ensure_unseated(&mut tx, mutation.run_id, &incoming).await?;

        for addition in &mutation.additions {
            insert_member(&mut tx, mutation.run_id, addition).await?;
        }

        let mut next_number = max_group_number(&mut tx, mutation.run_id).await? + 1;
        let mut touched: HashSet<Uuid> = mutation.expected_versions.iter().map(|(id, _)| *id).collect();
        for group in &mutation.new_groups {
            insert_group(&mut tx, group, next_number).await?;
            touched.insert(group.id);
            next_number += 1;
        }

        let bumped: Vec<Uuid> = mutation.expected_versions.iter().map(|(id, _)| *id).collect();
        if !bumped.is_empty() {
            sqlx::query(
                "UPDATE matching_groups SET version = version + 1, updated_at = $1 WHERE id = ANY($2)",
            )
            .bind(mutation.applied_at)
            .bind(&bumped)
            .execute(&mut *tx)
            .await?;
        }

        insert_audit(&mut tx, &mutation.audit).await?;
        let groups: Vec<MatchingGroup> = load_groups(&mut tx, mutation.run_id)
            .await?
            .into_iter()
            .filter(|g| touched.contains(&g.id))
            .collect();
        tx.commit().await?;

        Ok(groups)
    }

    async fn supersede_run(
        &self,
        run_id: Uuid,
        superseded_at: DateTime<Utc>,
        audit: MatchingAuditEntry,
    ) -> Result<MatchingRun, MatchingError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE matching_runs
            SET status = 'SUPERSEDED', superseded_at = $2
            WHERE id = $1 AND status = 'COMMITTED'
            "#,
        )
        .bind(run_id)
        .bind(superseded_at)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(MatchingError::RunNotFound(run_id.to_string()));
        }

        insert_audit(&mut tx, &audit).await?;
        tx.commit().await?;

        self.load_run(run_id).await
    }

    async fn audit_entries(&self, event_id: &str) -> Result<Vec<MatchingAuditEntry>, MatchingError> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.run_id, a.actor_id, a.action, a.before_state, a.after_state, a.created_at
            FROM matching_audit_entries a
            JOIN matching_runs r ON r.id = a.run_id
            WHERE r.event_id = $1
            ORDER BY a.created_at ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_audit).collect()
    }

    /// Health check for the database connection
    async fn health_check(&self) -> Result<bool, MatchingError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| true)
            .map_err(Into::into)
    }
}

#[async_trait]
impl ParticipantDirectory for PostgresClient {
    async fn event_exists(&self, event_id: &str) -> Result<bool, MatchingError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM events WHERE id = $1)")
            .bind(event_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn paid_attendees(&self, event_id: &str) -> Result<Vec<PaidAttendee>, MatchingError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, id AS transaction_id, paid_at, status <> 'PAID' AS cancelled
            FROM transactions
            WHERE event_id = $1
              AND paid_at IS NOT NULL
              AND status IN ('PAID', 'CANCELLED', 'REFUNDED')
            ORDER BY paid_at ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PaidAttendee {
                    user_id: row.try_get("user_id")?,
                    transaction_id: row.try_get("transaction_id")?,
                    paid_at: row.try_get("paid_at")?,
                    cancelled: row.try_get("cancelled")?,
                })
            })
            .collect()
    }

    async fn profiles(&self, user_ids: &[String]) -> Result<Vec<PersonalityProfile>, MatchingError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, trait_vector, gender, gender_mix_preference, intent
            FROM personality_profiles
            WHERE user_id = ANY($1)
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let user_id: String = row.try_get("user_id")?;
                let gender = row
                    .try_get::<Option<String>, _>("gender")?
                    .map(|g| parse_enum(&user_id, "gender", g))
                    .transpose()?;
                let gender_mix_preference = row
                    .try_get::<Option<String>, _>("gender_mix_preference")?
                    .map(|p| parse_enum(&user_id, "gender_mix_preference", p))
                    .transpose()?
                    .unwrap_or_default();
                let intent = row
                    .try_get::<Option<Vec<String>>, _>("intent")?
                    .unwrap_or_default()
                    .into_iter()
                    .map(|i| parse_enum(&user_id, "intent", i))
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(PersonalityProfile {
                    trait_vector: TraitVector::new(row.try_get("trait_vector")?),
                    user_id,
                    gender,
                    gender_mix_preference,
                    intent,
                })
            })
            .collect()
    }
}
