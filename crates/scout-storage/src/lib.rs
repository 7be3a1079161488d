//! Candidate + mission persistence: store contracts, upsert policy, Postgres and in-memory backends.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scout_core::{
    next_run_after, CandidateRecord, Mission, NormalizedProfile, ProfileSection, Recommendation,
    RunSummary, ScheduleError, Verdict,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "scout-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot connect to store: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("no mission configured: {0}")]
    NoMissionConfigured(String),
    #[error("{context}: {source}")]
    Query {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("corrupt row for {key}: {message}")]
    Corrupt { key: String, message: String },
}

fn query_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Query { context, source }
}

/// How an upsert treats an existing row for the same profile.
///
/// `LastWriteWins` is the default: a re-scored profile replaces the stored verdict even when the
/// new score is lower. `KeepHigherScore` refuses to replace a higher stored score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpsertPolicy {
    #[default]
    LastWriteWins,
    KeepHigherScore,
}

impl FromStr for UpsertPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last-write-wins" | "lww" => Ok(Self::LastWriteWins),
            "keep-higher" | "keep-higher-score" => Ok(Self::KeepHigherScore),
            other => Err(format!("unknown upsert policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Identical content already stored; nothing written.
    Unchanged,
    /// `KeepHigherScore` kept a stored verdict with a higher score.
    KeptExisting,
}

impl UpsertOutcome {
    pub fn wrote(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredVersion {
    pub fit_score: u8,
    pub content_digest: String,
}

pub fn decide_upsert(
    existing: Option<&StoredVersion>,
    incoming: &CandidateRecord,
    policy: UpsertPolicy,
) -> UpsertOutcome {
    let Some(existing) = existing else {
        return UpsertOutcome::Inserted;
    };
    if existing.content_digest == incoming.content_digest {
        return UpsertOutcome::Unchanged;
    }
    match policy {
        UpsertPolicy::KeepHigherScore if existing.fit_score > incoming.verdict.fit_score => {
            UpsertOutcome::KeptExisting
        }
        _ => UpsertOutcome::Updated,
    }
}

#[async_trait]
pub trait CandidateStore: Send + Sync {
    async fn upsert(&self, record: &CandidateRecord) -> Result<UpsertOutcome, StoreError>;

    async fn contains(&self, profile_id: &str) -> Result<bool, StoreError>;

    /// Highest-scoring stored candidates, best first.
    async fn top_scoring(&self, limit: usize) -> Result<Vec<CandidateRecord>, StoreError>;
}

#[async_trait]
pub trait MissionStore: Send + Sync {
    async fn active_mission(&self, name: Option<&str>) -> Result<Mission, StoreError>;

    /// Advances last/next run fields atomically and returns the updated mission.
    async fn record_run_completed(
        &self,
        mission_name: &str,
        finished_at: DateTime<Utc>,
        summary: &RunSummary,
    ) -> Result<Mission, StoreError>;

    /// Creates or updates the mission definition. Scheduling state of an existing row is kept.
    async fn upsert_mission(&self, mission: &Mission) -> Result<(), StoreError>;
}

/// With a name: that mission, if enabled. Without: the enabled mission due soonest.
pub fn select_active_mission<'a>(
    missions: impl IntoIterator<Item = &'a Mission>,
    name: Option<&str>,
) -> Result<Mission, StoreError> {
    let mut candidates = missions.into_iter().filter(|m| m.enabled).collect::<Vec<_>>();
    if let Some(name) = name {
        return candidates
            .into_iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| StoreError::NoMissionConfigured(format!("no enabled mission named `{name}`")));
    }
    candidates.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then_with(|| a.name.cmp(&b.name)));
    candidates
        .first()
        .map(|m| (*m).clone())
        .ok_or_else(|| StoreError::NoMissionConfigured("no enabled missions".to_string()))
}

pub fn apply_run_completion(
    mission: &mut Mission,
    finished_at: DateTime<Utc>,
    summary: &RunSummary,
) -> Result<(), ScheduleError> {
    let next = next_run_after(&mission.cron_expression, finished_at)?;
    mission.last_run_at = Some(finished_at);
    mission.next_run_at = Some(next);
    mission.last_run_status = Some(summary.status().as_str().to_string());
    mission.last_run_message = Some(summary.counter_line());
    Ok(())
}

fn merge_mission_definition(existing: &mut Mission, incoming: &Mission) {
    existing.query = incoming.query.clone();
    existing.location = incoming.location.clone();
    existing.role_criteria = incoming.role_criteria.clone();
    existing.acceptance_threshold = incoming.acceptance_threshold;
    existing.cron_expression = incoming.cron_expression.clone();
    existing.enabled = incoming.enabled;
}

#[derive(Debug, Default)]
pub struct MemoryCandidateStore {
    policy: UpsertPolicy,
    rows: Mutex<BTreeMap<String, CandidateRecord>>,
}

impl MemoryCandidateStore {
    pub fn new(policy: UpsertPolicy) -> Self {
        Self {
            policy,
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    pub async fn get(&self, profile_id: &str) -> Option<CandidateRecord> {
        self.rows.lock().await.get(profile_id).cloned()
    }

    pub async fn insert_existing(&self, record: CandidateRecord) {
        self.rows.lock().await.insert(record.profile_id.clone(), record);
    }
}

#[async_trait]
impl CandidateStore for MemoryCandidateStore {
    async fn upsert(&self, record: &CandidateRecord) -> Result<UpsertOutcome, StoreError> {
        let mut rows = self.rows.lock().await;
        let existing = rows.get(&record.profile_id).map(|row| StoredVersion {
            fit_score: row.verdict.fit_score,
            content_digest: row.content_digest.clone(),
        });
        let outcome = decide_upsert(existing.as_ref(), record, self.policy);
        if outcome.wrote() {
            rows.insert(record.profile_id.clone(), record.clone());
        }
        Ok(outcome)
    }

    async fn contains(&self, profile_id: &str) -> Result<bool, StoreError> {
        Ok(self.rows.lock().await.contains_key(profile_id))
    }

    async fn top_scoring(&self, limit: usize) -> Result<Vec<CandidateRecord>, StoreError> {
        let rows = self.rows.lock().await;
        let mut all = rows.values().cloned().collect::<Vec<_>>();
        all.sort_by(|a, b| {
            b.verdict
                .fit_score
                .cmp(&a.verdict.fit_score)
                .then_with(|| a.profile_id.cmp(&b.profile_id))
        });
        all.truncate(limit);
        Ok(all)
    }
}

#[derive(Debug, Default)]
pub struct MemoryMissionStore {
    missions: Mutex<BTreeMap<String, Mission>>,
}

impl MemoryMissionStore {
    pub fn from_missions(missions: impl IntoIterator<Item = Mission>) -> Self {
        Self {
            missions: Mutex::new(missions.into_iter().map(|m| (m.name.clone(), m)).collect()),
        }
    }

    pub async fn get(&self, name: &str) -> Option<Mission> {
        self.missions.lock().await.get(name).cloned()
    }
}

#[async_trait]
impl MissionStore for MemoryMissionStore {
    async fn active_mission(&self, name: Option<&str>) -> Result<Mission, StoreError> {
        let missions = self.missions.lock().await;
        select_active_mission(missions.values(), name)
    }

    async fn record_run_completed(
        &self,
        mission_name: &str,
        finished_at: DateTime<Utc>,
        summary: &RunSummary,
    ) -> Result<Mission, StoreError> {
        let mut missions = self.missions.lock().await;
        let mission = missions.get_mut(mission_name).ok_or_else(|| {
            StoreError::NoMissionConfigured(format!("mission `{mission_name}` disappeared"))
        })?;
        apply_run_completion(mission, finished_at, summary)?;
        Ok(mission.clone())
    }

    async fn upsert_mission(&self, mission: &Mission) -> Result<(), StoreError> {
        let mut missions = self.missions.lock().await;
        match missions.get_mut(&mission.name) {
            Some(existing) => merge_mission_definition(existing, mission),
            None => {
                missions.insert(mission.name.clone(), mission.clone());
            }
        }
        Ok(())
    }
}

/// Postgres-backed store for both tables. One pooled connection, reused across cycles.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    policy: UpsertPolicy,
}

impl PgStore {
    pub async fn connect(database_url: &str, policy: UpsertPolicy) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(StoreError::Connect)?;
        info!(policy = ?policy, "connected to candidate store");
        Ok(Self { pool, policy })
    }

    pub fn from_pool(pool: PgPool, policy: UpsertPolicy) -> Self {
        Self { pool, policy }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

const MISSION_COLUMNS: &str = "mission_name, query, location, role_criteria, acceptance_threshold, \
     cron_expression, enabled, last_run_at, next_run_at, last_run_status, last_run_message";

fn row_to_mission(row: &PgRow) -> Result<Mission, StoreError> {
    let name: String = row.try_get("mission_name").map_err(query_err("reading mission_name"))?;
    let threshold: i16 = row
        .try_get("acceptance_threshold")
        .map_err(query_err("reading acceptance_threshold"))?;
    let acceptance_threshold = u8::try_from(threshold).map_err(|_| StoreError::Corrupt {
        key: name.clone(),
        message: format!("acceptance_threshold {threshold} out of range"),
    })?;
    Ok(Mission {
        query: row.try_get("query").map_err(query_err("reading query"))?,
        location: row.try_get("location").map_err(query_err("reading location"))?,
        role_criteria: row
            .try_get("role_criteria")
            .map_err(query_err("reading role_criteria"))?,
        acceptance_threshold,
        cron_expression: row
            .try_get("cron_expression")
            .map_err(query_err("reading cron_expression"))?,
        enabled: row.try_get("enabled").map_err(query_err("reading enabled"))?,
        last_run_at: row.try_get("last_run_at").map_err(query_err("reading last_run_at"))?,
        next_run_at: row.try_get("next_run_at").map_err(query_err("reading next_run_at"))?,
        last_run_status: row
            .try_get("last_run_status")
            .map_err(query_err("reading last_run_status"))?,
        last_run_message: row
            .try_get("last_run_message")
            .map_err(query_err("reading last_run_message"))?,
        name,
    })
}

fn row_to_candidate(row: &PgRow) -> Result<CandidateRecord, StoreError> {
    let profile_id: String = row.try_get("profile_id").map_err(query_err("reading profile_id"))?;
    let corrupt = |message: String| StoreError::Corrupt {
        key: profile_id.clone(),
        message,
    };

    let sections: JsonValue = row.try_get("sections").map_err(query_err("reading sections"))?;
    let sections: Vec<ProfileSection> =
        serde_json::from_value(sections).map_err(|e| corrupt(format!("sections: {e}")))?;
    let attributes = match row
        .try_get::<JsonValue, _>("attributes")
        .map_err(query_err("reading attributes"))?
    {
        JsonValue::Object(map) => map,
        other => return Err(corrupt(format!("attributes is not an object: {other}"))),
    };
    let score: i16 = row.try_get("fit_score").map_err(query_err("reading fit_score"))?;
    let fit_score = Verdict::checked_score(i64::from(score))
        .ok_or_else(|| corrupt(format!("fit_score {score} out of range")))?;
    let recommendation: String = row
        .try_get("recommendation")
        .map_err(query_err("reading recommendation"))?;
    let recommendation = Recommendation::parse(&recommendation)
        .ok_or_else(|| corrupt(format!("unknown recommendation `{recommendation}`")))?;

    Ok(CandidateRecord {
        mission_name: row.try_get("mission_name").map_err(query_err("reading mission_name"))?,
        profile: NormalizedProfile {
            profile_id: profile_id.clone(),
            name: row.try_get("name").map_err(query_err("reading name"))?,
            headline: row.try_get("headline").map_err(query_err("reading headline"))?,
            location: row.try_get("location").map_err(query_err("reading location"))?,
            sections,
        },
        verdict: Verdict {
            fit_score,
            rationale: row.try_get("rationale").map_err(query_err("reading rationale"))?,
            summary: row.try_get("summary").map_err(query_err("reading summary"))?,
            recommendation,
            attributes,
        },
        content_digest: row
            .try_get("content_digest")
            .map_err(query_err("reading content_digest"))?,
        scored_at: row.try_get("scored_at").map_err(query_err("reading scored_at"))?,
        profile_id,
    })
}

#[async_trait]
impl CandidateStore for PgStore {
    async fn upsert(&self, record: &CandidateRecord) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_err("beginning candidate upsert"))?;

        let existing = sqlx::query(
            r#"
            SELECT fit_score, content_digest
              FROM candidates
             WHERE profile_id = $1
               FOR UPDATE
            "#,
        )
        .bind(&record.profile_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_err("locking existing candidate"))?
        .map(|row| -> Result<StoredVersion, StoreError> {
            let score: i16 = row.try_get("fit_score").map_err(query_err("reading fit_score"))?;
            Ok(StoredVersion {
                fit_score: u8::try_from(score).unwrap_or(u8::MAX),
                content_digest: row
                    .try_get("content_digest")
                    .map_err(query_err("reading content_digest"))?,
            })
        })
        .transpose()?;

        let outcome = decide_upsert(existing.as_ref(), record, self.policy);
        if !outcome.wrote() {
            tx.rollback()
                .await
                .map_err(query_err("releasing candidate lock"))?;
            debug!(profile_id = %record.profile_id, ?outcome, "candidate upsert made no changes");
            return Ok(outcome);
        }

        let sections = serde_json::to_value(&record.profile.sections).map_err(|e| StoreError::Corrupt {
            key: record.profile_id.clone(),
            message: format!("serializing sections: {e}"),
        })?;

        sqlx::query(
            r#"
            INSERT INTO candidates (
                profile_id, mission_name, name, headline, location, sections, profile_text,
                fit_score, rationale, summary, recommendation, attributes, content_digest, scored_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (profile_id) DO UPDATE SET
                mission_name   = EXCLUDED.mission_name,
                name           = EXCLUDED.name,
                headline       = EXCLUDED.headline,
                location       = EXCLUDED.location,
                sections       = EXCLUDED.sections,
                profile_text   = EXCLUDED.profile_text,
                fit_score      = EXCLUDED.fit_score,
                rationale      = EXCLUDED.rationale,
                summary        = EXCLUDED.summary,
                recommendation = EXCLUDED.recommendation,
                attributes     = EXCLUDED.attributes,
                content_digest = EXCLUDED.content_digest,
                scored_at      = EXCLUDED.scored_at,
                updated_at     = NOW()
            "#,
        )
        .bind(&record.profile_id)
        .bind(&record.mission_name)
        .bind(&record.profile.name)
        .bind(&record.profile.headline)
        .bind(&record.profile.location)
        .bind(sections)
        .bind(record.profile.render_text())
        .bind(i16::from(record.verdict.fit_score))
        .bind(&record.verdict.rationale)
        .bind(&record.verdict.summary)
        .bind(record.verdict.recommendation.as_str())
        .bind(JsonValue::Object(record.verdict.attributes.clone()))
        .bind(&record.content_digest)
        .bind(record.scored_at)
        .execute(&mut *tx)
        .await
        .map_err(query_err("writing candidate"))?;

        tx.commit().await.map_err(query_err("committing candidate upsert"))?;
        Ok(outcome)
    }

    async fn contains(&self, profile_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM candidates WHERE profile_id = $1) AS present")
            .bind(profile_id)
            .fetch_one(&self.pool)
            .await
            .map_err(query_err("checking candidate existence"))?;
        row.try_get("present").map_err(query_err("reading existence flag"))
    }

    async fn top_scoring(&self, limit: usize) -> Result<Vec<CandidateRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT profile_id, mission_name, name, headline, location, sections, fit_score,
                   rationale, summary, recommendation, attributes, content_digest, scored_at
              FROM candidates
             ORDER BY fit_score DESC, profile_id
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("loading top-scoring candidates"))?;
        rows.iter().map(row_to_candidate).collect()
    }
}

#[async_trait]
impl MissionStore for PgStore {
    async fn active_mission(&self, name: Option<&str>) -> Result<Mission, StoreError> {
        let sql = format!("SELECT {MISSION_COLUMNS} FROM mission_schedules WHERE enabled");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("loading missions"))?;
        let missions = rows.iter().map(row_to_mission).collect::<Result<Vec<_>, _>>()?;
        select_active_mission(&missions, name)
    }

    async fn record_run_completed(
        &self,
        mission_name: &str,
        finished_at: DateTime<Utc>,
        summary: &RunSummary,
    ) -> Result<Mission, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_err("beginning run bookkeeping"))?;

        let sql = format!("SELECT {MISSION_COLUMNS} FROM mission_schedules WHERE mission_name = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(mission_name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err("locking mission schedule"))?
            .ok_or_else(|| StoreError::NoMissionConfigured(format!("mission `{mission_name}` disappeared")))?;
        let mut mission = row_to_mission(&row)?;
        apply_run_completion(&mut mission, finished_at, summary)?;

        sqlx::query(
            r#"
            UPDATE mission_schedules
               SET last_run_at      = $2,
                   next_run_at      = $3,
                   last_run_status  = $4,
                   last_run_message = $5,
                   updated_at       = NOW()
             WHERE mission_name = $1
            "#,
        )
        .bind(mission_name)
        .bind(mission.last_run_at)
        .bind(mission.next_run_at)
        .bind(&mission.last_run_status)
        .bind(&mission.last_run_message)
        .execute(&mut *tx)
        .await
        .map_err(query_err("updating mission schedule"))?;

        tx.commit().await.map_err(query_err("committing run bookkeeping"))?;
        Ok(mission)
    }

    async fn upsert_mission(&self, mission: &Mission) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO mission_schedules (
                mission_name, query, location, role_criteria, acceptance_threshold, cron_expression, enabled
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (mission_name) DO UPDATE SET
                query                = EXCLUDED.query,
                location             = EXCLUDED.location,
                role_criteria        = EXCLUDED.role_criteria,
                acceptance_threshold = EXCLUDED.acceptance_threshold,
                cron_expression      = EXCLUDED.cron_expression,
                enabled              = EXCLUDED.enabled,
                updated_at           = NOW()
            "#,
        )
        .bind(&mission.name)
        .bind(&mission.query)
        .bind(&mission.location)
        .bind(&mission.role_criteria)
        .bind(i16::from(mission.acceptance_threshold))
        .bind(&mission.cron_expression)
        .bind(mission.enabled)
        .execute(&self.pool)
        .await
        .map_err(query_err("upserting mission"))?;
        Ok(())
    }
}
