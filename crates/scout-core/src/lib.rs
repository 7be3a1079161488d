//! Core domain model and error taxonomy for the recruiting-lead scout.

use std::fmt;

use chrono::{DateTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "scout-core";

pub const MAX_FIT_SCORE: u8 = 100;
pub const DEFAULT_ACCEPTANCE_THRESHOLD: u8 = 70;

/// One configured search-and-score task plus its scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mission {
    pub name: String,
    pub query: String,
    #[serde(default)]
    pub location: Option<String>,
    pub role_criteria: String,
    #[serde(default = "default_acceptance_threshold")]
    pub acceptance_threshold: u8,
    pub cron_expression: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_status: Option<String>,
    #[serde(default)]
    pub last_run_message: Option<String>,
}

fn default_acceptance_threshold() -> u8 {
    DEFAULT_ACCEPTANCE_THRESHOLD
}

fn default_enabled() -> bool {
    true
}

impl Mission {
    pub fn new(
        name: impl Into<String>,
        query: impl Into<String>,
        role_criteria: impl Into<String>,
        cron_expression: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            location: None,
            role_criteria: role_criteria.into(),
            acceptance_threshold: DEFAULT_ACCEPTANCE_THRESHOLD,
            cron_expression: cron_expression.into(),
            enabled: true,
            last_run_at: None,
            next_run_at: None,
            last_run_status: None,
            last_run_message: None,
        }
    }

    /// A mission that has never been scheduled is always due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_run_at {
            Some(next) => next <= now,
            None => true,
        }
    }

    pub fn accepts(&self, verdict: &Verdict) -> bool {
        verdict.fit_score >= self.acceptance_threshold
    }
}

/// Opaque reference to one discovered candidate, not yet fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileHandle {
    pub id: String,
    pub discovery_order: usize,
}

impl ProfileHandle {
    pub fn new(id: impl Into<String>, discovery_order: usize) -> Self {
        Self {
            id: id.into(),
            discovery_order,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Html,
    Text,
}

/// Page content as returned by a fetcher session. Owned by a single cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProfile {
    pub profile_id: String,
    pub content_type: ContentType,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSection {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedProfile {
    pub profile_id: String,
    pub name: String,
    pub headline: Option<String>,
    pub location: Option<String>,
    pub sections: Vec<ProfileSection>,
}

impl NormalizedProfile {
    pub fn section(&self, title: &str) -> Option<&ProfileSection> {
        self.sections
            .iter()
            .find(|s| s.title.eq_ignore_ascii_case(title))
    }

    pub fn experience_text(&self) -> Option<&str> {
        self.section("Experience").map(|s| s.body.as_str())
    }

    /// Flat text rendering used for scoring prompts and the stored `profile_text` column.
    pub fn render_text(&self) -> String {
        let mut out = self.name.clone();
        if let Some(headline) = &self.headline {
            out.push('\n');
            out.push_str(headline);
        }
        if let Some(location) = &self.location {
            out.push('\n');
            out.push_str(location);
        }
        for section in &self.sections {
            out.push_str("\n\n");
            out.push_str(&section.title);
            out.push('\n');
            out.push_str(&section.body);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Recommend,
    DoNotRecommend,
}

impl Recommendation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recommend => "recommend",
            Self::DoNotRecommend => "do_not_recommend",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value
            .trim()
            .to_ascii_lowercase()
            .replace([' ', '-'], "_");
        match normalized.as_str() {
            "recommend" => Some(Self::Recommend),
            "do_not_recommend" | "not_recommend" => Some(Self::DoNotRecommend),
            _ => None,
        }
    }
}

/// The scorer's structured fit assessment for one profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub fit_score: u8,
    pub rationale: String,
    pub summary: String,
    pub recommendation: Recommendation,
    #[serde(default)]
    pub attributes: JsonMap<String, JsonValue>,
}

impl Verdict {
    /// Returns `None` when the score is outside `0..=MAX_FIT_SCORE`.
    pub fn checked_score(raw: i64) -> Option<u8> {
        u8::try_from(raw).ok().filter(|score| *score <= MAX_FIT_SCORE)
    }
}

/// Persisted candidate row. Only built from a complete (profile, verdict) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub profile_id: String,
    pub mission_name: String,
    pub profile: NormalizedProfile,
    pub verdict: Verdict,
    pub content_digest: String,
    pub scored_at: DateTime<Utc>,
}

impl CandidateRecord {
    pub fn new(
        mission_name: impl Into<String>,
        profile: NormalizedProfile,
        verdict: Verdict,
        scored_at: DateTime<Utc>,
    ) -> Self {
        let content_digest = content_digest(&profile, &verdict);
        Self {
            profile_id: profile.profile_id.clone(),
            mission_name: mission_name.into(),
            profile,
            verdict,
            content_digest,
            scored_at,
        }
    }
}

/// Stable sha256 over the profile fields and verdict; the timestamp is excluded.
pub fn content_digest(profile: &NormalizedProfile, verdict: &Verdict) -> String {
    let mut hasher = Sha256::new();
    let mut feed = |part: &str| {
        hasher.update(part.len().to_le_bytes());
        hasher.update(part.as_bytes());
    };
    feed(&profile.profile_id);
    feed(&profile.name);
    feed(profile.headline.as_deref().unwrap_or_default());
    feed(profile.location.as_deref().unwrap_or_default());
    for section in &profile.sections {
        feed(&section.title);
        feed(&section.body);
    }
    feed(&verdict.fit_score.to_string());
    feed(&verdict.rationale);
    feed(&verdict.summary);
    feed(verdict.recommendation.as_str());
    feed(&JsonValue::Object(verdict.attributes.clone()).to_string());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// The only error type a fetcher or scorer is allowed to surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct ExternalError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExternalError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureStage {
    FetchFailed,
    ExtractionFailed,
    ScoreFailed,
    PersistFailed,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FetchFailed => "FetchFailed",
            Self::ExtractionFailed => "ExtractionFailed",
            Self::ScoreFailed => "ScoreFailed",
            Self::PersistFailed => "PersistFailed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{stage} for {profile_id}: {reason}")]
pub struct ProfileFailure {
    pub profile_id: String,
    pub stage: FailureStage,
    pub reason: String,
}

impl ProfileFailure {
    pub fn new(profile_id: impl Into<String>, stage: FailureStage, reason: impl fmt::Display) -> Self {
        Self {
            profile_id: profile_id.into(),
            stage,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileOutcome {
    /// Scored at or above threshold and persisted.
    Succeeded,
    /// Processed without error but not persisted.
    Skipped { reason: String },
    Failed(ProfileFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedProfile {
    pub profile_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithFailures,
    SearchFailed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedWithFailures => "completed_with_failures",
            Self::SearchFailed => "search_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mission_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Every failed profile, in processing order.
    pub errors: Vec<ProfileFailure>,
    pub skipped_profiles: Vec<SkippedProfile>,
    /// Set when search pagination stopped early.
    pub enumeration_error: Option<String>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, mission_name: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            mission_name: mission_name.into(),
            started_at,
            finished_at: started_at,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            errors: Vec::new(),
            skipped_profiles: Vec::new(),
            enumeration_error: None,
        }
    }

    pub fn record(&mut self, profile_id: &str, outcome: ProfileOutcome) {
        self.attempted += 1;
        match outcome {
            ProfileOutcome::Succeeded => self.succeeded += 1,
            ProfileOutcome::Skipped { reason } => {
                self.skipped += 1;
                self.skipped_profiles.push(SkippedProfile {
                    profile_id: profile_id.to_string(),
                    reason,
                });
            }
            ProfileOutcome::Failed(failure) => {
                self.failed += 1;
                self.errors.push(failure);
            }
        }
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = finished_at;
    }

    pub fn status(&self) -> RunStatus {
        if self.enumeration_error.is_some() {
            RunStatus::SearchFailed
        } else if self.failed > 0 {
            RunStatus::CompletedWithFailures
        } else {
            RunStatus::Completed
        }
    }

    pub fn counter_line(&self) -> String {
        format!(
            "attempted={} succeeded={} failed={} skipped={}",
            self.attempted, self.succeeded, self.failed, self.skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression `{expression}`: {message}")]
    InvalidExpression { expression: String, message: String },
    #[error("no upcoming occurrence for cron expression `{0}`")]
    NoOccurrence(String),
}

/// Five fields, or six with a leading seconds field.
pub fn parse_cron(expression: &str) -> Result<Cron, ScheduleError> {
    Cron::new(expression)
        .with_seconds_optional()
        .parse()
        .map_err(|err| ScheduleError::InvalidExpression {
            expression: expression.to_string(),
            message: err.to_string(),
        })
}

/// Next occurrence strictly after `after`.
pub fn next_run_after(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    let cron = parse_cron(expression)?;
    cron.find_next_occurrence(&after, false)
        .map_err(|_| ScheduleError::NoOccurrence(expression.to_string()))
}
