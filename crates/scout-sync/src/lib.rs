//! Mission run orchestration: enumerate, then fetch -> extract -> score -> persist one profile at a time.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use scout_adapters::{
    extract_profile, Exemplar, FetchSession, ProfileFetcher, Scorer, ScoringRequest, SearchCursor,
};
use scout_core::{
    parse_cron, CandidateRecord, ExternalError, FailureStage, Mission, NormalizedProfile, ProfileFailure,
    ProfileHandle, ProfileOutcome, RawProfile, RunSummary, ScheduleError, Verdict,
};
use scout_storage::{CandidateStore, MissionStore, StoreError};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod missions;
pub mod report;
pub mod retry;
pub mod schedule;

pub use config::{ScorerKind, ScoutConfig};
pub use retry::RetryPolicy;

pub const CRATE_NAME: &str = "scout-sync";

pub const ALREADY_PERSISTED: &str = "already persisted";

/// Fatal conditions. Everything that happens to a single profile ends up in the `RunSummary` instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("resolving mission: {0}")]
    MissionResolution(#[source] StoreError),
    #[error("mission `{mission}` is not runnable: {source}")]
    InvalidMission {
        mission: String,
        #[source]
        source: ScheduleError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Skip handles whose identifier is already stored, without fetching.
    pub skip_known: bool,
    /// Sleep between profile cycles that reach the fetcher.
    pub profile_pause: Duration,
    /// Number of stored top candidates passed to the scorer as exemplars.
    pub few_shot_examples: usize,
    pub reports_dir: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            skip_known: true,
            profile_pause: Duration::from_secs(2),
            few_shot_examples: 2,
            reports_dir: None,
        }
    }
}

/// What to run. Query and location override the stored mission's for this run only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissionRequest {
    pub name: Option<String>,
    pub query: Option<String>,
    pub location: Option<String>,
    /// Run even when the mission is not due.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunSummary),
    NotDue {
        mission: String,
        next_run_at: Option<DateTime<Utc>>,
    },
}

pub struct Pipeline {
    fetcher: Arc<dyn ProfileFetcher>,
    scorer: Arc<dyn Scorer>,
    candidates: Arc<dyn CandidateStore>,
    missions: Arc<dyn MissionStore>,
    retry: RetryPolicy,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn ProfileFetcher>,
        scorer: Arc<dyn Scorer>,
        candidates: Arc<dyn CandidateStore>,
        missions: Arc<dyn MissionStore>,
    ) -> Self {
        Self {
            fetcher,
            scorer,
            candidates,
            missions,
            retry: RetryPolicy::default(),
            options: PipelineOptions::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// The active mission, with a schedule that parses.
    pub async fn resolve_mission(&self, name: Option<&str>) -> Result<Mission, PipelineError> {
        let mission = self
            .missions
            .active_mission(name)
            .await
            .map_err(PipelineError::MissionResolution)?;
        parse_cron(&mission.cron_expression).map_err(|source| PipelineError::InvalidMission {
            mission: mission.name.clone(),
            source,
        })?;
        Ok(mission)
    }

    /// Resolves the mission, checks it is due, and runs it.
    pub async fn run_mission(&self, request: &MissionRequest) -> Result<RunOutcome, PipelineError> {
        let mut mission = self.resolve_mission(request.name.as_deref()).await?;

        if !request.force && !mission.is_due(Utc::now()) {
            info!(
                mission = %mission.name,
                next_run_at = ?mission.next_run_at,
                "mission not due; use --force to run anyway"
            );
            return Ok(RunOutcome::NotDue {
                mission: mission.name,
                next_run_at: mission.next_run_at,
            });
        }

        if let Some(query) = &request.query {
            mission.query = query.clone();
        }
        if let Some(location) = &request.location {
            mission.location = Some(location.clone());
        }
        Ok(RunOutcome::Completed(self.run(&mission).await))
    }

    /// Drives one mission to completion. Per-profile failures never abort the run.
    pub async fn run(&self, mission: &Mission) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("mission_run", %run_id, mission = %mission.name);
        self.run_inner(run_id, mission).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, mission: &Mission) -> RunSummary {
        let mut summary = RunSummary::new(run_id, &mission.name, Utc::now());
        info!(query = %mission.query, location = ?mission.location, threshold = mission.acceptance_threshold, "mission run started");

        let request = ScoringRequest {
            role_criteria: mission.role_criteria.clone(),
            query: mission.query.clone(),
            location: mission.location.clone(),
            exemplars: self.load_exemplars().await,
        };

        let mut seen: HashSet<String> = HashSet::new();
        let mut fetched_cycles = 0usize;
        match self.open_search(mission).await {
            Ok(mut cursor) => loop {
                let page = match self.next_page(cursor.as_mut(), &mission.name).await {
                    Ok(Some(page)) => page,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, discovered = seen.len(), "search enumeration stopped early");
                        summary.enumeration_error = Some(err.to_string());
                        break;
                    }
                };
                for handle in page {
                    if !seen.insert(handle.id.clone()) {
                        debug!(profile_id = %handle.id, "duplicate handle ignored");
                        continue;
                    }
                    let span = info_span!("profile_cycle", %run_id, profile_id = %handle.id, order = handle.discovery_order);
                    let outcome = self
                        .cycle(mission, &request, &handle, &mut fetched_cycles)
                        .instrument(span)
                        .await;
                    log_outcome(&handle.id, &outcome);
                    summary.record(&handle.id, outcome);
                }
            },
            Err(err) => {
                warn!(error = %err, "search could not be started");
                summary.enumeration_error = Some(err.to_string());
            }
        }

        summary.finish(Utc::now());
        match self
            .missions
            .record_run_completed(&mission.name, summary.finished_at, &summary)
            .await
        {
            Ok(updated) => debug!(next_run_at = ?updated.next_run_at, "mission schedule advanced"),
            Err(err) => error!(error = %err, "recording run completion failed"),
        }

        if let Some(root) = &self.options.reports_dir {
            match report::write_run_reports(root, mission, &summary).await {
                Ok(dir) => info!(reports_dir = %dir.display(), "run reports written"),
                Err(err) => warn!(error = %format!("{err:#}"), "writing run reports failed"),
            }
        }

        info!(
            status = summary.status().as_str(),
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "mission run finished"
        );
        summary
    }

    async fn load_exemplars(&self) -> Vec<Exemplar> {
        if self.options.few_shot_examples == 0 {
            return Vec::new();
        }
        match self.candidates.top_scoring(self.options.few_shot_examples).await {
            Ok(records) => records
                .into_iter()
                .map(|record| Exemplar {
                    profile_text: record.profile.render_text(),
                    verdict: record.verdict,
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, "loading scoring exemplars failed; scoring without them");
                Vec::new()
            }
        }
    }

    async fn open_search(&self, mission: &Mission) -> Result<Box<dyn SearchCursor>, ExternalError> {
        let mut attempts = self.retry.begin("search", &mission.name);
        loop {
            let call = self.fetcher.search(&mission.query, mission.location.as_deref());
            match self.retry.timed("search", call).await {
                Ok(cursor) => return Ok(cursor),
                Err(err) => {
                    if !attempts.backoff(&err).await {
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn next_page(
        &self,
        cursor: &mut dyn SearchCursor,
        mission_name: &str,
    ) -> Result<Option<Vec<ProfileHandle>>, ExternalError> {
        let mut attempts = self.retry.begin("search_page", mission_name);
        loop {
            match self.retry.timed("search_page", cursor.next_page()).await {
                Ok(page) => return Ok(page),
                Err(err) => {
                    if !attempts.backoff(&err).await {
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn cycle(
        &self,
        mission: &Mission,
        request: &ScoringRequest,
        handle: &ProfileHandle,
        fetched_cycles: &mut usize,
    ) -> ProfileOutcome {
        let failed = |stage, reason: &dyn std::fmt::Display| {
            ProfileOutcome::Failed(ProfileFailure::new(&handle.id, stage, reason))
        };

        if self.options.skip_known {
            match self.candidates.contains(&handle.id).await {
                Ok(true) => {
                    return ProfileOutcome::Skipped {
                        reason: ALREADY_PERSISTED.to_string(),
                    }
                }
                Ok(false) => {}
                Err(err) => return failed(FailureStage::PersistFailed, &err),
            }
        }

        if *fetched_cycles > 0 && !self.options.profile_pause.is_zero() {
            tokio::time::sleep(self.options.profile_pause).await;
        }
        *fetched_cycles += 1;

        let raw = match self.fetch(handle).await {
            Ok(raw) => raw,
            Err(err) => return failed(FailureStage::FetchFailed, &err),
        };
        let profile = match extract_profile(&raw) {
            Ok(profile) => profile,
            Err(err) => return failed(FailureStage::ExtractionFailed, &err),
        };
        drop(raw);

        let verdict = match self.score(&profile, request).await {
            Ok(verdict) => verdict,
            Err(err) => return failed(FailureStage::ScoreFailed, &err),
        };
        if !mission.accepts(&verdict) {
            return ProfileOutcome::Skipped {
                reason: format!(
                    "fit_score {} below threshold {}",
                    verdict.fit_score, mission.acceptance_threshold
                ),
            };
        }

        let record = CandidateRecord::new(&mission.name, profile, verdict, Utc::now());
        match self.candidates.upsert(&record).await {
            Ok(outcome) => {
                debug!(?outcome, fit_score = record.verdict.fit_score, "candidate upserted");
                ProfileOutcome::Succeeded
            }
            Err(err) => failed(FailureStage::PersistFailed, &err),
        }
    }

    /// Fresh session per profile; closed on every exit path once a session exists.
    async fn fetch(&self, handle: &ProfileHandle) -> Result<RawProfile, ExternalError> {
        let mut session = self.open_session(handle).await?;
        let mut attempts = self.retry.begin("fetch_profile", &handle.id);
        let result = loop {
            match self.retry.timed("fetch_profile", session.fetch_profile(handle)).await {
                Ok(raw) => break Ok(raw),
                Err(err) => {
                    if !attempts.backoff(&err).await {
                        break Err(err);
                    }
                }
            }
        };
        session.close().await;
        result
    }

    async fn open_session(&self, handle: &ProfileHandle) -> Result<Box<dyn FetchSession>, ExternalError> {
        let mut attempts = self.retry.begin("open_session", &handle.id);
        loop {
            match self.retry.timed("open_session", self.fetcher.open_session()).await {
                Ok(session) => return Ok(session),
                Err(err) => {
                    if !attempts.backoff(&err).await {
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn score(&self, profile: &NormalizedProfile, request: &ScoringRequest) -> Result<Verdict, ExternalError> {
        let mut attempts = self.retry.begin("score", &profile.profile_id);
        loop {
            match self.retry.timed("score", self.scorer.score(profile, request)).await {
                Ok(verdict) => return Ok(verdict),
                Err(err) => {
                    if !attempts.backoff(&err).await {
                        return Err(err);
                    }
                }
            }
        }
    }
}

fn log_outcome(profile_id: &str, outcome: &ProfileOutcome) {
    match outcome {
        ProfileOutcome::Succeeded => info!(profile_id, "candidate accepted"),
        ProfileOutcome::Skipped { reason } => info!(profile_id, reason = %reason, "profile skipped"),
        ProfileOutcome::Failed(failure) => {
            warn!(profile_id, stage = %failure.stage, reason = %failure.reason, "profile failed")
        }
    }
}
