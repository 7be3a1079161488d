use std::sync::Arc;

use anyhow::{Context, Result};
use scout_core::Mission;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::{MissionRequest, Pipeline, RunOutcome};

/// Admits one run at a time within this process.
#[derive(Debug, Clone, Default)]
pub struct RunGate {
    lock: Arc<Mutex<()>>,
}

impl RunGate {
    /// `None` while another run holds the gate.
    pub fn try_enter(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.lock).try_lock_owned().ok()
    }
}

/// The scheduler wants a seconds field; five-field expressions fire at second zero.
pub fn scheduler_expression(cron_expression: &str) -> String {
    let trimmed = cron_expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

pub async fn run_tick(pipeline: &Pipeline, gate: &RunGate, request: &MissionRequest) -> Option<RunOutcome> {
    let Some(_guard) = gate.try_enter() else {
        warn!(mission = ?request.name, "previous run still in progress; skipping tick");
        return None;
    };
    match pipeline.run_mission(request).await {
        Ok(outcome) => Some(outcome),
        Err(err) => {
            error!(error = %err, "scheduled run failed");
            None
        }
    }
}

pub async fn build_scheduler(pipeline: Arc<Pipeline>, mission: &Mission) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let gate = RunGate::default();
    let request = MissionRequest {
        name: Some(mission.name.clone()),
        force: true,
        ..MissionRequest::default()
    };
    let expression = scheduler_expression(&mission.cron_expression);

    let job = Job::new_async(&expression, move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        let gate = gate.clone();
        let request = request.clone();
        Box::pin(async move {
            if let Some(RunOutcome::Completed(summary)) = run_tick(&pipeline, &gate, &request).await {
                info!(run_id = %summary.run_id, counters = %summary.counter_line(), "scheduled run complete");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {expression}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Runs the mission on its cron schedule until Ctrl-C.
pub async fn run_scheduler(pipeline: Arc<Pipeline>, mission: &Mission) -> Result<()> {
    let mut sched = build_scheduler(pipeline, mission).await?;
    sched.start().await.context("starting scheduler")?;
    info!(mission = %mission.name, cron = %mission.cron_expression, "scheduler running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expressions_gain_seconds() {
        assert_eq!(scheduler_expression("0 6 * * *"), "0 0 6 * * *");
        assert_eq!(scheduler_expression("30 0 6 * * *"), "30 0 6 * * *");
    }

    #[tokio::test]
    async fn gate_admits_one_run_at_a_time() {
        let gate = RunGate::default();
        let first = gate.try_enter();
        assert!(first.is_some());
        assert!(gate.clone().try_enter().is_none());
        drop(first);
        assert!(gate.try_enter().is_some());
    }
}
