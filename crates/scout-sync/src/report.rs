use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use scout_core::{Mission, RunSummary};
use tokio::fs;

pub const SUMMARY_FILE: &str = "run_summary.json";
pub const BRIEF_FILE: &str = "run_brief.md";

/// Writes `<root>/<run_id>/run_summary.json` and `run_brief.md`; returns the run directory.
pub async fn write_run_reports(root: &Path, mission: &Mission, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "status": summary.status().as_str(),
        "query": mission.query,
        "location": mission.location,
        "acceptance_threshold": mission.acceptance_threshold,
        "summary": summary,
    }))
    .context("serializing run summary")?;
    fs::write(run_dir.join(SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;

    fs::write(run_dir.join(BRIEF_FILE), render_brief(mission, summary))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;

    Ok(run_dir)
}

pub fn render_brief(mission: &Mission, summary: &RunSummary) -> String {
    let mut out = format!(
        "# Scout Run Brief\n\n- Mission: `{}`\n- Query: {}{}\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Status: {}\n- Counters: {}\n",
        mission.name,
        mission.query,
        mission
            .location
            .as_deref()
            .map(|l| format!(" ({l})"))
            .unwrap_or_default(),
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.status().as_str(),
        summary.counter_line(),
    );
    if let Some(err) = &summary.enumeration_error {
        out.push_str(&format!("- Search stopped early: {err}\n"));
    }

    out.push_str("\n## Failures\n");
    if summary.errors.is_empty() {
        out.push_str("- none\n");
    }
    for failure in &summary.errors {
        out.push_str(&format!("- {}: {} ({})\n", failure.profile_id, failure.stage, failure.reason));
    }

    out.push_str("\n## Skipped\n");
    if summary.skipped_profiles.is_empty() {
        out.push_str("- none\n");
    }
    for skipped in &summary.skipped_profiles {
        out.push_str(&format!("- {}: {}\n", skipped.profile_id, skipped.reason));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scout_core::{FailureStage, ProfileFailure, ProfileOutcome};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn summary() -> RunSummary {
        let mut summary = RunSummary::new(Uuid::new_v4(), "de", Utc::now());
        summary.record("a", ProfileOutcome::Succeeded);
        summary.record(
            "b",
            ProfileOutcome::Failed(ProfileFailure::new("b", FailureStage::ScoreFailed, "quota")),
        );
        summary.finish(Utc::now());
        summary
    }

    #[test]
    fn brief_lists_failures_and_counters() {
        let mission = Mission::new("de", "Data Engineer", "spark", "0 6 * * *");
        let brief = render_brief(&mission, &summary());
        assert!(brief.contains("- Counters: attempted=2 succeeded=1 failed=1 skipped=0"));
        assert!(brief.contains("- b: ScoreFailed (quota)"));
        assert!(brief.contains("## Skipped\n- none"));
    }

    #[tokio::test]
    async fn reports_land_under_run_id() {
        let dir = tempdir().unwrap();
        let mission = Mission::new("de", "Data Engineer", "spark", "0 6 * * *");
        let summary = summary();
        let run_dir = write_run_reports(dir.path(), &mission, &summary).await.unwrap();
        assert_eq!(run_dir, dir.path().join(summary.run_id.to_string()));

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join(SUMMARY_FILE)).unwrap()).unwrap();
        assert_eq!(json["status"], "completed_with_failures");
        assert_eq!(json["summary"]["attempted"], 2);
        assert!(run_dir.join(BRIEF_FILE).exists());
    }
}
