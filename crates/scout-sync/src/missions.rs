use std::path::Path;

use anyhow::{bail, Context, Result};
use scout_core::{parse_cron, Mission, MAX_FIT_SCORE};
use scout_storage::MissionStore;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct MissionFile {
    pub missions: Vec<Mission>,
}

pub fn parse_missions(text: &str) -> Result<Vec<Mission>> {
    let file: MissionFile = serde_yaml::from_str(text).context("parsing missions yaml")?;
    for mission in &file.missions {
        validate_mission(mission)?;
    }
    Ok(file.missions)
}

pub async fn load_missions(path: impl AsRef<Path>) -> Result<Vec<Mission>> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_missions(&text).with_context(|| format!("loading {}", path.display()))
}

pub fn validate_mission(mission: &Mission) -> Result<()> {
    if mission.name.trim().is_empty() {
        bail!("mission name must not be empty");
    }
    if mission.query.trim().is_empty() {
        bail!("mission `{}` has an empty query", mission.name);
    }
    if mission.acceptance_threshold > MAX_FIT_SCORE {
        bail!(
            "mission `{}` threshold {} exceeds {MAX_FIT_SCORE}",
            mission.name,
            mission.acceptance_threshold
        );
    }
    parse_cron(&mission.cron_expression).with_context(|| format!("mission `{}`", mission.name))?;
    Ok(())
}

/// Seeds every mission into the store; scheduling state of existing rows survives.
pub async fn import_missions(store: &dyn MissionStore, missions: &[Mission]) -> Result<usize> {
    for mission in missions {
        store
            .upsert_mission(mission)
            .await
            .with_context(|| format!("storing mission `{}`", mission.name))?;
        info!(mission = %mission.name, cron = %mission.cron_expression, "mission imported");
    }
    Ok(missions.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scout_storage::MemoryMissionStore;
    use std::path::PathBuf;

    #[tokio::test]
    async fn sample_missions_file_imports() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/missions.yaml");
        let missions = load_missions(&path).await.unwrap();
        assert_eq!(missions[0].name, "data-engineer-london");
        assert_eq!(missions[0].location.as_deref(), Some("London"));
        assert!(missions[0].next_run_at.is_none());

        let store = MemoryMissionStore::default();
        assert_eq!(import_missions(&store, &missions).await.unwrap(), 1);
        assert!(store.get("data-engineer-london").await.is_some());
    }

    #[test]
    fn invalid_missions_are_rejected() {
        let bad_cron = "missions:\n  - {name: a, query: q, role_criteria: c, cron_expression: 'every day'}\n";
        assert!(parse_missions(bad_cron).is_err());
        let bad_threshold =
            "missions:\n  - {name: a, query: q, role_criteria: c, cron_expression: '0 6 * * *', acceptance_threshold: 120}\n";
        assert!(parse_missions(bad_threshold).is_err());
        let defaults = "missions:\n  - {name: a, query: q, role_criteria: c, cron_expression: '0 6 * * *'}\n";
        let missions = parse_missions(defaults).unwrap();
        assert_eq!(missions[0].acceptance_threshold, 70);
        assert!(missions[0].enabled);
    }

    #[test]
    fn six_field_cron_is_accepted() {
        let yaml = "missions:\n  - {name: a, query: q, role_criteria: c, cron_expression: '0 30 6 * * 1-5'}\n";
        let missions = parse_missions(yaml).unwrap();
        assert_eq!(missions[0].cron_expression, "0 30 6 * * 1-5");
    }
}
