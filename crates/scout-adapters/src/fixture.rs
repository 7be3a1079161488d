//! Fixture-backed fetcher: serves search pages and profile bodies from a JSON bundle on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scout_core::{ContentType, ExternalError, ProfileHandle, RawProfile};
use serde::Deserialize;
use tracing::debug;

use crate::{FetchSession, ProfileFetcher, SearchCursor};

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub captured_at: DateTime<Utc>,
    /// Search result pages, each a list of profile identifiers.
    pub pages: Vec<Vec<String>>,
    pub profiles: BTreeMap<String, FixtureProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureProfile {
    pub content_type: ContentType,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub inline_text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    bundle: Arc<FixtureBundle>,
}

impl FixtureFetcher {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut bundle: FixtureBundle =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        hydrate_profile_bodies(path, &mut bundle)?;
        Ok(Self::from_bundle(bundle))
    }

    pub fn from_bundle(bundle: FixtureBundle) -> Self {
        Self {
            bundle: Arc::new(bundle),
        }
    }

    pub fn fixture_id(&self) -> &str {
        &self.bundle.fixture_id
    }
}

fn hydrate_profile_bodies(bundle_path: &Path, bundle: &mut FixtureBundle) -> Result<()> {
    let base = bundle_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    for (id, profile) in bundle.profiles.iter_mut() {
        if profile.inline_text.is_some() {
            continue;
        }
        let Some(rel_path) = &profile.path else {
            continue;
        };
        let raw_path = base.join(rel_path);
        let text = fs::read_to_string(&raw_path)
            .with_context(|| format!("reading fixture body for {id} at {}", raw_path.display()))?;
        profile.inline_text = Some(text);
    }
    Ok(())
}

struct FixtureCursor {
    bundle: Arc<FixtureBundle>,
    page: usize,
    discovered: usize,
}

#[async_trait]
impl SearchCursor for FixtureCursor {
    async fn next_page(&mut self) -> Result<Option<Vec<ProfileHandle>>, ExternalError> {
        let Some(ids) = self.bundle.pages.get(self.page) else {
            return Ok(None);
        };
        self.page += 1;
        let handles = ids
            .iter()
            .map(|id| {
                let handle = ProfileHandle::new(id.clone(), self.discovered);
                self.discovered += 1;
                handle
            })
            .collect();
        Ok(Some(handles))
    }
}

struct FixtureSession {
    bundle: Arc<FixtureBundle>,
}

#[async_trait]
impl FetchSession for FixtureSession {
    async fn fetch_profile(&mut self, handle: &ProfileHandle) -> Result<RawProfile, ExternalError> {
        let profile = self
            .bundle
            .profiles
            .get(&handle.id)
            .ok_or_else(|| ExternalError::permanent(format!("profile {} not in fixture", handle.id)))?;
        let body = profile
            .inline_text
            .clone()
            .ok_or_else(|| ExternalError::permanent(format!("fixture profile {} has no body", handle.id)))?;
        Ok(RawProfile {
            profile_id: handle.id.clone(),
            content_type: profile.content_type,
            body,
            fetched_at: self.bundle.captured_at,
        })
    }

    async fn close(self: Box<Self>) {}
}

#[async_trait]
impl ProfileFetcher for FixtureFetcher {
    async fn search(
        &self,
        query: &str,
        location: Option<&str>,
    ) -> Result<Box<dyn SearchCursor>, ExternalError> {
        debug!(fixture_id = %self.bundle.fixture_id, query, ?location, "serving search from fixture");
        Ok(Box::new(FixtureCursor {
            bundle: Arc::clone(&self.bundle),
            page: 0,
            discovered: 0,
        }))
    }

    async fn open_session(&self) -> Result<Box<dyn FetchSession>, ExternalError> {
        Ok(Box::new(FixtureSession {
            bundle: Arc::clone(&self.bundle),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract_profile;
    use tempfile::tempdir;

    fn sample_bundle_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/data-engineer/bundle.json")
    }

    #[tokio::test]
    async fn sample_fixture_pages_and_profiles_are_served() {
        let fetcher = FixtureFetcher::load(sample_bundle_path()).unwrap();
        let mut cursor = fetcher.search("Data Engineer", None).await.unwrap();
        let mut handles = Vec::new();
        while let Some(page) = cursor.next_page().await.unwrap() {
            handles.extend(page);
        }
        assert_eq!(handles.len(), 3);
        assert_eq!(handles[2].discovery_order, 2);

        let mut session = fetcher.open_session().await.unwrap();
        for handle in &handles {
            let raw = session.fetch_profile(handle).await.unwrap();
            assert!(extract_profile(&raw).is_ok(), "fixture {} should extract", handle.id);
        }
        session.close().await;
    }

    #[tokio::test]
    async fn unknown_profile_is_a_permanent_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        std::fs::write(&path, r#"{"fixture_id":"t","captured_at":"2026-03-02T06:00:00Z","pages":[["x"]],"profiles":{}}"#)
            .unwrap();
        let fetcher = FixtureFetcher::load(&path).unwrap();
        let mut session = fetcher.open_session().await.unwrap();
        let err = session.fetch_profile(&ProfileHandle::new("x", 0)).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn missing_body_file_fails_loading() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        std::fs::write(
            &path,
            r#"{"fixture_id":"t","captured_at":"2026-03-02T06:00:00Z","pages":[],
                "profiles":{"x":{"content_type":"html","path":"missing.html"}}}"#,
        )
        .unwrap();
        assert!(FixtureFetcher::load(&path).is_err());
    }
}
