//! Collaborator contracts (fetcher, scorer) plus extraction and concrete adapters.

use async_trait::async_trait;
use scout_core::{ExternalError, NormalizedProfile, ProfileHandle, RawProfile, Verdict};

pub mod extract;
pub mod fixture;
pub mod http;
pub mod keyword;
pub mod llm;

pub use extract::{extract_profile, ExtractError};
pub use fixture::FixtureFetcher;
pub use http::{FetcherCredentials, HttpFetcherConfig, HttpProfileFetcher, TokenBucket};
pub use keyword::KeywordScorer;
pub use llm::{LlmScorer, LlmScorerConfig, ScorerCredentials};

pub const CRATE_NAME: &str = "scout-adapters";

/// Discovers profiles and hands out per-profile sessions.
#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    /// Starts a lazy, finite enumeration of search results.
    async fn search(
        &self,
        query: &str,
        location: Option<&str>,
    ) -> Result<Box<dyn SearchCursor>, ExternalError>;

    /// A fresh session. Nothing from a previous session may be visible through it.
    async fn open_session(&self) -> Result<Box<dyn FetchSession>, ExternalError>;
}

#[async_trait]
pub trait SearchCursor: Send {
    /// `Ok(None)` ends the enumeration. A failed call leaves the cursor on the same page.
    async fn next_page(&mut self) -> Result<Option<Vec<ProfileHandle>>, ExternalError>;
}

#[async_trait]
pub trait FetchSession: Send {
    async fn fetch_profile(&mut self, handle: &ProfileHandle) -> Result<RawProfile, ExternalError>;

    async fn close(self: Box<Self>);
}

/// A previously accepted candidate shown to the scorer as a calibration example.
#[derive(Debug, Clone, PartialEq)]
pub struct Exemplar {
    pub profile_text: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringRequest {
    pub role_criteria: String,
    pub query: String,
    pub location: Option<String>,
    pub exemplars: Vec<Exemplar>,
}

#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn score(
        &self,
        profile: &NormalizedProfile,
        request: &ScoringRequest,
    ) -> Result<Verdict, ExternalError>;
}
