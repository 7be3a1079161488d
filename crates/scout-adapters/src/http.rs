//! HTTP profile fetcher: search-page pagination, per-profile sessions, rate limiting.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::{StatusCode, Url};
use scout_core::{ContentType, ErrorKind, ExternalError, ProfileHandle, RawProfile};
use scraper::{Html, Selector};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

use crate::{FetchSession, ProfileFetcher, SearchCursor};

pub fn classify_status(status: StatusCode) -> ErrorKind {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ErrorKind::Transient
    } else {
        ErrorKind::Permanent
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ErrorKind::Transient
    } else {
        ErrorKind::Permanent
    }
}

pub(crate) fn external_from_reqwest(context: &str, err: reqwest::Error) -> ExternalError {
    ExternalError {
        kind: classify_reqwest_error(&err),
        message: format!("{context}: {err}"),
    }
}

pub(crate) fn external_from_status(status: StatusCode, url: &str) -> ExternalError {
    ExternalError {
        kind: classify_status(status),
        message: format!("http status {} for {url}", status.as_u16()),
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Single-token bucket spacing requests evenly across a minute.
    pub fn per_minute(requests: u32) -> Self {
        let requests = requests.max(1);
        Self::new(1, Duration::from_secs(60) / requests)
    }

    /// Waits for a token. Unused refill time carries over to the next call.
    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                if self.refill_every.is_zero() {
                    return;
                }
                let elapsed = state.last_refill.elapsed();
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
                if refills > 0 {
                    state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                    state.last_refill += self.refill_every * refills;
                }
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                self.refill_every.saturating_sub(state.last_refill.elapsed())
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Session credential for the networking site. `Debug` never prints the cookie.
#[derive(Clone, Default)]
pub struct FetcherCredentials {
    pub session_cookie: Option<String>,
}

impl fmt::Debug for FetcherCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetcherCredentials")
            .field("session_cookie", &self.session_cookie.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// Search page URL with `{query}`, `{location}` and `{page}` placeholders.
    pub search_url: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub max_search_pages: usize,
    pub requests_per_minute: u32,
    pub credentials: FetcherCredentials,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            search_url: "https://www.linkedin.com/search/results/people/?keywords={query}&location={location}&page={page}"
                .to_string(),
            timeout: Duration::from_secs(20),
            user_agent: "scout-bot/0.1".to_string(),
            max_search_pages: 5,
            requests_per_minute: 20,
            credentials: FetcherCredentials::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpProfileFetcher {
    config: HttpFetcherConfig,
    bucket: Arc<TokenBucket>,
}

impl HttpProfileFetcher {
    pub fn new(config: HttpFetcherConfig) -> Self {
        let bucket = Arc::new(TokenBucket::per_minute(config.requests_per_minute));
        Self { config, bucket }
    }

    fn build_client(&self) -> Result<reqwest::Client, ExternalError> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = &self.config.credentials.session_cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|e| ExternalError::permanent(format!("invalid session cookie header: {e}")))?;
            headers.insert(COOKIE, value);
        }
        reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.config.timeout)
            .user_agent(self.config.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|e| ExternalError::permanent(format!("building http client: {e}")))
    }
}

pub fn search_page_url(template: &str, query: &str, location: Option<&str>, page: usize) -> String {
    let encode = |value: &str| {
        Url::parse_with_params("http://x/", &[("v", value)])
            .ok()
            .and_then(|u| u.query().map(|q| q.trim_start_matches("v=").to_string()))
            .unwrap_or_default()
    };
    template
        .replace("{query}", &encode(query))
        .replace("{location}", &encode(location.unwrap_or_default()))
        .replace("{page}", &page.to_string())
}

/// Canonical profile URL: `/in/<slug>` on the same host, no query, fragment or trailing slash.
pub fn canonical_profile_url(href: &str, base: &Url) -> Option<String> {
    let url = base.join(href).ok()?;
    let host = url.host_str()?;
    let path = url.path();
    if path.contains("/company/") || path.contains("/school/") {
        return None;
    }
    let slug = path.strip_prefix("/in/")?.split('/').next()?;
    if slug.is_empty() {
        return None;
    }
    Some(format!("{}://{}/in/{}", url.scheme(), host, slug))
}

pub fn extract_profile_links(html: &str, base: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let Ok(anchor) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    document
        .select(&anchor)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| canonical_profile_url(href, base))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

struct HttpSearchCursor {
    client: reqwest::Client,
    bucket: Arc<TokenBucket>,
    template: String,
    query: String,
    location: Option<String>,
    next_page: usize,
    max_pages: usize,
    discovered: usize,
    done: bool,
}

#[async_trait]
impl SearchCursor for HttpSearchCursor {
    async fn next_page(&mut self) -> Result<Option<Vec<ProfileHandle>>, ExternalError> {
        if self.done || self.next_page > self.max_pages {
            return Ok(None);
        }
        let url = search_page_url(&self.template, &self.query, self.location.as_deref(), self.next_page);
        let base = Url::parse(&url)
            .map_err(|e| ExternalError::permanent(format!("invalid search url {url}: {e}")))?;

        self.bucket.take().await;
        let resp = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| external_from_reqwest("search request", e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(external_from_status(status, &url));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| external_from_reqwest("reading search page", e))?;

        let links = extract_profile_links(&body, &base);
        debug!(page = self.next_page, links = links.len(), "search page parsed");
        self.next_page += 1;
        if links.is_empty() {
            self.done = true;
            return Ok(None);
        }
        let handles = links
            .into_iter()
            .map(|id| {
                let handle = ProfileHandle::new(id, self.discovered);
                self.discovered += 1;
                handle
            })
            .collect();
        Ok(Some(handles))
    }
}

struct HttpFetchSession {
    client: reqwest::Client,
    bucket: Arc<TokenBucket>,
}

#[async_trait]
impl FetchSession for HttpFetchSession {
    async fn fetch_profile(&mut self, handle: &ProfileHandle) -> Result<RawProfile, ExternalError> {
        let span = info_span!("http_profile_fetch", profile_id = %handle.id);
        async {
            self.bucket.take().await;
            let resp = self
                .client
                .get(handle.id.as_str())
                .send()
                .await
                .map_err(|e| external_from_reqwest("profile request", e))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(external_from_status(status, &handle.id));
            }
            let body = resp
                .text()
                .await
                .map_err(|e| external_from_reqwest("reading profile page", e))?;
            Ok(RawProfile {
                profile_id: handle.id.clone(),
                content_type: ContentType::Html,
                body,
                fetched_at: Utc::now(),
            })
        }
        .instrument(span)
        .await
    }

    async fn close(self: Box<Self>) {
        // Dropping the client discards its connection pool and any per-session state.
        let session = *self;
        drop(session.client);
        debug!("http session closed");
    }
}

#[async_trait]
impl ProfileFetcher for HttpProfileFetcher {
    async fn search(
        &self,
        query: &str,
        location: Option<&str>,
    ) -> Result<Box<dyn SearchCursor>, ExternalError> {
        Ok(Box::new(HttpSearchCursor {
            client: self.build_client()?,
            bucket: Arc::clone(&self.bucket),
            template: self.config.search_url.clone(),
            query: query.to_string(),
            location: location.map(ToString::to_string),
            next_page: 1,
            max_pages: self.config.max_search_pages,
            discovered: 0,
            done: false,
        }))
    }

    async fn open_session(&self) -> Result<Box<dyn FetchSession>, ExternalError> {
        Ok(Box::new(HttpFetchSession {
            client: self.build_client()?,
            bucket: Arc::clone(&self.bucket),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://www.linkedin.com/search/results/people/?keywords=x").unwrap()
    }

    #[test]
    fn status_classification_separates_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), ErrorKind::Transient);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), ErrorKind::Transient);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ErrorKind::Permanent);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ErrorKind::Permanent);
    }

    #[test]
    fn profile_urls_are_canonicalised() {
        let base = base();
        assert_eq!(
            canonical_profile_url("/in/ada-lovelace/?miniProfileUrn=abc#top", &base).as_deref(),
            Some("https://www.linkedin.com/in/ada-lovelace")
        );
        assert_eq!(
            canonical_profile_url("https://www.linkedin.com/in/ada-lovelace/details/experience", &base)
                .as_deref(),
            Some("https://www.linkedin.com/in/ada-lovelace")
        );
        assert_eq!(canonical_profile_url("/company/engines/", &base), None);
        assert_eq!(canonical_profile_url("/school/in/x", &base), None);
        assert_eq!(canonical_profile_url("/feed/", &base), None);
    }

    #[test]
    fn search_links_are_deduplicated_in_page_order() {
        let html = r#"
            <ul>
              <li><a href="/in/b?x=1">B</a></li>
              <li><a href="/in/a">A</a><a href="/in/a/">A again</a></li>
              <li><a href="/company/acme">Acme</a></li>
            </ul>
        "#;
        assert_eq!(
            extract_profile_links(html, &base()),
            vec![
                "https://www.linkedin.com/in/b".to_string(),
                "https://www.linkedin.com/in/a".to_string()
            ]
        );
    }

    #[test]
    fn search_url_encodes_placeholders() {
        let url = search_page_url(
            "https://example.test/s?k={query}&l={location}&p={page}",
            "Data Engineer",
            Some("Berlin & Brandenburg"),
            2,
        );
        assert_eq!(url, "https://example.test/s?k=Data+Engineer&l=Berlin+%26+Brandenburg&p=2");
    }

    #[test]
    fn credentials_debug_redacts_cookie() {
        let creds = FetcherCredentials {
            session_cookie: Some("li_at=secret".into()),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn token_bucket_allows_initial_burst() {
        let bucket = TokenBucket::new(2, Duration::from_secs(60));
        let start = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_waits_out_the_refill_interval() {
        let bucket = TokenBucket::per_minute(30);
        let start = Instant::now();
        bucket.take().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        bucket.take().await;
        // the half second already spent counts toward the two second spacing
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2100), "{elapsed:?}");
    }
}
