//! LLM scorer over an OpenAI-compatible chat-completions endpoint, with schema validation of the verdict.

use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use scout_core::{ExternalError, NormalizedProfile, Recommendation, Verdict, MAX_FIT_SCORE};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, info_span, Instrument};

use crate::http::{external_from_reqwest, external_from_status};
use crate::{Scorer, ScoringRequest};

/// `Debug` never prints the key.
#[derive(Clone, Default)]
pub struct ScorerCredentials {
    pub api_key: String,
}

impl fmt::Debug for ScorerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScorerCredentials")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LlmScorerConfig {
    pub api_base: String,
    pub model: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub credentials: ScorerCredentials,
}

impl Default for LlmScorerConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(60),
            user_agent: "scout-bot/0.1".to_string(),
            credentials: ScorerCredentials::default(),
        }
    }
}

pub struct LlmScorer {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl LlmScorer {
    pub fn new(config: LlmScorerConfig) -> Result<Self> {
        if config.credentials.api_key.trim().is_empty() {
            bail!("LLM scorer requires an API key (SCOUT_LLM_API_KEY)");
        }
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.timeout)
            .build()
            .context("building LLM http client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            model: config.model,
            api_key: config.credentials.api_key,
        })
    }
}

const SYSTEM_PROMPT: &str = "You are an expert technical recruiter. You assess how well a candidate profile \
fits a role and answer with a single JSON object and nothing else.";

pub fn build_prompt(profile: &NormalizedProfile, request: &ScoringRequest) -> String {
    let mut prompt = String::new();
    prompt.push_str("Evaluation criteria\n");
    prompt.push_str(&format!("- Search query: {}\n", request.query));
    prompt.push_str(&format!(
        "- Location: {}\n",
        request.location.as_deref().unwrap_or("any")
    ));
    prompt.push_str(&format!("- Role criteria: {}\n", request.role_criteria.trim()));

    if !request.exemplars.is_empty() {
        prompt.push_str("\nExamples of high-quality analyses\n");
        for (i, example) in request.exemplars.iter().enumerate() {
            prompt.push_str(&format!(
                "\n--- Example {} (fit_score {}) ---\nProfile:\n{}\nAnalysis:\n{}\n",
                i + 1,
                example.verdict.fit_score,
                example.profile_text,
                verdict_json(&example.verdict)
            ));
        }
        prompt.push_str("--- End of examples ---\n");
    }

    prompt.push_str("\nCandidate profile\n");
    prompt.push_str(&profile.render_text());
    prompt.push_str(&format!(
        "\n\nRespond with JSON: {{\"fit_score\": integer 0-{MAX_FIT_SCORE}, \"rationale\": string, \
         \"summary\": string, \"recommendation\": \"recommend\" | \"do_not_recommend\", \
         \"attributes\": object of extracted facts (years_experience, skills, seniority, ...)}}\n"
    ));
    prompt
}

fn verdict_json(verdict: &Verdict) -> String {
    serde_json::json!({
        "fit_score": verdict.fit_score,
        "rationale": verdict.rationale,
        "summary": verdict.summary,
        "recommendation": verdict.recommendation.as_str(),
        "attributes": verdict.attributes,
    })
    .to_string()
}

#[derive(Debug, Deserialize)]
struct VerdictPayload {
    fit_score: i64,
    rationale: String,
    summary: String,
    recommendation: String,
    #[serde(default)]
    attributes: JsonMap<String, JsonValue>,
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Schema check on the model output. Every violation is permanent: retrying the same prompt is not expected to fix it.
pub fn parse_verdict(content: &str) -> Result<Verdict, ExternalError> {
    let payload: VerdictPayload = serde_json::from_str(strip_code_fence(content))
        .map_err(|e| ExternalError::permanent(format!("verdict does not match schema: {e}")))?;
    let fit_score = Verdict::checked_score(payload.fit_score).ok_or_else(|| {
        ExternalError::permanent(format!(
            "fit_score {} outside 0..={MAX_FIT_SCORE}",
            payload.fit_score
        ))
    })?;
    let recommendation = Recommendation::parse(&payload.recommendation).ok_or_else(|| {
        ExternalError::permanent(format!("unknown recommendation `{}`", payload.recommendation))
    })?;
    if payload.rationale.trim().is_empty() {
        return Err(ExternalError::permanent("verdict rationale is empty"));
    }
    Ok(Verdict {
        fit_score,
        rationale: payload.rationale.trim().to_string(),
        summary: payload.summary.trim().to_string(),
        recommendation,
        attributes: payload.attributes,
    })
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct Req<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct Resp {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMsg {
    #[serde(default)]
    content: Option<String>,
}

fn content_from_response(resp: Resp) -> Result<String, ExternalError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ExternalError::permanent("completion has no choices"))?;
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(ExternalError::permanent("completion rejected by content policy"));
    }
    choice
        .message
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ExternalError::permanent("completion has empty content"))
}

#[async_trait]
impl Scorer for LlmScorer {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn score(
        &self,
        profile: &NormalizedProfile,
        request: &ScoringRequest,
    ) -> Result<Verdict, ExternalError> {
        let span = info_span!("llm_score", profile_id = %profile.profile_id, model = %self.model);
        async {
            let prompt = build_prompt(profile, request);
            let req = Req {
                model: &self.model,
                messages: vec![
                    Msg {
                        role: "system",
                        content: SYSTEM_PROMPT,
                    },
                    Msg {
                        role: "user",
                        content: &prompt,
                    },
                ],
                temperature: 0.0,
                response_format: ResponseFormat { kind: "json_object" },
            };

            let resp = self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&req)
                .send()
                .await
                .map_err(|e| external_from_reqwest("scoring request", e))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(external_from_status(status, &self.endpoint));
            }
            // A body that stops arriving is a transport failure; only a complete body can be malformed.
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| ExternalError::transient(format!("reading completion body: {e}")))?;
            let body: Resp = serde_json::from_slice(&bytes)
                .map_err(|e| ExternalError::permanent(format!("malformed completion body: {e}")))?;
            let content = content_from_response(body)?;
            debug!(chars = content.len(), "completion received");
            parse_verdict(&content)
        }
        .instrument(span)
        .await
    }
}
