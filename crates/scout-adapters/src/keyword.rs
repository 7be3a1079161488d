//! Deterministic offline scorer: fraction of role-criteria terms found in the profile text.

use std::collections::BTreeSet;

use async_trait::async_trait;
use scout_core::{ExternalError, NormalizedProfile, Recommendation, Verdict, MAX_FIT_SCORE};
use serde_json::{json, Map as JsonMap};

use crate::{Scorer, ScoringRequest};

const STOPWORDS: &[&str] = &[
    "and", "the", "for", "with", "from", "into", "are", "was", "has", "have", "who", "that", "this",
    "our", "you", "your", "years", "year", "experience", "plus", "not", "any", "all", "etc",
];

#[derive(Debug, Clone, Copy)]
pub struct KeywordScorer {
    pub recommend_at: u8,
}

impl Default for KeywordScorer {
    fn default() -> Self {
        Self {
            recommend_at: scout_core::DEFAULT_ACCEPTANCE_THRESHOLD,
        }
    }
}

fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .collect()
}

impl KeywordScorer {
    pub fn verdict_for(&self, profile: &NormalizedProfile, role_criteria: &str) -> Verdict {
        let wanted = terms(role_criteria);
        let present = terms(&profile.render_text());
        let matched = wanted.intersection(&present).cloned().collect::<Vec<_>>();
        let missing = wanted.difference(&present).cloned().collect::<Vec<_>>();

        let fit_score = if wanted.is_empty() {
            0
        } else {
            let ratio = matched.len() as f64 / wanted.len() as f64;
            (ratio * f64::from(MAX_FIT_SCORE)).round() as u8
        };
        let recommendation = if fit_score >= self.recommend_at {
            Recommendation::Recommend
        } else {
            Recommendation::DoNotRecommend
        };
        let rationale = if matched.is_empty() {
            "no role criteria terms found in profile".to_string()
        } else {
            format!("matched {}/{} terms: {}", matched.len(), wanted.len(), matched.join(", "))
        };

        let mut attributes = JsonMap::new();
        attributes.insert("matched_terms".into(), json!(matched));
        attributes.insert("missing_terms".into(), json!(missing));

        Verdict {
            fit_score,
            rationale,
            summary: profile
                .headline
                .clone()
                .unwrap_or_else(|| profile.name.clone()),
            recommendation,
            attributes,
        }
    }
}

#[async_trait]
impl Scorer for KeywordScorer {
    fn name(&self) -> &'static str {
        "keyword"
    }

    async fn score(
        &self,
        profile: &NormalizedProfile,
        request: &ScoringRequest,
    ) -> Result<Verdict, ExternalError> {
        Ok(self.verdict_for(profile, &request.role_criteria))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scout_core::ProfileSection;

    fn profile(experience: &str) -> NormalizedProfile {
        NormalizedProfile {
            profile_id: "p".into(),
            name: "Ada Lovelace".into(),
            headline: Some("Data Engineer".into()),
            location: None,
            sections: vec![ProfileSection {
                title: "Experience".into(),
                body: experience.into(),
            }],
        }
    }

    #[test]
    fn criteria_terms_skip_short_words_and_stopwords() {
        let got = terms("5+ years experience with Python, SQL and dbt");
        let want = ["dbt", "python", "sql"].map(String::from).into_iter().collect::<BTreeSet<_>>();
        assert_eq!(got, want);
    }

    #[test]
    fn score_is_fraction_of_matched_terms() {
        let scorer = KeywordScorer::default();
        let verdict = scorer.verdict_for(&profile("Built Spark jobs in Python"), "Python Spark Airflow Kafka");
        assert_eq!(verdict.fit_score, 50);
        assert_eq!(verdict.recommendation, Recommendation::DoNotRecommend);
        assert_eq!(verdict.rationale, "matched 2/4 terms: python, spark");
        assert_eq!(verdict.attributes["missing_terms"], json!(["airflow", "kafka"]));
    }

    #[tokio::test]
    async fn full_match_recommends() {
        let scorer = KeywordScorer { recommend_at: 70 };
        let request = ScoringRequest {
            role_criteria: "data engineer airflow".into(),
            query: "Data Engineer".into(),
            location: None,
            exemplars: Vec::new(),
        };
        let verdict = scorer.score(&profile("Airflow DAGs"), &request).await.unwrap();
        assert_eq!(verdict.fit_score, 100);
        assert_eq!(verdict.recommendation, Recommendation::Recommend);
        assert_eq!(verdict.summary, "Data Engineer");
    }

    #[test]
    fn empty_criteria_scores_zero() {
        let verdict = KeywordScorer::default().verdict_for(&profile("anything"), "a an of");
        assert_eq!(verdict.fit_score, 0);
    }
}
