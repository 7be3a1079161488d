use std::path::PathBuf;

use scout_adapters::{extract_profile, FixtureFetcher, KeywordScorer, ProfileFetcher, Scorer, ScoringRequest};
use scout_core::Recommendation;

const CRITERIA: &str = "Senior data engineer with production experience in Python, SQL, Spark and Airflow, \
                        building batch and streaming pipelines.";

fn bundle_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/data-engineer/bundle.json")
}

#[tokio::test]
async fn data_engineer_fixture_extracts_and_ranks() {
    let fetcher = FixtureFetcher::load(bundle_path()).unwrap();
    assert_eq!(fetcher.fixture_id(), "data-engineer-sample");

    let mut cursor = fetcher.search("Data Engineer", Some("London")).await.unwrap();
    let mut profiles = Vec::new();
    while let Some(page) = cursor.next_page().await.unwrap() {
        for handle in page {
            let mut session = fetcher.open_session().await.unwrap();
            let raw = session.fetch_profile(&handle).await.unwrap();
            session.close().await;
            profiles.push(extract_profile(&raw).unwrap());
        }
    }
    let names = profiles.iter().map(|p| p.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["Ada Lovelace", "Grace Hopper", "Charles Babbage"]);
    assert_eq!(profiles[0].location.as_deref(), Some("London, England, United Kingdom"));
    assert!(profiles[1].section("Skills").is_some());

    let scorer = KeywordScorer::default();
    let request = ScoringRequest {
        role_criteria: CRITERIA.into(),
        query: "Data Engineer".into(),
        location: Some("London".into()),
        exemplars: Vec::new(),
    };
    let mut scores = Vec::new();
    for profile in &profiles {
        scores.push(scorer.score(profile, &request).await.unwrap());
    }
    assert!(scores[0].fit_score >= 70, "ada scored {}", scores[0].fit_score);
    assert_eq!(scores[0].recommendation, Recommendation::Recommend);
    assert!(scores[1].fit_score < 30);
    assert!(scores[2].fit_score < 30);
}
