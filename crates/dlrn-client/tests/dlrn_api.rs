use std::time::Duration;

use dlrn_client::{DlrnClient, DlrnClientConfig};
use mockito::{Matcher, Server};
use promoter_core::{BuildHash, DlrnApi, HashParams, PromoterError};
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const AUTH: &str = "Basic Y2l1c2VyOnNlY3JldA==";
const COMMIT: &str = "90633a3785687ddf3d37c0f86f9ad9f93926d639";
const DISTRO: &str = "d68290fed3d9aa069c95fc16d0d481084adbadc6";
const OLD_COMMIT: &str = "17234e9ab9dfab4cf5600f67f1d24db5064f1025";
const OLD_DISTRO: &str = "024e24f0cf4366c2290c22f24e42de714d1addd1";
const AGGREGATE: &str = "26b9d4d1d8fd09cdc2b11c7dd0f71f93";

fn client(url: &str) -> DlrnClient {
    DlrnClient::new(DlrnClientConfig {
        api_url: url.to_string(),
        repo_url: url.to_string(),
        username: "ciuser".to_string(),
        password: "secret".to_string(),
        timeout: Duration::from_secs(5),
    })
    .expect("client")
}

fn hash(commit: &str, distro: &str, timestamp: i64) -> BuildHash {
    BuildHash::from_source(&HashParams {
        commit_hash: Some(commit.to_string()),
        distro_hash: Some(distro.to_string()),
        timestamp: Some(timestamp),
        ..Default::default()
    })
    .expect("valid hash")
}

fn record(commit: &str, distro: &str, label: &str, timestamp: i64) -> serde_json::Value {
    json!({
        "commit_hash": commit,
        "distro_hash": distro,
        "extended_hash": null,
        "aggregate_hash": null,
        "promote_name": label,
        "timestamp": timestamp,
        "user": "ciuser",
    })
}

// ---------------------------------------------------------------------------
// Read endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fetch_promotions_filters_by_label_and_collapses_duplicates() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/promotions")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("promote_name".into(), "tripleo-ci-testing".into()),
            Matcher::UrlEncoded("limit".into(), "10".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!([
                record(COMMIT, DISTRO, "tripleo-ci-testing", 20),
                record(COMMIT, DISTRO, "tripleo-ci-testing", 15),
                record(OLD_COMMIT, OLD_DISTRO, "tripleo-ci-testing", 10),
            ])
            .to_string(),
        )
        .create_async()
        .await;

    let hashes = client(&server.url())
        .fetch_promotions("tripleo-ci-testing", Some(10))
        .await
        .expect("promotions");

    mock.assert_async().await;
    assert_eq!(hashes.len(), 2);
    assert_eq!(hashes[0], hash(COMMIT, DISTRO, 20));
    assert_eq!(hashes[1], hash(OLD_COMMIT, OLD_DISTRO, 10));
}

#[tokio::test]
async fn malformed_promotion_records_are_skipped() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/promotions")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!([
                record("not-hex", DISTRO, "tripleo-ci-testing", 20),
                record(OLD_COMMIT, OLD_DISTRO, "tripleo-ci-testing", 10),
            ])
            .to_string(),
        )
        .create_async()
        .await;

    let hashes = client(&server.url())
        .fetch_promotions("tripleo-ci-testing", Some(10))
        .await
        .expect("valid records survive");

    assert_eq!(hashes, vec![hash(OLD_COMMIT, OLD_DISTRO, 10)]);
}

#[tokio::test]
async fn fetch_promotions_from_hash_queries_by_identity() {
    let extended = format!("{OLD_DISTRO}_{OLD_COMMIT}");
    let entry = |label: &str, timestamp: i64| {
        json!({
            "commit_hash": COMMIT,
            "distro_hash": DISTRO,
            "extended_hash": extended,
            "aggregate_hash": null,
            "promote_name": label,
            "timestamp": timestamp,
            "user": "ciuser",
        })
    };
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/promotions")
        .match_query(Matcher::Exact(format!(
            "commit_hash={COMMIT}&distro_hash={DISTRO}&extended_hash={extended}&limit=5"
        )))
        .with_status(200)
        .with_body(json!([entry("current-tripleo", 30), entry("tripleo-ci-testing", 20)]).to_string())
        .create_async()
        .await;
    let wanted = BuildHash::from_source(&HashParams {
        commit_hash: Some(COMMIT.to_string()),
        distro_hash: Some(DISTRO.to_string()),
        extended_hash: Some(extended.clone()),
        ..Default::default()
    })
    .unwrap();

    let hashes = client(&server.url())
        .fetch_promotions_from_hash(&wanted, Some(5))
        .await
        .expect("promotions");

    mock.assert_async().await;
    assert_eq!(hashes.len(), 1);
    assert!(hashes[0].same_identity(&wanted));
    assert_eq!(hashes[0].timestamp(), Some(30));
}

#[tokio::test]
async fn fetch_promotions_from_aggregate_sends_only_aggregate_hash() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/promotions")
        .match_query(Matcher::Exact(format!("aggregate_hash={AGGREGATE}")))
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;
    let aggregate = BuildHash::from_source(&HashParams {
        aggregate_hash: Some(AGGREGATE.to_string()),
        commit_hash: Some(COMMIT.to_string()),
        distro_hash: Some(DISTRO.to_string()),
        ..Default::default()
    })
    .unwrap();

    let hashes = client(&server.url())
        .fetch_promotions_from_hash(&aggregate, None)
        .await
        .expect("promotions");

    mock.assert_async().await;
    assert!(hashes.is_empty());
}

#[tokio::test]
async fn fetch_current_of_unknown_label_is_none() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/promotions")
        .match_query(Matcher::UrlEncoded("limit".into(), "1".into()))
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;

    let current = client(&server.url())
        .fetch_current("current-tripleo")
        .await
        .expect("query");
    assert!(current.is_none());
}

#[tokio::test]
async fn fetch_jobs_uses_repo_status_for_commit_distro() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/repo_status")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("commit_hash".into(), COMMIT.into()),
            Matcher::UrlEncoded("distro_hash".into(), DISTRO.into()),
            Matcher::UrlEncoded("success".into(), "true".into()),
        ]))
        .with_status(200)
        .with_body(
            json!([
                {"job_id": "job1", "success": true, "timestamp": 1, "url": "https://logs/job1", "notes": ""},
                {"job_id": "job2", "success": true, "timestamp": 2, "url": "https://logs/job2", "notes": ""},
            ])
            .to_string(),
        )
        .create_async()
        .await;

    let jobs = client(&server.url())
        .fetch_jobs(&hash(COMMIT, DISTRO, 1))
        .await
        .expect("jobs");

    mock.assert_async().await;
    assert_eq!(jobs, vec!["job1".to_string(), "job2".to_string()]);
}

#[tokio::test]
async fn fetch_jobs_uses_agg_status_for_aggregates() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/agg_status")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("aggregate_hash".into(), AGGREGATE.into()),
            Matcher::UrlEncoded("success".into(), "true".into()),
        ]))
        .with_status(200)
        .with_body(json!([{"job_id": "job1", "success": true, "timestamp": 1}]).to_string())
        .create_async()
        .await;
    let aggregate = BuildHash::from_source(&HashParams {
        aggregate_hash: Some(AGGREGATE.to_string()),
        commit_hash: Some(COMMIT.to_string()),
        distro_hash: Some(DISTRO.to_string()),
        ..Default::default()
    })
    .unwrap();

    let jobs = client(&server.url()).fetch_jobs(&aggregate).await.expect("jobs");

    mock.assert_async().await;
    assert_eq!(jobs, vec!["job1".to_string()]);
}

#[tokio::test]
async fn api_errors_surface_status_and_message() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/promotions")
        .match_query(Matcher::Any)
        .with_status(500)
        .with_body(r#"{"message": "database is locked"}"#)
        .create_async()
        .await;

    let err = client(&server.url())
        .fetch_promotions("current-tripleo", None)
        .await
        .unwrap_err();

    match err {
        PromoterError::Upstream { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "database is locked");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Write endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn promote_moves_incumbent_to_previous_label_first() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/promotions")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("promote_name".into(), "current-tripleo".into()),
            Matcher::UrlEncoded("limit".into(), "1".into()),
        ]))
        .with_status(200)
        .with_body(json!([record(OLD_COMMIT, OLD_DISTRO, "current-tripleo", 5)]).to_string())
        .create_async()
        .await;
    let previous = server
        .mock("POST", "/api/promotions")
        .match_header("authorization", AUTH)
        .match_body(Matcher::PartialJson(json!({
            "commit_hash": OLD_COMMIT,
            "promote_name": "previous-current-tripleo",
        })))
        .with_status(201)
        .with_body(record(OLD_COMMIT, OLD_DISTRO, "previous-current-tripleo", 30).to_string())
        .create_async()
        .await;
    let target = server
        .mock("POST", "/api/promotions")
        .match_header("authorization", AUTH)
        .match_body(Matcher::PartialJson(json!({
            "commit_hash": COMMIT,
            "distro_hash": DISTRO,
            "promote_name": "current-tripleo",
        })))
        .with_status(201)
        .with_body(record(COMMIT, DISTRO, "current-tripleo", 31).to_string())
        .create_async()
        .await;

    let promoted = client(&server.url())
        .promote(
            &hash(COMMIT, DISTRO, 20),
            "current-tripleo",
            Some("tripleo-ci-testing"),
            true,
        )
        .await
        .expect("promotion");

    previous.assert_async().await;
    target.assert_async().await;
    assert!(promoted.hash.same_identity(&hash(COMMIT, DISTRO, 20)));
    assert!(promoted
        .previous
        .expect("previous hash")
        .same_identity(&hash(OLD_COMMIT, OLD_DISTRO, 5)));
}

#[tokio::test]
async fn promote_refuses_current_promotee() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/promotions")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!([record(COMMIT, DISTRO, "current-tripleo", 5)]).to_string())
        .create_async()
        .await;
    let writes = server
        .mock("POST", "/api/promotions")
        .expect(0)
        .create_async()
        .await;

    let err = client(&server.url())
        .promote(&hash(COMMIT, DISTRO, 20), "current-tripleo", None, true)
        .await
        .unwrap_err();

    writes.assert_async().await;
    assert!(matches!(err, PromoterError::AlreadyPromoted { .. }));
}

#[tokio::test]
async fn response_mismatch_is_not_fatal() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/api/promotions")
        .with_status(201)
        .with_body(record(OLD_COMMIT, OLD_DISTRO, "current-tripleo", 31).to_string())
        .create_async()
        .await;

    let promoted = client(&server.url())
        .promote_one(&hash(COMMIT, DISTRO, 20), "current-tripleo", None)
        .await
        .expect("mismatch only logged");
    assert_eq!(promoted.commit_hash(), OLD_COMMIT);
}

#[tokio::test]
async fn aggregate_promotion_submits_components_oldest_first() {
    let mut server = Server::new_async().await;
    let url = server.url();
    let c1 = ("1a2b3c4d5e6f708192a3b4c5d6e7f80912345678", "a1b2c3d4e5f60718293a4b5c6d7e8f9012345678");
    let c2 = ("2b3c4d5e6f708192a3b4c5d6e7f8091234567890", "b2c3d4e5f60718293a4b5c6d7e8f901234567890");

    // component2 is listed first but was built last.
    let repo = format!(
        "[delorean-component-component2]\nname=component2\nbaseurl={url}/component/component2/\nenabled=1\n\n\
         [delorean-component-component1]\nname=component1\nbaseurl={url}/component/component1\nenabled=1\n"
    );
    let index_path = format!("/tripleo-ci-testing/26/b9/{AGGREGATE}/delorean.repo");
    server
        .mock("GET", index_path.as_str())
        .with_status(200)
        .with_body(repo)
        .create_async()
        .await;
    for (name, (commit, distro), dt_commit) in [("component1", c1, "1.0"), ("component2", c2, "2.0")] {
        let path = format!("/component/{name}/commit.yaml");
        server
            .mock("GET", path.as_str())
            .with_status(200)
            .with_body(format!(
                "commits:\n- commit_hash: {commit}\n  distro_hash: {distro}\n  component: {name}\n  dt_commit: '{dt_commit}'\n  extended_hash: None\n"
            ))
            .create_async()
            .await;
    }
    let batch = server
        .mock("POST", "/api/promotions_batch")
        .match_header("authorization", AUTH)
        .match_body(Matcher::Json(json!([
            {"commit_hash": c1.0, "distro_hash": c1.1, "promote_name": "current-tripleo"},
            {"commit_hash": c2.0, "distro_hash": c2.1, "promote_name": "current-tripleo"},
        ])))
        .with_status(201)
        .with_body(
            json!({
                "aggregate_hash": AGGREGATE,
                "commit_hash": c2.0,
                "distro_hash": c2.1,
                "promote_name": "current-tripleo",
                "timestamp": 1700000000,
                "user": "ciuser",
            })
            .to_string(),
        )
        .create_async()
        .await;

    let aggregate = BuildHash::from_source(&HashParams {
        aggregate_hash: Some(AGGREGATE.to_string()),
        commit_hash: Some(c2.0.to_string()),
        distro_hash: Some(c2.1.to_string()),
        timestamp: Some(2),
        ..Default::default()
    })
    .unwrap()
    .with_label("tripleo-ci-testing");

    let promoted = client(&url)
        .promote_one(&aggregate, "current-tripleo", Some("tripleo-ci-testing"))
        .await
        .expect("aggregate promotion");

    batch.assert_async().await;
    assert!(promoted.is_aggregate());
    assert_eq!(promoted.aggregate_hash(), Some(AGGREGATE));
}

#[tokio::test]
async fn empty_aggregate_repo_is_a_promotion_error() {
    let mut server = Server::new_async().await;
    let index_path = format!("/tripleo-ci-testing/26/b9/{AGGREGATE}/delorean.repo");
    server
        .mock("GET", index_path.as_str())
        .with_status(200)
        .with_body("")
        .create_async()
        .await;
    let aggregate = BuildHash::from_source(&HashParams {
        aggregate_hash: Some(AGGREGATE.to_string()),
        commit_hash: Some(COMMIT.to_string()),
        distro_hash: Some(DISTRO.to_string()),
        ..Default::default()
    })
    .unwrap()
    .with_label("tripleo-ci-testing");

    let err = client(&server.url())
        .promote_one(&aggregate, "current-tripleo", Some("tripleo-ci-testing"))
        .await
        .unwrap_err();

    assert!(matches!(err, PromoterError::Promotion(m) if m == "DLRN aggregate repo is empty"));
}

#[tokio::test]
async fn vote_reports_result_and_rejects_empty_answer() {
    let mut server = Server::new_async().await;
    let ok = server
        .mock("POST", "/api/report_result")
        .match_header("authorization", AUTH)
        .match_body(Matcher::PartialJson(json!({"job_id": "job1", "success": true})))
        .with_status(201)
        .with_body(json!({"job_id": "job1", "success": true, "timestamp": 1, "url": "https://logs/job1"}).to_string())
        .create_async()
        .await;
    server
        .mock("POST", "/api/report_result")
        .match_body(Matcher::PartialJson(json!({"job_id": "job2"})))
        .with_status(201)
        .with_body("")
        .create_async()
        .await;
    let dlrn = client(&server.url());
    let candidate = hash(COMMIT, DISTRO, 1);

    let vote = dlrn
        .vote(&candidate, "job1", "https://logs/job1", true)
        .await
        .expect("vote recorded");
    ok.assert_async().await;
    assert!(vote.success);

    let err = dlrn
        .vote(&candidate, "job2", "https://logs/job2", true)
        .await
        .unwrap_err();
    assert!(matches!(err, PromoterError::Promotion(_)));
}
