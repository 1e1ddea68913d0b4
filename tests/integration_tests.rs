//! Integration tests using wiremock to simulate the control plane.

use async_trait::async_trait;
use cplane::{
    AccessToken, Client, Error, Job, JobHandle, PolicyClient, Request, RetryStrategy, SortOrder,
    TokenSource, TransportStage,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Deserialize, PartialEq)]
struct App {
    guid: String,
    name: String,
}

const INVALID_TOKEN: &str =
    r#"{"errors":[{"code":1000,"title":"CF-InvalidAuthToken","detail":"Invalid Auth Token"}]}"#;

fn client(server: &MockServer) -> Client {
    Client::builder()
        .base_url(server.uri())
        .unwrap()
        .build()
        .unwrap()
}

/// Hands out "stale" first and "fresh" on every refresh.
struct CountingSource {
    refreshes: AtomicUsize,
}

impl CountingSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            refreshes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TokenSource for CountingSource {
    async fn access_token(&self) -> cplane::Result<AccessToken> {
        Ok(AccessToken::new("stale"))
    }

    async fn refresh_token(&self) -> cplane::Result<AccessToken> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(AccessToken::new("fresh"))
    }
}

#[tokio::test]
async fn test_successful_get_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/apps/app-guid"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Cf-Warnings", "deprecated endpoint")
                .set_body_json(json!({"guid": "app-guid", "name": "web"})),
        )
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .get::<App>("/v3/apps/app-guid")
        .await
        .unwrap();

    assert_eq!(response.data.name, "web");
    assert_eq!(response.warnings, vec!["deprecated endpoint"]);
    assert_eq!(response.attempts, 1);
    assert!(!response.was_retried());
}

#[tokio::test]
async fn test_two_pages_are_concatenated() {
    let mock_server = MockServer::start().await;
    let next = format!("{}/v3/apps?page=2", mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/v3/apps"))
        .and(query_param("page", "2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Cf-Warnings", "w2")
                .set_body_json(json!({
                    "pagination": {"next": null},
                    "resources": [{"guid": "c", "name": "three"}]
                })),
        )
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v3/apps"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Cf-Warnings", "w1")
                .set_body_json(json!({
                    "pagination": {"next": {"href": next}},
                    "resources": [{"guid": "a", "name": "one"}, {"guid": "b", "name": "two"}]
                })),
        )
        .mount(&mock_server)
        .await;

    let all = client(&mock_server)
        .fetch_all_pages::<App>(Request::get("/v3/apps"))
        .await
        .unwrap();

    let guids: Vec<&str> = all.resources.iter().map(|a| a.guid.as_str()).collect();
    assert_eq!(guids, vec!["a", "b", "c"]);
    assert_eq!(all.warnings, vec!["w1", "w2"]);
    assert_eq!(all.pages, 2);
}

#[tokio::test]
async fn test_structured_error_is_decoded() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/apps/missing"))
        .respond_with(
            ResponseTemplate::new(404)
                .insert_header("X-Cf-Warnings", "still here")
                .set_body_json(json!({"errors": [
                    {"code": 10010, "title": "CF-ResourceNotFound", "detail": "App not found"}
                ]})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let failure = client(&mock_server)
        .get::<App>("/v3/apps/missing")
        .await
        .unwrap_err();

    assert_eq!(failure.warnings, vec!["still here"]);
    assert_eq!(failure.error.status().map(|s| s.as_u16()), Some(404));
    assert_eq!(failure.error.api_errors()[0].title, "CF-ResourceNotFound");
}

#[tokio::test]
async fn test_multiple_errors_are_aggregated() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v3/apps"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({"errors": [
            {"code": 10008, "title": "CF-UnprocessableEntity", "detail": "name is taken"},
            {"code": 10008, "title": "CF-UnprocessableEntity", "detail": "memory too large"}
        ]})))
        .mount(&mock_server)
        .await;

    let failure = client(&mock_server)
        .post::<_, App>("/v3/apps", &json!({"name": "web"}))
        .await
        .unwrap_err();

    assert_eq!(failure.error.api_errors().len(), 2);
    assert_eq!(failure.to_string(), "name is taken\nmemory too large");
}

#[tokio::test]
async fn test_unparsable_error_body_is_kept_raw() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/info"))
        .respond_with(ResponseTemplate::new(418).set_body_string("<html>teapot</html>"))
        .mount(&mock_server)
        .await;

    let failure = client(&mock_server)
        .get::<serde_json::Value>("/v3/info")
        .await
        .unwrap_err();

    match failure.error {
        Error::RawHttpStatus {
            status,
            raw_response,
        } => {
            assert_eq!(status.as_u16(), 418);
            assert_eq!(&raw_response[..], b"<html>teapot</html>");
        }
        other => panic!("Expected RawHttpStatus, got {:?}", other),
    }
}

#[tokio::test]
async fn test_deserialization_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/apps/app-guid"))
        .respond_with(ResponseTemplate::new(200).set_body_string("invalid json"))
        .mount(&mock_server)
        .await;

    let failure = client(&mock_server)
        .get::<App>("/v3/apps/app-guid")
        .await
        .unwrap_err();

    match failure.error {
        Error::DeserializationFailed {
            raw_response,
            status,
            ..
        } => {
            assert_eq!(raw_response, "invalid json");
            assert_eq!(status.as_u16(), 200);
        }
        other => panic!("Expected DeserializationFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rejected_token_is_refreshed_once() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/apps/app-guid"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401).set_body_string(INVALID_TOKEN))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v3/apps/app-guid"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"guid": "app-guid", "name": "web"})))
        .mount(&mock_server)
        .await;

    let source = CountingSource::new();
    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .token_source(source.clone())
        .build()
        .unwrap();

    let response = client.get::<App>("/v3/apps/app-guid").await.unwrap();

    assert_eq!(response.data.guid, "app-guid");
    assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_rejections_share_one_refresh() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401).set_body_string(INVALID_TOKEN))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"guid": "g", "name": "n"})))
        .mount(&mock_server)
        .await;

    let source = CountingSource::new();
    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .token_source(source.clone())
        .build()
        .unwrap();

    let (a, b) = tokio::join!(client.get::<App>("/v3/apps/a"), client.get::<App>("/v3/apps/b"));

    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_second_rejection_surfaces() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_body_string(INVALID_TOKEN))
        .expect(2)
        .mount(&mock_server)
        .await;

    let source = CountingSource::new();
    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .token_source(source.clone())
        .build()
        .unwrap();

    let failure = client.get::<App>("/v3/apps/a").await.unwrap_err();

    assert!(matches!(failure.error, Error::InvalidAuthToken { .. }));
    assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_post_server_error_is_not_resent() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v3/tasks"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let failure = client(&mock_server)
        .post::<_, serde_json::Value>("/v3/tasks", &json!({"command": "rake db:migrate"}))
        .await
        .unwrap_err();

    assert_eq!(failure.error.status().map(|s| s.as_u16()), Some(503));
}

#[tokio::test]
async fn test_get_gateway_error_is_retried_to_ceiling() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/apps"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .expect(3)
        .mount(&mock_server)
        .await;

    let failure = client(&mock_server)
        .get::<serde_json::Value>("/v3/apps")
        .await
        .unwrap_err();

    assert!(matches!(failure.error, Error::RawHttpStatus { .. }));
}

#[tokio::test]
async fn test_structured_server_error_is_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/apps"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"errors": [
            {"code": 10001, "title": "CF-ServiceUnavailable", "detail": "maintenance"}
        ]})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let failure = client(&mock_server)
        .get::<serde_json::Value>("/v3/apps")
        .await
        .unwrap_err();

    assert!(matches!(failure.error, Error::Api { .. }));
}

#[tokio::test]
async fn test_connection_refused_surfaces_request_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = Client::builder()
        .base_url(format!("http://127.0.0.1:{}", port))
        .unwrap()
        .retry_strategy(RetryStrategy::Linear {
            delay: Duration::from_millis(5),
            max_retries: 2,
        })
        .build()
        .unwrap();

    let failure = client.get::<serde_json::Value>("/v3/apps").await.unwrap_err();

    match failure.error {
        Error::Request { stage, .. } => assert_eq!(stage, TransportStage::Connect),
        other => panic!("Expected Request error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_job_succeeds_after_staging() {
    let mock_server = MockServer::start().await;
    let job_url = format!("{}/v3/jobs/job-guid", mock_server.uri());

    let body = |state: &str| {
        json!({"guid": "job-guid", "state": state, "links": {"self": {"href": job_url.clone()}}})
    };

    Mock::given(method("GET"))
        .and(path("/v3/jobs/job-guid"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Cf-Warnings", "staging")
                .set_body_json(body("STAGING")),
        )
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v3/jobs/job-guid"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Cf-Warnings", "done")
                .set_body_json(body("SUCCEEDED")),
        )
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .polling_interval(Duration::from_millis(10))
        .build()
        .unwrap();

    let mut poll = client.poll_job::<Job>(JobHandle::new(&job_url).unwrap());
    let mut batches = Vec::new();
    while let Some(batch) = poll.next().await {
        batches.push(batch);
    }
    let job = poll.outcome().await.unwrap();

    assert_eq!(batches, vec![vec!["staging".to_string()], vec!["staging".to_string()]]);
    assert_eq!(job.warnings, vec!["done"]);
    assert_eq!(job.data.guid, "job-guid");
}

#[tokio::test]
async fn test_failed_job_reports_server_reason() {
    let mock_server = MockServer::start().await;
    let job_url = format!("{}/v3/jobs/job-guid", mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/v3/jobs/job-guid"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"guid": "job-guid", "state": "STAGING"})))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v3/jobs/job-guid"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "guid": "job-guid",
            "state": "FAILED",
            "errors": [{"code": 170004, "title": "CF-BuildpackCompileFailed", "detail": "App staging failed"}]
        })))
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .polling_interval(Duration::from_millis(10))
        .build()
        .unwrap();

    let failure = client
        .poll_job::<Job>(JobHandle::new(&job_url).unwrap())
        .outcome()
        .await
        .unwrap_err();

    match failure.error {
        Error::JobFailed { reason } => assert_eq!(reason, "App staging failed"),
        other => panic!("Expected JobFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_submit_follows_location_of_empty_accepted_response() {
    let mock_server = MockServer::start().await;
    let job_url = format!("{}/v3/jobs/delete-guid", mock_server.uri());

    Mock::given(method("DELETE"))
        .and(path("/v3/apps/app-guid"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Location", job_url.as_str())
                .insert_header("X-Cf-Warnings", "deleting"),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v3/jobs/delete-guid"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"guid": "delete-guid", "state": "COMPLETE"})),
        )
        .mount(&mock_server)
        .await;

    let mut poll = client(&mock_server).submit_job::<Job>(Request::delete("/v3/apps/app-guid"));

    assert_eq!(poll.next().await, Some(vec!["deleting".to_string()]));
    let job = poll.outcome().await.unwrap();
    assert_eq!(job.data.guid, "delete-guid");
}

#[tokio::test]
async fn test_stage_package_creates_build_and_polls() {
    let mock_server = MockServer::start().await;
    let build_url = format!("{}/v3/builds/build-guid", mock_server.uri());

    Mock::given(method("POST"))
        .and(path("/v3/builds"))
        .and(body_json(json!({"package": {"guid": "package-guid"}})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "guid": "build-guid",
            "state": "STAGING",
            "links": {"self": {"href": build_url}}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v3/builds/build-guid"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"guid": "build-guid", "state": "STAGED"})))
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .polling_interval(Duration::from_millis(10))
        .build()
        .unwrap();

    let build = client
        .stage_package("package-guid")
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert_eq!(build.data.guid, "build-guid");
}

#[tokio::test]
async fn test_add_policies_posts_one_batch() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/networking/v0/external/policies"))
        .and(body_json(json!({"policies": [{
            "source": {"id": "src-guid"},
            "destination": {
                "id": "dst-guid",
                "protocol": "tcp",
                "port": 8080,
                "ports": {"start": 8080, "end": 8080}
            }
        }]})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let policies = PolicyClient::builder()
        .base_url(format!("{}/networking/v0/external", mock_server.uri()))
        .unwrap()
        .build()
        .unwrap();

    let response = policies
        .add_policy("src-guid", "dst-guid", "tcp", 8080)
        .await
        .unwrap();

    assert_eq!(response.status.as_u16(), 200);
}

#[tokio::test]
async fn test_policy_rejection_is_raw_status() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/policies"))
        .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid destination port"}"#))
        .mount(&mock_server)
        .await;

    let policies = PolicyClient::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .build()
        .unwrap();

    let failure = policies.add_policies(&[]).await.unwrap_err();

    assert!(matches!(failure.error, Error::RawHttpStatus { .. }));
}

#[tokio::test]
async fn test_task_lookup_and_not_found() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/apps/app-guid/tasks"))
        .and(query_param("sequence_ids", "4"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "pagination": {"next": null},
            "resources": [{"guid": "task-guid", "sequence_id": 4, "name": "migrate"}]
        })))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v3/apps/app-guid/tasks"))
        .and(query_param("sequence_ids", "5"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Cf-Warnings", "looked")
                .set_body_json(json!({"pagination": {"next": null}, "resources": []})),
        )
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);

    let task = client.get_task_by_sequence_id("app-guid", 4).await.unwrap();
    assert_eq!(task.data.name, "migrate");

    let failure = client.get_task_by_sequence_id("app-guid", 5).await.unwrap_err();
    assert!(matches!(failure.error, Error::TaskNotFound { sequence_id: 5 }));
    assert_eq!(failure.warnings, vec!["looked"]);
}

#[tokio::test]
async fn test_tasks_sorted_descending() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/apps/app-guid/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resources": [
                {"guid": "a", "sequence_id": 1},
                {"guid": "c", "sequence_id": 3},
                {"guid": "b", "sequence_id": 2}
            ]
        })))
        .mount(&mock_server)
        .await;

    let tasks = client(&mock_server)
        .get_application_tasks("app-guid", SortOrder::Descending)
        .await
        .unwrap();

    let guids: Vec<&str> = tasks.data.iter().map(|t| t.guid.as_str()).collect();
    assert_eq!(guids, vec!["c", "b", "a"]);
}

#[tokio::test]
async fn test_service_instance_not_found() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v3/service_instances"))
        .and(query_param("names", "db"))
        .and(query_param("space_guids", "space-guid"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"resources": []})))
        .mount(&mock_server)
        .await;

    let failure = client(&mock_server)
        .get_service_instance_by_name_and_space("db", "space-guid")
        .await
        .unwrap_err();

    assert_eq!(failure.error.to_string(), "Service instance 'db' not found.");
}

#[tokio::test]
async fn test_user_agent_and_default_headers() {
    let mock_server = MockServer::start().await;
    let expected_agent = cplane::user_agent("cf", "7.1.0");

    Mock::given(method("GET"))
        .and(path("/v3/info"))
        .and(header("user-agent", expected_agent.as_str()))
        .and(header("x-request-source", "tests"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .user_agent("cf", "7.1.0")
        .default_header("X-Request-Source", "tests")
        .unwrap()
        .build()
        .unwrap();

    assert!(client.get::<serde_json::Value>("/v3/info").await.is_ok());
}

#[tokio::test]
async fn test_delete_with_empty_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v3/routes/route-guid"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .delete("/v3/routes/route-guid")
        .await
        .unwrap();

    assert_eq!(response.status.as_u16(), 204);
}

#[tokio::test]
async fn test_timeout_is_reported() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .timeout(Duration::from_millis(50))
        .retry_strategy(RetryStrategy::None)
        .build()
        .unwrap();

    let failure = client.get::<serde_json::Value>("/slow").await.unwrap_err();

    assert!(matches!(failure.error, Error::Timeout));
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_request_logging_does_not_alter_exchange() {
    init_tracing();
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v3/spaces"))
        .and(header("authorization", "Bearer stale"))
        .and(body_json(json!({"name": "dev"})))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("X-Cf-Warnings", "quota nearly reached")
                .set_body_json(json!({"guid": "space-guid", "name": "dev"})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .token_source(CountingSource::new())
        .request_logging(true)
        .build()
        .unwrap();

    let response = client
        .post::<_, App>("/v3/spaces", &json!({"name": "dev"}))
        .await
        .unwrap();

    assert_eq!(response.data.guid, "space-guid");
    assert_eq!(response.warnings, vec!["quota nearly reached"]);
}
