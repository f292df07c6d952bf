use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use planflow_core::api::{router, ApiState};
use planflow_core::config::Settings;
use planflow_core::db::{init_db, DatabaseTarget, DbPool};
use planflow_core::logging::list_events;
use planflow_core::workers::{DatabaseTransport, Worker};
use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestApp {
    base: String,
    client: reqwest::Client,
    db: DbPool,
    state: ApiState,
}

impl TestApp {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let response = self.client.post(self.url(path)).json(&body).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn delete(&self, path: &str) -> StatusCode {
        self.client.delete(self.url(path)).send().await.unwrap().status()
    }
}

fn test_settings() -> Settings {
    Settings {
        database_url: ":memory:".to_string(),
        prompts_dir: PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/../prompts")),
        backend_cors_origins: vec!["http://localhost:3000".to_string()],
        ..Settings::default()
    }
}

async fn spawn_app(settings: Settings) -> TestApp {
    let db = init_db(&DatabaseTarget::Memory).unwrap();
    let state = ApiState::from_settings(db.clone(), settings).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestApp {
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        db,
        state,
    }
}

async fn mock_anthropic(reply: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{ "type": "text", "text": reply }],
            "usage": { "input_tokens": 100, "output_tokens": 40 }
        })))
        .mount(&server)
        .await;
    server
}

fn anthropic_settings(server: &MockServer) -> Settings {
    Settings {
        ai_provider: "anthropic".to_string(),
        anthropic_api_key: Some("test-key".to_string()),
        anthropic_base_url: server.uri(),
        ..test_settings()
    }
}

#[tokio::test]
async fn root_and_health_respond() {
    let app = spawn_app(test_settings()).await;
    let (status, body) = app.get("/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "AI-Driven Project Flow API");

    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["ai"], false);
}

#[tokio::test]
async fn project_crud_over_http() {
    let app = spawn_app(test_settings()).await;

    let (status, created) = app
        .post(
            "/api/v1/projects",
            json!({ "name": "Atlas", "description": "Mapping service" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["status"], "Draft");
    let id = created["id"].as_i64().unwrap();
    assert!(created["lastUpdate"].is_string());

    let response = app
        .client
        .put(app.url(&format!("/api/v1/projects/{id}")))
        .json(&json!({ "status": "In Development", "progress": 25.0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let updated: Value = response.json().await.unwrap();
    assert_eq!(updated["status"], "In Development");
    assert_eq!(updated["description"], "Mapping service");

    let (status, page) = app.get("/api/v1/projects?limit=10&search=atl").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);
    assert_eq!(page["page"], 1);

    let (status, _) = app.get("/api/v1/projects?limit=0").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = app.post("/api/v1/projects", json!({ "name": "  " })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VAL-1001");

    assert_eq!(app.delete(&format!("/api/v1/projects/{id}")).await, StatusCode::OK);
    let (status, body) = app.get(&format!("/api/v1/projects/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"], "Project not found");
    assert_eq!(body["code"], "REC-1001");
}

#[tokio::test]
async fn deleting_a_project_cascades_through_the_backlog() {
    let app = spawn_app(test_settings()).await;
    let (_, project) = app.post("/api/v1/projects", json!({ "name": "Cascade" })).await;
    let pid = project["id"].as_i64().unwrap();

    let (status, release) = app
        .post(
            &format!("/api/v1/projects/{pid}/releases"),
            json!({ "name": "R1", "start_date": "2025-01-01", "end_date": "2025-02-01" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let rid = release["id"].as_i64().unwrap();

    let (_, epic) = app
        .post(&format!("/api/v1/releases/{rid}/epics"), json!({ "name": "Login" }))
        .await;
    let eid = epic["id"].as_i64().unwrap();
    let (_, story) = app
        .post(&format!("/api/v1/epics/{eid}/stories"), json!({ "name": "Sign in" }))
        .await;
    let sid = story["id"].as_i64().unwrap();
    let (status, use_case) = app
        .post(&format!("/api/v1/stories/{sid}/use-cases"), json!({ "title": "Happy path" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, test_case) = app
        .post(&format!("/api/v1/stories/{sid}/test-cases"), json!({ "title": "Valid password" }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let response = app
        .client
        .put(app.url(&format!("/api/v1/epics/{eid}")))
        .json(&json!({ "status": "Completed" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let (status, refreshed) = app
        .post(
            &format!("/api/v1/projects/{pid}/releases/{rid}/update-progress"),
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(refreshed["progress"], 100.0);

    assert_eq!(app.delete(&format!("/api/v1/projects/{pid}")).await, StatusCode::OK);
    for path in [
        format!("/api/v1/epics/{eid}"),
        format!("/api/v1/stories/{sid}"),
        format!("/api/v1/use-cases/{}", use_case["id"]),
        format!("/api/v1/test-cases/{}", test_case["id"]),
    ] {
        let (status, _) = app.get(&path).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{path}");
    }

    let (status, _) = app
        .post("/api/v1/releases/9999/epics", json!({ "name": "Orphan" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn charter_validation_without_provider_uses_heuristics() {
    let app = spawn_app(test_settings()).await;
    let (status, body) = app.post("/api/v1/charter/validate", json!({ "name": "x" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_valid"], false);
    assert_eq!(body["ai_status"], "unavailable");
    assert_eq!(body["issues"].as_array().map(Vec::len), Some(2));
    assert_eq!(
        body["format_errors"],
        json!(["Missing required field: description"])
    );

    let (status, body) = app
        .post(
            "/api/v1/charter/validate",
            json!({ "charter_text": "A tiny idea" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["structured_charter"]["raw_input"], "A tiny idea");

    let (_, status) = app.get("/api/v1/charter/status").await;
    assert_eq!(status["available"], false);
    assert_eq!(status["provider"], "openai");

    let (status, format) = app.get("/api/v1/charter/format").await;
    assert_eq!(status, StatusCode::OK);
    assert!(format["example"]["roadmap"].is_array());

    let (status, prompts) = app.get("/api/v1/charter/prompts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(prompts[0]["operation"], "charter_validation");
    assert_eq!(prompts[0]["versions"][0], "latest");
}

#[tokio::test]
async fn anthropic_provider_is_selected_by_configuration() {
    let reply = r#"Here you go:
```json
{"is_valid": true, "completeness_score": 0.9, "issues": [], "structured_charter": {"name": "Atlas", "description": "Maps"}}
```"#;
    let server = mock_anthropic(reply).await;
    let app = spawn_app(anthropic_settings(&server)).await;

    let (status, body) = app
        .post(
            "/api/v1/charter/validate",
            json!({ "name": "Atlas", "description": "Maps" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ai_status"], "ok");
    assert_eq!(body["is_valid"], true);
    assert_eq!(body["completeness_score"], 0.9);

    let (_, status) = app.get("/api/v1/charter/status?probe=true").await;
    assert_eq!(status["provider"], "anthropic");
    assert_eq!(status["model"], "claude-3-sonnet-20240229");
    assert_eq!(status["available"], true);

    let conn = app.db.get().unwrap();
    let events = list_events(&conn, Some("ai.runtime"), 10).unwrap();
    assert!(events.iter().any(|e| e.code.as_deref() == Some("AI-0200")));
}

async fn validate_with_provider(provider: &str) -> Value {
    let reply = r#"{"is_valid": true, "completeness_score": 0.5,
        "issues": [{"field": "vision", "issue": "Vague", "suggestion": "Name the outcome"}],
        "structured_charter": {"name": "Atlas", "description": "Maps"}}"#;
    let server = MockServer::start().await;
    let (own, other) = if provider == "openai" {
        ("/v1/chat/completions", "/v1/messages")
    } else {
        ("/v1/messages", "/v1/chat/completions")
    };
    let body = if provider == "openai" {
        json!({ "choices": [{ "message": { "role": "assistant", "content": reply } }] })
    } else {
        json!({ "content": [{ "type": "text", "text": reply }] })
    };
    Mock::given(method("POST"))
        .and(path(own))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(other))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let settings = Settings {
        ai_provider: provider.to_string(),
        openai_api_key: Some("openai-key".to_string()),
        anthropic_api_key: Some("anthropic-key".to_string()),
        openai_base_url: server.uri(),
        anthropic_base_url: server.uri(),
        ..test_settings()
    };
    let app = spawn_app(settings).await;
    let (status, report) = app
        .post(
            "/api/v1/charter/validate",
            json!({ "name": "Atlas", "description": "Maps" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    server.verify().await;
    report
}

#[tokio::test]
async fn switching_provider_only_changes_the_backend_called() {
    let openai = validate_with_provider("openai").await;
    let anthropic = validate_with_provider("anthropic").await;
    assert_eq!(openai["ai_status"], "ok");
    assert_eq!(openai["issues"][0]["field"], "vision");
    assert_eq!(openai, anthropic);
}

#[tokio::test]
async fn malformed_json_bodies_use_the_error_envelope() {
    let app = spawn_app(test_settings()).await;

    let response = app
        .client
        .post(app.url("/api/v1/projects"))
        .header("content-type", "application/json")
        .body("{\"name\": ")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "VAL-1002");
    assert!(body["detail"].is_string());

    let (status, body) = app.post("/api/v1/projects", json!({ "name": 7 })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VAL-1001");

    let (status, body) = app
        .post(
            "/api/v1/charter/validate",
            json!({ "name": "Atlas", "charter_text": "notes", "description": "Maps" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["structured_charter"]["name"], "Atlas");
    assert_eq!(body["format_errors"], json!([]));
}

#[tokio::test]
async fn unparseable_reply_falls_back_and_is_logged() {
    let server = mock_anthropic("I cannot produce JSON today.").await;
    let app = spawn_app(anthropic_settings(&server)).await;

    let (status, body) = app
        .post(
            "/api/v1/charter/suggestions",
            json!({ "charter": { "name": "Atlas" } }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ai_status"], "unparseable");
    assert_eq!(body["suggestions"], json!([]));

    let conn = app.db.get().unwrap();
    let events = list_events(&conn, Some("ai.runtime"), 10).unwrap();
    assert_eq!(events[0].code.as_deref(), Some("AI-0300"));
}

#[tokio::test]
async fn release_extraction_and_bulk_creation() {
    let reply = json!({
        "extracted_releases": [
            { "name": "MVP", "description": "Core", "start_date": "2025-06-01", "end_date": "2025-06-30", "scope_modules": ["auth"] },
            { "name": "", "description": "nameless" },
            { "name": "GA", "description": "Launch", "start_date": "2025-08-01" }
        ],
        "recommendations": [{ "type": "timeline", "message": "Buffer the GA", "priority": "high" }]
    })
    .to_string();
    let server = mock_anthropic(&reply).await;
    let app = spawn_app(anthropic_settings(&server)).await;

    let (_, bare) = app.post("/api/v1/projects", json!({ "name": "Bare" })).await;
    let (status, body) = app
        .post(&format!("/api/v1/projects/{}/releases/extract", bare["id"]), json!({}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "CHR-1001");

    let (_, project) = app
        .post(
            "/api/v1/projects",
            json!({ "name": "Atlas", "charter": { "name": "Atlas", "roadmap": [] } }),
        )
        .await;
    let pid = project["id"].as_i64().unwrap();
    let (status, extraction) = app
        .post(&format!("/api/v1/projects/{pid}/releases/extract"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(extraction["success"], true);
    assert_eq!(extraction["extracted_releases"].as_array().map(Vec::len), Some(2));
    assert_eq!(extraction["recommendations"][0]["type"], "timeline");

    let (status, bulk) = app
        .post(
            &format!("/api/v1/projects/{pid}/releases/create-from-extraction"),
            json!({ "selected_releases": [0, 1, 7], "extracted_data": extraction }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bulk["success_count"], 2);
    assert_eq!(bulk["total_count"], 3);
    assert_eq!(bulk["failed_releases"][0]["index"], 7);

    let (_, list) = app.get(&format!("/api/v1/projects/{pid}/releases")).await;
    assert_eq!(list["total"], 2);
    assert_eq!(list["releases"][0]["name"], "MVP");
}

#[tokio::test]
async fn charter_review_job_runs_through_the_worker() {
    let app = spawn_app(test_settings()).await;
    let (_, project) = app
        .post(
            "/api/v1/projects",
            json!({ "name": "Queued", "description": "Runs later" }),
        )
        .await;

    let (status, job) = app
        .post(
            &format!("/api/v1/projects/{}/charter/review", project["id"]),
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(job["state"], "queued");
    let job_id = job["id"].as_str().unwrap().to_string();

    let worker = Worker::new(
        app.db.clone(),
        Arc::new(DatabaseTransport::new(app.db.clone())),
        app.state.charter.clone(),
        app.state.planner.clone(),
        Duration::from_millis(10),
    );
    assert!(worker.run_once().await.unwrap());

    let (status, job) = app.get(&format!("/api/v1/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["state"], "completed");
    assert_eq!(job["result"]["ai_status"], "unavailable");
    assert_eq!(job["result"]["structured_charter"]["name"], "Queued");

    let (status, _) = app.get("/api/v1/jobs/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, events) = app.get("/api/v1/events?module=workers").await;
    assert_eq!(status, StatusCode::OK);
    assert!(events.as_array().is_some_and(|e| e.len() >= 3));
}

#[tokio::test]
async fn cors_preflight_is_answered_for_configured_origins() {
    let app = spawn_app(test_settings()).await;
    let response = app
        .client
        .request(reqwest::Method::OPTIONS, app.url("/api/v1/projects"))
        .header("origin", "http://localhost:3000")
        .header("access-control-request-method", "POST")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "http://localhost:3000"
    );

    let response = app
        .client
        .get(app.url("/health"))
        .header("origin", "http://evil.example")
        .send()
        .await
        .unwrap();
    assert!(response.headers().get("access-control-allow-origin").is_none());
}
