use std::{fs, path::PathBuf};

use axum::{
    body::Bytes,
    extract::Path,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use httpchain::{
    analyzer, DefaultScenarioRunner, EngineError, FunctionRegistry, Scenario, ScenarioRunner,
    StageOutcome, StagePhase, Vars,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

struct TestServer {
    base_url: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

async fn echo(headers: HeaderMap, body: Bytes) -> Json<Value> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Json(json!({
        "content_type": content_type,
        "authorization": authorization,
        "body": String::from_utf8_lossy(&body),
    }))
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let app = Router::new()
            .route(
                "/users",
                post(|Json(payload): Json<Value>| async move {
                    (
                        StatusCode::CREATED,
                        [("X-Request-Id", "req-1")],
                        Json(json!({"id": 42, "name": payload["name"]})),
                    )
                }),
            )
            .route(
                "/users/:id",
                get(|Path(id): Path<u64>| async move { Json(json!({"id": id, "name": "alice"})) })
                    .delete(|| async move { StatusCode::NO_CONTENT }),
            )
            .route("/echo", post(echo).put(echo))
            .route(
                "/broken",
                get(|| async move { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            );

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });
        let base_url = format!("http://{addr}");

        Self {
            base_url,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn load_scenario(path: &str, base_url: &str) -> Scenario {
    let scenario_path = fixtures_dir().join(path);
    let content = fs::read_to_string(&scenario_path)
        .unwrap_or_else(|e| panic!("failed to read {scenario_path:?}: {e}"));
    let content = content.replace("__BASE_URL__", base_url);

    Scenario::from_yaml(&content)
        .unwrap_or_else(|e| panic!("failed to parse scenario yaml: {e}"))
}

fn runner() -> DefaultScenarioRunner {
    DefaultScenarioRunner::new().with_base_dir(fixtures_dir())
}

#[tokio::test]
async fn saved_values_flow_into_later_stages() {
    let server = TestServer::spawn().await;
    let scenario = load_scenario("user_flow.yaml", &server.base_url);

    let result = runner()
        .run(&scenario, &Vars::new())
        .await
        .expect("runner returned error for success scenario");

    assert!(
        result.success,
        "scenario should succeed: {:?}",
        result.failed_stages().collect::<Vec<_>>()
    );
    assert_eq!(result.variables["user_id"], json!(42));
    assert_eq!(result.variables["user_name"], json!("alice"));
    assert_eq!(result.variables["request_id"], json!("req-1"));

    let fetch = result.stage("fetch_user").unwrap();
    assert_eq!(
        fetch.request.as_ref().unwrap().url,
        format!("{}/users/42", server.base_url)
    );
    assert_eq!(fetch.response.as_ref().unwrap().status, 200);

    server.shutdown().await;
}

#[tokio::test]
async fn mismatched_saved_value_fails_and_names_the_variable() {
    let server = TestServer::spawn().await;
    let scenario = load_scenario("user_flow_mismatch.yaml", &server.base_url);

    let result = runner()
        .run(&scenario, &Vars::new())
        .await
        .expect("runner returned error for failing scenario");

    assert!(!result.success);

    let create = result.stage("create_user").unwrap();
    match &create.outcome {
        StageOutcome::Failed {
            phase,
            message,
            findings,
        } => {
            assert_eq!(*phase, StagePhase::Verifying);
            assert!(message.contains("user_name"), "{message}");
            assert_eq!(findings.len(), 1);
            assert_eq!(findings[0].subject, "user_name");
        }
        other => panic!("expected a failed stage, got {other:?}"),
    }
    // values from a failed stage are not committed
    assert!(!result.variables.contains_key("user_name"));

    assert!(result.stage("never_reached").unwrap().skipped_reason().is_some());
    assert!(result.stage("cleanup").unwrap().passed());

    server.shutdown().await;
}

#[tokio::test]
async fn request_body_encodings_reach_the_server() {
    let server = TestServer::spawn().await;
    let scenario = load_scenario("request_bodies.yaml", &server.base_url);

    let result = runner()
        .run(&scenario, &Vars::new())
        .await
        .expect("runner returned error for body scenario");

    for stage in &result.stages {
        assert!(
            stage.passed(),
            "stage '{}' failed: {:?} (response: {:?})",
            stage.name,
            stage.error(),
            stage.response.as_ref().and_then(|r| r.body.clone())
        );
    }
    assert!(result.success);

    server.shutdown().await;
}

#[tokio::test]
async fn fixtures_and_session_auth_apply_to_every_stage() {
    let server = TestServer::spawn().await;
    let scenario = Scenario::from_yaml(
        r#"
name: secured
fixtures: [server, token]
auth:
  function: httpchain:bearer_auth
  kwargs:
    token: "{{ token }}"
stages:
  - name: first
    request:
      url: "{{ server }}/echo"
      method: POST
      body:
        json: {}
    verify:
      body:
        contains: ["Bearer secret-token"]
  - name: override
    request:
      url: "{{ server }}/echo"
      method: POST
      auth:
        function: httpchain:basic_auth
        kwargs:
          username: user
          password: pass
    verify:
      body:
        contains: ["Basic dXNlcjpwYXNz"]
"#,
    )
    .unwrap();

    let mut fixtures = Vars::new();
    fixtures.insert("server".into(), json!(server.base_url));
    fixtures.insert("token".into(), json!("secret-token"));

    let result = runner().run(&scenario, &fixtures).await.unwrap();
    assert!(
        result.success,
        "{:?}",
        result.failed_stages().map(|s| s.error()).collect::<Vec<_>>()
    );

    server.shutdown().await;
}

#[tokio::test]
async fn missing_fixture_is_reported_before_any_request() {
    let scenario = Scenario::from_yaml(
        "fixtures: [server]\nstages:\n  - name: a\n    request:\n      url: \"{{ server }}\"\n",
    )
    .unwrap();

    let err = runner().run(&scenario, &Vars::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)), "{err:?}");
}

#[tokio::test]
async fn user_functions_save_and_verify() {
    let server = TestServer::spawn().await;
    let mut registry = FunctionRegistry::with_builtins();
    registry.register_save("helpers:name_length", |response, _kwargs| {
        let body = response.json().unwrap_or_default();
        let len = body["name"].as_str().map(str::len).unwrap_or_default();
        let mut saved = Vars::new();
        saved.insert("name_length".into(), json!(len));
        Ok(saved)
    });
    registry.register_verify("helpers:status_is", |response, kwargs| {
        Ok(kwargs.get("code").and_then(Value::as_u64) == Some(u64::from(response.status)))
    });

    let scenario = Scenario::from_yaml(&format!(
        r#"
stages:
  - name: fetch
    request:
      url: "{}/users/7"
    save:
      functions: ["helpers:name_length"]
    verify:
      vars:
        name_length: 5
      functions:
        - function: helpers:status_is
          kwargs:
            code: 200
"#,
        server.base_url
    ))
    .unwrap();

    let result = runner()
        .with_registry(registry)
        .run(&scenario, &Vars::new())
        .await
        .unwrap();
    assert!(result.success, "{:?}", result.stages[0].error());
    assert_eq!(result.variables["name_length"], json!(5));

    server.shutdown().await;
}

#[tokio::test]
async fn unexpected_status_collects_every_finding() {
    let server = TestServer::spawn().await;
    let scenario = Scenario::from_yaml(&format!(
        r#"
stages:
  - name: broken
    request:
      url: "{}/broken"
    verify:
      status: 200
      headers:
        X-Missing: "yes"
      body:
        not_contains: ["boom"]
"#,
        server.base_url
    ))
    .unwrap();

    let result = runner().run(&scenario, &Vars::new()).await.unwrap();
    assert!(!result.success);
    let stage = &result.stages[0];
    assert_eq!(stage.findings().len(), 3, "{:?}", stage.findings());
    assert_eq!(stage.response.as_ref().unwrap().status, 500);

    server.shutdown().await;
}

#[tokio::test]
async fn connection_failure_fails_the_stage() {
    let scenario = Scenario::from_yaml(
        r#"
stages:
  - name: unreachable
    request:
      url: "http://127.0.0.1:1/nothing"
      timeout: 2
    verify:
      status: 200
"#,
    )
    .unwrap();

    let result = runner().run(&scenario, &Vars::new()).await.unwrap();
    assert!(!result.success);
    match &result.stages[0].outcome {
        StageOutcome::Failed { phase, .. } => assert_eq!(*phase, StagePhase::Dispatched),
        other => panic!("expected failure, got {other:?}"),
    }
}

fn validate_fixture(name: &str) -> analyzer::ValidationResult {
    analyzer::validate(fixtures_dir().join("analyzer").join(name))
}

#[test]
fn analyzer_accepts_valid_scenario() {
    let result = validate_fixture("valid.yaml");
    assert!(result.valid, "{:?}", result.errors);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);

    let info = result.scenario_info.unwrap();
    assert_eq!(info.stage_names, ["login", "profile"]);
    assert!(info.vars_saved.contains("token"));
    assert!(info.vars_referenced.contains("server"));
}

#[test]
fn analyzer_reports_syntax_errors() {
    let result = validate_fixture("invalid_syntax.yaml");
    assert!(!result.valid);
    assert!(result.errors[0].contains("YAML"), "{:?}", result.errors);
    assert!(result.scenario_info.is_none());
}

#[test]
fn analyzer_reports_duplicate_stage_names() {
    let result = validate_fixture("duplicate_names.json");
    assert!(!result.valid);
    assert!(result.errors.iter().any(|e| e.contains("same")));
}

#[test]
fn analyzer_warns_on_undefined_variables() {
    let result = validate_fixture("undefined_var.yaml");
    assert!(result.valid);
    assert_eq!(
        result.warnings,
        ["Stage 'fetch' uses undefined variable 'item_id'"]
    );
}

#[test]
fn analyzer_warns_on_missing_validation() {
    let result = validate_fixture("no_validation.yaml");
    assert!(result.valid);
    assert_eq!(result.warnings, ["Stage 'ping' has no response validation"]);
}

#[test]
fn analyzer_rejects_conflicting_fixtures() {
    let result = validate_fixture("conflict.yml");
    assert!(!result.valid);
    assert!(result.errors[0].contains("token"));
}

#[test]
fn analyzer_warns_on_unexpected_extension() {
    let result = validate_fixture("scenario.txt");
    assert!(result.valid, "{:?}", result.errors);
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("'.txt'"));
}

#[test]
fn analyzer_rejects_malformed_literals() {
    let result = validate_fixture("bad_literals.yaml");
    assert!(!result.valid);
    assert!(
        result.errors[0].starts_with("Invalid scenario structure"),
        "{:?}",
        result.errors
    );
}
