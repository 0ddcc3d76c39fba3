use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use kiln_executor::{Executor, ExecutorError, TaskSpec};
use kiln_manifest::{RegistryCredential, ResolveDefaults};
use kiln_state::{BuildState, Registry};
use tower::util::ServiceExt;

use crate::http::{AppState, router};
use crate::orchestrator::{Orchestrator, OrchestratorOptions};
use crate::push::{ManifestEntry, ManifestPusher, PushError};

/// What the fake remote worker does for a given task.
#[derive(Clone)]
enum WorkerScript {
    /// Post a success result with digest `sha256:<task-id>`.
    Succeed,
    /// Post the same success result twice in quick succession.
    SucceedTwice,
    /// Post a failure result with the given error.
    Fail(&'static str),
    /// Exit cleanly without posting anything.
    Silent,
}

struct StubExecutor {
    default_script: WorkerScript,
    overrides: HashMap<String, WorkerScript>,
    dispatched: Mutex<Vec<(String, Option<String>)>>,
}

impl StubExecutor {
    fn new(default_script: WorkerScript) -> Self {
        Self {
            default_script,
            overrides: HashMap::new(),
            dispatched: Mutex::new(Vec::new()),
        }
    }

    fn with_override(mut self, task_id: &str, script: WorkerScript) -> Self {
        self.overrides.insert(task_id.to_string(), script);
        self
    }

    fn dispatched(&self) -> Vec<(String, Option<String>)> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for StubExecutor {
    async fn dispatch(
        &self,
        state: Arc<BuildState>,
        task: TaskSpec<'_>,
    ) -> Result<(), ExecutorError> {
        self.dispatched.lock().unwrap().push((
            task.task_id.to_string(),
            task.destination.map(str::to_string),
        ));
        let script = self
            .overrides
            .get(task.task_id)
            .unwrap_or(&self.default_script);
        let digest = format!("sha256:{}", task.task_id);
        match script {
            WorkerScript::Succeed => {
                state.set_result(task.task_id, &task.config.arch, &digest, true, "");
            }
            WorkerScript::SucceedTwice => {
                state.set_result(task.task_id, &task.config.arch, &digest, true, "");
                state.set_result(task.task_id, &task.config.arch, &digest, true, "");
            }
            WorkerScript::Fail(error) => {
                state.set_result(task.task_id, &task.config.arch, "", false, error);
            }
            WorkerScript::Silent => {}
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingPusher {
    pushes: Mutex<Vec<(String, Vec<ManifestEntry>)>>,
}

impl RecordingPusher {
    fn pushes(&self) -> Vec<(String, Vec<ManifestEntry>)> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ManifestPusher for RecordingPusher {
    async fn push_list(
        &self,
        destination: &str,
        entries: &[ManifestEntry],
        _credentials: &[RegistryCredential],
    ) -> Result<(), PushError> {
        self.pushes
            .lock()
            .unwrap()
            .push((destination.to_string(), entries.to_vec()));
        Ok(())
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    executor: Arc<StubExecutor>,
    pusher: Arc<RecordingPusher>,
    registry: Arc<Registry>,
}

fn harness(executor: StubExecutor) -> Harness {
    let registry = Arc::new(Registry::new());
    let pusher = Arc::new(RecordingPusher::default());
    let executor = Arc::new(executor);
    let orchestrator = Arc::new(
        Orchestrator::new(
            registry.clone(),
            pusher.clone(),
            OrchestratorOptions {
                controller_url: "http://controller.test".to_string(),
                task_timeout: Duration::from_secs(5),
                result_timeout: Duration::from_secs(1),
                defaults: ResolveDefaults::default(),
            },
        )
        .with_ecs(executor.clone()),
    );
    Harness {
        orchestrator,
        executor,
        pusher,
        registry,
    }
}

async fn finished_logs(state: &Arc<BuildState>) -> Vec<String> {
    let mut done = state.done_rx();
    done.wait_for(|done| *done).await.unwrap();
    let mut rx = state.take_log_receiver().expect("log receiver already taken");
    let mut lines = Vec::new();
    while let Some(entry) = rx.recv().await {
        lines.push(entry.message);
    }
    lines
}

#[tokio::test]
async fn single_arch_build_succeeds_without_assembly() {
    let h = harness(StubExecutor::new(WorkerScript::Succeed));
    let manifest = b"global:\n  arch: amd64\n  platform: ecs\n  kaniko:\n    destination: \"r/a:v1\"\nbake:\n  - {}\n";

    let (build_id, state) = h
        .orchestrator
        .start_build(manifest, "ctx", "ctx/app.tar.gz", None)
        .unwrap();
    assert!(build_id.starts_with("b-"));
    assert!(state.is_single_arch());

    let lines = finished_logs(&state).await;
    assert_eq!(lines.last().unwrap(), "BUILD SUCCEEDED");
    assert!(lines.iter().any(|l| l.contains("task amd64: ok digest=sha256:amd64")));

    // Single-arch: the worker pushed straight to the global reference and
    // no manifest list was assembled.
    assert_eq!(
        h.executor.dispatched(),
        vec![("amd64".to_string(), Some("r/a:v1".to_string()))]
    );
    assert!(h.pusher.pushes().is_empty());
}

#[tokio::test]
async fn multi_arch_build_assembles_manifest_list() {
    let h = harness(StubExecutor::new(WorkerScript::Succeed));
    let manifest = b"global:\n  kaniko:\n    destination: \"r/a:v1\"\nbake:\n  - arch: amd64\n  - arch: arm64\n";

    let (_, state) = h
        .orchestrator
        .start_build(manifest, "ctx", "k", None)
        .unwrap();
    let lines = finished_logs(&state).await;
    assert_eq!(lines.last().unwrap(), "BUILD SUCCEEDED");

    let dispatched = h.executor.dispatched();
    let destinations: HashMap<_, _> = dispatched.into_iter().collect();
    assert_eq!(
        destinations.get("amd64").unwrap().as_deref(),
        Some("r/a:v1_amd64")
    );
    assert_eq!(
        destinations.get("arm64").unwrap().as_deref(),
        Some("r/a:v1_arm64")
    );

    let pushes = h.pusher.pushes();
    assert_eq!(pushes.len(), 1);
    let (destination, entries) = &pushes[0];
    assert_eq!(destination, "r/a:v1");
    assert_eq!(entries.len(), 2);
    let arm = entries.iter().find(|e| e.arch == "arm64").unwrap();
    assert_eq!(arm.image, "r/a:v1_arm64");
    assert_eq!(arm.variant.as_deref(), Some("v8"));
}

#[tokio::test]
async fn duplicate_archs_get_indexed_task_ids_and_destinations() {
    let h = harness(StubExecutor::new(WorkerScript::Succeed));
    let manifest =
        b"global:\n  kaniko:\n    destination: \"r/a:v1\"\nbake:\n  - arch: amd64\n  - arch: amd64\n";

    let (_, state) = h
        .orchestrator
        .start_build(manifest, "ctx", "k", None)
        .unwrap();
    assert!(state.has_duplicate_arch());

    let lines = finished_logs(&state).await;
    assert_eq!(lines.last().unwrap(), "BUILD SUCCEEDED");

    let destinations: HashMap<_, _> = h.executor.dispatched().into_iter().collect();
    assert_eq!(
        destinations.get("amd64-0").unwrap().as_deref(),
        Some("r/a:v1_amd64-0")
    );
    assert_eq!(
        destinations.get("amd64-1").unwrap().as_deref(),
        Some("r/a:v1_amd64-1")
    );
}

#[tokio::test]
async fn missing_result_times_out_and_fails_the_build() {
    let executor = StubExecutor::new(WorkerScript::Succeed)
        .with_override("riscv64", WorkerScript::Silent);
    let h = harness(executor);
    let manifest = b"global:\n  kaniko:\n    destination: \"r/a:v1\"\nbake:\n  - arch: amd64\n  - arch: arm64\n  - arch: riscv64\n";

    let (_, state) = h
        .orchestrator
        .start_build(manifest, "ctx", "k", None)
        .unwrap();
    let lines = finished_logs(&state).await;

    assert_eq!(lines.last().unwrap(), "BUILD FAILED");
    assert!(
        lines
            .iter()
            .any(|l| l.contains("timeout waiting for agent results (2/3 received)")),
        "missing shortfall diagnostic in {lines:?}"
    );
    assert_eq!(
        state.error().unwrap(),
        "timeout waiting for agent results (2/3 received)"
    );
    assert!(h.pusher.pushes().is_empty());
}

#[tokio::test]
async fn duplicate_result_posts_are_idempotent() {
    let executor = StubExecutor::new(WorkerScript::Succeed)
        .with_override("amd64", WorkerScript::SucceedTwice);
    let h = harness(executor);
    let manifest =
        b"global:\n  kaniko:\n    destination: \"r/a:v1\"\nbake:\n  - arch: amd64\n  - arch: arm64\n";

    let (_, state) = h
        .orchestrator
        .start_build(manifest, "ctx", "k", None)
        .unwrap();
    let lines = finished_logs(&state).await;

    assert_eq!(state.results_received(), 2);
    assert_eq!(lines.last().unwrap(), "BUILD SUCCEEDED");
    assert!(lines.iter().any(|l| l.contains("duplicate result for task amd64")));
    assert_eq!(h.pusher.pushes().len(), 1);
}

#[tokio::test]
async fn worker_failure_fails_the_build_and_skips_assembly() {
    let executor =
        StubExecutor::new(WorkerScript::Succeed).with_override("arm64", WorkerScript::Fail("exit=1"));
    let h = harness(executor);
    let manifest =
        b"global:\n  kaniko:\n    destination: \"r/a:v1\"\nbake:\n  - arch: amd64\n  - arch: arm64\n";

    let (_, state) = h
        .orchestrator
        .start_build(manifest, "ctx", "k", None)
        .unwrap();
    let lines = finished_logs(&state).await;

    // Both tasks ran to completion despite the failure.
    assert_eq!(h.executor.dispatched().len(), 2);
    assert_eq!(state.error().unwrap(), "task arm64 failed: exit=1");
    assert_eq!(lines.last().unwrap(), "BUILD FAILED");
    assert!(h.pusher.pushes().is_empty());
}

#[tokio::test]
async fn validation_errors_surface_synchronously() {
    let h = harness(StubExecutor::new(WorkerScript::Succeed));
    let err = h
        .orchestrator
        .start_build(b"bake:\n  - {}\n", "ctx", "k", None)
        .unwrap_err();
    assert!(err.to_string().contains("architecture"));
    assert!(h.registry.list_ids().is_empty());
}

// HTTP surface.

fn app(h: &Harness, auth_token: Option<&str>) -> axum::Router {
    router(AppState {
        registry: h.registry.clone(),
        orchestrator: h.orchestrator.clone(),
        context_bucket: "ctx".to_string(),
        auth_token: auth_token.map(str::to_string),
    })
}

#[tokio::test]
async fn submit_then_ingest_then_stream() {
    // Silent worker: the test plays the worker's callbacks over HTTP.
    let h = harness(StubExecutor::new(WorkerScript::Silent));
    let manifest = "global:\n  arch: amd64\n  kaniko:\n    destination: \"r/a:v1\"\nbake:\n  - {}\n";

    let response = app(&h, None)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/build?context_key=ctx%2Fapp.tar.gz&service_name=api")
                .body(Body::from(manifest))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let accepted: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(accepted["status"], "started");
    let build_id = accepted["buildID"].as_str().unwrap().to_string();
    assert!(build_id.ends_with("-api"));

    let response = app(&h, None)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/build/{build_id}/logs/ingest?task=amd64"))
                .body(Body::from("step 1/3\nstep 2/3\n\nstep 3/3\n"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let state = h.registry.get(&build_id).unwrap();
    assert!(state.ingest_done_for("amd64"));

    let payload = serde_json::json!({
        "taskId": "amd64",
        "arch": "amd64",
        "imageDigest": "sha256:abc",
        "success": true,
        "error": "",
    });
    let response = app(&h, None)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/build/{build_id}/result"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Wait for the build to finish before consuming the stream so the
    // response body terminates.
    let mut done = state.done_rx();
    done.wait_for(|done| *done).await.unwrap();

    let response = app(&h, None)
        .oneshot(
            Request::builder()
                .uri(format!("/build/{build_id}/logs"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let entries: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(entries.iter().any(|e| e["message"] == "step 2/3"));
    assert_eq!(entries.last().unwrap()["message"], "BUILD SUCCEEDED");
    assert_eq!(entries.last().unwrap()["level"], "info");

    // Drained builds are dropped from the registry.
    assert!(h.registry.get(&build_id).is_none());
}

#[tokio::test]
async fn result_endpoint_prefers_query_task_over_body() {
    let h = harness(StubExecutor::new(WorkerScript::Silent));
    let manifest = "global:\n  kaniko:\n    destination: \"r/a:v1\"\nbake:\n  - arch: amd64\n  - arch: arm64\n";
    let (build_id, state) = h
        .orchestrator
        .start_build(manifest.as_bytes(), "ctx", "k", None)
        .unwrap();

    let payload = serde_json::json!({
        "taskId": "bogus",
        "arch": "amd64",
        "imageDigest": "sha256:abc",
        "success": true,
        "error": "",
    });
    let response = app(&h, None)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/build/{build_id}/result?task=amd64"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.result_for("amd64").unwrap().image_digest, "sha256:abc");
    assert!(state.result_for("bogus").is_none());
}

#[tokio::test]
async fn unknown_build_is_404_and_bad_manifest_is_400() {
    let h = harness(StubExecutor::new(WorkerScript::Succeed));

    let response = app(&h, None)
        .oneshot(
            Request::builder()
                .uri("/build/b-nope/logs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app(&h, None)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/build?context_key=k")
                .body(Body::from("bake:\n  - {}\n"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_task_id_is_400() {
    let h = harness(StubExecutor::new(WorkerScript::Silent));
    let manifest = "bake:\n  - arch: amd64\n";
    let (build_id, _) = h
        .orchestrator
        .start_build(manifest.as_bytes(), "ctx", "k", None)
        .unwrap();

    let payload = serde_json::json!({
        "arch": "amd64",
        "imageDigest": "sha256:abc",
        "success": true,
    });
    let response = app(&h, None)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/build/{build_id}/result"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn bearer_token_gates_build_routes_but_not_health() {
    let h = harness(StubExecutor::new(WorkerScript::Succeed));

    let response = app(&h, Some("secret"))
        .oneshot(
            Request::builder()
                .uri("/build/b-x/logs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app(&h, Some("secret"))
        .oneshot(
            Request::builder()
                .uri("/build/b-x/logs")
                .header(header::AUTHORIZATION, "Bearer secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app(&h, Some("secret"))
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
