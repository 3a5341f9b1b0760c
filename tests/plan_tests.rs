//! Integration tests for the plan pipeline: interpret → validate → execute.

mod common;

use common::InMemoryBackend;
use enclaverun::enclave::{EnclaveHandle, EnclaveId, EnclaveManager};
use enclaverun::plan::{
    ErrorKind, InMemoryContentProvider, Interpreter, PlanExecutor, PlanValidator, ResponseLine,
    ValidatorEnvironment, DEFAULT_SCRIPT_FILENAME,
};
use enclaverun::service::{ServiceId, ServiceStatus};
use enclaverun::Error;
use std::sync::Arc;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

struct Fixture {
    backend: Arc<InMemoryBackend>,
    enclave: Arc<EnclaveHandle>,
    // Held for the lifetime of the fixture so the data dir survives.
    _temp: TempDir,
    _manager: EnclaveManager,
}

async fn fixture() -> Fixture {
    let backend = Arc::new(InMemoryBackend::new());
    let temp = TempDir::new().unwrap();
    let manager = EnclaveManager::new(backend.clone(), temp.path().to_path_buf());
    let enclave = manager
        .create_enclave(&EnclaveId::new("test-enclave"), false)
        .await
        .unwrap();
    Fixture {
        backend,
        enclave,
        _temp: temp,
        _manager: manager,
    }
}

/// Runs the whole pipeline, returning the collected stream.
async fn run_script(fixture: &Fixture, script: &str, dry_run: bool) -> Vec<ResponseLine> {
    let provider = InMemoryContentProvider::new();
    let plan = match Interpreter::new(&provider).interpret(
        script,
        DEFAULT_SCRIPT_FILENAME,
        &serde_json::json!({}),
    ) {
        Ok(plan) => plan,
        Err(e) => {
            return vec![
                ResponseLine::Error {
                    kind: ErrorKind::Interpretation,
                    message: e.to_string(),
                },
                ResponseLine::RunFinished {
                    success: false,
                    output: None,
                },
            ]
        }
    };

    let mut environment = ValidatorEnvironment::new(
        fixture
            .enclave
            .network
            .service_ids()
            .await
            .into_iter()
            .map(|id| id.to_string())
            .collect(),
        fixture
            .enclave
            .artifacts
            .list()
            .unwrap()
            .into_iter()
            .collect(),
    );
    if let Err(e) = PlanValidator::validate(&plan.instructions, &mut environment) {
        return vec![
            ResponseLine::Error {
                kind: ErrorKind::Validation,
                message: e.to_string(),
            },
            ResponseLine::RunFinished {
                success: false,
                output: None,
            },
        ];
    }

    let executor = PlanExecutor::new(Arc::clone(&fixture.enclave));
    let mut rx = executor.execute(dry_run, plan.instructions, plan.return_value);
    let mut lines = Vec::new();
    while let Some(line) = rx.recv().await {
        lines.push(line);
    }
    lines
}

fn run_finished(lines: &[ResponseLine]) -> (bool, Option<serde_json::Value>) {
    match lines.last() {
        Some(ResponseLine::RunFinished { success, output }) => (*success, output.clone()),
        other => panic!("stream did not end with run-finished: {other:?}"),
    }
}

// =============================================================================
// Happy path (scenario: one add_service)
// =============================================================================

#[tokio::test]
async fn test_add_service_stream_and_effect() {
    let fixture = fixture().await;
    let script =
        "add_service(id=\"db\", config(image=\"postgres\", ports={\"pg\": port(5432)}))";
    let lines = run_script(&fixture, script, false).await;

    // progress(1/1), instruction, result, run-finished(success).
    assert_eq!(lines.len(), 4);
    match &lines[0] {
        ResponseLine::Progress { step, total, .. } => {
            assert_eq!((*step, *total), (1, 1));
        }
        other => panic!("expected progress, got {other:?}"),
    }
    match &lines[1] {
        ResponseLine::Instruction {
            canonical,
            position,
            name,
            ..
        } => {
            assert_eq!(name, "add_service");
            // Canonical rendering matches the script excerpt.
            assert_eq!(canonical, script);
            assert_eq!((position.line, position.column), (1, 1));
        }
        other => panic!("expected instruction, got {other:?}"),
    }
    match &lines[2] {
        ResponseLine::InstructionResult { result } => {
            assert!(result.starts_with("Service 'db' added with guid 'db-"));
        }
        other => panic!("expected result, got {other:?}"),
    }
    let (success, _) = run_finished(&lines);
    assert!(success);

    // The service is live with its declared port.
    let info = fixture
        .enclave
        .network
        .get_service_info(&ServiceId::new("db"))
        .await
        .unwrap();
    assert_eq!(info.status, ServiceStatus::Running);
    assert_eq!(info.private_ports["pg"].number, 5432);
}

#[tokio::test]
async fn test_return_value_resolves_future_references() {
    let fixture = fixture().await;
    let script = "db = add_service(id=\"db\", config(image=\"postgres\"))\ndb";
    let lines = run_script(&fixture, script, false).await;
    let (success, output) = run_finished(&lines);
    assert!(success);

    let ip = fixture
        .enclave
        .network
        .get_service_info(&ServiceId::new("db"))
        .await
        .unwrap()
        .registration
        .private_ip;
    let output = output.unwrap();
    assert_eq!(output["ip_address"], serde_json::json!(ip.to_string()));
}

#[tokio::test]
async fn test_future_reference_flows_into_later_instruction() {
    let fixture = fixture().await;
    let script = "\
db = add_service(id=\"db\", config(image=\"postgres\"))
add_service(id=\"app\", config(image=\"web\", env={\"DB_HOST\": \"{{service:db:ip_address}}\"}))";
    let lines = run_script(&fixture, script, false).await;
    let (success, _) = run_finished(&lines);
    assert!(success);

    let db_ip = fixture
        .enclave
        .network
        .get_service_info(&ServiceId::new("db"))
        .await
        .unwrap()
        .registration
        .private_ip;
    let app_guid = fixture
        .enclave
        .network
        .get_service_info(&ServiceId::new("app"))
        .await
        .unwrap()
        .registration
        .guid;
    // The backend saw the resolved IP, not the token.
    let config = fixture
        .backend
        .config_of(&EnclaveId::new("test-enclave"), &app_guid)
        .unwrap();
    assert_eq!(config.env["DB_HOST"], db_ip.to_string());
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_duplicate_of_live_service_is_validation_error() {
    let fixture = fixture().await;
    fixture
        .enclave
        .network
        .register_service(&ServiceId::new("db"), None)
        .await
        .unwrap();

    let script = "\n add_service(id=\"db\", config(image=\"postgres\"))";
    let lines = run_script(&fixture, script, false).await;

    assert_eq!(lines.len(), 2);
    match &lines[0] {
        ResponseLine::Error { kind, message } => {
            assert_eq!(*kind, ErrorKind::Validation);
            assert!(message.contains("already exists"));
            // Cites the call site: line 2 of the script.
            assert!(message.contains("main.plan[2:2]"));
        }
        other => panic!("expected error line, got {other:?}"),
    }
    let (success, _) = run_finished(&lines);
    assert!(!success);
    // Nothing was created beyond the pre-existing registration.
    assert_eq!(fixture.enclave.network.services().await.len(), 1);
}

#[tokio::test]
async fn test_duplicate_declaration_in_script_is_interpretation_error() {
    let fixture = fixture().await;
    let script = "\
add_service(id=\"db\", config(image=\"postgres\"))
add_service(id=\"db\", config(image=\"redis\"))";
    let lines = run_script(&fixture, script, false).await;

    match &lines[0] {
        ResponseLine::Error { kind, message } => {
            assert_eq!(*kind, ErrorKind::Interpretation);
            assert!(message.contains("declared twice"));
        }
        other => panic!("expected error line, got {other:?}"),
    }
    // Interpretation failures have no side effects.
    assert!(fixture.enclave.network.services().await.is_empty());
}

#[tokio::test]
async fn test_unknown_builtin_is_interpretation_error() {
    let fixture = fixture().await;
    let lines = run_script(&fixture, "launch_rocket(id=\"x\")", false).await;
    match &lines[0] {
        ResponseLine::Error { kind, message } => {
            assert_eq!(*kind, ErrorKind::Interpretation);
            assert!(message.contains("unknown built-in 'launch_rocket'"));
        }
        other => panic!("expected error line, got {other:?}"),
    }
}

#[tokio::test]
async fn test_execution_error_stops_the_run() {
    let fixture = fixture().await;
    fixture.backend.fail_starts_of("broken");
    let script = "\
add_service(id=\"a\", config(image=\"broken\"))
add_service(id=\"b\", config(image=\"fine\"))";
    let lines = run_script(&fixture, script, false).await;

    // progress, instruction, error, run-finished: the second instruction
    // never starts.
    let error_count = lines
        .iter()
        .filter(|l| matches!(l, ResponseLine::Error { .. }))
        .count();
    assert_eq!(error_count, 1);
    match lines
        .iter()
        .find(|l| matches!(l, ResponseLine::Error { .. }))
        .unwrap()
    {
        ResponseLine::Error { kind, message } => {
            assert_eq!(*kind, ErrorKind::Execution);
            assert!(message.contains("number 1"));
            assert!(message.contains("add_service(id=\"a\""));
        }
        _ => unreachable!(),
    }
    let (success, _) = run_finished(&lines);
    assert!(!success);
    assert!(fixture
        .enclave
        .network
        .get_service_info(&ServiceId::new("b"))
        .await
        .is_err());
}

// =============================================================================
// Dry run
// =============================================================================

#[tokio::test]
async fn test_dry_run_emits_lines_without_effects() {
    let fixture = fixture().await;
    let script = "add_service(id=\"db\", config(image=\"postgres\"))";
    let lines = run_script(&fixture, script, true).await;

    assert!(lines
        .iter()
        .any(|l| matches!(l, ResponseLine::Instruction { .. })));
    assert!(!lines
        .iter()
        .any(|l| matches!(l, ResponseLine::InstructionResult { .. })));
    let (success, _) = run_finished(&lines);
    assert!(success);
    assert!(fixture.enclave.network.services().await.is_empty());
}

// =============================================================================
// Artifacts in plans
// =============================================================================

#[tokio::test]
async fn test_render_and_mount_artifacts() {
    let fixture = fixture().await;
    let script = "\
cfg = render_templates(config={\"/a.txt\": template_data(template=\"{{.x}}\", data={\"x\": 1})}, name=\"cfg\")
add_service(id=\"app\", config(image=\"web\", files={\"cfg\": \"/etc/app\"}))";
    let lines = run_script(&fixture, script, false).await;
    let (success, _) = run_finished(&lines);
    assert!(success);

    // The artifact exists and was expanded for the mount.
    let artifacts = fixture.enclave.artifacts.list().unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(fixture.backend.expanded_artifacts(), artifacts);

    // The backend saw the uuid, not the plan-level name.
    let app_guid = fixture
        .enclave
        .network
        .get_service_info(&ServiceId::new("app"))
        .await
        .unwrap()
        .registration
        .guid;
    let config = fixture
        .backend
        .config_of(&EnclaveId::new("test-enclave"), &app_guid)
        .unwrap();
    assert_eq!(
        config.files_artifact_mounts[&artifacts[0]],
        "/etc/app".to_string()
    );
}

#[tokio::test]
async fn test_upload_and_render_yield_distinct_uuids() {
    let fixture = fixture().await;
    let mut provider = InMemoryContentProvider::new();
    provider.insert("files/seed.tgz", b"fake tarball".to_vec());

    let script = "\
up = upload_files(src=\"files/seed.tgz\")
render_templates(config={\"/a.txt\": template_data(template=\"{{.x}}\", data={\"x\": 1})})";
    let plan = Interpreter::new(&provider)
        .interpret(script, DEFAULT_SCRIPT_FILENAME, &serde_json::json!({}))
        .unwrap();
    let mut environment = ValidatorEnvironment::default();
    PlanValidator::validate(&plan.instructions, &mut environment).unwrap();

    let executor = PlanExecutor::new(Arc::clone(&fixture.enclave));
    let mut rx = executor.execute(false, plan.instructions, plan.return_value);
    let mut success = false;
    while let Some(line) = rx.recv().await {
        if let ResponseLine::RunFinished { success: s, .. } = line {
            success = s;
        }
    }
    assert!(success);

    let artifacts = fixture.enclave.artifacts.list().unwrap();
    assert_eq!(artifacts.len(), 2);
    assert_ne!(artifacts[0], artifacts[1]);
}

#[tokio::test]
async fn test_mount_of_unknown_artifact_is_interpretation_error() {
    let fixture = fixture().await;
    let script = "add_service(id=\"app\", config(image=\"web\", files={\"nope\": \"/etc\"}))";
    let lines = run_script(&fixture, script, false).await;
    match &lines[0] {
        ResponseLine::Error { kind, message } => {
            assert_eq!(*kind, ErrorKind::Interpretation);
            assert!(message.contains("unknown artifact identifier 'nope'"));
        }
        other => panic!("expected error line, got {other:?}"),
    }
}

// =============================================================================
// Tasks and waits
// =============================================================================

#[tokio::test]
async fn test_run_sh_records_result_and_cleans_up() {
    let fixture = fixture().await;
    fixture.backend.respond_to_exec("sh", 0, "hello\n");
    let script = "result = run_sh(run=\"echo hello\")\nresult";
    let lines = run_script(&fixture, script, false).await;
    let (success, output) = run_finished(&lines);
    assert!(success);

    let output = output.unwrap();
    assert_eq!(output["code"], serde_json::json!("0"));
    assert_eq!(output["output"], serde_json::json!("hello\n"));
    // The task container is gone.
    assert!(fixture.enclave.network.services().await.is_empty());
}

#[tokio::test]
async fn test_exec_instruction_requires_known_service() {
    let fixture = fixture().await;
    let script = "exec(service_id=\"ghost\", command=[\"ls\"])";
    let lines = run_script(&fixture, script, false).await;
    match &lines[0] {
        ResponseLine::Error { kind, .. } => assert_eq!(*kind, ErrorKind::Validation),
        other => panic!("expected error line, got {other:?}"),
    }
}

// =============================================================================
// Interpreter purity
// =============================================================================

#[tokio::test]
async fn test_interpretation_is_deterministic() {
    let provider = InMemoryContentProvider::new();
    let script = "\
add_service(id=\"db\", config(image=\"postgres\", ports={\"pg\": port(5432)}))
run_sh(run=\"echo hi\")";
    let interpret = || {
        Interpreter::new(&provider)
            .interpret(script, DEFAULT_SCRIPT_FILENAME, &serde_json::json!({"n": 1}))
            .unwrap()
    };
    let plan_a = interpret();
    let plan_b = interpret();

    assert_eq!(plan_a.instructions.len(), plan_b.instructions.len());
    for (a, b) in plan_a.instructions.iter().zip(plan_b.instructions.iter()) {
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.position, b.position);
    }
    assert_eq!(plan_a.return_value, plan_b.return_value);
}

#[tokio::test]
async fn test_params_are_visible_to_the_script() {
    let fixture = fixture().await;
    let provider = InMemoryContentProvider::new();
    let plan = Interpreter::new(&provider)
        .interpret("params", DEFAULT_SCRIPT_FILENAME, &serde_json::json!({"x": 7}))
        .unwrap();
    let executor = PlanExecutor::new(Arc::clone(&fixture.enclave));
    let mut rx = executor.execute(false, plan.instructions, plan.return_value);
    let mut output = None;
    while let Some(line) = rx.recv().await {
        if let ResponseLine::RunFinished { output: o, .. } = line {
            output = o;
        }
    }
    assert_eq!(output.unwrap(), serde_json::json!({"x": 7}));
}

// =============================================================================
// Error taxonomy
// =============================================================================

#[tokio::test]
async fn test_error_kinds_map_to_pipeline_stages() {
    // Interpretation: parse error.
    let provider = InMemoryContentProvider::new();
    let err = Interpreter::new(&provider)
        .interpret("add_service(", DEFAULT_SCRIPT_FILENAME, &serde_json::json!({}))
        .unwrap_err();
    assert!(matches!(err, Error::Interpretation { .. }));

    // Validation: dangling reference.
    let plan = Interpreter::new(&provider)
        .interpret(
            "remove_service(id=\"ghost\")",
            DEFAULT_SCRIPT_FILENAME,
            &serde_json::json!({}),
        )
        .unwrap();
    let mut environment = ValidatorEnvironment::default();
    let err = PlanValidator::validate(&plan.instructions, &mut environment).unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
}
