use super::*;

async fn exec(test_app: &TestApp, body: Value) -> (StatusCode, Value) {
    let auth = test_app.bearer(ALLOWED);
    let (status, _, response) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/terminal/exec",
        Some(body),
        &[("authorization", auth.as_str())],
    )
    .await;
    (status, parse_json(&response))
}

async fn exec_stream(test_app: &TestApp, body: Value) -> (StatusCode, Vec<u8>) {
    let auth = test_app.bearer(ALLOWED);
    let (status, _, response) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/terminal/exec/stream",
        Some(body),
        &[("authorization", auth.as_str())],
    )
    .await;
    (status, response)
}

#[cfg(unix)]
#[tokio::test]
async fn collected_exec_reports_exit_code() {
    let test_app = TestApp::new();
    let (status, result) = exec(&test_app, json!({ "command": "echo out; echo err >&2; exit 3" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "completed");
    assert_eq!(result["exitCode"], 3);
    let output = result["output"].as_str().expect("output");
    assert!(output.contains("out\n"));
    assert!(output.contains("err\n"));
}

#[cfg(unix)]
#[tokio::test]
async fn streamed_exec_emits_chunks_then_end() {
    let test_app = TestApp::new();
    let (status, body) = exec_stream(
        &test_app,
        json!({ "command": "printf 'one\\n'; sleep 0.2; printf 'two\\n'" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = parse_sse(&body);
    assert_eq!(chunk_text(&events), "one\ntwo\n");
    let end = end_event(&events);
    assert_eq!(end["status"], "completed");
    assert_eq!(end["exitCode"], 0);
}

#[cfg(unix)]
#[tokio::test]
async fn command_runs_in_requested_directory() {
    let test_app = TestApp::new();
    std::fs::create_dir(test_app.root.path().join("work")).expect("mkdir");
    let (status, result) = exec(&test_app, json!({ "command": "pwd", "cwd": "work" })).await;
    assert_eq!(status, StatusCode::OK);
    assert!(result["output"]
        .as_str()
        .expect("output")
        .trim_end()
        .ends_with("/work"));

    let (status, result) = exec(&test_app, json!({ "command": "pwd", "cwd": "../" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(result["type"], "urn:console-gateway:error:invalid_path");
}

#[cfg(unix)]
#[tokio::test]
async fn slow_command_times_out() {
    let test_app = TestApp::with_config(|config| {
        config.command_timeout = Duration::from_millis(500);
    });
    let started = std::time::Instant::now();
    let (status, body) = exec_stream(&test_app, json!({ "command": "echo begin; sleep 10" })).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(status, StatusCode::OK);
    let events = parse_sse(&body);
    assert_eq!(chunk_text(&events), "begin\n");
    let end = end_event(&events);
    assert_eq!(end["status"], "failed");
    assert_eq!(
        end["error"]["type"],
        "urn:console-gateway:error:execution_timeout"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn large_output_is_truncated_at_cap() {
    let test_app = TestApp::with_config(|config| {
        config.output_cap_bytes = 10;
    });
    let (status, result) = exec(&test_app, json!({ "command": "printf 0123456789ABCDEF" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "truncated");
    assert_eq!(result["output"], "0123456789");
    assert_eq!(
        result["error"]["type"],
        "urn:console-gateway:error:output_truncated"
    );
}

#[tokio::test]
async fn blocked_and_empty_commands_are_refused() {
    let test_app = TestApp::new();
    let (status, result) = exec(&test_app, json!({ "command": "sudo RM -RF /" })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(result["type"], "urn:console-gateway:error:command_blocked");
    assert_eq!(result["pattern"], "rm -rf");

    let (status, result) = exec(&test_app, json!({ "command": "  " })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(result["type"], "urn:console-gateway:error:invalid_request");
}
