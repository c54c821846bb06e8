use super::*;

#[tokio::test]
async fn file_crud_round_trip() {
    let test_app = TestApp::new();
    let auth = test_app.bearer(ALLOWED);
    let headers = [("authorization", auth.as_str())];

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/files/mkdir",
        Some(json!({ "path": "notes" })),
        &headers,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["isDir"], true);

    let (status, _, body) = send_request_raw(
        &test_app.app,
        Method::PUT,
        "/v1/files/content?path=notes/todo.txt",
        b"# todo\n- ship it\n".to_vec(),
        &headers,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entry = parse_json(&body);
    assert_eq!(entry["name"], "todo.txt");
    assert_eq!(entry["size"], 17);
    assert_eq!(
        std::fs::read_to_string(test_app.root.path().join("notes/todo.txt")).expect("on disk"),
        "# todo\n- ship it\n"
    );

    let (status, response_headers, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/files/content?path=notes/todo.txt",
        None,
        &headers,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"# todo\n- ship it\n");
    assert_eq!(response_headers[header::CONTENT_TYPE], "text/plain");

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, "/v1/files", None, &headers).await;
    assert_eq!(status, StatusCode::OK);
    let listing = parse_json(&body);
    assert_eq!(listing["path"], "");
    assert_eq!(listing["entries"][0]["name"], "notes");

    let (status, _, _) = send_request(
        &test_app.app,
        Method::DELETE,
        "/v1/files?path=notes",
        None,
        &headers,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(!test_app.root.path().join("notes").exists());

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/files/content?path=notes/todo.txt",
        None,
        &headers,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem_type(&body), "urn:console-gateway:error:not_found");
}

#[tokio::test]
async fn listing_puts_directories_first() {
    let test_app = TestApp::new();
    std::fs::write(test_app.root.path().join("a.txt"), "a").expect("write");
    std::fs::create_dir(test_app.root.path().join("zeta")).expect("mkdir");
    std::fs::write(test_app.root.path().join("B.txt"), "b").expect("write");
    let auth = test_app.bearer(ALLOWED);

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/files?path=/",
        None,
        &[("authorization", auth.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<String> = parse_json(&body)["entries"]
        .as_array()
        .expect("entries")
        .iter()
        .map(|entry| entry["name"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(names, ["zeta", "a.txt", "B.txt"]);
}

#[tokio::test]
async fn paths_outside_root_are_rejected() {
    let test_app = TestApp::new();
    let auth = test_app.bearer(ALLOWED);
    let headers = [("authorization", auth.as_str())];

    for uri in [
        "/v1/files?path=..",
        "/v1/files/content?path=../../etc/passwd",
        "/v1/files/content?path=notes/../../secret",
        "/v1/files/content?path=/etc/passwd",
    ] {
        let (status, _, body) =
            send_request(&test_app.app, Method::GET, uri, None, &headers).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(problem_type(&body), "urn:console-gateway:error:invalid_path");
    }

    let (status, _, _) = send_request_raw(
        &test_app.app,
        Method::PUT,
        "/v1/files/content?path=../escaped.txt",
        b"nope".to_vec(),
        &headers,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let parent = test_app.root.path().parent().expect("root has a parent");
    assert!(!parent.join("escaped.txt").exists());

    let (status, _, _) =
        send_request(&test_app.app, Method::DELETE, "/v1/files", None, &headers).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(test_app.root.path().exists());
}
