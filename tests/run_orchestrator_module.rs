use reflow::github::GitHubClient;
use reflow::home::Home;
use reflow::run::{Orchestrator, RunError, RunOverrides, RunTuning};
use reflow::shared::logging::DebugLog;
use reflow::template::Engine;
use serde_json::Value;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

static ENV_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone)]
struct RecordedRequest {
    method: String,
    path: String,
    auth_header: String,
    body: String,
}

struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl MockResponse {
    fn json(body: &str) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: body.as_bytes().to_vec(),
        }
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn redirect(location: &str) -> Self {
        Self {
            status: 302,
            headers: vec![("Location".to_string(), location.to_string())],
            body: Vec::new(),
        }
    }

    fn binary(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: vec![(
                "Content-Type".to_string(),
                "application/octet-stream".to_string(),
            )],
            body,
        }
    }
}

/// Stub GitHub API. Serves until it receives the shutdown request that
/// `finish` issues, so tests with a timing-dependent request count stay
/// deterministic.
struct MockGitHubServer {
    base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockGitHubServer {
    fn start<F>(responder: F) -> Self
    where
        F: Fn(&str, &str) -> MockResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let requests_for_thread = Arc::clone(&requests);

        let handle = thread::spawn(move || loop {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

            let mut request_line = String::new();
            reader
                .read_line(&mut request_line)
                .expect("read request line");
            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or("GET").to_string();
            let path = parts.next().unwrap_or("/").to_string();

            let mut auth_header = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("read header");
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                let lower = line.to_ascii_lowercase();
                if lower.starts_with("authorization:") {
                    auth_header = line
                        .split_once(':')
                        .map(|(_, v)| v.trim().to_string())
                        .unwrap_or_default();
                }
                if lower.starts_with("content-length:") {
                    content_length = line
                        .split_once(':')
                        .map(|(_, v)| v.trim().parse::<usize>().unwrap_or(0))
                        .unwrap_or(0);
                }
            }

            let mut body = vec![0_u8; content_length];
            if content_length > 0 {
                reader.read_exact(&mut body).expect("read body");
            }
            let body = String::from_utf8_lossy(&body).to_string();

            if path == "/__shutdown" {
                let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                break;
            }

            requests_for_thread
                .lock()
                .expect("lock requests")
                .push(RecordedRequest {
                    method: method.clone(),
                    path: path.clone(),
                    auth_header,
                    body,
                });

            let response = responder(&method, &path);
            let mut head = format!("HTTP/1.1 {} Mock\r\n", response.status);
            for (name, value) in &response.headers {
                head.push_str(&format!("{name}: {value}\r\n"));
            }
            head.push_str(&format!(
                "Content-Length: {}\r\nConnection: close\r\n\r\n",
                response.body.len()
            ));
            stream.write_all(head.as_bytes()).expect("write head");
            stream.write_all(&response.body).expect("write body");
        });

        Self {
            base_url: format!("http://{}", addr),
            requests,
            handle: Some(handle),
        }
    }

    fn finish(mut self) -> Vec<RecordedRequest> {
        let addr = self.base_url.trim_start_matches("http://").to_string();
        let mut stream = TcpStream::connect(&addr).expect("connect for shutdown");
        stream
            .write_all(b"GET /__shutdown HTTP/1.1\r\nHost: mock\r\nConnection: close\r\n\r\n")
            .expect("write shutdown");
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
        if let Some(handle) = self.handle.take() {
            handle.join().expect("join mock server");
        }
        self.requests.lock().expect("lock requests").clone()
    }
}

const RUN_ID: &str = "run-e2e";

fn fast_tuning() -> RunTuning {
    RunTuning {
        per_page: 10,
        warmup: Duration::from_millis(1),
        interval: Duration::from_millis(10),
        max_lookup: Duration::from_millis(500),
    }
}

fn seed_run(home: &Home) {
    home.init().expect("init home");
    home.init_run(RUN_ID).expect("init run");

    let context = home.run_context_dir(RUN_ID);
    fs::write(
        context.join("github.json"),
        r#"{"event_name":"push","repository":"acme/widgets","ref":"refs/heads/main","sha":"abc123"}"#,
    )
    .expect("write github.json");
    fs::write(
        context.join("manifest.yaml"),
        "uses: acme/widgets/.github/workflows/build.yml@main\nid: run-e2e\ndebug: \"false\"\n",
    )
    .expect("write manifest.yaml");
    fs::write(
        home.run_inputs_file(RUN_ID),
        "name: \"{{ reflow.sha }}\"\n",
    )
    .expect("write inputs.yaml");
}

fn outputs_archive() -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer
            .start_file("outputs.yaml", options)
            .expect("start outputs entry");
        writer.write_all(b"x: 1\n").expect("write outputs entry");
        writer
            .start_file("extra.yaml", options)
            .expect("start extra entry");
        writer.write_all(b"y: 2\n").expect("write extra entry");
        writer.finish().expect("finish archive");
    }
    cursor.into_inner()
}

fn run_listing(conclusion: &str) -> String {
    format!(
        r#"{{"workflow_runs":[{{"id":7,"head_branch":"reflow/run-e2e","status":"completed","conclusion":"{conclusion}","html_url":"http://runs/7"}}]}}"#
    )
}

fn base_ref_response(method: &str, path: &str) -> Option<MockResponse> {
    match (method, path) {
        ("GET", "/repos/acme/widgets/git/ref/heads/main") => Some(MockResponse::json(
            r#"{"ref":"refs/heads/main","object":{"sha":"abc123"}}"#,
        )),
        ("POST", "/repos/acme/widgets/git/refs") => Some(MockResponse::json(
            r#"{"ref":"refs/heads/reflow/run-e2e","object":{"sha":"abc123"}}"#,
        )),
        ("POST", "/repos/acme/widgets/actions/workflows/build.yml/dispatches") => {
            Some(MockResponse::empty(204))
        }
        ("DELETE", "/repos/acme/widgets/git/refs/heads/reflow/run-e2e") => {
            Some(MockResponse::empty(204))
        }
        _ => None,
    }
}

fn orchestrate(home: &Home) -> Result<serde_json::Map<String, Value>, RunError> {
    let github = GitHubClient::new("test-token".to_string());
    let engine = Engine::new();
    let log = DebugLog::new(false);
    let orchestrator = Orchestrator {
        github: &github,
        engine: &engine,
        home,
        log: &log,
        tuning: fast_tuning(),
        overrides: RunOverrides::default(),
    };
    let cancel = AtomicBool::new(false);
    orchestrator.run(&cancel, RUN_ID)
}

#[test]
fn successful_run_collects_and_persists_outputs() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    let temp = tempdir().expect("tempdir");
    let home = Home::new(temp.path().to_path_buf());
    seed_run(&home);

    let archive = outputs_archive();
    let server = MockGitHubServer::start(move |method, path| {
        if let Some(response) = base_ref_response(method, path) {
            return response;
        }
        match (method, path) {
            ("GET", p) if p.starts_with("/repos/acme/widgets/actions/workflows/build.yml/runs") => {
                MockResponse::json(&run_listing("success"))
            }
            ("GET", "/repos/acme/widgets/actions/runs/7/artifacts") => MockResponse::json(
                r#"{"artifacts":[{"id":9,"name":"reflow-outputs"},{"id":10,"name":"logs"}]}"#,
            ),
            ("GET", "/repos/acme/widgets/actions/artifacts/9/zip") => {
                MockResponse::redirect("/downloads/outputs.zip")
            }
            ("GET", "/downloads/outputs.zip") => MockResponse::binary(archive.clone()),
            _ => MockResponse::empty(404),
        }
    });
    std::env::set_var("REFLOW_GITHUB_API_BASE", &server.base_url);

    let outputs = orchestrate(&home).expect("run succeeds");
    std::env::remove_var("REFLOW_GITHUB_API_BASE");

    assert_eq!(outputs.get("x"), Some(&Value::from(1)));
    assert_eq!(
        outputs.get("extra").and_then(|v| v.get("y")),
        Some(&Value::from(2))
    );

    let persisted: Value = serde_json::from_slice(
        &fs::read(home.run_outputs_file(RUN_ID)).expect("read outputs.json"),
    )
    .expect("decode outputs.json");
    assert_eq!(persisted.get("x"), Some(&Value::from(1)));

    let requests = server.finish();
    let dispatch = requests
        .iter()
        .find(|r| r.path.ends_with("/dispatches"))
        .expect("dispatch request");
    assert_eq!(dispatch.auth_header, "Bearer test-token");
    let body: Value = serde_json::from_str(&dispatch.body).expect("dispatch body json");
    assert_eq!(body["ref"], Value::from("reflow/run-e2e"));
    assert_eq!(body["inputs"]["name"], Value::from("abc123"));

    let download = requests
        .iter()
        .find(|r| r.path == "/downloads/outputs.zip")
        .expect("redirect target fetched");
    assert_eq!(download.auth_header, "", "signed url fetch must drop the token");

    assert!(
        requests
            .iter()
            .any(|r| r.method == "DELETE" && r.path.ends_with("reflow/run-e2e")),
        "anchor ref must be deleted after success"
    );
}

#[test]
fn failed_conclusion_reports_run_failed_and_skips_artifacts() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    let temp = tempdir().expect("tempdir");
    let home = Home::new(temp.path().to_path_buf());
    seed_run(&home);

    let server = MockGitHubServer::start(|method, path| {
        if let Some(response) = base_ref_response(method, path) {
            return response;
        }
        match (method, path) {
            ("GET", p) if p.starts_with("/repos/acme/widgets/actions/workflows/build.yml/runs") => {
                MockResponse::json(&run_listing("failure"))
            }
            _ => MockResponse::empty(404),
        }
    });
    std::env::set_var("REFLOW_GITHUB_API_BASE", &server.base_url);

    let err = orchestrate(&home).expect_err("run must fail");
    std::env::remove_var("REFLOW_GITHUB_API_BASE");

    match err {
        RunError::RunFailed { conclusion, url } => {
            assert_eq!(conclusion, "failure");
            assert_eq!(url, "http://runs/7");
        }
        other => panic!("unexpected error: {other}"),
    }

    let requests = server.finish();
    assert!(
        !requests.iter().any(|r| r.path.contains("/artifacts")),
        "failed runs must not collect artifacts"
    );
    assert!(
        requests
            .iter()
            .any(|r| r.method == "DELETE" && r.path.ends_with("reflow/run-e2e")),
        "anchor ref must be deleted after failure"
    );
}

#[test]
fn missing_run_within_budget_times_out() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    let temp = tempdir().expect("tempdir");
    let home = Home::new(temp.path().to_path_buf());
    seed_run(&home);

    let server = MockGitHubServer::start(|method, path| {
        if let Some(response) = base_ref_response(method, path) {
            return response;
        }
        match (method, path) {
            ("GET", p) if p.starts_with("/repos/acme/widgets/actions/workflows/build.yml/runs") => {
                MockResponse::json(r#"{"workflow_runs":[]}"#)
            }
            _ => MockResponse::empty(404),
        }
    });
    std::env::set_var("REFLOW_GITHUB_API_BASE", &server.base_url);

    let github = GitHubClient::new("test-token".to_string());
    let engine = Engine::new();
    let log = DebugLog::new(false);
    let orchestrator = Orchestrator {
        github: &github,
        engine: &engine,
        home: &home,
        log: &log,
        tuning: RunTuning {
            per_page: 10,
            warmup: Duration::from_millis(1),
            interval: Duration::from_millis(20),
            max_lookup: Duration::from_millis(60),
        },
        overrides: RunOverrides::default(),
    };
    let cancel = AtomicBool::new(false);
    let err = orchestrator.run(&cancel, RUN_ID).expect_err("lookup must time out");
    std::env::remove_var("REFLOW_GITHUB_API_BASE");

    assert!(
        matches!(err, RunError::LookupTimeout { .. }),
        "unexpected error: {err}"
    );

    let requests = server.finish();
    assert!(
        requests
            .iter()
            .any(|r| r.method == "DELETE" && r.path.ends_with("reflow/run-e2e")),
        "anchor ref must be deleted after a lookup timeout"
    );
}

#[test]
fn missing_outputs_artifact_yields_empty_outputs() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    let temp = tempdir().expect("tempdir");
    let home = Home::new(temp.path().to_path_buf());
    seed_run(&home);

    let server = MockGitHubServer::start(|method, path| {
        if let Some(response) = base_ref_response(method, path) {
            return response;
        }
        match (method, path) {
            ("GET", p) if p.starts_with("/repos/acme/widgets/actions/workflows/build.yml/runs") => {
                MockResponse::json(&run_listing("success"))
            }
            ("GET", "/repos/acme/widgets/actions/runs/7/artifacts") => {
                MockResponse::json(r#"{"artifacts":[{"id":10,"name":"logs"}]}"#)
            }
            _ => MockResponse::empty(404),
        }
    });
    std::env::set_var("REFLOW_GITHUB_API_BASE", &server.base_url);

    let outputs = orchestrate(&home).expect("run succeeds without outputs");
    std::env::remove_var("REFLOW_GITHUB_API_BASE");

    assert!(outputs.is_empty());
    let persisted: Value = serde_json::from_slice(
        &fs::read(home.run_outputs_file(RUN_ID)).expect("read outputs.json"),
    )
    .expect("decode outputs.json");
    assert_eq!(persisted, Value::Object(serde_json::Map::new()));

    server.finish();
}
