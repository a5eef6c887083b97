//! In-process stand-in for an Ollama host.
#![allow(dead_code)]

use std::convert::Infallible;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ollama_scan_rs::config::ScanConfig;
use serde_json::json;

#[derive(Clone, Debug)]
pub struct MockSpec {
    pub banner: &'static str,
    pub models: Vec<&'static str>,
    /// Chunks in a generate stream; the last one carries `"done": true`.
    pub chunks: usize,
    pub chunk_delay: Duration,
    pub generate_status: u16,
}

impl Default for MockSpec {
    fn default() -> Self {
        Self {
            banner: "Ollama is running",
            models: vec!["deepseek-r1:7b", "llama3:8b", "deepseek-r1:1.5b"],
            chunks: 5,
            chunk_delay: Duration::from_millis(10),
            generate_status: 200,
        }
    }
}

#[derive(Clone)]
struct MockState {
    spec: Arc<MockSpec>,
    hits: Arc<AtomicUsize>,
}

pub struct MockHost {
    pub port: u16,
    hits: Arc<AtomicUsize>,
}

impl MockHost {
    /// HTTP requests served so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub async fn spawn_mock(spec: MockSpec) -> MockHost {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = MockState {
        spec: Arc::new(spec),
        hits: hits.clone(),
    };
    let app = Router::new()
        .route("/", get(root))
        .route("/api/tags", get(tags))
        .route("/api/generate", post(generate))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    MockHost { port, hits }
}

async fn root(State(s): State<MockState>) -> impl IntoResponse {
    s.hits.fetch_add(1, Ordering::SeqCst);
    s.spec.banner
}

async fn tags(State(s): State<MockState>) -> impl IntoResponse {
    s.hits.fetch_add(1, Ordering::SeqCst);
    let models: Vec<_> = s.spec.models.iter().map(|m| json!({ "model": m })).collect();
    Json(json!({ "models": models }))
}

async fn generate(State(s): State<MockState>, Json(req): Json<serde_json::Value>) -> Response {
    s.hits.fetch_add(1, Ordering::SeqCst);
    if req["stream"] != true {
        return (StatusCode::BAD_REQUEST, "expected a streaming request").into_response();
    }
    if s.spec.generate_status != 200 {
        let code = StatusCode::from_u16(s.spec.generate_status).unwrap();
        return (code, "model failed to load").into_response();
    }
    let total = s.spec.chunks;
    let delay = s.spec.chunk_delay;
    let stream = futures::stream::unfold(0usize, move |i| async move {
        if i >= total {
            return None;
        }
        tokio::time::sleep(delay).await;
        let done = i + 1 == total;
        let line = format!("{}\n", json!({ "response": "tok", "done": done }));
        Some((Ok::<_, Infallible>(Bytes::from(line)), i + 1))
    });
    Body::from_stream(stream).into_response()
}

/// A port that accepts connections and never sends a byte.
pub async fn spawn_silent() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    port
}

/// Write `addresses` to the input file of a config rooted at `dir`.
pub fn config_for(dir: &Path, port: u16, addresses: &[&str]) -> ScanConfig {
    let config = ScanConfig {
        port,
        gateway: "aa:bb:cc:dd:ee:ff".into(),
        input: dir.join("ip.txt"),
        output: dir.join("results.csv"),
        state_file: dir.join("scan_state.json"),
        workers: 4,
        probe_timeout: Duration::from_secs(1),
        bench_timeout: Duration::from_secs(10),
        show_progress: false,
        print_results: false,
        ..ScanConfig::default()
    };
    std::fs::write(&config.input, addresses.join("\n")).unwrap();
    config
}

pub fn csv_rows(path: &Path) -> Vec<Vec<String>> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect()
}

pub fn csv_header(path: &Path) -> Vec<String> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader.headers().unwrap().iter().map(str::to_string).collect()
}
