//! Streaming generation benchmark against one host/model.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::probe::cancellable;
use crate::types::ModelStatus;

/// Outcome of one benchmark request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenchReport {
    pub status: ModelStatus,
    pub first_token_latency: Duration,
    pub tokens_per_sec: f64,
}

impl BenchReport {
    pub fn failed(status: ModelStatus) -> Self {
        Self {
            status,
            first_token_latency: Duration::ZERO,
            tokens_per_sec: 0.0,
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    done: bool,
}

/// Timing accumulator for a newline-delimited JSON stream.
///
/// Every well-formed chunk counts as one token. Latency is measured from the
/// request start to the first chunk, throughput over request start to the last.
#[derive(Debug)]
pub struct StreamMeter {
    start: Instant,
    pending: Vec<u8>,
    first: Option<Instant>,
    last: Option<Instant>,
    chunks: u64,
    done: bool,
}

impl StreamMeter {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            pending: Vec::new(),
            first: None,
            last: None,
            chunks: 0,
            done: false,
        }
    }

    /// Feed raw body bytes received at `at`. Returns true once a chunk carried `"done": true`.
    pub fn feed(&mut self, bytes: &[u8], at: Instant) -> bool {
        self.pending.extend_from_slice(bytes);
        while !self.done {
            let Some(pos) = self.pending.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.observe_line(&line, at);
        }
        self.done
    }

    /// Consume a trailing chunk that was not newline-terminated.
    pub fn finish_stream(&mut self, at: Instant) {
        if !self.done && !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.observe_line(&line, at);
        }
    }

    fn observe_line(&mut self, line: &[u8], at: Instant) {
        let line = line.trim_ascii();
        if line.is_empty() {
            return;
        }
        let Ok(chunk) = serde_json::from_slice::<GenerateChunk>(line) else {
            tracing::trace!("skipping malformed generate chunk");
            return;
        };
        self.first.get_or_insert(at);
        self.last = Some(at);
        self.chunks += 1;
        if chunk.done {
            self.done = true;
        }
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn report(&self) -> BenchReport {
        let (Some(first), Some(last)) = (self.first, self.last) else {
            return BenchReport::failed(ModelStatus::NoResponse);
        };
        let total = last.saturating_duration_since(self.start).as_secs_f64();
        let tokens_per_sec = if total > 0.0 {
            self.chunks as f64 / total
        } else {
            0.0
        };
        BenchReport {
            status: ModelStatus::Tested,
            first_token_latency: first.saturating_duration_since(self.start),
            tokens_per_sec,
        }
    }
}

/// Issues `POST /api/generate` with a fixed prompt and measures the reply stream.
#[derive(Debug, Clone)]
pub struct Benchmarker {
    client: reqwest::Client,
    port: u16,
    prompt: String,
    timeout: Duration,
}

impl Benchmarker {
    pub fn new(client: reqwest::Client, port: u16, prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            port,
            prompt: prompt.into(),
            timeout,
        }
    }

    /// Run one benchmark. Network failures become a status in the report; the
    /// only error is [`crate::ScanError::Cancelled`].
    pub async fn run(&self, ip: IpAddr, model: &str, cancel: &CancellationToken) -> Result<BenchReport> {
        let url = format!("http://{}/api/generate", SocketAddr::new(ip, self.port));
        let body = GenerateRequest {
            model,
            prompt: &self.prompt,
            stream: true,
        };

        let start = Instant::now();
        // The request timeout covers the whole exchange, body included.
        let request = self.client.post(url).timeout(self.timeout).json(&body).send();
        let response = match cancellable(cancel, request).await? {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(%ip, model, "generate request failed: {e}");
                return Ok(BenchReport::failed(ModelStatus::ConnectFailed));
            }
        };
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Ok(BenchReport::failed(ModelStatus::HttpError(status.as_u16())));
        }

        let mut meter = StreamMeter::new(start);
        let mut stream = response.bytes_stream();
        loop {
            match cancellable(cancel, stream.next()).await? {
                Some(Ok(bytes)) => {
                    if meter.feed(&bytes, Instant::now()) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(%ip, model, chunks = meter.chunks(), "generate stream ended early: {e}");
                    break;
                }
                None => {
                    meter.finish_stream(Instant::now());
                    break;
                }
            }
        }
        Ok(meter.report())
    }
}
