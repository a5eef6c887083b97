use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::bench::Benchmarker;
use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::state::SharedState;
use crate::types::{sort_models, AddressOutcome, ModelRecord, ModelStatus, ScanResult};

/// How much of the root response is searched for the banner.
const BANNER_WINDOW: usize = 1024;

/// Await `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ScanError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Await `fut` for at most `limit` unless `cancel` fires first. `Ok(None)` on timeout.
pub(crate) async fn bounded<F: Future>(
    cancel: &CancellationToken,
    limit: Duration,
    fut: F,
) -> Result<Option<F::Output>> {
    cancellable(cancel, time::timeout(limit, fut))
        .await
        .map(|r| r.ok())
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    model: Option<String>,
    name: Option<String>,
}

/// Shared HTTP client for probes and benchmarks.
pub fn build_client(config: &ScanConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.probe_timeout)
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .no_proxy()
        .build()
        .map_err(|e| ScanError::Config(format!("failed to build http client: {e}")))
}

/// Per-address stages: reachability, identity, model listing, benchmark.
///
/// Each stage short-circuits the rest on failure. Every network call is bound
/// by its own timeout and by the shared cancellation token; the only error a
/// stage returns is [`ScanError::Cancelled`].
#[derive(Debug, Clone)]
pub struct ProbePipeline {
    config: Arc<ScanConfig>,
    client: reqwest::Client,
    bench: Benchmarker,
}

impl ProbePipeline {
    pub fn new(config: Arc<ScanConfig>, client: reqwest::Client) -> Self {
        let bench = Benchmarker::new(
            client.clone(),
            config.port,
            config.bench_prompt.clone(),
            config.bench_timeout,
        );
        Self {
            config,
            client,
            bench,
        }
    }

    /// Full pipeline for one address including the state bookkeeping: already
    /// processed addresses are skipped, everything else is marked processed
    /// once the stages have run, whatever their outcome. A cancelled address is
    /// left unmarked so a resumed run probes it again.
    pub async fn process(
        &self,
        ip: IpAddr,
        state: &SharedState,
        cancel: &CancellationToken,
    ) -> Result<AddressOutcome> {
        let address = ip.to_string();
        if state.is_processed(&address).await {
            return Ok(AddressOutcome::Skipped);
        }
        let outcome = self.probe(ip, cancel).await?;
        state.mark_processed(&address).await;
        tracing::debug!(%address, outcome = outcome.label(), "address processed");
        Ok(outcome)
    }

    /// Network stages only.
    pub async fn probe(&self, ip: IpAddr, cancel: &CancellationToken) -> Result<AddressOutcome> {
        if !self.is_reachable(ip, cancel).await? {
            return Ok(AddressOutcome::Unreachable);
        }
        if !self.is_service(ip, cancel).await? {
            return Ok(AddressOutcome::NoService);
        }
        let models = self.list_models(ip, cancel).await?;
        if models.is_empty() {
            return Ok(AddressOutcome::NoModel);
        }
        tracing::info!(%ip, models = ?models, "found models");

        let mut records = Vec::with_capacity(models.len());
        for name in models {
            let mut record = ModelRecord::discovered(name);
            if self.config.bench_enabled {
                let report = self.bench.run(ip, &record.name, cancel).await?;
                tracing::info!(
                    %ip,
                    model = %record.name,
                    status = %report.status,
                    latency_ms = report.first_token_latency.as_millis() as u64,
                    tokens_per_sec = report.tokens_per_sec,
                    "benchmark finished"
                );
                record.status = report.status;
                record.first_token_latency = report.first_token_latency;
                record.tokens_per_sec = report.tokens_per_sec;
            } else {
                record.status = ModelStatus::Untested;
            }
            records.push(record);
        }
        Ok(AddressOutcome::Modeled(ScanResult {
            address: ip.to_string(),
            models: records,
        }))
    }

    fn base_url(&self, ip: IpAddr) -> String {
        format!("http://{}", SocketAddr::new(ip, self.config.port))
    }

    async fn is_reachable(&self, ip: IpAddr, cancel: &CancellationToken) -> Result<bool> {
        let addr = SocketAddr::new(ip, self.config.port);
        match bounded(cancel, self.config.probe_timeout, TcpStream::connect(addr)).await? {
            Some(Ok(_stream)) => Ok(true),
            Some(Err(e)) => {
                tracing::trace!(%addr, "connect failed: {e}");
                Ok(false)
            }
            None => {
                tracing::trace!(%addr, "connect timed out");
                Ok(false)
            }
        }
    }

    async fn is_service(&self, ip: IpAddr, cancel: &CancellationToken) -> Result<bool> {
        let url = format!("{}/", self.base_url(ip));
        let banner = self.config.banner.as_str();
        let check = async {
            let mut response = self.client.get(url).send().await.ok()?;
            if response.status() != reqwest::StatusCode::OK {
                return None;
            }
            let mut head = Vec::with_capacity(BANNER_WINDOW);
            while head.len() < BANNER_WINDOW {
                match response.chunk().await {
                    Ok(Some(bytes)) => head.extend_from_slice(&bytes),
                    Ok(None) => break,
                    Err(_) => return None,
                }
            }
            head.truncate(BANNER_WINDOW);
            Some(String::from_utf8_lossy(&head).contains(banner))
        };
        let verified = bounded(cancel, self.config.probe_timeout, check)
            .await?
            .flatten()
            .unwrap_or(false);
        if !verified {
            tracing::debug!(%ip, "port open but service banner not found");
        }
        Ok(verified)
    }

    /// Matching model identifiers, ascending by size. Empty on any failure.
    async fn list_models(&self, ip: IpAddr, cancel: &CancellationToken) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url(ip));
        let fetch = async {
            let response = self.client.get(url).send().await?.error_for_status()?;
            response.json::<TagsResponse>().await
        };
        let tags = match bounded(cancel, self.config.probe_timeout, fetch).await? {
            Some(Ok(tags)) => tags,
            Some(Err(e)) => {
                tracing::debug!(%ip, "model listing failed: {e}");
                return Ok(Vec::new());
            }
            None => {
                tracing::debug!(%ip, "model listing timed out");
                return Ok(Vec::new());
            }
        };
        let mut models: Vec<String> = tags
            .models
            .into_iter()
            .filter_map(|m| m.model.or(m.name))
            .filter(|m| self.config.accepts_model(m))
            .collect();
        sort_models(&mut models);
        Ok(models)
    }
}
