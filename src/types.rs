use std::fmt;
use std::time::Duration;

/// Benchmark status of one model on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    /// Listed by the host; no benchmark has been attempted yet.
    Discovered,
    /// Benchmark stream completed and produced at least one chunk.
    Tested,
    /// The generate request could not be sent or the connection dropped before a response.
    ConnectFailed,
    /// The generate endpoint answered with a non-200 status.
    HttpError(u16),
    /// The generate stream produced no chunks.
    NoResponse,
    /// Benchmarking is disabled for this run.
    Untested,
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelStatus::Discovered => f.write_str("Discovered"),
            ModelStatus::Tested => f.write_str("Tested"),
            ModelStatus::ConnectFailed => f.write_str("ConnectFailed"),
            ModelStatus::HttpError(code) => write!(f, "HTTPError: {code}"),
            ModelStatus::NoResponse => f.write_str("NoResponse"),
            ModelStatus::Untested => f.write_str("Untested"),
        }
    }
}

/// One model served by a host, with its benchmark figures.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRecord {
    pub name: String,
    pub status: ModelStatus,
    pub first_token_latency: Duration,
    pub tokens_per_sec: f64,
}

impl ModelRecord {
    pub fn discovered(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ModelStatus::Discovered,
            first_token_latency: Duration::ZERO,
            tokens_per_sec: 0.0,
        }
    }

    pub fn first_token_latency_ms(&self) -> f64 {
        self.first_token_latency.as_secs_f64() * 1000.0
    }
}

/// Everything learned about one host that serves at least one matching model.
/// `models` is ordered by ascending parameter count.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub address: String,
    pub models: Vec<ModelRecord>,
}

/// Terminal state of the per-address pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum AddressOutcome {
    /// Already marked processed by a previous run; no network activity took place.
    Skipped,
    /// TCP connect to the service port failed or timed out.
    Unreachable,
    /// Port open, but the root path did not answer with the expected banner.
    NoService,
    /// Service verified, but no listed model passed the name filter.
    NoModel,
    /// At least one matching model was found.
    Modeled(ScanResult),
}

impl AddressOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AddressOutcome::Skipped => "skipped",
            AddressOutcome::Unreachable => "unreachable",
            AddressOutcome::NoService => "no service",
            AddressOutcome::NoModel => "no matching model",
            AddressOutcome::Modeled(_) => "modeled",
        }
    }

    pub fn into_result(self) -> Option<ScanResult> {
        match self {
            AddressOutcome::Modeled(result) => Some(result),
            _ => None,
        }
    }
}

/// Extract the parameter count from a model tag such as `deepseek-r1:7b` (-> 7.0).
///
/// The part after the last `:` is read with an optional trailing `b`. Names
/// without a tag, or with a tag that is not a number, yield `0.0`.
pub fn parse_model_size(model: &str) -> f64 {
    let Some((_, tag)) = model.rsplit_once(':') else {
        return 0.0;
    };
    let tag = tag
        .strip_suffix('b')
        .or_else(|| tag.strip_suffix('B'))
        .unwrap_or(tag);
    match tag.parse::<f64>() {
        Ok(size) if size.is_finite() => size,
        _ => 0.0,
    }
}

/// Stable sort by ascending parsed model size.
pub fn sort_models(models: &mut [String]) {
    models.sort_by(|a, b| parse_model_size(a).total_cmp(&parse_model_size(b)));
}
