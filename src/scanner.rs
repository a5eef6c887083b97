use std::net::IpAddr;
use std::ops::AddAssign;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::probe::{build_client, ProbePipeline};
use crate::progress::ProgressTracker;
use crate::sink::{ResultSink, SinkSummary};
use crate::state::{spawn_checkpointer, ScanState, SharedState};
use crate::targets::TargetSource;
use crate::types::{AddressOutcome, ScanResult};

/// Result queue capacity; producers block once it is full.
const RESULT_QUEUE: usize = 100;

/// Per-outcome address counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub skipped: u64,
    pub unreachable: u64,
    pub no_service: u64,
    pub no_model: u64,
    pub modeled: u64,
}

impl OutcomeCounts {
    fn record(&mut self, outcome: &AddressOutcome) {
        match outcome {
            AddressOutcome::Skipped => self.skipped += 1,
            AddressOutcome::Unreachable => self.unreachable += 1,
            AddressOutcome::NoService => self.no_service += 1,
            AddressOutcome::NoModel => self.no_model += 1,
            AddressOutcome::Modeled(_) => self.modeled += 1,
        }
    }

    /// Addresses whose pipeline ran to completion in this run.
    pub fn completed(&self) -> u64 {
        self.unreachable + self.no_service + self.no_model + self.modeled
    }
}

impl AddAssign for OutcomeCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.skipped += rhs.skipped;
        self.unreachable += rhs.unreachable;
        self.no_service += rhs.no_service;
        self.no_model += rhs.no_model;
        self.modeled += rhs.modeled;
    }
}

/// Totals reported when a run ends, normally or by cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    /// Distinct valid addresses in the input.
    pub total: u64,
    /// Input addresses already processed when the run started.
    pub resumed_from: u64,
    /// Input addresses processed by the end of the run.
    pub processed: u64,
    pub outcomes: OutcomeCounts,
    pub sink: SinkSummary,
    pub cancelled: bool,
    /// Set when the input could not be read to the end.
    pub input_error: Option<String>,
}

impl ScanSummary {
    /// Every input address was fed to the workers and the run was not cancelled.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.input_error.is_none()
    }
}

/// Cancel `token` on Ctrl-C (and SIGTERM on unix).
pub fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {},
                        _ = term.recv() => {},
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        eprintln!("\ninterrupt received, saving progress...");
        token.cancel();
    });
}

/// Fresh state, or the saved one when resuming with an unchanged configuration.
/// The flag is true when a saved state was picked up.
pub async fn prepare_state(config: &ScanConfig) -> Result<(ScanState, bool)> {
    let current = config.fingerprint();
    if config.resume {
        if let Some(saved) = ScanState::load(&config.state_file).await? {
            if !saved.validate(&current) {
                let field = saved
                    .config_fingerprint
                    .first_difference(&current)
                    .unwrap_or("config_fingerprint");
                return Err(ScanError::FingerprintMismatch {
                    field,
                    path: config.state_file.clone(),
                });
            }
            tracing::info!(
                processed = saved.processed_count(),
                path = %config.state_file.display(),
                "resuming saved scan"
            );
            return Ok((saved, true));
        }
        tracing::info!(path = %config.state_file.display(), "no saved state, starting fresh");
    }
    Ok((ScanState::new(current), false))
}

/// Run a whole scan over `config.input`.
///
/// Configuration and precondition failures are returned before any network
/// activity or output is produced. After that the run always completes with a
/// summary; per-address failures are absorbed, and cancelling `cancel` stops
/// the workers, drains already-produced results into the output and saves the
/// final state before returning with `cancelled` set.
pub async fn run_scan(config: Arc<ScanConfig>, cancel: CancellationToken) -> Result<ScanSummary> {
    config.validate()?;
    let source = TargetSource::new(&config.input);
    source.ensure_exists().await?;

    let (mut state, resumed) = prepare_state(&config).await?;
    let tally = source.tally(&state).await?;
    let total = tally.total;
    state.total_addresses = total;
    let resumed_from = tally.processed;
    tracing::info!(total, resumed_from, workers = config.workers, "starting scan");

    let client = build_client(&config)?;
    let mut sink = ResultSink::open(&config.output, config.bench_enabled, resumed, config.print_results)?;

    let state = SharedState::new(state, config.state_file.clone());
    let progress = ProgressTracker::new(total, resumed_from, config.show_progress);
    let pipeline = ProbePipeline::new(config.clone(), client);

    let (addr_tx, addr_rx) = mpsc::channel::<IpAddr>(config.queue_capacity());
    let (result_tx, result_rx) = mpsc::channel::<ScanResult>(RESULT_QUEUE);

    let sink_handle = tokio::task::spawn_blocking(move || sink.drain(result_rx));

    let stop_checkpoints = CancellationToken::new();
    let checkpointer = spawn_checkpointer(
        state.clone(),
        config.checkpoint_interval,
        stop_checkpoints.clone(),
    );

    let feeder = {
        let cancel = cancel.clone();
        let source = source.clone();
        tokio::spawn(async move { feed_addresses(source, addr_tx, cancel).await })
    };

    let queue = Arc::new(Mutex::new(addr_rx));
    let mut workers = JoinSet::new();
    for _ in 0..config.workers {
        workers.spawn(worker_loop(
            queue.clone(),
            pipeline.clone(),
            state.clone(),
            progress.clone(),
            result_tx.clone(),
            cancel.clone(),
        ));
    }
    // Only the workers hold senders now; the sink ends once they are done.
    drop(result_tx);

    let mut outcomes = OutcomeCounts::default();
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(counts) => outcomes += counts,
            Err(e) => tracing::error!("worker task failed: {e}"),
        }
    }
    // Closing the queue unblocks a feeder still waiting for space.
    drop(queue);
    let input_error = match feeder.await {
        Ok(Ok(fed)) => {
            tracing::debug!(fed, "address feeder finished");
            None
        }
        Ok(Err(e)) => {
            tracing::error!("address feeder stopped: {e}");
            Some(e.to_string())
        }
        Err(e) => {
            tracing::error!("address feeder task failed: {e}");
            Some(e.to_string())
        }
    };

    let sink_summary = match sink_handle.await {
        Ok(summary) => summary,
        Err(e) => {
            tracing::error!("result sink task failed: {e}");
            SinkSummary::default()
        }
    };
    progress.finish();

    stop_checkpoints.cancel();
    if let Err(e) = checkpointer.await {
        tracing::error!("checkpointer task failed: {e}");
    }

    let summary = ScanSummary {
        total,
        resumed_from,
        processed: resumed_from + outcomes.completed(),
        outcomes,
        sink: sink_summary,
        cancelled: cancel.is_cancelled(),
        input_error,
    };
    tracing::info!(
        processed = summary.processed,
        total = summary.total,
        hosts = summary.sink.results,
        rows = summary.sink.rows,
        cancelled = summary.cancelled,
        complete = summary.is_complete(),
        "scan finished"
    );
    Ok(summary)
}

/// Push every address from the input into the queue, stopping early on cancel.
async fn feed_addresses(
    source: TargetSource,
    tx: mpsc::Sender<IpAddr>,
    cancel: CancellationToken,
) -> Result<u64> {
    let mut reader = source.open().await?;
    let mut fed = 0u64;
    while let Some(ip) = reader.next().await? {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send(ip) => {
                if sent.is_err() {
                    break;
                }
                fed += 1;
            }
        }
    }
    Ok(fed)
}

async fn worker_loop(
    queue: Arc<Mutex<mpsc::Receiver<IpAddr>>>,
    pipeline: ProbePipeline,
    state: SharedState,
    progress: ProgressTracker,
    results: mpsc::Sender<ScanResult>,
    cancel: CancellationToken,
) -> OutcomeCounts {
    let mut counts = OutcomeCounts::default();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                ip = rx.recv() => ip,
            }
        };
        let Some(ip) = next else { break };

        let outcome = match pipeline.process(ip, &state, &cancel).await {
            Ok(outcome) => outcome,
            Err(ScanError::Cancelled) => break,
            Err(e) => {
                tracing::warn!(%ip, "probe failed: {e}");
                continue;
            }
        };
        counts.record(&outcome);
        // The tracker was seeded with the already-processed count.
        if matches!(outcome, AddressOutcome::Skipped) {
            continue;
        }
        if let Some(result) = outcome.into_result() {
            // The sink drains until every sender is gone, so this completes
            // even after cancellation.
            if results.send(result).await.is_err() {
                tracing::error!(%ip, "result sink closed, dropping result");
            }
        }
        progress.increment().await;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config_in(dir: &Path) -> ScanConfig {
        ScanConfig {
            input: dir.join("ip.txt"),
            output: dir.join("results.csv"),
            state_file: dir.join("scan_state.json"),
            show_progress: false,
            print_results: false,
            ..ScanConfig::default()
        }
    }

    #[test]
    fn completed_excludes_skipped() {
        let mut c = OutcomeCounts::default();
        c.record(&AddressOutcome::Skipped);
        c.record(&AddressOutcome::Unreachable);
        c.record(&AddressOutcome::NoModel);
        assert_eq!(c.completed(), 2);
        let mut total = OutcomeCounts::default();
        total += c;
        total += c;
        assert_eq!(total.skipped, 2);
    }

    #[tokio::test]
    async fn unreadable_input_stops_the_feeder() {
        // A directory opens on unix but fails on the first read.
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let res = feed_addresses(TargetSource::new(dir.path()), tx, CancellationToken::new()).await;
        assert!(matches!(res, Err(ScanError::Persistence { .. })), "{res:?}");
    }

    #[test]
    fn summary_with_input_error_is_incomplete() {
        let summary = ScanSummary {
            total: 3,
            resumed_from: 0,
            processed: 1,
            outcomes: OutcomeCounts::default(),
            sink: SinkSummary::default(),
            cancelled: false,
            input_error: Some("failed to read input".into()),
        };
        assert!(!summary.is_complete());
        assert!(ScanSummary { input_error: None, ..summary.clone() }.is_complete());
        assert!(!ScanSummary { input_error: None, cancelled: true, ..summary }.is_complete());
    }

    #[tokio::test]
    async fn resume_without_saved_state_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScanConfig {
            resume: true,
            ..config_in(dir.path())
        };
        let (state, resumed) = prepare_state(&config).await.unwrap();
        assert!(!resumed);
        assert_eq!(state.processed_count(), 0);
        assert!(state.validate(&config.fingerprint()));
    }

    #[tokio::test]
    async fn fresh_run_ignores_saved_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut saved = ScanState::new(config.fingerprint());
        saved.mark_processed("10.0.0.1");
        saved.save(&config.state_file).await.unwrap();

        let (state, resumed) = prepare_state(&config).await.unwrap();
        assert!(!resumed);
        assert!(!state.is_processed("10.0.0.1"));
    }

    #[tokio::test]
    async fn missing_input_aborts_before_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(config_in(dir.path()));
        let err = run_scan(config.clone(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::MissingInput(_)));
        assert!(config.input.exists());
        assert!(!config.output.exists());
    }

    #[tokio::test]
    async fn empty_input_completes_with_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(config_in(dir.path()));
        std::fs::write(&config.input, "# nothing yet\n").unwrap();

        let summary = run_scan(config.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.processed, 0);
        assert!(!summary.cancelled);
        let csv = std::fs::read_to_string(&config.output).unwrap();
        assert_eq!(csv.lines().count(), 1);
        let saved = ScanState::load(&config.state_file).await.unwrap().unwrap();
        assert_eq!(saved.total_addresses, 0);
    }
}
