use std::fs::{File, OpenOptions};
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use ollama_scan_rs::config::{DiscoveryTool, ScanConfig};
use ollama_scan_rs::scanner::{self, ScanSummary};
use ollama_scan_rs::{discovery, ScanError};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit status after an interrupted (but cleanly saved) run.
const EXIT_INTERRUPTED: u8 = 130;

/// ollama-scan-rs: find Ollama hosts, list their models and benchmark generation speed.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ollama-scan-rs",
    version,
    about = "Find Ollama hosts, list their models and benchmark generation speed. Resumable.",
    long_about = None
)]
struct Cli {
    /// TOML config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Candidate list, one IP address per line.
    #[arg(long)]
    input: Option<PathBuf>,

    /// CSV results file.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Scan state file used by --resume.
    #[arg(long = "state-file")]
    state_file: Option<PathBuf>,

    /// Service port.
    #[arg(long)]
    port: Option<u16>,

    /// Gateway identifier (MAC) handed to the discovery tool; part of the resume fingerprint.
    #[arg(long = "gateway-mac")]
    gateway: Option<String>,

    /// Skip the generation benchmark.
    #[arg(long = "no-bench", default_value_t = false)]
    no_bench: bool,

    /// Benchmark prompt.
    #[arg(long)]
    prompt: Option<String>,

    /// Only report models whose name contains this substring ("" for all).
    #[arg(long)]
    filter: Option<String>,

    /// Parallel workers.
    #[arg(long)]
    workers: Option<usize>,

    /// Per-stage probe timeout (e.g. 3s, 500ms).
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Benchmark timeout.
    #[arg(long = "bench-timeout", value_parser = humantime::parse_duration)]
    bench_timeout: Option<Duration>,

    /// Continue the scan recorded in the state file.
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// No progress line or per-host summaries.
    #[arg(long, short, default_value_t = false)]
    quiet: bool,

    /// Discovery tool run before probing: none, zmap, masscan, auto.
    #[arg(long)]
    discovery: Option<DiscoveryTool>,

    /// Ranges file for the discovery tool (CIDRs or IPs).
    #[arg(long)]
    ranges: Option<PathBuf>,

    /// zmap sender threads.
    #[arg(short = 'T', long = "zmap-threads")]
    zmap_threads: Option<u32>,

    /// masscan packets per second.
    #[arg(long)]
    rate: Option<u32>,

    /// Network interface for masscan.
    #[arg(long)]
    interface: Option<String>,

    /// Continue without discovery if the tool is unavailable, without asking.
    #[arg(long, short, default_value_t = false)]
    yes: bool,

    /// Also append log output to this file (stderr keeps logging).
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, c: &mut ScanConfig) {
        if let Some(v) = &self.input {
            c.input = v.clone();
        }
        if let Some(v) = &self.output {
            c.output = v.clone();
        }
        if let Some(v) = &self.state_file {
            c.state_file = v.clone();
        }
        if let Some(v) = self.port {
            c.port = v;
        }
        if let Some(v) = &self.gateway {
            c.gateway = v.clone();
        }
        if self.no_bench {
            c.bench_enabled = false;
        }
        if let Some(v) = &self.prompt {
            c.bench_prompt = v.clone();
        }
        if let Some(v) = &self.filter {
            c.model_filter = v.clone();
        }
        if let Some(v) = self.workers {
            c.workers = v;
        }
        if let Some(v) = self.timeout {
            c.probe_timeout = v;
        }
        if let Some(v) = self.bench_timeout {
            c.bench_timeout = v;
        }
        if self.resume {
            c.resume = true;
        }
        if self.quiet {
            c.show_progress = false;
            c.print_results = false;
        }
        if let Some(v) = self.discovery {
            c.discovery.tool = v;
        }
        if let Some(v) = &self.ranges {
            c.discovery.ranges = v.clone();
        }
        if let Some(v) = self.zmap_threads {
            c.discovery.zmap_threads = v;
        }
        if let Some(v) = self.rate {
            c.discovery.masscan_rate = v;
        }
        if let Some(v) = &self.interface {
            c.discovery.interface = v.clone();
        }
    }
}

/// Logs go to stderr and, when `log_file` is given, are appended there too.
fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file = log_file.map(open_log_file).transpose()?;
    log_subscriber(filter, file).init();
    Ok(())
}

fn open_log_file(path: &Path) -> Result<std::sync::Mutex<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    Ok(std::sync::Mutex::new(file))
}

fn log_subscriber(
    filter: EnvFilter,
    file: Option<std::sync::Mutex<File>>,
) -> impl tracing::Subscriber + Send + Sync + 'static {
    let file_layer = file.map(|f| fmt::layer().with_ansi(false).with_writer(f));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
}

/// Asks on the terminal; refuses when stdin is not interactive.
fn confirm_degraded(assume_yes: bool) -> impl Fn(&ScanError) -> bool + Send + Sync {
    move |err: &ScanError| {
        if assume_yes {
            return true;
        }
        if !std::io::stdin().is_terminal() {
            return false;
        }
        eprint!("{err}\ncontinue with the existing candidate file? (y/n): ");
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        answer.trim().eq_ignore_ascii_case("y")
    }
}

fn print_config(c: &ScanConfig) {
    println!("ollama-scan-rs configuration:");
    println!("  input        : {}", c.input.display());
    println!("  output       : {}", c.output.display());
    println!("  state file   : {}", c.state_file.display());
    println!("  port         : {}", c.port);
    println!(
        "  gateway      : {}",
        if c.gateway.is_empty() { "<none>" } else { c.gateway.as_str() }
    );
    println!("  model filter : {:?}", c.model_filter);
    println!("  benchmark    : {}", c.bench_enabled);
    println!("  workers      : {}", c.workers);
    println!("  timeout      : {}", humantime::format_duration(c.probe_timeout));
    println!("  resume       : {}", c.resume);
    println!("  discovery    : {:?}", c.discovery.tool);
}

fn summary_text(c: &ScanConfig, s: &ScanSummary) -> String {
    let mut out = String::from("\n");
    if s.cancelled {
        out += &format!("scan interrupted, progress saved to {}\n", c.state_file.display());
    } else if let Some(e) = &s.input_error {
        out += &format!("scan incomplete, input read failed: {e}\n");
        out += &format!("  progress saved to {}, rerun with --resume\n", c.state_file.display());
    } else {
        out += &format!("scan complete, results saved to {}\n", c.output.display());
    }
    out += &format!(
        "  processed {}/{} (resumed from {}), hosts with models: {}, rows written: {}\n",
        s.processed, s.total, s.resumed_from, s.sink.results, s.sink.rows
    );
    out += &format!(
        "  unreachable: {}  no service: {}  no matching model: {}\n",
        s.outcomes.unreachable, s.outcomes.no_service, s.outcomes.no_model
    );
    if s.sink.write_errors > 0 {
        out += &format!(
            "  {} result(s) could not be written to {}, see the log\n",
            s.sink.write_errors,
            c.output.display()
        );
    }
    out
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    let mut config = match &cli.config {
        Some(path) => ScanConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ScanConfig::default(),
    };
    cli.apply(&mut config);
    config.resolve_gateway();
    config.validate()?;
    if !cli.quiet {
        print_config(&config);
    }
    let config = Arc::new(config);

    let cancel = CancellationToken::new();
    scanner::cancel_on_interrupt(cancel.clone());

    let confirm = confirm_degraded(cli.yes);
    match discovery::discover(&config, &confirm, &cancel).await {
        Ok(_) => {}
        Err(ScanError::Cancelled) => return Ok(ExitCode::from(EXIT_INTERRUPTED)),
        Err(e) => return Err(e).context("host discovery failed"),
    }

    let summary = scanner::run_scan(config.clone(), cancel)
        .await
        .context("scan aborted")?;
    if !cli.quiet {
        print!("{}", summary_text(&config, &summary));
    }
    Ok(if summary.cancelled {
        ExitCode::from(EXIT_INTERRUPTED)
    } else if summary.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_receives_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.log");
        std::fs::write(&path, "earlier run\n").unwrap();

        let file = open_log_file(&path).unwrap();
        let subscriber = log_subscriber(EnvFilter::new("info"), Some(file));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(address = "10.0.0.1", "address scanned");
            tracing::debug!("filtered out");
        });

        let log = std::fs::read_to_string(&path).unwrap();
        assert!(log.starts_with("earlier run\n"));
        assert!(log.contains("address scanned"));
        assert!(log.contains("10.0.0.1"));
        assert!(!log.contains("filtered out"));
        assert!(!log.contains('\u{1b}'));
    }

    fn summary() -> ScanSummary {
        ScanSummary {
            total: 3,
            resumed_from: 0,
            processed: 3,
            outcomes: Default::default(),
            sink: Default::default(),
            cancelled: false,
            input_error: None,
        }
    }

    #[test]
    fn summary_reports_write_errors_and_partial_input() {
        let c = ScanConfig::default();
        let clean = summary_text(&c, &summary());
        assert!(clean.contains("scan complete"));
        assert!(!clean.contains("could not be written"));

        let mut s = summary();
        s.sink.write_errors = 2;
        s.input_error = Some("failed to read input".into());
        let text = summary_text(&c, &s);
        assert!(text.contains("scan incomplete, input read failed: failed to read input"));
        assert!(text.contains("2 result(s) could not be written to results.csv"));
        assert!(!text.contains("scan complete"));
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "ollama-scan-rs",
            "--workers",
            "8",
            "--timeout",
            "500ms",
            "--no-bench",
            "--quiet",
            "--discovery",
            "masscan",
        ]);
        let mut c = ScanConfig::default();
        cli.apply(&mut c);
        assert_eq!(c.workers, 8);
        assert_eq!(c.probe_timeout, Duration::from_millis(500));
        assert!(!c.bench_enabled);
        assert!(!c.show_progress && !c.print_results);
        assert_eq!(c.discovery.tool, DiscoveryTool::Masscan);
        assert_eq!(c.port, 11434);
    }
}
