use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use tokio::sync::mpsc;

use crate::error::{Result, ScanError};
use crate::types::ScanResult;

const BASE_HEADER: [&str; 3] = ["address", "model", "status"];
const BENCH_HEADER: [&str; 2] = ["first_token_latency_ms", "tokens_per_sec"];

/// What the sink wrote during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkSummary {
    pub results: u64,
    pub rows: u64,
    pub write_errors: u64,
}

/// Sole owner of the output file. Drains the result queue in arrival order,
/// printing a summary per address and appending one CSV row per model.
#[derive(Debug)]
pub struct ResultSink<W: Write> {
    writer: csv::Writer<W>,
    bench_enabled: bool,
    print: bool,
}

impl ResultSink<File> {
    /// Open the CSV output. With `append` the existing rows are kept and the
    /// header is only written to an empty file; otherwise the file is truncated.
    pub fn open(path: &Path, bench_enabled: bool, append: bool, print: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| ScanError::io(format!("failed to create {}", parent.display()), e))?;
        }
        let file = if append {
            OpenOptions::new().create(true).append(true).open(path)
        } else {
            File::create(path)
        }
        .map_err(|e| ScanError::io(format!("failed to open output {}", path.display()), e))?;
        let needs_header = !append
            || file
                .metadata()
                .map_err(|e| ScanError::io(format!("failed to stat {}", path.display()), e))?
                .len()
                == 0;
        ResultSink::from_writer(file, bench_enabled, needs_header, print)
    }
}

impl<W: Write> ResultSink<W> {
    pub fn from_writer(inner: W, bench_enabled: bool, write_header: bool, print: bool) -> Result<Self> {
        let mut sink = Self {
            writer: csv::Writer::from_writer(inner),
            bench_enabled,
            print,
        };
        if write_header {
            let mut header: Vec<&str> = BASE_HEADER.to_vec();
            if bench_enabled {
                header.extend(BENCH_HEADER);
            }
            sink.writer
                .write_record(&header)
                .and_then(|_| sink.writer.flush().map_err(csv::Error::from))
                .map_err(|e| ScanError::io("failed to write csv header", std::io::Error::other(e)))?;
        }
        Ok(sink)
    }

    /// Append the rows for one result and flush. Returns the number of rows written.
    pub fn write_result(&mut self, result: &ScanResult) -> csv::Result<u64> {
        let mut rows = 0;
        for model in &result.models {
            let status = model.status.to_string();
            if self.bench_enabled {
                let latency = format!("{:.0}", model.first_token_latency_ms());
                let tps = format!("{:.1}", model.tokens_per_sec);
                self.writer.write_record([
                    result.address.as_str(),
                    model.name.as_str(),
                    status.as_str(),
                    latency.as_str(),
                    tps.as_str(),
                ])?;
            } else {
                self.writer
                    .write_record([result.address.as_str(), model.name.as_str(), status.as_str()])?;
            }
            rows += 1;
        }
        self.writer.flush()?;
        Ok(rows)
    }

    /// Consume results until every sender is gone and the queue is empty.
    /// Must run off the async executor (it blocks on the queue).
    pub fn drain(&mut self, mut rx: mpsc::Receiver<ScanResult>) -> SinkSummary {
        let mut summary = SinkSummary::default();
        while let Some(result) = rx.blocking_recv() {
            if self.print {
                println!("\n{}", render_summary(&result, self.bench_enabled));
            }
            summary.results += 1;
            match self.write_result(&result) {
                Ok(rows) => summary.rows += rows,
                Err(e) => {
                    summary.write_errors += 1;
                    tracing::warn!(address = %result.address, "failed to write csv rows: {e}");
                }
            }
        }
        if let Err(e) = self.writer.flush() {
            tracing::warn!("failed to flush csv output: {e}");
        }
        summary
    }

    pub fn into_inner(self) -> std::result::Result<W, csv::IntoInnerError<csv::Writer<W>>> {
        self.writer.into_inner()
    }
}

/// Human-readable block for one host.
pub fn render_summary(result: &ScanResult, bench_enabled: bool) -> String {
    let rule = "-".repeat(50);
    let mut out = String::new();
    let _ = writeln!(out, "address: {}", result.address);
    let _ = writeln!(out, "{rule}");
    for model in &result.models {
        let _ = writeln!(out, "├─ model: {:<25}", model.name);
        if bench_enabled {
            let _ = writeln!(out, "│ ├─ status: {}", model.status);
            let _ = writeln!(out, "│ ├─ first token: {:.0}ms", model.first_token_latency_ms());
            let _ = writeln!(out, "│ └─ speed: {:.1} tokens/s", model.tokens_per_sec);
        } else {
            let _ = writeln!(out, "│ └─ status: {}", model.status);
        }
        let _ = writeln!(out, "{rule}");
    }
    out.truncate(out.trim_end().len());
    out
}
