use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::{Result, ScanError};
use crate::state::ScanState;

/// Parse one candidate line into an address.
///
/// - surrounding whitespace is ignored
/// - blank lines and lines starting with `#` yield `None`
/// - anything that is not an IPv4/IPv6 literal yields `None`
pub fn parse_target_line(line: &str) -> Option<IpAddr> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    line.parse::<IpAddr>().ok()
}

/// Parse a whole candidate list, dropping invalid lines and repeated addresses.
pub fn parse_targets_str(s: &str) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    s.lines()
        .filter_map(parse_target_line)
        .filter(|ip| seen.insert(*ip))
        .collect()
}

/// The candidate file. Each pass re-reads it from disk, so the sequence is
/// restartable but never held in memory as a whole.
#[derive(Debug, Clone)]
pub struct TargetSource {
    path: PathBuf,
}

impl TargetSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Fail with [`ScanError::MissingInput`] if the file does not exist,
    /// leaving an empty file behind for the operator to fill in.
    pub async fn ensure_exists(&self) -> Result<()> {
        match tokio::fs::metadata(&self.path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        ScanError::io(format!("failed to create {}", parent.display()), e)
                    })?;
                }
                File::create(&self.path).await.map_err(|e| {
                    ScanError::io(format!("failed to create {}", self.path.display()), e)
                })?;
                tracing::warn!(path = %self.path.display(), "created empty input file");
                Err(ScanError::MissingInput(self.path.clone()))
            }
            Err(e) => Err(ScanError::io(
                format!("failed to stat {}", self.path.display()),
                e,
            )),
        }
    }

    /// Start a fresh pass over the file.
    pub async fn open(&self) -> Result<TargetReader> {
        let file = File::open(&self.path).await.map_err(|e| {
            ScanError::io(format!("failed to open input {}", self.path.display()), e)
        })?;
        Ok(TargetReader {
            reader: BufReader::new(file),
            buf: Vec::new(),
            seen: HashSet::new(),
        })
    }

    /// Count the distinct valid addresses in the file, and how many of them
    /// `state` already records as processed. Entries in the state that are
    /// no longer in the file are not counted.
    pub async fn tally(&self, state: &ScanState) -> Result<InputTally> {
        let mut reader = self.open().await?;
        let mut tally = InputTally::default();
        while let Some(ip) = reader.next().await? {
            tally.total += 1;
            if state.is_processed(&ip.to_string()) {
                tally.processed += 1;
            }
        }
        Ok(tally)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputTally {
    pub total: u64,
    pub processed: u64,
}

/// One pass over the candidate file, yielding each distinct valid address once.
#[derive(Debug)]
pub struct TargetReader {
    reader: BufReader<File>,
    buf: Vec<u8>,
    seen: HashSet<IpAddr>,
}

impl TargetReader {
    pub async fn next(&mut self) -> Result<Option<IpAddr>> {
        loop {
            self.buf.clear();
            let n = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(|e| ScanError::io("failed to read input", e))?;
            if n == 0 {
                return Ok(None);
            }
            // Non-UTF-8 bytes simply fail to parse as an address.
            let line = String::from_utf8_lossy(&self.buf);
            if let Some(ip) = parse_target_line(&line) {
                if self.seen.insert(ip) {
                    return Ok(Some(ip));
                }
            }
        }
    }
}
