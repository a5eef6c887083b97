//! Boundary to the external host-discovery tool.
//!
//! The scanner never enumerates ranges itself. When discovery is enabled, zmap
//! or masscan sweeps the ranges file for the service port and the hosts it
//! reports become the candidate list that [`crate::targets::TargetSource`]
//! reads. If the tool is missing or fails, a [`Confirm`] callback decides
//! whether to carry on with whatever candidate file already exists.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use ipnet::IpNet;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::{DiscoveryTool, ScanConfig};
use crate::error::{Result, ScanError};

/// Asked whether to continue without discovery after `error`. Returning true
/// selects degraded mode.
pub type Confirm<'a> = &'a (dyn Fn(&ScanError) -> bool + Send + Sync);

/// A concrete discovery tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Zmap,
    Masscan,
}

impl Tool {
    /// Resolve the configured choice. `None` when discovery is disabled.
    pub fn select(choice: DiscoveryTool) -> Option<Tool> {
        match choice {
            DiscoveryTool::None => None,
            DiscoveryTool::Zmap => Some(Tool::Zmap),
            DiscoveryTool::Masscan => Some(Tool::Masscan),
            DiscoveryTool::Auto if cfg!(windows) => Some(Tool::Masscan),
            DiscoveryTool::Auto => Some(Tool::Zmap),
        }
    }

    pub fn binary(self) -> &'static str {
        match self {
            Tool::Zmap => "zmap",
            Tool::Masscan => "masscan",
        }
    }

    /// Full path of the binary if it is on `PATH`.
    pub fn locate(self) -> Option<PathBuf> {
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path).find_map(|dir| {
            let candidate = dir.join(self.binary());
            if candidate.is_file() {
                return Some(candidate);
            }
            let exe = candidate.with_extension("exe");
            exe.is_file().then_some(exe)
        })
    }

    /// Command-line arguments for one sweep writing raw tool output to `out`.
    pub fn args(self, config: &ScanConfig, out: &Path) -> Vec<String> {
        let d = &config.discovery;
        let mut args = vec!["-p".to_string(), config.port.to_string()];
        match self {
            Tool::Zmap => {
                if !config.gateway.is_empty() {
                    args.extend(["-G".to_string(), config.gateway.clone()]);
                }
                args.extend([
                    "-w".to_string(),
                    d.ranges.display().to_string(),
                    "-o".to_string(),
                    out.display().to_string(),
                    "-T".to_string(),
                    d.zmap_threads.to_string(),
                ]);
            }
            Tool::Masscan => {
                args.extend([
                    "--rate".to_string(),
                    d.masscan_rate.to_string(),
                    "--interface".to_string(),
                    d.interface.clone(),
                ]);
                if !config.gateway.is_empty() {
                    args.extend(["--router-mac".to_string(), config.gateway.clone()]);
                }
                args.extend([
                    "-iL".to_string(),
                    d.ranges.display().to_string(),
                    "-oL".to_string(),
                    out.display().to_string(),
                ]);
            }
        }
        args
    }
}

/// Entries in a ranges file and the number of addresses they cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSummary {
    pub entries: usize,
    pub addresses: u128,
}

/// Validate a ranges file body: CIDRs or single IP literals, `#` comments.
/// Invalid lines are an error since the tool would reject them anyway.
pub fn parse_ranges_str(s: &str) -> Result<RangeSummary> {
    let mut summary = RangeSummary {
        entries: 0,
        addresses: 0,
    };
    for (idx, raw) in s.lines().enumerate() {
        let line = raw.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        let net = match line.parse::<IpNet>() {
            Ok(net) => net,
            Err(_) => match line.parse::<IpAddr>() {
                Ok(ip) => IpNet::from(ip),
                Err(_) => {
                    return Err(ScanError::Config(format!(
                        "ranges line {}: not a CIDR or IP address: {line}",
                        idx + 1
                    )))
                }
            },
        };
        summary.entries += 1;
        let host_bits = u32::from(net.max_prefix_len() - net.prefix_len());
        summary.addresses = summary
            .addresses
            .saturating_add(1u128.checked_shl(host_bits).unwrap_or(u128::MAX));
    }
    Ok(summary)
}

/// Address from one line of masscan's `-oL` list output
/// (`open tcp 11434 10.0.0.1 1700000000`).
pub fn parse_masscan_line(line: &str) -> Option<IpAddr> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "open" {
        return None;
    }
    fields.nth(2)?.parse().ok()
}

/// Run discovery if it is enabled, leaving the candidate list in `config.input`.
///
/// Returns `Ok(true)` when fresh candidates were produced, `Ok(false)` when
/// discovery is disabled or was skipped in degraded mode.
pub async fn discover(config: &ScanConfig, confirm: Confirm<'_>, cancel: &CancellationToken) -> Result<bool> {
    let Some(tool) = Tool::select(config.discovery.tool) else {
        return Ok(false);
    };
    match sweep(tool, config, cancel).await {
        Ok(found) => {
            tracing::info!(tool = tool.binary(), found, input = %config.input.display(), "discovery finished");
            Ok(true)
        }
        Err(ScanError::Cancelled) => Err(ScanError::Cancelled),
        Err(e) => {
            tracing::error!("{e}");
            if confirm(&e) {
                tracing::warn!(
                    input = %config.input.display(),
                    "continuing without discovery, probing the existing candidate file"
                );
                Ok(false)
            } else {
                Err(e)
            }
        }
    }
}

async fn sweep(tool: Tool, config: &ScanConfig, cancel: &CancellationToken) -> Result<u64> {
    let binary = tool.locate().ok_or_else(|| ScanError::ExternalTool {
        tool: tool.binary().to_string(),
        reason: "not found in PATH; install it or run with --discovery none".into(),
    })?;
    run_sweep(tool, &binary, config, cancel).await
}

/// Raw tool output goes to a sibling of the candidate file, which is only
/// replaced once the sweep has succeeded.
fn raw_output_path(tool: Tool, input: &Path) -> PathBuf {
    input.with_extension(tool.binary())
}

async fn run_sweep(tool: Tool, binary: &Path, config: &ScanConfig, cancel: &CancellationToken) -> Result<u64> {
    let tool_err = |reason: String| ScanError::ExternalTool {
        tool: tool.binary().to_string(),
        reason,
    };

    let ranges = &config.discovery.ranges;
    let content = tokio::fs::read_to_string(ranges)
        .await
        .map_err(|e| tool_err(format!("cannot read ranges file {}: {e}", ranges.display())))?;
    let summary = parse_ranges_str(&content).map_err(|e| tool_err(e.to_string()))?;
    if summary.entries == 0 {
        return Err(tool_err(format!("no ranges in {}", ranges.display())));
    }
    tracing::info!(
        tool = tool.binary(),
        entries = summary.entries,
        addresses = summary.addresses as f64,
        "starting discovery sweep"
    );

    let raw_out = raw_output_path(tool, &config.input);
    let mut child = Command::new(binary)
        .args(tool.args(config, &raw_out))
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| tool_err(format!("failed to start: {e}")))?;

    let waited = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        status = child.wait() => Some(status),
    };
    let Some(status) = waited else {
        let _ = child.kill().await;
        return Err(ScanError::Cancelled);
    };
    let status = status.map_err(|e| tool_err(format!("wait failed: {e}")))?;
    if !status.success() {
        return Err(tool_err(format!("exited with {status}")));
    }

    match tool {
        Tool::Zmap => {
            let body = tokio::fs::read_to_string(&raw_out)
                .await
                .map_err(|e| ScanError::io(format!("failed to read {}", raw_out.display()), e))?;
            tokio::fs::rename(&raw_out, &config.input)
                .await
                .map_err(|e| ScanError::io(format!("failed to replace {}", config.input.display()), e))?;
            Ok(crate::targets::parse_targets_str(&body).len() as u64)
        }
        Tool::Masscan => convert_masscan_list(&raw_out, &config.input).await,
    }
}

/// Rewrite masscan list output as one address per line.
async fn convert_masscan_list(raw: &Path, input: &Path) -> Result<u64> {
    let body = tokio::fs::read_to_string(raw)
        .await
        .map_err(|e| ScanError::io(format!("failed to read {}", raw.display()), e))?;
    let mut out = String::new();
    let mut n = 0u64;
    for ip in body.lines().filter_map(parse_masscan_line) {
        out.push_str(&ip.to_string());
        out.push('\n');
        n += 1;
    }
    tokio::fs::write(input, out)
        .await
        .map_err(|e| ScanError::io(format!("failed to write {}", input.display()), e))?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;

    #[test]
    fn ranges_accept_cidrs_and_hosts() {
        let s = parse_ranges_str(
            r#"
            # office
            192.168.1.0/24
            10.0.0.5      # single host
            fd00::/120
            "#,
        )
        .unwrap();
        assert_eq!(s.entries, 3);
        assert_eq!(s.addresses, 256 + 1 + 256);
    }

    #[test]
    fn ranges_reject_garbage() {
        let err = parse_ranges_str("192.168.1.0/24\nexample.com\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn masscan_list_lines() {
        assert_eq!(
            parse_masscan_line("open tcp 11434 10.1.2.3 1700000000"),
            Some("10.1.2.3".parse().unwrap())
        );
        assert_eq!(parse_masscan_line("#masscan"), None);
        assert_eq!(parse_masscan_line("# end"), None);
        assert_eq!(parse_masscan_line(""), None);
    }

    #[test]
    fn auto_picks_platform_tool() {
        let expected = if cfg!(windows) { Tool::Masscan } else { Tool::Zmap };
        assert_eq!(Tool::select(DiscoveryTool::Auto), Some(expected));
        assert_eq!(Tool::select(DiscoveryTool::None), None);
    }

    #[test]
    fn zmap_arguments() {
        let config = ScanConfig {
            gateway: "aa:bb:cc:dd:ee:ff".into(),
            discovery: DiscoveryConfig {
                zmap_threads: 4,
                ..DiscoveryConfig::default()
            },
            ..ScanConfig::default()
        };
        let args = Tool::Zmap.args(&config, Path::new("ip.txt"));
        assert_eq!(
            args,
            vec!["-p", "11434", "-G", "aa:bb:cc:dd:ee:ff", "-w", "ranges.txt", "-o", "ip.txt", "-T", "4"]
        );
    }

    #[test]
    fn masscan_arguments_without_gateway() {
        let args = Tool::Masscan.args(&ScanConfig::default(), Path::new("ip.masscan"));
        assert_eq!(
            args,
            vec![
                "-p", "11434", "--rate", "1000", "--interface", "eth0", "-iL", "ranges.txt", "-oL",
                "ip.masscan"
            ]
        );
    }

    /// Stand-in for zmap: writes `body` to its `-o` file and exits with `code`.
    #[cfg(unix)]
    fn fake_zmap(dir: &Path, body: &str, code: i32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = format!(
            "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-o\" ]; then out=\"$2\"; fi\n  shift\ndone\nprintf '{body}' > \"$out\"\nexit {code}\n"
        );
        let path = dir.join("zmap");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn sweep_config(dir: &Path) -> ScanConfig {
        std::fs::write(dir.join("ranges.txt"), "127.0.0.0/30\n").unwrap();
        std::fs::write(dir.join("ip.txt"), "10.0.0.1\n10.0.0.2\n").unwrap();
        ScanConfig {
            input: dir.join("ip.txt"),
            discovery: DiscoveryConfig {
                tool: DiscoveryTool::Zmap,
                ranges: dir.join("ranges.txt"),
                ..DiscoveryConfig::default()
            },
            ..ScanConfig::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_sweep_leaves_candidate_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let config = sweep_config(dir.path());
        let zmap = fake_zmap(dir.path(), "", 1);

        let err = run_sweep(Tool::Zmap, &zmap, &config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::ExternalTool { .. }), "{err}");
        assert_eq!(
            std::fs::read_to_string(&config.input).unwrap(),
            "10.0.0.1\n10.0.0.2\n"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_sweep_replaces_candidate_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = sweep_config(dir.path());
        let zmap = fake_zmap(dir.path(), "127.0.0.1\\n127.0.0.2\\n", 0);

        let found = run_sweep(Tool::Zmap, &zmap, &config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(found, 2);
        assert_eq!(
            std::fs::read_to_string(&config.input).unwrap(),
            "127.0.0.1\n127.0.0.2\n"
        );
        assert!(!raw_output_path(Tool::Zmap, &config.input).exists());
    }

    #[test]
    fn raw_output_is_a_sibling_of_the_input() {
        let input = Path::new("data/ip.txt");
        assert_eq!(raw_output_path(Tool::Zmap, input), Path::new("data/ip.zmap"));
        assert_eq!(raw_output_path(Tool::Masscan, input), Path::new("data/ip.masscan"));
    }

    #[tokio::test]
    async fn disabled_discovery_is_a_no_op() {
        let never = |_: &ScanError| -> bool { panic!("confirm must not be called") };
        let ran = discover(&ScanConfig::default(), &never, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!ran);
    }

    #[tokio::test]
    async fn missing_tool_consults_confirm() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScanConfig {
            discovery: DiscoveryConfig {
                tool: DiscoveryTool::Zmap,
                ranges: dir.path().join("ranges.txt"),
                ..DiscoveryConfig::default()
            },
            ..ScanConfig::default()
        };
        // Only meaningful where zmap is not installed.
        if Tool::Zmap.locate().is_some() {
            return;
        }
        let yes = |e: &ScanError| matches!(e, ScanError::ExternalTool { .. });
        assert!(!discover(&config, &yes, &CancellationToken::new()).await.unwrap());

        let no = |_: &ScanError| false;
        let err = discover(&config, &no, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ScanError::ExternalTool { ref tool, .. } if tool == "zmap"));
    }
}
