use std::time::Duration;

use ollama_scan_rs::config::{DiscoveryTool, ScanConfig};

#[test]
fn load_file_with_durations_and_discovery_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scan.toml");
    std::fs::write(
        &path,
        r#"
        gateway = "aa:bb:cc:dd:ee:ff"
        workers = 32
        probe_timeout = "750ms"
        bench_timeout = "1m"
        model_filter = ""

        [discovery]
        tool = "masscan"
        masscan_rate = 5000
        "#,
    )
    .unwrap();

    let c = ScanConfig::load(&path).unwrap();
    assert_eq!(c.workers, 32);
    assert_eq!(c.probe_timeout, Duration::from_millis(750));
    assert_eq!(c.bench_timeout, Duration::from_secs(60));
    assert!(c.accepts_model("llama3:8b"));
    assert_eq!(c.discovery.tool, DiscoveryTool::Masscan);
    assert_eq!(c.discovery.masscan_rate, 5000);
    // Untouched keys keep their defaults
    assert_eq!(c.port, 11434);
    assert_eq!(c.discovery.zmap_threads, 10);
    assert!(c.validate().is_ok());
}

#[test]
fn missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(ScanConfig::load(dir.path().join("absent.toml")).is_err());
}
