use ollama_scan_rs::targets::parse_targets_str;
use std::net::IpAddr;

#[test]
fn parse_mixed_list_with_comments() {
    let input = r#"
        # zmap output
        10.0.0.1
        10.0.0.2   
        ::1
        not-an-address
        10.0.0.1
        # blank line follows

        0:0:0:0:0:0:0:1
    "#;

    let ips = parse_targets_str(input);
    // Dedup keeps first appearance; the long IPv6 spelling folds into ::1
    let expected: Vec<IpAddr> = ["10.0.0.1", "10.0.0.2", "::1"]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();
    assert_eq!(ips, expected);
}

#[test]
fn cidr_lines_are_not_targets() {
    assert!(parse_targets_str("192.168.1.0/24\n").is_empty());
}
