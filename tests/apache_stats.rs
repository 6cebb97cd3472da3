#[path = "common/mod.rs"]
mod common;

use common::{append, query, start, wait_for_line, wait_for_watcher};

fn clf(method: &str, version: &str, status: u32) -> String {
    format!(
        "10.0.0.1 - - [10/Oct/2026:13:55:36 -0700] \"{} /index.html HTTP/{}\" {} 100\n",
        method, version, status
    )
}

/// 200 canned access-log records with a known counter breakdown.
fn canned_access_log() -> String {
    let mut body = String::new();
    for _ in 0..133 {
        body.push_str(&clf("GET", "1.0", 200));
    }
    for _ in 0..10 {
        body.push_str(&clf("GET", "1.1", 200));
    }
    for _ in 0..36 {
        body.push_str(&clf("POST", "1.0", 200));
    }
    for _ in 0..13 {
        body.push_str(&clf("POST", "1.0", 404));
    }
    for _ in 0..8 {
        body.push_str(&clf("HEAD", "1.0", 204));
    }
    body
}

#[tokio::test]
async fn clf_parsing_accumulates_expected_counters() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("log");
    std::fs::write(&log, "").unwrap();
    let db = dir.path().join("state.db");
    let daemon = start(&[
        "-b",
        &db.display().to_string(),
        "-o",
        "clf",
        "apache",
        &format!("a:{}", log.display()),
    ])
    .await;

    wait_for_watcher(daemon.addr, "a").await;
    append(&log, &canned_access_log());
    wait_for_line(
        daemon.addr,
        "stats a",
        |line| line == "http_request: 200",
        "all 200 records",
    )
    .await;

    let stats = query(daemon.addr, "stats a").await;
    for expected in [
        "http_request: 200",
        "http_status_2xx: 187",
        "http_status_4xx: 13",
        "http_method_get: 143",
        "http_method_post: 49",
        "http_method_head: 8",
        "http_version_1_0: 190",
        "http_version_1_1: 10",
        "http_bytes: 20000",
        "malformed_request: 0",
    ] {
        assert!(
            stats.contains(&expected.to_string()),
            "missing '{}' in {:?}",
            expected,
            stats
        );
    }
    let mut sorted = stats.clone();
    sorted.sort();
    assert_eq!(stats, sorted, "stats reply must be sorted");

    daemon.stop().await;
}

#[tokio::test]
async fn files_reports_offset_and_size() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("log");
    std::fs::write(&log, "").unwrap();
    let db = dir.path().join("state.db");
    let daemon = start(&[
        "-b",
        &db.display().to_string(),
        "-o",
        "clf",
        "apache",
        &format!("a:{}", log.display()),
    ])
    .await;

    wait_for_watcher(daemon.addr, "a").await;
    append(&log, &canned_access_log());
    wait_for_line(
        daemon.addr,
        "stats a",
        |line| line == "http_request: 200",
        "all 200 records",
    )
    .await;

    let size = std::fs::metadata(&log).unwrap().len();
    let canonical = std::fs::canonicalize(&log).unwrap();
    let files = query(daemon.addr, "files a").await;
    assert_eq!(
        files,
        vec![format!("{}:{}:{}", size, size, canonical.display())]
    );

    daemon.stop().await;
}
