#[path = "common/mod.rs"]
mod common;

use common::{append, query, start, wait_for_line, wait_for_watcher};

/// A canned scan log: 1207 clean results and 8 detections across three
/// signatures.
fn canned_scan_log() -> String {
    let mut body = String::new();
    let mut detections = vec![
        "Exploit.HTML.IFrame-8",
        "Exploit.HTML.IFrame-8",
        "Exploit.HTML.IFrame-8",
        "Exploit.HTML.IFrame-8",
        "Suspect.DoubleExtension-zippwd-9",
        "Worm.NetSky-14",
        "Worm.NetSky-14",
        "Worm.NetSky-14",
    ]
    .into_iter();
    for i in 0..1215u32 {
        if i % 150 == 7 {
            if let Some(signature) = detections.next() {
                body.push_str(&format!("/srv/mail/cur/{}: {} FOUND\n", i, signature));
                continue;
            }
        }
        body.push_str(&format!("/srv/mail/cur/{}: OK\n", i));
    }
    body
}

#[tokio::test]
async fn type_mode_tallies_per_signature() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("clamd.log");
    std::fs::write(&log, "").unwrap();
    let db = dir.path().join("state.db");
    let daemon = start(&[
        "-b",
        &db.display().to_string(),
        "-o",
        "type",
        "clamd",
        &format!("a:{}", log.display()),
    ])
    .await;

    wait_for_watcher(daemon.addr, "a").await;
    append(&log, &canned_scan_log());
    wait_for_line(
        daemon.addr,
        "stats a",
        |line| line == "clean: 1207",
        "all scan results",
    )
    .await;

    let stats = query(daemon.addr, "stats a").await;
    for expected in [
        "clean: 1207",
        "malware: 8",
        "malware:Exploit.HTML.IFrame-8: 4",
        "malware:Suspect.DoubleExtension-zippwd-9: 1",
        "malware:Worm.NetSky-14: 3",
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
