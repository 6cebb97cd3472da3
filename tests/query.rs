#[path = "common/mod.rs"]
mod common;

use common::{query, query_raw, start};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn setup(dir: &tempfile::TempDir) -> (String, String) {
    let log = dir.path().join("log");
    std::fs::write(&log, "").unwrap();
    let db = dir.path().join("state.db");
    (log.display().to_string(), db.display().to_string())
}

#[tokio::test]
async fn empty_zone_discovery() {
    let dir = tempfile::tempdir().unwrap();
    let (log, db) = setup(&dir);
    let daemon = start(&["-b", &db, "apache", &format!("a:{}", log)]).await;
    assert_eq!(query(daemon.addr, "zones").await, vec!["a:a"]);
    daemon.stop().await;
}

#[tokio::test]
async fn replies_are_crlf_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let (log, db) = setup(&dir);
    let daemon = start(&["-b", &db, "apache", &format!("a:{}", log)]).await;
    let raw = query_raw(daemon.addr, "zones").await;
    assert_eq!(raw, "a:a\r\n");
    daemon.stop().await;
}

#[tokio::test]
async fn verbs_are_case_insensitive_on_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let (log, db) = setup(&dir);
    let daemon = start(&["-b", &db, "apache", &format!("web:{}", log)]).await;
    assert_eq!(query(daemon.addr, "ZONES").await, vec!["a:web"]);
    daemon.stop().await;
}

#[tokio::test]
async fn unknown_command_keeps_the_connection_open() {
    let dir = tempfile::tempdir().unwrap();
    let (log, db) = setup(&dir);
    let daemon = start(&["-b", &db, "apache", &format!("a:{}", log)]).await;

    let mut stream = tokio::net::TcpStream::connect(daemon.addr).await.unwrap();
    stream
        .write_all(b"bogus\nzones\nquit\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&buf), "error\r\na:a\r\n");
    daemon.stop().await;
}

#[tokio::test]
async fn globs_lists_wildcards_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let (log, db) = setup(&dir);
    let second = dir.path().join("access");
    std::fs::write(&second, "").unwrap();
    let daemon = start(&[
        "-b",
        &db,
        "apache",
        &format!("a:{}", log),
        &format!("a:{}", second.display()),
    ])
    .await;

    let reply = query(daemon.addr, "globs a").await;
    let mut sorted = reply.clone();
    sorted.sort();
    assert_eq!(reply, sorted);
    assert_eq!(reply.len(), 2);

    assert_eq!(
        query(daemon.addr, "globs nope").await,
        vec!["no such active zone"]
    );
    daemon.stop().await;
}

#[tokio::test]
async fn stats_and_dump_reject_unknown_zones() {
    let dir = tempfile::tempdir().unwrap();
    let (log, db) = setup(&dir);
    let daemon = start(&["-b", &db, "apache", &format!("a:{}", log)]).await;
    assert_eq!(query(daemon.addr, "stats ghost").await, vec!["no such zone"]);
    assert_eq!(query(daemon.addr, "dump ghost").await, vec!["no such zone"]);
    assert_eq!(
        query(daemon.addr, "files ghost").await,
        vec!["no such active zone"]
    );
    daemon.stop().await;
}

#[tokio::test]
async fn dump_exposes_seeded_state() {
    let dir = tempfile::tempdir().unwrap();
    let (log, db) = setup(&dir);
    let daemon = start(&["-b", &db, "apache", &format!("a:{}", log)]).await;
    let reply = query(daemon.addr, "dump a").await;
    assert!(reply.contains(&"public:http_request: 0".to_string()));
    assert!(reply.contains(&"public:malformed_request: 0".to_string()));
    daemon.stop().await;
}
