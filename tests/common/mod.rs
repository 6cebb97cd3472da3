use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tailstat::{Config, Engine, EngineHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// A daemon under test, listening on an ephemeral port.
#[allow(dead_code)]
pub struct Daemon {
    pub addr: SocketAddr,
    pub handle: EngineHandle,
    task: JoinHandle<anyhow::Result<()>>,
}

/// Boot a full engine from CLI-style arguments. The listener address is
/// injected; callers pass plugin, wildcards and the database path.
#[allow(dead_code)]
pub async fn start(args: &[&str]) -> Daemon {
    let mut full = vec![
        "tailstat".to_string(),
        "-l".to_string(),
        "127.0.0.1:0".to_string(),
    ];
    full.extend(args.iter().map(|s| s.to_string()));
    let cfg = Config::from_args(full).unwrap();
    let engine = Engine::new(cfg).await.unwrap();
    let addr = engine.local_addr().unwrap();
    let handle = engine.handle();
    let task = tokio::spawn(engine.run());
    Daemon { addr, handle, task }
}

impl Daemon {
    /// Graceful stop: final snapshot lands before this returns.
    #[allow(dead_code)]
    pub async fn stop(self) {
        self.handle.shutdown().await;
        let _ = self.task.await;
    }
}

/// Send one command and collect the raw reply bytes. The trailing `quit`
/// closes the connection so the reply ends at EOF.
#[allow(dead_code)]
pub async fn query_raw(addr: SocketAddr, command: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("{}\nquit\n", command).as_bytes())
        .await
        .unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}

/// Reply lines with CRLF terminators stripped.
#[allow(dead_code)]
pub async fn query(addr: SocketAddr, command: &str) -> Vec<String> {
    query_raw(addr, command)
        .await
        .split("\r\n")
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Poll a command until some reply line satisfies the predicate; panics
/// after the deadline so failures carry the last reply.
#[allow(dead_code)]
pub async fn wait_for_line<F>(addr: SocketAddr, command: &str, mut pred: F, what: &str)
where
    F: FnMut(&str) -> bool,
{
    let mut last = Vec::new();
    for _ in 0..150 {
        last = query(addr, command).await;
        if last.iter().any(|line| pred(line)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}; last reply: {:?}", what, last);
}

/// Wait until the zone's watcher is registered and has settled on its
/// file, so lines appended afterwards are guaranteed to be seen.
#[allow(dead_code)]
pub async fn wait_for_watcher(addr: SocketAddr, zone: &str) {
    let command = format!("files {}", zone);
    wait_for_line(addr, &command, |line| line.contains(':'), "watcher").await;
    // Give the freshly spawned tail task a poll cycle to open the file.
    tokio::time::sleep(Duration::from_millis(1200)).await;
}

#[allow(dead_code)]
pub fn append(path: &Path, data: &str) {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(data.as_bytes()).unwrap();
}
