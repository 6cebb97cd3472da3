//! Line-based TCP query server.
//!
//! One command per `\n`-terminated line, case-insensitive verb, replies
//! CRLF-terminated and fully flushed before the next command is read.
//! State-touching commands are forwarded to the engine over a channel
//! with a oneshot reply, which keeps all zone access serialized; `quit`
//! and unknown verbs are answered in place.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

/// A client command in the fixed verb set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Zones,
    Globs(String),
    Files(String),
    Dump(String),
    Stats(String),
    Wipe(String),
    Quit,
    Unknown,
}

impl Command {
    pub fn parse(line: &str) -> Command {
        let mut words = line.split_whitespace();
        let verb = match words.next() {
            Some(verb) => verb.to_ascii_lowercase(),
            None => return Command::Unknown,
        };
        let arg = words.next().map(str::to_string);
        if words.next().is_some() {
            return Command::Unknown;
        }
        match (verb.as_str(), arg) {
            ("zones", None) => Command::Zones,
            ("globs", Some(zone)) => Command::Globs(zone),
            ("files", Some(zone)) => Command::Files(zone),
            ("dump", Some(zone)) => Command::Dump(zone),
            ("stats", Some(zone)) => Command::Stats(zone),
            ("wipe", Some(zone)) => Command::Wipe(zone),
            ("quit", None) => Command::Quit,
            _ => Command::Unknown,
        }
    }
}

/// One forwarded command; the engine sends reply lines back verbatim.
#[derive(Debug)]
pub struct QueryRequest {
    pub command: Command,
    pub reply: oneshot::Sender<Vec<String>>,
}

/// Accept loop. Aborting the task drops the listener and every client.
pub async fn serve(listener: TcpListener, queries: mpsc::Sender<QueryRequest>) {
    let mut clients = JoinSet::new();
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "client connected");
                clients.spawn(handle_client(stream, queries.clone()));
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
            }
        }
        // Reap finished clients without blocking the accept loop.
        while clients.try_join_next().is_some() {}
    }
}

async fn handle_client(stream: TcpStream, queries: mpsc::Sender<QueryRequest>) {
    let peer = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut writer = BufWriter::new(write_half);

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(peer = ?peer, error = %e, "client read failed");
                break;
            }
        };
        let reply_lines = match Command::parse(&line) {
            Command::Quit => break,
            Command::Unknown => vec!["error".to_string()],
            command => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let request = QueryRequest {
                    command,
                    reply: reply_tx,
                };
                if queries.send(request).await.is_err() {
                    break;
                }
                match reply_rx.await {
                    Ok(lines) => lines,
                    Err(_) => break,
                }
            }
        };
        if write_reply(&mut writer, &reply_lines).await.is_err() {
            tracing::debug!(peer = ?peer, "client write failed");
            break;
        }
    }
    tracing::debug!(peer = ?peer, "client disconnected");
}

async fn write_reply(
    writer: &mut BufWriter<tokio::net::tcp::OwnedWriteHalf>,
    lines: &[String],
) -> std::io::Result<()> {
    for line in lines {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.flush().await
}
