//! Rotation-aware tail follower.
//!
//! Each watcher owns one file and runs as its own task, feeding complete
//! lines into the engine's event channel. A poll cycle compares the
//! path's device/inode pair and size against the open handle: growth is
//! an append, a different inode or a shrunken size is a rotation. On
//! rotation the new file is opened *before* reading restarts at offset
//! zero, so lines written to the new file between the swap and the next
//! cycle are never lost. Partial lines ride in an internal buffer and are
//! only delivered once their terminator arrives.

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memchr::memchr;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type WatcherId = u64;

/// Event emitted by a watcher task toward the engine.
#[derive(Debug)]
pub enum WatchEvent {
    /// One complete line, terminator stripped.
    Line { watcher: WatcherId, line: String },
    /// The path now points at a different file (or it was truncated).
    RolledOver { watcher: WatcherId, path: PathBuf },
    /// Unrecoverable syscall failure; the watcher stays and retries.
    Error {
        watcher: WatcherId,
        path: PathBuf,
        syscall: &'static str,
        errno: i32,
        message: String,
    },
}

/// Engine-side handle: subscription list plus the shared read offset.
#[derive(Debug)]
pub struct Watcher {
    pub id: WatcherId,
    pub path: PathBuf,
    zones: Vec<String>,
    offset: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl Watcher {
    /// Spawn the tail task for `path`. A fresh watcher starts at the
    /// file's current end; only lines appended afterwards count.
    pub fn spawn(
        id: WatcherId,
        path: PathBuf,
        events: mpsc::Sender<WatchEvent>,
        poll: Duration,
    ) -> Self {
        let offset = Arc::new(AtomicU64::new(0));
        let tail = Tail {
            id,
            path: path.clone(),
            events,
            poll,
            file: None,
            dev_ino: (0, 0),
            offset: 0,
            shared_offset: offset.clone(),
            pending: Vec::new(),
            failing: false,
        };
        let task = tokio::spawn(tail.run());
        Watcher {
            id,
            path,
            zones: Vec::new(),
            offset,
            task,
        }
    }

    /// Append a zone to the subscription list; keeps each zone at most
    /// once and preserves subscription order.
    pub fn subscribe(&mut self, zone: &str) -> bool {
        if self.zones.iter().any(|z| z == zone) {
            false
        } else {
            self.zones.push(zone.to_string());
            true
        }
    }

    pub fn zones(&self) -> &[String] {
        &self.zones
    }

    /// Current read offset, for the `files` query.
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    /// Current size of the underlying file.
    pub fn file_size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Tail {
    id: WatcherId,
    path: PathBuf,
    events: mpsc::Sender<WatchEvent>,
    poll: Duration,
    file: Option<File>,
    dev_ino: (u64, u64),
    offset: u64,
    shared_offset: Arc<AtomicU64>,
    pending: Vec<u8>,
    failing: bool,
}

enum Step {
    Continue,
    EngineGone,
}

impl Tail {
    async fn run(mut self) {
        if let Step::EngineGone = self.open_at_end().await {
            return;
        }
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Step::EngineGone = self.cycle().await {
                return;
            }
        }
    }

    /// Initial open: position at EOF so pre-existing content is skipped.
    async fn open_at_end(&mut self) -> Step {
        match File::open(&self.path).await {
            Ok(mut file) => match file_position_end(&mut file).await {
                Ok((meta, pos)) => {
                    self.dev_ino = (meta.dev(), meta.ino());
                    self.set_offset(pos);
                    self.file = Some(file);
                    self.failing = false;
                    Step::Continue
                }
                Err(e) => self.report("seek", e).await,
            },
            Err(e) => self.report("open", e).await,
        }
    }

    async fn cycle(&mut self) -> Step {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            // Mid-rotation gap: the old name is gone and the new file is
            // not there yet. Keep waiting; expansion prunes dead paths.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Step::Continue,
            Err(e) => return self.report("stat", e).await,
        };

        let rotated = self.file.is_none()
            || (meta.dev(), meta.ino()) != self.dev_ino
            || meta.len() < self.offset;
        if rotated {
            if let Step::EngineGone = self.reopen().await {
                return Step::EngineGone;
            }
        }

        self.read_new_bytes().await
    }

    /// Rotation: open the replacement first, then restart from zero. Any
    /// buffered partial line belonged to the old file and is dropped.
    async fn reopen(&mut self) -> Step {
        let announce = self.file.is_some();
        match File::open(&self.path).await {
            Ok(file) => match file.metadata().await {
                Ok(meta) => {
                    self.dev_ino = (meta.dev(), meta.ino());
                    self.file = Some(file);
                    self.set_offset(0);
                    self.pending.clear();
                    self.failing = false;
                    if announce {
                        let event = WatchEvent::RolledOver {
                            watcher: self.id,
                            path: self.path.clone(),
                        };
                        if self.events.send(event).await.is_err() {
                            return Step::EngineGone;
                        }
                    }
                    Step::Continue
                }
                Err(e) => self.report("stat", e).await,
            },
            Err(e) => self.report("open", e).await,
        }
    }

    async fn read_new_bytes(&mut self) -> Step {
        let Some(mut file) = self.file.take() else {
            return Step::Continue;
        };
        if let Err(e) = file.seek(SeekFrom::Start(self.offset)).await {
            return self.report("seek", e).await;
        }
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let n = match file.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => return self.report("read", e).await,
            };
            self.pending.extend_from_slice(&chunk[..n]);
            self.set_offset(self.offset + n as u64);
        }
        self.file = Some(file);
        self.failing = false;
        self.drain_lines().await
    }

    async fn drain_lines(&mut self) -> Step {
        while let Some(pos) = memchr(b'\n', &self.pending) {
            let line = String::from_utf8_lossy(&self.pending[..pos]).into_owned();
            self.pending.drain(..=pos);
            let event = WatchEvent::Line {
                watcher: self.id,
                line,
            };
            if self.events.send(event).await.is_err() {
                return Step::EngineGone;
            }
        }
        Step::Continue
    }

    /// First failure of a streak is reported; repeats stay quiet until
    /// the watcher recovers.
    async fn report(&mut self, syscall: &'static str, error: std::io::Error) -> Step {
        if self.failing {
            return Step::Continue;
        }
        self.failing = true;
        self.file = None;
        let event = WatchEvent::Error {
            watcher: self.id,
            path: self.path.clone(),
            syscall,
            errno: error.raw_os_error().unwrap_or(0),
            message: error.to_string(),
        };
        if self.events.send(event).await.is_err() {
            Step::EngineGone
        } else {
            Step::Continue
        }
    }

    fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
        self.shared_offset.store(offset, Ordering::Relaxed);
    }
}

async fn file_position_end(file: &mut File) -> std::io::Result<(std::fs::Metadata, u64)> {
    let meta = file.metadata().await?;
    let pos = file.seek(SeekFrom::End(0)).await?;
    Ok((meta, pos))
}
