//! The engine owns every piece of mutable state: the zone store, the
//! watcher set, armed timers and the database handle. Watcher tasks, the
//! accept loop and signal streams all feed one `select!` loop here, so
//! every mutation runs serially and plugin callbacks never interleave.
//! Persistence runs between handlers and always sees a consistent view.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::expand::{self, ExpandRules, WatcherSet};
use crate::persist::Database;
use crate::plugins::{ParseErrorLevel, Plugin};
use crate::server::{self, Command, QueryRequest};
use crate::timer::{next_fire, TimerSpec};
use crate::watch::WatchEvent;
use crate::zone::{WipeOutcome, ZoneState, ZoneStore};

/// How often each watcher polls its file.
const WATCH_POLL: Duration = Duration::from_millis(500);

/// Control messages for signal handlers and embedders (tests).
#[derive(Debug, Clone, Copy)]
pub enum Control {
    Shutdown,
    Expand,
}

/// Cloneable handle for poking a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    control: mpsc::Sender<Control>,
}

impl EngineHandle {
    pub async fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown).await;
    }

    pub async fn expand(&self) {
        let _ = self.control.send(Control::Expand).await;
    }
}

#[derive(Debug)]
struct ArmedTimer {
    spec: TimerSpec,
    next: DateTime<Local>,
}

pub struct Engine {
    rules: ExpandRules,
    plugin: Box<dyn Plugin>,
    parse_error: ParseErrorLevel,
    zones: ZoneStore,
    watchers: WatcherSet,
    db: Database,
    timers: Vec<ArmedTimer>,
    window_size: Duration,
    windows_num: usize,
    expand_period: Duration,
    store_period: Duration,
    watch_tx: mpsc::Sender<WatchEvent>,
    watch_rx: Option<mpsc::Receiver<WatchEvent>>,
    query_rx: Option<mpsc::Receiver<QueryRequest>>,
    query_tx: mpsc::Sender<QueryRequest>,
    control_rx: Option<mpsc::Receiver<Control>>,
    control_tx: mpsc::Sender<Control>,
    listener: Option<TcpListener>,
}

impl Engine {
    /// Build an engine from validated configuration: load the snapshot
    /// (fatal if it will not decode), seed zones, bind the listener
    /// (fatal if the address is taken).
    pub async fn new(cfg: Config) -> Result<Engine> {
        let plugin = cfg.build_plugin()?;
        Engine::with_plugin(cfg, plugin).await
    }

    pub async fn with_plugin(cfg: Config, plugin: Box<dyn Plugin>) -> Result<Engine> {
        let db = Database::new(&cfg.database);
        let mut zones = ZoneStore::new(cfg.rules.active_zones());
        match db.load().with_context(|| {
            format!(
                "refusing to start with undecodable database '{}'",
                cfg.database.display()
            )
        })? {
            Some(snapshot) => {
                tracing::info!(zones = snapshot.zones.len(), path = %cfg.database.display(), "state restored");
                zones.load(snapshot.zones);
            }
            None => {
                tracing::info!(path = %cfg.database.display(), "starting with empty state");
            }
        }

        let listener = TcpListener::bind(cfg.listen)
            .await
            .with_context(|| format!("cannot listen on {}", cfg.listen))?;
        tracing::info!(addr = %listener.local_addr()?, "query listener bound");

        let parse_error = cfg.parse_error.unwrap_or_else(|| plugin.parse_error_default());

        let now = Local::now();
        let timers = cfg
            .timers
            .iter()
            .map(|spec| ArmedTimer {
                next: next_fire(now, spec),
                spec: spec.clone(),
            })
            .collect();

        let (watch_tx, watch_rx) = mpsc::channel(1024);
        let (query_tx, query_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::channel(8);

        let mut engine = Engine {
            rules: cfg.rules,
            plugin,
            parse_error,
            zones,
            watchers: WatcherSet::default(),
            db,
            timers,
            window_size: cfg.window_size,
            windows_num: cfg.windows_num,
            expand_period: cfg.expand_period,
            store_period: cfg.store_period,
            watch_tx,
            watch_rx: Some(watch_rx),
            query_rx: Some(query_rx),
            query_tx,
            control_rx: Some(control_rx),
            control_tx,
            listener: Some(listener),
        };
        engine.init_zones();
        Ok(engine)
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            control: self.control_tx.clone(),
        }
    }

    /// Event loop. Returns after a shutdown control message or signal,
    /// with a final snapshot on disk.
    pub async fn run(mut self) -> Result<()> {
        let mut watch_rx = self.watch_rx.take().context("engine already running")?;
        let mut query_rx = self.query_rx.take().context("engine already running")?;
        let mut control_rx = self.control_rx.take().context("engine already running")?;
        let listener = self.listener.take().context("engine already running")?;

        self.expand();
        let server: JoinHandle<()> = tokio::spawn(server::serve(listener, self.query_tx.clone()));

        let mut slide = tokio::time::interval_at(
            tokio::time::Instant::now() + self.window_size,
            self.window_size,
        );
        let mut expand = tokio::time::interval_at(
            tokio::time::Instant::now() + self.expand_period,
            self.expand_period,
        );
        let mut save = tokio::time::interval_at(
            tokio::time::Instant::now() + self.store_period,
            self.store_period,
        );

        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
        let mut sigusr1 =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())?;

        loop {
            let timer_due = self.timers.iter().map(|t| t.next).min();
            let timer_gate = async move {
                match timer_due {
                    Some(due) => {
                        let wait = (due - Local::now()).to_std().unwrap_or(Duration::ZERO);
                        tokio::time::sleep(wait).await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                Some(event) = watch_rx.recv() => self.on_watch(event),
                Some(request) = query_rx.recv() => self.on_query(request),
                Some(control) = control_rx.recv() => match control {
                    Control::Shutdown => break,
                    Control::Expand => self.expand(),
                },
                _ = slide.tick() => self.slide_windows(),
                _ = expand.tick() => self.expand(),
                _ = save.tick() => self.save(),
                _ = timer_gate => self.fire_due_timers(),
                _ = sigint.recv() => {
                    tracing::info!("interrupted");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("terminated");
                    break;
                }
                _ = sighup.recv() => {
                    tracing::info!("SIGHUP: re-expanding wildcards");
                    self.expand();
                }
                _ = sigusr1.recv() => {
                    tracing::debug!("SIGUSR1: log reopen is delegated to the logging backend");
                }
            }
        }

        tracing::info!("shutting down");
        self.save();
        self.timers.clear();
        server.abort();
        self.watchers.clear();
        Ok(())
    }

    /// `init_zone` runs for every configured zone after every load, so
    /// plugin seeding must be idempotent.
    fn init_zones(&mut self) {
        let active: Vec<String> = self.zones.active_zones().map(str::to_string).collect();
        for zone in active {
            if let Some(state) = self.zones.get_mut(&zone) {
                let ZoneState {
                    public,
                    private,
                    windows,
                } = state;
                if windows.is_empty() {
                    windows.push(Default::default());
                }
                self.plugin.init_zone(&zone, public, private, &mut windows[0]);
            }
        }
    }

    fn expand(&mut self) {
        let (created, removed) =
            expand::expand(&self.rules, &mut self.watchers, &self.watch_tx, WATCH_POLL);
        tracing::debug!(created, removed, total = self.watchers.len(), "expansion pass");
    }

    fn on_watch(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Line { watcher, line } => {
                let zones = match self.watchers.get(watcher) {
                    Some(w) => w.zones().to_vec(),
                    // Late line from a watcher removed by expansion.
                    None => return,
                };
                self.apply_line(&zones, &line);
            }
            WatchEvent::RolledOver { path, .. } => {
                tracing::info!(path = %path.display(), "rolled over");
            }
            WatchEvent::Error {
                path,
                syscall,
                errno,
                message,
                ..
            } => {
                tracing::error!(path = %path.display(), syscall, errno, %message, "watcher error");
            }
        }
    }

    /// One line, dispatched once per subscribed zone in subscription
    /// order. Unparsable lines touch nothing and are reported at the
    /// configured level.
    fn apply_line(&mut self, zones: &[String], line: &str) {
        let fields = match self.plugin.process_line(line) {
            Some(fields) => fields,
            None => {
                let zone = zones.first().map(String::as_str).unwrap_or("");
                self.parse_error.emit(zone, line);
                return;
            }
        };
        for zone in zones {
            if let Some(state) = self.zones.get_mut(zone) {
                let ZoneState {
                    public,
                    private,
                    windows,
                } = state;
                if windows.is_empty() {
                    windows.push(Default::default());
                }
                self.plugin
                    .process_data(&fields, public, private, &mut windows[0]);
            }
        }
    }

    /// Window slide: the plugin observes the ring with the just-completed
    /// window still at index 0, then a fresh window is opened and the
    /// ring truncated.
    fn slide_windows(&mut self) {
        for (_, state) in self.zones.iter_mut() {
            let ZoneState {
                public,
                private,
                windows,
            } = &mut *state;
            self.plugin.process_window(public, private, windows);
            state.open_window(self.windows_num);
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Local::now();
        let mut kept = Vec::with_capacity(self.timers.len());
        for mut timer in std::mem::take(&mut self.timers) {
            if timer.next > now {
                kept.push(timer);
                continue;
            }
            let rearm = match self.zones.get_mut(&timer.spec.zone) {
                Some(state) => {
                    let ZoneState {
                        public,
                        private,
                        windows,
                    } = state;
                    let completed: &[_] = if windows.len() > 1 { &windows[1..] } else { &[] };
                    self.plugin
                        .process_timer(&timer.spec.name, public, private, completed)
                }
                None => false,
            };
            if rearm {
                timer.next = next_fire(now, &timer.spec);
                tracing::debug!(zone = %timer.spec.zone, name = %timer.spec.name, next = %timer.next, "timer re-armed");
                kept.push(timer);
            } else {
                tracing::info!(zone = %timer.spec.zone, name = %timer.spec.name, "timer disarmed");
            }
        }
        self.timers = kept;
    }

    fn on_query(&mut self, request: QueryRequest) {
        let lines = self.handle_command(&request.command);
        let _ = request.reply.send(lines);
    }

    fn handle_command(&mut self, command: &Command) -> Vec<String> {
        match command {
            Command::Zones => {
                let mut lines: Vec<String> = self
                    .zones
                    .active_zones()
                    .map(|zone| format!("a:{}", zone))
                    .collect();
                lines.extend(self.zones.inactive_zones().map(|zone| format!("i:{}", zone)));
                lines
            }
            Command::Globs(zone) => {
                if self.zones.is_active(zone) {
                    self.rules.globs_for(zone)
                } else {
                    vec!["no such active zone".to_string()]
                }
            }
            Command::Files(zone) => {
                if !self.zones.is_active(zone) {
                    return vec!["no such active zone".to_string()];
                }
                let mut files: Vec<(String, u64, u64)> = self
                    .watchers
                    .iter()
                    .filter(|w| w.zones().iter().any(|z| z == zone))
                    .map(|w| (w.path.display().to_string(), w.offset(), w.file_size()))
                    .collect();
                files.sort();
                files
                    .into_iter()
                    .map(|(path, offset, size)| format!("{}:{}:{}", offset, size, path))
                    .collect()
            }
            Command::Stats(zone) => match self.zones.get(zone) {
                Some(state) => self.plugin.stats_zone(
                    zone,
                    &state.public,
                    &state.private,
                    state.completed_windows(),
                ),
                None => vec!["no such zone".to_string()],
            },
            Command::Dump(zone) => match self.zones.get(zone) {
                Some(state) => self.plugin.dump_zone(
                    zone,
                    &state.public,
                    &state.private,
                    state.completed_windows(),
                ),
                None => vec!["no such zone".to_string()],
            },
            Command::Wipe(zone) => {
                if zone == "*" {
                    let wiped = self.zones.wipe_all_inactive();
                    if wiped > 0 {
                        self.save();
                    }
                    vec!["ok".to_string()]
                } else {
                    match self.zones.wipe(zone) {
                        WipeOutcome::Removed => {
                            self.save();
                            vec!["ok".to_string()]
                        }
                        WipeOutcome::Active => vec!["zone is active".to_string()],
                        WipeOutcome::NoSuchZone => vec!["no such inactive zone".to_string()],
                    }
                }
            }
            // quit and unknown verbs never reach the engine.
            Command::Quit | Command::Unknown => vec!["error".to_string()],
        }
    }

    /// Snapshot write; failures are logged and absorbed, the previous
    /// database stays intact.
    fn save(&mut self) {
        if let Err(e) = self.db.save(self.zones.all()) {
            tracing::warn!(path = %self.db.path().display(), error = %e, "state save failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::bump;
    use crate::zone::{Counters, Scratch};
    use std::sync::{Arc, Mutex};

    /// Records the engine's dispatch order.
    #[derive(Debug)]
    struct Probe {
        calls: Arc<Mutex<Vec<String>>>,
        rearm: bool,
    }

    impl Probe {
        fn pair(rearm: bool) -> (Box<dyn Plugin>, Arc<Mutex<Vec<String>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (
                Box::new(Probe {
                    calls: calls.clone(),
                    rearm,
                }),
                calls,
            )
        }

        fn record(&self, entry: String) {
            self.calls.lock().unwrap().push(entry);
        }
    }

    impl Plugin for Probe {
        fn name(&self) -> &'static str {
            "probe"
        }

        fn init_zone(
            &self,
            zone: &str,
            public: &mut Counters,
            _private: &mut Scratch,
            _window: &mut Counters,
        ) {
            public.entry("seen".to_string()).or_insert(0.0);
            self.record(format!("init:{}", zone));
        }

        fn process_line(&self, line: &str) -> Option<Vec<String>> {
            if line == "bad" {
                None
            } else {
                Some(vec![line.to_string()])
            }
        }

        fn process_data(
            &self,
            fields: &Vec<String>,
            public: &mut Counters,
            _private: &mut Scratch,
            window: &mut Counters,
        ) {
            bump(public, "seen", 1.0);
            bump(window, "seen", 1.0);
            self.record(format!("data:{}", fields[0]));
        }

        fn process_window(
            &self,
            _public: &mut Counters,
            _private: &mut Scratch,
            windows: &mut [Counters],
        ) {
            let newest = windows[0].get("seen").copied().unwrap_or(0.0);
            self.record(format!("window:{}:{}", windows.len(), newest));
        }

        fn process_timer(
            &self,
            name: &str,
            _public: &mut Counters,
            _private: &mut Scratch,
            _windows: &[Counters],
        ) -> bool {
            self.record(format!("timer:{}", name));
            self.rearm
        }
    }

    async fn engine(args: &[&str]) -> (Engine, Arc<Mutex<Vec<String>>>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state.db");
        let mut full = vec![
            "tailstat".to_string(),
            "-b".to_string(),
            db.display().to_string(),
            "-l".to_string(),
            "127.0.0.1:0".to_string(),
        ];
        full.extend(args.iter().map(|s| s.to_string()));
        let cfg = Config::from_args(full).unwrap();
        let (plugin, calls) = Probe::pair(true);
        let engine = Engine::with_plugin(cfg, plugin).await.unwrap();
        (engine, calls, dir)
    }

    fn lines(calls: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn init_runs_for_each_configured_zone() {
        let (_engine, calls, _dir) = engine(&["apache", "a:/tmp/none", "b:/tmp/none"]).await;
        assert_eq!(lines(&calls), vec!["init:a", "init:b"]);
    }

    #[tokio::test]
    async fn lines_dispatch_per_zone_in_subscription_order() {
        let (mut engine, calls, _dir) = engine(&["apache", "a:/tmp/none", "b:/tmp/none"]).await;
        engine.apply_line(&["b".to_string(), "a".to_string()], "hit");
        let recorded = lines(&calls);
        assert_eq!(recorded[recorded.len() - 2..], ["data:hit", "data:hit"]);
        assert_eq!(engine.zones.get("a").unwrap().public["seen"], 1.0);
        assert_eq!(engine.zones.get("b").unwrap().public["seen"], 1.0);
    }

    #[tokio::test]
    async fn unparsable_lines_touch_nothing() {
        let (mut engine, calls, _dir) = engine(&["apache", "a:/tmp/none"]).await;
        engine.apply_line(&["a".to_string()], "bad");
        assert!(!lines(&calls).iter().any(|c| c.starts_with("data:")));
        assert_eq!(engine.zones.get("a").unwrap().public["seen"], 0.0);
    }

    #[tokio::test]
    async fn rollover_sees_completed_window_at_index_zero() {
        let (mut engine, calls, _dir) = engine(&["apache", "-n", "3", "a:/tmp/none"]).await;
        engine.apply_line(&["a".to_string()], "hit");
        engine.slide_windows();
        // One window in the ring holding the one line, observed before
        // the new window was opened.
        assert!(lines(&calls).contains(&"window:1:1".to_string()));
        let state = engine.zones.get("a").unwrap();
        assert_eq!(state.windows.len(), 2);
        assert!(state.windows[0].get("seen").copied().unwrap_or(0.0) == 0.0);
        assert_eq!(state.windows[1]["seen"], 1.0);
    }

    #[tokio::test]
    async fn ring_respects_windows_num_across_slides() {
        let (mut engine, _calls, _dir) = engine(&["apache", "-n", "3", "a:/tmp/none"]).await;
        for _ in 0..10 {
            engine.slide_windows();
            let len = engine.zones.get("a").unwrap().windows.len();
            assert!((1..=3).contains(&len));
        }
    }

    #[tokio::test]
    async fn zones_reply_lists_active_then_inactive() {
        let (mut engine, _calls, dir) = engine(&["apache", "web:/tmp/none"]).await;
        // Pre-existing state for a zone the config no longer carries.
        let mut snap = indexmap::IndexMap::new();
        snap.insert("legacy".to_string(), ZoneState::new());
        engine.zones.load(snap);

        let reply = engine.handle_command(&Command::Zones);
        assert_eq!(reply, vec!["a:web", "i:legacy"]);
        drop(dir);
    }

    #[tokio::test]
    async fn wipe_persists_immediately() {
        let (mut engine, _calls, _dir) = engine(&["apache", "web:/tmp/none"]).await;
        let mut snap = indexmap::IndexMap::new();
        snap.insert("legacy".to_string(), ZoneState::new());
        engine.zones.load(snap);

        assert_eq!(
            engine.handle_command(&Command::Wipe("legacy".to_string())),
            vec!["ok"]
        );
        let raw = std::fs::read_to_string(engine.db.path()).unwrap();
        assert!(!raw.contains("legacy"));

        assert_eq!(
            engine.handle_command(&Command::Wipe("web".to_string())),
            vec!["zone is active"]
        );
        assert_eq!(
            engine.handle_command(&Command::Wipe("ghost".to_string())),
            vec!["no such inactive zone"]
        );
    }

    #[tokio::test]
    async fn stats_and_files_reject_unknown_zones() {
        let (mut engine, _calls, _dir) = engine(&["apache", "web:/tmp/none"]).await;
        assert_eq!(
            engine.handle_command(&Command::Stats("nope".to_string())),
            vec!["no such zone"]
        );
        assert_eq!(
            engine.handle_command(&Command::Files("nope".to_string())),
            vec!["no such active zone"]
        );
        assert_eq!(
            engine.handle_command(&Command::Globs("nope".to_string())),
            vec!["no such active zone"]
        );
    }

    #[tokio::test]
    async fn due_timer_fires_and_rearms_in_the_future() {
        let (mut engine, calls, _dir) =
            engine(&["apache", "--timer", "web:rate:1h", "web:/tmp/none"]).await;
        // Force the timer due.
        engine.timers[0].next = Local::now() - chrono::Duration::seconds(1);
        engine.fire_due_timers();
        assert!(lines(&calls).contains(&"timer:rate".to_string()));
        assert_eq!(engine.timers.len(), 1);
        assert!(engine.timers[0].next > Local::now());
    }

    #[tokio::test]
    async fn declined_timer_is_disarmed() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::from_args([
            "tailstat",
            "-b",
            &dir.path().join("s.db").display().to_string(),
            "-l",
            "127.0.0.1:0",
            "--timer",
            "web:once:1m",
            "apache",
            "web:/tmp/none",
        ])
        .unwrap();
        let (plugin, _calls) = Probe::pair(false);
        let mut engine = Engine::with_plugin(cfg, plugin).await.unwrap();
        engine.timers[0].next = Local::now() - chrono::Duration::seconds(1);
        engine.fire_due_timers();
        assert!(engine.timers.is_empty());
    }
}
