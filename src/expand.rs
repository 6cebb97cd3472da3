//! Wildcard re-expansion.
//!
//! Runs at boot, on every expand heartbeat and on SIGHUP. Each pass
//! resolves every configured wildcard to the set of currently existing
//! regular files, canonicalized so the same file reached through
//! different paths gets exactly one watcher. Subscription follows
//! configuration order: by default the first matching zone claims a file,
//! with `--multiple` every matching zone is appended once. Watchers whose
//! path no longer matches anything are dropped.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::watch::{WatchEvent, Watcher, WatcherId};

/// The static expansion inputs, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct ExpandRules {
    /// `(zone, wildcard)` pairs in configuration order.
    pub wildcards: Vec<(String, String)>,
    /// Subscribe every matching zone instead of the first one.
    pub multiple: bool,
    /// Base directory for relative wildcards.
    pub change_dir: Option<PathBuf>,
    /// Zone subscribed to every watcher, after regular subscription.
    pub aggregate: Option<String>,
}

impl ExpandRules {
    /// Wildcards configured for one zone, sorted for the `globs` query.
    pub fn globs_for(&self, zone: &str) -> Vec<String> {
        let mut globs: Vec<String> = self
            .wildcards
            .iter()
            .filter(|(z, _)| z == zone)
            .map(|(_, w)| w.clone())
            .collect();
        globs.sort();
        globs
    }

    /// Active zone names, configuration order, aggregate last.
    pub fn active_zones(&self) -> Vec<String> {
        let mut zones: Vec<String> = Vec::new();
        for (zone, _) in &self.wildcards {
            if !zones.iter().any(|z| z == zone) {
                zones.push(zone.clone());
            }
        }
        if let Some(aggregate) = &self.aggregate {
            if !zones.iter().any(|z| z == aggregate) {
                zones.push(aggregate.clone());
            }
        }
        zones
    }

    fn qualified(&self, pattern: &str) -> String {
        match &self.change_dir {
            Some(base) if !Path::new(pattern).is_absolute() => {
                base.join(pattern).to_string_lossy().into_owned()
            }
            _ => pattern.to_string(),
        }
    }
}

/// Engine-owned collection of live watchers, keyed by id with a canonical
/// path index ensuring one watcher per real file.
#[derive(Debug, Default)]
pub struct WatcherSet {
    next_id: WatcherId,
    by_id: HashMap<WatcherId, Watcher>,
    by_path: HashMap<PathBuf, WatcherId>,
}

impl WatcherSet {
    pub fn get(&self, id: WatcherId) -> Option<&Watcher> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: WatcherId) -> Option<&mut Watcher> {
        self.by_id.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Watcher> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn id_for(&self, path: &Path) -> Option<WatcherId> {
        self.by_path.get(path).copied()
    }

    /// Drop every watcher; their tasks abort on drop.
    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_path.clear();
    }

    fn insert(
        &mut self,
        path: PathBuf,
        events: &mpsc::Sender<WatchEvent>,
        poll: Duration,
    ) -> WatcherId {
        let id = self.next_id;
        self.next_id += 1;
        let watcher = Watcher::spawn(id, path.clone(), events.clone(), poll);
        self.by_id.insert(id, watcher);
        self.by_path.insert(path, id);
        id
    }

    fn retain_paths(&mut self, existing: &HashSet<PathBuf>) -> usize {
        let stale: Vec<PathBuf> = self
            .by_path
            .keys()
            .filter(|path| !existing.contains(*path))
            .cloned()
            .collect();
        for path in &stale {
            if let Some(id) = self.by_path.remove(path) {
                self.by_id.remove(&id);
            }
        }
        stale.len()
    }
}

/// Resolve every wildcard to existing regular files, canonicalized, in
/// configuration order.
pub fn resolve(rules: &ExpandRules) -> Vec<(String, Vec<PathBuf>)> {
    let mut resolved = Vec::new();
    for (zone, pattern) in &rules.wildcards {
        let qualified = rules.qualified(pattern);
        let mut paths = Vec::new();
        match glob::glob(&qualified) {
            Ok(matches) => {
                for entry in matches {
                    let path = match entry {
                        Ok(path) => path,
                        Err(e) => {
                            tracing::warn!(zone = %zone, error = %e, "unreadable glob entry");
                            continue;
                        }
                    };
                    if !path.is_file() {
                        continue;
                    }
                    match std::fs::canonicalize(&path) {
                        Ok(real) => paths.push(real),
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "cannot canonicalize");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(zone = %zone, pattern = %qualified, error = %e, "bad wildcard");
            }
        }
        resolved.push((zone.clone(), paths));
    }
    resolved
}

/// One full expansion pass; returns `(created, removed)` watcher counts.
pub fn expand(
    rules: &ExpandRules,
    watchers: &mut WatcherSet,
    events: &mpsc::Sender<WatchEvent>,
    poll: Duration,
) -> (usize, usize) {
    let resolved = resolve(rules);

    let existing: HashSet<PathBuf> = resolved
        .iter()
        .flat_map(|(_, paths)| paths.iter().cloned())
        .collect();

    let mut created = 0;
    for (zone, paths) in &resolved {
        for path in paths {
            match watchers.id_for(path) {
                None => {
                    let id = watchers.insert(path.clone(), events, poll);
                    if let Some(watcher) = watchers.get_mut(id) {
                        watcher.subscribe(zone);
                    }
                    created += 1;
                    tracing::info!(zone = %zone, path = %path.display(), "watching");
                }
                Some(id) if rules.multiple => {
                    if let Some(watcher) = watchers.get_mut(id) {
                        if watcher.subscribe(zone) {
                            tracing::debug!(zone = %zone, path = %path.display(), "subscribed");
                        }
                    }
                }
                // Default mode: the first zone in configuration order
                // already claimed this file.
                Some(_) => {}
            }
        }
    }

    if let Some(aggregate) = &rules.aggregate {
        for path in &existing {
            if let Some(id) = watchers.id_for(path) {
                if let Some(watcher) = watchers.get_mut(id) {
                    watcher.subscribe(aggregate);
                }
            }
        }
    }

    let removed = watchers.retain_paths(&existing);
    if removed > 0 {
        tracing::info!(removed, "dropped watchers for vanished files");
    }
    (created, removed)
}
