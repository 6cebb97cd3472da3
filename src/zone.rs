//! Per-zone counter state and the ordered zone store.
//!
//! A zone is a named bucket of counters fed by one or more watched files.
//! Its state has three parts: long-term `public` counters exposed to
//! clients, `private` plugin-owned scratch, and a bounded ring of sliding
//! `windows` with the currently-accumulating window at index 0.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counter map; values are JSON numbers.
pub type Counters = BTreeMap<String, f64>;

/// Plugin-owned scratch, opaque to clients.
pub type Scratch = serde_json::Map<String, serde_json::Value>;

/// Zone names admit `[A-Za-z0-9_-]+` only.
pub fn valid_zone_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneState {
    #[serde(default)]
    pub public: Counters,
    #[serde(default)]
    pub private: Scratch,
    #[serde(default)]
    pub windows: Vec<Counters>,
}

impl ZoneState {
    pub fn new() -> Self {
        ZoneState {
            public: Counters::new(),
            private: Scratch::new(),
            windows: vec![Counters::new()],
        }
    }

    /// The currently-accumulating window. The ring always holds at least
    /// one window after init; a state decoded from an old snapshot may
    /// arrive empty, so repair on access.
    pub fn current_window(&mut self) -> &mut Counters {
        if self.windows.is_empty() {
            self.windows.push(Counters::new());
        }
        &mut self.windows[0]
    }

    /// Completed windows, newest first. The in-progress window at index 0
    /// is excluded; this is the view handed to `stats`/`dump` and timers.
    pub fn completed_windows(&self) -> &[Counters] {
        if self.windows.len() > 1 {
            &self.windows[1..]
        } else {
            &[]
        }
    }

    /// Open a fresh current window and truncate the ring to `limit`
    /// entries. Callers run the plugin's window rollover *before* this so
    /// the just-completed window is still at index 0 there.
    pub fn open_window(&mut self, limit: usize) {
        self.windows.insert(0, Counters::new());
        self.windows.truncate(limit.max(1));
    }
}

/// Outcome of a `wipe` request against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipeOutcome {
    Removed,
    Active,
    NoSuchZone,
}

/// Configuration-ordered mapping of zone name to state.
///
/// Active zones (those with at least one configured wildcard) are fixed at
/// startup and iterate in configuration order; zones found only in a
/// persisted snapshot become inactive: queryable and wipeable, not watched.
#[derive(Debug, Default)]
pub struct ZoneStore {
    zones: IndexMap<String, ZoneState>,
    active: Vec<String>,
}

impl ZoneStore {
    pub fn new(active: Vec<String>) -> Self {
        let mut zones = IndexMap::new();
        for name in &active {
            zones.entry(name.clone()).or_insert_with(ZoneState::new);
        }
        ZoneStore { zones, active }
    }

    /// Merge a decoded snapshot: configured zones adopt the persisted
    /// state, unknown zones are appended as inactive.
    pub fn load(&mut self, snapshot: IndexMap<String, ZoneState>) {
        for (name, mut state) in snapshot {
            if state.windows.is_empty() {
                state.windows.push(Counters::new());
            }
            self.zones.insert(name, state);
        }
        // Re-assert ring presence for configured zones the snapshot missed.
        for name in &self.active {
            self.zones.entry(name.clone()).or_insert_with(ZoneState::new);
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.iter().any(|z| z == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.zones.contains_key(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ZoneState> {
        self.zones.get_mut(name)
    }

    pub fn get(&self, name: &str) -> Option<&ZoneState> {
        self.zones.get(name)
    }

    /// Active zone names in configuration order.
    pub fn active_zones(&self) -> impl Iterator<Item = &str> {
        self.active.iter().map(String::as_str)
    }

    /// Inactive zone names in store order.
    pub fn inactive_zones(&self) -> impl Iterator<Item = &str> {
        self.zones
            .keys()
            .map(String::as_str)
            .filter(|name| !self.is_active(name))
    }

    /// Mutable iteration over every zone in store order; window slides
    /// touch inactive zones too so their rings keep moving.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut ZoneState)> {
        self.zones.iter_mut()
    }

    /// Remove a zone iff it is inactive.
    pub fn wipe(&mut self, name: &str) -> WipeOutcome {
        if self.is_active(name) {
            return WipeOutcome::Active;
        }
        // shift_remove keeps the remaining listing order stable.
        match self.zones.shift_remove(name) {
            Some(_) => WipeOutcome::Removed,
            None => WipeOutcome::NoSuchZone,
        }
    }

    /// Remove every inactive zone; returns how many were dropped.
    pub fn wipe_all_inactive(&mut self) -> usize {
        let before = self.zones.len();
        let active = std::mem::take(&mut self.active);
        self.zones.retain(|name, _| active.iter().any(|z| z == name));
        self.active = active;
        before - self.zones.len()
    }

    /// Borrow the full map for persistence.
    pub fn all(&self) -> &IndexMap<String, ZoneState> {
        &self.zones
    }
}
