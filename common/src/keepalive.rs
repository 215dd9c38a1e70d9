//! Per-peer liveness bookkeeping. Heartbeats piggyback on ordinary control
//! traffic (`heard_from`) and on each daemon's low-rate probe loop; the
//! loops themselves live with the daemon that runs them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct KeepaliveTracker {
    interval: Duration,
    suspect_factor: u32,
    last_heard: Mutex<HashMap<String, Instant>>,
}

impl KeepaliveTracker {
    pub fn new(interval: Duration, suspect_factor: u32) -> Self {
        Self {
            interval,
            suspect_factor,
            last_heard: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn heard_from(&self, daemon_id: &str) {
        self.last_heard
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(daemon_id.to_string(), Instant::now());
    }

    /// A peer is suspect once it has been silent for `suspect_factor`
    /// intervals. A peer never heard from is not suspect; it becomes
    /// tracked on first contact (or first probe attempt via `note`).
    pub fn is_suspect(&self, daemon_id: &str) -> bool {
        let map = self.last_heard.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(daemon_id) {
            Some(at) => at.elapsed() > self.interval * self.suspect_factor,
            None => false,
        }
    }

    /// Start tracking a peer without counting it as heard.
    pub fn note(&self, daemon_id: &str) {
        let mut map = self.last_heard.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(daemon_id.to_string()).or_insert_with(Instant::now);
    }

    /// Forget peers that left the cluster map.
    pub fn retain(&self, live_ids: &[&str]) {
        self.last_heard
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|id, _| live_ids.contains(&id.as_str()));
    }
}
