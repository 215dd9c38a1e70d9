//! Vote bookkeeping shared by both daemon roles. Proxies additionally run
//! the candidate side of the election; everybody answers vote requests and
//! flags in-flight votes on the discovery endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub candidate_id: String,
    pub smap_version: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub granted: bool,
}

#[derive(Default)]
struct Ballot {
    /// (term, candidate) of the vote cast in that term; one vote per term.
    cast: Option<(i64, String)>,
}

pub struct VoteLedger {
    in_progress: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    ballot: Mutex<Ballot>,
}

impl Default for VoteLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl VoteLedger {
    pub fn new() -> Self {
        Self {
            in_progress: AtomicBool::new(false),
            started_at: Mutex::new(None),
            ballot: Mutex::new(Ballot::default()),
        }
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn begin(&self) {
        self.in_progress.store(true, Ordering::Release);
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Cleared when the election resolves: a new Smap is applied, the vote
    /// is abandoned, or the window times out.
    pub fn clear(&self) {
        self.in_progress.store(false, Ordering::Release);
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Drop a vote-in-progress marker that has outlived `window`; returns
    /// whether anything was cleared.
    pub fn expire(&self, window: Duration) -> bool {
        let started = *self.started_at.lock().unwrap_or_else(|e| e.into_inner());
        match started {
            Some(t) if t.elapsed() > window => {
                self.clear();
                true
            }
            _ => false,
        }
    }

    /// Decide a vote request. Granted iff the local daemon either cannot
    /// reach the primary or is not ahead of the candidate's map, and it has
    /// not already voted for somebody else in this term. Granting marks the
    /// vote window open.
    pub fn grant(&self, req: &VoteRequest, local_version: i64, primary_reachable: bool) -> bool {
        if primary_reachable && local_version > req.smap_version {
            return false;
        }
        let mut ballot = self.ballot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((term, cand)) = &ballot.cast {
            if *term == req.smap_version && cand != &req.candidate_id {
                return false;
            }
        }
        ballot.cast = Some((req.smap_version, req.candidate_id.clone()));
        drop(ballot);
        self.begin();
        true
    }
}
