//! Extended actions: registered, cancellable units of background work.
//! Singleton kinds (prefetch, rebalance) have at most one live instance
//! per node; delete/evict may run many, told apart by id.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum XactKind {
    Prefetch,
    Delete,
    Evict,
    Rebalance,
}

impl XactKind {
    pub fn is_singleton(self) -> bool {
        matches!(self, XactKind::Prefetch | XactKind::Rebalance)
    }
}

impl fmt::Display for XactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            XactKind::Prefetch => "prefetch",
            XactKind::Delete => "delete",
            XactKind::Evict => "evict",
            XactKind::Rebalance => "rebalance",
        };
        f.write_str(s)
    }
}

pub struct Xaction {
    pub id: u64,
    pub kind: XactKind,
    stime: Instant,
    /// daemon boot time; diagnostics report offsets from it
    boot: Instant,
    etime: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl Xaction {
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn finish(&self) {
        *self.etime.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    pub fn finished(&self) -> bool {
        self.etime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl fmt::Display for Xaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.stime.duration_since(self.boot);
        match *self.etime.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(etime) => write!(
                f,
                "xaction {}:{} started {:.1?} finished {:.1?}",
                self.kind,
                self.id,
                start,
                etime.duration_since(self.boot)
            ),
            None => write!(
                f,
                "xaction {}:{} started {:.1?}",
                self.kind, self.id, start
            ),
        }
    }
}

struct RegistryInner {
    next_id: u64,
    live: HashMap<u64, Arc<Xaction>>,
}

pub struct XactionRegistry {
    boot: Instant,
    inner: Mutex<RegistryInner>,
}

impl XactionRegistry {
    pub fn new(boot: Instant) -> Self {
        Self {
            boot,
            inner: Mutex::new(RegistryInner {
                next_id: 0,
                live: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(inner: &mut RegistryInner, boot: Instant, kind: XactKind) -> Arc<Xaction> {
        inner.next_id += 1;
        let xact = Arc::new(Xaction {
            id: inner.next_id,
            kind,
            stime: Instant::now(),
            boot,
            etime: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        inner.live.insert(xact.id, Arc::clone(&xact));
        xact
    }

    /// Register a new multi-instance xaction (delete/evict).
    pub fn new_xact(&self, kind: XactKind) -> Arc<Xaction> {
        let mut inner = self.lock();
        Self::insert(&mut inner, self.boot, kind)
    }

    /// Register a singleton; `None` when one of that kind is already live.
    pub fn renew(&self, kind: XactKind) -> Option<Arc<Xaction>> {
        let mut inner = self.lock();
        if inner.live.values().any(|x| x.kind == kind) {
            return None;
        }
        Some(Self::insert(&mut inner, self.boot, kind))
    }

    pub fn find(&self, kind: XactKind) -> Option<Arc<Xaction>> {
        self.lock()
            .live
            .values()
            .find(|x| x.kind == kind)
            .cloned()
    }

    pub fn get(&self, id: u64) -> Option<Arc<Xaction>> {
        self.lock().live.get(&id).cloned()
    }

    pub fn del(&self, id: u64) {
        self.lock().live.remove(&id);
    }

    pub fn abort(&self, id: u64) -> bool {
        match self.lock().live.get(&id) {
            Some(x) => {
                x.abort();
                true
            }
            None => false,
        }
    }

    pub fn abort_all(&self) {
        for x in self.lock().live.values() {
            x.abort();
        }
    }

    /// Diagnostic strings for every live xaction.
    pub fn running(&self) -> Vec<String> {
        self.lock().live.values().map(|x| x.to_string()).collect()
    }
}
