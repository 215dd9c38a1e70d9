//! Flat counter sink for the data path. Counters are named rather than
//! typed so call sites read like the operations they account for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Default)]
pub struct StatsCounters {
    numget: AtomicU64,
    numput: AtomicU64,
    numdelete: AtomicU64,
    numcoldget: AtomicU64,
    numprefetch: AtomicU64,
    bytesprefetched: AtomicU64,
    numvchanged: AtomicU64,
    bytesvchanged: AtomicU64,
    numerr: AtomicU64,
}

impl StatsCounters {
    pub fn add(&self, name: &str, delta: u64) {
        let counter = match name {
            "numget" => &self.numget,
            "numput" => &self.numput,
            "numdelete" => &self.numdelete,
            "numcoldget" => &self.numcoldget,
            "numprefetch" => &self.numprefetch,
            "bytesprefetched" => &self.bytesprefetched,
            "numvchanged" => &self.numvchanged,
            "bytesvchanged" => &self.bytesvchanged,
            "numerr" => &self.numerr,
            other => {
                warn!("unknown stats counter {other:?}");
                return;
            }
        };
        counter.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, name: &str) -> u64 {
        match name {
            "numget" => self.numget.load(Ordering::Relaxed),
            "numput" => self.numput.load(Ordering::Relaxed),
            "numdelete" => self.numdelete.load(Ordering::Relaxed),
            "numcoldget" => self.numcoldget.load(Ordering::Relaxed),
            "numprefetch" => self.numprefetch.load(Ordering::Relaxed),
            "bytesprefetched" => self.bytesprefetched.load(Ordering::Relaxed),
            "numvchanged" => self.numvchanged.load(Ordering::Relaxed),
            "bytesvchanged" => self.bytesvchanged.load(Ordering::Relaxed),
            "numerr" => self.numerr.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "numget": self.get("numget"),
            "numput": self.get("numput"),
            "numdelete": self.get("numdelete"),
            "numcoldget": self.get("numcoldget"),
            "numprefetch": self.get("numprefetch"),
            "bytesprefetched": self.get("bytesprefetched"),
            "numvchanged": self.get("numvchanged"),
            "bytesvchanged": self.get("bytesvchanged"),
            "numerr": self.get("numerr"),
        })
    }
}

pub async fn stats_logger_loop(
    stats: Arc<StatsCounters>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    let mut last = stats.snapshot();
    loop {
        tokio::select! {
            _ = tick.tick() => {},
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
        }
        let cur = stats.snapshot();
        if cur != last {
            info!(stats = %cur, "target stats");
            last = cur;
        }
    }
    info!("stats logger stopped");
}
