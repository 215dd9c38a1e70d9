use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::watch;

use common::cluster::{BucketMD, DaemonInfo, Smap};
use common::keepalive::KeepaliveTracker;
use common::owner::MetaOwner;
use common::retry::RetryPolicy;
use common::vote::VoteLedger;

/// Immutable per-process configuration, fixed at construction.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub workdir: PathBuf,
    pub keepalive_interval: Duration,
    pub suspect_factor: u32,
    /// how long an unresolved election may keep `vote_in_progress` up
    pub vote_timeout: Duration,
    pub discovery_timeout: Duration,
    pub discovery_retry: Duration,
    pub retry: RetryPolicy,
}

#[derive(Clone)]
pub struct ProxyState {
    pub si: Arc<DaemonInfo>,
    pub smap: Arc<MetaOwner<Smap>>,
    pub bmd: Arc<MetaOwner<BucketMD>>,
    pub ledger: Arc<VoteLedger>,
    pub kalive: Arc<KeepaliveTracker>,
    pub http_client: Client,
    pub shutdown_tx: Arc<watch::Sender<bool>>,
    pub config: Arc<ProxyConfig>,
}

impl ProxyState {
    pub fn is_primary(&self) -> bool {
        self.smap.get().primary == self.si.daemon_id
    }
}
