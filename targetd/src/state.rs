use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::{mpsc, watch};

use common::cluster::{BucketMD, DaemonInfo, Smap};
use common::keepalive::KeepaliveTracker;
use common::owner::MetaOwner;
use common::retry::RetryPolicy;
use common::vote::VoteLedger;

use crate::cloud::CloudBackend;
use crate::listrange::FilesWithDeadline;
use crate::stats::StatsCounters;
use crate::store::FsStore;
use crate::xaction::XactionRegistry;

/// Immutable per-process configuration, fixed at construction.
#[derive(Clone, Debug)]
pub struct TargetConfig {
    pub proxy_url: String,
    pub keepalive_interval: Duration,
    pub suspect_factor: u32,
    pub retry: RetryPolicy,
    /// opportunistically re-validate cached cloud objects on prefetch
    pub validate_warm_get: bool,
}

#[derive(Clone)]
pub struct TargetState {
    pub si: Arc<DaemonInfo>,
    pub smap: Arc<MetaOwner<Smap>>,
    pub bmd: Arc<MetaOwner<BucketMD>>,
    pub ledger: Arc<VoteLedger>,
    pub kalive: Arc<KeepaliveTracker>,
    pub http_client: Client,
    pub store: Arc<FsStore>,
    pub cloud: Arc<dyn CloudBackend>,
    pub stats: Arc<StatsCounters>,
    pub xactions: Arc<XactionRegistry>,
    pub prefetch_tx: mpsc::Sender<FilesWithDeadline>,
    pub shutdown_tx: Arc<watch::Sender<bool>>,
    pub config: Arc<TargetConfig>,
    pub boot: Instant,
}

impl TargetState {
    /// With an empty target map nothing is owned; callers surface
    /// `NoTargets` instead of silently claiming the object.
    pub fn is_owned_locally(&self, bucket: &str, objname: &str) -> bool {
        let smap = self.smap.get();
        common::hrw::hrw_target(bucket, objname, &smap)
            .map(|si| si.daemon_id == self.si.daemon_id)
            .unwrap_or(false)
    }

    /// Can we currently reach the primary proxy, as far as keep-alive knows?
    pub fn primary_reachable(&self) -> bool {
        let smap = self.smap.get();
        !smap.primary.is_empty() && !self.kalive.is_suspect(&smap.primary)
    }
}
