#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum_server::Server;
use reqwest::Client;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use common::cluster::{BucketMD, BucketProps, DaemonInfo, Role, Smap};
use common::constants::PREFETCH_CHAN_SIZE;
use common::keepalive::KeepaliveTracker;
use common::msgs::ActionMsg;
use common::owner::MetaOwner;
use common::retry::RetryPolicy;
use common::vote::VoteLedger;

use targetd::cloud::MemCloud;
use targetd::listrange::prefetch_worker;
use targetd::routes::router;
use targetd::state::{TargetConfig, TargetState};
use targetd::stats::StatsCounters;
use targetd::store::FsStore;
use targetd::xaction::XactionRegistry;

pub const LOCAL_BUCKET: &str = "lb";
pub const CLOUD_BUCKET: &str = "cb";
pub const MAIN_TARGET: &str = "t-main";
pub const OTHER_TARGET: &str = "t-other";

pub struct TestTarget {
    pub state: TargetState,
    pub cloud: Arc<MemCloud>,
    pub url: String,
    pub data_dir: TempDir,
    server_handle: JoinHandle<Result<()>>,
    worker_handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl TestTarget {
    pub async fn new() -> Result<Self> {
        Self::with_config(1000, false).await
    }

    /// `cloud_page_size` drives the MemCloud paging; `second_target` adds a
    /// non-running peer target to the Smap for redirect scenarios.
    pub async fn with_config(cloud_page_size: usize, second_target: bool) -> Result<Self> {
        let data_dir = TempDir::new()?;
        let store = FsStore::new(data_dir.path());
        store.init_dirs().await?;

        let cloud = Arc::new(MemCloud::new(cloud_page_size));
        cloud.create_bucket(CLOUD_BUCKET);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let url = format!("http://{addr}");

        let si = DaemonInfo::new(
            MAIN_TARGET,
            Role::Target,
            "127.0.0.1",
            &addr.port().to_string(),
        );

        let mut smap = Smap::default();
        smap.version = 1;
        smap.add_target(si.clone());
        if second_target {
            smap.add_target(DaemonInfo::new(OTHER_TARGET, Role::Target, "127.0.0.1", "1"));
        }
        smap.add_proxy(DaemonInfo::new("p1", Role::Proxy, "127.0.0.1", "1"));
        smap.primary = "p1".to_string();

        let mut bmd = BucketMD::default();
        bmd.version = 1;
        bmd.local_buckets
            .insert(LOCAL_BUCKET.to_string(), BucketProps::default());
        bmd.cloud_policies.insert(
            CLOUD_BUCKET.to_string(),
            BucketProps {
                cloud_provider: "mem".to_string(),
                versioning: true,
                ..Default::default()
            },
        );

        let config = TargetConfig {
            proxy_url: "http://127.0.0.1:1".to_string(),
            keepalive_interval: Duration::from_millis(200),
            suspect_factor: 3,
            retry: RetryPolicy {
                total_budget: Duration::from_millis(300),
                per_attempt_timeout: Duration::from_millis(200),
                backoff_base: Duration::from_millis(50),
                backoff_max: Duration::from_millis(100),
                jitter_frac: 0.2,
            },
            validate_warm_get: true,
        };

        let boot = Instant::now();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (prefetch_tx, prefetch_rx) = mpsc::channel(PREFETCH_CHAN_SIZE);

        let state = TargetState {
            si: Arc::new(si),
            smap: Arc::new(MetaOwner::new(smap)),
            bmd: Arc::new(MetaOwner::new(bmd)),
            ledger: Arc::new(VoteLedger::new()),
            kalive: Arc::new(KeepaliveTracker::new(
                config.keepalive_interval,
                config.suspect_factor,
            )),
            http_client: Client::new(),
            store: Arc::new(store),
            cloud: cloud.clone(),
            stats: Arc::new(StatsCounters::default()),
            xactions: Arc::new(XactionRegistry::new(boot)),
            prefetch_tx,
            shutdown_tx: Arc::new(shutdown_tx.clone()),
            config: Arc::new(config),
            boot,
        };

        let worker_handle = tokio::spawn(prefetch_worker(
            state.clone(),
            prefetch_rx,
            shutdown_rx.clone(),
        ));

        let app = router(state.clone());
        let server_handle = tokio::spawn(async move {
            Server::from_tcp(listener.into_std()?)
                .serve(app.into_make_service())
                .await
                .map_err(anyhow::Error::from)
        });

        Ok(TestTarget {
            state,
            cloud,
            url,
            data_dir,
            server_handle,
            worker_handle,
            shutdown_tx,
        })
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.server_handle.abort();
        let _ = self.server_handle.await;
        let _ = self.worker_handle.await;
        Ok(())
    }

    pub async fn seed_local(&self, bucket: &str, objname: &str, data: &[u8]) -> Result<()> {
        let is_local = self.state.bmd.get().is_local(bucket);
        self.state
            .store
            .put_bytes(
                bucket,
                objname,
                is_local,
                bytes::Bytes::copy_from_slice(data),
                "1".to_string(),
            )
            .await?;
        Ok(())
    }

    pub async fn cached(&self, bucket: &str, objname: &str) -> bool {
        let is_local = self.state.bmd.get().is_local(bucket);
        self.state
            .store
            .lookup_locally(bucket, objname, is_local)
            .await
            .ok()
            .flatten()
            .is_some()
    }
}

pub async fn post_bucket_action(
    client: &Client,
    base_url: &str,
    bucket: &str,
    msg: &ActionMsg,
) -> Result<reqwest::StatusCode> {
    let url = format!("{base_url}/v1/buckets/{bucket}");
    let resp = client.post(url).json(msg).send().await?;
    Ok(resp.status())
}

/// An object name HRW-owned by `daemon_id` in `smap`.
pub fn objname_owned_by(smap: &Smap, bucket: &str, daemon_id: &str, prefix: &str) -> String {
    for i in 0..10_000 {
        let name = format!("{prefix}{i}");
        if let Some(owner) = common::hrw::hrw_target(bucket, &name, smap) {
            if owner.daemon_id == daemon_id {
                return name;
            }
        }
    }
    panic!("no object name maps to {daemon_id}");
}

pub async fn wait_until<F, Fut>(timeout_ms: u64, mut check_fn: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let start = Instant::now();
    let timeout = Duration::from_millis(timeout_ms);
    loop {
        if check_fn().await? {
            return Ok(());
        }
        if start.elapsed() > timeout {
            anyhow::bail!("wait_until timed out after {timeout_ms}ms");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
