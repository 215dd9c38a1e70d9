//! One proxy + one target, wired over real HTTP: redirects carry the data
//! path to the owner, bucket actions fan out, and batch deletes honor the
//! wait flag end to end.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum_server::Server;
use reqwest::{Client, StatusCode};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use common::cluster::{BucketMD, DaemonInfo, Role, Smap};
use common::constants::PREFETCH_CHAN_SIZE;
use common::keepalive::KeepaliveTracker;
use common::msgs::{ActionMsg, BatchSpec, ListMsg};
use common::owner::MetaOwner;
use common::retry::RetryPolicy;
use common::vote::VoteLedger;

use targetd::cloud::MemCloud;
use targetd::state::{TargetConfig, TargetState};
use targetd::stats::StatsCounters;
use targetd::store::FsStore;
use targetd::xaction::XactionRegistry;

mod harness;
use harness::{wait_until, TestProxy};

struct TestTarget {
    state: TargetState,
    url: String,
    _data_dir: TempDir,
    server_handle: JoinHandle<anyhow::Result<()>>,
    worker_handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

async fn spawn_target(daemon_id: &str, proxy_url: &str) -> anyhow::Result<TestTarget> {
    let data_dir = TempDir::new()?;
    let store = FsStore::new(data_dir.path());
    store.init_dirs().await?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let url = format!("http://{addr}");

    let config = TargetConfig {
        proxy_url: proxy_url.to_string(),
        keepalive_interval: Duration::from_millis(200),
        suspect_factor: 3,
        retry: RetryPolicy {
            total_budget: Duration::from_millis(500),
            per_attempt_timeout: Duration::from_millis(250),
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
        si: Arc::new(DaemonInfo::new(
            daemon_id,
            Role::Target,
            "127.0.0.1",
            &addr.port().to_string(),
        )),
        smap: Arc::new(MetaOwner::new(Smap::default())),
        bmd: Arc::new(MetaOwner::new(BucketMD::default())),
        ledger: Arc::new(VoteLedger::new()),
        kalive: Arc::new(KeepaliveTracker::new(
            config.keepalive_interval,
            config.suspect_factor,
        )),
        http_client: Client::new(),
        store: Arc::new(store),
        cloud: Arc::new(MemCloud::new(1000)),
        stats: Arc::new(StatsCounters::default()),
        xactions: Arc::new(XactionRegistry::new(boot)),
        prefetch_tx,
        shutdown_tx: Arc::new(shutdown_tx.clone()),
        config: Arc::new(config),
        boot,
    };

    let worker_handle = tokio::spawn(targetd::listrange::prefetch_worker(
        state.clone(),
        prefetch_rx,
        shutdown_rx,
    ));
    let app = targetd::routes::router(state.clone());
    let server_handle = tokio::spawn(async move {
        Server::from_tcp(listener.into_std()?)
            .serve(app.into_make_service())
            .await
            .map_err(anyhow::Error::from)
    });

    targetd::keepalive::register_with_primary(&state, proxy_url).await?;

    Ok(TestTarget {
        state,
        url,
        _data_dir: data_dir,
        server_handle,
        worker_handle,
        shutdown_tx,
    })
}

impl TestTarget {
    async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.server_handle.abort();
        let _ = self.server_handle.await;
        let _ = self.worker_handle.await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_data_path_through_proxy() -> anyhow::Result<()> {
    let p1 = TestProxy::primary("p1").await?;
    let t1 = spawn_target("t1", &p1.url).await?;

    // a redirect-following client sees one logical endpoint
    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()?;

    assert!(p1.state.smap.get().tmap.contains_key("t1"));
    assert_eq!(t1.state.smap.get().primary, "p1");

    // create a cache-only bucket through the proxy
    let bucket_url = format!("{}/v1/buckets/scratch", p1.url);
    let resp = client.post(&bucket_url).json(&ActionMsg::Createlb).send().await?;
    assert_eq!(resp.status(), StatusCode::OK);

    // the bucket metadata reaches the target
    let t1_ref = &t1;
    wait_until(3000, || async { Ok(t1_ref.state.bmd.get().is_local("scratch")) }).await?;

    // PUT through the proxy: 307 at the proxy, replayed at the owner
    let obj_url = format!("{}/v1/objects/scratch/reel/a.bin", p1.url);
    let resp = client.put(&obj_url).body(b"frames".to_vec()).send().await?;
    assert_eq!(resp.status(), StatusCode::CREATED);

    // GET through the proxy: 301 at the proxy, served by the owner
    let resp = client.get(&obj_url).send().await?;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.bytes().await?.to_vec(), b"frames");

    // the object physically lives on the target
    assert!(t1
        .state
        .store
        .lookup_locally("scratch", "reel/a.bin", true)
        .await?
        .is_some());

    // batch delete through the proxy with wait semantics
    let msg = ActionMsg::Delete(BatchSpec::List(ListMsg {
        objnames: vec!["reel/a.bin".to_string()],
        deadline_ms: 0,
        wait: true,
    }));
    let resp = client.post(&bucket_url).json(&msg).send().await?;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(t1
        .state
        .store
        .lookup_locally("scratch", "reel/a.bin", true)
        .await?
        .is_none());

    // merged bucket listing through the proxy
    let resp = client.put(&obj_url).body(b"frames".to_vec()).send().await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let list: common::msgs::BucketList = client.get(&bucket_url).send().await?.json().await?;
    assert_eq!(
        list.entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
        vec!["reel/a.bin"]
    );

    t1.shutdown().await?;
    p1.shutdown().await
}
