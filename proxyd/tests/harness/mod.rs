#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use axum_server::Server;
use reqwest::Client;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use common::cluster::{BucketMD, DaemonInfo, Role, Smap, SmapVoteMsg};
use common::keepalive::KeepaliveTracker;
use common::owner::MetaOwner;
use common::retry::RetryPolicy;
use common::vote::VoteLedger;

use proxyd::keepalive::keepalive_loop;
use proxyd::routes::router;
use proxyd::state::{ProxyConfig, ProxyState};

//
// Mock discovery peers, one per response behavior.
//

#[derive(Clone, Copy, Debug)]
pub enum MockBehavior {
    /// always answers with the configured versions
    Default,
    /// vote-in-progress on the first call only
    VoteOnce,
    /// 503 on the first two calls, then the configured versions
    FailTwice,
    AlwaysFail,
    AlwaysVote,
}

#[derive(Clone)]
struct MockState {
    behavior: MockBehavior,
    smap_version: i64,
    bmd_version: i64,
    calls: Arc<AtomicU32>,
}

async fn mock_daemon_handler(State(st): State<MockState>) -> axum::response::Response {
    let call = st.calls.fetch_add(1, Ordering::SeqCst) + 1;
    let msg = |vote| {
        let mut smap = Smap::default();
        smap.version = st.smap_version;
        let mut bmd = BucketMD::default();
        bmd.version = st.bmd_version;
        Json(SmapVoteMsg {
            vote_in_progress: vote,
            smap: Some(smap),
            bucketmd: Some(bmd),
        })
        .into_response()
    };
    match st.behavior {
        MockBehavior::Default => msg(false),
        MockBehavior::VoteOnce => msg(call == 1),
        MockBehavior::AlwaysVote => msg(true),
        MockBehavior::FailTwice if call > 2 => msg(false),
        MockBehavior::FailTwice | MockBehavior::AlwaysFail => {
            (StatusCode::SERVICE_UNAVAILABLE, "retry").into_response()
        }
    }
}

pub struct MockDaemon {
    pub info: DaemonInfo,
    handle: JoinHandle<Result<()>>,
}

impl MockDaemon {
    pub async fn spawn(
        id: &str,
        role: Role,
        smap_version: i64,
        bmd_version: i64,
        behavior: MockBehavior,
    ) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = MockState {
            behavior,
            smap_version,
            bmd_version,
            calls: Arc::new(AtomicU32::new(0)),
        };
        let app = Router::new()
            .route("/v1/daemon", get(mock_daemon_handler))
            .with_state(state);
        let handle = tokio::spawn(async move {
            Server::from_tcp(listener.into_std()?)
                .serve(app.into_make_service())
                .await
                .map_err(anyhow::Error::from)
        });
        Ok(MockDaemon {
            info: DaemonInfo::new(id, role, "127.0.0.1", &addr.port().to_string()),
            handle,
        })
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

//
// Real in-process proxies.
//

pub struct TestProxy {
    pub state: ProxyState,
    pub url: String,
    pub workdir: TempDir,
    server_handle: JoinHandle<Result<()>>,
    kalive_handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

fn fast_config(workdir: &TempDir) -> ProxyConfig {
    ProxyConfig {
        workdir: workdir.path().to_path_buf(),
        keepalive_interval: Duration::from_millis(150),
        suspect_factor: 2,
        vote_timeout: Duration::from_secs(2),
        discovery_timeout: Duration::from_secs(1),
        discovery_retry: Duration::from_millis(100),
        retry: RetryPolicy {
            total_budget: Duration::from_millis(400),
            per_attempt_timeout: Duration::from_millis(250),
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_millis(100),
            jitter_frac: 0.2,
        },
    }
}

impl TestProxy {
    /// Boot a proxy that bootstraps a fresh single-member cluster.
    pub async fn primary(daemon_id: &str) -> Result<Self> {
        let proxy = Self::spawn(daemon_id).await?;
        proxy.state.smap.publish(|m| {
            m.add_proxy((*proxy.state.si).clone());
            m.primary = proxy.state.si.daemon_id.clone();
        });
        Ok(proxy)
    }

    /// Boot a proxy and register it with a running primary.
    pub async fn join(daemon_id: &str, primary_url: &str) -> Result<Self> {
        let proxy = Self::spawn(daemon_id).await?;
        let url = format!("{primary_url}/v1/cluster/register");
        let smap: Smap = proxy
            .state
            .http_client
            .post(&url)
            .json(&*proxy.state.si)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let primary = smap.primary.clone();
        if proxy.state.smap.put(smap).unwrap_or(false) {
            proxy.state.kalive.heard_from(&primary);
        }
        Ok(proxy)
    }

    async fn spawn(daemon_id: &str) -> Result<Self> {
        let workdir = TempDir::new()?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let url = format!("http://{addr}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = ProxyState {
            si: Arc::new(DaemonInfo::new(
                daemon_id,
                Role::Proxy,
                "127.0.0.1",
                &addr.port().to_string(),
            )),
            smap: Arc::new(MetaOwner::new(Smap::default())),
            bmd: Arc::new(MetaOwner::new(BucketMD::default())),
            ledger: Arc::new(VoteLedger::new()),
            kalive: Arc::new(KeepaliveTracker::new(Duration::from_millis(150), 2)),
            http_client: Client::new(),
            shutdown_tx: Arc::new(shutdown_tx.clone()),
            config: Arc::new(fast_config(&workdir)),
        };

        let app = router(state.clone());
        let server_handle = tokio::spawn(async move {
            Server::from_tcp(listener.into_std()?)
                .serve(app.into_make_service())
                .await
                .map_err(anyhow::Error::from)
        });

        Ok(TestProxy {
            state,
            url,
            workdir,
            server_handle,
            kalive_handle: None,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn start_keepalive(&mut self) {
        let handle = tokio::spawn(keepalive_loop(
            self.state.clone(),
            self.shutdown_rx.clone(),
        ));
        self.kalive_handle = Some(handle);
    }

    /// Hard kill: the process is gone, nothing shuts down cleanly.
    pub async fn kill(self) {
        self.server_handle.abort();
        let _ = self.server_handle.await;
        if let Some(h) = self.kalive_handle {
            h.abort();
            let _ = h.await;
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.server_handle.abort();
        let _ = self.server_handle.await;
        if let Some(h) = self.kalive_handle {
            let _ = h.await;
        }
        Ok(())
    }
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
