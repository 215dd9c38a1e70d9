use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum_server::Server;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::info;

use common::cluster::{BucketMD, DaemonInfo, Role, Smap};
use common::constants::{DEFAULT_SUSPECT_FACTOR, PREFETCH_CHAN_SIZE};
use common::keepalive::KeepaliveTracker;
use common::owner::MetaOwner;
use common::retry::RetryPolicy;
use common::url_utils::parse_socket_addr;
use common::vote::VoteLedger;

use targetd::cloud::{CloudBackend, MemCloud, OfflineCloud};
use targetd::keepalive::{keepalive_loop, register_with_primary};
use targetd::listrange::prefetch_worker;
use targetd::routes::router;
use targetd::state::{TargetConfig, TargetState};
use targetd::stats::{stats_logger_loop, StatsCounters};
use targetd::store::FsStore;
use targetd::xaction::XactionRegistry;

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    /// Data root for the local object store
    #[arg(long, default_value = "./data")]
    data: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8081")]
    listen: String,

    /// Stable daemon identity; must be unique in the cluster
    #[arg(long, default_value = "target-1")]
    daemon_id: String,

    /// Address peers reach this daemon at (ip of the listen socket)
    #[arg(long, default_value = "127.0.0.1")]
    node_ip: String,

    /// URL of any proxy, used to join the cluster
    #[arg(long)]
    proxy_url: String,

    /// Cloud backend: "mem" (in-memory emulation) or "none"
    #[arg(long, default_value = "none")]
    cloud: String,

    #[arg(long, default_value_t = 3)]
    keepalive_interval_secs: u64,

    #[arg(long, default_value_t = DEFAULT_SUSPECT_FACTOR)]
    suspect_factor: u32,

    /// Re-validate cached versioned cloud objects on prefetch
    #[arg(long, default_value_t = true)]
    validate_warm_get: bool,

    #[arg(long, default_value_t = 60)]
    stats_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let socket_addr = parse_socket_addr(&args.listen)?;

    let store = FsStore::new(&args.data);
    store.init_dirs().await?;

    let cloud: Arc<dyn CloudBackend> = match args.cloud.as_str() {
        "mem" => Arc::new(MemCloud::new(1000)),
        _ => Arc::new(OfflineCloud),
    };

    let config = TargetConfig {
        proxy_url: args.proxy_url.clone(),
        keepalive_interval: Duration::from_secs(args.keepalive_interval_secs),
        suspect_factor: args.suspect_factor,
        retry: RetryPolicy::default(),
        validate_warm_get: args.validate_warm_get,
    };

    let boot = Instant::now();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (prefetch_tx, prefetch_rx) = mpsc::channel(PREFETCH_CHAN_SIZE);

    let state = TargetState {
        si: Arc::new(DaemonInfo::new(
            args.daemon_id.clone(),
            Role::Target,
            &args.node_ip,
            &socket_addr.port().to_string(),
        )),
        smap: Arc::new(MetaOwner::new(Smap::default())),
        bmd: Arc::new(MetaOwner::new(BucketMD::default())),
        ledger: Arc::new(VoteLedger::new()),
        kalive: Arc::new(KeepaliveTracker::new(
            config.keepalive_interval,
            config.suspect_factor,
        )),
        http_client: reqwest::Client::new(),
        store: Arc::new(store),
        cloud,
        stats: Arc::new(StatsCounters::default()),
        xactions: Arc::new(XactionRegistry::new(boot)),
        prefetch_tx,
        shutdown_tx: Arc::new(shutdown_tx),
        config: Arc::new(config),
        boot,
    };

    register_with_primary(&state, &args.proxy_url).await?;

    let kalive_handle = tokio::spawn(keepalive_loop(state.clone(), shutdown_rx.clone()));
    let prefetch_handle = tokio::spawn(prefetch_worker(
        state.clone(),
        prefetch_rx,
        shutdown_rx.clone(),
    ));
    let stats_handle = tokio::spawn(stats_logger_loop(
        Arc::clone(&state.stats),
        Duration::from_secs(args.stats_interval_secs),
        shutdown_rx.clone(),
    ));

    let app = router(state.clone());
    let server = Server::bind(socket_addr).serve(app.into_make_service());

    info!(daemon_id = %state.si.daemon_id, "target listening on {}", args.listen);

    let mut shutdown_rx = shutdown_rx;
    tokio::select! {
        res = server => { res?; }
        _ = tokio::signal::ctrl_c() => {}
        _ = shutdown_rx.changed() => {}
    }

    state.xactions.abort_all();
    let _ = state.shutdown_tx.send(true);
    let _ = kalive_handle.await;
    let _ = prefetch_handle.await;
    let _ = stats_handle.await;

    Ok(())
}
