use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use axum_server::Server;
use clap::Parser;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use common::cluster::{BucketMD, DaemonInfo, Role, Smap};
use common::constants::{DEFAULT_SUSPECT_FACTOR, REST_VERSION};
use common::discovery::discover_cluster_meta;
use common::keepalive::KeepaliveTracker;
use common::owner::MetaOwner;
use common::retry::{classify_reqwest, retry_timeboxed, RetryPolicy};
use common::url_utils::{parse_socket_addr, sanitize_url, split_host_port};
use common::vote::VoteLedger;

use proxyd::keepalive::keepalive_loop;
use proxyd::persist;
use proxyd::routes::router;
use proxyd::state::{ProxyConfig, ProxyState};

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    /// Working directory (persisted cluster meta)
    #[arg(long, default_value = "./proxy-data")]
    workdir: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Stable daemon identity; must be unique in the cluster
    #[arg(long, default_value = "proxy-1")]
    daemon_id: String,

    /// Address peers reach this daemon at (ip of the listen socket)
    #[arg(long, default_value = "127.0.0.1")]
    node_ip: String,

    /// Bootstrap as the primary of a fresh cluster
    #[arg(long, default_value_t = false)]
    primary: bool,

    /// URL of any live daemon, used as a discovery seed when joining
    #[arg(long)]
    join: Option<String>,

    #[arg(long, default_value_t = 3)]
    keepalive_interval_secs: u64,

    #[arg(long, default_value_t = DEFAULT_SUSPECT_FACTOR)]
    suspect_factor: u32,

    #[arg(long, default_value_t = 10)]
    discovery_timeout_secs: u64,
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

    let config = ProxyConfig {
        workdir: args.workdir.clone(),
        keepalive_interval: Duration::from_secs(args.keepalive_interval_secs),
        suspect_factor: args.suspect_factor,
        vote_timeout: Duration::from_secs(args.keepalive_interval_secs * args.suspect_factor as u64),
        discovery_timeout: Duration::from_secs(args.discovery_timeout_secs),
        discovery_retry: Duration::from_secs(1),
        retry: RetryPolicy::default(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = ProxyState {
        si: Arc::new(DaemonInfo::new(
            args.daemon_id.clone(),
            Role::Proxy,
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
        shutdown_tx: Arc::new(shutdown_tx),
        config: Arc::new(config),
    };

    if args.primary {
        let smap = state.smap.publish(|m| {
            m.add_proxy((*state.si).clone());
            m.primary = state.si.daemon_id.clone();
        });
        info!(version = smap.version, "bootstrapped as primary");
    } else {
        join_cluster(&state, args.join.as_deref()).await?;
    }
    persist::save_spawn(&state);

    let kalive_handle = tokio::spawn(keepalive_loop(state.clone(), shutdown_rx.clone()));

    let app = router(state.clone());
    let server = Server::bind(socket_addr).serve(app.into_make_service());
    info!(daemon_id = %state.si.daemon_id, "proxy listening on {}", args.listen);

    let mut shutdown_rx = shutdown_rx;
    tokio::select! {
        res = server => { res?; }
        _ = tokio::signal::ctrl_c() => {}
        _ = shutdown_rx.changed() => {}
    }

    let _ = state.shutdown_tx.send(true);
    let _ = kalive_handle.await;
    if let Err(e) = persist::save(&state).await {
        warn!("final cluster meta save: {e:#}");
    }

    Ok(())
}

/// Discover the current cluster meta from persisted hints and/or the seed
/// URL, then register with the primary.
async fn join_cluster(state: &ProxyState, seed: Option<&str>) -> anyhow::Result<()> {
    let mut hints: Vec<DaemonInfo> = Vec::new();
    if let Some((smap, bmd)) = persist::load(&state.config.workdir).await {
        hints.extend(
            smap.all_daemons()
                .filter(|d| d.daemon_id != state.si.daemon_id)
                .cloned(),
        );
        // stale but better than nothing: discovery will fetch newer copies
        let _ = state.smap.put(smap);
        let _ = state.bmd.put(bmd);
    }
    if let Some(seed) = seed {
        let seed = sanitize_url(seed)?;
        let (host, port) = split_host_port(&seed)?;
        hints.push(DaemonInfo::new("seed", Role::Proxy, &host, &port));
    }
    if hints.is_empty() {
        bail!("cannot join: no persisted cluster meta and no --join seed");
    }

    let deadline = Instant::now() + state.config.discovery_timeout;
    let (smap, bmd) = discover_cluster_meta(
        &state.http_client,
        &hints,
        deadline,
        state.config.discovery_retry,
    )
    .await;
    if let Some(bmd) = bmd {
        let _ = state.bmd.put(bmd);
    }
    let Some(smap) = smap else {
        bail!("cluster meta discovery failed: no usable Smap from {} hints", hints.len());
    };
    let primary_url = smap
        .primary_info()
        .map(|p| p.direct_url.clone())
        .ok_or_else(|| anyhow::anyhow!("discovered Smap has no reachable primary"))?;
    let _ = state.smap.put(smap);

    // register so the primary adds us to the proxy map
    let url = format!("{primary_url}/{REST_VERSION}/cluster/register");
    let smap: Smap = retry_timeboxed(
        &state.config.retry,
        || async {
            let resp = state
                .http_client
                .post(&url)
                .json(&*state.si)
                .timeout(state.config.retry.per_attempt_timeout)
                .send()
                .await?;
            resp.error_for_status()?.json::<Smap>().await
        },
        classify_reqwest,
    )
    .await?;
    let primary = smap.primary.clone();
    if let Ok(true) = state.smap.put(smap) {
        state.kalive.heard_from(&primary);
    }
    info!("joined cluster via {primary_url}");
    Ok(())
}
