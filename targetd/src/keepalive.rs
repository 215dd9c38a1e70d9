//! Target-side cluster plumbing: registration with the primary proxy and
//! the low-rate probe loop that keeps the local Smap/BMD converged. A
//! target never elects; when the primary goes quiet it falls back to
//! discovery across the surviving proxies and waits for the new map.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use common::cluster::{Smap, SmapVoteMsg};
use common::constants::REST_VERSION;
use common::discovery::discover_cluster_meta;
use common::retry::{classify_reqwest, retry_timeboxed};

use crate::state::TargetState;

pub async fn register_with_primary(state: &TargetState, proxy_url: &str) -> anyhow::Result<()> {
    let url = format!("{proxy_url}/{REST_VERSION}/cluster/register");
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
    match state.smap.put(smap) {
        Ok(_) => state.kalive.heard_from(&primary),
        Err(e) => warn!("register returned an unusable map: {e}"),
    }
    info!(daemon_id = %state.si.daemon_id, "registered with primary at {proxy_url}");
    Ok(())
}

pub async fn keepalive_loop(state: TargetState, mut shutdown: watch::Receiver<bool>) {
    let interval = state.kalive.interval();
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tick.tick() => {},
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
        }

        // a vote that never resolved must not wedge discovery answers
        if state
            .ledger
            .expire(interval * state.config.suspect_factor)
        {
            warn!("expired a stale vote-in-progress marker");
        }

        let smap = state.smap.get();
        let Some(primary) = smap.primary_info() else {
            continue;
        };
        let primary_id = primary.daemon_id.clone();
        state.kalive.note(&primary_id);

        let url = format!("{}/{}/daemon?what=smapvote", primary.direct_url, REST_VERSION);
        let probe = state
            .http_client
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await;
        match probe {
            Ok(resp) if resp.status().is_success() => {
                state.kalive.heard_from(&primary_id);
                if let Ok(msg) = resp.json::<SmapVoteMsg>().await {
                    apply_discovered(&state, msg);
                }
            }
            _ => {
                if state.kalive.is_suspect(&primary_id) {
                    warn!(primary = %primary_id, "primary proxy suspect, probing the proxy set");
                    let proxies: Vec<_> = smap.pmap.values().cloned().collect();
                    let (dsmap, dbmd) = discover_cluster_meta(
                        &state.http_client,
                        &proxies,
                        Instant::now() + interval,
                        interval / 2,
                    )
                    .await;
                    apply_discovered(
                        &state,
                        SmapVoteMsg {
                            vote_in_progress: false,
                            smap: dsmap,
                            bucketmd: dbmd,
                        },
                    );
                }
            }
        }
    }
    info!("keepalive loop stopped");
}

fn apply_discovered(state: &TargetState, msg: SmapVoteMsg) {
    if msg.vote_in_progress {
        return;
    }
    if let Some(smap) = msg.smap {
        let primary = smap.primary.clone();
        if let Ok(true) = state.smap.put(smap) {
            info!(primary = %primary, "applied newer cluster map");
            state.ledger.clear();
            state.kalive.heard_from(&primary);
        }
    }
    if let Some(bmd) = msg.bucketmd {
        if let Ok(true) = state.bmd.put(bmd) {
            info!("applied newer bucket metadata");
        }
    }
}
