//! Proxy keep-alive loop. The primary probes everyone; a non-primary
//! proxy probes the primary and enters the vote path when it stays quiet.

use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{info, warn};

use common::cluster::{DaemonInfo, SmapVoteMsg};
use common::constants::REST_VERSION;

use crate::state::ProxyState;
use crate::vote::on_primary_suspected;

pub async fn keepalive_loop(state: ProxyState, mut shutdown: watch::Receiver<bool>) {
    let interval = state.kalive.interval();
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tick.tick() => {},
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
        }

        if state.ledger.expire(state.config.vote_timeout) {
            warn!("expired a stale vote-in-progress marker");
        }

        let smap = state.smap.get();
        if smap.primary.is_empty() {
            continue;
        }

        if state.is_primary() {
            probe_all(&state, &smap).await;
        } else {
            probe_primary(&state, &smap).await;
        }
    }
    info!("keepalive loop stopped");
}

/// The primary's view: track every member. A quiet peer is logged; its
/// membership only changes through an explicit unregister.
async fn probe_all(state: &ProxyState, smap: &common::cluster::Smap) {
    let peers: Vec<&DaemonInfo> = smap
        .all_daemons()
        .filter(|d| d.daemon_id != state.si.daemon_id)
        .collect();
    let live_ids: Vec<&str> = peers.iter().map(|d| d.daemon_id.as_str()).collect();
    state.kalive.retain(&live_ids);

    let answers = join_all(peers.iter().map(|d| probe_peer(state, d))).await;
    for (peer, alive) in peers.iter().zip(answers) {
        state.kalive.note(&peer.daemon_id);
        if alive {
            state.kalive.heard_from(&peer.daemon_id);
        } else if state.kalive.is_suspect(&peer.daemon_id) {
            warn!(peer = %peer.daemon_id, "peer suspect (no keepalive)");
        }
    }
}

async fn probe_primary(state: &ProxyState, smap: &common::cluster::Smap) {
    let Some(primary) = smap.primary_info() else {
        return;
    };
    let primary_id = primary.daemon_id.clone();
    state.kalive.note(&primary_id);

    let url = format!("{}/{}/daemon?what=smapvote", primary.direct_url, REST_VERSION);
    let resp = state
        .http_client
        .get(&url)
        .timeout(Duration::from_secs(2))
        .send()
        .await;
    match resp {
        Ok(resp) if resp.status().is_success() => {
            state.kalive.heard_from(&primary_id);
            if let Ok(msg) = resp.json::<SmapVoteMsg>().await {
                apply_piggybacked(state, msg);
            }
        }
        _ => {
            if state.kalive.is_suspect(&primary_id) {
                on_primary_suspected(state).await;
            }
        }
    }
}

fn apply_piggybacked(state: &ProxyState, msg: SmapVoteMsg) {
    if msg.vote_in_progress {
        return;
    }
    if let Some(smap) = msg.smap {
        if let Ok(true) = state.smap.put(smap) {
            state.ledger.clear();
            crate::persist::save_spawn(state);
        }
    }
    if let Some(bmd) = msg.bucketmd {
        if let Ok(true) = state.bmd.put(bmd) {
            crate::persist::save_spawn(state);
        }
    }
}

async fn probe_peer(state: &ProxyState, peer: &DaemonInfo) -> bool {
    crate::vote::probe(state, peer).await
}
