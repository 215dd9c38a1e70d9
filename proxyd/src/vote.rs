//! Candidate side of the primary election. Every proxy runs Follower
//! logic in its keepalive loop; the one that `hrw_proxy` selects after the
//! primary goes quiet campaigns, and the rest back off and re-check.

use std::time::Duration;

use futures_util::future::join_all;
use rand::random_range;
use tracing::{info, warn};

use common::cluster::{DaemonInfo, Role, Smap};
use common::constants::REST_VERSION;
use common::hrw::hrw_proxy;
use common::vote::{VoteRequest, VoteResponse};

use crate::broadcast::sync_smap;
use crate::persist;
use crate::state::ProxyState;

pub(crate) async fn probe(state: &ProxyState, peer: &DaemonInfo) -> bool {
    let url = format!("{}/{}/daemon?what=smapvote", peer.direct_url, REST_VERSION);
    matches!(
        state
            .http_client
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await,
        Ok(resp) if resp.status().is_success()
    )
}

/// Keep-alive marked the primary suspect. Re-probe it once, then either
/// campaign (we are the HRW pick) or back off and let the pick campaign.
pub async fn on_primary_suspected(state: &ProxyState) {
    let smap = state.smap.get();
    let Some(primary) = smap.primary_info() else {
        return;
    };
    if probe(state, primary).await {
        state.kalive.heard_from(&primary.daemon_id);
        return;
    }

    let Some(candidate) = hrw_proxy(&smap, &primary.daemon_id) else {
        warn!("primary unreachable and no other proxy to elect");
        return;
    };
    if candidate.daemon_id != state.si.daemon_id {
        // Give the winner a head start plus jitter; if it fails to take
        // over, the next keepalive tick lands here again.
        let backoff = state.config.keepalive_interval.as_millis() as u64;
        tokio::time::sleep(Duration::from_millis(random_range(backoff..backoff * 2))).await;
        return;
    }

    run_election(state, &smap).await;
}

/// Campaign for primary at the given map. Wins need a strict majority of
/// the surviving proxy set; a lost or unreachable vote falls back to
/// Follower and keep-alive drives the next attempt.
pub async fn run_election(state: &ProxyState, smap: &Smap) {
    let old_primary = smap.primary.clone();
    info!(term = smap.version, "primary {old_primary} unreachable, starting election");

    state.ledger.begin();
    let req = VoteRequest {
        candidate_id: state.si.daemon_id.clone(),
        smap_version: smap.version,
    };
    // our own ballot
    state.ledger.grant(&req, smap.version, false);

    let voters: Vec<&DaemonInfo> = smap
        .all_daemons()
        .filter(|d| d.daemon_id != state.si.daemon_id && d.daemon_id != old_primary)
        .collect();
    let answers = join_all(voters.iter().map(|d| request_vote(state, d, &req))).await;

    let mut proxy_votes = 1usize; // self
    for (voter, granted) in voters.iter().zip(answers) {
        if granted == Some(true) && voter.role == Role::Proxy {
            proxy_votes += 1;
        }
    }
    // the unreachable primary is not part of the electorate
    let electorate = smap
        .pmap
        .keys()
        .filter(|id| **id != old_primary)
        .count();

    if proxy_votes * 2 <= electorate {
        info!(
            proxy_votes,
            electorate, "election lost, reverting to follower"
        );
        state.ledger.clear();
        return;
    }

    let new_smap = state.smap.publish(|m| {
        m.pmap.remove(&old_primary);
        m.primary = state.si.daemon_id.clone();
    });
    state.ledger.clear();
    info!(
        version = new_smap.version,
        proxy_votes, electorate, "election won, assuming primary"
    );
    sync_smap(state, &new_smap).await;
    persist::save_spawn(state);
}

async fn request_vote(state: &ProxyState, peer: &DaemonInfo, req: &VoteRequest) -> Option<bool> {
    let url = format!("{}/{}/daemon/vote", peer.direct_url, REST_VERSION);
    let resp = state
        .http_client
        .post(&url)
        .json(req)
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    resp.json::<VoteResponse>().await.ok().map(|v| v.granted)
}
