//! Cluster-meta discovery: the quorum read a (re)joining daemon performs
//! against a hint set of peers to learn the current Smap and BucketMD
//! without trusting any single one of them.

use std::collections::HashSet;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::cluster::{BucketMD, DaemonInfo, Smap, SmapVoteMsg};
use crate::constants::REST_VERSION;

async fn query_peer(client: &reqwest::Client, peer: &DaemonInfo) -> Option<SmapVoteMsg> {
    let url = format!(
        "{}/{}/daemon?what=smapvote",
        peer.direct_url, REST_VERSION
    );
    let resp = client
        .get(&url)
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    resp.json::<SmapVoteMsg>().await.ok()
}

/// Query every hinted peer until `deadline`, retrying failures and
/// vote-in-progress answers on `retry_interval`, and return the
/// maximum-version Smap and BucketMD seen — independently of each other.
/// A component is `None` iff no peer ever produced a non-voting response
/// with a non-zero version for it. At least one full round always runs,
/// deadline notwithstanding.
pub async fn discover_cluster_meta(
    client: &reqwest::Client,
    hints: &[DaemonInfo],
    deadline: Instant,
    retry_interval: Duration,
) -> (Option<Smap>, Option<BucketMD>) {
    let mut best_smap: Option<Smap> = None;
    let mut best_bmd: Option<BucketMD> = None;
    // Peers that have produced a usable (non-voting) answer; no reason to
    // ask them again.
    let mut resolved: HashSet<String> = HashSet::new();

    loop {
        let pending: Vec<&DaemonInfo> = hints
            .iter()
            .filter(|p| !resolved.contains(&p.daemon_id))
            .collect();
        if pending.is_empty() {
            break;
        }

        let answers = join_all(pending.iter().map(|p| query_peer(client, p))).await;
        for (peer, answer) in pending.iter().zip(answers) {
            let Some(msg) = answer else { continue };
            if msg.vote_in_progress {
                debug!(peer = %peer.daemon_id, "vote in progress, ignoring maps");
                continue;
            }
            resolved.insert(peer.daemon_id.clone());
            if let Some(smap) = msg.smap {
                if smap.version > 0
                    && best_smap.as_ref().is_none_or(|b| smap.version > b.version)
                {
                    best_smap = Some(smap);
                }
            }
            if let Some(bmd) = msg.bucketmd {
                if bmd.version > 0 && best_bmd.as_ref().is_none_or(|b| bmd.version > b.version) {
                    best_bmd = Some(bmd);
                }
            }
        }

        let next_try = Instant::now() + retry_interval;
        if next_try > deadline {
            break;
        }
        sleep_until(next_try).await;
    }

    (best_smap, best_bmd)
}
