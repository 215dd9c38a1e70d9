//! Primary-side fan-out of replicated metadata and cluster actions. Every
//! recipient applies through the same versioned `put`, so a slow or
//! restarting daemon converges on the next successful round.

use futures_util::future::join_all;
use serde::Serialize;
use tracing::warn;

use common::cluster::{BucketMD, DaemonInfo, Smap};
use common::constants::REST_VERSION;
use common::msgs::ActionMsg;
use common::retry::{classify_reqwest, retry_timeboxed};

use crate::state::ProxyState;

async fn put_json<T: Serialize>(
    state: &ProxyState,
    peer: &DaemonInfo,
    path: &str,
    body: &T,
) -> Result<(), reqwest::Error> {
    retry_timeboxed(
        &state.config.retry,
        || async {
            let url = format!("{}/{}/{}", peer.direct_url, REST_VERSION, path);
            let resp = state
                .http_client
                .put(&url)
                .json(body)
                .timeout(state.config.retry.per_attempt_timeout)
                .send()
                .await?;
            resp.error_for_status()?;
            Ok(())
        },
        classify_reqwest,
    )
    .await
}

async fn broadcast_put<T: Serialize>(state: &ProxyState, smap: &Smap, path: &str, body: &T) {
    let peers: Vec<&DaemonInfo> = smap
        .all_daemons()
        .filter(|d| d.daemon_id != state.si.daemon_id)
        .collect();
    let results = join_all(peers.iter().map(|p| put_json(state, p, path, body))).await;
    for (peer, res) in peers.iter().zip(results) {
        match res {
            Ok(()) => state.kalive.heard_from(&peer.daemon_id),
            Err(e) => warn!(peer = %peer.daemon_id, "broadcast {path}: {e}"),
        }
    }
}

/// Push a freshly committed Smap to every daemon in it.
pub async fn sync_smap(state: &ProxyState, smap: &Smap) {
    broadcast_put(state, smap, "daemon/smap", smap).await;
}

pub async fn sync_bmd(state: &ProxyState, bmd: &BucketMD) {
    let smap = state.smap.get();
    broadcast_put(state, &smap, "daemon/bucketmd", bmd).await;
}

/// Fan a daemon action (shutdown, rebalance, setconfig) across the
/// cluster; `targets_only` restricts it to the storage side.
pub async fn broadcast_action(state: &ProxyState, msg: &ActionMsg, targets_only: bool) {
    let smap = state.smap.get();
    let peers: Vec<&DaemonInfo> = if targets_only {
        smap.tmap.values().collect()
    } else {
        smap.all_daemons()
            .filter(|d| d.daemon_id != state.si.daemon_id)
            .collect()
    };
    let results = join_all(peers.iter().map(|p| put_json(state, p, "daemon", msg))).await;
    for (peer, res) in peers.iter().zip(results) {
        if let Err(e) = res {
            warn!(peer = %peer.daemon_id, "action broadcast: {e}");
        }
    }
}

/// POST a bucket action to every target and report the worst outcome.
/// Targets each process their own HRW slice, so the fan-out is the whole
/// batch; with `wait` set the targets only answer once done.
pub async fn broadcast_bucket_action(
    state: &ProxyState,
    bucket: &str,
    msg: &ActionMsg,
) -> Result<(), (reqwest::StatusCode, String)> {
    let smap = state.smap.get();
    let targets: Vec<&DaemonInfo> = smap.tmap.values().collect();
    let results = join_all(targets.iter().map(|t| async {
        let url = format!("{}/{}/buckets/{}", t.direct_url, REST_VERSION, bucket);
        let resp = state.http_client.post(&url).json(msg).send().await;
        match resp {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err((status, body))
            }
            Err(e) => Err((
                reqwest::StatusCode::BAD_GATEWAY,
                format!("target unreachable: {e}"),
            )),
        }
    }))
    .await;

    let mut worst: Option<(reqwest::StatusCode, String)> = None;
    for (target, res) in targets.iter().zip(results) {
        if let Err((status, body)) = res {
            warn!(target = %target.daemon_id, %status, "bucket action failed: {body}");
            worst = Some((status, body));
        }
    }
    match worst {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
