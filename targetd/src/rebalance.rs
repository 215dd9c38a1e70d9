//! Global rebalance: after a membership change, walk everything cached on
//! this target and hand over objects whose HRW owner moved elsewhere.

use tracing::{info, warn};

use common::hrw::hrw_target;
use common::msgs::GetMsg;

use crate::state::TargetState;
use crate::xaction::XactKind;

pub async fn run_rebalance(state: TargetState) {
    let Some(xact) = state.xactions.renew(XactKind::Rebalance) else {
        info!("rebalance already running, nothing to do");
        return;
    };
    let smap = state.smap.get();

    'walk: for is_local in [true, false] {
        let buckets = match state.store.list_buckets(is_local).await {
            Ok(b) => b,
            Err(e) => {
                warn!("rebalance bucket walk: {e:#}");
                state.stats.add("numerr", 1);
                break;
            }
        };
        for bucket in buckets {
            let list = match state.store.list_bucket(&bucket, is_local, &GetMsg::default()).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(bucket, "rebalance listing: {e:#}");
                    state.stats.add("numerr", 1);
                    continue;
                }
            };
            for entry in list.entries {
                if xact.aborted() {
                    break 'walk;
                }
                let Some(owner) = hrw_target(&bucket, &entry.name, &smap) else {
                    break 'walk;
                };
                if owner.daemon_id == state.si.daemon_id {
                    continue;
                }
                if let Err(e) = send_object(&state, &bucket, &entry.name, is_local, owner).await {
                    warn!(bucket, objname = %entry.name, to = %owner.daemon_id, "rebalance move: {e:#}");
                    state.stats.add("numerr", 1);
                }
            }
        }
    }

    xact.finish();
    info!("{xact}");
    state.xactions.del(xact.id);
}

async fn send_object(
    state: &TargetState,
    bucket: &str,
    objname: &str,
    is_local: bool,
    owner: &common::cluster::DaemonInfo,
) -> anyhow::Result<()> {
    let _guard = state.store.lock_object(bucket, objname).await;
    let fqn = state.store.fqn(bucket, objname, is_local);
    let data = tokio::fs::read(&fqn).await?;
    let url = format!(
        "{}/v1/objects/{}/{}?from_id={}&to_id={}",
        owner.direct_url, bucket, objname, state.si.daemon_id, owner.daemon_id
    );
    let resp = state.http_client.put(&url).body(data).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("owner replied {}", resp.status());
    }
    state.store.fildelete(bucket, objname, is_local).await?;
    Ok(())
}
