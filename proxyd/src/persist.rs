//! Last-known cluster meta, persisted so a restarting proxy has a hint set
//! for discovery instead of depending on a seed URL being alive.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use common::cluster::{BucketMD, Smap};

use crate::state::ProxyState;

const META_FILE: &str = "cluster_meta.json";

#[derive(Serialize, Deserialize)]
struct PersistedMeta {
    smap: Smap,
    bucketmd: BucketMD,
}

pub async fn save(state: &ProxyState) -> anyhow::Result<()> {
    let meta = PersistedMeta {
        smap: (*state.smap.get()).clone(),
        bucketmd: (*state.bmd.get()).clone(),
    };
    let path = state.config.workdir.join(META_FILE);
    let tmp = path.with_extension("json.part");
    fs::create_dir_all(&state.config.workdir).await?;
    fs::write(&tmp, serde_json::to_vec_pretty(&meta)?).await?;
    fs::rename(&tmp, &path).await?;
    Ok(())
}

/// Fire-and-forget save; the maps are authoritative in memory and a failed
/// write only degrades the next boot's hint set.
pub fn save_spawn(state: &ProxyState) {
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = save(&state).await {
            warn!("persisting cluster meta: {e:#}");
        }
    });
}

pub async fn load(workdir: &Path) -> Option<(Smap, BucketMD)> {
    let bytes = fs::read(workdir.join(META_FILE)).await.ok()?;
    match serde_json::from_slice::<PersistedMeta>(&bytes) {
        Ok(meta) => Some((meta.smap, meta.bucketmd)),
        Err(e) => {
            warn!("ignoring unreadable cluster meta: {e}");
            None
        }
    }
}
