//! Highest-Random-Weight placement. Placement depends only on daemon ids
//! and the object key, never on addresses, so it survives IP/port churn.

use crate::cluster::{DaemonInfo, Smap};

fn score(daemon_id: &str, key: &str) -> u64 {
    let mut h = blake3::Hasher::new();
    h.update(daemon_id.as_bytes());
    h.update(key.as_bytes());
    let digest = h.finalize();
    let mut top = [0u8; 8];
    top.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(top)
}

fn argmax<'a>(candidates: impl Iterator<Item = &'a DaemonInfo>, key: &str) -> Option<&'a DaemonInfo> {
    // Ties go to the lexicographically smallest daemon_id.
    candidates.max_by(|a, b| {
        score(&a.daemon_id, key)
            .cmp(&score(&b.daemon_id, key))
            .then_with(|| b.daemon_id.cmp(&a.daemon_id))
    })
}

/// Map an object onto the one target that owns it. `None` iff the target
/// map is empty.
pub fn hrw_target<'a>(bucket: &str, objname: &str, smap: &'a Smap) -> Option<&'a DaemonInfo> {
    let key = format!("{bucket}/{objname}");
    argmax(smap.tmap.values(), &key)
}

/// Pick the election candidate among the proxies, excluding the failed
/// primary. Scored on daemon ids alone so every survivor computes the
/// same winner regardless of map version. `None` iff no other proxy exists.
pub fn hrw_proxy<'a>(smap: &'a Smap, exclude_id: &str) -> Option<&'a DaemonInfo> {
    argmax(smap.pmap.values().filter(|p| p.daemon_id != exclude_id), "")
}
