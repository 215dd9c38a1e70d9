//! List/range batch engine: translate a ListMsg or RangeMsg into this
//! target's slice of the object set and drive delete/evict/prefetch
//! through cancellable xactions. Batches are best-effort: per-object
//! failures are counted and logged, never fatal to the batch.

use std::fmt;
use std::time::Duration;

use regex::Regex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use common::api_error::ApiError;
use common::constants::MAX_PREFETCH_PAGES;
use common::msgs::{BatchSpec, BucketList, GetMsg, ListMsg, RangeMsg};
use common::msgs::parse_range;

use crate::state::TargetState;
use crate::xaction::XactKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Delete,
    Evict,
    Prefetch,
}

impl fmt::Display for BatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatchOp::Delete => "delete",
            BatchOp::Evict => "evict",
            BatchOp::Prefetch => "prefetch",
        })
    }
}

/// One prefetch work unit on the bounded queue.
pub struct FilesWithDeadline {
    pub bucket: String,
    pub objnames: Vec<String>,
    pub deadline: Option<Instant>,
    pub done: Option<oneshot::Sender<()>>,
}

/// Handle returned to the HTTP layer for a batch that was accepted.
pub struct BatchHandle {
    /// present iff the caller asked to wait
    pub done: Option<oneshot::Receiver<()>>,
    /// the dedicated xaction, for abort-on-disconnect (delete/evict only)
    pub xact_id: Option<u64>,
}

fn abs_deadline(deadline_ms: u64) -> Option<Instant> {
    (deadline_ms != 0).then(|| Instant::now() + Duration::from_millis(deadline_ms))
}

pub async fn batch_operation(
    state: &TargetState,
    bucket: &str,
    op: BatchOp,
    spec: BatchSpec,
) -> Result<BatchHandle, ApiError> {
    if state.smap.get().tmap.is_empty() {
        return Err(ApiError::NoTargets);
    }
    match spec {
        BatchSpec::List(msg) => list_operation(state, bucket, op, msg).await,
        BatchSpec::Range(msg) => range_operation(state, bucket, op, msg).await,
    }
}

/// Explicit object list: keep only the objects this target owns (the
/// originator broadcast the same list to every target) and run the op.
pub async fn list_operation(
    state: &TargetState,
    bucket: &str,
    op: BatchOp,
    msg: ListMsg,
) -> Result<BatchHandle, ApiError> {
    let objs: Vec<String> = msg
        .objnames
        .into_iter()
        .filter(|o| state.is_owned_locally(bucket, o))
        .collect();
    dispatch(state, bucket, op, objs, msg.deadline_ms, msg.wait).await
}

/// Prefix + regex + numeric range selection, expanded against the local
/// store (local buckets) or a paged cloud listing (cloud buckets). A
/// malformed range or regex rejects the operation before any work.
pub async fn range_operation(
    state: &TargetState,
    bucket: &str,
    op: BatchOp,
    msg: RangeMsg,
) -> Result<BatchHandle, ApiError> {
    let (min, max) = parse_range(&msg.range).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let re = Regex::new(&msg.regex)
        .map_err(|e| ApiError::BadRequest(format!("could not compile regex: {e}")))?;
    if op == BatchOp::Prefetch && state.bmd.get().is_local(bucket) {
        return Err(ApiError::LocalBucketPrefetch(bucket.to_string()));
    }
    let objs = get_list_from_range(state, bucket, &msg.prefix, &re, min, max).await?;
    dispatch(state, bucket, op, objs, msg.deadline_ms, msg.wait).await
}

async fn dispatch(
    state: &TargetState,
    bucket: &str,
    op: BatchOp,
    objs: Vec<String>,
    deadline_ms: u64,
    wait: bool,
) -> Result<BatchHandle, ApiError> {
    match op {
        BatchOp::Prefetch => {
            if state.bmd.get().is_local(bucket) {
                // local objects are not fetchable from cloud
                return Err(ApiError::LocalBucketPrefetch(bucket.to_string()));
            }
            let (done_tx, done_rx) = wait_channel(wait);
            if objs.is_empty() {
                if let Some(tx) = done_tx {
                    let _ = tx.send(());
                }
                return Ok(BatchHandle {
                    done: done_rx,
                    xact_id: None,
                });
            }
            let fwd = FilesWithDeadline {
                bucket: bucket.to_string(),
                objnames: objs,
                deadline: abs_deadline(deadline_ms),
                done: done_tx,
            };
            // Blocking send on a full queue is the back-pressure.
            state
                .prefetch_tx
                .send(fwd)
                .await
                .map_err(|_| ApiError::Any(anyhow::anyhow!("prefetch queue closed")))?;
            Ok(BatchHandle {
                done: done_rx,
                xact_id: None,
            })
        }
        BatchOp::Delete | BatchOp::Evict => {
            let evict = op == BatchOp::Evict;
            let (done_tx, done_rx) = wait_channel(wait);
            let kind = if evict { XactKind::Evict } else { XactKind::Delete };
            let xact = state.xactions.new_xact(kind);
            let xact_id = xact.id;
            let st = state.clone();
            let bucket = bucket.to_string();
            let deadline = abs_deadline(deadline_ms);
            tokio::spawn(async move {
                run_delete_evict(&st, xact, evict, &bucket, objs, deadline, done_tx).await;
            });
            Ok(BatchHandle {
                done: done_rx,
                xact_id: Some(xact_id),
            })
        }
    }
}

fn wait_channel(wait: bool) -> (Option<oneshot::Sender<()>>, Option<oneshot::Receiver<()>>) {
    if wait {
        let (tx, rx) = oneshot::channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    }
}

async fn run_delete_evict(
    state: &TargetState,
    xact: std::sync::Arc<crate::xaction::Xaction>,
    evict: bool,
    bucket: &str,
    objs: Vec<String>,
    deadline: Option<Instant>,
    done: Option<oneshot::Sender<()>>,
) {
    for objname in &objs {
        if xact.aborted() {
            break;
        }
        if deadline.is_some_and(|d| Instant::now() > d) {
            // past the deadline: skip the rest, the xaction still completes
            continue;
        }
        if let Err(e) = fildelete_object(state, bucket, objname, evict).await {
            warn!(bucket, objname, "{}: {e:#}", if evict { "evict" } else { "delete" });
            state.stats.add("numerr", 1);
        }
    }
    xact.finish();
    info!("{xact}");
    state.xactions.del(xact.id);
    // completion is signalled only after the xaction is deregistered
    if let Some(tx) = done {
        let _ = tx.send(());
    }
}

/// Delete or evict one object. Evicting drops only the cached copy; a full
/// delete on a cloud bucket also removes the cloud object.
pub(crate) async fn fildelete_object(
    state: &TargetState,
    bucket: &str,
    objname: &str,
    evict: bool,
) -> Result<(), ApiError> {
    let is_local = state.bmd.get().is_local(bucket);
    if evict && is_local {
        return Err(ApiError::BadRequest(format!(
            "cannot evict from local bucket {bucket}: the cached copy is the only copy"
        )));
    }
    let _guard = state.store.lock_object(bucket, objname).await;
    state.store.fildelete(bucket, objname, is_local).await?;
    if !evict && !is_local {
        match state.cloud.delete_object(bucket, objname).await {
            Ok(()) => {}
            Err(e) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    state.stats.add("numdelete", 1);
    Ok(())
}

/// Accept an object into a range selection: strip the prefix, apply the
/// regex, and admit when the match is empty or is a base-10 number within
/// [min, max] (0 meaning an unset bound).
pub fn accept_regex_range(name: &str, prefix: &str, re: &Regex, min: i64, max: i64) -> bool {
    let oname = name.strip_prefix(prefix).unwrap_or(name);
    let Some(m) = re.find(oname) else {
        return false;
    };
    let matched = m.as_str();
    if matched.is_empty() {
        return true;
    }
    match matched.parse::<i64>() {
        Ok(i) => (min == 0 || i >= min) && (max == 0 || i <= max),
        Err(_) => false,
    }
}

async fn list_bucket_for_range(
    state: &TargetState,
    bucket: &str,
    prefix: &str,
) -> Result<BucketList, ApiError> {
    let msg = GetMsg {
        prefix: prefix.to_string(),
        ..Default::default()
    };
    if state.bmd.get().is_local(bucket) {
        return Ok(state.store.list_bucket(bucket, true, &msg).await?);
    }
    // Paged cloud listing, capped; a partial list is used rather than
    // failing the whole operation.
    let mut all = BucketList::default();
    let mut msg = msg;
    for page in 0..MAX_PREFETCH_PAGES {
        let mut list = state.cloud.listbucket(bucket, &msg).await?;
        all.entries.append(&mut list.entries);
        if list.page_marker.is_empty() {
            break;
        }
        if page == MAX_PREFETCH_PAGES - 1 {
            warn!(bucket, "range listing truncated after {MAX_PREFETCH_PAGES} cloud pages");
        }
        msg.page_marker = list.page_marker;
    }
    Ok(all)
}

async fn get_list_from_range(
    state: &TargetState,
    bucket: &str,
    prefix: &str,
    re: &Regex,
    min: i64,
    max: i64,
) -> Result<Vec<String>, ApiError> {
    let list = list_bucket_for_range(state, bucket, prefix).await?;
    Ok(list
        .entries
        .into_iter()
        .filter(|e| accept_regex_range(&e.name, prefix, re, min, max))
        .filter(|e| state.is_owned_locally(bucket, &e.name))
        .map(|e| e.name)
        .collect())
}

//
// Prefetch
//

/// Long-lived worker draining the bounded prefetch queue. While busy it
/// holds the singleton prefetch xaction; between batches it blocks on the
/// queue with no xaction registered.
pub async fn prefetch_worker(
    state: TargetState,
    mut rx: mpsc::Receiver<FilesWithDeadline>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let fwd = tokio::select! {
            fwd = rx.recv() => match fwd {
                Some(fwd) => fwd,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
                continue;
            }
        };

        let Some(xact) = state.xactions.renew(XactKind::Prefetch) else {
            // only this worker creates prefetch xactions
            error!("prefetch xaction already registered");
            continue;
        };

        let mut next = Some(fwd);
        while let Some(fwd) = next.take() {
            if xact.aborted() {
                signal_done(fwd.done);
                break;
            }
            if fwd.deadline.is_some_and(|d| Instant::now() > d) {
                debug!(bucket = %fwd.bucket, "prefetch batch past its deadline, skipping");
            } else {
                for objname in &fwd.objnames {
                    if xact.aborted() {
                        break;
                    }
                    prefetch_missing(&state, &fwd.bucket, objname).await;
                }
            }
            signal_done(fwd.done);
            next = rx.try_recv().ok();
        }

        xact.finish();
        info!("{xact}");
        state.xactions.del(xact.id);
    }
    info!("prefetch worker stopped");
}

fn signal_done(done: Option<oneshot::Sender<()>>) {
    if let Some(tx) = done {
        let _ = tx.send(());
    }
}

/// Fetch one object unless a fresh copy is already cached. With warm-get
/// validation on, a cached copy of a versioned bucket is revalidated
/// against the cloud and re-fetched when the cloud moved on.
pub async fn prefetch_missing(state: &TargetState, bucket: &str, objname: &str) {
    let bmd = state.bmd.get();
    if bmd.is_local(bucket) {
        return;
    }
    let versioning = bmd.props(bucket).map(|p| p.versioning).unwrap_or(false);
    drop(bmd);

    let _guard = state.store.lock_object(bucket, objname).await;

    let cached = match state.store.lookup_locally(bucket, objname, false).await {
        Ok(c) => c,
        Err(e) => {
            warn!(bucket, objname, "prefetch lookup: {e:#}");
            state.stats.add("numerr", 1);
            return;
        }
    };

    let mut coldget = cached.is_none();
    let mut vchanged = false;
    if let Some(props) = &cached {
        if state.config.validate_warm_get && versioning && !props.version.is_empty() {
            match state
                .cloud
                .check_version(bucket, objname, &props.version)
                .await
            {
                Ok(changed) => {
                    vchanged = changed;
                    coldget = changed;
                }
                Err(e) => {
                    warn!(bucket, objname, "version check: {e}");
                    return;
                }
            }
        }
    }
    if !coldget {
        return;
    }

    let (data, version) = match state.cloud.get_object(bucket, objname).await {
        Ok(got) => got,
        Err(e) => {
            warn!(bucket, objname, "prefetch cold get: {e}");
            state.stats.add("numerr", 1);
            return;
        }
    };
    let size = data.len() as u64;
    if let Err(e) = state
        .store
        .put_bytes(bucket, objname, false, data, version)
        .await
    {
        warn!(bucket, objname, "prefetch store: {e:#}");
        state.stats.add("numerr", 1);
        return;
    }

    debug!("PREFETCH: {bucket}/{objname}");
    state.stats.add("numprefetch", 1);
    state.stats.add("bytesprefetched", size);
    if vchanged {
        state.stats.add("numvchanged", 1);
        state.stats.add("bytesvchanged", size);
    }
}
