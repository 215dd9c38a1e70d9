//! HTTP surface of a target. Every object route is HRW-checked first: a
//! request for an object this target does not own is redirected at the
//! owner, never served and never an error.

use std::io::SeekFrom;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, on, post, put, MethodFilter},
    Json, Router,
};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use common::api_error::ApiError;
use common::cluster::{BucketMD, DaemonInfo, Smap, SmapVoteMsg};
use common::constants::{
    HEADER_BUCKET_VERSIONING, HEADER_CHECKSUM_TYPE, HEADER_CHECKSUM_VAL, HEADER_CLOUD_PROVIDER,
    HEADER_NEXT_TIER_URL, HEADER_OBJECT_SIZE, HEADER_OBJECT_VERSION, HEADER_READ_POLICY,
    HEADER_WRITE_POLICY,
};
use common::hrw::hrw_target;
use common::msgs::{ActionMsg, BucketList, GetMsg};
use common::redirects::redirect_to_owner;
use common::vote::{VoteRequest, VoteResponse};

use crate::listrange::{batch_operation, fildelete_object, BatchOp};
use crate::rebalance::run_rebalance;
use crate::state::TargetState;
use crate::store::{local_version_tag, ObjectProps};
use crate::xaction::XactionRegistry;

pub fn router(state: TargetState) -> Router {
    Router::new()
        .route(
            "/v1/objects/{bucket}/{*objname}",
            on(MethodFilter::GET, get_object)
                .on(MethodFilter::HEAD, head_object)
                .on(MethodFilter::PUT, put_object)
                .on(MethodFilter::DELETE, delete_object)
                .on(MethodFilter::POST, post_object),
        )
        .route("/v1/buckets/", get(get_bucket_names))
        .route(
            "/v1/buckets/{bucket}",
            on(MethodFilter::GET, list_bucket)
                .on(MethodFilter::HEAD, head_bucket)
                .on(MethodFilter::POST, post_bucket),
        )
        .route("/v1/daemon", get(get_daemon).put(put_daemon))
        .route("/v1/daemon/smap", put(put_smap))
        .route("/v1/daemon/bucketmd", put(put_bucketmd))
        .route("/v1/daemon/vote", post(post_vote))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct ObjParams {
    pub offset: Option<u64>,
    pub length: Option<u64>,
    pub check_cached: Option<bool>,
    pub from_id: Option<String>,
    pub to_id: Option<String>,
}

/// `Ok(owner)` when the object belongs to somebody else.
fn check_ownership<'a>(
    state: &TargetState,
    smap: &'a Smap,
    bucket: &str,
    objname: &str,
) -> Result<Option<&'a DaemonInfo>, ApiError> {
    let owner = hrw_target(bucket, objname, smap).ok_or(ApiError::NoTargets)?;
    if owner.daemon_id == state.si.daemon_id {
        Ok(None)
    } else {
        Ok(Some(owner))
    }
}

fn checksum_headers(props: &ObjectProps) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        HEADER_CHECKSUM_TYPE,
        HeaderValue::from_static(props.checksum_type()),
    );
    headers.insert(
        HEADER_CHECKSUM_VAL,
        HeaderValue::from_str(&props.checksum)
            .map_err(|e| ApiError::Any(anyhow::anyhow!("bad checksum header: {e}")))?,
    );
    Ok(headers)
}

// GET /v1/objects/{bucket}/{objname}
async fn get_object(
    Path((bucket, objname)): Path<(String, String)>,
    Query(params): Query<ObjParams>,
    State(state): State<TargetState>,
    uri: Uri,
) -> Result<Response, ApiError> {
    let smap = state.smap.get();
    if let Some(owner) = check_ownership(&state, &smap, &bucket, &objname)? {
        return Ok(redirect_to_owner(owner, &uri, &Method::GET));
    }
    state.stats.add("numget", 1);

    let is_local = state.bmd.get().is_local(&bucket);
    let mut found = state.store.open_object(&bucket, &objname, is_local).await?;
    if found.is_none() {
        if is_local {
            return Err(ApiError::ObjectNotFound(format!("{bucket}/{objname}")));
        }
        // cold GET: pull from cloud under the per-object lock
        let _guard = state.store.lock_object(&bucket, &objname).await;
        found = state.store.open_object(&bucket, &objname, false).await?;
        if found.is_none() {
            let (data, version) = state.cloud.get_object(&bucket, &objname).await?;
            state
                .store
                .put_bytes(&bucket, &objname, false, data, version)
                .await?;
            state.stats.add("numcoldget", 1);
            found = state.store.open_object(&bucket, &objname, false).await?;
        }
    }
    let Some((props, mut file)) = found else {
        return Err(ApiError::ObjectNotFound(format!("{bucket}/{objname}")));
    };

    if let Some(offset) = params.offset {
        file.seek(SeekFrom::Start(offset)).await?;
    }
    let body = match params.length {
        Some(length) => Body::from_stream(ReaderStream::new(file.take(length))),
        None => Body::from_stream(ReaderStream::new(file)),
    };
    let headers = checksum_headers(&props)?;
    Ok((StatusCode::OK, headers, body).into_response())
}

// PUT /v1/objects/{bucket}/{objname}
async fn put_object(
    Path((bucket, objname)): Path<(String, String)>,
    Query(params): Query<ObjParams>,
    State(state): State<TargetState>,
    uri: Uri,
    body: Body,
) -> Result<Response, ApiError> {
    let smap = state.smap.get();
    if let Some(owner) = check_ownership(&state, &smap, &bucket, &objname)? {
        return Ok(redirect_to_owner(owner, &uri, &Method::PUT));
    }
    state.stats.add("numput", 1);
    if let (Some(from), Some(to)) = (&params.from_id, &params.to_id) {
        debug!(bucket, objname, from, to, "migration PUT");
    }

    let is_local = state.bmd.get().is_local(&bucket);
    let _guard = state.store.lock_object(&bucket, &objname).await;
    let props = state
        .store
        .put_stream(
            &bucket,
            &objname,
            is_local,
            body.into_data_stream(),
            local_version_tag(),
        )
        .await?;
    let headers = checksum_headers(&props)?;
    Ok((StatusCode::CREATED, headers).into_response())
}

// DELETE /v1/objects/{bucket}/{objname}
async fn delete_object(
    Path((bucket, objname)): Path<(String, String)>,
    State(state): State<TargetState>,
    uri: Uri,
) -> Result<Response, ApiError> {
    let smap = state.smap.get();
    if let Some(owner) = check_ownership(&state, &smap, &bucket, &objname)? {
        return Ok(redirect_to_owner(owner, &uri, &Method::DELETE));
    }
    fildelete_object(&state, &bucket, &objname, false).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// POST /v1/objects/{bucket}/{objname} — rename via action body
async fn post_object(
    Path((bucket, objname)): Path<(String, String)>,
    State(state): State<TargetState>,
    uri: Uri,
    Json(msg): Json<ActionMsg>,
) -> Result<Response, ApiError> {
    let smap = state.smap.get();
    if let Some(owner) = check_ownership(&state, &smap, &bucket, &objname)? {
        return Ok(redirect_to_owner(owner, &uri, &Method::POST));
    }
    let ActionMsg::Rename(rename) = msg else {
        return Err(ApiError::BadRequest(
            "object POST supports only the rename action".to_string(),
        ));
    };
    if !state.bmd.get().is_local(&bucket) {
        return Err(ApiError::BadRequest(format!(
            "rename is supported on local buckets only, {bucket} is a cloud bucket"
        )));
    }

    let _guard = state.store.lock_object(&bucket, &objname).await;
    if state.is_owned_locally(&bucket, &rename.name) {
        state
            .store
            .rename_object(&bucket, &objname, &rename.name, true)
            .await?;
    } else {
        // the new name hashes to another target: hand the object over
        migrate_object(&state, &smap, &bucket, &objname, &rename.name).await?;
    }
    Ok(StatusCode::OK.into_response())
}

/// Move a locally stored object to the target owning `newname`.
async fn migrate_object(
    state: &TargetState,
    smap: &Smap,
    bucket: &str,
    objname: &str,
    newname: &str,
) -> Result<(), ApiError> {
    let owner = hrw_target(bucket, newname, smap).ok_or(ApiError::NoTargets)?;
    let fqn = state.store.fqn(bucket, objname, true);
    let data = tokio::fs::read(&fqn).await?;
    let url = format!(
        "{}/v1/objects/{}/{}?from_id={}&to_id={}",
        owner.direct_url, bucket, newname, state.si.daemon_id, owner.daemon_id
    );
    let resp = state.http_client.put(&url).body(data).send().await?;
    if !resp.status().is_success() {
        return Err(ApiError::UpstreamStatus(resp.status()));
    }
    state.store.fildelete(bucket, objname, true).await?;
    Ok(())
}

// HEAD /v1/objects/{bucket}/{objname}
async fn head_object(
    Path((bucket, objname)): Path<(String, String)>,
    Query(params): Query<ObjParams>,
    State(state): State<TargetState>,
    uri: Uri,
) -> Result<Response, ApiError> {
    let smap = state.smap.get();
    if let Some(owner) = check_ownership(&state, &smap, &bucket, &objname)? {
        return Ok(redirect_to_owner(owner, &uri, &Method::HEAD));
    }
    let bmd = state.bmd.get();
    let is_local = bmd.is_local(&bucket);
    let provider = if is_local {
        "none"
    } else {
        state.cloud.provider()
    };

    let cached = state
        .store
        .lookup_locally(&bucket, &objname, is_local)
        .await?;
    let props = match cached {
        Some(props) => props,
        None if params.check_cached.unwrap_or(false) || is_local => {
            return Err(ApiError::ObjectNotFound(format!("{bucket}/{objname}")));
        }
        None => state.cloud.head_object(&bucket, &objname).await?,
    };

    let mut headers = HeaderMap::new();
    headers.insert(HEADER_CLOUD_PROVIDER, HeaderValue::from_static(provider));
    headers.insert(
        HEADER_OBJECT_SIZE,
        HeaderValue::from_str(&props.size.to_string())
            .map_err(|e| ApiError::Any(anyhow::anyhow!("bad size header: {e}")))?,
    );
    headers.insert(
        HEADER_OBJECT_VERSION,
        HeaderValue::from_str(&props.version)
            .map_err(|e| ApiError::Any(anyhow::anyhow!("bad version header: {e}")))?,
    );
    Ok((StatusCode::OK, headers).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct BucketNamesParams {
    #[serde(default)]
    local: bool,
}

// GET /v1/buckets/
async fn get_bucket_names(
    Query(params): Query<BucketNamesParams>,
    State(state): State<TargetState>,
) -> Json<Vec<String>> {
    Json(state.bmd.get().bucket_names(params.local))
}

// GET /v1/buckets/{bucket}
async fn list_bucket(
    Path(bucket): Path<String>,
    State(state): State<TargetState>,
    msg: Option<Json<GetMsg>>,
) -> Result<Json<BucketList>, ApiError> {
    let msg = msg.map(|Json(m)| m).unwrap_or_default();
    let list = if state.bmd.get().is_local(&bucket) {
        state.store.list_bucket(&bucket, true, &msg).await?
    } else {
        state.cloud.listbucket(&bucket, &msg).await?
    };
    Ok(Json(list))
}

// POST /v1/buckets/{bucket} — list/range batch operations
async fn post_bucket(
    Path(bucket): Path<String>,
    State(state): State<TargetState>,
    Json(msg): Json<ActionMsg>,
) -> Result<StatusCode, ApiError> {
    let (op, spec) = match msg {
        ActionMsg::Delete(spec) => (BatchOp::Delete, spec),
        ActionMsg::Evict(spec) => (BatchOp::Evict, spec),
        ActionMsg::Prefetch(spec) => (BatchOp::Prefetch, spec),
        // local-bucket directory maintenance, fanned out by the primary
        ActionMsg::Createlb => {
            state.store.create_bucket(&bucket, true).await?;
            return Ok(StatusCode::OK);
        }
        ActionMsg::Destroylb => {
            state.store.destroy_bucket(&bucket, true).await?;
            return Ok(StatusCode::OK);
        }
        ActionMsg::Renamelb(rename) => {
            state.store.rename_bucket(&bucket, &rename.name).await?;
            return Ok(StatusCode::OK);
        }
        other => {
            return Err(ApiError::BadRequest(format!(
                "not a target bucket action: {other:?}"
            )))
        }
    };
    let handle = batch_operation(&state, &bucket, op, spec).await?;
    if let Some(done) = handle.done {
        // a dropped handler (client disconnect) aborts the xaction
        let mut guard = AbortOnDrop::new(Arc::clone(&state.xactions), handle.xact_id);
        let _ = done.await;
        guard.disarm();
    }
    Ok(StatusCode::OK)
}

// HEAD /v1/buckets/{bucket}
async fn head_bucket(
    Path(bucket): Path<String>,
    State(state): State<TargetState>,
) -> Result<Response, ApiError> {
    let bmd = state.bmd.get();
    let is_local = bmd.is_local(&bucket);
    let props = match bmd.props(&bucket) {
        Some(props) => props.clone(),
        None if state.cloud.provider() != "none" => Default::default(),
        None => return Err(ApiError::UnknownBucket(bucket)),
    };
    let provider = if is_local {
        "none".to_string()
    } else if props.cloud_provider.is_empty() {
        state.cloud.provider().to_string()
    } else {
        props.cloud_provider.clone()
    };

    let mut headers = HeaderMap::new();
    let insert = |headers: &mut HeaderMap, name: &'static str, val: &str| -> Result<(), ApiError> {
        headers.insert(
            name,
            HeaderValue::from_str(val)
                .map_err(|e| ApiError::Any(anyhow::anyhow!("bad header {name}: {e}")))?,
        );
        Ok(())
    };
    insert(&mut headers, HEADER_CLOUD_PROVIDER, &provider)?;
    insert(
        &mut headers,
        HEADER_BUCKET_VERSIONING,
        if props.versioning { "true" } else { "false" },
    )?;
    if let Some(url) = &props.next_tier_url {
        insert(&mut headers, HEADER_NEXT_TIER_URL, url)?;
    }
    insert(&mut headers, HEADER_READ_POLICY, props.read_policy.as_str())?;
    insert(&mut headers, HEADER_WRITE_POLICY, props.write_policy.as_str())?;
    Ok((StatusCode::OK, headers).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct WhatParams {
    #[serde(default)]
    what: String,
}

// GET /v1/daemon?what=...
async fn get_daemon(
    Query(params): Query<WhatParams>,
    State(state): State<TargetState>,
) -> Result<Response, ApiError> {
    match params.what.as_str() {
        "" | "smapvote" => Ok(Json(SmapVoteMsg {
            vote_in_progress: state.ledger.in_progress(),
            smap: Some((*state.smap.get()).clone()),
            bucketmd: Some((*state.bmd.get()).clone()),
        })
        .into_response()),
        "smap" => Ok(Json((*state.smap.get()).clone()).into_response()),
        "bucketmd" => Ok(Json((*state.bmd.get()).clone()).into_response()),
        "stats" => Ok(Json(state.stats.snapshot()).into_response()),
        "xactions" => Ok(Json(state.xactions.running()).into_response()),
        other => Err(ApiError::BadRequest(format!("unknown what={other}"))),
    }
}

// PUT /v1/daemon — local actions
async fn put_daemon(
    State(state): State<TargetState>,
    Json(msg): Json<ActionMsg>,
) -> Result<StatusCode, ApiError> {
    match msg {
        ActionMsg::Shutdown => {
            info!("shutdown requested");
            let _ = state.shutdown_tx.send(true);
            Ok(StatusCode::OK)
        }
        ActionMsg::Setconfig(cfg) => {
            info!(key = %cfg.key, value = %cfg.value, "setconfig accepted (applies on restart)");
            Ok(StatusCode::OK)
        }
        ActionMsg::Rebalance => {
            let st = state.clone();
            tokio::spawn(async move { run_rebalance(st).await });
            Ok(StatusCode::OK)
        }
        other => Err(ApiError::BadRequest(format!(
            "not a daemon action: {other:?}"
        ))),
    }
}

// PUT /v1/daemon/smap — replicated map sync from the primary
async fn put_smap(
    State(state): State<TargetState>,
    Json(smap): Json<Smap>,
) -> Result<StatusCode, ApiError> {
    let primary = smap.primary.clone();
    let applied = state.smap.put(smap).map_err(ApiError::from)?;
    if applied {
        // a committed map resolves any election from this daemon's view
        state.ledger.clear();
        state.kalive.heard_from(&primary);
    }
    Ok(StatusCode::OK)
}

// PUT /v1/daemon/bucketmd
async fn put_bucketmd(
    State(state): State<TargetState>,
    Json(bmd): Json<BucketMD>,
) -> Result<StatusCode, ApiError> {
    state.bmd.put(bmd).map_err(ApiError::from)?;
    Ok(StatusCode::OK)
}

// POST /v1/daemon/vote
async fn post_vote(
    State(state): State<TargetState>,
    Json(req): Json<VoteRequest>,
) -> Json<VoteResponse> {
    let smap = state.smap.get();
    let granted = state
        .ledger
        .grant(&req, smap.version, state.primary_reachable());
    info!(candidate = %req.candidate_id, term = req.smap_version, granted, "vote request");
    Json(VoteResponse { granted })
}

/// Aborts a registered xaction unless disarmed; covers the waiting client
/// vanishing before the batch completes.
struct AbortOnDrop {
    registry: Arc<XactionRegistry>,
    id: Option<u64>,
    armed: bool,
}

impl AbortOnDrop {
    fn new(registry: Arc<XactionRegistry>, id: Option<u64>) -> Self {
        Self {
            registry,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if self.armed {
            if let Some(id) = self.id {
                self.registry.abort(id);
            }
        }
    }
}
