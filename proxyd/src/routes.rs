//! HTTP surface of a proxy. Proxies never touch object bytes: every
//! object route is answered with a redirect at the HRW owner. Membership
//! and bucket-metadata mutations run on the primary; a non-primary proxy
//! relays them there.

use std::collections::BTreeMap;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, delete, get, on, post, put, MethodFilter},
    Json, Router,
};
use futures_util::future::join_all;
use serde::Deserialize;
use tracing::info;

use common::api_error::ApiError;
use common::cluster::{BucketMD, BucketProps, DaemonInfo, Role, Smap, SmapVoteMsg};
use common::constants::{
    HEADER_BUCKET_VERSIONING, HEADER_CLOUD_PROVIDER, HEADER_NEXT_TIER_URL, HEADER_READ_POLICY,
    HEADER_WRITE_POLICY, REST_VERSION,
};
use common::hrw::hrw_target;
use common::msgs::{ActionMsg, BucketEntry, BucketList, GetMsg, RenameMsg};
use common::redirects::redirect_to_owner;
use common::vote::{VoteRequest, VoteResponse};

use crate::broadcast::{broadcast_action, broadcast_bucket_action, sync_bmd, sync_smap};
use crate::persist;
use crate::state::ProxyState;

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/v1/objects/{bucket}/{*objname}", any(object_redirect))
        .route("/v1/buckets/", get(get_bucket_names))
        .route(
            "/v1/buckets/{bucket}",
            on(MethodFilter::GET, list_bucket)
                .on(MethodFilter::HEAD, head_bucket)
                .on(MethodFilter::POST, post_bucket)
                .on(MethodFilter::PUT, put_bucket)
                .on(MethodFilter::DELETE, delete_bucket),
        )
        .route("/v1/cluster", put(put_cluster))
        .route("/v1/cluster/register", post(register_daemon))
        .route("/v1/cluster/daemon/{id}", delete(unregister_daemon))
        .route("/v1/cluster/proxy/{id}", put(set_primary))
        .route("/v1/daemon", get(get_daemon).put(put_daemon))
        .route("/v1/daemon/smap", put(put_smap))
        .route("/v1/daemon/bucketmd", put(put_bucketmd))
        .route("/v1/daemon/vote", post(post_vote))
        .with_state(state)
}

/// Re-issue a control-plane mutation at the primary and relay its answer.
async fn relay_to_primary(
    state: &ProxyState,
    method: Method,
    uri: &Uri,
    body: Option<serde_json::Value>,
) -> Result<Response, ApiError> {
    let smap = state.smap.get();
    let primary = smap
        .primary_info()
        .ok_or_else(|| ApiError::NotPrimary("unknown".to_string()))?;
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let url = format!("{}{}", primary.direct_url, path_and_query);

    let mut req = if method == Method::POST {
        state.http_client.post(&url)
    } else if method == Method::PUT {
        state.http_client.put(&url)
    } else if method == Method::DELETE {
        state.http_client.delete(&url)
    } else {
        return Err(ApiError::BadRequest(format!(
            "cannot relay {method} to the primary"
        )));
    };
    if let Some(body) = body {
        req = req.json(&body);
    }
    let resp = req.send().await?;
    let status =
        StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let bytes = resp.bytes().await.unwrap_or_default();
    Ok(Response::builder()
        .status(status)
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

// any /v1/objects/{bucket}/{objname}
async fn object_redirect(
    Path((bucket, objname)): Path<(String, String)>,
    State(state): State<ProxyState>,
    method: Method,
    uri: Uri,
) -> Result<Response, ApiError> {
    let smap = state.smap.get();
    let owner = hrw_target(&bucket, &objname, &smap).ok_or(ApiError::NoTargets)?;
    Ok(redirect_to_owner(owner, &uri, &method))
}

#[derive(Debug, Default, Deserialize)]
struct BucketNamesParams {
    #[serde(default)]
    local: bool,
}

// GET /v1/buckets/
async fn get_bucket_names(
    Query(params): Query<BucketNamesParams>,
    State(state): State<ProxyState>,
) -> Json<Vec<String>> {
    Json(state.bmd.get().bucket_names(params.local))
}

// GET /v1/buckets/{bucket} — fan out to every target and merge the slices
async fn list_bucket(
    Path(bucket): Path<String>,
    State(state): State<ProxyState>,
    msg: Option<Json<GetMsg>>,
) -> Result<Json<BucketList>, ApiError> {
    let msg = msg.map(|Json(m)| m).unwrap_or_default();
    let smap = state.smap.get();
    if smap.tmap.is_empty() {
        return Err(ApiError::NoTargets);
    }

    let client = &state.http_client;
    let bucket = &bucket;
    let msg = &msg;
    let lists = join_all(smap.tmap.values().map(|t| async move {
        let url = format!("{}/{}/buckets/{}", t.direct_url, REST_VERSION, bucket);
        let resp = client.get(&url).json(msg).send().await?.error_for_status()?;
        resp.json::<BucketList>().await
    }))
    .await;

    let mut merged: BTreeMap<String, BucketEntry> = BTreeMap::new();
    let mut last_err = None;
    for list in lists {
        match list {
            Ok(list) => {
                for entry in list.entries {
                    merged.insert(entry.name.clone(), entry);
                }
            }
            Err(e) => last_err = Some(e),
        }
    }
    if merged.is_empty() {
        if let Some(e) = last_err {
            return Err(e.into());
        }
    }
    Ok(Json(BucketList {
        entries: merged.into_values().collect(),
        page_marker: String::new(),
    }))
}

// POST /v1/buckets/{bucket}
async fn post_bucket(
    Path(bucket): Path<String>,
    State(state): State<ProxyState>,
    uri: Uri,
    Json(msg): Json<ActionMsg>,
) -> Result<Response, ApiError> {
    match msg {
        ActionMsg::Createlb => create_local_bucket(&state, &bucket, &uri).await,
        ActionMsg::Destroylb => destroy_local_bucket(&state, &bucket, &uri).await,
        ActionMsg::Renamelb(rename) => rename_local_bucket(&state, &bucket, rename, &uri).await,
        ActionMsg::Setprops(props) => set_bucket_props(&state, &bucket, props, &uri).await,
        msg @ (ActionMsg::Delete(_) | ActionMsg::Evict(_) | ActionMsg::Prefetch(_)) => {
            match broadcast_bucket_action(&state, &bucket, &msg).await {
                Ok(()) => Ok(StatusCode::OK.into_response()),
                Err((status, body)) => Ok((
                    StatusCode::from_u16(status.as_u16())
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    body,
                )
                    .into_response()),
            }
        }
        other => Err(ApiError::BadRequest(format!(
            "not a bucket action: {other:?}"
        ))),
    }
}

// PUT /v1/buckets/{bucket} — set properties
async fn put_bucket(
    Path(bucket): Path<String>,
    State(state): State<ProxyState>,
    uri: Uri,
    Json(props): Json<BucketProps>,
) -> Result<Response, ApiError> {
    set_bucket_props(&state, &bucket, props, &uri).await
}

// DELETE /v1/buckets/{bucket}
async fn delete_bucket(
    Path(bucket): Path<String>,
    State(state): State<ProxyState>,
    uri: Uri,
) -> Result<Response, ApiError> {
    destroy_local_bucket(&state, &bucket, &uri).await
}

async fn create_local_bucket(
    state: &ProxyState,
    bucket: &str,
    uri: &Uri,
) -> Result<Response, ApiError> {
    if !state.is_primary() {
        let body = serde_json::to_value(ActionMsg::Createlb).map_err(anyhow::Error::from)?;
        return relay_to_primary(state, Method::POST, uri, Some(body)).await;
    }
    if state.bmd.get().is_local(bucket) {
        return Err(ApiError::BucketAlreadyExists(bucket.to_string()));
    }
    let bmd = state.bmd.publish(|b| {
        b.local_buckets
            .insert(bucket.to_string(), BucketProps::default());
    });
    info!(bucket, version = bmd.version, "created local bucket");
    sync_bmd(state, &bmd).await;
    let _ = broadcast_bucket_action(state, bucket, &ActionMsg::Createlb).await;
    persist::save_spawn(state);
    Ok(StatusCode::OK.into_response())
}

async fn destroy_local_bucket(
    state: &ProxyState,
    bucket: &str,
    uri: &Uri,
) -> Result<Response, ApiError> {
    if !state.is_primary() {
        let body = serde_json::to_value(ActionMsg::Destroylb).map_err(anyhow::Error::from)?;
        return relay_to_primary(state, Method::POST, uri, Some(body)).await;
    }
    if !state.bmd.get().is_local(bucket) {
        return Err(ApiError::UnknownBucket(bucket.to_string()));
    }
    let bmd = state.bmd.publish(|b| {
        b.local_buckets.remove(bucket);
    });
    info!(bucket, version = bmd.version, "destroyed local bucket");
    sync_bmd(state, &bmd).await;
    let _ = broadcast_bucket_action(state, bucket, &ActionMsg::Destroylb).await;
    persist::save_spawn(state);
    Ok(StatusCode::OK.into_response())
}

async fn rename_local_bucket(
    state: &ProxyState,
    bucket: &str,
    rename: RenameMsg,
    uri: &Uri,
) -> Result<Response, ApiError> {
    if !state.is_primary() {
        let body = serde_json::to_value(ActionMsg::Renamelb(rename.clone()))
            .map_err(anyhow::Error::from)?;
        return relay_to_primary(state, Method::POST, uri, Some(body)).await;
    }
    let cur = state.bmd.get();
    if !cur.is_local(bucket) {
        return Err(ApiError::UnknownBucket(bucket.to_string()));
    }
    if cur.is_local(&rename.name) {
        return Err(ApiError::BucketAlreadyExists(rename.name));
    }
    drop(cur);
    let bmd = state.bmd.publish(|b| {
        if let Some(props) = b.local_buckets.remove(bucket) {
            b.local_buckets.insert(rename.name.clone(), props);
        }
    });
    info!(bucket, newname = %rename.name, version = bmd.version, "renamed local bucket");
    sync_bmd(state, &bmd).await;
    let _ = broadcast_bucket_action(state, bucket, &ActionMsg::Renamelb(rename)).await;
    persist::save_spawn(state);
    Ok(StatusCode::OK.into_response())
}

async fn set_bucket_props(
    state: &ProxyState,
    bucket: &str,
    props: BucketProps,
    uri: &Uri,
) -> Result<Response, ApiError> {
    if !state.is_primary() {
        let body = serde_json::to_value(&props).map_err(anyhow::Error::from)?;
        return relay_to_primary(state, Method::PUT, uri, Some(body)).await;
    }
    let is_local = state.bmd.get().is_local(bucket);
    let bmd = state.bmd.publish(|b| {
        let map = if is_local {
            &mut b.local_buckets
        } else {
            &mut b.cloud_policies
        };
        map.insert(bucket.to_string(), props.clone());
    });
    info!(bucket, version = bmd.version, "updated bucket properties");
    sync_bmd(state, &bmd).await;
    persist::save_spawn(state);
    Ok(StatusCode::OK.into_response())
}

// HEAD /v1/buckets/{bucket}
async fn head_bucket(
    Path(bucket): Path<String>,
    State(state): State<ProxyState>,
) -> Result<Response, ApiError> {
    let bmd = state.bmd.get();
    let is_local = bmd.is_local(&bucket);
    let Some(props) = bmd.props(&bucket) else {
        return Err(ApiError::UnknownBucket(bucket));
    };

    let provider = if is_local {
        "none"
    } else if props.cloud_provider.is_empty() {
        "cloud"
    } else {
        props.cloud_provider.as_str()
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
    insert(&mut headers, HEADER_CLOUD_PROVIDER, provider)?;
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

// PUT /v1/cluster — cluster-wide actions
async fn put_cluster(
    State(state): State<ProxyState>,
    Json(msg): Json<ActionMsg>,
) -> Result<StatusCode, ApiError> {
    match &msg {
        ActionMsg::Rebalance => {
            broadcast_action(&state, &msg, true).await;
            Ok(StatusCode::OK)
        }
        ActionMsg::Setconfig(_) => {
            broadcast_action(&state, &msg, false).await;
            Ok(StatusCode::OK)
        }
        ActionMsg::Shutdown => {
            broadcast_action(&state, &msg, false).await;
            let _ = state.shutdown_tx.send(true);
            Ok(StatusCode::OK)
        }
        other => Err(ApiError::BadRequest(format!(
            "not a cluster action: {other:?}"
        ))),
    }
}

// POST /v1/cluster/register
async fn register_daemon(
    State(state): State<ProxyState>,
    uri: Uri,
    Json(si): Json<DaemonInfo>,
) -> Result<Response, ApiError> {
    if !state.is_primary() {
        let body = serde_json::to_value(&si).map_err(anyhow::Error::from)?;
        return relay_to_primary(&state, Method::POST, &uri, Some(body)).await;
    }
    if !si.url_agrees() {
        return Err(ApiError::BadRequest(format!(
            "direct_url {} disagrees with {}:{}",
            si.direct_url, si.node_ip, si.daemon_port
        )));
    }

    let daemon_id = si.daemon_id.clone();
    let role = si.role;
    let smap = state.smap.publish(|m| match role {
        Role::Target => m.add_target(si.clone()),
        Role::Proxy => m.add_proxy(si.clone()),
    });
    state.kalive.heard_from(&daemon_id);
    info!(daemon_id, ?role, version = smap.version, "registered daemon");

    let st = state.clone();
    let broadcast_map = (*smap).clone();
    tokio::spawn(async move { sync_smap(&st, &broadcast_map).await });
    persist::save_spawn(&state);

    Ok(Json((*smap).clone()).into_response())
}

// DELETE /v1/cluster/daemon/{id}
async fn unregister_daemon(
    Path(daemon_id): Path<String>,
    State(state): State<ProxyState>,
    uri: Uri,
) -> Result<Response, ApiError> {
    if !state.is_primary() {
        return relay_to_primary(&state, Method::DELETE, &uri, None).await;
    }
    if !state.smap.get().contains(&daemon_id) {
        return Err(ApiError::UnknownDaemon(daemon_id));
    }
    if daemon_id == state.si.daemon_id {
        return Err(ApiError::BadRequest(
            "the primary cannot unregister itself".to_string(),
        ));
    }
    let smap = state.smap.publish(|m| {
        m.remove(&daemon_id);
    });
    info!(daemon_id, version = smap.version, "unregistered daemon");

    let st = state.clone();
    let broadcast_map = (*smap).clone();
    tokio::spawn(async move { sync_smap(&st, &broadcast_map).await });
    persist::save_spawn(&state);
    Ok(StatusCode::OK.into_response())
}

// PUT /v1/cluster/proxy/{id} — administrative primary handoff
async fn set_primary(
    Path(daemon_id): Path<String>,
    State(state): State<ProxyState>,
    uri: Uri,
) -> Result<Response, ApiError> {
    if !state.is_primary() {
        return relay_to_primary(&state, Method::PUT, &uri, None).await;
    }
    if !state.smap.get().pmap.contains_key(&daemon_id) {
        return Err(ApiError::UnknownDaemon(daemon_id));
    }
    let smap = state.smap.publish(|m| {
        m.primary = daemon_id.clone();
    });
    info!(new_primary = %daemon_id, version = smap.version, "handing off primary");
    // synchronous: the caller must not observe a cluster without a primary
    sync_smap(&state, &smap).await;
    persist::save_spawn(&state);
    Ok(StatusCode::OK.into_response())
}

#[derive(Debug, Default, Deserialize)]
struct WhatParams {
    #[serde(default)]
    what: String,
}

// GET /v1/daemon?what=...
async fn get_daemon(
    Query(params): Query<WhatParams>,
    State(state): State<ProxyState>,
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
        other => Err(ApiError::BadRequest(format!("unknown what={other}"))),
    }
}

// PUT /v1/daemon — local actions
async fn put_daemon(
    State(state): State<ProxyState>,
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
        other => Err(ApiError::BadRequest(format!(
            "not a daemon action: {other:?}"
        ))),
    }
}

// PUT /v1/daemon/smap — replicated map sync
async fn put_smap(
    State(state): State<ProxyState>,
    Json(smap): Json<Smap>,
) -> Result<StatusCode, ApiError> {
    let primary = smap.primary.clone();
    let applied = state.smap.put(smap).map_err(ApiError::from)?;
    if applied {
        // a committed map resolves any election from this daemon's view
        state.ledger.clear();
        state.kalive.heard_from(&primary);
        persist::save_spawn(&state);
    }
    Ok(StatusCode::OK)
}

// PUT /v1/daemon/bucketmd
async fn put_bucketmd(
    State(state): State<ProxyState>,
    Json(bmd): Json<BucketMD>,
) -> Result<StatusCode, ApiError> {
    if state.bmd.put(bmd).map_err(ApiError::from)? {
        persist::save_spawn(&state);
    }
    Ok(StatusCode::OK)
}

// POST /v1/daemon/vote
async fn post_vote(
    State(state): State<ProxyState>,
    Json(req): Json<VoteRequest>,
) -> Json<VoteResponse> {
    let smap = state.smap.get();
    let primary_reachable = state.is_primary()
        || (!smap.primary.is_empty() && !state.kalive.is_suspect(&smap.primary));
    let granted = state.ledger.grant(&req, smap.version, primary_reachable);
    info!(candidate = %req.candidate_id, term = req.smap_version, granted, "vote request");
    Json(VoteResponse { granted })
}
