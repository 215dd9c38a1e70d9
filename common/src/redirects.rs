use axum::{
    body::Body,
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};

use crate::cluster::DaemonInfo;

/// Answer an object request that belongs to another daemon. GET uses a
/// permanent redirect; every body-carrying or idempotency-sensitive method
/// uses 307 so the client replays the request verbatim at the owner.
pub fn redirect_to_owner(owner: &DaemonInfo, uri: &Uri, method: &Method) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let location = format!("{}{}", owner.direct_url, path_and_query);
    let status = if method == Method::GET {
        StatusCode::MOVED_PERMANENTLY
    } else {
        StatusCode::TEMPORARY_REDIRECT
    };
    match Response::builder()
        .status(status)
        .header(header::LOCATION, &location)
        .body(Body::empty())
    {
        Ok(resp) => resp,
        Err(_) => StatusCode::BAD_GATEWAY.into_response(),
    }
}
