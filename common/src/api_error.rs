use std::io;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::owner::OwnerError;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("bucket {0} does not exist")]
    UnknownBucket(String),
    #[error("bucket {0} already exists")]
    BucketAlreadyExists(String),
    #[error("object {0} not found")]
    ObjectNotFound(String),
    #[error("daemon {0} is not in the cluster map")]
    UnknownDaemon(String),
    #[error("not the primary proxy; current primary is {0}")]
    NotPrimary(String),
    #[error("no targets in the cluster map")]
    NoTargets,
    #[error("cannot prefetch from local bucket {0}")]
    LocalBucketPrefetch(String),
    #[error(transparent)]
    StaleMeta(#[from] OwnerError),
    #[error("cloud backend: {0}")]
    Backend(String),
    #[error("upstream request failed")]
    UpstreamReq(#[from] reqwest::Error),
    #[error("upstream replied {0}")]
    UpstreamStatus(reqwest::StatusCode),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) | ApiError::LocalBucketPrefetch(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownBucket(_) | ApiError::ObjectNotFound(_) | ApiError::UnknownDaemon(_) => {
                StatusCode::NOT_FOUND
            }
            ApiError::BucketAlreadyExists(_) => StatusCode::CONFLICT,
            ApiError::NotPrimary(_) => StatusCode::MISDIRECTED_REQUEST,
            ApiError::NoTargets => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::StaleMeta(_) => StatusCode::CONFLICT,
            ApiError::Backend(_) => StatusCode::BAD_GATEWAY,
            ApiError::UpstreamReq(_) | ApiError::UpstreamStatus(_) => StatusCode::BAD_GATEWAY,
            ApiError::Io(_) | ApiError::Any(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_client_error() {
            // Control-plane failures carry a JSON error body.
            (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
        } else {
            (status, self.to_string()).into_response()
        }
    }
}
