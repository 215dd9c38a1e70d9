//! Cloud-backend seam. The real S3/GCS adapters live behind this trait;
//! the tier ships with an in-memory adapter (tests, local emulation) and
//! an offline adapter for cache-only deployments.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use common::api_error::ApiError;
use common::msgs::{BucketEntry, BucketList, GetMsg};

use crate::store::ObjectProps;

#[derive(thiserror::Error, Debug)]
#[error("{msg} (http {code})")]
pub struct CloudError {
    pub code: u16,
    pub msg: String,
}

impl CloudError {
    pub fn new(code: u16, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }

    pub fn not_found(bucket: &str, objname: &str) -> Self {
        Self::new(404, format!("{bucket}/{objname} not found in cloud"))
    }
}

impl From<CloudError> for ApiError {
    fn from(e: CloudError) -> Self {
        if e.code == 404 {
            ApiError::ObjectNotFound(e.msg)
        } else {
            ApiError::Backend(e.to_string())
        }
    }
}

#[async_trait]
pub trait CloudBackend: Send + Sync {
    fn provider(&self) -> &'static str;

    /// One page of a bucket listing; `msg.page_marker` resumes, the
    /// returned `page_marker` is empty on the last page.
    async fn listbucket(&self, bucket: &str, msg: &GetMsg) -> Result<BucketList, CloudError>;

    /// Cold fetch: payload plus the backend's version tag.
    async fn get_object(&self, bucket: &str, objname: &str) -> Result<(Bytes, String), CloudError>;

    async fn head_object(&self, bucket: &str, objname: &str) -> Result<ObjectProps, CloudError>;

    /// Has the cloud copy moved past `current`?
    async fn check_version(
        &self,
        bucket: &str,
        objname: &str,
        current: &str,
    ) -> Result<bool, CloudError>;

    async fn delete_object(&self, bucket: &str, objname: &str) -> Result<(), CloudError>;
}

/// Deployment without any cloud backing; every call is a backend error.
pub struct OfflineCloud;

const OFFLINE_MSG: &str = "no cloud backend configured";

#[async_trait]
impl CloudBackend for OfflineCloud {
    fn provider(&self) -> &'static str {
        "none"
    }

    async fn listbucket(&self, _bucket: &str, _msg: &GetMsg) -> Result<BucketList, CloudError> {
        Err(CloudError::new(501, OFFLINE_MSG))
    }

    async fn get_object(&self, _bucket: &str, _objname: &str) -> Result<(Bytes, String), CloudError> {
        Err(CloudError::new(501, OFFLINE_MSG))
    }

    async fn head_object(&self, _bucket: &str, _objname: &str) -> Result<ObjectProps, CloudError> {
        Err(CloudError::new(501, OFFLINE_MSG))
    }

    async fn check_version(
        &self,
        _bucket: &str,
        _objname: &str,
        _current: &str,
    ) -> Result<bool, CloudError> {
        Err(CloudError::new(501, OFFLINE_MSG))
    }

    async fn delete_object(&self, _bucket: &str, _objname: &str) -> Result<(), CloudError> {
        Err(CloudError::new(501, OFFLINE_MSG))
    }
}

#[derive(Clone, Debug)]
struct MemObject {
    data: Bytes,
    version: u64,
}

/// In-memory cloud emulation with real paging semantics.
pub struct MemCloud {
    page_size: usize,
    buckets: RwLock<HashMap<String, BTreeMap<String, MemObject>>>,
}

impl MemCloud {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.buckets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(bucket.to_string())
            .or_default();
    }

    /// Seed or overwrite an object; each write bumps the version tag.
    pub fn put_object(&self, bucket: &str, objname: &str, data: impl Into<Bytes>) {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        let objs = buckets.entry(bucket.to_string()).or_default();
        let version = objs.get(objname).map(|o| o.version + 1).unwrap_or(1);
        objs.insert(
            objname.to_string(),
            MemObject {
                data: data.into(),
                version,
            },
        );
    }
}

#[async_trait]
impl CloudBackend for MemCloud {
    fn provider(&self) -> &'static str {
        "mem"
    }

    async fn listbucket(&self, bucket: &str, msg: &GetMsg) -> Result<BucketList, CloudError> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        let objs = buckets
            .get(bucket)
            .ok_or_else(|| CloudError::new(404, format!("cloud bucket {bucket} not found")))?;

        let page_size = if msg.page_size > 0 {
            msg.page_size
        } else {
            self.page_size
        };
        let lower = if msg.page_marker.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(msg.page_marker.clone())
        };

        let mut list = BucketList::default();
        for (name, obj) in objs.range((lower, Bound::Unbounded)) {
            if list.entries.len() == page_size {
                list.page_marker = list
                    .entries
                    .last()
                    .map(|e| e.name.clone())
                    .unwrap_or_default();
                return Ok(list);
            }
            if !name.starts_with(&msg.prefix) {
                continue;
            }
            list.entries.push(BucketEntry {
                name: name.clone(),
                size: obj.data.len() as u64,
                checksum: String::new(),
                version: obj.version.to_string(),
            });
        }
        Ok(list)
    }

    async fn get_object(&self, bucket: &str, objname: &str) -> Result<(Bytes, String), CloudError> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        let obj = buckets
            .get(bucket)
            .and_then(|b| b.get(objname))
            .ok_or_else(|| CloudError::not_found(bucket, objname))?;
        Ok((obj.data.clone(), obj.version.to_string()))
    }

    async fn head_object(&self, bucket: &str, objname: &str) -> Result<ObjectProps, CloudError> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        let obj = buckets
            .get(bucket)
            .and_then(|b| b.get(objname))
            .ok_or_else(|| CloudError::not_found(bucket, objname))?;
        Ok(ObjectProps {
            size: obj.data.len() as u64,
            version: obj.version.to_string(),
            checksum: String::new(),
        })
    }

    async fn check_version(
        &self,
        bucket: &str,
        objname: &str,
        current: &str,
    ) -> Result<bool, CloudError> {
        let props = self.head_object(bucket, objname).await?;
        Ok(props.version != current)
    }

    async fn delete_object(&self, bucket: &str, objname: &str) -> Result<(), CloudError> {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        let objs = buckets
            .get_mut(bucket)
            .ok_or_else(|| CloudError::new(404, format!("cloud bucket {bucket} not found")))?;
        objs.remove(objname)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found(bucket, objname))
    }
}
