//! File-backed local object store. Objects live under
//! `root/{local|cloud}/{bucket}/{objname}` with a small JSON sidecar
//! carrying size, version and checksum; writes stage to a `.part` file and
//! rename into place. Writes to the same (bucket, object) are serialized
//! by a per-object lock.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use common::constants::CHECKSUM_TYPE_BLAKE3;
use common::msgs::{BucketEntry, BucketList, GetMsg};

const LOCAL_DIR: &str = "local";
const CLOUD_DIR: &str = "cloud";
const META_SUFFIX: &str = "cgmeta";
const PART_SUFFIX: &str = "part";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectProps {
    pub size: u64,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub checksum: String,
}

impl ObjectProps {
    pub fn checksum_type(&self) -> &'static str {
        CHECKSUM_TYPE_BLAKE3
    }
}

/// Version tag assigned to locally written objects: UTC wall-clock
/// milliseconds, comparable across successive writes of the same object.
/// Cloud-backed objects keep the backend's own version tag instead.
pub fn local_version_tag() -> String {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).to_string()
}

pub struct FsStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

fn checked_objname(objname: &str) -> anyhow::Result<&Path> {
    let p = Path::new(objname);
    if objname.is_empty()
        || p.is_absolute()
        || p.components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        bail!("invalid object name {objname:?}");
    }
    Ok(p)
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn init_dirs(&self) -> anyhow::Result<()> {
        fs::create_dir_all(self.root.join(LOCAL_DIR)).await?;
        fs::create_dir_all(self.root.join(CLOUD_DIR)).await?;
        Ok(())
    }

    /// Fully qualified path of an object's payload file.
    pub fn fqn(&self, bucket: &str, objname: &str, is_local: bool) -> PathBuf {
        let tier = if is_local { LOCAL_DIR } else { CLOUD_DIR };
        self.root.join(tier).join(bucket).join(objname)
    }

    fn meta_path(fqn: &Path) -> PathBuf {
        fqn.with_extension(match fqn.extension() {
            Some(e) => format!("{}.{}", e.to_string_lossy(), META_SUFFIX),
            None => META_SUFFIX.to_string(),
        })
    }

    /// Serialize writers on one (bucket, object). The guard is owned so it
    /// can be held across awaits in the caller.
    pub async fn lock_object(&self, bucket: &str, objname: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let key = format!("{bucket}/{objname}");
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }

    pub async fn lookup_locally(
        &self,
        bucket: &str,
        objname: &str,
        is_local: bool,
    ) -> anyhow::Result<Option<ObjectProps>> {
        checked_objname(objname)?;
        let fqn = self.fqn(bucket, objname, is_local);
        let meta = match fs::read(Self::meta_path(&fqn)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Payload without sidecar: report what the filesystem knows.
                match fs::metadata(&fqn).await {
                    Ok(md) if md.is_file() => ObjectProps {
                        size: md.len(),
                        ..Default::default()
                    },
                    _ => return Ok(None),
                }
            }
            Err(e) => return Err(e.into()),
        };
        if !fs::try_exists(&fqn).await? {
            return Ok(None);
        }
        Ok(Some(meta))
    }

    pub async fn put_bytes(
        &self,
        bucket: &str,
        objname: &str,
        is_local: bool,
        data: Bytes,
        version: String,
    ) -> anyhow::Result<ObjectProps> {
        let one = Box::pin(futures_util::stream::once(async move {
            Ok::<_, std::io::Error>(data)
        }));
        self.put_stream(bucket, objname, is_local, one, version)
            .await
    }

    /// Stage the payload next to its final path, checksum while streaming,
    /// then rename + write the sidecar.
    pub async fn put_stream<S, E>(
        &self,
        bucket: &str,
        objname: &str,
        is_local: bool,
        mut stream: S,
        version: String,
    ) -> anyhow::Result<ObjectProps>
    where
        S: futures_util::Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        checked_objname(objname)?;
        let fqn = self.fqn(bucket, objname, is_local);
        if let Some(parent) = fqn.parent() {
            fs::create_dir_all(parent).await?;
        }

        let part = fqn.with_extension(match fqn.extension() {
            Some(e) => format!("{}.{}", e.to_string_lossy(), PART_SUFFIX),
            None => PART_SUFFIX.to_string(),
        });
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&part)
            .await?;

        let mut hasher = blake3::Hasher::new();
        let mut size: u64 = 0;
        while let Some(next) = stream.next().await {
            let chunk = next.map_err(|e| anyhow!("stream error: {e}"))?;
            size += chunk.len() as u64;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let props = ObjectProps {
            size,
            version,
            checksum: hasher.finalize().to_hex().to_string(),
        };
        fs::rename(&part, &fqn).await?;
        fs::write(Self::meta_path(&fqn), serde_json::to_vec(&props)?).await?;
        Ok(props)
    }

    /// Remove the local copy (payload + sidecar). Whether the cloud copy
    /// also goes away is the caller's business. Returns whether anything
    /// was removed.
    pub async fn fildelete(&self, bucket: &str, objname: &str, is_local: bool) -> anyhow::Result<bool> {
        checked_objname(objname)?;
        let fqn = self.fqn(bucket, objname, is_local);
        let existed = fs::try_exists(&fqn).await?;
        if existed {
            fs::remove_file(&fqn).await?;
        }
        let meta = Self::meta_path(&fqn);
        if fs::try_exists(&meta).await? {
            fs::remove_file(meta).await?;
        }
        Ok(existed)
    }

    pub async fn rename_object(
        &self,
        bucket: &str,
        objname: &str,
        newname: &str,
        is_local: bool,
    ) -> anyhow::Result<()> {
        checked_objname(objname)?;
        checked_objname(newname)?;
        let from = self.fqn(bucket, objname, is_local);
        let to = self.fqn(bucket, newname, is_local);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&from, &to).await?;
        let from_meta = Self::meta_path(&from);
        if fs::try_exists(&from_meta).await? {
            fs::rename(from_meta, Self::meta_path(&to)).await?;
        }
        Ok(())
    }

    pub async fn open_object(
        &self,
        bucket: &str,
        objname: &str,
        is_local: bool,
    ) -> anyhow::Result<Option<(ObjectProps, File)>> {
        let Some(props) = self.lookup_locally(bucket, objname, is_local).await? else {
            return Ok(None);
        };
        let file = File::open(self.fqn(bucket, objname, is_local)).await?;
        Ok(Some((props, file)))
    }

    /// Enumerate a bucket's cached objects, filtered by prefix. Local
    /// listings are not paged; `page_marker` stays empty.
    pub async fn list_bucket(
        &self,
        bucket: &str,
        is_local: bool,
        msg: &GetMsg,
    ) -> anyhow::Result<BucketList> {
        let tier = if is_local { LOCAL_DIR } else { CLOUD_DIR };
        let dir = self.root.join(tier).join(bucket);
        let mut list = BucketList::default();
        if !dir.is_dir() {
            return Ok(list);
        }
        for entry in WalkDir::new(&dir).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            match path.extension() {
                Some(e) if e == META_SUFFIX || e == PART_SUFFIX => continue,
                _ => {}
            }
            let name = path
                .strip_prefix(&dir)
                .map_err(|e| anyhow!("walk escaped bucket dir: {e}"))?
                .to_string_lossy()
                .replace('\\', "/");
            if !name.starts_with(&msg.prefix) {
                continue;
            }
            let props = self
                .lookup_locally(bucket, &name, is_local)
                .await?
                .unwrap_or_default();
            list.entries.push(BucketEntry {
                name,
                size: props.size,
                checksum: props.checksum,
                version: props.version,
            });
        }
        list.entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// Buckets with at least a directory on this target's disk.
    pub async fn list_buckets(&self, is_local: bool) -> anyhow::Result<Vec<String>> {
        let tier = if is_local { LOCAL_DIR } else { CLOUD_DIR };
        let dir = self.root.join(tier);
        let mut names = Vec::new();
        if !dir.is_dir() {
            return Ok(names);
        }
        let mut rd = fs::read_dir(&dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn create_bucket(&self, bucket: &str, is_local: bool) -> anyhow::Result<()> {
        let tier = if is_local { LOCAL_DIR } else { CLOUD_DIR };
        fs::create_dir_all(self.root.join(tier).join(bucket)).await?;
        Ok(())
    }

    pub async fn destroy_bucket(&self, bucket: &str, is_local: bool) -> anyhow::Result<()> {
        let tier = if is_local { LOCAL_DIR } else { CLOUD_DIR };
        let dir = self.root.join(tier).join(bucket);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(dir).await?;
        }
        Ok(())
    }

    pub async fn rename_bucket(&self, bucket: &str, newname: &str) -> anyhow::Result<()> {
        let from = self.root.join(LOCAL_DIR).join(bucket);
        let to = self.root.join(LOCAL_DIR).join(newname);
        if fs::try_exists(&to).await? {
            bail!("bucket {newname} already exists");
        }
        fs::rename(from, to).await?;
        Ok(())
    }
}
