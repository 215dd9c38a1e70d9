use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::owner::Versioned;
use crate::url_utils::direct_url;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Proxy,
    Target,
}

/// Identity of one cluster member. `daemon_id` is globally unique and
/// immutable for the node's lifetime; `direct_url` is derived from
/// `node_ip:daemon_port` and must stay in agreement with them.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DaemonInfo {
    pub daemon_id: String,
    pub role: Role,
    pub node_ip: String,
    pub daemon_port: String,
    pub direct_url: String,
}

impl DaemonInfo {
    pub fn new(daemon_id: impl Into<String>, role: Role, node_ip: &str, daemon_port: &str) -> Self {
        Self {
            daemon_id: daemon_id.into(),
            role,
            node_ip: node_ip.to_string(),
            daemon_port: daemon_port.to_string(),
            direct_url: direct_url(node_ip, daemon_port),
        }
    }

    pub fn url_agrees(&self) -> bool {
        self.direct_url == direct_url(&self.node_ip, &self.daemon_port)
    }
}

/// Versioned cluster membership map, replicated to every daemon. Mutated
/// only by the primary proxy; everybody else applies published copies.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Smap {
    pub version: i64,
    pub tmap: HashMap<String, DaemonInfo>,
    pub pmap: HashMap<String, DaemonInfo>,
    /// daemon_id of the primary proxy; empty until the map is bootstrapped.
    pub primary: String,
}

impl Smap {
    pub fn add_target(&mut self, si: DaemonInfo) {
        self.tmap.insert(si.daemon_id.clone(), si);
    }

    pub fn add_proxy(&mut self, si: DaemonInfo) {
        self.pmap.insert(si.daemon_id.clone(), si);
    }

    pub fn remove(&mut self, daemon_id: &str) -> Option<DaemonInfo> {
        self.tmap
            .remove(daemon_id)
            .or_else(|| self.pmap.remove(daemon_id))
    }

    pub fn contains(&self, daemon_id: &str) -> bool {
        self.tmap.contains_key(daemon_id) || self.pmap.contains_key(daemon_id)
    }

    pub fn daemon(&self, daemon_id: &str) -> Option<&DaemonInfo> {
        self.tmap
            .get(daemon_id)
            .or_else(|| self.pmap.get(daemon_id))
    }

    pub fn primary_info(&self) -> Option<&DaemonInfo> {
        self.pmap.get(&self.primary)
    }

    pub fn all_daemons(&self) -> impl Iterator<Item = &DaemonInfo> {
        self.tmap.values().chain(self.pmap.values())
    }

    pub fn count_targets(&self) -> usize {
        self.tmap.len()
    }

    pub fn count_proxies(&self) -> usize {
        self.pmap.len()
    }
}

impl Versioned for Smap {
    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, v: i64) {
        self.version = v;
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TierPolicy {
    #[default]
    Cloud,
    #[serde(rename = "next_tier")]
    NextTier,
}

impl TierPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierPolicy::Cloud => "cloud",
            TierPolicy::NextTier => "next_tier",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BucketProps {
    #[serde(default)]
    pub cloud_provider: String,
    #[serde(default)]
    pub next_tier_url: Option<String>,
    #[serde(default)]
    pub read_policy: TierPolicy,
    #[serde(default)]
    pub write_policy: TierPolicy,
    #[serde(default)]
    pub versioning: bool,
}

/// Versioned bucket metadata, replicated alongside the Smap. A bucket is
/// "local" (cache-only, no cloud backing) iff it appears in `local_buckets`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BucketMD {
    pub version: i64,
    pub local_buckets: HashMap<String, BucketProps>,
    pub cloud_policies: HashMap<String, BucketProps>,
}

impl BucketMD {
    pub fn is_local(&self, bucket: &str) -> bool {
        self.local_buckets.contains_key(bucket)
    }

    pub fn props(&self, bucket: &str) -> Option<&BucketProps> {
        self.local_buckets
            .get(bucket)
            .or_else(|| self.cloud_policies.get(bucket))
    }

    pub fn bucket_names(&self, local_only: bool) -> Vec<String> {
        let mut names: Vec<String> = self.local_buckets.keys().cloned().collect();
        if !local_only {
            names.extend(self.cloud_policies.keys().cloned());
        }
        names.sort();
        names.dedup();
        names
    }
}

impl Versioned for BucketMD {
    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, v: i64) {
        self.version = v;
    }
}

/// Payload of every daemon's "who are you" discovery endpoint. When
/// `vote_in_progress` is set the maps must be ignored by the caller.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SmapVoteMsg {
    pub vote_in_progress: bool,
    pub smap: Option<Smap>,
    pub bucketmd: Option<BucketMD>,
}
