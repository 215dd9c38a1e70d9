use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::cluster::BucketProps;

/// Batch operation on an explicit object list. `deadline_ms == 0` means no
/// deadline; `wait` asks for a synchronous completion signal.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ListMsg {
    pub objnames: Vec<String>,
    #[serde(default)]
    pub deadline_ms: u64,
    #[serde(default)]
    pub wait: bool,
}

/// Batch operation on a prefix + regex + numeric range selection.
/// `range` is `"min:max"`, either side empty meaning unbounded.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RangeMsg {
    pub prefix: String,
    pub regex: String,
    pub range: String,
    #[serde(default)]
    pub deadline_ms: u64,
    #[serde(default)]
    pub wait: bool,
}

/// The two shapes a delete/evict/prefetch payload may take. Untagged, but
/// unambiguous: the required field sets are disjoint and unknown fields are
/// rejected, so a payload matching neither (or mixing both) fails to parse.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum BatchSpec {
    List(ListMsg),
    Range(RangeMsg),
}

impl BatchSpec {
    pub fn deadline_ms(&self) -> u64 {
        match self {
            BatchSpec::List(m) => m.deadline_ms,
            BatchSpec::Range(m) => m.deadline_ms,
        }
    }

    pub fn wait(&self) -> bool {
        match self {
            BatchSpec::List(m) => m.wait,
            BatchSpec::Range(m) => m.wait,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RenameMsg {
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConfigMsg {
    pub key: String,
    pub value: String,
}

/// Control-plane action envelope: `{"action": ..., "value": ...}` with the
/// payload type fixed by the action, so an ill-matched combination is a
/// parse error rather than a runtime surprise.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", content = "value", rename_all = "lowercase")]
pub enum ActionMsg {
    Delete(BatchSpec),
    Evict(BatchSpec),
    Prefetch(BatchSpec),
    Rename(RenameMsg),
    Setprops(BucketProps),
    Setconfig(ConfigMsg),
    Createlb,
    Destroylb,
    Renamelb(RenameMsg),
    Shutdown,
    Rebalance,
}

/// Bucket listing request; `page_marker` resumes a paged cloud listing.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetMsg {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub page_marker: String,
    #[serde(default)]
    pub page_size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BucketEntry {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BucketList {
    pub entries: Vec<BucketEntry>,
    #[serde(default)]
    pub page_marker: String,
}

/// Parse `"min:max"`. Empty string means fully unbounded; an empty side
/// means that bound is unset (0). A bare number without `:` is an error.
pub fn parse_range(rangestr: &str) -> anyhow::Result<(i64, i64)> {
    if rangestr.is_empty() {
        return Ok((0, 0));
    }
    let Some((lo, hi)) = rangestr.split_once(':') else {
        bail!("invalid range {rangestr:?}: missing ':'");
    };
    let min = if lo.is_empty() {
        0
    } else {
        lo.parse()
            .map_err(|e| anyhow!("invalid range minimum {lo:?}: {e}"))?
    };
    let max = if hi.is_empty() {
        0
    } else {
        hi.parse()
            .map_err(|e| anyhow!("invalid range maximum {hi:?}: {e}"))?
    };
    Ok((min, max))
}
