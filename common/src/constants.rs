pub const REST_VERSION: &str = "v1";

// Response headers on object GET
pub const HEADER_CHECKSUM_TYPE: &str = "x-cache-checksum-type";
pub const HEADER_CHECKSUM_VAL: &str = "x-cache-checksum-val";

// Response headers on object HEAD
pub const HEADER_CLOUD_PROVIDER: &str = "x-cache-cloud-provider";
pub const HEADER_OBJECT_SIZE: &str = "x-cache-object-size";
pub const HEADER_OBJECT_VERSION: &str = "x-cache-object-version";

// Response headers on bucket HEAD
pub const HEADER_BUCKET_VERSIONING: &str = "x-cache-bucket-versioning";
pub const HEADER_NEXT_TIER_URL: &str = "x-cache-next-tier-url";
pub const HEADER_READ_POLICY: &str = "x-cache-read-policy";
pub const HEADER_WRITE_POLICY: &str = "x-cache-write-policy";

// Batch engine sizing
pub const PREFETCH_CHAN_SIZE: usize = 200;
pub const MAX_PREFETCH_PAGES: usize = 10;

// A peer is suspect after missing this many keepalive intervals.
pub const DEFAULT_SUSPECT_FACTOR: u32 = 3;

pub const CHECKSUM_TYPE_BLAKE3: &str = "blake3";
