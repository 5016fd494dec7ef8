//! Core metadata entities.
//!
//! These types are shared by the client backends, the cache, and the
//! metadata engine.  They serialize with serde so every layer reads and
//! writes the same schema: the ordered-KV backend stores them as JSON
//! values, the SQLite backend maps them to columns, and the cache keeps
//! them as serialized entries.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::errors::MetaError;

/// Version identifier of the "null" (unversioned) object record.
pub const NULL_VERSION: &str = "";

/// Get current time as an RFC 3339 string with millisecond precision
/// (e.g., "2026-02-23T12:00:00.000Z").
pub fn now_utc() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Get current time as nanoseconds since the Unix epoch.
///
/// Object creation times are kept at nanosecond precision because the
/// version identifier is derived from them (see [`version_from_create_time`]).
pub fn now_nanos() -> u64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64
}

/// Derive a version identifier from an object creation time.
///
/// Versions must scan newest-first in lexicographic order, so the
/// identifier is the zero-padded decimal of `u64::MAX - create_time`:
/// a later creation time yields a smaller string.
pub fn version_from_create_time(create_time: u64) -> String {
    format!("{:020}", u64::MAX - create_time)
}

// ── Buckets ─────────────────────────────────────────────────────────

/// Bucket versioning mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VersioningMode {
    /// Versioning was never enabled; exactly one record per key.
    #[default]
    Disabled,
    /// Versioning was enabled and then suspended; writes target the
    /// null version, prior versions remain readable.
    Suspended,
    /// Every write creates a new version record.
    Enabled,
}

impl VersioningMode {
    /// The canonical storage string for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            VersioningMode::Disabled => "Disabled",
            VersioningMode::Suspended => "Suspended",
            VersioningMode::Enabled => "Enabled",
        }
    }
}

impl FromStr for VersioningMode {
    type Err = MetaError;

    /// Parse a stored versioning string.  Anything unrecognized is a
    /// corrupt or foreign record and surfaces as `InvalidVersioning`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Disabled" => Ok(VersioningMode::Disabled),
            "Suspended" => Ok(VersioningMode::Suspended),
            "Enabled" => Ok(VersioningMode::Enabled),
            other => Err(MetaError::InvalidVersioning {
                mode: other.to_string(),
            }),
        }
    }
}

/// Metadata record for a bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket name.
    pub name: String,
    /// Canonical owner (tenant) ID.
    pub owner_id: String,
    /// Versioning mode.
    #[serde(default)]
    pub versioning: VersioningMode,
    /// Total live bytes in the bucket.  Maintained incrementally: every
    /// size-changing mutation adjusts this in the same transaction.
    #[serde(default)]
    pub usage: i64,
    /// Access control list (JSON-serialized).
    #[serde(default)]
    pub acl: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

// ── Objects ─────────────────────────────────────────────────────────

/// Metadata record for one object version.
///
/// `version_id == ""` is the "null" record: the only record of an
/// unversioned key, or the record targeted by writes while versioning
/// is suspended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    /// Bucket the object belongs to.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Version identifier; empty for the null version.
    #[serde(default)]
    pub version_id: String,
    /// Canonical owner ID.
    pub owner_id: String,
    /// Size in bytes.
    pub size: u64,
    /// Quoted ETag string (e.g., `"d41d8cd98f00b204e9800998ecf8427e"`).
    pub etag: String,
    /// MIME content type.
    pub content_type: String,
    /// Storage class (default STANDARD).
    pub storage_class: String,
    /// Placement location of the data (cluster identifier).
    #[serde(default)]
    pub location: String,
    /// Pool within the location.
    #[serde(default)]
    pub pool: String,
    /// Identifier of the stored blob in the blob store.
    #[serde(default)]
    pub object_id: String,
    /// Creation time, nanoseconds since the Unix epoch.
    pub create_time: u64,
    /// RFC 3339 last-modified timestamp.
    pub last_modified: String,
    /// Whether this record is a delete marker.
    #[serde(default)]
    pub delete_marker: bool,
    /// Part map, present only for multipart-assembled objects.
    /// Keys are 1-based part numbers.
    #[serde(default)]
    pub parts: BTreeMap<u32, Part>,
    /// User-defined metadata headers.
    #[serde(default)]
    pub user_metadata: HashMap<String, String>,
    /// Access control list (JSON-serialized).
    #[serde(default)]
    pub acl: String,
}

impl Object {
    /// Derive the version identifier for this object from its creation
    /// time.  Used when a write under Enabled versioning arrives without
    /// an assigned version.
    pub fn gen_version_id(&self) -> String {
        version_from_create_time(self.create_time)
    }
}

/// Metadata record for a single part, either staged under an in-progress
/// upload or attached to an assembled object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    /// Part number (1-based).
    pub part_number: u32,
    /// Size in bytes.
    pub size: u64,
    /// Quoted ETag string.
    pub etag: String,
    /// Identifier of the stored blob in the blob store.
    #[serde(default)]
    pub object_id: String,
    /// RFC 3339 last-modified timestamp.
    pub last_modified: String,
}

// ── Multipart uploads ───────────────────────────────────────────────

/// Metadata record for an in-progress multipart upload.
///
/// The part map mirrors the staged part rows; re-uploading a part number
/// replaces the previous entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Multipart {
    /// Bucket name.
    pub bucket: String,
    /// Object key the upload will materialize as.
    pub key: String,
    /// Unique upload identifier.
    pub upload_id: String,
    /// Canonical owner ID.
    pub owner_id: String,
    /// MIME content type of the future object.
    pub content_type: String,
    /// Storage class of the future object.
    pub storage_class: String,
    /// Placement location chosen at initiation.
    #[serde(default)]
    pub location: String,
    /// Pool within the location.
    #[serde(default)]
    pub pool: String,
    /// Access control list (JSON-serialized).
    #[serde(default)]
    pub acl: String,
    /// User-defined metadata headers.
    #[serde(default)]
    pub user_metadata: HashMap<String, String>,
    /// RFC 3339 initiation timestamp.
    pub initiated_at: String,
    /// Staged parts, keyed by 1-based part number.
    #[serde(default)]
    pub parts: BTreeMap<u32, Part>,
}

impl Multipart {
    /// Start a new upload for `bucket`/`key` with a fresh upload ID.
    pub fn new(bucket: &str, key: &str, owner_id: &str) -> Self {
        Multipart {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: uuid::Uuid::new_v4().simple().to_string(),
            owner_id: owner_id.to_string(),
            content_type: "application/octet-stream".to_string(),
            storage_class: "STANDARD".to_string(),
            location: String::new(),
            pool: String::new(),
            acl: String::new(),
            user_metadata: HashMap::new(),
            initiated_at: now_utc(),
            parts: BTreeMap::new(),
        }
    }

    /// Total size of all staged parts.
    pub fn total_size(&self) -> u64 {
        self.parts.values().map(|p| p.size).sum()
    }

    /// The assembled object's ETag: MD5 over the concatenated raw part
    /// digests, suffixed with the part count (the `"<hex>-N"` form).
    pub fn computed_etag(&self) -> String {
        let mut hasher = Md5::new();
        for part in self.parts.values() {
            let clean = part.etag.trim_matches('"');
            if let Ok(digest) = hex::decode(clean) {
                hasher.update(&digest);
            }
        }
        format!("\"{}-{}\"", hex::encode(hasher.finalize()), self.parts.len())
    }
}

// ── Garbage collection ──────────────────────────────────────────────

/// A garbage-collection queue entry.
///
/// Written in the same transaction as the metadata delete it describes;
/// carries everything the sweeper needs to remove the physical data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GarbageEntry {
    /// Bucket of the deleted object.
    pub bucket: String,
    /// Key of the deleted object.
    pub key: String,
    /// Version of the deleted record.
    #[serde(default)]
    pub version_id: String,
    /// Placement location of the data.
    #[serde(default)]
    pub location: String,
    /// Pool within the location.
    #[serde(default)]
    pub pool: String,
    /// Blob identifier of the object body.
    #[serde(default)]
    pub object_id: String,
    /// Size in bytes of the deleted data.
    pub size: u64,
    /// Part map for multipart-assembled objects, so each part's blob
    /// can be removed.
    #[serde(default)]
    pub parts: BTreeMap<u32, Part>,
    /// Enqueue time, nanoseconds since the Unix epoch.  Together with
    /// the object identity this addresses the queue entry.
    pub mtime: u64,
}

impl GarbageEntry {
    /// Build a GC entry describing `object`'s physical data.
    pub fn from_object(object: &Object) -> Self {
        GarbageEntry {
            bucket: object.bucket.clone(),
            key: object.key.clone(),
            version_id: object.version_id.clone(),
            location: object.location.clone(),
            pool: object.pool.clone(),
            object_id: object.object_id.clone(),
            size: object.size,
            parts: object.parts.clone(),
            mtime: now_nanos(),
        }
    }
}

// ── QoS ─────────────────────────────────────────────────────────────

/// Per-tenant QoS limits.  Non-positive fields fall back to the global
/// defaults at check time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UserQos {
    /// Read requests per second.
    #[serde(default)]
    pub read_qps: i64,
    /// Write requests per second.
    #[serde(default)]
    pub write_qps: i64,
    /// Download bandwidth in KB per second.
    #[serde(default)]
    pub bandwidth_kbps: i64,
}

// ── Request context ─────────────────────────────────────────────────

/// Per-request state assembled by the API layer before calling into the
/// engine: the resolved bucket and, for writes, whatever record already
/// exists at the target key's null version.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// The bucket the request addresses, if it exists.
    pub bucket_info: Option<Bucket>,
    /// The existing null-version record at the target key, if any.
    pub object_info: Option<Object>,
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_orders_newest_first() {
        let older = version_from_create_time(1_000);
        let newer = version_from_create_time(2_000);
        assert!(newer < older);
        assert_eq!(older.len(), 20);
        assert_eq!(newer.len(), 20);
    }

    #[test]
    fn test_versioning_mode_round_trip() {
        for mode in [
            VersioningMode::Disabled,
            VersioningMode::Suspended,
            VersioningMode::Enabled,
        ] {
            assert_eq!(mode.as_str().parse::<VersioningMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_versioning_mode_rejects_unknown() {
        let err = "Paused".parse::<VersioningMode>().unwrap_err();
        assert!(matches!(err, MetaError::InvalidVersioning { .. }));
    }

    #[test]
    fn test_multipart_new_upload_id_is_unique_hex() {
        let a = Multipart::new("bkt", "key", "owner");
        let b = Multipart::new("bkt", "key", "owner");
        assert_ne!(a.upload_id, b.upload_id);
        assert_eq!(a.upload_id.len(), 32);
        assert!(a.upload_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_computed_etag_has_part_count_suffix() {
        let mut mp = Multipart::new("bkt", "key", "owner");
        mp.parts.insert(
            1,
            Part {
                part_number: 1,
                size: 5,
                etag: "\"5d41402abc4b2a76b9719d911017c592\"".to_string(),
                object_id: "blob-1".to_string(),
                last_modified: "2026-02-23T00:00:00.000Z".to_string(),
            },
        );
        mp.parts.insert(
            2,
            Part {
                part_number: 2,
                size: 5,
                etag: "\"7d793037a0760186574b0282f2f435e7\"".to_string(),
                object_id: "blob-2".to_string(),
                last_modified: "2026-02-23T00:00:00.000Z".to_string(),
            },
        );
        let etag = mp.computed_etag();
        assert!(etag.starts_with('"'));
        assert!(etag.ends_with("-2\""));
    }

    #[test]
    fn test_total_size_sums_staged_parts() {
        let mut mp = Multipart::new("bkt", "key", "owner");
        for (n, size) in [(1u32, 100u64), (2, 250)] {
            mp.parts.insert(
                n,
                Part {
                    part_number: n,
                    size,
                    etag: format!("\"etag{n}\""),
                    object_id: format!("blob-{n}"),
                    last_modified: now_utc(),
                },
            );
        }
        assert_eq!(mp.total_size(), 350);
    }
}
