//! Composite-key codec for ordered-KV metadata backends.
//!
//! Every record kind lives under a single-letter table prefix; key
//! components are joined with byte 92 (`\`).  The encoding is chosen so
//! that a lexicographic range scan walks records in a useful order:
//! object versions newest-first (see
//! [`crate::types::version_from_create_time`]), multipart uploads by
//! `(key, upload_id)`, parts by zero-padded part number.

/// Storage cluster registry records.
pub const TABLE_CLUSTER_PREFIX: &str = "c";
/// Bucket records; object records nest under the bucket component.
pub const TABLE_BUCKET_PREFIX: &str = "b";
/// Owner-to-bucket index records.
pub const TABLE_USER_BUCKET_PREFIX: &str = "u";
/// Multipart upload records.
pub const TABLE_MULTIPART_PREFIX: &str = "m";
/// Staged part records.
pub const TABLE_OBJECT_PART_PREFIX: &str = "p";
/// Lifecycle configuration records.
pub const TABLE_LIFECYCLE_PREFIX: &str = "l";
/// Garbage-collection queue records.
pub const TABLE_GC_PREFIX: &str = "g";
/// Per-tenant QoS limit records.
pub const TABLE_QOS_PREFIX: &str = "q";

/// Separator between key components (byte 92, `\`).
pub const TABLE_SEPARATOR: u8 = 92;

/// Upper-bound byte for range scans.  Components are UTF-8 text, which
/// never contains 0xFF, so `prefix + 0xFF` bounds every key under
/// `prefix`.
pub const TABLE_MAX_KEY_SUFFIX: u8 = 0xFF;

/// Join `components` under `prefix` with the table separator.
pub fn encode_key(prefix: &str, components: &[&str]) -> Vec<u8> {
    let mut key = Vec::with_capacity(
        prefix.len() + components.iter().map(|c| c.len() + 1).sum::<usize>(),
    );
    key.extend_from_slice(prefix.as_bytes());
    for component in components {
        key.push(TABLE_SEPARATOR);
        key.extend_from_slice(component.as_bytes());
    }
    key
}

/// Inclusive range covering every key that extends `base` by at least
/// one more component.
pub fn scan_range(base: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut start = base.to_vec();
    start.push(TABLE_SEPARATOR);
    let mut end = base.to_vec();
    end.push(TABLE_MAX_KEY_SUFFIX);
    (start, end)
}

// ── Key builders ────────────────────────────────────────────────────

pub fn bucket_key(bucket: &str) -> Vec<u8> {
    encode_key(TABLE_BUCKET_PREFIX, &[bucket])
}

/// Object record key.  The null version (`""`) omits the version
/// component, so the null record sorts before every versioned record of
/// the same key and a bounded scan sees it first.
pub fn object_key(bucket: &str, key: &str, version: &str) -> Vec<u8> {
    if version.is_empty() {
        encode_key(TABLE_BUCKET_PREFIX, &[bucket, key])
    } else {
        encode_key(TABLE_BUCKET_PREFIX, &[bucket, key, version])
    }
}

/// Inclusive range covering the null record and every versioned record
/// of `bucket`/`key`.
///
/// The upper bound also admits sibling keys that merely extend `key`
/// (`photos` vs `photos2`); scanners must verify the decoded record's
/// key before trusting a row.
pub fn object_scan_range(bucket: &str, key: &str) -> (Vec<u8>, Vec<u8>) {
    let start = object_key(bucket, key, "");
    let mut end = start.clone();
    end.push(TABLE_SEPARATOR);
    end.push(TABLE_MAX_KEY_SUFFIX);
    (start, end)
}

pub fn user_bucket_key(owner_id: &str, bucket: &str) -> Vec<u8> {
    encode_key(TABLE_USER_BUCKET_PREFIX, &[owner_id, bucket])
}

/// Range covering the whole owner-to-bucket index.
pub fn user_bucket_scan_range() -> (Vec<u8>, Vec<u8>) {
    scan_range(TABLE_USER_BUCKET_PREFIX.as_bytes())
}

pub fn upload_key(bucket: &str, key: &str, upload_id: &str) -> Vec<u8> {
    encode_key(TABLE_MULTIPART_PREFIX, &[bucket, key, upload_id])
}

/// Range covering every upload in `bucket`, ordered by `(key, upload_id)`.
pub fn upload_scan_range(bucket: &str) -> (Vec<u8>, Vec<u8>) {
    scan_range(&encode_key(TABLE_MULTIPART_PREFIX, &[bucket]))
}

/// Staged part record key; the part number is zero-padded so numeric and
/// lexicographic order agree.
pub fn part_key(bucket: &str, key: &str, upload_id: &str, part_number: u32) -> Vec<u8> {
    encode_key(
        TABLE_OBJECT_PART_PREFIX,
        &[bucket, key, upload_id, &format!("{part_number:05}")],
    )
}

/// Range covering every staged part of one upload.
pub fn part_scan_range(bucket: &str, key: &str, upload_id: &str) -> (Vec<u8>, Vec<u8>) {
    scan_range(&encode_key(TABLE_OBJECT_PART_PREFIX, &[bucket, key, upload_id]))
}

/// Range covering every staged part of every upload under `key`.
/// Used when renaming an object's staging area.
pub fn object_parts_scan_range(bucket: &str, key: &str) -> (Vec<u8>, Vec<u8>) {
    scan_range(&encode_key(TABLE_OBJECT_PART_PREFIX, &[bucket, key]))
}

/// GC queue key, ordered by enqueue time so the sweeper drains
/// oldest-first.
pub fn gc_key(mtime_nanos: u64, bucket: &str, key: &str, version: &str) -> Vec<u8> {
    encode_key(
        TABLE_GC_PREFIX,
        &[&format!("{mtime_nanos:020}"), bucket, key, version],
    )
}

/// Range covering the whole GC queue.
pub fn gc_scan_range() -> (Vec<u8>, Vec<u8>) {
    scan_range(TABLE_GC_PREFIX.as_bytes())
}

pub fn qos_key(owner_id: &str) -> Vec<u8> {
    encode_key(TABLE_QOS_PREFIX, &[owner_id])
}

/// Range covering every per-tenant QoS record.
pub fn qos_scan_range() -> (Vec<u8>, Vec<u8>) {
    scan_range(TABLE_QOS_PREFIX.as_bytes())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::version_from_create_time;

    #[test]
    fn test_null_record_sorts_before_versions() {
        let null = object_key("bkt", "photos", "");
        let versioned = object_key("bkt", "photos", &version_from_create_time(1_000));
        assert!(null < versioned);
    }

    #[test]
    fn test_newer_version_sorts_first() {
        let older = object_key("bkt", "k", &version_from_create_time(1_000));
        let newer = object_key("bkt", "k", &version_from_create_time(9_999));
        assert!(newer < older);
    }

    #[test]
    fn test_object_scan_range_covers_all_versions() {
        let (start, end) = object_scan_range("bkt", "k");
        let null = object_key("bkt", "k", "");
        let versioned = object_key("bkt", "k", &version_from_create_time(5));
        assert!(start <= null && null <= end);
        assert!(start <= versioned && versioned <= end);
        // A different key entirely is outside the range.
        let other = object_key("bkt", "j", "");
        assert!(other < start || other > end);
    }

    #[test]
    fn test_upload_keys_order_by_key_then_upload_id() {
        let a = upload_key("bkt", "alpha", "zzz");
        let b = upload_key("bkt", "beta", "aaa");
        let c = upload_key("bkt", "beta", "bbb");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_part_keys_order_numerically() {
        let p2 = part_key("bkt", "k", "upload", 2);
        let p10 = part_key("bkt", "k", "upload", 10);
        assert!(p2 < p10);
    }

    #[test]
    fn test_scan_range_excludes_sibling_tables() {
        let (start, end) = upload_scan_range("bkt");
        let part = part_key("bkt", "k", "upload", 1);
        assert!(part < start || part > end);
    }
}
