//! Object lifecycle: bucket lookups, cache-first reads, versioning-aware
//! writes, renames, and deletes with garbage-collection handoff.

use std::collections::{BTreeMap, HashMap};

use metrics::counter;

use crate::cache::CacheTable;
use crate::errors::MetaError;
use crate::metrics::GC_ENQUEUED_TOTAL;
use crate::types::{
    now_nanos, now_utc, Bucket, Multipart, Object, RequestContext, VersioningMode, NULL_VERSION,
};

use super::{cache_err, object_cache_key, Meta};

// ── Buckets ─────────────────────────────────────────────────────────

impl Meta {
    /// Cache-first bucket lookup.
    pub async fn get_bucket(&self, name: &str, will_need: bool) -> Result<Bucket, MetaError> {
        let fetch = move || async move { self.client.get_bucket(name).await };
        let bucket = self
            .cache
            .get(CacheTable::Bucket, name, fetch, will_need)
            .await
            .map_err(cache_err)?;
        bucket.ok_or_else(|| MetaError::NoSuchBucket {
            bucket: name.to_string(),
        })
    }

    /// Register a bucket row together with its owner-index entry.
    pub async fn put_bucket(&self, bucket: &Bucket) -> Result<(), MetaError> {
        self.client.put_bucket(bucket).await?;
        self.cache.remove(CacheTable::Bucket, &bucket.name);
        Ok(())
    }
}

// ── Object reads ────────────────────────────────────────────────────

impl Meta {
    /// Cache-first lookup of the null/latest unversioned record.
    ///
    /// A prefix-scanning backend can hand back a sibling key's record,
    /// so the returned identity is checked before use.
    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        will_need: bool,
    ) -> Result<Object, MetaError> {
        let fetch = move || async move { self.client.get_object(bucket, key, NULL_VERSION).await };
        let object = self
            .cache
            .get(
                CacheTable::Object,
                &object_cache_key(bucket, key, NULL_VERSION),
                fetch,
                will_need,
            )
            .await
            .map_err(cache_err)?;
        match object {
            Some(record) if record.bucket == bucket && record.key == key => Ok(record),
            _ => Err(MetaError::NoSuchKey {
                key: key.to_string(),
            }),
        }
    }

    /// Cache-first lookup of one version of a key.  An empty version
    /// resolves to the most recent record, null or versioned, through
    /// the backend's dedicated latest read.
    pub async fn get_versioned_object(
        &self,
        bucket: &str,
        key: &str,
        version: &str,
        will_need: bool,
    ) -> Result<Object, MetaError> {
        let fetch = move || async move {
            if version.is_empty() {
                self.client.get_latest_versioned_object(bucket, key).await
            } else {
                self.client.get_object(bucket, key, version).await
            }
        };
        let object = self
            .cache
            .get(
                CacheTable::Object,
                &object_cache_key(bucket, key, version),
                fetch,
                will_need,
            )
            .await
            .map_err(cache_err)?;
        match object {
            Some(record) if record.bucket == bucket && record.key == key => Ok(record),
            _ => Err(MetaError::NoSuchKey {
                key: key.to_string(),
            }),
        }
    }
}

// ── Object writes ───────────────────────────────────────────────────

impl Meta {
    /// Write an object record, dispatching on the owning bucket's
    /// versioning mode.
    ///
    /// Under `Disabled`/`Suspended` the write overwrites the null
    /// record in place when the request context carries an existing
    /// record, otherwise it inserts fresh.  Under `Enabled` every
    /// write creates a new version; an unassigned version id is derived
    /// from the creation time first.  `update_usage` is false when the
    /// bytes were already counted part by part (multipart completion);
    /// a multipart source additionally dissolves the upload's staging
    /// rows in the same transaction.
    pub async fn put_object(
        &self,
        ctx: &RequestContext,
        object: &mut Object,
        multipart: Option<&Multipart>,
        update_usage: bool,
    ) -> Result<(), MetaError> {
        let bucket = ctx
            .bucket_info
            .as_ref()
            .ok_or_else(|| MetaError::NoSuchBucket {
                bucket: object.bucket.clone(),
            })?;
        match bucket.versioning {
            VersioningMode::Disabled | VersioningMode::Suspended => {
                if ctx.object_info.is_some() {
                    match multipart {
                        Some(_) => {
                            self.client
                                .update_object(object, multipart, update_usage, None)
                                .await?
                        }
                        None => self.client.update_object_without_multipart(object).await?,
                    }
                } else {
                    match multipart {
                        Some(_) => {
                            self.client
                                .put_object(object, multipart, update_usage, None)
                                .await?
                        }
                        None => self.client.put_object_without_multipart(object).await?,
                    }
                }
            }
            VersioningMode::Enabled => {
                if object.version_id.is_empty() {
                    object.version_id = object.gen_version_id();
                }
                self.client
                    .put_versioned_object(object, multipart, update_usage, None)
                    .await?;
            }
        }
        self.invalidate_object(&object.bucket, &object.key, &object.version_id);
        Ok(())
    }

    /// ACL-only mutation of an existing record.
    pub async fn update_object_acl(&self, object: &Object) -> Result<(), MetaError> {
        self.client.update_object_acl(object).await?;
        self.invalidate_object(&object.bucket, &object.key, &object.version_id);
        Ok(())
    }

    /// Attribute-only mutation (content type, user metadata) of an
    /// existing record.
    pub async fn update_object_attrs(&self, object: &Object) -> Result<(), MetaError> {
        self.client.update_object_attrs(object).await?;
        self.invalidate_object(&object.bucket, &object.key, &object.version_id);
        Ok(())
    }

    /// Promote a staged identity to its final key.  The object row and
    /// any multipart staging rows under the source key move in one
    /// transaction, so a half-renamed object is never observable.
    pub async fn rename_object(&self, object: &Object, source_key: &str) -> Result<(), MetaError> {
        let mut tx = self.client.new_trans().await?;
        self.client
            .rename_object_part(object, source_key, Some(&mut tx))
            .await?;
        self.client
            .rename_object(object, source_key, Some(&mut tx))
            .await?;
        self.client.commit_trans(tx).await?;
        self.cache.remove(
            CacheTable::Object,
            &object_cache_key(&object.bucket, source_key, NULL_VERSION),
        );
        self.invalidate_object(&object.bucket, &object.key, &object.version_id);
        Ok(())
    }

    /// Append-style write: insert the record fresh, or overwrite it
    /// with the grown size and let the backend settle the usage growth.
    pub async fn append_object(&self, object: &Object, exists: bool) -> Result<(), MetaError> {
        if exists {
            self.client.update_append_object(object).await?;
        } else {
            self.client.put_object_without_multipart(object).await?;
        }
        self.invalidate_object(&object.bucket, &object.key, &object.version_id);
        Ok(())
    }
}

// ── Object deletes ──────────────────────────────────────────────────

impl Meta {
    /// Delete the null-version record: remove the row, enqueue a GC
    /// entry for its bytes, and return the bytes to the usage counter,
    /// all in one transaction.  Marker rows carry no bytes and skip the
    /// GC and usage steps.
    pub async fn delete_object(&self, object: &Object) -> Result<(), MetaError> {
        let mut tx = self.client.new_trans().await?;
        self.client.delete_object(object, Some(&mut tx)).await?;
        if !object.delete_marker {
            self.client
                .put_object_to_garbage_collection(object, Some(&mut tx))
                .await?;
            self.client
                .update_usage(&object.bucket, -(object.size as i64), Some(&mut tx))
                .await?;
        }
        self.client.commit_trans(tx).await?;
        if !object.delete_marker {
            counter!(GC_ENQUEUED_TOTAL).increment(1);
        }
        self.invalidate_object(&object.bucket, &object.key, NULL_VERSION);
        Ok(())
    }

    /// Delete the record at `object.version_id`, with the same GC and
    /// usage handling as [`Meta::delete_object`].
    pub async fn delete_versioned_object(&self, object: &Object) -> Result<(), MetaError> {
        let mut tx = self.client.new_trans().await?;
        self.client
            .delete_versioned_object(object, Some(&mut tx))
            .await?;
        if !object.delete_marker {
            self.client
                .put_object_to_garbage_collection(object, Some(&mut tx))
                .await?;
            self.client
                .update_usage(&object.bucket, -(object.size as i64), Some(&mut tx))
                .await?;
        }
        self.client.commit_trans(tx).await?;
        if !object.delete_marker {
            counter!(GC_ENQUEUED_TOTAL).increment(1);
        }
        self.invalidate_object(&object.bucket, &object.key, &object.version_id);
        Ok(())
    }

    /// Versioning-suspended delete.  When the null record exists and is
    /// not already a tombstone it is deleted with the usual GC and
    /// usage steps; a delete marker then takes its place at the null
    /// version.  The whole exchange is one transaction, so re-running
    /// on a marker only rewrites the marker.
    pub async fn delete_suspended_object(&self, object: &Object) -> Result<(), MetaError> {
        let reclaims_bytes = !object.delete_marker;
        let mut tx = self.client.new_trans().await?;
        if reclaims_bytes {
            self.client.delete_object(object, Some(&mut tx)).await?;
            self.client
                .put_object_to_garbage_collection(object, Some(&mut tx))
                .await?;
            self.client
                .update_usage(&object.bucket, -(object.size as i64), Some(&mut tx))
                .await?;
        }
        let marker = tombstone_of(object);
        self.client
            .add_delete_marker(&marker, NULL_VERSION, Some(&mut tx))
            .await?;
        self.client.commit_trans(tx).await?;
        if reclaims_bytes {
            counter!(GC_ENQUEUED_TOTAL).increment(1);
        }
        self.invalidate_object(&object.bucket, &object.key, NULL_VERSION);
        Ok(())
    }

    /// Insert a tombstone record at `version`.  Markers carry no bytes,
    /// so usage is untouched.
    pub async fn add_delete_marker(&self, object: &Object, version: &str) -> Result<(), MetaError> {
        self.client.add_delete_marker(object, version, None).await?;
        self.invalidate_object(&object.bucket, &object.key, version);
        Ok(())
    }

    /// Drop the cached record slots a mutation touched: the null/latest
    /// slot always, plus the exact version slot for versioned records.
    fn invalidate_object(&self, bucket: &str, key: &str, version: &str) {
        self.cache.remove(
            CacheTable::Object,
            &object_cache_key(bucket, key, NULL_VERSION),
        );
        if !version.is_empty() {
            self.cache
                .remove(CacheTable::Object, &object_cache_key(bucket, key, version));
        }
    }
}

/// The tombstone written in place of a deleted record: same identity,
/// no bytes, no blob reference, stamped with the deletion time.
fn tombstone_of(object: &Object) -> Object {
    let mut marker = object.clone();
    marker.size = 0;
    marker.etag = String::new();
    marker.object_id = String::new();
    marker.location = String::new();
    marker.pool = String::new();
    marker.parts = BTreeMap::new();
    marker.user_metadata = HashMap::new();
    marker.create_time = now_nanos();
    marker.last_modified = now_utc();
    marker.delete_marker = true;
    marker
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::client::MemoryClient;
    use crate::types::version_from_create_time;

    fn make_meta() -> Meta {
        Meta::new(Arc::new(MemoryClient::new()), 1024)
    }

    fn make_bucket(name: &str, versioning: VersioningMode) -> Bucket {
        Bucket {
            name: name.to_string(),
            owner_id: "tenant-a".to_string(),
            versioning,
            usage: 0,
            acl: String::new(),
            created_at: now_utc(),
        }
    }

    fn make_object(bucket: &str, key: &str, size: u64) -> Object {
        Object {
            bucket: bucket.to_string(),
            key: key.to_string(),
            version_id: String::new(),
            owner_id: "tenant-a".to_string(),
            size,
            etag: format!("\"etag-{size}\""),
            content_type: "application/octet-stream".to_string(),
            storage_class: "STANDARD".to_string(),
            location: "dc1".to_string(),
            pool: "tiger".to_string(),
            object_id: format!("blob-{key}-{size}"),
            create_time: now_nanos(),
            last_modified: now_utc(),
            delete_marker: false,
            parts: BTreeMap::new(),
            user_metadata: HashMap::new(),
            acl: String::new(),
        }
    }

    async fn seed_bucket(meta: &Meta, versioning: VersioningMode) -> Bucket {
        let bucket = make_bucket("photos", versioning);
        meta.put_bucket(&bucket).await.unwrap();
        bucket
    }

    async fn usage_of(meta: &Meta, name: &str) -> i64 {
        meta.client.get_bucket(name).await.unwrap().unwrap().usage
    }

    async fn gc_entries(meta: &Meta) -> usize {
        meta.client.scan_garbage_collection(64).await.unwrap().len()
    }

    #[tokio::test]
    async fn test_get_bucket_missing() {
        let meta = make_meta();
        let err = meta.get_bucket("ghost", true).await.unwrap_err();
        assert!(matches!(err, MetaError::NoSuchBucket { .. }));
    }

    #[tokio::test]
    async fn test_put_object_insert_counts_usage() {
        let meta = make_meta();
        let bucket = seed_bucket(&meta, VersioningMode::Disabled).await;
        let ctx = RequestContext {
            bucket_info: Some(bucket),
            object_info: None,
        };
        let mut object = make_object("photos", "a.jpg", 100);
        meta.put_object(&ctx, &mut object, None, true).await.unwrap();

        assert_eq!(usage_of(&meta, "photos").await, 100);
        let got = meta.get_object("photos", "a.jpg", true).await.unwrap();
        assert_eq!(got.size, 100);
        assert_eq!(got.etag, object.etag);
    }

    #[tokio::test]
    async fn test_put_object_without_bucket_context() {
        let meta = make_meta();
        let ctx = RequestContext::default();
        let mut object = make_object("photos", "a.jpg", 100);
        let err = meta
            .put_object(&ctx, &mut object, None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::NoSuchBucket { .. }));
    }

    #[tokio::test]
    async fn test_overwrite_adjusts_usage_by_delta() {
        let meta = make_meta();
        let bucket = seed_bucket(&meta, VersioningMode::Disabled).await;
        let insert_ctx = RequestContext {
            bucket_info: Some(bucket.clone()),
            object_info: None,
        };
        let mut first = make_object("photos", "a.jpg", 100);
        meta.put_object(&insert_ctx, &mut first, None, true)
            .await
            .unwrap();

        let existing = meta.get_object("photos", "a.jpg", true).await.unwrap();
        let update_ctx = RequestContext {
            bucket_info: Some(bucket),
            object_info: Some(existing),
        };
        let mut second = make_object("photos", "a.jpg", 40);
        meta.put_object(&update_ctx, &mut second, None, true)
            .await
            .unwrap();

        assert_eq!(usage_of(&meta, "photos").await, 40);
        let got = meta.get_object("photos", "a.jpg", true).await.unwrap();
        assert_eq!(got.size, 40);
    }

    #[tokio::test]
    async fn test_enabled_versioning_keeps_every_version() {
        let meta = make_meta();
        let bucket = seed_bucket(&meta, VersioningMode::Enabled).await;
        let ctx = RequestContext {
            bucket_info: Some(bucket),
            object_info: None,
        };

        let mut first = make_object("photos", "a.jpg", 4);
        let mut second = make_object("photos", "a.jpg", 6);
        second.create_time = first.create_time + 1_000;
        meta.put_object(&ctx, &mut first, None, true).await.unwrap();
        meta.put_object(&ctx, &mut second, None, true).await.unwrap();

        assert!(!first.version_id.is_empty());
        assert_ne!(first.version_id, second.version_id);
        assert_eq!(usage_of(&meta, "photos").await, 10);

        let v1 = meta
            .get_versioned_object("photos", "a.jpg", &first.version_id, true)
            .await
            .unwrap();
        assert_eq!(v1.size, 4);
        let latest = meta
            .get_versioned_object("photos", "a.jpg", "", true)
            .await
            .unwrap();
        assert_eq!(latest.size, 6);
    }

    #[tokio::test]
    async fn test_delete_object_enqueues_gc_once() {
        let meta = make_meta();
        let bucket = seed_bucket(&meta, VersioningMode::Disabled).await;
        let ctx = RequestContext {
            bucket_info: Some(bucket),
            object_info: None,
        };
        let mut object = make_object("photos", "a.jpg", 100);
        meta.put_object(&ctx, &mut object, None, true).await.unwrap();

        let record = meta.get_object("photos", "a.jpg", true).await.unwrap();
        meta.delete_object(&record).await.unwrap();

        let err = meta.get_object("photos", "a.jpg", true).await.unwrap_err();
        assert!(matches!(err, MetaError::NoSuchKey { .. }));
        assert_eq!(gc_entries(&meta).await, 1);
        assert_eq!(usage_of(&meta, "photos").await, 0);
    }

    #[tokio::test]
    async fn test_delete_missing_record_aborts_cleanly() {
        let meta = make_meta();
        seed_bucket(&meta, VersioningMode::Disabled).await;
        let err = meta
            .delete_object(&make_object("photos", "ghost.txt", 9))
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::Backend(_)));
        // The aborted transaction left neither a GC entry nor a usage
        // decrement behind.
        assert_eq!(gc_entries(&meta).await, 0);
        assert_eq!(usage_of(&meta, "photos").await, 0);
    }

    #[tokio::test]
    async fn test_suspended_delete_is_idempotent() {
        let meta = make_meta();
        let bucket = seed_bucket(&meta, VersioningMode::Suspended).await;
        let ctx = RequestContext {
            bucket_info: Some(bucket),
            object_info: None,
        };
        let mut object = make_object("photos", "a.jpg", 50);
        meta.put_object(&ctx, &mut object, None, true).await.unwrap();

        let record = meta.get_object("photos", "a.jpg", true).await.unwrap();
        meta.delete_suspended_object(&record).await.unwrap();
        assert_eq!(usage_of(&meta, "photos").await, 0);
        assert_eq!(gc_entries(&meta).await, 1);

        let marker = meta.get_object("photos", "a.jpg", true).await.unwrap();
        assert!(marker.delete_marker);
        assert_eq!(marker.size, 0);

        // Deleting again hits the tombstone: no new GC entry, no usage
        // change, marker still in place.
        meta.delete_suspended_object(&marker).await.unwrap();
        assert_eq!(usage_of(&meta, "photos").await, 0);
        assert_eq!(gc_entries(&meta).await, 1);
        let again = meta.get_object("photos", "a.jpg", true).await.unwrap();
        assert!(again.delete_marker);
    }

    #[tokio::test]
    async fn test_versioned_marker_delete_skips_gc_and_usage() {
        let meta = make_meta();
        let bucket = seed_bucket(&meta, VersioningMode::Enabled).await;
        let ctx = RequestContext {
            bucket_info: Some(bucket),
            object_info: None,
        };
        let mut object = make_object("photos", "a.jpg", 5);
        meta.put_object(&ctx, &mut object, None, true).await.unwrap();

        let mut marker = make_object("photos", "a.jpg", 0);
        marker.create_time = object.create_time + 1_000;
        let marker_version = version_from_create_time(marker.create_time);
        meta.add_delete_marker(&marker, &marker_version).await.unwrap();

        let stored = meta
            .get_versioned_object("photos", "a.jpg", &marker_version, true)
            .await
            .unwrap();
        assert!(stored.delete_marker);

        meta.delete_versioned_object(&stored).await.unwrap();
        assert_eq!(gc_entries(&meta).await, 0);
        assert_eq!(usage_of(&meta, "photos").await, 5);
        let err = meta
            .get_versioned_object("photos", "a.jpg", &marker_version, true)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::NoSuchKey { .. }));
    }

    #[tokio::test]
    async fn test_add_delete_marker_becomes_latest() {
        let meta = make_meta();
        let bucket = seed_bucket(&meta, VersioningMode::Enabled).await;
        let ctx = RequestContext {
            bucket_info: Some(bucket),
            object_info: None,
        };
        let mut object = make_object("photos", "a.jpg", 5);
        meta.put_object(&ctx, &mut object, None, true).await.unwrap();

        let mut marker = make_object("photos", "a.jpg", 0);
        marker.create_time = object.create_time + 1_000;
        let marker_version = version_from_create_time(marker.create_time);
        meta.add_delete_marker(&marker, &marker_version).await.unwrap();

        let latest = meta
            .get_versioned_object("photos", "a.jpg", "", true)
            .await
            .unwrap();
        assert!(latest.delete_marker);
        assert_eq!(latest.version_id, marker_version);
        // Markers carry no bytes.
        assert_eq!(usage_of(&meta, "photos").await, 5);
    }

    #[tokio::test]
    async fn test_rename_object_moves_record() {
        let meta = make_meta();
        let bucket = seed_bucket(&meta, VersioningMode::Disabled).await;
        let ctx = RequestContext {
            bucket_info: Some(bucket),
            object_info: None,
        };
        let mut staged = make_object("photos", "staging/tmp-1", 30);
        meta.put_object(&ctx, &mut staged, None, true).await.unwrap();

        let mut target = meta
            .get_object("photos", "staging/tmp-1", true)
            .await
            .unwrap();
        target.key = "final.jpg".to_string();
        meta.rename_object(&target, "staging/tmp-1").await.unwrap();

        let got = meta.get_object("photos", "final.jpg", true).await.unwrap();
        assert_eq!(got.size, 30);
        let err = meta
            .get_object("photos", "staging/tmp-1", true)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::NoSuchKey { .. }));
        assert_eq!(usage_of(&meta, "photos").await, 30);
    }

    #[tokio::test]
    async fn test_append_object_grows_usage() {
        let meta = make_meta();
        seed_bucket(&meta, VersioningMode::Disabled).await;

        let object = make_object("photos", "log.txt", 4);
        meta.append_object(&object, false).await.unwrap();
        assert_eq!(usage_of(&meta, "photos").await, 4);

        let mut grown = object.clone();
        grown.size = 10;
        meta.append_object(&grown, true).await.unwrap();
        assert_eq!(usage_of(&meta, "photos").await, 10);
        let got = meta.get_object("photos", "log.txt", true).await.unwrap();
        assert_eq!(got.size, 10);
    }

    #[tokio::test]
    async fn test_acl_update_invalidates_cached_record() {
        let meta = make_meta();
        let bucket = seed_bucket(&meta, VersioningMode::Disabled).await;
        let ctx = RequestContext {
            bucket_info: Some(bucket),
            object_info: None,
        };
        let mut object = make_object("photos", "a.jpg", 8);
        meta.put_object(&ctx, &mut object, None, true).await.unwrap();

        // Warm the cache, then mutate the ACL through the engine.
        let mut record = meta.get_object("photos", "a.jpg", true).await.unwrap();
        record.acl = "private".to_string();
        meta.update_object_acl(&record).await.unwrap();

        let got = meta.get_object("photos", "a.jpg", true).await.unwrap();
        assert_eq!(got.acl, "private");
    }

    #[tokio::test]
    async fn test_get_object_rejects_mismatched_record() {
        let meta = make_meta();
        seed_bucket(&meta, VersioningMode::Disabled).await;

        // Seed the cache slot with a record a prefix-scanning backend
        // could hand back for a near-miss lookup.
        let stray = make_object("photos", "a.jpg.bak", 7);
        meta.cache
            .get(
                CacheTable::Object,
                &object_cache_key("photos", "a.jpg", NULL_VERSION),
                move || async move { Ok::<_, anyhow::Error>(Some(stray)) },
                true,
            )
            .await
            .unwrap();

        let err = meta.get_object("photos", "a.jpg", true).await.unwrap_err();
        assert!(matches!(err, MetaError::NoSuchKey { .. }));
    }
}
