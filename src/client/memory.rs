//! In-memory metadata client.
//!
//! Stores every record as serialized JSON in one ordered map keyed by
//! the layout in [`keys`], so scans behave exactly like they would on a
//! raw ordered KV store.  Useful for tests and single-process setups.
//!
//! Commit applies the staged batch to a copy of the map and swaps it in
//! only when every operation succeeded, giving the same all-or-nothing
//! behavior as the SQLite backend.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::keys;
use super::{paginate_uploads, ListUploadsResult, MetaClient, TxOp};
use crate::types::{Bucket, GarbageEntry, Multipart, Object, Part, UserQos};

type KvMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Metadata client backed by an ordered in-memory map.
#[derive(Default)]
pub struct MemoryClient {
    data: Mutex<KvMap>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch atomically: run every op against a copy of the
    /// map, swap the copy in only if all of them succeeded.
    fn apply_batch(&self, ops: Vec<TxOp>) -> anyhow::Result<()> {
        let mut data = self.data.lock().expect("mutex poisoned");
        let mut staged = data.clone();
        for op in ops {
            apply_one(&mut staged, op)?;
        }
        *data = staged;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> anyhow::Result<T> {
    Ok(serde_json::from_slice(raw)?)
}

// ── Operation application ───────────────────────────────────────────

fn apply_one(map: &mut KvMap, op: TxOp) -> anyhow::Result<()> {
    match op {
        TxOp::InsertObject {
            object,
            update_usage,
        } => {
            map.insert(
                keys::object_key(&object.bucket, &object.key, &object.version_id),
                encode(&object)?,
            );
            if update_usage {
                bump_usage(map, &object.bucket, object.size as i64)?;
            }
            Ok(())
        }
        TxOp::ReplaceObject {
            object,
            count_new_size,
        } => {
            let old_size = stored_object_size(map, &object.bucket, &object.key, &object.version_id)?
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "object record vanished during overwrite: {}/{}",
                        object.bucket,
                        object.key
                    )
                })?;
            map.insert(
                keys::object_key(&object.bucket, &object.key, &object.version_id),
                encode(&object)?,
            );
            let delta = if count_new_size {
                object.size as i64 - old_size
            } else {
                -old_size
            };
            bump_usage(map, &object.bucket, delta)
        }
        TxOp::AppendObject { object } => {
            let old_size =
                stored_object_size(map, &object.bucket, &object.key, &object.version_id)?
                    .unwrap_or(0);
            map.insert(
                keys::object_key(&object.bucket, &object.key, &object.version_id),
                encode(&object)?,
            );
            bump_usage(map, &object.bucket, object.size as i64 - old_size)
        }
        TxOp::DeleteObject {
            bucket,
            key,
            version,
        } => {
            if map.remove(&keys::object_key(&bucket, &key, &version)).is_none() {
                anyhow::bail!("object record vanished during delete: {bucket}/{key}");
            }
            Ok(())
        }
        TxOp::RenameObject { object, source_key } => {
            let target = keys::object_key(&object.bucket, &object.key, "");
            if map.contains_key(&target) {
                anyhow::bail!(
                    "rename target already exists: {}/{}",
                    object.bucket,
                    object.key
                );
            }
            let raw = map
                .remove(&keys::object_key(&object.bucket, &source_key, ""))
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "source object record missing for rename: {}/{source_key}",
                        object.bucket
                    )
                })?;
            let mut record: Object = decode(&raw)?;
            record.key = object.key.clone();
            record.last_modified = object.last_modified.clone();
            map.insert(target, encode(&record)?);
            Ok(())
        }
        TxOp::RenameObjectParts {
            bucket,
            source_key,
            target_key,
        } => {
            let (start, end) = keys::upload_scan_range(&bucket);
            let mut staged = Vec::new();
            for (k, v) in map.range(start..end) {
                let upload: Multipart = decode(v)?;
                if upload.bucket == bucket && upload.key == source_key {
                    staged.push((k.clone(), upload));
                }
            }
            for (old_upload_key, mut upload) in staged {
                let (pstart, pend) =
                    keys::part_scan_range(&bucket, &source_key, &upload.upload_id);
                let mut parts = Vec::new();
                for (k, v) in map.range(pstart..pend) {
                    let part: Part = decode(v)?;
                    parts.push((k.clone(), part));
                }
                for (old_part_key, part) in parts {
                    map.remove(&old_part_key);
                    map.insert(
                        keys::part_key(&bucket, &target_key, &upload.upload_id, part.part_number),
                        encode(&part)?,
                    );
                }
                map.remove(&old_upload_key);
                upload.key = target_key.clone();
                map.insert(
                    keys::upload_key(&bucket, &target_key, &upload.upload_id),
                    encode(&upload)?,
                );
            }
            Ok(())
        }
        TxOp::PutGarbage { entry } => {
            map.insert(
                keys::gc_key(entry.mtime, &entry.bucket, &entry.key, &entry.version_id),
                encode(&entry)?,
            );
            Ok(())
        }
        TxOp::RemoveGarbage { entry } => {
            map.remove(&keys::gc_key(
                entry.mtime,
                &entry.bucket,
                &entry.key,
                &entry.version_id,
            ));
            Ok(())
        }
        TxOp::AdjustUsage { bucket, delta } => bump_usage(map, &bucket, delta),
        TxOp::CreateUpload { multipart } => {
            // Staged parts live in their own records.
            let mut record = multipart;
            record.parts = BTreeMap::new();
            map.insert(
                keys::upload_key(&record.bucket, &record.key, &record.upload_id),
                encode(&record)?,
            );
            Ok(())
        }
        TxOp::PutUploadPart {
            bucket,
            key,
            upload_id,
            part,
        } => {
            map.insert(
                keys::part_key(&bucket, &key, &upload_id, part.part_number),
                encode(&part)?,
            );
            Ok(())
        }
        TxOp::DeleteUpload {
            bucket,
            key,
            upload_id,
        } => {
            if map
                .remove(&keys::upload_key(&bucket, &key, &upload_id))
                .is_none()
            {
                anyhow::bail!("upload record vanished: {bucket}/{key} {upload_id}");
            }
            let (start, end) = keys::part_scan_range(&bucket, &key, &upload_id);
            let stale: Vec<Vec<u8>> = map.range(start..end).map(|(k, _)| k.clone()).collect();
            for k in stale {
                map.remove(&k);
            }
            Ok(())
        }
        TxOp::SetObjectAcl {
            bucket,
            key,
            version,
            acl,
        } => {
            let record_key = keys::object_key(&bucket, &key, &version);
            let raw = map.get(&record_key).ok_or_else(|| {
                anyhow::anyhow!("object record vanished during ACL update: {bucket}/{key}")
            })?;
            let mut record: Object = decode(raw)?;
            record.acl = acl;
            map.insert(record_key, encode(&record)?);
            Ok(())
        }
        TxOp::SetObjectAttrs {
            bucket,
            key,
            version,
            content_type,
            user_metadata,
        } => {
            let record_key = keys::object_key(&bucket, &key, &version);
            let raw = map.get(&record_key).ok_or_else(|| {
                anyhow::anyhow!("object record vanished during attribute update: {bucket}/{key}")
            })?;
            let mut record: Object = decode(raw)?;
            record.content_type = content_type;
            record.user_metadata = user_metadata;
            map.insert(record_key, encode(&record)?);
            Ok(())
        }
        TxOp::PutBucket { bucket } => {
            map.insert(keys::bucket_key(&bucket.name), encode(&bucket)?);
            map.insert(
                keys::user_bucket_key(&bucket.owner_id, &bucket.name),
                encode(&(bucket.owner_id.clone(), bucket.name.clone()))?,
            );
            Ok(())
        }
        TxOp::PutUserQos { owner_id, qos } => {
            map.insert(keys::qos_key(&owner_id), encode(&(owner_id, qos))?);
            Ok(())
        }
    }
}

/// Read the stored size of one object record, if present.
fn stored_object_size(
    map: &KvMap,
    bucket: &str,
    key: &str,
    version: &str,
) -> anyhow::Result<Option<i64>> {
    match map.get(&keys::object_key(bucket, key, version)) {
        Some(raw) => {
            let record: Object = decode(raw)?;
            Ok(Some(record.size as i64))
        }
        None => Ok(None),
    }
}

/// Add `delta` to a bucket's usage counter.
fn bump_usage(map: &mut KvMap, bucket: &str, delta: i64) -> anyhow::Result<()> {
    let bucket_key = keys::bucket_key(bucket);
    let raw = map
        .get(&bucket_key)
        .ok_or_else(|| anyhow::anyhow!("bucket vanished during usage update: {bucket}"))?;
    let mut record: Bucket = decode(raw)?;
    record.usage += delta;
    map.insert(bucket_key, encode(&record)?);
    Ok(())
}

// ── MetaClient implementation ───────────────────────────────────────

impl MetaClient for MemoryClient {
    fn apply_ops(
        &self,
        ops: Vec<TxOp>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move { self.apply_batch(ops) })
    }

    fn get_bucket(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Bucket>>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let data = self.data.lock().expect("mutex poisoned");
            match data.get(&keys::bucket_key(&name)) {
                Some(raw) => Ok(Some(decode(raw)?)),
                None => Ok(None),
            }
        })
    }

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Object>>> + Send + '_>> {
        let record_key = keys::object_key(bucket, key, version);
        Box::pin(async move {
            let data = self.data.lock().expect("mutex poisoned");
            match data.get(&record_key) {
                Some(raw) => Ok(Some(decode(raw)?)),
                None => Ok(None),
            }
        })
    }

    fn get_latest_versioned_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Object>>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let data = self.data.lock().expect("mutex poisoned");
            let (start, end) = keys::object_scan_range(&bucket, &key);
            let mut latest: Option<Object> = None;
            for (_, raw) in data.range(start..end) {
                let record: Object = decode(raw)?;
                // The range can overreach onto sibling keys that merely
                // extend this one; trust only verified records.
                if record.bucket != bucket || record.key != key {
                    continue;
                }
                if latest
                    .as_ref()
                    .map_or(true, |cur| record.create_time > cur.create_time)
                {
                    latest = Some(record);
                }
            }
            Ok(latest)
        })
    }

    fn get_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Multipart>>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let data = self.data.lock().expect("mutex poisoned");
            let Some(raw) = data.get(&keys::upload_key(&bucket, &key, &upload_id)) else {
                return Ok(None);
            };
            let mut upload: Multipart = decode(raw)?;
            let (start, end) = keys::part_scan_range(&bucket, &key, &upload_id);
            for (_, raw) in data.range(start..end) {
                let part: Part = decode(raw)?;
                upload.parts.insert(part.part_number, part);
            }
            Ok(Some(upload))
        })
    }

    fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
        key_marker: &str,
        upload_id_marker: &str,
        max_uploads: u32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ListUploadsResult>> + Send + '_>> {
        let bucket = bucket.to_string();
        let prefix = prefix.to_string();
        let delimiter = delimiter.to_string();
        let key_marker = key_marker.to_string();
        let upload_id_marker = upload_id_marker.to_string();
        Box::pin(async move {
            let data = self.data.lock().expect("mutex poisoned");
            let (start, end) = keys::upload_scan_range(&bucket);
            let mut rows = Vec::new();
            for (_, raw) in data.range(start..end) {
                let upload: Multipart = decode(raw)?;
                if upload.bucket == bucket {
                    rows.push(upload);
                }
            }
            Ok(paginate_uploads(
                rows,
                &prefix,
                &delimiter,
                &key_marker,
                &upload_id_marker,
                max_uploads,
            ))
        })
    }

    fn scan_garbage_collection(
        &self,
        max_keys: u32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<GarbageEntry>>> + Send + '_>> {
        Box::pin(async move {
            let data = self.data.lock().expect("mutex poisoned");
            let (start, end) = keys::gc_scan_range();
            let mut entries = Vec::new();
            for (_, raw) in data.range(start..end) {
                if entries.len() >= max_keys as usize {
                    break;
                }
                entries.push(decode(raw)?);
            }
            Ok(entries)
        })
    }

    fn get_all_user_buckets(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HashMap<String, String>>> + Send + '_>> {
        Box::pin(async move {
            let data = self.data.lock().expect("mutex poisoned");
            let (start, end) = keys::user_bucket_scan_range();
            let mut buckets = HashMap::new();
            for (_, raw) in data.range(start..end) {
                let (owner, bucket): (String, String) = decode(raw)?;
                buckets.insert(bucket, owner);
            }
            Ok(buckets)
        })
    }

    fn get_all_user_qos(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HashMap<String, UserQos>>> + Send + '_>> {
        Box::pin(async move {
            let data = self.data.lock().expect("mutex poisoned");
            let (start, end) = keys::qos_scan_range();
            let mut qos = HashMap::new();
            for (_, raw) in data.range(start..end) {
                let (owner, limits): (String, UserQos) = decode(raw)?;
                qos.insert(owner, limits);
            }
            Ok(qos)
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
