//! Abstract metadata client.
//!
//! Any metadata backend must implement [`MetaClient`].  The trait uses
//! `async_trait`-style methods (manual desugaring with pinned futures)
//! so it stays object-safe across local and remote stores.
//!
//! Backends implement only the point reads, the scans, and
//! [`MetaClient::apply_ops`], which applies a batch of [`TxOp`]s
//! atomically.  Everything else is provided: mutating methods accept
//! `tx: Option<&mut Transaction>` and either stage their operations
//! (with `Some`) or apply them immediately as a single-batch
//! transaction (with `None`).  Nothing staged reaches the backend
//! before [`MetaClient::commit_trans`].

pub mod keys;
pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::MetaConfig;
use crate::types::{Bucket, GarbageEntry, Multipart, Object, Part, UserQos};

pub use memory::MemoryClient;
pub use sqlite::SqliteClient;

// ── Transactions ────────────────────────────────────────────────────

/// One staged mutation.  Backends apply these at commit time; the
/// variants are the atoms every engine operation is composed of.
#[derive(Debug, Clone)]
pub enum TxOp {
    /// Write an object record at `object.version_id`; when
    /// `update_usage`, add `object.size` to the bucket usage counter.
    InsertObject { object: Object, update_usage: bool },
    /// Overwrite the record at `object.version_id`, reading the old
    /// record inside the transaction.  Usage changes by
    /// `new_size - old_size` when `count_new_size`, by `-old_size`
    /// otherwise (the new bytes were already counted part by part).
    ReplaceObject { object: Object, count_new_size: bool },
    /// Overwrite the record after an append, adjusting usage by the
    /// size growth read inside the transaction.
    AppendObject { object: Object },
    /// Remove one object record.  Applying to an absent record aborts
    /// the transaction.
    DeleteObject {
        bucket: String,
        key: String,
        version: String,
    },
    /// Move the null-version record stored under `source_key` to
    /// `object.key`.
    RenameObject { object: Object, source_key: String },
    /// Move the multipart staging area (upload records and their staged
    /// parts) from `source_key` to `target_key`.
    RenameObjectParts {
        bucket: String,
        source_key: String,
        target_key: String,
    },
    /// Enqueue a garbage-collection entry.
    PutGarbage { entry: GarbageEntry },
    /// Dequeue a garbage-collection entry.
    RemoveGarbage { entry: GarbageEntry },
    /// Add `delta` (signed) to a bucket's usage counter.
    AdjustUsage { bucket: String, delta: i64 },
    /// Write a multipart upload record.
    CreateUpload { multipart: Multipart },
    /// Insert or replace one staged part record.
    PutUploadPart {
        bucket: String,
        key: String,
        upload_id: String,
        part: Part,
    },
    /// Remove an upload record together with all its staged parts.
    /// Applying to an absent upload aborts the transaction.
    DeleteUpload {
        bucket: String,
        key: String,
        upload_id: String,
    },
    /// Update only the ACL of an existing object record.
    SetObjectAcl {
        bucket: String,
        key: String,
        version: String,
        acl: String,
    },
    /// Update only the mutable attributes of an existing object record.
    SetObjectAttrs {
        bucket: String,
        key: String,
        version: String,
        content_type: String,
        user_metadata: HashMap<String, String>,
    },
    /// Write a bucket record plus its owner-index entry.
    PutBucket { bucket: Bucket },
    /// Write a per-tenant QoS record.
    PutUserQos { owner_id: String, qos: UserQos },
}

/// A staged metadata transaction.
///
/// The buffer holds no backend resources, so dropping an uncommitted
/// transaction is the abort path: errors and panics between staging and
/// commit leave the backend untouched.
#[derive(Debug, Default)]
pub struct Transaction {
    pub(crate) ops: Vec<TxOp>,
}

impl Transaction {
    /// Stage one operation for the eventual commit.
    pub fn stage(&mut self, op: TxOp) {
        self.ops.push(op);
    }

    /// Number of staged operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing has been staged yet.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// ── List result types ───────────────────────────────────────────────

/// Result of a ListMultipartUploads operation.
///
/// Upload entries carry no staged parts; fetch an individual upload for
/// those.
#[derive(Debug, Clone, Default)]
pub struct ListUploadsResult {
    /// The in-progress uploads matching the query.
    pub uploads: Vec<Multipart>,
    /// Common prefixes when a delimiter is used.
    pub common_prefixes: Vec<String>,
    /// Whether the result set was truncated.
    pub is_truncated: bool,
    /// Next key marker for pagination, if truncated.
    pub next_key_marker: Option<String>,
    /// Next upload ID marker for pagination, if truncated.
    pub next_upload_id_marker: Option<String>,
}

// ── Trait ───────────────────────────────────────────────────────────

/// Async metadata backend contract.
///
/// Point reads return `Ok(None)` for absent records; the engine maps
/// those to its typed not-found errors.
pub trait MetaClient: Send + Sync + 'static {
    // ── Backend primitives ──────────────────────────────────────────

    /// Apply a batch of operations atomically: either every operation
    /// takes effect or none does.
    fn apply_ops(
        &self,
        ops: Vec<TxOp>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Get a bucket by name.
    fn get_bucket(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Bucket>>> + Send + '_>>;

    /// Get one object record.  `version == ""` addresses the null record.
    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Object>>> + Send + '_>>;

    /// Get the most recent record of a key, null or versioned,
    /// whichever has the later creation time.
    fn get_latest_versioned_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Object>>> + Send + '_>>;

    /// Get an upload together with its staged parts.
    fn get_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Multipart>>> + Send + '_>>;

    /// List in-progress uploads for a bucket, ordered by
    /// `(key, upload_id)`, with prefix/delimiter grouping and
    /// marker-driven pagination (see [`paginate_uploads`]).
    fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
        key_marker: &str,
        upload_id_marker: &str,
        max_uploads: u32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ListUploadsResult>> + Send + '_>>;

    /// Read up to `max_keys` pending GC entries, oldest first.
    fn scan_garbage_collection(
        &self,
        max_keys: u32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<GarbageEntry>>> + Send + '_>>;

    /// Enumerate the bucket-to-owner index.
    fn get_all_user_buckets(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HashMap<String, String>>> + Send + '_>>;

    /// Enumerate every per-tenant QoS record.
    fn get_all_user_qos(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HashMap<String, UserQos>>> + Send + '_>>;

    // ── Transactions ────────────────────────────────────────────────

    /// Begin a transaction.
    fn new_trans(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Transaction>> + Send + '_>> {
        Box::pin(async { Ok(Transaction::default()) })
    }

    /// Apply every staged operation atomically.
    fn commit_trans(
        &self,
        tx: Transaction,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move { self.apply_ops(tx.ops).await })
    }

    /// Discard a transaction without applying anything.
    fn abort_trans(
        &self,
        tx: Transaction,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        tracing::debug!(staged = tx.len(), "aborting metadata transaction");
        Box::pin(async { Ok(()) })
    }

    /// Stage `ops` into `tx`, or apply them immediately when no
    /// transaction is given.
    fn run_ops<'a>(
        &'a self,
        ops: Vec<TxOp>,
        tx: Option<&'a mut Transaction>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        match tx {
            Some(t) => {
                t.ops.extend(ops);
                Box::pin(async { Ok(()) })
            }
            None => self.apply_ops(ops),
        }
    }

    // ── Buckets ─────────────────────────────────────────────────────

    /// Insert or update a bucket record and its owner-index entry.
    fn put_bucket(
        &self,
        bucket: &Bucket,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        self.run_ops(
            vec![TxOp::PutBucket {
                bucket: bucket.clone(),
            }],
            None,
        )
    }

    /// Add `delta` (signed bytes) to a bucket's usage counter.
    fn update_usage<'a>(
        &'a self,
        bucket: &str,
        delta: i64,
        tx: Option<&'a mut Transaction>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        self.run_ops(
            vec![TxOp::AdjustUsage {
                bucket: bucket.to_string(),
                delta,
            }],
            tx,
        )
    }

    // ── Objects ─────────────────────────────────────────────────────

    /// Write a fresh object record at `object.version_id` (the null
    /// version for unversioned writes).  A multipart source dissolves
    /// the upload in the same transaction; `update_usage` adds the
    /// object size to the bucket counter.
    fn put_object<'a>(
        &'a self,
        object: &Object,
        multipart: Option<&Multipart>,
        update_usage: bool,
        tx: Option<&'a mut Transaction>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        let mut ops = vec![TxOp::InsertObject {
            object: object.clone(),
            update_usage,
        }];
        if let Some(mp) = multipart {
            ops.push(TxOp::DeleteUpload {
                bucket: mp.bucket.clone(),
                key: mp.key.clone(),
                upload_id: mp.upload_id.clone(),
            });
        }
        self.run_ops(ops, tx)
    }

    /// Overwrite an existing record in place, adjusting usage by the
    /// size delta (see [`TxOp::ReplaceObject`] for the exact contract).
    fn update_object<'a>(
        &'a self,
        object: &Object,
        multipart: Option<&Multipart>,
        update_usage: bool,
        tx: Option<&'a mut Transaction>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        let mut ops = vec![TxOp::ReplaceObject {
            object: object.clone(),
            count_new_size: update_usage,
        }];
        if let Some(mp) = multipart {
            ops.push(TxOp::DeleteUpload {
                bucket: mp.bucket.clone(),
                key: mp.key.clone(),
                upload_id: mp.upload_id.clone(),
            });
        }
        self.run_ops(ops, tx)
    }

    /// Write a new version record at `object.version_id` (which must be
    /// assigned), leaving prior versions untouched.
    fn put_versioned_object<'a>(
        &'a self,
        object: &Object,
        multipart: Option<&Multipart>,
        update_usage: bool,
        tx: Option<&'a mut Transaction>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        self.put_object(object, multipart, update_usage, tx)
    }

    /// Fast path for a fresh single-part object: write the record and
    /// add its size to usage.
    fn put_object_without_multipart(
        &self,
        object: &Object,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        self.run_ops(
            vec![TxOp::InsertObject {
                object: object.clone(),
                update_usage: true,
            }],
            None,
        )
    }

    /// Fast path for overwriting a single-part object in place; usage
    /// changes by `new_size - old_size`.
    fn update_object_without_multipart(
        &self,
        object: &Object,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        self.run_ops(
            vec![TxOp::ReplaceObject {
                object: object.clone(),
                count_new_size: true,
            }],
            None,
        )
    }

    /// Update only the ACL on an object record.
    fn update_object_acl(
        &self,
        object: &Object,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        self.run_ops(
            vec![TxOp::SetObjectAcl {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
                version: object.version_id.clone(),
                acl: object.acl.clone(),
            }],
            None,
        )
    }

    /// Update only the mutable attributes (content type, user metadata)
    /// on an object record.
    fn update_object_attrs(
        &self,
        object: &Object,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        self.run_ops(
            vec![TxOp::SetObjectAttrs {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
                version: object.version_id.clone(),
                content_type: object.content_type.clone(),
                user_metadata: object.user_metadata.clone(),
            }],
            None,
        )
    }

    /// Overwrite an object record after an append; usage changes by the
    /// size growth.
    fn update_append_object(
        &self,
        object: &Object,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        self.run_ops(
            vec![TxOp::AppendObject {
                object: object.clone(),
            }],
            None,
        )
    }

    /// Move the null-version record stored under `source_key` to
    /// `object.key`.
    fn rename_object<'a>(
        &'a self,
        object: &Object,
        source_key: &str,
        tx: Option<&'a mut Transaction>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        self.run_ops(
            vec![TxOp::RenameObject {
                object: object.clone(),
                source_key: source_key.to_string(),
            }],
            tx,
        )
    }

    /// Move the multipart staging area keyed under `source_key` to
    /// `object.key`.
    fn rename_object_part<'a>(
        &'a self,
        object: &Object,
        source_key: &str,
        tx: Option<&'a mut Transaction>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        self.run_ops(
            vec![TxOp::RenameObjectParts {
                bucket: object.bucket.clone(),
                source_key: source_key.to_string(),
                target_key: object.key.clone(),
            }],
            tx,
        )
    }

    /// Remove the null-version record of `object`.
    fn delete_object<'a>(
        &'a self,
        object: &Object,
        tx: Option<&'a mut Transaction>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        self.run_ops(
            vec![TxOp::DeleteObject {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
                version: String::new(),
            }],
            tx,
        )
    }

    /// Remove the record at `object.version_id`.
    fn delete_versioned_object<'a>(
        &'a self,
        object: &Object,
        tx: Option<&'a mut Transaction>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        self.run_ops(
            vec![TxOp::DeleteObject {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
                version: object.version_id.clone(),
            }],
            tx,
        )
    }

    /// Write `marker` as a delete-marker record at `version`.
    fn add_delete_marker<'a>(
        &'a self,
        marker: &Object,
        version: &str,
        tx: Option<&'a mut Transaction>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        let mut record = marker.clone();
        record.version_id = version.to_string();
        record.delete_marker = true;
        self.run_ops(
            vec![TxOp::InsertObject {
                object: record,
                update_usage: false,
            }],
            tx,
        )
    }

    // ── Garbage collection ──────────────────────────────────────────

    /// Enqueue a GC entry describing `object`'s physical data.
    fn put_object_to_garbage_collection<'a>(
        &'a self,
        object: &Object,
        tx: Option<&'a mut Transaction>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        self.run_ops(
            vec![TxOp::PutGarbage {
                entry: GarbageEntry::from_object(object),
            }],
            tx,
        )
    }

    /// Dequeue one GC entry after the sweeper has removed its data.
    fn remove_garbage_collection<'a>(
        &'a self,
        entry: &GarbageEntry,
        tx: Option<&'a mut Transaction>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        self.run_ops(
            vec![TxOp::RemoveGarbage {
                entry: entry.clone(),
            }],
            tx,
        )
    }

    // ── Multipart uploads ───────────────────────────────────────────

    /// Create a multipart upload record.
    fn create_multipart(
        &self,
        multipart: &Multipart,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        self.run_ops(
            vec![TxOp::CreateUpload {
                multipart: multipart.clone(),
            }],
            None,
        )
    }

    /// Insert or replace one staged part record.
    fn put_object_part<'a>(
        &'a self,
        multipart: &Multipart,
        part: &Part,
        tx: Option<&'a mut Transaction>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        self.run_ops(
            vec![TxOp::PutUploadPart {
                bucket: multipart.bucket.clone(),
                key: multipart.key.clone(),
                upload_id: multipart.upload_id.clone(),
                part: part.clone(),
            }],
            tx,
        )
    }

    /// Remove an upload record and all its staged parts.
    fn delete_multipart<'a>(
        &'a self,
        multipart: &Multipart,
        tx: Option<&'a mut Transaction>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        self.run_ops(
            vec![TxOp::DeleteUpload {
                bucket: multipart.bucket.clone(),
                key: multipart.key.clone(),
                upload_id: multipart.upload_id.clone(),
            }],
            tx,
        )
    }

    // ── QoS bootstrap ───────────────────────────────────────────────

    /// Write a per-tenant QoS record.
    fn put_user_qos(
        &self,
        owner_id: &str,
        qos: &UserQos,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        self.run_ops(
            vec![TxOp::PutUserQos {
                owner_id: owner_id.to_string(),
                qos: *qos,
            }],
            None,
        )
    }
}

// ── Backend selection ───────────────────────────────────────────────

/// Build the configured metadata client.
pub fn from_config(config: &MetaConfig) -> anyhow::Result<Arc<dyn MetaClient>> {
    match config.backend.as_str() {
        "sqlite" => Ok(Arc::new(SqliteClient::new(&config.sqlite.path)?)),
        "memory" => Ok(Arc::new(MemoryClient::new())),
        other => anyhow::bail!("unknown metadata backend: {other}"),
    }
}

// ── Upload listing pagination ───────────────────────────────────────

/// Apply prefix/marker filtering, delimiter grouping, and truncation to
/// upload rows already ordered by `(key, upload_id)`.
///
/// Both backends feed their raw scans through this, so pagination
/// behaves identically regardless of storage.  Resumption is purely
/// marker-driven: rows grouped under a prefix at or before the key
/// marker were emitted on an earlier page and are skipped.
pub(crate) fn paginate_uploads(
    rows: Vec<Multipart>,
    prefix: &str,
    delimiter: &str,
    key_marker: &str,
    upload_id_marker: &str,
    max_uploads: u32,
) -> ListUploadsResult {
    let max = max_uploads as usize;
    let mut result = ListUploadsResult::default();

    for row in rows {
        if !row.key.starts_with(prefix) {
            continue;
        }

        // Delimiter grouping: everything sharing the first delimiter
        // past the prefix collapses into one common-prefix entry.
        if !delimiter.is_empty() {
            let rest = &row.key[prefix.len()..];
            if let Some(idx) = rest.find(delimiter) {
                let group = format!("{prefix}{}{delimiter}", &rest[..idx]);
                if !key_marker.is_empty() && group.as_str() <= key_marker {
                    continue;
                }
                if result.common_prefixes.last() == Some(&group) {
                    continue;
                }
                if result.uploads.len() + result.common_prefixes.len() >= max {
                    result.is_truncated = true;
                    break;
                }
                result.next_key_marker = Some(group.clone());
                result.next_upload_id_marker = None;
                result.common_prefixes.push(group);
                continue;
            }
        }

        // Marker filtering for plain upload entries.
        if !key_marker.is_empty()
            && (row.key.as_str(), row.upload_id.as_str()) <= (key_marker, upload_id_marker)
        {
            continue;
        }

        if result.uploads.len() + result.common_prefixes.len() >= max {
            result.is_truncated = true;
            break;
        }
        result.next_key_marker = Some(row.key.clone());
        result.next_upload_id_marker = Some(row.upload_id.clone());
        result.uploads.push(row);
    }

    if !result.is_truncated {
        result.next_key_marker = None;
        result.next_upload_id_marker = None;
    }
    result
}

// ── Tests ───────────────────────────────────────────────────────────
