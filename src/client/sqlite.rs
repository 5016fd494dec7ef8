//! SQLite-backed metadata client.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`.
//!
//! Transactions map onto SQLite directly: a committed [`TxOp`] batch
//! runs inside `BEGIN IMMEDIATE .. COMMIT`, and any failing operation
//! rolls the whole batch back.  Usage deltas that depend on the record
//! being replaced (overwrites, appends) read the old row inside that
//! same transaction, so concurrent writers cannot skew the counters.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::{paginate_uploads, ListUploadsResult, MetaClient, TxOp};
use crate::types::{Bucket, GarbageEntry, Multipart, Object, Part, UserQos, VersioningMode};

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

/// Metadata client backed by a single SQLite database file.
pub struct SqliteClient {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteClient {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let client = Self {
            conn: Mutex::new(conn),
        };
        client.apply_pragmas()?;
        client.init_db()?;
        Ok(client)
    }

    /// Apply recommended SQLite pragmas for performance and safety.
    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables if they do not already exist.
    /// This is idempotent -- safe to call on every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );

            -- Buckets
            CREATE TABLE IF NOT EXISTS buckets (
                name        TEXT PRIMARY KEY,
                owner_id    TEXT NOT NULL,
                versioning  TEXT NOT NULL DEFAULT 'Disabled',
                usage       INTEGER NOT NULL DEFAULT 0,
                acl         TEXT NOT NULL DEFAULT '',
                created_at  TEXT NOT NULL
            );

            -- Object versions; version_id = '' is the null record.
            CREATE TABLE IF NOT EXISTS objects (
                bucket        TEXT NOT NULL,
                key           TEXT NOT NULL,
                version_id    TEXT NOT NULL DEFAULT '',
                owner_id      TEXT NOT NULL,
                size          INTEGER NOT NULL,
                etag          TEXT NOT NULL,
                content_type  TEXT NOT NULL DEFAULT 'application/octet-stream',
                storage_class TEXT NOT NULL DEFAULT 'STANDARD',
                location      TEXT NOT NULL DEFAULT '',
                pool          TEXT NOT NULL DEFAULT '',
                object_id     TEXT NOT NULL DEFAULT '',
                create_time   INTEGER NOT NULL,
                last_modified TEXT NOT NULL,
                delete_marker INTEGER NOT NULL DEFAULT 0,
                parts         TEXT NOT NULL DEFAULT '{}',
                user_metadata TEXT NOT NULL DEFAULT '{}',
                acl           TEXT NOT NULL DEFAULT '',

                PRIMARY KEY (bucket, key, version_id),
                FOREIGN KEY (bucket) REFERENCES buckets(name) ON DELETE CASCADE
            );

            -- Multipart uploads
            CREATE TABLE IF NOT EXISTS multipart_uploads (
                bucket        TEXT NOT NULL,
                key           TEXT NOT NULL,
                upload_id     TEXT NOT NULL,
                owner_id      TEXT NOT NULL,
                content_type  TEXT NOT NULL DEFAULT 'application/octet-stream',
                storage_class TEXT NOT NULL DEFAULT 'STANDARD',
                location      TEXT NOT NULL DEFAULT '',
                pool          TEXT NOT NULL DEFAULT '',
                acl           TEXT NOT NULL DEFAULT '',
                user_metadata TEXT NOT NULL DEFAULT '{}',
                initiated_at  TEXT NOT NULL,

                PRIMARY KEY (bucket, key, upload_id),
                FOREIGN KEY (bucket) REFERENCES buckets(name) ON DELETE CASCADE
            );

            -- Staged parts of in-progress uploads.  Maintained explicitly
            -- alongside multipart_uploads (no foreign key: the parent key
            -- is composite and both tables move together on rename).
            CREATE TABLE IF NOT EXISTS multipart_parts (
                bucket        TEXT NOT NULL,
                key           TEXT NOT NULL,
                upload_id     TEXT NOT NULL,
                part_number   INTEGER NOT NULL,
                size          INTEGER NOT NULL,
                etag          TEXT NOT NULL,
                object_id     TEXT NOT NULL DEFAULT '',
                last_modified TEXT NOT NULL,

                PRIMARY KEY (bucket, key, upload_id, part_number)
            );

            -- Bucket ownership index, scanned by the QoS refresher.
            CREATE TABLE IF NOT EXISTS user_buckets (
                owner_id  TEXT NOT NULL,
                bucket    TEXT NOT NULL,

                PRIMARY KEY (owner_id, bucket)
            );

            -- Per-tenant QoS limits.
            CREATE TABLE IF NOT EXISTS user_qos (
                owner_id        TEXT PRIMARY KEY,
                read_qps        INTEGER NOT NULL DEFAULT 0,
                write_qps       INTEGER NOT NULL DEFAULT 0,
                bandwidth_kbps  INTEGER NOT NULL DEFAULT 0
            );

            -- Garbage-collection queue, scanned oldest first.
            CREATE TABLE IF NOT EXISTS gc (
                mtime      INTEGER NOT NULL,
                bucket     TEXT NOT NULL,
                key        TEXT NOT NULL,
                version_id TEXT NOT NULL DEFAULT '',
                location   TEXT NOT NULL DEFAULT '',
                pool       TEXT NOT NULL DEFAULT '',
                object_id  TEXT NOT NULL DEFAULT '',
                size       INTEGER NOT NULL,
                parts      TEXT NOT NULL DEFAULT '{}',

                PRIMARY KEY (mtime, bucket, key, version_id)
            );
            ",
        )?;

        // Record schema version if not already present.
        let existing: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();

        if existing.is_none() || existing.unwrap() < SCHEMA_VERSION {
            let now = crate::types::now_utc();
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now],
            )?;
        }

        Ok(())
    }

    /// Apply a batch atomically: `BEGIN IMMEDIATE`, each op in order,
    /// `ROLLBACK` on the first failure.
    fn apply_batch(&self, ops: Vec<TxOp>) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch("BEGIN IMMEDIATE")?;
        for op in ops {
            if let Err(e) = apply_one(&conn, op) {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        }
        conn.execute_batch("COMMIT")?;
        Ok(())
    }
}

// ── Operation application ───────────────────────────────────────────

/// Apply a single staged operation on an open transaction.
fn apply_one(conn: &Connection, op: TxOp) -> anyhow::Result<()> {
    match op {
        TxOp::InsertObject {
            object,
            update_usage,
        } => {
            insert_object_row(conn, &object)?;
            if update_usage {
                bump_usage(conn, &object.bucket, object.size as i64)?;
            }
            Ok(())
        }
        TxOp::ReplaceObject {
            object,
            count_new_size,
        } => {
            let old_size = object_size(conn, &object.bucket, &object.key, &object.version_id)?
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "object record vanished during overwrite: {}/{}",
                        object.bucket,
                        object.key
                    )
                })?;
            insert_object_row(conn, &object)?;
            let delta = if count_new_size {
                object.size as i64 - old_size
            } else {
                -old_size
            };
            bump_usage(conn, &object.bucket, delta)
        }
        TxOp::AppendObject { object } => {
            let old_size =
                object_size(conn, &object.bucket, &object.key, &object.version_id)?.unwrap_or(0);
            insert_object_row(conn, &object)?;
            bump_usage(conn, &object.bucket, object.size as i64 - old_size)
        }
        TxOp::DeleteObject {
            bucket,
            key,
            version,
        } => {
            let affected = conn.execute(
                "DELETE FROM objects WHERE bucket = ?1 AND key = ?2 AND version_id = ?3",
                params![bucket, key, version],
            )?;
            if affected == 0 {
                anyhow::bail!("object record vanished during delete: {bucket}/{key}");
            }
            Ok(())
        }
        TxOp::RenameObject { object, source_key } => {
            let affected = conn.execute(
                "UPDATE objects SET key = ?1, last_modified = ?2
                 WHERE bucket = ?3 AND key = ?4 AND version_id = ''",
                params![object.key, object.last_modified, object.bucket, source_key],
            )?;
            if affected == 0 {
                anyhow::bail!(
                    "source object record missing for rename: {}/{source_key}",
                    object.bucket
                );
            }
            Ok(())
        }
        TxOp::RenameObjectParts {
            bucket,
            source_key,
            target_key,
        } => {
            conn.execute(
                "UPDATE multipart_uploads SET key = ?1 WHERE bucket = ?2 AND key = ?3",
                params![target_key, bucket, source_key],
            )?;
            conn.execute(
                "UPDATE multipart_parts SET key = ?1 WHERE bucket = ?2 AND key = ?3",
                params![target_key, bucket, source_key],
            )?;
            Ok(())
        }
        TxOp::PutGarbage { entry } => {
            conn.execute(
                "INSERT OR REPLACE INTO gc
                    (mtime, bucket, key, version_id, location, pool, object_id, size, parts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.mtime as i64,
                    entry.bucket,
                    entry.key,
                    entry.version_id,
                    entry.location,
                    entry.pool,
                    entry.object_id,
                    entry.size as i64,
                    serialize_parts(&entry.parts),
                ],
            )?;
            Ok(())
        }
        TxOp::RemoveGarbage { entry } => {
            conn.execute(
                "DELETE FROM gc
                 WHERE mtime = ?1 AND bucket = ?2 AND key = ?3 AND version_id = ?4",
                params![entry.mtime as i64, entry.bucket, entry.key, entry.version_id],
            )?;
            Ok(())
        }
        TxOp::AdjustUsage { bucket, delta } => bump_usage(conn, &bucket, delta),
        TxOp::CreateUpload { multipart } => {
            conn.execute(
                "INSERT OR REPLACE INTO multipart_uploads
                    (bucket, key, upload_id, owner_id, content_type, storage_class,
                     location, pool, acl, user_metadata, initiated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    multipart.bucket,
                    multipart.key,
                    multipart.upload_id,
                    multipart.owner_id,
                    multipart.content_type,
                    multipart.storage_class,
                    multipart.location,
                    multipart.pool,
                    multipart.acl,
                    serialize_user_metadata(&multipart.user_metadata),
                    multipart.initiated_at,
                ],
            )?;
            Ok(())
        }
        TxOp::PutUploadPart {
            bucket,
            key,
            upload_id,
            part,
        } => {
            conn.execute(
                "INSERT OR REPLACE INTO multipart_parts
                    (bucket, key, upload_id, part_number, size, etag, object_id, last_modified)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    bucket,
                    key,
                    upload_id,
                    part.part_number,
                    part.size as i64,
                    part.etag,
                    part.object_id,
                    part.last_modified,
                ],
            )?;
            Ok(())
        }
        TxOp::DeleteUpload {
            bucket,
            key,
            upload_id,
        } => {
            conn.execute(
                "DELETE FROM multipart_parts
                 WHERE bucket = ?1 AND key = ?2 AND upload_id = ?3",
                params![bucket, key, upload_id],
            )?;
            let affected = conn.execute(
                "DELETE FROM multipart_uploads
                 WHERE bucket = ?1 AND key = ?2 AND upload_id = ?3",
                params![bucket, key, upload_id],
            )?;
            if affected == 0 {
                anyhow::bail!("upload record vanished: {bucket}/{key} {upload_id}");
            }
            Ok(())
        }
        TxOp::SetObjectAcl {
            bucket,
            key,
            version,
            acl,
        } => {
            let affected = conn.execute(
                "UPDATE objects SET acl = ?1
                 WHERE bucket = ?2 AND key = ?3 AND version_id = ?4",
                params![acl, bucket, key, version],
            )?;
            if affected == 0 {
                anyhow::bail!("object record vanished during ACL update: {bucket}/{key}");
            }
            Ok(())
        }
        TxOp::SetObjectAttrs {
            bucket,
            key,
            version,
            content_type,
            user_metadata,
        } => {
            let affected = conn.execute(
                "UPDATE objects SET content_type = ?1, user_metadata = ?2
                 WHERE bucket = ?3 AND key = ?4 AND version_id = ?5",
                params![
                    content_type,
                    serialize_user_metadata(&user_metadata),
                    bucket,
                    key,
                    version
                ],
            )?;
            if affected == 0 {
                anyhow::bail!("object record vanished during attribute update: {bucket}/{key}");
            }
            Ok(())
        }
        TxOp::PutBucket { bucket } => {
            conn.execute(
                "INSERT OR REPLACE INTO buckets
                    (name, owner_id, versioning, usage, acl, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    bucket.name,
                    bucket.owner_id,
                    bucket.versioning.as_str(),
                    bucket.usage,
                    bucket.acl,
                    bucket.created_at,
                ],
            )?;
            conn.execute(
                "INSERT OR REPLACE INTO user_buckets (owner_id, bucket) VALUES (?1, ?2)",
                params![bucket.owner_id, bucket.name],
            )?;
            Ok(())
        }
        TxOp::PutUserQos { owner_id, qos } => {
            conn.execute(
                "INSERT OR REPLACE INTO user_qos
                    (owner_id, read_qps, write_qps, bandwidth_kbps)
                 VALUES (?1, ?2, ?3, ?4)",
                params![owner_id, qos.read_qps, qos.write_qps, qos.bandwidth_kbps],
            )?;
            Ok(())
        }
    }
}

/// Insert or replace one object record.
fn insert_object_row(conn: &Connection, object: &Object) -> anyhow::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO objects
            (bucket, key, version_id, owner_id, size, etag, content_type,
             storage_class, location, pool, object_id, create_time,
             last_modified, delete_marker, parts, user_metadata, acl)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            object.bucket,
            object.key,
            object.version_id,
            object.owner_id,
            object.size as i64,
            object.etag,
            object.content_type,
            object.storage_class,
            object.location,
            object.pool,
            object.object_id,
            object.create_time as i64,
            object.last_modified,
            object.delete_marker as i32,
            serialize_parts(&object.parts),
            serialize_user_metadata(&object.user_metadata),
            object.acl,
        ],
    )?;
    Ok(())
}

/// Read the stored size of one object record, if present.
fn object_size(
    conn: &Connection,
    bucket: &str,
    key: &str,
    version: &str,
) -> anyhow::Result<Option<i64>> {
    let size = conn
        .query_row(
            "SELECT size FROM objects WHERE bucket = ?1 AND key = ?2 AND version_id = ?3",
            params![bucket, key, version],
            |row| row.get(0),
        )
        .optional()?;
    Ok(size)
}

/// Add `delta` to a bucket's usage counter.
fn bump_usage(conn: &Connection, bucket: &str, delta: i64) -> anyhow::Result<()> {
    let affected = conn.execute(
        "UPDATE buckets SET usage = usage + ?1 WHERE name = ?2",
        params![delta, bucket],
    )?;
    if affected == 0 {
        anyhow::bail!("bucket vanished during usage update: {bucket}");
    }
    Ok(())
}

// ── Row mapping ─────────────────────────────────────────────────────

/// Parse a JSON-typed column, surfacing decode failures as conversion
/// errors instead of silently dropping data.
fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn map_bucket_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bucket> {
    let raw_mode: String = row.get(2)?;
    let versioning = raw_mode.parse::<VersioningMode>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Bucket {
        name: row.get(0)?,
        owner_id: row.get(1)?,
        versioning,
        usage: row.get(3)?,
        acl: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn map_object_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Object> {
    let size: i64 = row.get(4)?;
    let create_time: i64 = row.get(11)?;
    Ok(Object {
        bucket: row.get(0)?,
        key: row.get(1)?,
        version_id: row.get(2)?,
        owner_id: row.get(3)?,
        size: size as u64,
        etag: row.get(5)?,
        content_type: row.get(6)?,
        storage_class: row.get(7)?,
        location: row.get(8)?,
        pool: row.get(9)?,
        object_id: row.get(10)?,
        create_time: create_time as u64,
        last_modified: row.get(12)?,
        delete_marker: row.get(13)?,
        parts: json_column(row, 14)?,
        user_metadata: json_column(row, 15)?,
        acl: row.get(16)?,
    })
}

fn map_upload_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Multipart> {
    Ok(Multipart {
        bucket: row.get(0)?,
        key: row.get(1)?,
        upload_id: row.get(2)?,
        owner_id: row.get(3)?,
        content_type: row.get(4)?,
        storage_class: row.get(5)?,
        location: row.get(6)?,
        pool: row.get(7)?,
        acl: row.get(8)?,
        user_metadata: json_column(row, 9)?,
        initiated_at: row.get(10)?,
        parts: BTreeMap::new(),
    })
}

fn map_part_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Part> {
    let size: i64 = row.get(1)?;
    Ok(Part {
        part_number: row.get(0)?,
        size: size as u64,
        etag: row.get(2)?,
        object_id: row.get(3)?,
        last_modified: row.get(4)?,
    })
}

fn map_garbage_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GarbageEntry> {
    let mtime: i64 = row.get(0)?;
    let size: i64 = row.get(7)?;
    Ok(GarbageEntry {
        mtime: mtime as u64,
        bucket: row.get(1)?,
        key: row.get(2)?,
        version_id: row.get(3)?,
        location: row.get(4)?,
        pool: row.get(5)?,
        object_id: row.get(6)?,
        size: size as u64,
        parts: json_column(row, 8)?,
    })
}

/// Serialize a part map to its JSON column form.
fn serialize_parts(parts: &BTreeMap<u32, Part>) -> String {
    serde_json::to_string(parts).unwrap_or_else(|_| "{}".to_string())
}

/// Serialize user_metadata to its JSON column form.
fn serialize_user_metadata(meta: &HashMap<String, String>) -> String {
    serde_json::to_string(meta).unwrap_or_else(|_| "{}".to_string())
}

// ── MetaClient implementation ───────────────────────────────────────

impl MetaClient for SqliteClient {
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
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    "SELECT name, owner_id, versioning, usage, acl, created_at
                     FROM buckets WHERE name = ?1",
                    params![name],
                    map_bucket_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Object>>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let version = version.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    "SELECT bucket, key, version_id, owner_id, size, etag, content_type,
                            storage_class, location, pool, object_id, create_time,
                            last_modified, delete_marker, parts, user_metadata, acl
                     FROM objects WHERE bucket = ?1 AND key = ?2 AND version_id = ?3",
                    params![bucket, key, version],
                    map_object_row,
                )
                .optional()?;
            Ok(result)
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
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    "SELECT bucket, key, version_id, owner_id, size, etag, content_type,
                            storage_class, location, pool, object_id, create_time,
                            last_modified, delete_marker, parts, user_metadata, acl
                     FROM objects WHERE bucket = ?1 AND key = ?2
                     ORDER BY create_time DESC LIMIT 1",
                    params![bucket, key],
                    map_object_row,
                )
                .optional()?;
            Ok(result)
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
            let conn = self.conn.lock().expect("mutex poisoned");
            let upload = conn
                .query_row(
                    "SELECT bucket, key, upload_id, owner_id, content_type, storage_class,
                            location, pool, acl, user_metadata, initiated_at
                     FROM multipart_uploads
                     WHERE bucket = ?1 AND key = ?2 AND upload_id = ?3",
                    params![bucket, key, upload_id],
                    map_upload_row,
                )
                .optional()?;

            let Some(mut multipart) = upload else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT part_number, size, etag, object_id, last_modified
                 FROM multipart_parts
                 WHERE bucket = ?1 AND key = ?2 AND upload_id = ?3
                 ORDER BY part_number",
            )?;
            let rows = stmt.query_map(params![bucket, key, upload_id], map_part_row)?;
            for row in rows {
                let part = row?;
                multipart.parts.insert(part.part_number, part);
            }
            Ok(Some(multipart))
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
            let conn = self.conn.lock().expect("mutex poisoned");
            // Range scan from the prefix; non-matching keys past the
            // prefix are filtered by the shared pagination pass.
            let mut stmt = conn.prepare(
                "SELECT bucket, key, upload_id, owner_id, content_type, storage_class,
                        location, pool, acl, user_metadata, initiated_at
                 FROM multipart_uploads
                 WHERE bucket = ?1 AND key >= ?2
                 ORDER BY key, upload_id",
            )?;
            let mapped = stmt.query_map(params![bucket, prefix], map_upload_row)?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
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
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT mtime, bucket, key, version_id, location, pool, object_id, size, parts
                 FROM gc ORDER BY mtime, bucket, key, version_id LIMIT ?1",
            )?;
            let mapped = stmt.query_map(params![max_keys as i64], map_garbage_row)?;
            let mut entries = Vec::new();
            for row in mapped {
                entries.push(row?);
            }
            Ok(entries)
        })
    }

    fn get_all_user_buckets(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HashMap<String, String>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare("SELECT bucket, owner_id FROM user_buckets")?;
            let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut buckets = HashMap::new();
            for row in mapped {
                let (bucket, owner): (String, String) = row?;
                buckets.insert(bucket, owner);
            }
            Ok(buckets)
        })
    }

    fn get_all_user_qos(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HashMap<String, UserQos>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt =
                conn.prepare("SELECT owner_id, read_qps, write_qps, bandwidth_kbps FROM user_qos")?;
            let mapped = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    UserQos {
                        read_qps: row.get(1)?,
                        write_qps: row.get(2)?,
                        bandwidth_kbps: row.get(3)?,
                    },
                ))
            })?;
            let mut qos = HashMap::new();
            for row in mapped {
                let (owner, limits) = row?;
                qos.insert(owner, limits);
            }
            Ok(qos)
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
