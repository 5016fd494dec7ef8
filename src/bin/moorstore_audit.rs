//! CLI entry point for moorstore-audit: offline metadata consistency checks.
//!
//! Opens the metadata database read-only and reports on the two pieces
//! of state that drift when something goes wrong mid-flight: per-bucket
//! usage counters and the garbage-collection queue.

use clap::{Parser, Subcommand};
use moorstore_meta::types::now_nanos;
use rusqlite::{Connection, OpenFlags};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "moorstore-audit", about = "MoorStore metadata audit tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recompute per-bucket live bytes and compare with stored usage counters
    Usage {
        #[arg(long, default_value = "moorstore.yaml")]
        config: PathBuf,
        #[arg(long)]
        db: Option<String>,
        /// Check a single bucket instead of all of them
        #[arg(long)]
        bucket: Option<String>,
    },
    /// Summarize the pending garbage-collection queue
    Gc {
        #[arg(long, default_value = "moorstore.yaml")]
        config: PathBuf,
        #[arg(long)]
        db: Option<String>,
        /// How many of the oldest entries to list
        #[arg(long, default_value_t = 10)]
        show: usize,
    },
}

fn resolve_db_path(config_path: &PathBuf) -> Result<String, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(config_path)?;
    let raw: serde_yaml::Value = serde_yaml::from_str(&content)?;
    let path = raw
        .get("meta")
        .and_then(|m| m.get("sqlite"))
        .and_then(|s| s.get("path"))
        .and_then(|p| p.as_str())
        .unwrap_or("./data/moorstore-meta.db");
    Ok(path.to_string())
}

fn open_read_only(config: PathBuf, db: Option<String>) -> Result<Connection, i32> {
    let db_path = match db {
        Some(p) => p,
        None => match resolve_db_path(&config) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("Error reading config: {}", e);
                return Err(1);
            }
        },
    };
    match Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
        Ok(conn) => Ok(conn),
        Err(e) => {
            eprintln!("Error opening database {}: {}", db_path, e);
            Err(1)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let rc = match cli.command {
        Commands::Usage { config, db, bucket } => run_usage(config, db, bucket),
        Commands::Gc { config, db, show } => run_gc(config, db, show),
    };
    std::process::exit(rc);
}

fn run_usage(config: PathBuf, db: Option<String>, bucket: Option<String>) -> i32 {
    let conn = match open_read_only(config, db) {
        Ok(c) => c,
        Err(rc) => return rc,
    };

    // Live bytes per bucket: committed object versions (markers carry
    // no bytes) plus parts still staged in open multipart uploads.
    let sql = "
        SELECT b.name, b.usage,
               COALESCE(o.total, 0) AS live_objects,
               COALESCE(p.total, 0) AS staged_parts
        FROM buckets b
        LEFT JOIN (
            SELECT bucket, SUM(size) AS total
            FROM objects
            WHERE delete_marker = 0
            GROUP BY bucket
        ) o ON o.bucket = b.name
        LEFT JOIN (
            SELECT bucket, SUM(size) AS total
            FROM multipart_parts
            GROUP BY bucket
        ) p ON p.bucket = b.name
        ORDER BY b.name
    ";

    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error preparing query: {}", e);
            return 1;
        }
    };
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
        ))
    });
    let rows = match rows {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error querying buckets: {}", e);
            return 1;
        }
    };

    let mut checked = 0usize;
    let mut drifted = 0usize;
    for row in rows {
        let (name, stored, live_objects, staged_parts) = match row {
            Ok(r) => r,
            Err(e) => {
                eprintln!("Error reading row: {}", e);
                return 1;
            }
        };
        if let Some(ref only) = bucket {
            if &name != only {
                continue;
            }
        }
        checked += 1;
        let live = live_objects + staged_parts;
        if stored == live {
            println!("{}: stored {}, live {}", name, stored, live);
        } else {
            drifted += 1;
            println!(
                "{}: stored {}, live {} (drift {}, objects {}, staged parts {})",
                name,
                stored,
                live,
                stored - live,
                live_objects,
                staged_parts
            );
        }
    }

    if let Some(ref only) = bucket {
        if checked == 0 {
            eprintln!("Error: no such bucket: {}", only);
            return 1;
        }
    }
    eprintln!("{} buckets checked, {} with drift", checked, drifted);
    if drifted > 0 {
        1
    } else {
        0
    }
}

fn run_gc(config: PathBuf, db: Option<String>, show: usize) -> i32 {
    let conn = match open_read_only(config, db) {
        Ok(c) => c,
        Err(rc) => return rc,
    };

    let totals = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(size), 0), COALESCE(MIN(mtime), 0) FROM gc",
        [],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        },
    );
    let (pending, reclaimable, oldest_mtime) = match totals {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error querying gc queue: {}", e);
            return 1;
        }
    };

    if pending == 0 {
        println!("Garbage-collection queue is empty");
        return 0;
    }

    let now = now_nanos();
    println!("Pending entries: {}", pending);
    println!("Reclaimable bytes: {}", reclaimable);
    println!("Oldest entry age: {}s", age_secs(now, oldest_mtime));

    let mut stmt = match conn.prepare(
        "SELECT mtime, bucket, key, version_id, size FROM gc ORDER BY mtime ASC LIMIT ?1",
    ) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error preparing query: {}", e);
            return 1;
        }
    };
    let rows = stmt.query_map([show as i64], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, i64>(4)?,
        ))
    });
    let rows = match rows {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error querying gc entries: {}", e);
            return 1;
        }
    };
    for row in rows {
        match row {
            Ok((mtime, bucket, key, version_id, size)) => {
                let version = if version_id.is_empty() {
                    "null".to_string()
                } else {
                    version_id
                };
                println!(
                    "  {}/{} version {}: {} bytes, queued {}s ago",
                    bucket,
                    key,
                    version,
                    size,
                    age_secs(now, mtime)
                );
            }
            Err(e) => {
                eprintln!("Error reading row: {}", e);
                return 1;
            }
        }
    }
    0
}

fn age_secs(now_nanos: u64, mtime: i64) -> u64 {
    now_nanos.saturating_sub(mtime.max(0) as u64) / 1_000_000_000
}
