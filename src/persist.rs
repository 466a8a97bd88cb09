//! Index artifact persistence.
//!
//! An index is stored as a single SQLite file:
//!
//! ```text
//! index_meta(key, value)          -- model version, dims, metric, chunking, built_at
//! documents(id, title, source, revision)
//! chunks(document_id, ordinal, start_offset, end_offset, section, text, hash, vector)
//! ```
//!
//! Vectors are little-endian `f32` BLOBs ([`vec_to_blob`]), so a round trip
//! is bit-exact.
//!
//! Publishing is write-to-temp-then-rename: the artifact is fully written
//! and closed under a unique temporary name in the target directory, then
//! renamed over the published path. Readers see either the old file or the
//! new one, never a partial write. An interrupted build leaves at most a
//! stray temp file, which is removed on failure.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{Error, Result};
use crate::index::{ChunkingParams, DocumentInfo, IndexEntry, IndexParams, IndexTag, Metric, VectorIndex};
use crate::models::Chunk;

const SCHEMA: &[&str] = &[
    "CREATE TABLE index_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
    "CREATE TABLE documents (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        source TEXT NOT NULL,
        revision TEXT NOT NULL
    )",
    "CREATE TABLE chunks (
        document_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        section TEXT,
        text TEXT NOT NULL,
        hash TEXT NOT NULL,
        vector BLOB NOT NULL,
        PRIMARY KEY (document_id, ordinal)
    )",
];

async fn connect(path: &Path, create: bool) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .read_only(!create)
        // Rollback journal keeps the artifact a single self-contained file.
        .journal_mode(SqliteJournalMode::Delete);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Write `index` to `location`, atomically replacing any existing artifact.
pub async fn persist(index: &VectorIndex, location: &Path) -> Result<()> {
    let dir = match location.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let file_name = location
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "index.sqlite".to_string());
    let tmp = dir.join(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4()));

    let published = match write_artifact(index, &tmp).await {
        Ok(()) => std::fs::rename(&tmp, location).map_err(Error::from),
        Err(e) => Err(e),
    };
    if let Err(e) = published {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }

    info!(
        path = %location.display(),
        chunks = index.len(),
        "published index artifact"
    );
    Ok(())
}

async fn write_artifact(index: &VectorIndex, path: &Path) -> Result<()> {
    let pool = connect(path, true).await?;
    let result = write_tables(&pool, index).await;
    pool.close().await;
    result
}

async fn write_tables(pool: &SqlitePool, index: &VectorIndex) -> Result<()> {
    let mut tx = pool.begin().await?;
    for stmt in SCHEMA {
        sqlx::query(*stmt).execute(&mut *tx).await?;
    }

    let tag = index.tag();
    let meta = [
        ("model_version", tag.params.model_version.clone()),
        ("dims", tag.params.dims.to_string()),
        ("metric", tag.params.metric.as_str().to_string()),
        ("max_tokens", tag.params.chunking.max_tokens.to_string()),
        ("overlap_tokens", tag.params.chunking.overlap_tokens.to_string()),
        ("built_at", tag.built_at.to_rfc3339()),
    ];
    for (key, value) in meta {
        sqlx::query("INSERT INTO index_meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
    }

    for doc in index.documents() {
        sqlx::query("INSERT INTO documents (id, title, source, revision) VALUES (?, ?, ?, ?)")
            .bind(&doc.id)
            .bind(&doc.title)
            .bind(&doc.source)
            .bind(&doc.revision)
            .execute(&mut *tx)
            .await?;
    }

    for entry in index.entries() {
        let c = &entry.chunk;
        sqlx::query(
            "INSERT INTO chunks (document_id, ordinal, start_offset, end_offset, section, text, hash, vector)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&c.document_id)
        .bind(c.ordinal as i64)
        .bind(c.start as i64)
        .bind(c.end as i64)
        .bind(&c.section)
        .bind(&c.text)
        .bind(&c.hash)
        .bind(vec_to_blob(&entry.vector))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Read the stored tag without loading chunks.
pub async fn read_tag(location: &Path) -> Result<IndexTag> {
    if !location.is_file() {
        return Err(Error::IndexNotFound(location.to_path_buf()));
    }
    let pool = connect(location, false).await?;
    let tag = read_meta(&pool).await;
    pool.close().await;
    tag
}

/// Load the artifact at `location`, rejecting it unless its tag matches
/// `expected`.
pub async fn load(location: &Path, expected: &IndexParams) -> Result<VectorIndex> {
    if !location.is_file() {
        return Err(Error::IndexNotFound(location.to_path_buf()));
    }
    let pool = connect(location, false).await?;
    let result = load_from(&pool, expected).await;
    pool.close().await;
    let index = result?;
    debug!(path = %location.display(), chunks = index.len(), "loaded index artifact");
    Ok(index)
}

async fn load_from(pool: &SqlitePool, expected: &IndexParams) -> Result<VectorIndex> {
    let tag = read_meta(pool).await?;
    tag.params.ensure_matches(expected)?;

    let documents = sqlx::query("SELECT id, title, source, revision FROM documents ORDER BY id")
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| DocumentInfo {
            id: row.get("id"),
            title: row.get("title"),
            source: row.get("source"),
            revision: row.get("revision"),
        })
        .collect();

    let rows = sqlx::query(
        "SELECT document_id, ordinal, start_offset, end_offset, section, text, hash, vector
         FROM chunks ORDER BY document_id, ordinal",
    )
    .fetch_all(pool)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let blob: Vec<u8> = row.get("vector");
        let vector = blob_to_vec(&blob);
        if vector.len() != tag.params.dims {
            return Err(Error::DimensionMismatch {
                expected: tag.params.dims,
                actual: vector.len(),
            });
        }
        let ordinal: i64 = row.get("ordinal");
        let start: i64 = row.get("start_offset");
        let end: i64 = row.get("end_offset");
        entries.push(IndexEntry {
            chunk: Chunk {
                document_id: row.get("document_id"),
                ordinal: ordinal as u32,
                start: start as usize,
                end: end as usize,
                section: row.get("section"),
                text: row.get("text"),
                hash: row.get("hash"),
            },
            vector,
        });
    }

    Ok(VectorIndex::from_parts(tag, documents, entries))
}

async fn read_meta(pool: &SqlitePool) -> Result<IndexTag> {
    let rows = sqlx::query("SELECT key, value FROM index_meta")
        .fetch_all(pool)
        .await?;
    let lookup = |key: &str| -> Result<String> {
        rows.iter()
            .find(|r| r.get::<String, _>("key") == key)
            .map(|r| r.get::<String, _>("value"))
            .ok_or_else(|| Error::IndexMismatch {
                field: "artifact metadata",
                stored: format!("missing '{}'", key),
                expected: key.to_string(),
            })
    };
    let number = |key: &str| -> Result<usize> {
        let raw = lookup(key)?;
        raw.parse().map_err(|_| Error::IndexMismatch {
            field: "artifact metadata",
            stored: raw,
            expected: format!("integer {}", key),
        })
    };

    let metric_raw = lookup("metric")?;
    let metric = Metric::parse(&metric_raw).ok_or_else(|| Error::IndexMismatch {
        field: "metric",
        stored: metric_raw.clone(),
        expected: "cosine | inner_product".to_string(),
    })?;
    let built_raw = lookup("built_at")?;
    let built_at = DateTime::parse_from_rfc3339(&built_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| Error::IndexMismatch {
            field: "built_at",
            stored: built_raw.clone(),
            expected: "RFC 3339 timestamp".to_string(),
        })?;

    Ok(IndexTag {
        params: IndexParams {
            model_version: lookup("model_version")?,
            dims: number("dims")?,
            metric,
            chunking: ChunkingParams {
                max_tokens: number("max_tokens")?,
                overlap_tokens: number("overlap_tokens")?,
            },
        },
        built_at,
    })
}
