//! SQLite snapshot files for the embedding index.
//!
//! A snapshot is written to `<path>.tmp` and renamed over `path` only after
//! the connection pool has been closed, so an interrupted write never
//! replaces a good snapshot. Every pool opened here is closed before the
//! function returns, on success and on failure.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::chunker::Chunk;
use super::document::{sha256_hex, DocumentId};
use super::index::{DistanceMetric, IndexEntry};
use crate::core::errors::RagError;

pub const FORMAT_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotMeta {
    pub format_version: u32,
    pub model_id: String,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub entry_count: usize,
    pub index_version: u64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

pub async fn write_snapshot(
    path: &Path,
    model_id: &str,
    dimension: usize,
    metric: DistanceMetric,
    index_version: u64,
    entries: &[Arc<IndexEntry>],
) -> Result<SnapshotMeta, RagError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(RagError::internal)?;
    }

    let meta = SnapshotMeta {
        format_version: FORMAT_VERSION,
        model_id: model_id.to_string(),
        dimension,
        metric,
        entry_count: entries.len(),
        index_version,
        checksum: checksum(entries.iter().map(|entry| entry.as_ref())),
        created_at: Utc::now(),
    };

    let tmp = tmp_path(path);
    remove_if_exists(&tmp).await?;

    let pool = open_pool(&tmp, false).await?;
    let written = write_all(&pool, &meta, entries).await;
    pool.close().await;

    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(RagError::internal)?;
    Ok(meta)
}

pub async fn read_snapshot(path: &Path) -> Result<(SnapshotMeta, Vec<IndexEntry>), RagError> {
    if !path.exists() {
        return Err(RagError::NotFound(format!(
            "index snapshot {}",
            path.display()
        )));
    }

    let pool = open_pool(path, true).await.map_err(corrupt)?;
    let result = read_all(&pool).await;
    pool.close().await;
    result
}

/// SHA-256 over every persisted field, in iteration order.
pub fn checksum<'a>(entries: impl Iterator<Item = &'a IndexEntry>) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        let chunk = &entry.chunk;
        for field in [
            chunk.id.as_str(),
            chunk.document_id.as_str(),
            chunk.origin.as_str(),
            chunk.text_sha256.as_str(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        for number in [chunk.sequence, chunk.start, chunk.end] {
            hasher.update((number as u64).to_le_bytes());
        }
        match chunk.page {
            Some(page) => {
                hasher.update([1u8]);
                hasher.update(page.to_le_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update(serialize_vector(&entry.vector));
    }
    hex::encode(hasher.finalize())
}

async fn open_pool(path: &Path, read_only: bool) -> Result<SqlitePool, RagError> {
    let mut options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(read_only);
    if !read_only {
        options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .synchronous(SqliteSynchronous::Full);
    }

    SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(RagError::internal)
}

async fn write_all(
    pool: &SqlitePool,
    meta: &SnapshotMeta,
    entries: &[Arc<IndexEntry>],
) -> Result<(), RagError> {
    sqlx::query(
        "CREATE TABLE snapshot_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(RagError::internal)?;

    sqlx::query(
        "CREATE TABLE snapshot_entries (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            origin TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            text TEXT NOT NULL,
            text_sha256 TEXT NOT NULL,
            page INTEGER,
            vector BLOB NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(RagError::internal)?;

    let mut tx = pool.begin().await.map_err(RagError::internal)?;

    let pairs = [
        ("format_version", meta.format_version.to_string()),
        ("model_id", meta.model_id.clone()),
        ("dimension", meta.dimension.to_string()),
        ("metric", meta.metric.as_str().to_string()),
        ("entry_count", meta.entry_count.to_string()),
        ("index_version", meta.index_version.to_string()),
        ("checksum", meta.checksum.clone()),
        ("created_at", meta.created_at.to_rfc3339()),
    ];
    for (key, value) in pairs {
        sqlx::query("INSERT INTO snapshot_meta (key, value) VALUES (?1, ?2)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(RagError::internal)?;
    }

    for entry in entries {
        let chunk = &entry.chunk;
        sqlx::query(
            "INSERT INTO snapshot_entries
                (chunk_id, document_id, origin, sequence, start_offset, end_offset, text, text_sha256, page, vector)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&chunk.id)
        .bind(chunk.document_id.as_str())
        .bind(&chunk.origin)
        .bind(chunk.sequence as i64)
        .bind(chunk.start as i64)
        .bind(chunk.end as i64)
        .bind(&chunk.text)
        .bind(&chunk.text_sha256)
        .bind(chunk.page.map(i64::from))
        .bind(serialize_vector(&entry.vector))
        .execute(&mut *tx)
        .await
        .map_err(RagError::internal)?;
    }

    tx.commit().await.map_err(RagError::internal)?;
    Ok(())
}

async fn read_all(pool: &SqlitePool) -> Result<(SnapshotMeta, Vec<IndexEntry>), RagError> {
    let meta_rows = sqlx::query("SELECT key, value FROM snapshot_meta")
        .fetch_all(pool)
        .await
        .map_err(corrupt)?;
    let mut values = HashMap::new();
    for row in &meta_rows {
        let key: String = row.try_get("key").map_err(corrupt)?;
        let value: String = row.try_get("value").map_err(corrupt)?;
        values.insert(key, value);
    }

    let meta = SnapshotMeta {
        format_version: meta_value(&values, "format_version")?,
        model_id: meta_value(&values, "model_id")?,
        dimension: meta_value(&values, "dimension")?,
        metric: values
            .get("metric")
            .and_then(|value| DistanceMetric::parse(value))
            .ok_or_else(|| corruption("missing or unknown metric"))?,
        entry_count: meta_value(&values, "entry_count")?,
        index_version: meta_value(&values, "index_version")?,
        checksum: meta_value(&values, "checksum")?,
        created_at: values
            .get("created_at")
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|value| value.with_timezone(&Utc))
            .ok_or_else(|| corruption("missing or invalid created_at"))?,
    };

    if meta.format_version != FORMAT_VERSION {
        return Err(corruption(&format!(
            "unsupported format version {}",
            meta.format_version
        )));
    }

    let rows = sqlx::query(
        "SELECT chunk_id, document_id, origin, sequence, start_offset, end_offset, text, text_sha256, page, vector
         FROM snapshot_entries
         ORDER BY chunk_id",
    )
    .fetch_all(pool)
    .await
    .map_err(corrupt)?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in &rows {
        let entry = row_to_entry(row, meta.dimension)?;
        entries.push(entry);
    }
    entries.sort_by(|a, b| a.chunk.id.cmp(&b.chunk.id));

    if entries.len() != meta.entry_count {
        return Err(corruption(&format!(
            "expected {} entries, found {}",
            meta.entry_count,
            entries.len()
        )));
    }
    if checksum(entries.iter()) != meta.checksum {
        return Err(corruption("checksum mismatch"));
    }

    Ok((meta, entries))
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow, dimension: usize) -> Result<IndexEntry, RagError> {
    let chunk_id: String = row.try_get("chunk_id").map_err(corrupt)?;
    let document_id: String = row.try_get("document_id").map_err(corrupt)?;
    let origin: String = row.try_get("origin").map_err(corrupt)?;
    let sequence: i64 = row.try_get("sequence").map_err(corrupt)?;
    let start: i64 = row.try_get("start_offset").map_err(corrupt)?;
    let end: i64 = row.try_get("end_offset").map_err(corrupt)?;
    let text: String = row.try_get("text").map_err(corrupt)?;
    let text_sha256: String = row.try_get("text_sha256").map_err(corrupt)?;
    let page: Option<i64> = row.try_get("page").map_err(corrupt)?;
    let blob: Vec<u8> = row.try_get("vector").map_err(corrupt)?;

    let expected = dimension
        .checked_mul(4)
        .ok_or_else(|| corruption(&format!("dimension {} is out of range", dimension)))?;
    if blob.len() != expected {
        return Err(corruption(&format!(
            "chunk {} has a {}-byte vector, expected {}",
            chunk_id,
            blob.len(),
            expected
        )));
    }
    if sha256_hex(&text) != text_sha256 {
        return Err(corruption(&format!("chunk {} text hash mismatch", chunk_id)));
    }
    if sequence < 0 || start < 0 || end < start {
        return Err(corruption(&format!("chunk {} has invalid offsets", chunk_id)));
    }
    let page = page
        .map(u32::try_from)
        .transpose()
        .map_err(|_| corruption(&format!("chunk {} has an invalid page", chunk_id)))?;

    Ok(IndexEntry {
        chunk: Chunk {
            id: chunk_id,
            document_id: DocumentId::from(document_id),
            origin,
            sequence: sequence as usize,
            start: start as usize,
            end: end as usize,
            text,
            text_sha256,
            page,
        },
        vector: deserialize_vector(&blob),
    })
}

fn meta_value<T: FromStr>(values: &HashMap<String, String>, key: &str) -> Result<T, RagError> {
    values
        .get(key)
        .and_then(|value| value.parse::<T>().ok())
        .ok_or_else(|| corruption(&format!("missing or invalid {}", key)))
}

fn serialize_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn deserialize_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

async fn remove_if_exists(path: &Path) -> Result<(), RagError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(RagError::internal(err)),
    }
}

fn corrupt<E: std::fmt::Display>(err: E) -> RagError {
    RagError::IndexCorruption(err.to_string())
}

fn corruption(message: &str) -> RagError {
    RagError::IndexCorruption(message.to_string())
}
