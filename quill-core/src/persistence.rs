//! SQLite persistence for category knowledge bases.
//!
//! One database file per category (`<dir>/<category>.db`):
//!
//! ```sql
//! CREATE TABLE chunks (
//!     id         TEXT PRIMARY KEY,
//!     position   INTEGER NOT NULL,
//!     created_at TEXT NOT NULL,     -- RFC 3339
//!     text       TEXT NOT NULL,
//!     embedding  BLOB,              -- bincode Vec<f32>, NULL if degraded
//!     in_graph   INTEGER NOT NULL   -- 1 if the vector is in the HNSW graph
//! );
//! CREATE TABLE graph_stale (        -- graph points no longer live
//!     id         TEXT PRIMARY KEY,
//!     embedding  BLOB NOT NULL      -- bincode Vec<f32>, normalized
//! );
//! CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
//! ```
//!
//! `meta` records the format version, category, activation state, vector
//! dimensionality, chunk count, graph state and a CRC-32 over the canonical
//! encoding of all rows in id order. Loading validates every one of these
//! and reports any mismatch as [`QuillError::IndexCorruption`].
//!
//! Keyword postings are rebuilt from the chunk rows. The vector graph is
//! rebuilt from the recorded partition (`in_graph` rows plus `graph_stale`),
//! which reproduces the graph that was in use when the category was saved.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info};

use crate::config::PersistenceConfig;
use crate::error::{QuillError, Result};
use crate::types::{Category, CategoryState, Chunk, ChunkId, Embedding};
use crate::vector::GraphState;

const FORMAT_VERSION: &str = "2";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS chunks (
        id         TEXT PRIMARY KEY,
        position   INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        text       TEXT NOT NULL,
        embedding  BLOB,
        in_graph   INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS graph_stale (
        id        TEXT PRIMARY KEY,
        embedding BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );";

// ---------------------------------------------------------------------------
// CRC-32 checksum helper
// ---------------------------------------------------------------------------

/// CRC-32 (ISO 3309 / ITU-T V.42) of `data` as lowercase hex.
fn crc32_hex(data: &[u8]) -> String {
    format!("{:08x}", crc32_compute(data))
}

fn crc32_compute(data: &[u8]) -> u32 {
    const POLY: u32 = 0xEDB8_8320;
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            if crc & 1 == 1 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// A chunk row exactly as stored.
struct Row {
    id: String,
    position: i64,
    created_at: String,
    text: String,
    embedding: Option<Vec<u8>>,
    in_graph: bool,
}

/// A stale graph point as stored.
struct StaleRow {
    id: String,
    embedding: Vec<u8>,
}

impl Row {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.id.as_bytes());
        buf.push(0x1f);
        buf.extend_from_slice(&self.position.to_le_bytes());
        buf.extend_from_slice(self.created_at.as_bytes());
        buf.push(0x1f);
        buf.extend_from_slice(self.text.as_bytes());
        buf.push(0x1f);
        if let Some(blob) = &self.embedding {
            buf.extend_from_slice(blob);
        }
        buf.push(0x1f);
        buf.push(u8::from(self.in_graph));
        buf.push(0x1e);
    }
}

/// Checksum over chunk rows then stale rows, each sorted by id.
fn rows_checksum(rows: &[Row], stale: &[StaleRow]) -> String {
    let mut buf = Vec::new();
    for row in rows {
        row.encode_into(&mut buf);
    }
    buf.push(0x1d);
    for row in stale {
        buf.extend_from_slice(row.id.as_bytes());
        buf.push(0x1f);
        buf.extend_from_slice(&row.embedding);
        buf.push(0x1e);
    }
    crc32_hex(&buf)
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Everything needed to rebuild one category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategorySnapshot {
    /// The category.
    pub category: Category,
    /// Activation state at save time.
    pub state: CategoryState,
    /// Fixed vector dimensionality, if any vector was indexed.
    pub dimensions: Option<usize>,
    /// Chunks, sorted by id.
    pub chunks: Vec<Chunk>,
    /// Partition of the embedding graph.
    pub graph: GraphState,
}

impl CategorySnapshot {
    /// Database file for `category` under `dir`.
    #[must_use]
    pub fn path_in(dir: &Path, category: Category) -> PathBuf {
        dir.join(format!("{}.db", category.as_str()))
    }
}

// ---------------------------------------------------------------------------
// PersistenceEngine
// ---------------------------------------------------------------------------

/// Handle to one category's SQLite file.
pub struct PersistenceEngine {
    conn: Connection,
    config: PersistenceConfig,
    db_path: PathBuf,
}

impl std::fmt::Debug for PersistenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceEngine")
            .field("db_path", &self.db_path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistenceEngine {
    /// Open (or create) the database at `path` for writing.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::Database`] on SQLite failures.
    pub fn open<P: AsRef<Path>>(path: P, config: &PersistenceConfig) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&db_path, flags)?;

        if config.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(SCHEMA)?;
        migrate(&conn)?;

        debug!(path = %db_path.display(), wal = config.wal_mode, "persistence engine opened");

        Ok(Self {
            conn,
            config: config.clone(),
            db_path,
        })
    }

    /// Open an existing database without creating the file or the schema.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::Database`] if the file cannot be opened.
    pub fn open_existing<P: AsRef<Path>>(path: P, config: &PersistenceConfig) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&db_path, flags)?;
        Ok(Self {
            conn,
            config: config.clone(),
            db_path,
        })
    }

    /// Open an in-memory database (useful for tests).
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::Database`] on SQLite failures.
    pub fn open_in_memory(config: &PersistenceConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            config: config.clone(),
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Replace the stored contents with `snapshot`, in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::Serialization`] if an embedding or position
    /// cannot be encoded, or [`QuillError::Database`] on SQLite failures.
    pub fn save_snapshot(&mut self, snapshot: &CategorySnapshot) -> Result<()> {
        let start = Instant::now();

        let graph = &snapshot.graph;
        let mut rows = snapshot
            .chunks
            .iter()
            .map(|chunk| encode_row(chunk, graph.members.binary_search(chunk.id()).is_ok()))
            .collect::<Result<Vec<Row>>>()?;
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        let mut stale = graph
            .stale
            .iter()
            .map(|(id, vector)| {
                Ok(StaleRow {
                    id: id.as_str().to_string(),
                    embedding: bincode::serialize(vector)
                        .map_err(|e| QuillError::Serialization(e.to_string()))?,
                })
            })
            .collect::<Result<Vec<StaleRow>>>()?;
        stale.sort_by(|a, b| a.id.cmp(&b.id));

        let checksum = self.config.checksum_enabled.then(|| rows_checksum(&rows, &stale));
        let state = serde_json::to_string(&snapshot.state)
            .map_err(|e| QuillError::Serialization(e.to_string()))?;
        let dimensions = serde_json::to_string(&snapshot.dimensions)
            .map_err(|e| QuillError::Serialization(e.to_string()))?;

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM chunks", [])?;
        tx.execute("DELETE FROM graph_stale", [])?;
        tx.execute("DELETE FROM meta", [])?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO chunks (id, position, created_at, text, embedding, in_graph)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for row in &rows {
                insert.execute(params![
                    row.id,
                    row.position,
                    row.created_at,
                    row.text,
                    row.embedding,
                    row.in_graph
                ])?;
            }

            let mut insert_stale =
                tx.prepare_cached("INSERT INTO graph_stale (id, embedding) VALUES (?1, ?2)")?;
            for row in &stale {
                insert_stale.execute(params![row.id, row.embedding])?;
            }

            let mut meta = tx.prepare_cached("INSERT INTO meta (key, value) VALUES (?1, ?2)")?;
            meta.execute(params!["format_version", FORMAT_VERSION])?;
            meta.execute(params!["category", snapshot.category.as_str()])?;
            meta.execute(params!["state", state])?;
            meta.execute(params!["dimensions", dimensions])?;
            meta.execute(params!["chunk_count", rows.len().to_string()])?;
            meta.execute(params!["graph_built", graph.built.to_string()])?;
            meta.execute(params!["graph_dirty", graph.dirty_count.to_string()])?;
            meta.execute(params!["saved_at", Utc::now().to_rfc3339()])?;
            if let Some(checksum) = &checksum {
                meta.execute(params!["checksum", checksum])?;
            }
        }
        tx.commit()?;

        debug!(
            category = %snapshot.category,
            chunks = rows.len(),
            graph_built = graph.built,
            stale = stale.len(),
            elapsed_us = start.elapsed().as_micros(),
            "saved category"
        );
        Ok(())
    }

    /// Read and validate the stored snapshot for `category`.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::IndexCorruption`] if the file is not a valid
    /// database for `category` or any stored value fails validation.
    pub fn load_snapshot(&self, category: Category) -> Result<CategorySnapshot> {
        let start = Instant::now();
        let corrupt = |reason: String| QuillError::IndexCorruption { category, reason };
        let db = |e: rusqlite::Error| corrupt(e.to_string());

        let version = self.meta("format_version").map_err(db)?;
        if version.as_deref() != Some(FORMAT_VERSION) {
            return Err(corrupt(format!("unsupported format version {version:?}")));
        }
        let stored_category = self.meta("category").map_err(db)?;
        if stored_category.as_deref() != Some(category.as_str()) {
            return Err(corrupt(format!("file belongs to category {stored_category:?}")));
        }
        let state: CategoryState = self
            .meta("state")
            .map_err(db)?
            .and_then(|s| serde_json::from_str(&s).ok())
            .ok_or_else(|| corrupt("missing or invalid state".into()))?;
        let dimensions: Option<usize> = self
            .meta("dimensions")
            .map_err(db)?
            .and_then(|s| serde_json::from_str(&s).ok())
            .ok_or_else(|| corrupt("missing or invalid dimensions".into()))?;
        let chunk_count: usize = self
            .meta("chunk_count")
            .map_err(db)?
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| corrupt("missing or invalid chunk count".into()))?;

        let graph_built: bool = self
            .meta("graph_built")
            .map_err(db)?
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| corrupt("missing or invalid graph state".into()))?;
        let dirty_count: usize = self
            .meta("graph_dirty")
            .map_err(db)?
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| corrupt("missing or invalid graph dirty count".into()))?;

        let rows = self.rows().map_err(db)?;
        let stale_rows = self.stale_rows().map_err(db)?;
        if rows.len() != chunk_count {
            return Err(corrupt(format!(
                "expected {chunk_count} chunks, found {}",
                rows.len()
            )));
        }

        if self.config.checksum_enabled {
            if let Some(expected) = self.meta("checksum").map_err(db)? {
                let actual = rows_checksum(&rows, &stale_rows);
                if expected != actual {
                    return Err(corrupt(format!(
                        "checksum mismatch: stored {expected}, computed {actual}"
                    )));
                }
            }
        }

        if !graph_built && (!stale_rows.is_empty() || rows.iter().any(|r| r.in_graph)) {
            return Err(corrupt("graph partition recorded without a graph".into()));
        }
        let mut members = Vec::new();
        let mut chunks = Vec::with_capacity(rows.len());
        for row in rows {
            if row.in_graph {
                if row.embedding.is_none() {
                    return Err(corrupt(format!(
                        "chunk {} is in the graph without an embedding",
                        row.id
                    )));
                }
                members.push(ChunkId(row.id.clone()));
            }
            chunks.push(decode_row(category, dimensions, row).map_err(&corrupt)?);
        }
        let stale = stale_rows
            .into_iter()
            .map(|row| decode_stale(dimensions, row).map_err(&corrupt))
            .collect::<Result<Vec<(ChunkId, Vec<f32>)>>>()?;
        let graph = GraphState {
            built: graph_built,
            members,
            stale,
            dirty_count,
        };

        debug!(
            category = %category,
            chunks = chunks.len(),
            graph_built,
            elapsed_us = start.elapsed().as_micros(),
            "loaded category"
        );

        Ok(CategorySnapshot {
            category,
            state,
            dimensions,
            chunks,
            graph,
        })
    }

    /// Copy the database to `dest_path` with SQLite's online-backup API.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::Database`] on SQLite failures.
    pub fn backup<P: AsRef<Path>>(&self, dest_path: P) -> Result<()> {
        let start = Instant::now();
        let mut dest = Connection::open(dest_path.as_ref())?;
        let backup = rusqlite::backup::Backup::new(&self.conn, &mut dest)?;
        backup.run_to_completion(256, std::time::Duration::from_millis(10), None)?;

        info!(
            dest = %dest_path.as_ref().display(),
            elapsed_ms = start.elapsed().as_millis(),
            "database backup completed"
        );
        Ok(())
    }

    /// Path of the open database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn meta(&self, key: &str) -> rusqlite::Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
    }

    fn rows(&self) -> rusqlite::Result<Vec<Row>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, position, created_at, text, embedding, in_graph FROM chunks ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Row {
                id: row.get(0)?,
                position: row.get(1)?,
                created_at: row.get(2)?,
                text: row.get(3)?,
                embedding: row.get(4)?,
                in_graph: row.get(5)?,
            })
        })?;
        let collected: rusqlite::Result<Vec<Row>> = rows.collect();
        collected
    }

    fn stale_rows(&self) -> rusqlite::Result<Vec<StaleRow>> {
        let mut stmt = self.conn.prepare("SELECT id, embedding FROM graph_stale ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(StaleRow {
                id: row.get(0)?,
                embedding: row.get(1)?,
            })
        })?;
        let collected: rusqlite::Result<Vec<StaleRow>> = rows.collect();
        collected
    }
}

/// Add the `in_graph` column to files written before it existed.
fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    let has_column: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('chunks') WHERE name = 'in_graph'",
        [],
        |row| row.get(0),
    )?;
    if !has_column {
        conn.execute_batch("ALTER TABLE chunks ADD COLUMN in_graph INTEGER NOT NULL DEFAULT 0;")?;
    }
    Ok(())
}

fn encode_row(chunk: &Chunk, in_graph: bool) -> Result<Row> {
    let position = i64::try_from(chunk.source_position()).map_err(|_| {
        QuillError::Serialization(format!(
            "source position {} exceeds storage range",
            chunk.source_position()
        ))
    })?;
    let embedding = chunk
        .embedding()
        .map(|e| bincode::serialize(&e.0))
        .transpose()
        .map_err(|e| QuillError::Serialization(e.to_string()))?;
    Ok(Row {
        id: chunk.id().as_str().to_string(),
        position,
        created_at: chunk.created_at().to_rfc3339(),
        text: chunk.text().to_string(),
        embedding,
        in_graph,
    })
}

fn decode_row(
    category: Category,
    dimensions: Option<usize>,
    row: Row,
) -> std::result::Result<Chunk, String> {
    let position = u64::try_from(row.position)
        .map_err(|_| format!("chunk {} has negative position", row.id))?;
    let id = ChunkId(row.id);
    if ChunkId::derive(category, position, &row.text) != id {
        return Err(format!("chunk {id} does not match its content"));
    }
    let created_at = DateTime::parse_from_rfc3339(&row.created_at)
        .map_err(|e| format!("chunk {id} has invalid timestamp: {e}"))?
        .with_timezone(&Utc);

    let embedding = match row.embedding {
        None => None,
        Some(blob) => {
            let vector: Vec<f32> = bincode::deserialize(&blob)
                .map_err(|e| format!("chunk {id} has undecodable embedding: {e}"))?;
            match dimensions {
                Some(d) if d == vector.len() => {}
                _ => {
                    return Err(format!(
                        "chunk {id} embedding has {} dimensions, index records {dimensions:?}",
                        vector.len()
                    ));
                }
            }
            Some(Embedding(vector))
        }
    };

    Ok(Chunk::restore(id, category, row.text, position, created_at, embedding))
}

fn decode_stale(
    dimensions: Option<usize>,
    row: StaleRow,
) -> std::result::Result<(ChunkId, Vec<f32>), String> {
    let vector: Vec<f32> = bincode::deserialize(&row.embedding)
        .map_err(|e| format!("stale graph point {} is undecodable: {e}", row.id))?;
    if dimensions != Some(vector.len()) {
        return Err(format!(
            "stale graph point {} has {} dimensions, index records {dimensions:?}",
            row.id,
            vector.len()
        ));
    }
    Ok((ChunkId(row.id), vector))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> CategorySnapshot {
        let mut embedded = Chunk::new(Category::Outline, "The siege begins", 4);
        embedded.set_embedding(Embedding(vec![0.5, -0.25, 1.0]));
        let degraded = Chunk::new(Category::Outline, "Mara returns home", 9);
        let graph = GraphState {
            built: true,
            members: vec![embedded.id().clone()],
            stale: vec![(ChunkId("outline:retired".into()), vec![0.0, 0.6, 0.8])],
            dirty_count: 2,
        };
        let mut chunks = vec![embedded, degraded];
        chunks.sort_by(|a, b| a.id().cmp(b.id()));
        CategorySnapshot {
            category: Category::Outline,
            state: CategoryState::Active,
            dimensions: Some(3),
            chunks,
            graph,
        }
    }

    #[test]
    fn crc32_known_value() {
        // Standard check value for "123456789".
        assert_eq!(crc32_compute(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn snapshot_round_trips() {
        let mut engine = PersistenceEngine::open_in_memory(&PersistenceConfig::default())
            .expect("open");
        let original = snapshot();
        engine.save_snapshot(&original).expect("save");
        let loaded = engine.load_snapshot(Category::Outline).expect("load");
        assert_eq!(loaded, original);
    }

    #[test]
    fn saving_twice_replaces_contents() {
        let mut engine = PersistenceEngine::open_in_memory(&PersistenceConfig::default())
            .expect("open");
        engine.save_snapshot(&snapshot()).expect("save");
        let empty = CategorySnapshot {
            category: Category::Outline,
            state: CategoryState::Inactive,
            dimensions: None,
            chunks: Vec::new(),
            graph: GraphState::default(),
        };
        engine.save_snapshot(&empty).expect("save");
        assert_eq!(engine.load_snapshot(Category::Outline).expect("load"), empty);
    }

    #[test]
    fn wrong_category_is_corruption() {
        let mut engine = PersistenceEngine::open_in_memory(&PersistenceConfig::default())
            .expect("open");
        engine.save_snapshot(&snapshot()).expect("save");
        let err = engine.load_snapshot(Category::History).unwrap_err();
        assert!(matches!(
            err,
            QuillError::IndexCorruption {
                category: Category::History,
                ..
            }
        ));
    }

    #[test]
    fn tampered_text_is_detected() {
        let mut engine = PersistenceEngine::open_in_memory(&PersistenceConfig::default())
            .expect("open");
        engine.save_snapshot(&snapshot()).expect("save");
        engine
            .conn
            .execute("UPDATE chunks SET text = 'forged' WHERE position = 9", [])
            .expect("tamper");
        let err = engine.load_snapshot(Category::Outline).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn tampering_without_checksum_still_fails_identity_check() {
        let config = PersistenceConfig {
            checksum_enabled: false,
            ..PersistenceConfig::default()
        };
        let mut engine = PersistenceEngine::open_in_memory(&config).expect("open");
        engine.save_snapshot(&snapshot()).expect("save");
        engine
            .conn
            .execute("UPDATE chunks SET text = 'forged' WHERE position = 9", [])
            .expect("tamper");
        let err = engine.load_snapshot(Category::Outline).unwrap_err();
        assert!(err.to_string().contains("does not match its content"));
    }

    #[test]
    fn missing_row_breaks_count() {
        let mut engine = PersistenceEngine::open_in_memory(&PersistenceConfig::default())
            .expect("open");
        engine.save_snapshot(&snapshot()).expect("save");
        engine
            .conn
            .execute("DELETE FROM chunks WHERE position = 4", [])
            .expect("tamper");
        let err = engine.load_snapshot(Category::Outline).unwrap_err();
        assert!(err.to_string().contains("expected 2 chunks"));
    }

    #[test]
    fn empty_database_is_corruption() {
        let engine = PersistenceEngine::open_in_memory(&PersistenceConfig::default())
            .expect("open");
        assert!(matches!(
            engine.load_snapshot(Category::Character),
            Err(QuillError::IndexCorruption { .. })
        ));
    }

    #[test]
    fn file_round_trip_and_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = CategorySnapshot::path_in(dir.path(), Category::Outline);
        let config = PersistenceConfig::default();
        let original = snapshot();
        {
            let mut engine = PersistenceEngine::open(&path, &config).expect("open");
            engine.save_snapshot(&original).expect("save");
            engine.backup(dir.path().join("outline.bak.db")).expect("backup");
        }
        let engine = PersistenceEngine::open_existing(&path, &config).expect("reopen");
        assert_eq!(engine.load_snapshot(Category::Outline).expect("load"), original);

        let backup = PersistenceEngine::open_existing(dir.path().join("outline.bak.db"), &config)
            .expect("open backup");
        assert_eq!(backup.load_snapshot(Category::Outline).expect("load"), original);
    }

    #[test]
    fn garbage_file_is_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = CategorySnapshot::path_in(dir.path(), Category::History);
        std::fs::write(&path, b"definitely not a sqlite database, just some bytes").expect("write");
        let engine = PersistenceEngine::open_existing(&path, &PersistenceConfig::default())
            .expect("open is lazy");
        assert!(matches!(
            engine.load_snapshot(Category::History),
            Err(QuillError::IndexCorruption { .. })
        ));
    }

    #[test]
    fn graph_membership_is_checksummed() {
        let mut engine = PersistenceEngine::open_in_memory(&PersistenceConfig::default())
            .expect("open");
        engine.save_snapshot(&snapshot()).expect("save");
        engine
            .conn
            .execute("UPDATE chunks SET in_graph = 0 WHERE position = 4", [])
            .expect("tamper");
        let err = engine.load_snapshot(Category::Outline).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn graph_partition_without_graph_is_corruption() {
        let config = PersistenceConfig {
            checksum_enabled: false,
            ..PersistenceConfig::default()
        };
        let mut engine = PersistenceEngine::open_in_memory(&config).expect("open");
        engine.save_snapshot(&snapshot()).expect("save");
        engine
            .conn
            .execute("UPDATE meta SET value = 'false' WHERE key = 'graph_built'", [])
            .expect("tamper");
        let err = engine.load_snapshot(Category::Outline).unwrap_err();
        assert!(err.to_string().contains("without a graph"));
    }

    #[test]
    fn files_without_graph_column_are_migrated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = CategorySnapshot::path_in(dir.path(), Category::Outline);
        {
            let conn = Connection::open(&path).expect("create");
            conn.execute_batch(
                "CREATE TABLE chunks (
                    id TEXT PRIMARY KEY, position INTEGER NOT NULL,
                    created_at TEXT NOT NULL, text TEXT NOT NULL, embedding BLOB
                );",
            )
            .expect("old schema");
        }
        let mut engine = PersistenceEngine::open(&path, &PersistenceConfig::default())
            .expect("open migrates");
        let original = snapshot();
        engine.save_snapshot(&original).expect("save");
        assert_eq!(engine.load_snapshot(Category::Outline).expect("load"), original);
    }
}
