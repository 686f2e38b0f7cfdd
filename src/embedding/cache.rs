// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite-backed content-addressed cache for embedding vectors.
//!
//! Entries are keyed by (SHA-256 of the text bytes, model, model
//! version). Only short, query-like texts are cached; long documents are
//! recomputed every call so the cache stays bounded. A stored vector
//! whose dimensionality no longer matches the configured model is
//! deleted on read and reported as a miss, which lets the cache heal
//! itself across model migrations.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

/// Texts longer than this many characters are not cached.
pub const DEFAULT_MAX_TEXT_LEN: usize = 1500;

/// A frequently used cache entry, for warm-up.
#[derive(Debug, Clone)]
pub struct FrequentEntry {
    pub text: String,
    pub frequency: u64,
}

/// Content-addressed embedding cache.
///
/// Stored in a single SQLite file; concurrent writers are resolved by
/// upsert-on-conflict semantics (last write wins on the vector, the
/// frequency counter accumulates).
pub struct EmbeddingCache {
    conn: Connection,
    path: PathBuf,
    max_text_len: usize,
}

impl EmbeddingCache {
    /// Opens or creates a cache at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        let cache = Self {
            conn,
            path,
            max_text_len: DEFAULT_MAX_TEXT_LEN,
        };
        cache.init_schema()?;
        Ok(cache)
    }

    /// Opens an in-memory cache (tests, ephemeral runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let cache = Self {
            conn,
            path: PathBuf::from(":memory:"),
            max_text_len: DEFAULT_MAX_TEXT_LEN,
        };
        cache.init_schema()?;
        Ok(cache)
    }

    /// Sets the caching length threshold in characters.
    pub fn with_max_text_len(mut self, max_text_len: usize) -> Self {
        self.max_text_len = max_text_len;
        self
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                text_hash TEXT NOT NULL,
                text TEXT NOT NULL,
                model TEXT NOT NULL,
                model_version TEXT NOT NULL,
                dimensions INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                frequency INTEGER NOT NULL DEFAULT 1,
                last_used INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (text_hash, model, model_version)
            );

            CREATE INDEX IF NOT EXISTS idx_embeddings_frequency
                ON embeddings(frequency DESC);
            "#,
            )
            .context("Failed to initialize cache schema")?;
        Ok(())
    }

    /// Returns the path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a text is short enough to be cached.
    pub fn is_cacheable(&self, text: &str) -> bool {
        text.chars().count() <= self.max_text_len
    }

    /// Looks up the cached vector for (text, model, model_version).
    ///
    /// A stored entry whose vector length differs from `expected_dim` is
    /// deleted and reported as a miss.
    pub fn get(
        &self,
        text: &str,
        model: &str,
        model_version: &str,
        expected_dim: usize,
    ) -> Result<Option<Vec<f32>>> {
        if !self.is_cacheable(text) {
            return Ok(None);
        }
        let hash = text_hash(text);

        let row: Option<(i64, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT dimensions, embedding FROM embeddings \
                 WHERE text_hash = ?1 AND model = ?2 AND model_version = ?3",
                params![hash, model, model_version],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query embedding cache")?;

        let Some((dimensions, blob)) = row else {
            return Ok(None);
        };

        let vector = blob_to_vector(&blob);
        if dimensions as usize != expected_dim || vector.len() != expected_dim {
            // Stale entry from a previous model configuration.
            self.conn
                .execute(
                    "DELETE FROM embeddings \
                     WHERE text_hash = ?1 AND model = ?2 AND model_version = ?3",
                    params![hash, model, model_version],
                )
                .context("Failed to purge stale embedding")?;
            return Ok(None);
        }

        Ok(Some(vector))
    }

    /// Upserts a vector for (text, model, model_version).
    ///
    /// On conflict the stored vector is replaced, the frequency counter
    /// increments and the last-used timestamp refreshes. Texts over the
    /// length threshold are silently skipped.
    pub fn put(&self, text: &str, vector: &[f32], model: &str, model_version: &str) -> Result<()> {
        if !self.is_cacheable(text) {
            return Ok(());
        }
        let hash = text_hash(text);
        let now = unix_now();
        let blob = vector_to_blob(vector);

        self.conn
            .execute(
                r#"
            INSERT INTO embeddings
                (text_hash, text, model, model_version, dimensions, embedding,
                 frequency, last_used, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)
            ON CONFLICT(text_hash, model, model_version) DO UPDATE SET
                dimensions = excluded.dimensions,
                embedding = excluded.embedding,
                frequency = frequency + 1,
                last_used = excluded.last_used
            "#,
                params![hash, text, model, model_version, vector.len() as i64, blob, now],
            )
            .context("Failed to upsert embedding")?;
        Ok(())
    }

    /// Counts stored entries.
    pub fn len(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// True when the cache holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns the frequency counter for a cached text, if present.
    pub fn frequency(&self, text: &str, model: &str, model_version: &str) -> Result<Option<u64>> {
        let hash = text_hash(text);
        let frequency: Option<i64> = self
            .conn
            .query_row(
                "SELECT frequency FROM embeddings \
                 WHERE text_hash = ?1 AND model = ?2 AND model_version = ?3",
                params![hash, model, model_version],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query frequency")?;
        Ok(frequency.map(|f| f as u64))
    }

    /// Deletes every entry whose vector length differs from
    /// `expected_dim` for the given model. Returns the number purged.
    pub fn purge_invalid(&self, model: &str, expected_dim: usize) -> Result<usize> {
        let purged = self
            .conn
            .execute(
                "DELETE FROM embeddings WHERE model = ?1 AND dimensions != ?2",
                params![model, expected_dim as i64],
            )
            .context("Failed to purge invalid embeddings")?;
        Ok(purged)
    }

    /// Removes all entries.
    pub fn clear(&self) -> Result<()> {
        self.conn
            .execute("DELETE FROM embeddings", [])
            .context("Failed to clear embedding cache")?;
        Ok(())
    }

    /// Lists the most frequently used cached texts for warm-up.
    pub fn frequent(&self, model: &str, model_version: &str, limit: usize) -> Result<Vec<FrequentEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT text, frequency FROM embeddings \
             WHERE model = ?1 AND model_version = ?2 \
             ORDER BY frequency DESC LIMIT ?3",
        )?;
        let entries = stmt
            .query_map(params![model, model_version, limit as i64], |row| {
                Ok(FrequentEntry {
                    text: row.get(0)?,
                    frequency: row.get::<_, i64>(1)? as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list frequent texts")?;
        Ok(entries)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// SHA-256 of the exact UTF-8 text bytes, hex-encoded.
pub fn text_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MODEL: &str = "test-embedding";
    const VERSION: &str = "1.0";

    #[test]
    fn test_cache_create_and_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("embeddings.sqlite");

        let cache = EmbeddingCache::open(&db_path).unwrap();
        cache.put("hello", &[0.1, 0.2], MODEL, VERSION).unwrap();
        drop(cache);

        let cache = EmbeddingCache::open(&db_path).unwrap();
        let vector = cache.get("hello", MODEL, VERSION, 2).unwrap();
        assert_eq!(vector, Some(vec![0.1, 0.2]));
    }

    #[test]
    fn test_put_get_roundtrip_bit_for_bit() {
        let cache = EmbeddingCache::open_in_memory().unwrap();
        let vector: Vec<f32> = vec![0.123_456_79, -1.5, f32::MIN_POSITIVE, 42.0];
        cache.put("query text", &vector, MODEL, VERSION).unwrap();

        let cached = cache.get("query text", MODEL, VERSION, 4).unwrap().unwrap();
        assert_eq!(cached.len(), vector.len());
        for (a, b) in cached.iter().zip(vector.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_miss_for_unknown_key() {
        let cache = EmbeddingCache::open_in_memory().unwrap();
        assert!(cache.get("absent", MODEL, VERSION, 2).unwrap().is_none());
    }

    #[test]
    fn test_model_scoping() {
        let cache = EmbeddingCache::open_in_memory().unwrap();
        cache.put("text", &[1.0, 2.0], MODEL, VERSION).unwrap();
        assert!(cache.get("text", "other-model", VERSION, 2).unwrap().is_none());
        assert!(cache.get("text", MODEL, "2.0", 2).unwrap().is_none());
    }

    #[test]
    fn test_dimension_mismatch_self_heals() {
        let cache = EmbeddingCache::open_in_memory().unwrap();
        cache.put("text", &[1.0, 2.0, 3.0], MODEL, VERSION).unwrap();

        // Reading with a different expected dimensionality purges the row.
        assert!(cache.get("text", MODEL, VERSION, 2).unwrap().is_none());
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn test_frequency_increments_on_upsert() {
        let cache = EmbeddingCache::open_in_memory().unwrap();
        cache.put("text", &[1.0], MODEL, VERSION).unwrap();
        cache.put("text", &[1.0], MODEL, VERSION).unwrap();
        cache.put("text", &[2.0], MODEL, VERSION).unwrap();

        assert_eq!(cache.frequency("text", MODEL, VERSION).unwrap(), Some(3));
        // Last write wins on the vector.
        assert_eq!(cache.get("text", MODEL, VERSION, 1).unwrap(), Some(vec![2.0]));
    }

    #[test]
    fn test_long_texts_are_not_cached() {
        let cache = EmbeddingCache::open_in_memory().unwrap().with_max_text_len(10);
        let long = "x".repeat(11);
        cache.put(&long, &[1.0], MODEL, VERSION).unwrap();
        assert!(cache.is_empty().unwrap());
        assert!(cache.get(&long, MODEL, VERSION, 1).unwrap().is_none());
    }

    #[test]
    fn test_purge_invalid() {
        let cache = EmbeddingCache::open_in_memory().unwrap();
        cache.put("a", &[1.0, 2.0], MODEL, VERSION).unwrap();
        cache.put("b", &[1.0, 2.0, 3.0], MODEL, VERSION).unwrap();

        let purged = cache.purge_invalid(MODEL, 2).unwrap();
        assert_eq!(purged, 1);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_frequent_orders_by_usage() {
        let cache = EmbeddingCache::open_in_memory().unwrap();
        cache.put("rare", &[1.0], MODEL, VERSION).unwrap();
        for _ in 0..3 {
            cache.put("popular", &[1.0], MODEL, VERSION).unwrap();
        }

        let entries = cache.frequent(MODEL, VERSION, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "popular");
        assert_eq!(entries[0].frequency, 3);
    }

    #[test]
    fn test_text_hash_is_stable_sha256() {
        // SHA-256 of the empty string is a well-known constant.
        assert_eq!(
            text_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(text_hash("a"), text_hash("a"));
        assert_ne!(text_hash("a"), text_hash("b"));
    }
}
