//! Flat cosine vector index on SQLite.
//!
//! Every search is an exact scan over all stored vectors. Vectors are stored
//! as little-endian f32 blobs keyed `vector:<chunk_id>`, and the index records
//! the dimension it was built with.

use carebot_core::error::{CarebotError, Result};
use carebot_memory::sqlite_error;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};

/// Key namespace for vector records.
pub const VECTOR_PREFIX: &str = "vector:";

/// A unit of retrievable text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// `<doc_id>:<seq>`, e.g. `3f9a1c2b:0001`.
    pub chunk_id: String,
    pub text: String,
    pub doc_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub text: String,
    pub doc_name: String,
    /// 1 − cosine distance, clamped to [0, 1].
    pub score: f32,
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS vectors (
            key TEXT PRIMARY KEY,
            chunk_id TEXT NOT NULL UNIQUE,
            text TEXT NOT NULL,
            doc_name TEXT NOT NULL,
            vector BLOB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS vector_meta (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );",
    )
    .map_err(sqlite_error)
}

fn record_dimensions(conn: &Connection, dimensions: usize) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO vector_meta (name, value) VALUES ('dimensions', ?1)",
        params![dimensions as i64],
    )
    .map_err(sqlite_error)?;
    Ok(())
}

fn recreate(tx: &Transaction<'_>, dimensions: usize) -> Result<()> {
    tx.execute_batch("DROP TABLE IF EXISTS vectors; DROP TABLE IF EXISTS vector_meta;")
        .map_err(sqlite_error)?;
    create_tables(tx)?;
    record_dimensions(tx, dimensions)
}

/// Remove the index entirely; the next `open` records a fresh dimension.
pub fn drop_index(conn: &Connection) -> Result<()> {
    conn.execute_batch("DROP TABLE IF EXISTS vectors; DROP TABLE IF EXISTS vector_meta;")
        .map_err(sqlite_error)
}

fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(chunk_id: &str, bytes: &[u8], dimensions: usize) -> Result<Vec<f32>> {
    if bytes.len() != dimensions * 4 {
        return Err(CarebotError::Storage(format!(
            "vector for {chunk_id} has {} bytes, expected {}",
            bytes.len(),
            dimensions * 4
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Raw cosine similarity in [-1, 1]; 0 when either vector is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0f32;
    let mut norm_a = 0f32;
    let mut norm_b = 0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Vector index over one pooled connection.
pub struct VectorIndex<'a> {
    conn: &'a mut Connection,
    dimensions: usize,
}

impl<'a> VectorIndex<'a> {
    /// Open the index, creating it on first use. Fails with
    /// `DimensionMismatch` when it was built for another dimension.
    pub fn open(conn: &'a mut Connection, dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(CarebotError::Config("vector dimension must be > 0".into()));
        }
        create_tables(conn)?;
        let stored: Option<i64> = conn
            .query_row(
                "SELECT value FROM vector_meta WHERE name = 'dimensions'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_error)?;
        match stored {
            Some(d) if d as usize != dimensions => {
                return Err(CarebotError::DimensionMismatch {
                    expected: d as usize,
                    actual: dimensions,
                });
            }
            Some(_) => {}
            None => record_dimensions(conn, dimensions)?,
        }
        Ok(Self { conn, dimensions })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn validate(&self, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            match &chunk.vector {
                Some(v) if v.len() == self.dimensions => {}
                Some(v) => {
                    return Err(CarebotError::DimensionMismatch {
                        expected: self.dimensions,
                        actual: v.len(),
                    });
                }
                None => {
                    return Err(CarebotError::InvalidRequest(format!(
                        "chunk {} has no vector",
                        chunk.chunk_id
                    )));
                }
            }
        }
        Ok(())
    }

    fn write(tx: &Transaction<'_>, chunks: &[Chunk]) -> Result<()> {
        let mut stmt = tx
            .prepare(
                "INSERT OR REPLACE INTO vectors (key, chunk_id, text, doc_name, vector)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(sqlite_error)?;
        for chunk in chunks {
            let blob = encode_vector(chunk.vector.as_deref().unwrap_or_default());
            stmt.execute(params![
                format!("{VECTOR_PREFIX}{}", chunk.chunk_id),
                chunk.chunk_id,
                chunk.text,
                chunk.doc_name,
                blob
            ])
            .map_err(sqlite_error)?;
        }
        Ok(())
    }

    /// Insert or replace chunks in one transaction.
    pub fn upsert(&mut self, chunks: &[Chunk]) -> Result<()> {
        self.validate(chunks)?;
        let tx = self.conn.transaction().map_err(sqlite_error)?;
        Self::write(&tx, chunks)?;
        tx.commit().map_err(sqlite_error)?;
        tracing::debug!("Upserted {} chunk(s)", chunks.len());
        Ok(())
    }

    /// Drop and recreate the index.
    pub fn rebuild(&mut self) -> Result<()> {
        let tx = self.conn.transaction().map_err(sqlite_error)?;
        recreate(&tx, self.dimensions)?;
        tx.commit().map_err(sqlite_error)?;
        tracing::info!("Vector index rebuilt (dimension {})", self.dimensions);
        Ok(())
    }

    /// Rebuild and load `chunks` atomically; on failure the previous index stays.
    pub fn replace_all(&mut self, chunks: &[Chunk]) -> Result<()> {
        self.validate(chunks)?;
        let tx = self.conn.transaction().map_err(sqlite_error)?;
        recreate(&tx, self.dimensions)?;
        Self::write(&tx, chunks)?;
        tx.commit().map_err(sqlite_error)?;
        tracing::info!("Vector index replaced with {} chunk(s)", chunks.len());
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM vectors", [], |r| r.get(0))
            .map_err(sqlite_error)?;
        Ok(n as usize)
    }

    /// Every stored chunk with its vector, ordered by chunk id.
    pub fn all(&self) -> Result<Vec<Chunk>> {
        let mut stmt = self
            .conn
            .prepare("SELECT chunk_id, text, doc_name, vector FROM vectors ORDER BY chunk_id")
            .map_err(sqlite_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })
            .map_err(sqlite_error)?;

        let mut chunks = Vec::new();
        for row in rows {
            let (chunk_id, text, doc_name, blob) = row.map_err(sqlite_error)?;
            let vector = decode_vector(&chunk_id, &blob, self.dimensions)?;
            chunks.push(Chunk {
                chunk_id,
                text,
                doc_name,
                vector: Some(vector),
            });
        }
        Ok(chunks)
    }

    /// Exact top-k by cosine similarity, best first, ties by chunk id.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchResult>> {
        if query.len() != self.dimensions {
            return Err(CarebotError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        if top_k == 0 {
            return Ok(vec![]);
        }

        // Rank on the raw similarity; only the reported score is clamped
        let mut ranked: Vec<(f32, Chunk)> = self
            .all()?
            .into_iter()
            .map(|chunk| {
                let similarity = chunk
                    .vector
                    .as_deref()
                    .map(|v| cosine_similarity(query, v))
                    .unwrap_or(0.0);
                (similarity, chunk)
            })
            .collect();

        ranked.sort_by(|(sa, a), (sb, b)| sb.total_cmp(sa).then_with(|| a.chunk_id.cmp(&b.chunk_id)));
        ranked.truncate(top_k);

        Ok(ranked
            .into_iter()
            .map(|(similarity, chunk)| SearchResult {
                chunk_id: chunk.chunk_id,
                text: chunk.text,
                doc_name: chunk.doc_name,
                score: similarity.clamp(0.0, 1.0),
            })
            .collect())
    }
}
