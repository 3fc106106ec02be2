//! Document ingestion: load, chunk, embed, index.

use std::path::Path;
use std::sync::Arc;

use carebot_core::error::{CarebotError, Result};
use carebot_memory::Storage;

use crate::chunker::TextSplitter;
use crate::embedding::EmbeddingClient;
use crate::index::{Chunk, VectorIndex};

/// Extracted text of one source document.
#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    pub text: String,
}

/// Summary of an ingestion run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub documents: usize,
    pub chunks: usize,
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub avg_tokens: f64,
}

/// Load every `*.txt` file in `dir`, sorted by file name.
///
/// The document name is the file stem (`Diabetes.txt` → `Diabetes`).
pub fn load_documents(dir: &Path) -> Result<Vec<Document>> {
    if !dir.is_dir() {
        return Err(CarebotError::Config(format!(
            "documents directory not found: {}",
            dir.display()
        )));
    }

    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "txt"))
        .collect();
    paths.sort();

    let mut docs = Vec::with_capacity(paths.len());
    for path in paths {
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => String::from_utf8_lossy(&std::fs::read(&path)?).into_owned(),
        };
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        docs.push(Document { name, text });
    }

    if docs.is_empty() {
        tracing::warn!("No .txt documents found under {}", dir.display());
    }
    Ok(docs)
}

/// 8-character document id taken from a random UUID.
pub fn new_doc_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub fn chunk_id(doc_id: &str, seq: usize) -> String {
    format!("{doc_id}:{seq:04}")
}

/// Chunk and embed `docs`, then replace the vector index with the result.
///
/// The index is only touched once every embedding succeeded, so a failed run
/// leaves the previous knowledge base in place.
pub async fn ingest_documents(
    docs: &[Document],
    splitter: &TextSplitter,
    embeddings: &EmbeddingClient,
    storage: &Arc<Storage>,
) -> Result<IngestReport> {
    let mut chunks = Vec::new();
    let mut token_counts = Vec::new();

    for doc in docs {
        let doc_id = new_doc_id();
        let pieces = splitter.split(&doc.text)?;
        tracing::info!("{}: {} chunks", doc.name, pieces.len());
        for (i, text) in pieces.into_iter().enumerate() {
            token_counts.push(splitter.token_count(&text)?);
            chunks.push(Chunk {
                chunk_id: chunk_id(&doc_id, i + 1),
                text,
                doc_name: doc.name.clone(),
                vector: None,
            });
        }
    }

    let report = IngestReport {
        documents: docs.len(),
        chunks: chunks.len(),
        min_tokens: token_counts.iter().copied().min().unwrap_or(0),
        max_tokens: token_counts.iter().copied().max().unwrap_or(0),
        avg_tokens: if token_counts.is_empty() {
            0.0
        } else {
            token_counts.iter().sum::<usize>() as f64 / token_counts.len() as f64
        },
    };
    tracing::info!(
        "Chunk sizes in tokens: min {}, max {}, avg {:.1}",
        report.min_tokens,
        report.max_tokens,
        report.avg_tokens
    );

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embeddings.embed(&texts).await?;
    for (chunk, vector) in chunks.iter_mut().zip(vectors) {
        chunk.vector = Some(vector);
    }

    let mut conn = storage.acquire().await?;
    let mut index = VectorIndex::open(&mut conn, embeddings.dimensions())?;
    index.replace_all(&chunks)?;

    tracing::info!(
        "Indexed {} chunks from {} documents",
        report.chunks,
        report.documents
    );
    Ok(report)
}
