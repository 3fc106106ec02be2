//! # Carebot Knowledge Base
//!
//! Retrieval side of Carebot: documents are split into overlapping token
//! windows, embedded in sequential batches and stored in a flat cosine
//! index on the shared SQLite file.
//!
//! ## How it works
//! ```text
//! docs/*.txt
//!   ↓ TextSplitter (512-token windows, 150 overlap)
//! chunks "3f9a1c2b:0001" ...
//!   ↓ EmbeddingClient (batches of 64, retry with backoff)
//! vectors
//!   ↓ VectorIndex::replace_all
//! SQLite `vectors` table
//!
//! query → embed_one → VectorIndex::search → top-k {text, doc_name, score}
//! ```

pub mod chunker;
pub mod embedding;
pub mod index;
pub mod ingest;

pub use chunker::{HfTokenizer, TextSplitter, TokenCodec};
pub use embedding::{EmbeddingClient, RetryPolicy};
pub use index::{Chunk, SearchResult, VectorIndex};
pub use ingest::{Document, IngestReport, ingest_documents, load_documents};
