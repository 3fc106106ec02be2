//! Knowledge base retrieval tool.
//!
//! Embeds the model's query, runs a top-k search on the vector index and
//! returns the hits verbatim as a JSON list of `{text, doc_name, score}`.

use std::sync::Arc;

use async_trait::async_trait;
use carebot_core::error::{CarebotError, Result};
use carebot_core::traits::Tool;
use carebot_core::types::{ToolDefinition, ToolResult};
use carebot_knowledge::{EmbeddingClient, VectorIndex};
use carebot_memory::Storage;
use serde::{Deserialize, Serialize};

pub const KNOWLEDGE_TOOL_NAME: &str = "QueryKnowledgeBaseTool";

#[derive(Debug, Deserialize)]
struct QueryArgs {
    query_input: String,
    #[serde(default)]
    top_k: Option<i64>,
}

/// One retrieved passage as shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub doc_name: String,
    pub score: f32,
}

pub struct KnowledgeTool {
    embeddings: Arc<EmbeddingClient>,
    storage: Arc<Storage>,
    top_k: usize,
    max_top_k: usize,
}

impl KnowledgeTool {
    pub fn new(
        embeddings: Arc<EmbeddingClient>,
        storage: Arc<Storage>,
        top_k: usize,
        max_top_k: usize,
    ) -> Self {
        Self {
            embeddings,
            storage,
            top_k,
            max_top_k: max_top_k.max(1),
        }
    }

    /// Search the knowledge base for `query`.
    pub async fn query(&self, query: &str, top_k: usize) -> Result<Vec<Passage>> {
        let vector = self.embeddings.embed_one(query).await?;
        let mut conn = self.storage.acquire().await?;
        let index = VectorIndex::open(&mut conn, self.embeddings.dimensions())?;
        let hits = index.search(&vector, top_k)?;
        tracing::debug!("Knowledge query {query:?} returned {} hit(s)", hits.len());
        Ok(hits
            .into_iter()
            .map(|h| Passage {
                text: h.text,
                doc_name: h.doc_name,
                score: h.score,
            })
            .collect())
    }
}

#[async_trait]
impl Tool for KnowledgeTool {
    fn name(&self) -> &str {
        KNOWLEDGE_TOOL_NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: KNOWLEDGE_TOOL_NAME.into(),
            description: "Query the medical knowledge base built from trusted health documents. \
                Returns the most relevant passages with their source document and similarity score."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query_input": {
                        "type": "string",
                        "description": "The question or symptoms to look up"
                    },
                    "top_k": {
                        "type": "integer",
                        "description": format!("Number of passages to return (default {}, max {})", self.top_k, self.max_top_k)
                    }
                },
                "required": ["query_input"]
            }),
        }
    }

    async fn execute(&self, arguments: &str) -> Result<ToolResult> {
        let args: QueryArgs = serde_json::from_str(arguments)
            .map_err(|e| CarebotError::Tool(format!("invalid arguments: {e}")))?;
        let query = args.query_input.trim();
        if query.is_empty() {
            return Err(CarebotError::Tool("query_input must not be empty".into()));
        }
        let top_k = match args.top_k {
            Some(k) if k < 0 => {
                return Err(CarebotError::Tool(format!("top_k must be >= 0, got {k}")));
            }
            Some(k) => (k as usize).min(self.max_top_k),
            None => self.top_k,
        };

        let passages = self.query(query, top_k).await?;
        Ok(ToolResult::ok(serde_json::to_string(&passages)?))
    }
}
