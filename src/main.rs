//! # Carebot
//!
//! Retrieval-grounded health assistant.
//!
//! Usage:
//!   carebot ingest                 # Chunk, embed and index the document folder
//!   carebot serve                  # Start the HTTP gateway
//!   carebot chats                  # List stored chats
//!   carebot reset                  # Delete all chats and the vector index

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use carebot_agent::Assistant;
use carebot_core::config::{CarebotConfig, expand_path};
use carebot_core::traits::provider::GenerateParams;
use carebot_knowledge::{EmbeddingClient, HfTokenizer, TextSplitter};
use carebot_memory::{ChatStore, Storage};
use carebot_tools::{KnowledgeTool, ToolRegistry};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "carebot", version, about = "Retrieval-grounded health assistant")]
struct Cli {
    /// Config file (default: ~/.carebot/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Rebuild the knowledge base from a folder of .txt documents
    Ingest {
        #[arg(long)]
        docs_dir: Option<String>,
    },
    /// List stored chats, newest first
    Chats,
    /// Delete every chat and drop the vector index
    Reset,
    /// List supported LLM providers
    Providers,
}

fn load_config(path: Option<&PathBuf>) -> Result<CarebotConfig> {
    let config = match path {
        Some(p) => CarebotConfig::load_from(p)?,
        None => CarebotConfig::load()?,
    };
    Ok(config)
}

fn build_assistant(config: &CarebotConfig, storage: Arc<Storage>) -> Result<Assistant> {
    let provider = carebot_providers::create_provider(config)?;
    let embedder = carebot_providers::create_embedder(config)?;
    let embeddings = Arc::new(EmbeddingClient::from_config(embedder, &config.embedding));

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(KnowledgeTool::new(
        embeddings,
        storage.clone(),
        config.knowledge.top_k,
        config.knowledge.max_top_k,
    )));

    let params = GenerateParams {
        model: config.llm.model.clone(),
        temperature: config.llm.temperature,
        max_tokens: config.llm.max_tokens,
    };
    Ok(Assistant::new(provider, tools, storage, config.chat.clone(), params))
}

async fn ingest(config: &CarebotConfig, storage: &Arc<Storage>, docs_dir: Option<String>) -> Result<()> {
    let docs_dir = expand_path(docs_dir.as_deref().unwrap_or(&config.knowledge.docs_dir));
    let tokenizer_path = expand_path(&config.knowledge.tokenizer_path);

    let codec = HfTokenizer::from_file(&tokenizer_path)
        .with_context(|| format!("loading tokenizer from {}", tokenizer_path.display()))?;
    let splitter = TextSplitter::new(
        Arc::new(codec),
        config.knowledge.chunk_size,
        config.knowledge.chunk_overlap,
    )?;
    let embeddings = EmbeddingClient::from_config(
        carebot_providers::create_embedder(config)?,
        &config.embedding,
    );

    let docs = carebot_knowledge::load_documents(&docs_dir)?;
    tracing::info!("Loaded {} documents from {}", docs.len(), docs_dir.display());

    let report = carebot_knowledge::ingest_documents(&docs, &splitter, &embeddings, storage).await?;
    println!(
        "Indexed {} chunks from {} documents (tokens per chunk: min {}, max {}, avg {:.1})",
        report.chunks, report.documents, report.min_tokens, report.max_tokens, report.avg_tokens
    );
    Ok(())
}

async fn list_chats(storage: &Arc<Storage>) -> Result<()> {
    let mut conn = storage.acquire().await?;
    let chats = ChatStore::new(&mut conn).list_chats()?;
    if chats.is_empty() {
        println!("No chats yet.");
    }
    for chat in chats {
        let created = chrono::DateTime::from_timestamp(chat.created, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| chat.created.to_string());
        println!("{}  {}  {} messages", chat.id, created, chat.messages.len());
    }
    Ok(())
}

async fn reset(storage: &Arc<Storage>) -> Result<()> {
    let mut conn = storage.acquire().await?;
    let removed = {
        let mut store = ChatStore::new(&mut conn);
        let count = store.count()?;
        store.reset()?;
        count
    };
    carebot_knowledge::index::drop_index(&conn)?;
    println!("Deleted {removed} chats and the vector index.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "carebot=debug,carebot_agent=debug,carebot_knowledge=debug,carebot_providers=debug,carebot_gateway=debug,tower_http=debug"
    } else {
        "carebot=info,carebot_agent=info,carebot_knowledge=info,carebot_providers=info,carebot_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let mut config = load_config(cli.config.as_ref())?;
    let storage = Storage::from_config(&config.storage)?;

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let assistant = build_assistant(&config, storage)?;
            carebot_gateway::start(&config.gateway, assistant).await?;
        }
        Command::Ingest { docs_dir } => ingest(&config, &storage, docs_dir).await?,
        Command::Chats => list_chats(&storage).await?,
        Command::Reset => reset(&storage).await?,
        Command::Providers => {
            for name in carebot_providers::available_providers() {
                println!("{name}");
            }
        }
    }
    Ok(())
}
