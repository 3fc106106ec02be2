//! # Carebot Tools
//!
//! Tools the model can call during a turn. Each implements
//! `carebot_core::traits::Tool` and is looked up by name in a [`ToolRegistry`].

pub mod knowledge;
pub mod registry;

pub use knowledge::{KNOWLEDGE_TOOL_NAME, KnowledgeTool, Passage};
pub use registry::ToolRegistry;
