//! Capability traits implemented by providers, embedders and tools.

pub mod embedder;
pub mod provider;
pub mod tool;

pub use embedder::Embedder;
pub use provider::Provider;
pub use tool::Tool;
