//! # Carebot Gateway
//! HTTP surface over the assistant. Conversation turns are streamed back as
//! server-sent events.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
