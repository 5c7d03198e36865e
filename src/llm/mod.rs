//! LLM integration: the client seam and the per-axis analysis schemas.

pub mod analysis;
pub mod client;
