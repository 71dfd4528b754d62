pub mod api;
pub mod config;
pub mod error;
pub mod indexer;
pub mod models;
pub mod pipeline;
pub mod rag;
pub mod session;
