pub mod analyzer;
pub mod api;
pub mod chunker;
pub mod client;
pub mod config;
pub mod documents;
pub mod errors;
pub mod github;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod rate_limiter;
pub mod retrieval;
