// Core modules
pub mod api;
pub mod config;
pub mod engine;
pub mod execution;
pub mod indicators;
pub mod market;
pub mod models;
pub mod persistence;
pub mod scheduler;
pub mod strategy;

// Re-export commonly used types
pub use engine::{Engine, Shutdown};
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
