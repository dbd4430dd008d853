//! Shared types for the AI-CORE notification engine

pub mod types;

// Export all types from types module
pub use types::*;
