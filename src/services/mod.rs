// src/services/mod.rs

// Query governor and its collaborators
pub mod persistence_layer;

// Re-export commonly used services
pub use persistence_layer::{
    GovernorConfig, GovernorStats, PoolConfig, QueryGovernor, QueryGovernorBuilder,
};
