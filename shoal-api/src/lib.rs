//! Shoal API Library
//!
//! Control plane for master/worker engine clusters: registry, health,
//! lifecycle operations and the guided deployment workflow. Exposed as a
//! library for the server binary and for integration tests.

// Core modules
pub mod config;
pub mod error;
pub mod logging;
pub mod validation;

// Application state
pub mod state;
pub use state::AppState;

// Persistence
pub mod db;
pub mod registry;
pub mod hosts;

// Agent communication
pub mod agent;

// Clustering
pub mod cluster;
pub mod precheck;
pub mod deployment;
pub mod logs;

// HTTP surface
pub mod api;
pub mod health;
pub mod shutdown;
