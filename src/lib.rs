//! Canopy: Priority-Driven Conversation Tree Exploration
//!
//! Grows a tree of conversational states toward a goal by repeatedly
//! expanding the most promising unexpanded node through pluggable
//! generation and scoring capabilities, under a spending budget.

pub mod api;
pub mod capability;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod events;
pub mod explorer;
pub mod focus;
pub mod frontier;
pub mod geometry;
pub mod guard;
pub mod heartbeat;
pub mod logging;
pub mod priority;
pub mod projection;
pub mod provider;
pub mod settings;
pub mod store;
pub mod types;

pub use api::ExplorationApi;
pub use engine::{Engine, EngineOptions};
pub use error::{CapabilityError, ExploreError, StorageError};
pub use explorer::Explorer;
