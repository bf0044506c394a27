//! Integration tests for the canopy exploration scheduler

mod config_integration;
mod explorer_pipeline;
mod frontier_concurrency;
mod store_integration;
pub mod support;
