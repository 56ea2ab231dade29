//! Core types and utilities for the ECOHO on-chain data layer
//!
//! This crate provides shared types used across all components:
//! - Market snapshot and per-source field ownership
//! - Block headers and connection state
//! - Error taxonomy shared by connectors and the block feed
//! - Configuration loading and endpoint validation

pub mod types;
pub mod config;
pub mod errors;

pub use types::*;
pub use config::*;
pub use errors::*;
