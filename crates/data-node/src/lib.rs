//! ECOHO data node
//!
//! Wires the loaded configuration to the market aggregator and the block feed.

pub mod service;

pub use service::DataLayerService;
