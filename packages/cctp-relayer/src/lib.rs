//! CCTP Relayer - Library interface
//!
//! Re-exports internal modules for use in integration tests.

pub mod api;
pub mod attestation;
pub mod bounded_cache;
pub mod broadcast;
pub mod chain;
pub mod config;
pub mod flush;
pub mod hash;
pub mod listener;
pub mod message;
pub mod metrics;
pub mod processor;
pub mod relayer;
pub mod retry;
pub mod sequence;
pub mod shutdown;
pub mod state;
pub mod types;
