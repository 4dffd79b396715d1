//! Core of the relay bot: rate-limited dispatch and long-polling ingestion.
//!
//! This crate is intentionally framework-agnostic. Telegram and the market-data
//! API live behind ports (traits) implemented in adapter crates.

pub mod config;
pub mod cursor;
pub mod dispatch;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod ingest;
pub mod logging;
pub mod messaging;
pub mod ratelimit;
pub mod report;
pub mod store;

pub use errors::{Error, Result};
