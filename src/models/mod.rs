//! Core data models for the deposit ingestion service.
//!
//! A deposit's on-disk record (`deposit.properties`) is the source of truth;
//! these values are projections of it, rehydrated on every access and
//! serialized naturally as JSON via `serde` where the HTTP layer needs them.

pub mod collection;
pub mod deposit;
pub mod depositor;
