//! SkySync Core - Domain types and port definitions
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `SyncEvent`, `IndexEntry`, `Metadata`, `ExclusionTree`
//! - **Port definitions** - Traits for adapters: `IRemoteClient`, `ISyncIndex`,
//!   `IHashCache`, `IStateStore`
//! - **Configuration** - YAML configuration with validation
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure data and rules with no I/O. Ports define
//! trait interfaces that adapter crates implement, and the sync crate drives
//! the engine through them.

pub mod config;
pub mod domain;
pub mod ports;
