//! Tessera Common - Shared types and utilities
//!
//! This crate provides the object identifiers, configuration, error
//! definitions and checksum helpers used by the blockstore and its daemon.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::DataCrc;
pub use config::{BlockstoreConfig, DeviceConfig};
pub use error::{Error, Result};
pub use types::*;
