// vim: tw=80
//! Device layer for dm-zoned administration
//!
//! Discovers the backing devices of a dm-zoned target, classifies their zone
//! model, validates their zone geometry, and presents them as one flat
//! address space of 4 KiB metadata blocks.

pub mod bdev;
pub mod config;
pub mod device_set;
pub mod probe;
pub mod report;
pub mod sysfs;
pub mod translate;
pub mod types;
pub mod zone;

pub use crate::types::*;
