//! Near-duplicate image clustering over large media libraries.
//!
//! [`DuplicateFinder`] is the entry point: it pages through clusters of
//! visually similar images, scanning the library incrementally behind a
//! staleness-aware cache.

pub mod config;
pub mod core;
pub mod services;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, FinderConfig};
pub use services::{DuplicateFinder, FilesystemAssetSource, LumaGridExtractor, PageRequest};
