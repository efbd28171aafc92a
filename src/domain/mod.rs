//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - input data (`Chunk`, `Template`)
//! - configuration enums (`IpKind`, `NormKind`) and `ModelSettings`
//! - per-chunk RV outcomes (`ChunkRv`)

pub mod types;

pub use types::*;
