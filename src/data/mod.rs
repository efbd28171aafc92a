//! Synthetic data sources.

pub mod synthetic;
