//! Spectral models: the IP kernel library, the forward model and its
//! band-limited linear variant.

pub mod band;
pub mod forward;
pub mod kernel;

pub use band::*;
pub use forward::*;
pub use kernel::*;
