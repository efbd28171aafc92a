//! Fitting: parameter layout, the damped least-squares solver, the staged
//! refinement of one chunk and the aggregate over chunks.

pub mod aggregate;
pub mod lm;
pub mod params;
pub mod stages;

pub use aggregate::*;
pub use lm::*;
pub use params::*;
pub use stages::*;
