//! Numerical utilities: interpolation, the log-wavelength grid, polynomials and
//! SVD least squares.

pub mod grid;
pub mod interp;
pub mod ols;
pub mod poly;

pub use grid::*;
pub use interp::*;
pub use ols::*;
pub use poly::*;
