//! `rv-forward` library crate.
//!
//! Forward-model radial velocities: a stellar template, an optional absorption
//! cell and absorber templates are Doppler-shifted, multiplied, convolved with a
//! parameterised instrumental profile and mapped onto detector pixels, then
//! fitted to an observed spectrum in stages.
//!
//! The binary (`rvf`) is a thin wrapper around this library so that:
//!
//! - core logic is testable without spawning processes
//! - the model and fitter are reusable from other front ends

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
