//! Stochastic network calculus: arrival models, operator algebra, and the
//! numerical searches that evaluate tight latency bounds.
//!
//! Time is discretized into small steps to approximate a continuous-time
//! system; all service rates and latency results are scaled by [`STEP_SIZE`].

pub mod arrival;
pub mod operators;
pub mod search;

/// Discrete SNC timestep in seconds.
pub const STEP_SIZE: f64 = 1e-5;
