//! Shared primitives for the phylodyn workspace.
//!
//! - **Error types**: [`PhyloError`] and [`Result`] for structured error handling
//! - **Log-space numerics**: [`ln_factorial`], [`ln_sum_exp`]

pub mod error;
pub mod prob;

pub use error::{PhyloError, Result};
pub use prob::{ln_factorial, ln_sum_exp};
