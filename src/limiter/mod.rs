//! Per-key request accounting with temporary blocks.

pub mod window;

pub use window::{Admission, RateCounter, RatePolicy, RateWindow};
