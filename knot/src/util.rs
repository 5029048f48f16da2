//! Utilities for the knot crate.

pub mod fs;
