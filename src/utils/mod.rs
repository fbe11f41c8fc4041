//! Utility functions

pub mod enhance;
pub mod image;
pub mod math;
