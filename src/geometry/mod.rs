//! Convolutional geometry tracking.
//!
//! A model's layers are mirrored by a chain of [`VcNode`]s in a [`VcGraph`].
//! The resolver walks that chain symbolically to find the exact windows each
//! tensor must cover, and the [`Trim`]s that cut over-produced tensors down to
//! a common, sample-aligned range.

pub mod grid;
pub mod resolve;
pub mod vconv;

use crate::error::GeometryError;

/// Result type for geometry operations.
pub type GeometryResult<T> = std::result::Result<T, GeometryError>;

pub use grid::{Extent, GridRange, Trim};
pub use resolve::{compute_inputs, input_range, output_range, unit_window, InputRanges};
pub use vconv::{Anchor, VcGraph, VcHandle, VcKind, VcNode, VcSpec, Waypoint, Waypoints};
