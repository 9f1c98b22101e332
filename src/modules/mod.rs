//! Network building blocks on top of burn's functional tensor ops.
//!
//! Every layer holds explicit weight tensors, registers its geometry in a
//! [`VcGraph`](crate::geometry::VcGraph) when built, and exports its
//! parameters into a [`StateDict`](crate::weights::StateDict).

pub mod conv;
pub mod encoder;
pub mod init;
pub mod ops;
pub mod preprocess;
pub mod wavenet;
