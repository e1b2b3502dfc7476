//! gridup-core — shared domain types for the gridup scale-up recommender.
//!
//! Everything that crosses a crate boundary lives here: worker pools, pod
//! and node descriptors, node templates, the simulation request/response
//! envelope, and the resource-quantity arithmetic they all share.

pub mod constants;
pub mod resources;
pub mod types;

pub use resources::{ParseQuantityError, Quantity, ResourceList};
pub use types::*;
