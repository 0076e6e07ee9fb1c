//! Core types for the clashstore clash-zone persistence library.
//!
//! This crate defines the shared error type (`ClashError`), geometry
//! primitives (`Point3`, `Aabb`, `Rotation`), the ordered case-insensitive
//! parameter bag, and the traits the store consumes from the host
//! environment (`ElementExistenceOracle`, `GeometryProvider`,
//! `ScopeProvider`).
//!
//! It has minimal external dependencies and is intended to be depended on
//! by every other crate in the workspace.

pub mod error;
pub mod geometry;
pub mod params;
pub mod traits;

pub use error::{ClashError, ClashResult};
pub use geometry::{Aabb, Point3, Rotation};
pub use params::ParamBag;
pub use traits::{ElementExistenceOracle, GeometryProvider, ScopeProvider};
