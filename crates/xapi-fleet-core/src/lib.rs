//! Core types for xapi-fleet.
//!
//! This crate provides the identifiers shared by every other crate in the
//! workspace: registered servers, reconciled domain objects, and remote
//! references.
//!
//! # Example
//!
//! ```
//! use xapi_fleet_core::{ObjectId, RawId, ServerId};
//!
//! let server_id = ServerId::generate();
//! let object_id = ObjectId::new("b7569d99-30f8-178a-7d94-801de3e29b5b").unwrap();
//! let raw_id = RawId::from("OpaqueRef:c2a1d6a8-8e0e-4a0e-9f3d-5a0b3e1d7c11");
//!
//! assert!(!raw_id.is_null());
//! println!("{server_id} reports {object_id} as {raw_id}");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod ids;

pub use ids::{IdError, ObjectId, RawId, ServerId};
