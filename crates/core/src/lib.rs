//! `folio-core`: domain primitives shared by every folio crate.
//!
//! This crate contains **pure domain** types (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{OwnerId, ProjectId};
