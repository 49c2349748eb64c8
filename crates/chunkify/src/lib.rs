//! Conversion of layered container images into the chunkfs accelerated format.
//!
//! This crate implements the per-layer conversion pipeline: pulling a source
//! layer, converting it into a content-addressed data blob plus a cumulative
//! bootstrap (metadata) layer, deciding via a content-derived chain identity
//! whether a previously converted result can be reused, and pushing the
//! results to a target registry or an external blob store.
//!
//! Key pieces:
//! - [`pipeline::Pipeline`] drives one conversion run end to end
//! - [`job::LayerJob`] owns the pull/convert/push lifecycle of a single layer
//! - [`cache`] computes chain identities and resolves the conversion cache
//! - [`backend::Backend`] abstracts where data blob bytes are stored
//! - [`registry::Registry`] and [`builder::Converter`] are the collaborator
//!   seams for registry access and the actual conversion algorithm

pub mod backend;
pub mod builder;
pub mod cache;
pub mod digest;
pub mod error;
pub mod job;
pub mod layer;
pub mod pipeline;
pub mod registry;

pub use oci_client::{secrets::RegistryAuth, Reference};

pub use crate::error::ConvertError;
pub use crate::pipeline::{ConvertSummary, Pipeline};
