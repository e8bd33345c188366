//! Resource catalogue, generator lifecycle and tile producers of the
//! cartolina tile server.
//!
//! A catalogue of declarative resource definitions is parsed by the
//! [`loader`], reconciled into the [`registry`], and served by one
//! [`producers::Generator`] per resource. Surface resources run a
//! preparation pipeline (VRT overview pyramid + delivery tile index) before
//! they become ready.

pub mod loader;
pub mod producers;
pub mod reference_frame;
pub mod registry;
pub mod resource;

pub use producers::{ArtifactKind, Generator, GeneratorContext, TileArtifact, TileRequest};
pub use reference_frame::{NodeInfo, ReferenceFrame};
pub use registry::{GeneratorRegistry, GeneratorState, RegistryConfig};
pub use resource::{Changed, GeneratorKind, GeneratorRef, Resource, ResourceId};
