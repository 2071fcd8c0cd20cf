//! Loader and saver for the Model 3D binary container.
//!
//! The container is self-describing: a header declares how many bytes
//! every kind of cross-reference index occupies in this particular file,
//! and the rest of the file is a flat sequence of tagged chunks carrying
//! geometry, materials, a bone hierarchy, voxel grids and animation
//! clips. Loading reconstructs derived data the file does not store:
//! meshes from voxel grids, averaged normals, per-bone weight lists and
//! inverse bind matrices. Saving deduplicates and regroups collections
//! before serializing, and chooses the smallest index widths that fit.
//!
//! Two sibling importers ride along: a MagicaVoxel `.vox` reader
//! ([`vox`]) and a glTF animation-sampler extractor ([`gltf`]).
//!
//! # Design principles
//!
//! - **Synchronous, no I/O**: byte slices in, byte vectors out; file
//!   reading and external texture lookup stay with the host
//! - **Index graph**: cross-references are integer indices, never
//!   pointers, so collections can grow during decode
//! - **Partial failure**: a fatal error mid-stream returns everything
//!   decoded before it, tagged with the error
//!
//! # Example
//!
//! ```ignore
//! use m3d::Model;
//!
//! let data = std::fs::read("model.m3d")?;
//! let model = Model::from_slice(&data)?;
//! if let Some(error) = &model.error {
//!     eprintln!("decoded with problems: {error}");
//! }
//! for face in &model.faces {
//!     // indices into model.vertices
//! }
//! ```

mod compress;
mod error;
mod external;
mod geometry;
mod model;
mod read;
mod shape;
mod skeleton;
mod voxel;
mod write;

pub mod gltf;
pub mod vox;

pub use compress::{deflate, inflate};
pub use error::{Error, Result};
pub use external::{NoExternal, ReadExternal};
pub use model::{
    Action, Bone, CommandArg, ExtraChunk, Face, Frame, FrameTransform, InlinedAsset, Label,
    Material, MaterialProperty, Model, PropertyValue, Shape, ShapeCommand, Skin, Texture, UvCoord,
    Vertex, VertexKind, VoxelBlock, VoxelType,
};
pub use read::{END_MAGIC, FILE_MAGIC};
pub use skeleton::{Pose, PoseBone};
pub use write::{SaveOptions, SaveOutput};

// Re-export the wire-level width types that appear in the public API.
pub use m3d_decode::{CoordWidth, IndexWidth, WidthTable};
