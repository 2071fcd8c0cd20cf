//! The in-memory model graph.
//!
//! All cross-references between collections are plain integer indices into
//! sibling arrays, never pointers: collections grow during decode and
//! post-processing, and index references survive that growth. The `Model`
//! aggregate exclusively owns every child collection, so teardown is a
//! single recursive drop.

use glam::{Mat4, Quat, Vec3};
use m3d_decode::WidthTable;

use crate::error::Error;

/// Root aggregate for one decoded or authored model.
#[derive(Debug, Clone, Default)]
pub struct Model {
    /// Model name.
    pub name: String,
    /// License string.
    pub license: String,
    /// Author string.
    pub author: String,
    /// Free-text description, may span multiple lines.
    pub description: String,
    /// Uniform scale factor in SI meters per unit.
    pub scale: f32,
    /// Per-file index width declarations as decoded; recomputed on save.
    pub widths: WidthTable,
    /// Raw preview image chunk, carried verbatim.
    pub preview: Vec<u8>,

    /// Color palette, referenced by indexed color fields.
    pub color_map: Vec<u32>,
    /// UV coordinates referenced by faces.
    pub uvs: Vec<UvCoord>,
    /// Vertex array. Also stores normals, bone bind positions and
    /// orientations, and animation keyframe data; any vertex index in the
    /// model may point here.
    pub vertices: Vec<Vertex>,
    /// Bone hierarchy, parents strictly before children.
    pub bones: Vec<Bone>,
    /// Deduplicated weighted bone groups shared by vertices.
    pub skins: Vec<Skin>,
    /// Materials with typed property lists.
    pub materials: Vec<Material>,
    /// Texture slots referenced by material map properties.
    pub textures: Vec<Texture>,
    /// Triangle faces.
    pub faces: Vec<Face>,
    /// Voxel palette entries.
    pub voxel_types: Vec<VoxelType>,
    /// Named positioned voxel grids.
    pub voxel_blocks: Vec<VoxelBlock>,
    /// Procedural/mathematical surface definitions, byte-level only.
    pub shapes: Vec<Shape>,
    /// Vertex annotations.
    pub labels: Vec<Label>,
    /// Animation clips.
    pub actions: Vec<Action>,
    /// Self-contained opaque assets (texture images, scripts).
    pub assets: Vec<InlinedAsset>,
    /// Names of procedural surface scripts referenced by the file.
    pub procedurals: Vec<String>,
    /// Unknown chunks preserved verbatim for round-tripping.
    pub extras: Vec<ExtraChunk>,

    /// Worst problem encountered while decoding. Callers must check this
    /// even when a model is returned; degraded errors leave the rest of
    /// the model intact.
    pub error: Option<Error>,
}

impl Model {
    /// Create an empty model with a unit scale.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scale: 1.0,
            ..Self::default()
        }
    }

    /// Record a problem, keeping the worst one: a fatal error always
    /// replaces a degraded one, and the first error of a severity wins.
    pub(crate) fn record_error(&mut self, error: Error) {
        match &self.error {
            None => self.error = Some(error),
            Some(existing) if !existing.is_fatal() && error.is_fatal() => {
                self.error = Some(error);
            }
            Some(_) => {}
        }
    }
}

/// One texture coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UvCoord {
    pub u: f32,
    pub v: f32,
}

/// What a vertex record is used for.
///
/// The wire format overloads one numeric field for both meanings; in
/// memory the two uses are distinct variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexKind {
    /// A mesh vertex, optionally bound to a skin group.
    Mesh {
        /// Skin group reference, `None` when unskinned.
        skin: Option<u32>,
    },
    /// An auxiliary vertex: a normal vector, a bone bind position or
    /// orientation, or an animation keyframe value.
    Auxiliary,
}

impl Default for VertexKind {
    fn default() -> Self {
        Self::Mesh { skin: None }
    }
}

impl VertexKind {
    /// The skin group reference of a mesh vertex.
    #[must_use]
    pub fn skin(self) -> Option<u32> {
        match self {
            Self::Mesh { skin } => skin,
            Self::Auxiliary => None,
        }
    }
}

/// One vertex record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    /// Position, normal vector, or quaternion x/y/z depending on use.
    pub position: Vec3,
    /// Homogeneous weight, or the quaternion w component.
    pub w: f32,
    /// Packed RGBA color, 0 for none.
    pub color: u32,
    /// Whether this is a mesh vertex or an auxiliary one.
    pub kind: VertexKind,
}

impl Default for Vertex {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            w: 1.0,
            color: 0,
            kind: VertexKind::default(),
        }
    }
}

impl Vertex {
    /// A plain mesh vertex at a position.
    #[must_use]
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// An auxiliary vertex carrying a direction or quaternion vector part.
    #[must_use]
    pub fn auxiliary(position: Vec3, w: f32) -> Self {
        Self {
            position,
            w,
            color: 0,
            kind: VertexKind::Auxiliary,
        }
    }

    /// Interpret this vertex as a quaternion (orientation storage).
    #[must_use]
    pub fn as_quat(&self) -> Quat {
        Quat::from_xyzw(self.position.x, self.position.y, self.position.z, self.w)
    }
}

/// One bone in the hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct Bone {
    /// Parent bone index, `None` for a root bone. Always less than this
    /// bone's own index.
    pub parent: Option<u32>,
    /// Bone name.
    pub name: String,
    /// Vertex index of the bind-pose position.
    pub position: u32,
    /// Vertex index of the bind-pose orientation quaternion.
    pub orientation: u32,
    /// Derived (vertex index, weight) pairs, reconstructed after load, not
    /// stored in the file.
    pub weights: Vec<(u32, f32)>,
    /// Inverse bind-pose world matrix, ready for skinning. Computed in the
    /// post-process pass.
    pub matrix: Mat4,
}

impl Bone {
    /// Create a bone with no derived data yet.
    #[must_use]
    pub fn new(parent: Option<u32>, name: String, position: u32, orientation: u32) -> Self {
        Self {
            parent,
            name,
            position,
            orientation,
            weights: Vec::new(),
            matrix: Mat4::IDENTITY,
        }
    }
}

/// A weighted bone group shared by vertices.
///
/// Weights are normalized to sum to 1.0 on decode; an all-zero group stays
/// unassigned.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Skin {
    /// (bone index, weight) pairs, at most the file's bones-per-skin cap.
    pub entries: Vec<(u32, f32)>,
}

/// Scalar or map value of one material property.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyValue {
    /// Packed RGBA color.
    Color(u32),
    /// Unsigned scalar (uint8/16/32 on the wire).
    Uint(u32),
    /// Float scalar.
    Float(f32),
    /// Texture slot index.
    Map(u32),
}

/// One typed material property.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialProperty {
    /// Property type code. Codes below 128 are scalar properties; the
    /// high bit marks the texture-map variant of the same semantic.
    pub type_id: u8,
    /// The decoded value.
    pub value: PropertyValue,
}

/// One material: a name plus an ordered property list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Material {
    pub name: String,
    pub properties: Vec<MaterialProperty>,
}

/// One texture slot.
///
/// `pixels` is empty when the texture could not be resolved; the decode
/// records a degraded error and continues.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Texture {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Number of channels per pixel (1, 2, 3 or 4).
    pub channels: u8,
    pub pixels: Vec<u8>,
}

/// One triangle face.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Face {
    /// Material index, `None` for the "no material" sentinel.
    pub material: Option<u32>,
    /// Opaque extended-attribute reference.
    pub param: Option<u32>,
    /// Vertex indices of the three corners.
    pub vertices: [u32; 3],
    /// Optional UV indices per corner.
    pub uvs: [Option<u32>; 3],
    /// Optional normal vertex indices per corner.
    pub normals: [Option<u32>; 3],
    /// Optional extended per-corner vertex indices.
    pub vmax: [Option<u32>; 3],
}

/// One voxel palette entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VoxelType {
    pub name: String,
    /// Packed RGBA color.
    pub color: u32,
    /// Rotation bitfield, carried verbatim.
    pub rotation: u8,
    /// Shape bitfield, carried verbatim.
    pub shape: u16,
    /// Optional skin group applied to meshed voxels of this type.
    pub skin: Option<u32>,
    /// Informational named sub-item counts.
    pub items: Vec<(String, u16)>,
}

/// One named, positioned voxel grid.
///
/// Cells hold palette indices; `None` is an empty cell. The cell at
/// `(x, y, z)` lives at `x + z * width + y * width * depth`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VoxelBlock {
    pub name: String,
    /// Grid origin in voxel units, may be negative.
    pub position: [i32; 3],
    /// Grid dimensions (width, height, depth).
    pub size: [u32; 3],
    /// Uncertainty/probability byte, carried verbatim.
    pub uncertainty: u8,
    /// Group id byte, carried verbatim.
    pub group: u8,
    /// Palette index per cell, row-major per the layout above.
    pub cells: Vec<Option<u16>>,
}

impl VoxelBlock {
    /// Cell at grid position, treating out-of-range as empty.
    #[must_use]
    pub fn cell(&self, x: i64, y: i64, z: i64) -> Option<u16> {
        let [w, h, d] = self.size;
        if x < 0 || y < 0 || z < 0 || x >= i64::from(w) || y >= i64::from(h) || z >= i64::from(d) {
            return None;
        }
        let idx = usize::try_from(x + z * i64::from(w) + y * i64::from(w) * i64::from(d)).ok()?;
        self.cells.get(idx).copied().flatten()
    }
}

/// Argument of one shape command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandArg {
    /// A vertex index.
    Vertex(u32),
    /// A UV index.
    Uv(u32),
    /// A face index.
    Face(u32),
    /// A shape index.
    Shape(u32),
    /// A material, referenced by name.
    Material(String),
    /// A float scalar.
    Coord(f32),
    /// An unsigned scalar.
    Uint(u32),
}

/// One typed shape command.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeCommand {
    /// Opcode into the static command table.
    pub opcode: u8,
    /// Fixed arguments.
    pub args: Vec<CommandArg>,
    /// Repeated argument groups for variadic commands.
    pub groups: Vec<Vec<CommandArg>>,
}

/// One procedural shape: a named command list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Shape {
    pub name: String,
    pub commands: Vec<ShapeCommand>,
}

/// One vertex annotation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Label {
    /// Annotation layer name.
    pub name: String,
    /// Language tag.
    pub lang: String,
    /// Packed RGBA color.
    pub color: u32,
    /// Target vertex index.
    pub vertex: u32,
    /// Annotation text.
    pub text: String,
}

/// One sparse keyframe: which bones move at this timestamp.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    /// Timestamp in milliseconds from the clip start.
    pub timestamp_ms: u32,
    /// Per-bone overrides taking effect at this timestamp.
    pub transforms: Vec<FrameTransform>,
}

/// One bone override within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTransform {
    /// Bone index.
    pub bone: u32,
    /// Vertex index of the new position.
    pub position: u32,
    /// Vertex index of the new orientation quaternion.
    pub orientation: u32,
}

/// One animation clip.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Action {
    pub name: String,
    /// Clip duration in milliseconds; pose requests wrap modulo this.
    pub duration_ms: u32,
    /// Frames in ascending timestamp order.
    pub frames: Vec<Frame>,
}

/// One self-contained opaque asset.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InlinedAsset {
    pub name: String,
    pub data: Vec<u8>,
}

/// An unknown chunk preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraChunk {
    pub magic: [u8; 4],
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_error_keeps_worst() {
        let mut model = Model::new();
        model.record_error(Error::MissingColorMap);
        assert_eq!(model.error, Some(Error::MissingColorMap));

        // A later degraded error does not displace the first.
        model.record_error(Error::MissingTexture { name: "a".into() });
        assert_eq!(model.error, Some(Error::MissingColorMap));

        // A fatal error does.
        model.record_error(Error::MissingEndChunk);
        assert_eq!(model.error, Some(Error::MissingEndChunk));

        // But the first fatal error wins over later ones.
        model.record_error(Error::BadMagic);
        assert_eq!(model.error, Some(Error::MissingEndChunk));
    }

    #[test]
    fn test_voxel_block_cell_addressing() {
        let block = VoxelBlock {
            size: [2, 2, 2],
            cells: vec![
                Some(0), Some(1), // y=0 z=0
                Some(2), Some(3), // y=0 z=1
                Some(4), Some(5), // y=1 z=0
                Some(6), Some(7), // y=1 z=1
            ],
            ..VoxelBlock::default()
        };
        assert_eq!(block.cell(0, 0, 0), Some(0));
        assert_eq!(block.cell(1, 0, 1), Some(3));
        assert_eq!(block.cell(0, 1, 1), Some(6));
        assert_eq!(block.cell(-1, 0, 0), None);
        assert_eq!(block.cell(2, 0, 0), None);
    }

    #[test]
    fn test_vertex_as_quat() {
        let v = Vertex::auxiliary(Vec3::new(0.0, 0.0, 0.0), 1.0);
        assert_eq!(v.as_quat(), Quat::IDENTITY);
    }
}
