//! Error types for model loading and saving.

use std::fmt;

use m3d_decode::DecodeError;

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading or saving a model.
///
/// Errors split into two families. Fatal errors abort the decode of the
/// current model; depending on how far decoding progressed the caller gets
/// `Err` or a partially-populated model with [`crate::Model::error`] set.
/// Degraded errors are recorded on the model and decoding continues.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The buffer does not start with the container magic.
    BadMagic,
    /// The buffer ended before a complete structure.
    Truncated { context: &'static str },
    /// The mandatory header chunk is missing or malformed.
    BadHeader { detail: String },
    /// Wire-level decoding failed.
    Decode(DecodeError),
    /// The terminal chunk never appeared.
    MissingEndChunk,
    /// A declared width this build cannot represent.
    UnsupportedWidth { context: &'static str, bytes: u8 },
    /// A face declared a primitive other than a triangle.
    NonTriangleFace { vertices: u8 },
    /// A shape command opcode outside the command table.
    UnknownCommand { opcode: u8 },
    /// A bone referenced a parent at or after itself.
    BadParent { bone: u32 },
    /// The compressed chunk stream could not be expanded or shrunk.
    Compression { detail: String },

    /// An indexed color was used but no color map was decoded.
    MissingColorMap,
    /// A face or shape referenced a material name that does not exist.
    UnknownMaterial { name: String },
    /// A texture reference could not be resolved to any bytes.
    MissingTexture { name: String },
    /// Texture bytes were found but could not be decoded as an image.
    BadTexture { name: String },
    /// An inlined asset reference could not be resolved.
    MissingAsset { name: String },
    /// A material or skin was defined twice; the first definition wins.
    DuplicateDefinition { kind: &'static str, name: String },
    /// A material property type outside the property table.
    UnknownProperty { type_id: u8 },
    /// An animation action or frame index out of range.
    UnknownFrame { action: u32 },
}

impl Error {
    /// Whether this error aborts decoding rather than degrading it.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::BadMagic
            | Self::Truncated { .. }
            | Self::BadHeader { .. }
            | Self::Decode(_)
            | Self::MissingEndChunk
            | Self::UnsupportedWidth { .. }
            | Self::NonTriangleFace { .. }
            | Self::UnknownCommand { .. }
            | Self::BadParent { .. }
            | Self::Compression { .. } => true,
            Self::MissingColorMap
            | Self::UnknownMaterial { .. }
            | Self::MissingTexture { .. }
            | Self::BadTexture { .. }
            | Self::MissingAsset { .. }
            | Self::DuplicateDefinition { .. }
            | Self::UnknownProperty { .. }
            | Self::UnknownFrame { .. } => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "not a model 3d container"),
            Self::Truncated { context } => write!(f, "truncated buffer in {context}"),
            Self::BadHeader { detail } => write!(f, "bad header: {detail}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::MissingEndChunk => write!(f, "missing end chunk"),
            Self::UnsupportedWidth { context, bytes } => {
                write!(
                    f,
                    "file needs {bytes}-byte {context} indices, wider than this build supports"
                )
            }
            Self::NonTriangleFace { vertices } => {
                write!(f, "face with {vertices} vertices, only triangles are supported")
            }
            Self::UnknownCommand { opcode } => write!(f, "unknown shape command {opcode}"),
            Self::BadParent { bone } => {
                write!(f, "bone {bone} references a parent at or after itself")
            }
            Self::Compression { detail } => write!(f, "compression failed: {detail}"),
            Self::MissingColorMap => write!(f, "indexed color used without a color map"),
            Self::UnknownMaterial { name } => write!(f, "unknown material '{name}'"),
            Self::MissingTexture { name } => write!(f, "texture '{name}' could not be resolved"),
            Self::BadTexture { name } => write!(f, "texture '{name}' could not be decoded"),
            Self::MissingAsset { name } => write!(f, "inlined asset '{name}' not found"),
            Self::DuplicateDefinition { kind, name } => {
                write!(f, "duplicate {kind} '{name}', keeping the first definition")
            }
            Self::UnknownProperty { type_id } => {
                write!(f, "unknown material property type {type_id}")
            }
            Self::UnknownFrame { action } => {
                write!(f, "animation request out of range for action {action}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}
