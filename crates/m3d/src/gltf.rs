//! glTF animation-sampler extraction.
//!
//! Pulls animation samplers (input timestamps plus output value streams)
//! and their channels out of a glTF 2.0 document, without touching
//! meshes, scenes or materials. The JSON layer is a black-box tokenizer;
//! accessor data is read straight from the binary buffer.

use std::fmt;

use glam::{Vec3, Vec4};
use serde_json::Value;

/// Errors from the animation extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GltfError {
    /// The GLB container is malformed.
    InvalidContainer { detail: String },
    /// The JSON document could not be parsed.
    Json { detail: String },
    /// A referenced field is missing or has the wrong shape.
    MissingField { path: String },
    /// An accessor uses an encoding the extractor does not support.
    Unsupported { detail: String },
}

impl fmt::Display for GltfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidContainer { detail } => write!(f, "invalid glb container: {detail}"),
            Self::Json { detail } => write!(f, "invalid gltf json: {detail}"),
            Self::MissingField { path } => write!(f, "missing or malformed field {path}"),
            Self::Unsupported { detail } => write!(f, "unsupported gltf feature: {detail}"),
        }
    }
}

impl std::error::Error for GltfError {}

/// Keyframe interpolation declared by a sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    #[default]
    Linear,
    Step,
    CubicSpline,
}

/// Which node property a channel animates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPath {
    Translation,
    Rotation,
    Scale,
    Weights,
}

/// Output value stream of a sampler.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerOutput {
    Scalar(Vec<f32>),
    Vec3(Vec<Vec3>),
    Vec4(Vec<Vec4>),
}

/// One animation sampler: timestamps plus output values.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationSampler {
    /// Keyframe timestamps in seconds, ascending.
    pub input: Vec<f32>,
    /// Keyframe values.
    pub output: SamplerOutput,
    pub interpolation: Interpolation,
}

/// One channel binding a sampler to a node property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnimationChannel {
    /// Index into the animation's sampler list.
    pub sampler: usize,
    /// Target node index, absent for orphaned channels.
    pub target_node: Option<usize>,
    pub path: ChannelPath,
}

/// One extracted animation clip.
#[derive(Debug, Clone, PartialEq)]
pub struct GltfAnimation {
    pub name: String,
    pub samplers: Vec<AnimationSampler>,
    pub channels: Vec<AnimationChannel>,
    /// Largest input timestamp across all samplers, in seconds.
    pub duration: f32,
}

/// Split a GLB container into its JSON and binary chunks and extract.
pub fn extract_animations_glb(data: &[u8]) -> Result<Vec<GltfAnimation>, GltfError> {
    if data.len() < 12 || &data[0..4] != b"glTF" {
        return Err(GltfError::InvalidContainer {
            detail: "missing 'glTF' magic".into(),
        });
    }

    let mut json: Option<&[u8]> = None;
    let mut bin: &[u8] = &[];
    let mut offset = 12;
    while offset + 8 <= data.len() {
        let length =
            u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
                as usize;
        let kind = &data[offset + 4..offset + 8];
        let content = data
            .get(offset + 8..offset + 8 + length)
            .ok_or_else(|| GltfError::InvalidContainer {
                detail: "chunk overruns the buffer".into(),
            })?;
        match kind {
            b"JSON" => json = Some(content),
            b"BIN\0" => bin = content,
            _ => {}
        }
        offset += 8 + length;
    }

    let json = json.ok_or_else(|| GltfError::InvalidContainer {
        detail: "no JSON chunk".into(),
    })?;
    extract_animations(json, bin)
}

/// Extract animations from glTF JSON plus its binary buffer.
pub fn extract_animations(json: &[u8], bin: &[u8]) -> Result<Vec<GltfAnimation>, GltfError> {
    let doc: Value = serde_json::from_slice(json).map_err(|e| GltfError::Json {
        detail: e.to_string(),
    })?;

    let Some(animations) = doc.get("animations").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    let mut out = Vec::with_capacity(animations.len());
    for (index, animation) in animations.iter().enumerate() {
        let name = animation
            .get("name")
            .and_then(Value::as_str)
            .map_or_else(|| format!("animation{index}"), str::to_owned);

        let mut samplers = Vec::new();
        for sampler in animation
            .get("samplers")
            .and_then(Value::as_array)
            .ok_or_else(|| GltfError::MissingField {
                path: format!("animations[{index}].samplers"),
            })?
        {
            samplers.push(extract_sampler(&doc, bin, sampler)?);
        }

        let mut channels = Vec::new();
        for channel in animation
            .get("channels")
            .and_then(Value::as_array)
            .ok_or_else(|| GltfError::MissingField {
                path: format!("animations[{index}].channels"),
            })?
        {
            channels.push(extract_channel(channel)?);
        }

        let duration = samplers
            .iter()
            .flat_map(|s| s.input.last().copied())
            .fold(0.0f32, f32::max);
        out.push(GltfAnimation {
            name,
            samplers,
            channels,
            duration,
        });
    }
    Ok(out)
}

fn extract_channel(channel: &Value) -> Result<AnimationChannel, GltfError> {
    let sampler = usize_field(channel, "sampler")?;
    let target = channel.get("target").ok_or_else(|| GltfError::MissingField {
        path: "channel.target".into(),
    })?;
    let target_node = target
        .get("node")
        .and_then(Value::as_u64)
        .map(|n| n as usize);
    let path = match target.get("path").and_then(Value::as_str) {
        Some("translation") => ChannelPath::Translation,
        Some("rotation") => ChannelPath::Rotation,
        Some("scale") => ChannelPath::Scale,
        Some("weights") => ChannelPath::Weights,
        other => {
            return Err(GltfError::Unsupported {
                detail: format!("channel path {other:?}"),
            });
        }
    };
    Ok(AnimationChannel {
        sampler,
        target_node,
        path,
    })
}

fn extract_sampler(doc: &Value, bin: &[u8], sampler: &Value) -> Result<AnimationSampler, GltfError> {
    let input_accessor = usize_field(sampler, "input")?;
    let output_accessor = usize_field(sampler, "output")?;
    let interpolation = match sampler.get("interpolation").and_then(Value::as_str) {
        None | Some("LINEAR") => Interpolation::Linear,
        Some("STEP") => Interpolation::Step,
        Some("CUBICSPLINE") => Interpolation::CubicSpline,
        Some(other) => {
            return Err(GltfError::Unsupported {
                detail: format!("interpolation {other}"),
            });
        }
    };

    let (input, input_kind) = read_accessor(doc, bin, input_accessor)?;
    if input_kind != AccessorKind::Scalar {
        return Err(GltfError::Unsupported {
            detail: "sampler input must be scalar".into(),
        });
    }
    let (raw, kind) = read_accessor(doc, bin, output_accessor)?;
    let output = match kind {
        AccessorKind::Scalar => SamplerOutput::Scalar(raw),
        AccessorKind::Vec3 => SamplerOutput::Vec3(
            raw.chunks_exact(3)
                .map(|c| Vec3::new(c[0], c[1], c[2]))
                .collect(),
        ),
        AccessorKind::Vec4 => SamplerOutput::Vec4(
            raw.chunks_exact(4)
                .map(|c| Vec4::new(c[0], c[1], c[2], c[3]))
                .collect(),
        ),
    };

    Ok(AnimationSampler {
        input,
        output,
        interpolation,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessorKind {
    Scalar,
    Vec3,
    Vec4,
}

/// Read one accessor's values as floats, applying the normalization rules
/// for integer component types.
fn read_accessor(
    doc: &Value,
    bin: &[u8],
    index: usize,
) -> Result<(Vec<f32>, AccessorKind), GltfError> {
    let accessor = doc
        .get("accessors")
        .and_then(Value::as_array)
        .and_then(|a| a.get(index))
        .ok_or_else(|| GltfError::MissingField {
            path: format!("accessors[{index}]"),
        })?;

    let component_type = usize_field(accessor, "componentType")?;
    let count = usize_field(accessor, "count")?;
    let kind = match accessor.get("type").and_then(Value::as_str) {
        Some("SCALAR") => AccessorKind::Scalar,
        Some("VEC3") => AccessorKind::Vec3,
        Some("VEC4") => AccessorKind::Vec4,
        other => {
            return Err(GltfError::Unsupported {
                detail: format!("accessor type {other:?}"),
            });
        }
    };
    let components = match kind {
        AccessorKind::Scalar => 1,
        AccessorKind::Vec3 => 3,
        AccessorKind::Vec4 => 4,
    };

    let view_index = usize_field(accessor, "bufferView")?;
    let accessor_offset = accessor
        .get("byteOffset")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let view = doc
        .get("bufferViews")
        .and_then(Value::as_array)
        .and_then(|v| v.get(view_index))
        .ok_or_else(|| GltfError::MissingField {
            path: format!("bufferViews[{view_index}]"),
        })?;
    let view_offset = view.get("byteOffset").and_then(Value::as_u64).unwrap_or(0) as usize;

    let (component_size, read): (usize, fn(&[u8]) -> f32) = match component_type {
        5120 => (1, |b| (f32::from(b[0] as i8) / 127.0).max(-1.0)),
        5121 => (1, |b| f32::from(b[0]) / 255.0),
        5122 => (2, |b| {
            (f32::from(i16::from_le_bytes([b[0], b[1]])) / 32767.0).max(-1.0)
        }),
        5123 => (2, |b| f32::from(u16::from_le_bytes([b[0], b[1]])) / 65535.0),
        5126 => (4, |b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        other => {
            return Err(GltfError::Unsupported {
                detail: format!("component type {other}"),
            });
        }
    };

    let element_size = component_size * components;
    let stride = view
        .get("byteStride")
        .and_then(Value::as_u64)
        .map_or(element_size, |s| s as usize);
    let base = view_offset + accessor_offset;

    let mut values = Vec::with_capacity(count * components);
    for element in 0..count {
        let start = base + element * stride;
        let bytes = bin
            .get(start..start + element_size)
            .ok_or_else(|| GltfError::InvalidContainer {
                detail: format!("accessor {index} reads past the binary buffer"),
            })?;
        for component in 0..components {
            values.push(read(&bytes[component * component_size..]));
        }
    }
    Ok((values, kind))
}

fn usize_field(value: &Value, key: &str) -> Result<usize, GltfError> {
    value
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .ok_or_else(|| GltfError::MissingField { path: key.into() })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal document: one animation moving node 2, two keyframes.
    fn fixture() -> (Vec<u8>, Vec<u8>) {
        let mut bin = Vec::new();
        for t in [0.0f32, 1.0] {
            bin.extend_from_slice(&t.to_le_bytes());
        }
        for v in [0.0f32, 0.0, 0.0, 2.0, 0.0, 0.0] {
            bin.extend_from_slice(&v.to_le_bytes());
        }

        let json = serde_json::json!({
            "accessors": [
                {"bufferView": 0, "componentType": 5126, "count": 2, "type": "SCALAR"},
                {"bufferView": 0, "byteOffset": 8, "componentType": 5126, "count": 2, "type": "VEC3"},
            ],
            "bufferViews": [
                {"buffer": 0, "byteOffset": 0, "byteLength": 32},
            ],
            "animations": [{
                "name": "slide",
                "samplers": [{"input": 0, "output": 1, "interpolation": "LINEAR"}],
                "channels": [{"sampler": 0, "target": {"node": 2, "path": "translation"}}],
            }],
        });
        (serde_json::to_vec(&json).unwrap(), bin)
    }

    #[test]
    fn test_extract_animation() {
        let (json, bin) = fixture();
        let animations = extract_animations(&json, &bin).unwrap();
        assert_eq!(animations.len(), 1);
        let animation = &animations[0];
        assert_eq!(animation.name, "slide");
        assert_eq!(animation.duration, 1.0);
        assert_eq!(animation.samplers[0].input, vec![0.0, 1.0]);
        assert_eq!(
            animation.samplers[0].output,
            SamplerOutput::Vec3(vec![Vec3::ZERO, Vec3::new(2.0, 0.0, 0.0)])
        );
        assert_eq!(animation.channels[0].target_node, Some(2));
        assert_eq!(animation.channels[0].path, ChannelPath::Translation);
    }

    #[test]
    fn test_no_animations_is_empty() {
        let animations = extract_animations(b"{}", &[]).unwrap();
        assert!(animations.is_empty());
    }

    #[test]
    fn test_glb_container_round_trip() {
        let (json, bin) = fixture();
        let mut glb = Vec::new();
        glb.extend_from_slice(b"glTF");
        glb.extend_from_slice(&2u32.to_le_bytes());
        glb.extend_from_slice(&0u32.to_le_bytes()); // total length, unused here
        glb.extend_from_slice(&(json.len() as u32).to_le_bytes());
        glb.extend_from_slice(b"JSON");
        glb.extend_from_slice(&json);
        glb.extend_from_slice(&(bin.len() as u32).to_le_bytes());
        glb.extend_from_slice(b"BIN\0");
        glb.extend_from_slice(&bin);

        let animations = extract_animations_glb(&glb).unwrap();
        assert_eq!(animations.len(), 1);
    }

    #[test]
    fn test_reject_bad_glb() {
        assert!(matches!(
            extract_animations_glb(b"noop"),
            Err(GltfError::InvalidContainer { .. })
        ));
    }

    #[test]
    fn test_normalized_u8_output() {
        let json = serde_json::json!({
            "accessors": [
                {"bufferView": 0, "componentType": 5126, "count": 1, "type": "SCALAR"},
                {"bufferView": 0, "byteOffset": 4, "componentType": 5121, "count": 1, "type": "SCALAR"},
            ],
            "bufferViews": [{"buffer": 0, "byteLength": 5}],
            "animations": [{
                "samplers": [{"input": 0, "output": 1}],
                "channels": [{"sampler": 0, "target": {"node": 0, "path": "weights"}}],
            }],
        });
        let mut bin = 0.0f32.to_le_bytes().to_vec();
        bin.push(255);
        let animations =
            extract_animations(&serde_json::to_vec(&json).unwrap(), &bin).unwrap();
        assert_eq!(animations[0].samplers[0].output, SamplerOutput::Scalar(vec![1.0]));
        // A missing name falls back to the animation index.
        assert_eq!(animations[0].name, "animation0");
    }

    #[test]
    fn test_cubicspline_interpolation_parsed() {
        let (mut json_bytes, bin) = fixture();
        let json_str = String::from_utf8(json_bytes.clone()).unwrap().replace("LINEAR", "CUBICSPLINE");
        json_bytes = json_str.into_bytes();
        let animations = extract_animations(&json_bytes, &bin).unwrap();
        assert_eq!(
            animations[0].samplers[0].interpolation,
            Interpolation::CubicSpline
        );
    }
}
