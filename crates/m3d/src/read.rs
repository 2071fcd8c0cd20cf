//! Container loading: header parse, chunk dispatch and post-processing.
//!
//! Decoding moves through header parse, a two-pass chunk walk (inlined
//! assets first, because materials in the second pass resolve texture
//! names against them), then a post-process pass that meshes voxels,
//! generates missing normals and computes bone matrices. A fatal error
//! mid-walk preserves everything decoded so far: the partially-built model
//! is returned with [`Model::error`] set.

use std::borrow::Cow;

use glam::Vec3;
use m3d_decode::error::DecodeError;
use m3d_decode::index::{IndexWidth, PackedIndex, WidthTable, read_count, read_index};
use m3d_decode::{buf, chunk, strings};

use crate::error::{Error, Result};
use crate::external::{NoExternal, ReadExternal};
use crate::model::{ExtraChunk, InlinedAsset, Label, Model, Vertex};
use crate::{compress, geometry, shape, skeleton, voxel};

/// File-level magic.
pub const FILE_MAGIC: [u8; 4] = *b"3DMO";
/// Terminal chunk magic.
pub const END_MAGIC: [u8; 4] = *b"OMD3";

/// Shared decode state: the header payload (string offsets resolve against
/// it) and the per-file width table.
pub(crate) struct Ctx<'a> {
    pub header: &'a [u8],
    pub widths: WidthTable,
}

impl Ctx<'_> {
    /// Unwrap a width a chunk needs, failing when the header declared the
    /// index kind absent.
    pub fn need(&self, width: Option<IndexWidth>, what: &'static str) -> Result<IndexWidth> {
        width.ok_or_else(|| {
            DecodeError::InvalidFormat {
                context: "chunk",
                detail: format!("{what} indices declared absent in the header"),
            }
            .into()
        })
    }

    /// Read a raw string offset with the declared string width.
    pub fn read_str_offset(&self, data: &[u8], offset: &mut usize) -> Result<u32> {
        let width = self.need(self.widths.string, "string")?;
        Ok(read_count(data, offset, width)?)
    }

    /// Read a string reference and resolve it against the header blob.
    pub fn read_str(&self, data: &[u8], offset: &mut usize) -> Result<String> {
        let raw = self.read_str_offset(data, offset)?;
        Ok(strings::read_str(self.header, raw)?.to_owned())
    }

    /// Read a color: an index into the color map when the header declared
    /// a color index width, a direct 32-bit value otherwise.
    ///
    /// Returns the color and whether an indexed read had to fall back to
    /// color 0 because the map is missing or too small.
    pub fn read_color(
        &self,
        color_map: &[u32],
        data: &[u8],
        offset: &mut usize,
    ) -> Result<(u32, bool)> {
        match self.widths.color {
            None => Ok((buf::read_u32(data, offset, "color")?, false)),
            Some(width) => match read_index(data, offset, width)? {
                PackedIndex::Undefined | PackedIndex::Reserved => Ok((0, false)),
                PackedIndex::Value(index) => match color_map.get(index as usize) {
                    Some(&color) => Ok((color, false)),
                    None => Ok((0, true)),
                },
            },
        }
    }
}

impl Model {
    /// Decode a model from an in-memory container, resolving nothing
    /// external.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Self::from_slice_with(data, &mut NoExternal)
    }

    /// Decode a model, resolving texture and script references through the
    /// host's [`ReadExternal`] hook.
    ///
    /// Failures before the header is parsed return `Err`. Later fatal
    /// failures return the partially-built model with [`Model::error`]
    /// set; callers must check it even on `Ok`.
    pub fn from_slice_with(data: &[u8], ext: &mut dyn ReadExternal) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::Truncated { context: "file header" });
        }
        if data[0..4] != FILE_MAGIC {
            return Err(Error::BadMagic);
        }
        let declared = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if declared < 8 || declared > data.len() {
            return Err(Error::Truncated { context: "file length" });
        }
        let data = &data[..declared];

        let mut offset = 8;
        let mut preview = Vec::new();
        if data.len() >= offset + 8 && data[offset..offset + 4] == *b"PRVW" {
            let chunk = chunk::read_chunk(data, &mut offset).map_err(Error::from)?;
            preview = chunk.payload.to_vec();
        }

        // Without a HEAD magic at this position the rest of the file is
        // one DEFLATE stream hiding it.
        let rest = &data[offset..];
        let body: Cow<'_, [u8]> = if rest.len() >= 4 && rest[0..4] == *b"HEAD" {
            Cow::Borrowed(rest)
        } else {
            Cow::Owned(compress::inflate(rest)?)
        };

        let mut body_offset = 0;
        let head = chunk::read_chunk(&body, &mut body_offset).map_err(Error::from)?;
        if head.magic != *b"HEAD" {
            return Err(Error::BadHeader {
                detail: format!(
                    "first chunk is {}, not HEAD",
                    String::from_utf8_lossy(&head.magic)
                ),
            });
        }

        let mut model = parse_header(head.payload)?;
        model.preview = preview;
        let ctx = Ctx {
            header: head.payload,
            widths: model.widths,
        };

        // Pass 1: harvest inlined assets so later chunks can resolve
        // texture and script names against them.
        let mut scan = body_offset;
        while scan < body.len() {
            let Ok(chunk) = chunk::read_chunk(&body, &mut scan) else {
                break; // pass 2 reports the corruption
            };
            if chunk.magic == END_MAGIC {
                break;
            }
            if chunk.magic == *b"ASET" {
                if let Err(e) = decode_asset(&mut model, &ctx, chunk.payload) {
                    model.record_error(e);
                    return Ok(model);
                }
            }
        }

        // Pass 2: dispatch every chunk.
        let mut end_seen = false;
        while body_offset < body.len() {
            let chunk = match chunk::read_chunk(&body, &mut body_offset) {
                Ok(chunk) => chunk,
                Err(e) => {
                    model.record_error(e.into());
                    return Ok(model);
                }
            };
            if chunk.magic == END_MAGIC {
                end_seen = true;
                break;
            }
            let result = match &chunk.magic {
                b"CMAP" => geometry::decode_color_map(&mut model, chunk.payload),
                b"TMAP" => geometry::decode_uvs(&mut model, &ctx, chunk.payload),
                b"VRTS" => geometry::decode_vertices(&mut model, &ctx, chunk.payload),
                b"BONE" => skeleton::decode_bones(&mut model, &ctx, chunk.payload),
                b"MTRL" => geometry::decode_material(&mut model, &ctx, chunk.payload, ext),
                b"PROC" => decode_procedural(&mut model, &ctx, chunk.payload, ext),
                b"MESH" => geometry::decode_mesh(&mut model, &ctx, chunk.payload),
                b"VOXT" => voxel::decode_voxel_types(&mut model, &ctx, chunk.payload),
                b"VOXD" => voxel::decode_voxel_block(&mut model, &ctx, chunk.payload),
                b"SHPE" => shape::decode_shape(&mut model, &ctx, chunk.payload),
                b"LBLS" => decode_labels(&mut model, &ctx, chunk.payload),
                b"ACTN" => skeleton::decode_action(&mut model, &ctx, chunk.payload),
                b"ASET" => Ok(()), // harvested in pass 1
                b"PRVW" => {
                    model.preview = chunk.payload.to_vec();
                    Ok(())
                }
                _ => {
                    model.extras.push(ExtraChunk {
                        magic: chunk.magic,
                        payload: chunk.payload.to_vec(),
                    });
                    Ok(())
                }
            };
            if let Err(e) = result {
                model.record_error(e);
                return Ok(model);
            }
        }
        if !end_seen {
            model.record_error(Error::MissingEndChunk);
            return Ok(model);
        }

        post_process(&mut model);
        Ok(model)
    }
}

fn parse_header(payload: &[u8]) -> Result<Model> {
    let mut offset = 0;
    let scale = buf::read_f32(payload, &mut offset, "header").map_err(|_| Error::BadHeader {
        detail: "header shorter than its fixed fields".into(),
    })?;
    let types = buf::read_u32(payload, &mut offset, "header").map_err(|_| Error::BadHeader {
        detail: "header shorter than its fixed fields".into(),
    })?;

    let mut model = Model::new();
    model.scale = if scale > 0.0 { scale } else { 1.0 };
    model.widths = WidthTable::from_types_word(types);
    model.name = read_cstr(payload, &mut offset)?;
    model.license = read_cstr(payload, &mut offset)?;
    model.author = read_cstr(payload, &mut offset)?;
    model.description = read_cstr(payload, &mut offset)?;
    Ok(model)
}

fn read_cstr(payload: &[u8], offset: &mut usize) -> Result<String> {
    let tail = &payload[(*offset).min(payload.len())..];
    let end = tail.iter().position(|&b| b == 0).ok_or(Error::BadHeader {
        detail: "unterminated header string".into(),
    })?;
    let s = std::str::from_utf8(&tail[..end]).map_err(|e| Error::BadHeader {
        detail: format!("header string is not utf-8: {e}"),
    })?;
    *offset += end + 1;
    Ok(s.to_owned())
}

fn decode_asset(model: &mut Model, ctx: &Ctx<'_>, payload: &[u8]) -> Result<()> {
    let mut offset = 0;
    let name = ctx.read_str(payload, &mut offset)?;
    model.assets.push(InlinedAsset {
        name,
        data: payload[offset..].to_vec(),
    });
    Ok(())
}

fn decode_procedural(
    model: &mut Model,
    ctx: &Ctx<'_>,
    payload: &[u8],
    ext: &mut dyn ReadExternal,
) -> Result<()> {
    let mut offset = 0;
    let name = ctx.read_str(payload, &mut offset)?;
    model.procedurals.push(name.clone());

    let script = model
        .assets
        .iter()
        .find(|a| a.name == name)
        .map(|a| a.data.clone())
        .or_else(|| ext.read(&name));
    match script {
        None => {
            tracing::warn!(script = %name, "procedural surface script not found");
            model.record_error(Error::MissingAsset { name });
        }
        Some(script) => {
            if !ext.interpret_procedural(&name, &script, model) {
                tracing::debug!(script = %name, "no procedural surface interpreter installed");
            }
        }
    }
    Ok(())
}

fn decode_labels(model: &mut Model, ctx: &Ctx<'_>, payload: &[u8]) -> Result<()> {
    let vertex_w = ctx.need(ctx.widths.vertex, "vertex")?;
    let mut offset = 0;
    let name = ctx.read_str(payload, &mut offset)?;
    let lang = ctx.read_str(payload, &mut offset)?;
    let (color, cmap_missing) = ctx.read_color(&model.color_map, payload, &mut offset)?;
    if cmap_missing {
        model.record_error(Error::MissingColorMap);
    }
    let count = read_count(payload, &mut offset, vertex_w)?;
    for _ in 0..count {
        let vertex = read_index(payload, &mut offset, vertex_w)?
            .value()
            .ok_or(DecodeError::InvalidFormat {
                context: "label",
                detail: "undefined target vertex".into(),
            })?;
        let text = ctx.read_str(payload, &mut offset)?;
        model.labels.push(Label {
            name: name.clone(),
            lang: lang.clone(),
            color,
            vertex,
            text,
        });
    }
    Ok(())
}

fn post_process(model: &mut Model) {
    voxel::mesh_voxel_blocks(model);
    generate_missing_normals(model);
    if !model.bones.is_empty() {
        skeleton::build_bone_weights(model);
        skeleton::compute_bind_matrices(model);
    }
}

/// Generate flat normals for faces that lack explicit ones, averaged per
/// shared vertex. The vertex array doubles: the first half keeps the
/// positions, the second half holds one normal per original vertex at the
/// same index offset.
fn generate_missing_normals(model: &mut Model) {
    if !model.faces.iter().any(|f| f.normals[0].is_none()) {
        return;
    }

    let base = model.vertices.len();
    let mut accumulated = vec![Vec3::ZERO; base];
    for face in &model.faces {
        if face.normals[0].is_some() {
            continue;
        }
        let positions: Vec<Vec3> = face
            .vertices
            .iter()
            .filter_map(|&v| model.vertices.get(v as usize))
            .map(|v| v.position)
            .collect();
        let [a, b, c] = positions.as_slice() else {
            continue;
        };
        let normal = (*b - *a).cross(*c - *a).normalize_or_zero();
        for &v in &face.vertices {
            if let Some(slot) = accumulated.get_mut(v as usize) {
                *slot += normal;
            }
        }
    }

    for index in 0..base {
        let normal = accumulated[index].normalize_or_zero();
        model.vertices.push(Vertex::auxiliary(normal, 1.0));
    }
    for face in &mut model.faces {
        if face.normals[0].is_some() {
            continue;
        }
        for corner in 0..3 {
            face.normals[corner] = Some(face.vertices[corner] + base as u32);
        }
    }
}
