//! Geometry chunk codecs: color map, UVs, vertices, materials and faces.

use glam::Vec3;
use m3d_decode::error::DecodeError;
use m3d_decode::index::{PackedIndex, read_index, write_index};
use m3d_decode::{buf, coord};

use crate::error::{Error, Result};
use crate::external::ReadExternal;
use crate::model::{
    Face, Material, MaterialProperty, Model, PropertyValue, Texture, UvCoord, Vertex, VertexKind,
};
use crate::read::Ctx;
use crate::write::Enc;

/// Value encoding of one scalar material property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PropFormat {
    Color,
    U8,
    U16,
    U32,
    F32,
}

/// The static property table: type code, canonical name, wire format.
/// Codes with the high bit set are the texture-map variants of the same
/// semantic and always carry a string reference instead.
pub(crate) const MATERIAL_PROPS: &[(u8, &str, PropFormat)] = &[
    (0, "Kd", PropFormat::Color),
    (1, "Ka", PropFormat::Color),
    (2, "Ks", PropFormat::Color),
    (3, "Ns", PropFormat::F32),
    (4, "Ke", PropFormat::Color),
    (5, "Tf", PropFormat::Color),
    (6, "Km", PropFormat::F32),
    (7, "d", PropFormat::F32),
    (8, "il", PropFormat::U8),
    (64, "Pr", PropFormat::F32),
    (65, "Pm", PropFormat::F32),
    (66, "Ps", PropFormat::F32),
    (67, "Ni", PropFormat::F32),
    (68, "Nt", PropFormat::U8),
];

pub(crate) fn property_format(type_id: u8) -> Option<PropFormat> {
    let base = type_id & 0x7F;
    MATERIAL_PROPS
        .iter()
        .find(|(id, _, _)| *id == base)
        .map(|(_, _, format)| *format)
}

// --- decode ---------------------------------------------------------------

pub(crate) fn decode_color_map(model: &mut Model, payload: &[u8]) -> Result<()> {
    if !payload.len().is_multiple_of(4) {
        return Err(DecodeError::InvalidFormat {
            context: "color map",
            detail: format!("payload of {} bytes is not a whole color array", payload.len()),
        }
        .into());
    }
    let mut offset = 0;
    while offset < payload.len() {
        let color = buf::read_u32(payload, &mut offset, "color map")?;
        model.color_map.push(color);
    }
    Ok(())
}

pub(crate) fn decode_uvs(model: &mut Model, ctx: &Ctx<'_>, payload: &[u8]) -> Result<()> {
    let record = 2 * ctx.widths.coord.bytes();
    if !payload.len().is_multiple_of(record) {
        return Err(DecodeError::InvalidFormat {
            context: "texture coordinates",
            detail: format!("payload of {} bytes is not a whole UV array", payload.len()),
        }
        .into());
    }
    let mut offset = 0;
    while offset < payload.len() {
        let u = coord::read_unsigned(payload, &mut offset, ctx.widths.coord)?;
        let v = coord::read_unsigned(payload, &mut offset, ctx.widths.coord)?;
        model.uvs.push(UvCoord { u, v });
    }
    Ok(())
}

pub(crate) fn decode_vertices(model: &mut Model, ctx: &Ctx<'_>, payload: &[u8]) -> Result<()> {
    let color_bytes = ctx.widths.color.map_or(4, m3d_decode::IndexWidth::bytes);
    let skin_bytes = ctx.widths.skin.map_or(0, m3d_decode::IndexWidth::bytes);
    let record = 4 * ctx.widths.coord.bytes() + color_bytes + skin_bytes;
    if !payload.len().is_multiple_of(record) {
        return Err(DecodeError::InvalidFormat {
            context: "vertices",
            detail: format!(
                "payload of {} bytes is not a whole array of {record}-byte records",
                payload.len()
            ),
        }
        .into());
    }

    let mut offset = 0;
    while offset < payload.len() {
        let x = coord::read_signed(payload, &mut offset, ctx.widths.coord)?;
        let y = coord::read_signed(payload, &mut offset, ctx.widths.coord)?;
        let z = coord::read_signed(payload, &mut offset, ctx.widths.coord)?;
        let w = coord::read_signed(payload, &mut offset, ctx.widths.coord)?;

        let (color, cmap_missing) = ctx.read_color(&model.color_map, payload, &mut offset)?;
        if cmap_missing {
            model.record_error(Error::MissingColorMap);
        }

        let kind = match ctx.widths.skin {
            None => VertexKind::Mesh { skin: None },
            Some(width) => match read_index(payload, &mut offset, width)? {
                PackedIndex::Value(skin) => VertexKind::Mesh { skin: Some(skin) },
                PackedIndex::Undefined => VertexKind::Mesh { skin: None },
                PackedIndex::Reserved => VertexKind::Auxiliary,
            },
        };

        model.vertices.push(Vertex {
            position: Vec3::new(x, y, z),
            w,
            color,
            kind,
        });
    }
    Ok(())
}

pub(crate) fn decode_material(
    model: &mut Model,
    ctx: &Ctx<'_>,
    payload: &[u8],
    ext: &mut dyn ReadExternal,
) -> Result<()> {
    let mut offset = 0;
    let name = ctx.read_str(payload, &mut offset)?;

    let mut material = Material {
        name: name.clone(),
        properties: Vec::new(),
    };

    while offset < payload.len() {
        let type_id = buf::read_u8(payload, &mut offset, "material property")?;

        if type_id & 0x80 != 0 {
            // Texture map variant: the value is a string reference.
            if property_format(type_id).is_none() {
                model.record_error(Error::UnknownProperty { type_id });
                tracing::warn!(type_id, material = %name, "unknown map property, dropping rest of chunk");
                return Ok(());
            }
            let tex_name = ctx.read_str(payload, &mut offset)?;
            let slot = find_or_create_texture(model, &tex_name, ext);
            material.properties.push(MaterialProperty {
                type_id,
                value: PropertyValue::Map(slot),
            });
            continue;
        }

        let Some(format) = property_format(type_id) else {
            // Unknown property sizes cannot be skipped over.
            model.record_error(Error::UnknownProperty { type_id });
            tracing::warn!(type_id, material = %name, "unknown property, dropping rest of chunk");
            return Ok(());
        };
        let value = match format {
            PropFormat::Color => {
                let (color, cmap_missing) = ctx.read_color(&model.color_map, payload, &mut offset)?;
                if cmap_missing {
                    model.record_error(Error::MissingColorMap);
                }
                PropertyValue::Color(color)
            }
            PropFormat::U8 => {
                PropertyValue::Uint(u32::from(buf::read_u8(payload, &mut offset, "material property")?))
            }
            PropFormat::U16 => {
                PropertyValue::Uint(u32::from(buf::read_u16(payload, &mut offset, "material property")?))
            }
            PropFormat::U32 => {
                PropertyValue::Uint(buf::read_u32(payload, &mut offset, "material property")?)
            }
            PropFormat::F32 => {
                PropertyValue::Float(buf::read_f32(payload, &mut offset, "material property")?)
            }
        };
        material.properties.push(MaterialProperty { type_id, value });
    }

    if model.materials.iter().any(|m| m.name == material.name) {
        tracing::warn!(material = %material.name, "duplicate material, keeping the first definition");
        model.record_error(Error::DuplicateDefinition {
            kind: "material",
            name: material.name,
        });
        return Ok(());
    }
    model.materials.push(material);
    Ok(())
}

/// Resolve a texture name to a slot index, creating the slot on first use.
///
/// Pixel bytes come from an inlined asset of the same name, or the host's
/// [`ReadExternal`] hook. An unresolvable or undecodable texture leaves an
/// empty slot behind and records a degraded error.
pub(crate) fn find_or_create_texture(
    model: &mut Model,
    name: &str,
    ext: &mut dyn ReadExternal,
) -> u32 {
    if let Some(slot) = model.textures.iter().position(|t| t.name == name) {
        return slot as u32;
    }

    let bytes = model
        .assets
        .iter()
        .find(|a| a.name == name)
        .map(|a| a.data.clone())
        .or_else(|| ext.read(name));

    let mut texture = Texture {
        name: name.to_owned(),
        ..Texture::default()
    };
    match bytes {
        None => {
            tracing::warn!(texture = name, "texture could not be resolved");
            model.record_error(Error::MissingTexture { name: name.to_owned() });
        }
        Some(bytes) => match image::load_from_memory(&bytes) {
            Err(e) => {
                tracing::warn!(texture = name, error = %e, "texture could not be decoded");
                model.record_error(Error::BadTexture { name: name.to_owned() });
            }
            Ok(img) => {
                texture.width = img.width();
                texture.height = img.height();
                match img {
                    image::DynamicImage::ImageLuma8(img) => {
                        texture.channels = 1;
                        texture.pixels = img.into_raw();
                    }
                    image::DynamicImage::ImageLumaA8(img) => {
                        texture.channels = 2;
                        texture.pixels = img.into_raw();
                    }
                    image::DynamicImage::ImageRgb8(img) => {
                        texture.channels = 3;
                        texture.pixels = img.into_raw();
                    }
                    other => {
                        texture.channels = 4;
                        texture.pixels = other.into_rgba8().into_raw();
                    }
                }
            }
        },
    }

    model.textures.push(texture);
    (model.textures.len() - 1) as u32
}

pub(crate) fn decode_mesh(model: &mut Model, ctx: &Ctx<'_>, payload: &[u8]) -> Result<()> {
    let vertex_w = ctx.need(ctx.widths.vertex, "vertex")?;
    let mut offset = 0;
    let mut current_material: Option<u32> = None;
    let mut current_param: Option<u32> = None;

    while offset < payload.len() {
        let control = buf::read_u8(payload, &mut offset, "face")?;
        let count = control >> 4;
        let flags = control & 0x0F;

        if count == 0 {
            // Sticky state switch for all subsequent faces.
            match flags {
                0 => {
                    let name = ctx.read_str(payload, &mut offset)?;
                    current_material = if name.is_empty() {
                        None
                    } else {
                        match model.materials.iter().position(|m| m.name == name) {
                            Some(idx) => Some(idx as u32),
                            None => {
                                tracing::warn!(material = %name, "face references unknown material");
                                model.record_error(Error::UnknownMaterial { name });
                                None
                            }
                        }
                    };
                }
                1 => {
                    let raw = ctx.read_str_offset(payload, &mut offset)?;
                    current_param = (raw != 0).then_some(raw);
                }
                other => {
                    return Err(DecodeError::InvalidFormat {
                        context: "face",
                        detail: format!("unknown switch kind {other}"),
                    }
                    .into());
                }
            }
            continue;
        }

        if count != 3 {
            // A non-triangle primitive poisons the whole face array.
            model.faces.clear();
            return Err(Error::NonTriangleFace { vertices: count });
        }

        let mut face = Face {
            material: current_material,
            param: current_param,
            ..Face::default()
        };
        for corner in 0..3 {
            face.vertices[corner] = read_index(payload, &mut offset, vertex_w)?
                .value()
                .ok_or(DecodeError::InvalidFormat {
                    context: "face",
                    detail: "undefined corner vertex".into(),
                })?;
            if flags & 1 != 0 {
                let uv_w = ctx.need(ctx.widths.uv, "uv")?;
                face.uvs[corner] = read_index(payload, &mut offset, uv_w)?.value();
            }
            if flags & 2 != 0 {
                face.normals[corner] = read_index(payload, &mut offset, vertex_w)?.value();
            }
            if flags & 4 != 0 {
                face.vmax[corner] = read_index(payload, &mut offset, vertex_w)?.value();
            }
        }
        model.faces.push(face);
    }
    Ok(())
}

// --- encode ---------------------------------------------------------------

/// Sort colors by the HSV value heuristic: brightest component first,
/// raw bit pattern only as the tie break.
pub(crate) fn color_sort_key(color: u32) -> (u8, u32) {
    let [r, g, b, _a] = color.to_le_bytes();
    (r.max(g).max(b), color)
}

pub(crate) fn encode_color_map(colors: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(colors.len() * 4);
    for color in colors {
        out.extend_from_slice(&color.to_le_bytes());
    }
    out
}

pub(crate) fn encode_uvs(enc: &Enc, uvs: &[UvCoord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(uvs.len() * 2 * enc.widths.coord.bytes());
    for uv in uvs {
        coord::write_unsigned(&mut out, enc.widths.coord, uv.u);
        coord::write_unsigned(&mut out, enc.widths.coord, uv.v);
    }
    out
}

pub(crate) fn encode_vertices(enc: &Enc, vertices: &[Vertex]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for vertex in vertices {
        coord::write_signed(&mut out, enc.widths.coord, vertex.position.x);
        coord::write_signed(&mut out, enc.widths.coord, vertex.position.y);
        coord::write_signed(&mut out, enc.widths.coord, vertex.position.z);
        coord::write_signed(&mut out, enc.widths.coord, vertex.w);
        enc.write_color(&mut out, vertex.color)?;
        if let Some(width) = enc.widths.skin {
            let index = match vertex.kind {
                VertexKind::Mesh { skin } => PackedIndex::from_option(skin),
                VertexKind::Auxiliary => PackedIndex::Reserved,
            };
            write_index(&mut out, width, index)?;
        }
    }
    Ok(out)
}

pub(crate) fn encode_material(enc: &Enc, model: &Model, material: &Material) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    enc.write_str(&mut out, &material.name)?;
    for property in &material.properties {
        out.push(property.type_id);
        match property.value {
            PropertyValue::Color(color) => enc.write_color(&mut out, color)?,
            PropertyValue::Uint(v) => match property_format(property.type_id) {
                Some(PropFormat::U8) => out.push(v as u8),
                Some(PropFormat::U16) => out.extend_from_slice(&(v as u16).to_le_bytes()),
                _ => out.extend_from_slice(&v.to_le_bytes()),
            },
            PropertyValue::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            PropertyValue::Map(slot) => {
                let name = model
                    .textures
                    .get(slot as usize)
                    .map(|t| t.name.as_str())
                    .unwrap_or_default();
                enc.write_str(&mut out, name)?;
            }
        }
    }
    Ok(out)
}

pub(crate) fn encode_mesh(enc: &Enc, model: &Model, faces: &[Face]) -> Result<Vec<u8>> {
    let vertex_w = enc.need(enc.widths.vertex, "vertex")?;
    let mut out = Vec::new();
    let mut current_material: Option<u32> = None;
    let mut current_param: Option<u32> = None;

    for face in faces {
        if face.material != current_material {
            out.push(0x00);
            let name = face
                .material
                .and_then(|m| model.materials.get(m as usize))
                .map(|m| m.name.as_str())
                .unwrap_or_default();
            enc.write_str(&mut out, name)?;
            current_material = face.material;
        }
        if face.param != current_param {
            out.push(0x01);
            enc.write_str_offset(&mut out, face.param.unwrap_or(0));
            current_param = face.param;
        }

        let has_uv = face.uvs[0].is_some();
        let has_normal = face.normals[0].is_some();
        let has_vmax = face.vmax[0].is_some();
        let flags =
            u8::from(has_uv) | (u8::from(has_normal) << 1) | (u8::from(has_vmax) << 2);
        out.push((3 << 4) | flags);

        for corner in 0..3 {
            write_index(&mut out, vertex_w, PackedIndex::Value(face.vertices[corner]))?;
            if has_uv {
                let uv_w = enc.need(enc.widths.uv, "uv")?;
                write_index(&mut out, uv_w, PackedIndex::from_option(face.uvs[corner]))?;
            }
            if has_normal {
                write_index(
                    &mut out,
                    vertex_w,
                    PackedIndex::from_option(face.normals[corner]),
                )?;
            }
            if has_vmax {
                write_index(&mut out, vertex_w, PackedIndex::from_option(face.vmax[corner]))?;
            }
        }
    }
    Ok(out)
}
