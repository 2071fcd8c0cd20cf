//! Container saving: dedup and sort passes, chunk serialization,
//! compression and the file header.
//!
//! The save path mirrors the loader in reverse, with extra passes first:
//! skins, vertices and UVs are deduplicated by sort-then-collapse, faces
//! are regrouped by opacity and material for compression locality, and
//! every string in the model is collected into the shared header blob.

use std::collections::HashMap;

use m3d_decode::coord::CoordWidth;
use m3d_decode::error::DecodeError;
use m3d_decode::index::{self, IndexWidth, PackedIndex, WidthTable, write_index};
use m3d_decode::{StringTable, chunk, strings};

use crate::error::{Error, Result};
use crate::model::{Model, PropertyValue, Vertex, VertexKind};
use crate::read::{END_MAGIC, FILE_MAGIC};
use crate::{geometry, shape, skeleton, voxel};

/// Options for [`Model::to_vec`].
#[derive(Debug, Clone, Copy)]
pub struct SaveOptions {
    /// Compress the chunk stream with DEFLATE.
    pub compress: bool,
    /// Coordinate quantization for positions and UVs.
    pub coord_quality: CoordWidth,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            compress: true,
            coord_quality: CoordWidth::F32,
        }
    }
}

/// The serialized container plus the width table that was actually chosen.
///
/// Large voxel grids silently upgrade the voxel coordinate width; the
/// table reported here makes the choice observable without re-deriving
/// the bounding box.
#[derive(Debug, Clone)]
pub struct SaveOutput {
    pub bytes: Vec<u8>,
    pub widths: WidthTable,
}

/// Shared encode state: chosen widths, the interned string table and the
/// color palette (empty when colors are stored directly).
pub(crate) struct Enc {
    pub widths: WidthTable,
    pub strings: StringTable,
    cmap_index: HashMap<u32, u32>,
}

impl Enc {
    pub fn need(&self, width: Option<IndexWidth>, what: &'static str) -> Result<IndexWidth> {
        width.ok_or_else(|| {
            DecodeError::InvalidFormat {
                context: "encoder",
                detail: format!("{what} indices needed but no width was chosen"),
            }
            .into()
        })
    }

    pub fn write_str(&self, out: &mut Vec<u8>, s: &str) -> Result<()> {
        let offset = self
            .strings
            .offset_of(s)
            .ok_or_else(|| DecodeError::InvalidFormat {
                context: "string table",
                detail: format!("'{s}' was never interned"),
            })?;
        self.write_str_offset(out, offset);
        Ok(())
    }

    pub fn write_str_offset(&self, out: &mut Vec<u8>, raw: u32) {
        let width = self.widths.string.unwrap_or(IndexWidth::U32);
        index::write_count(out, width, raw);
    }

    pub fn write_color(&self, out: &mut Vec<u8>, color: u32) -> Result<()> {
        match self.widths.color {
            None => {
                out.extend_from_slice(&color.to_le_bytes());
                Ok(())
            }
            Some(width) => {
                let index =
                    *self
                        .cmap_index
                        .get(&color)
                        .ok_or_else(|| DecodeError::InvalidFormat {
                            context: "color map",
                            detail: format!("color {color:#010x} was never collected"),
                        })?;
                write_index(out, width, PackedIndex::Value(index))?;
                Ok(())
            }
        }
    }
}

impl Model {
    /// Serialize the model into a self-contained container.
    ///
    /// The model itself is not mutated; dedup and regrouping happen on a
    /// working copy.
    pub fn to_vec(&self, options: &SaveOptions) -> Result<SaveOutput> {
        let mut work = self.clone();
        canonicalize_strings(&mut work);
        cap_and_dedup_skins(&mut work);
        dedup_vertices(&mut work);
        dedup_uvs(&mut work);
        sort_faces(&mut work);

        let cmap = build_color_map(&work);
        let widths = choose_widths(&work, &cmap, options)?;

        // Header layout: scale, types, four inline strings, string blob.
        let blob_base = 8
            + work.name.len()
            + work.license.len()
            + work.author.len()
            + work.description.len()
            + 4;
        let mut table = StringTable::new(blob_base as u32);
        collect_strings(&work, &mut table);

        // The blob size decides how wide string offsets must be.
        let max_offset = blob_base + table.blob().len();
        let widths = WidthTable {
            string: Some(IndexWidth::for_count(max_offset)),
            ..widths
        };

        let cmap_index = cmap
            .iter()
            .enumerate()
            .map(|(index, &color)| (color, index as u32))
            .collect();
        let enc = Enc {
            widths,
            strings: table,
            cmap_index,
        };

        let mut body = Vec::new();
        write_header_chunk(&mut body, &work, &enc);
        if !cmap.is_empty() {
            chunk::write_chunk(&mut body, *b"CMAP", &geometry::encode_color_map(&cmap));
        }
        if !work.uvs.is_empty() {
            chunk::write_chunk(&mut body, *b"TMAP", &geometry::encode_uvs(&enc, &work.uvs));
        }
        if !work.vertices.is_empty() {
            chunk::write_chunk(&mut body, *b"VRTS", &geometry::encode_vertices(&enc, &work.vertices)?);
        }
        if !work.bones.is_empty() || !work.skins.is_empty() {
            chunk::write_chunk(
                &mut body,
                *b"BONE",
                &skeleton::encode_bones(&enc, &work.bones, &work.skins)?,
            );
        }
        for material in &work.materials {
            chunk::write_chunk(&mut body, *b"MTRL", &geometry::encode_material(&enc, &work, material)?);
        }
        for name in &work.procedurals {
            let mut payload = Vec::new();
            enc.write_str(&mut payload, name)?;
            chunk::write_chunk(&mut body, *b"PROC", &payload);
        }
        if !work.faces.is_empty() {
            chunk::write_chunk(&mut body, *b"MESH", &geometry::encode_mesh(&enc, &work, &work.faces)?);
        }
        if !work.voxel_types.is_empty() {
            chunk::write_chunk(&mut body, *b"VOXT", &voxel::encode_voxel_types(&enc, &work.voxel_types)?);
        }
        for block in &work.voxel_blocks {
            chunk::write_chunk(&mut body, *b"VOXD", &voxel::encode_voxel_block(&enc, block)?);
        }
        for shape in &work.shapes {
            chunk::write_chunk(&mut body, *b"SHPE", &shape::encode_shape(&enc, shape)?);
        }
        encode_label_chunks(&mut body, &work, &enc)?;
        for action in &work.actions {
            chunk::write_chunk(&mut body, *b"ACTN", &skeleton::encode_action(&enc, action)?);
        }
        for asset in &work.assets {
            let mut payload = Vec::new();
            enc.write_str(&mut payload, &asset.name)?;
            payload.extend_from_slice(&asset.data);
            chunk::write_chunk(&mut body, *b"ASET", &payload);
        }
        for extra in &work.extras {
            chunk::write_chunk(&mut body, extra.magic, &extra.payload);
        }
        chunk::write_chunk(&mut body, END_MAGIC, &[]);

        let body = if options.compress {
            crate::compress::deflate(&body)?
        } else {
            body
        };

        let mut bytes = Vec::with_capacity(body.len() + 16);
        bytes.extend_from_slice(&FILE_MAGIC);
        bytes.extend_from_slice(&[0; 4]); // patched below
        if !work.preview.is_empty() {
            chunk::write_chunk(&mut bytes, *b"PRVW", &work.preview);
        }
        bytes.extend_from_slice(&body);
        let total = bytes.len() as u32;
        bytes[4..8].copy_from_slice(&total.to_le_bytes());

        Ok(SaveOutput { bytes, widths })
    }
}

fn write_header_chunk(body: &mut Vec<u8>, work: &Model, enc: &Enc) {
    let mut payload = Vec::new();
    payload.extend_from_slice(&work.scale.to_le_bytes());
    payload.extend_from_slice(&enc.widths.to_types_word().to_le_bytes());
    for s in [&work.name, &work.license, &work.author, &work.description] {
        payload.extend_from_slice(s.as_bytes());
        payload.push(0);
    }
    payload.extend_from_slice(enc.strings.blob());
    chunk::write_chunk(body, *b"HEAD", &payload);
}

/// Strip control characters from an inline header string, keeping spaces.
fn safe_inline(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect::<String>().trim_end().to_owned()
}

fn canonicalize_strings(work: &mut Model) {
    work.name = safe_inline(&work.name);
    work.license = safe_inline(&work.license);
    work.author = safe_inline(&work.author);
    work.description = strings::safe_multiline(&work.description, 65536);

    for bone in &mut work.bones {
        bone.name = strings::safe_string(&bone.name);
    }
    for material in &mut work.materials {
        material.name = strings::safe_string(&material.name);
    }
    for texture in &mut work.textures {
        texture.name = strings::safe_string(&texture.name);
    }
    for name in &mut work.procedurals {
        *name = strings::safe_string(name);
    }
    for shape in &mut work.shapes {
        shape.name = strings::safe_string(&shape.name);
        for command in &mut shape.commands {
            for arg in command.args.iter_mut().chain(command.groups.iter_mut().flatten()) {
                if let crate::model::CommandArg::Material(name) = arg {
                    *name = strings::safe_string(name);
                }
            }
        }
    }
    for voxel_type in &mut work.voxel_types {
        voxel_type.name = strings::safe_string(&voxel_type.name);
        for (name, _) in &mut voxel_type.items {
            *name = strings::safe_string(name);
        }
    }
    for block in &mut work.voxel_blocks {
        block.name = strings::safe_string(&block.name);
    }
    for label in &mut work.labels {
        label.name = strings::safe_string(&label.name);
        label.lang = strings::safe_string(&label.lang);
        label.text = strings::safe_multiline(&label.text, 256);
    }
    for action in &mut work.actions {
        action.name = strings::safe_string(&action.name);
    }
    for asset in &mut work.assets {
        asset.name = strings::safe_string(&asset.name);
    }
}

/// Sort each skin's entries by descending weight, cap at eight bones,
/// renormalize, then collapse identical skins to one entry.
fn cap_and_dedup_skins(work: &mut Model) {
    for skin in &mut work.skins {
        skin.entries
            .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        if skin.entries.len() > 8 {
            skin.entries.truncate(8);
        }
        let sum: f32 = skin.entries.iter().map(|(_, w)| w).sum();
        if sum > 0.0 && (sum - 1.0).abs() > f32::EPSILON {
            for (_, w) in &mut skin.entries {
                *w /= sum;
            }
        }
    }

    let key = |skin: &crate::model::Skin| -> Vec<(u32, u32)> {
        skin.entries.iter().map(|&(b, w)| (b, w.to_bits())).collect()
    };
    let n = work.skins.len();
    let mut order: Vec<u32> = (0..n as u32).collect();
    order.sort_by_key(|&i| key(&work.skins[i as usize]));

    let mut deduped = Vec::new();
    let mut remap = vec![0u32; n];
    let mut previous: Option<Vec<(u32, u32)>> = None;
    for &old in &order {
        let k = key(&work.skins[old as usize]);
        if previous.as_ref() != Some(&k) {
            deduped.push(work.skins[old as usize].clone());
            previous = Some(k);
        }
        remap[old as usize] = (deduped.len() - 1) as u32;
    }
    work.skins = deduped;

    for vertex in &mut work.vertices {
        if let VertexKind::Mesh { skin: Some(skin) } = &mut vertex.kind {
            if let Some(&new) = remap.get(*skin as usize) {
                *skin = new;
            }
        }
    }
}

type VertexKey = (u32, u32, u32, u32, u32, u8, u32);

fn vertex_key(v: &Vertex) -> VertexKey {
    let (tag, skin) = match v.kind {
        VertexKind::Mesh { skin: None } => (0, 0),
        VertexKind::Mesh { skin: Some(s) } => (1, s),
        VertexKind::Auxiliary => (2, 0),
    };
    (
        v.position.x.to_bits(),
        v.position.y.to_bits(),
        v.position.z.to_bits(),
        v.w.to_bits(),
        v.color,
        tag,
        skin,
    )
}

/// Sort vertices by content and collapse adjacent duplicates, remapping
/// every vertex reference in the model.
fn dedup_vertices(work: &mut Model) {
    let n = work.vertices.len();
    let mut order: Vec<u32> = (0..n as u32).collect();
    order.sort_by_key(|&i| vertex_key(&work.vertices[i as usize]));

    let mut deduped = Vec::with_capacity(n);
    let mut remap = vec![0u32; n];
    let mut previous: Option<VertexKey> = None;
    for &old in &order {
        let k = vertex_key(&work.vertices[old as usize]);
        if previous != Some(k) {
            deduped.push(work.vertices[old as usize]);
            previous = Some(k);
        }
        remap[old as usize] = (deduped.len() - 1) as u32;
    }
    work.vertices = deduped;

    let map = |index: &mut u32| {
        if let Some(&new) = remap.get(*index as usize) {
            *index = new;
        }
    };
    for face in &mut work.faces {
        face.vertices.iter_mut().for_each(&map);
        for slot in face.normals.iter_mut().chain(face.vmax.iter_mut()).flatten() {
            map(slot);
        }
    }
    for bone in &mut work.bones {
        map(&mut bone.position);
        map(&mut bone.orientation);
        // Derived weight lists are rebuilt on load, not stored.
        bone.weights.clear();
    }
    for action in &mut work.actions {
        for frame in &mut action.frames {
            for transform in &mut frame.transforms {
                map(&mut transform.position);
                map(&mut transform.orientation);
            }
        }
    }
    for label in &mut work.labels {
        map(&mut label.vertex);
    }
    for_shape_args(work, |arg| {
        if let crate::model::CommandArg::Vertex(v) = arg {
            map(v);
        }
    });
}

fn for_shape_args(work: &mut Model, mut visit: impl FnMut(&mut crate::model::CommandArg)) {
    for shape in &mut work.shapes {
        for command in &mut shape.commands {
            for arg in command.args.iter_mut().chain(command.groups.iter_mut().flatten()) {
                visit(arg);
            }
        }
    }
}

fn dedup_uvs(work: &mut Model) {
    let n = work.uvs.len();
    let key = |uv: &crate::model::UvCoord| (uv.u.to_bits(), uv.v.to_bits());
    let mut order: Vec<u32> = (0..n as u32).collect();
    order.sort_by_key(|&i| key(&work.uvs[i as usize]));

    let mut deduped = Vec::with_capacity(n);
    let mut remap = vec![0u32; n];
    let mut previous = None;
    for &old in &order {
        let k = key(&work.uvs[old as usize]);
        if previous != Some(k) {
            deduped.push(work.uvs[old as usize]);
            previous = Some(k);
        }
        remap[old as usize] = (deduped.len() - 1) as u32;
    }
    work.uvs = deduped;

    for face in &mut work.faces {
        for slot in face.uvs.iter_mut().flatten() {
            if let Some(&new) = remap.get(*slot as usize) {
                *slot = new;
            }
        }
    }
    for_shape_args(work, |arg| {
        if let crate::model::CommandArg::Uv(v) = arg {
            if let Some(&new) = remap.get(*v as usize) {
                *v = new;
            }
        }
    });
}

fn material_is_transparent(model: &Model, material: Option<u32>) -> bool {
    material
        .and_then(|index| model.materials.get(index as usize))
        .is_some_and(|material| {
            material.properties.iter().any(|p| {
                p.type_id == 7 && matches!(p.value, PropertyValue::Float(v) if v < 1.0)
            })
        })
}

/// Group faces by opacity then material so runs share one sticky switch.
fn sort_faces(work: &mut Model) {
    let keys: Vec<(bool, u32)> = work
        .faces
        .iter()
        .map(|face| {
            (
                material_is_transparent(work, face.material),
                face.material.unwrap_or(u32::MAX),
            )
        })
        .collect();
    let mut order: Vec<u32> = (0..work.faces.len() as u32).collect();
    order.sort_by_key(|&i| keys[i as usize]);
    let mut remap = vec![0u32; order.len()];
    for (new, &old) in order.iter().enumerate() {
        remap[old as usize] = new as u32;
    }
    work.faces = order
        .into_iter()
        .map(|i| work.faces[i as usize])
        .collect();
    for_shape_args(work, |arg| {
        if let crate::model::CommandArg::Face(f) = arg {
            if let Some(&new) = remap.get(*f as usize) {
                *f = new;
            }
        }
    });
}

/// Every distinct color in the model, sorted by the HSV value heuristic.
/// Empty when there is nothing to palette.
fn build_color_map(work: &Model) -> Vec<u32> {
    let mut colors: Vec<u32> = work
        .vertices
        .iter()
        .map(|v| v.color)
        .chain(work.voxel_types.iter().map(|t| t.color))
        .chain(work.labels.iter().map(|l| l.color))
        .chain(work.materials.iter().flat_map(|m| {
            m.properties.iter().filter_map(|p| match p.value {
                PropertyValue::Color(c) => Some(c),
                _ => None,
            })
        }))
        .collect();
    colors.sort_by_key(|&c| geometry::color_sort_key(c));
    colors.dedup();
    if colors.len() >= IndexWidth::U16.limit() as usize {
        // Too many distinct colors to palette; store them directly.
        return Vec::new();
    }
    colors
}

fn choose_widths(work: &Model, cmap: &[u32], options: &SaveOptions) -> Result<WidthTable> {
    let some_if = |non_empty: bool, count: usize| non_empty.then(|| IndexWidth::for_count(count));

    let has_aux = work
        .vertices
        .iter()
        .any(|v| v.kind == VertexKind::Auxiliary);
    let max_frame_count = work
        .actions
        .iter()
        .flat_map(|a| {
            std::iter::once(a.frames.len())
                .chain(a.frames.iter().map(|f| f.transforms.len()))
        })
        .max()
        .unwrap_or(0);
    let bones_per_skin = match work.skins.iter().map(|s| s.entries.len()).max().unwrap_or(0) {
        0 | 1 => 1,
        2 => 2,
        3 | 4 => 4,
        _ => 8,
    };

    let voxel_pixel = if work.voxel_types.is_empty() && work.voxel_blocks.is_empty() {
        None
    } else if work.voxel_types.len() < IndexWidth::U8.limit() as usize {
        Some(IndexWidth::U8)
    } else if work.voxel_types.len() < IndexWidth::U16.limit() as usize {
        Some(IndexWidth::U16)
    } else {
        return Err(Error::UnsupportedWidth {
            context: "voxel palette",
            bytes: 4,
        });
    };

    Ok(WidthTable {
        coord: options.coord_quality,
        vertex: some_if(!work.vertices.is_empty(), work.vertices.len()),
        string: Some(IndexWidth::U32), // tightened after string collection
        color: some_if(!cmap.is_empty(), cmap.len()),
        uv: some_if(!work.uvs.is_empty(), work.uvs.len()),
        bone: some_if(
            !work.bones.is_empty() || !work.skins.is_empty(),
            work.bones.len(),
        ),
        bones_per_skin,
        skin: some_if(!work.skins.is_empty() || has_aux, work.skins.len()),
        frame: some_if(!work.actions.is_empty(), max_frame_count),
        shape: some_if(!work.shapes.is_empty(), work.shapes.len()),
        face: some_if(!work.faces.is_empty(), work.faces.len()),
        voxel_dim: (!work.voxel_blocks.is_empty()).then(|| voxel::voxel_dim_width(&work.voxel_blocks)),
        voxel_pixel,
    })
}

fn collect_strings(work: &Model, table: &mut StringTable) {
    for bone in &work.bones {
        table.intern(&bone.name);
    }
    for material in &work.materials {
        table.intern(&material.name);
    }
    for texture in &work.textures {
        table.intern(&texture.name);
    }
    for name in &work.procedurals {
        table.intern(name);
    }
    for shape in &work.shapes {
        table.intern(&shape.name);
        for command in &shape.commands {
            for arg in command.args.iter().chain(command.groups.iter().flatten()) {
                if let crate::model::CommandArg::Material(name) = arg {
                    table.intern(name);
                }
            }
        }
    }
    for voxel_type in &work.voxel_types {
        table.intern(&voxel_type.name);
        for (name, _) in &voxel_type.items {
            table.intern(name);
        }
    }
    for block in &work.voxel_blocks {
        table.intern(&block.name);
    }
    for label in &work.labels {
        table.intern(&label.name);
        table.intern(&label.lang);
        table.intern(&label.text);
    }
    for action in &work.actions {
        table.intern(&action.name);
    }
    for asset in &work.assets {
        table.intern(&asset.name);
    }
}

/// Labels group into chunks by their shared (name, language, color)
/// header; consecutive runs become one chunk each.
fn encode_label_chunks(body: &mut Vec<u8>, work: &Model, enc: &Enc) -> Result<()> {
    let vertex_w = match enc.widths.vertex {
        Some(width) => width,
        None => return Ok(()), // no vertices means no labels to target
    };
    let mut start = 0;
    while start < work.labels.len() {
        let head = &work.labels[start];
        let mut end = start + 1;
        while end < work.labels.len() {
            let label = &work.labels[end];
            if label.name != head.name || label.lang != head.lang || label.color != head.color {
                break;
            }
            end += 1;
        }

        let mut payload = Vec::new();
        enc.write_str(&mut payload, &head.name)?;
        enc.write_str(&mut payload, &head.lang)?;
        enc.write_color(&mut payload, head.color)?;
        index::write_count(&mut payload, vertex_w, (end - start) as u32);
        for label in &work.labels[start..end] {
            write_index(&mut payload, vertex_w, PackedIndex::Value(label.vertex))?;
            enc.write_str(&mut payload, &label.text)?;
        }
        chunk::write_chunk(body, *b"LBLS", &payload);
        start = end;
    }
    Ok(())
}
