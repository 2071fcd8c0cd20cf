//! Voxel palette and grid codecs, and the voxel-to-mesh conversion.
//!
//! Meshing walks every solid cell, tests its six axis neighbors and emits
//! a pair of triangles per exposed face. Corner vertices are shared
//! between adjacent faces of the same direction through a fixed
//! corner table, and each direction gets one precomputed axis-aligned
//! normal vertex; voxel surfaces are always flat shaded.

use std::collections::HashMap;

use glam::Vec3;
use m3d_decode::error::DecodeError;
use m3d_decode::index::{self, IndexWidth, PackedIndex, read_index, write_index};
use m3d_decode::{buf, rle};

use crate::error::{Error, Result};
use crate::model::{Face, Model, Vertex, VertexKind, VoxelBlock, VoxelType};
use crate::read::Ctx;
use crate::write::Enc;

/// Unit cube corners, indexed by the face table below.
const CORNERS: [[i64; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [0, 1, 0],
    [1, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [0, 1, 1],
    [1, 1, 1],
];

/// Corner indices per face direction (-X, +X, -Y, +Y, -Z, +Z), CCW.
const FACE_CORNERS: [[usize; 4]; 6] = [
    [0, 2, 6, 4],
    [5, 7, 3, 1],
    [0, 4, 5, 1],
    [6, 2, 3, 7],
    [1, 3, 2, 0],
    [4, 6, 7, 5],
];

/// Neighbor offsets per face direction.
const NEIGHBORS: [[i64; 3]; 6] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
];

/// Flat normals per face direction.
const NORMALS: [Vec3; 6] = [
    Vec3::NEG_X,
    Vec3::X,
    Vec3::NEG_Y,
    Vec3::Y,
    Vec3::NEG_Z,
    Vec3::Z,
];

// --- decode ---------------------------------------------------------------

pub(crate) fn decode_voxel_types(model: &mut Model, ctx: &Ctx<'_>, payload: &[u8]) -> Result<()> {
    let mut offset = 0;
    while offset < payload.len() {
        let (color, cmap_missing) = ctx.read_color(&model.color_map, payload, &mut offset)?;
        if cmap_missing {
            model.record_error(Error::MissingColorMap);
        }
        let name = ctx.read_str(payload, &mut offset)?;
        let rotation = buf::read_u8(payload, &mut offset, "voxel type")?;
        let shape = buf::read_u16(payload, &mut offset, "voxel type")?;
        let skin = match ctx.widths.skin {
            Some(width) => read_index(payload, &mut offset, width)?.value(),
            None => None,
        };
        let item_count = buf::read_u8(payload, &mut offset, "voxel type")?;
        let mut items = Vec::with_capacity(usize::from(item_count));
        for _ in 0..item_count {
            let item_name = ctx.read_str(payload, &mut offset)?;
            let count = buf::read_u16(payload, &mut offset, "voxel type")?;
            items.push((item_name, count));
        }
        model.voxel_types.push(VoxelType {
            name,
            color,
            rotation,
            shape,
            skin,
            items,
        });
    }
    Ok(())
}

fn read_signed_dim(
    payload: &[u8],
    offset: &mut usize,
    width: IndexWidth,
) -> Result<i32> {
    let raw = index::read_count(payload, offset, width)?;
    Ok(match width {
        IndexWidth::U8 => i32::from(raw as u8 as i8),
        IndexWidth::U16 => i32::from(raw as u16 as i16),
        IndexWidth::U32 => raw as i32,
    })
}

pub(crate) fn decode_voxel_block(model: &mut Model, ctx: &Ctx<'_>, payload: &[u8]) -> Result<()> {
    let dim_w = ctx.need(ctx.widths.voxel_dim, "voxel dimension")?;
    let Some(pixel_w) = ctx.widths.voxel_pixel else {
        return Err(Error::UnsupportedWidth {
            context: "voxel palette",
            bytes: 8,
        });
    };
    if pixel_w == IndexWidth::U32 {
        return Err(Error::UnsupportedWidth {
            context: "voxel palette",
            bytes: 4,
        });
    }

    let mut offset = 0;
    let name = ctx.read_str(payload, &mut offset)?;
    let position = [
        read_signed_dim(payload, &mut offset, dim_w)?,
        read_signed_dim(payload, &mut offset, dim_w)?,
        read_signed_dim(payload, &mut offset, dim_w)?,
    ];
    let size = [
        index::read_count(payload, &mut offset, dim_w)?,
        index::read_count(payload, &mut offset, dim_w)?,
        index::read_count(payload, &mut offset, dim_w)?,
    ];
    let uncertainty = buf::read_u8(payload, &mut offset, "voxel block")?;
    let group = buf::read_u8(payload, &mut offset, "voxel block")?;

    let cell_count = size.iter().map(|&d| d as usize).product::<usize>();
    let packed = rle::decode_rle(payload, &mut offset, cell_count, pixel_w)?;
    let cells = packed
        .into_iter()
        .map(|cell| cell.value().map(|v| v as u16))
        .collect();

    model.voxel_blocks.push(VoxelBlock {
        name,
        position,
        size,
        uncertainty,
        group,
        cells,
    });
    Ok(())
}

// --- encode ---------------------------------------------------------------

pub(crate) fn encode_voxel_types(enc: &Enc, types: &[VoxelType]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for voxel_type in types {
        enc.write_color(&mut out, voxel_type.color)?;
        enc.write_str(&mut out, &voxel_type.name)?;
        out.push(voxel_type.rotation);
        out.extend_from_slice(&voxel_type.shape.to_le_bytes());
        if let Some(width) = enc.widths.skin {
            write_index(&mut out, width, PackedIndex::from_option(voxel_type.skin))?;
        }
        out.push(voxel_type.items.len() as u8);
        for (name, count) in &voxel_type.items {
            enc.write_str(&mut out, name)?;
            out.extend_from_slice(&count.to_le_bytes());
        }
    }
    Ok(out)
}

pub(crate) fn encode_voxel_block(enc: &Enc, block: &VoxelBlock) -> Result<Vec<u8>> {
    let dim_w = enc.need(enc.widths.voxel_dim, "voxel dimension")?;
    let pixel_w = enc.need(enc.widths.voxel_pixel, "voxel palette")?;
    let mut out = Vec::new();

    enc.write_str(&mut out, &block.name)?;
    for &p in &block.position {
        index::write_count(&mut out, dim_w, p as u32);
    }
    for &d in &block.size {
        index::write_count(&mut out, dim_w, d);
    }
    out.push(block.uncertainty);
    out.push(block.group);

    let packed: Vec<PackedIndex> = block
        .cells
        .iter()
        .map(|cell| PackedIndex::from_option(cell.map(u32::from)))
        .collect();
    rle::encode_rle(&mut out, &packed, pixel_w)?;
    Ok(out)
}

/// The smallest voxel dimension width whose signed range covers every
/// block origin and whose index range covers every block dimension.
///
/// Large grids silently upgrade the on-disk width; the chosen table is
/// reported back through [`crate::SaveOutput`].
pub(crate) fn voxel_dim_width(blocks: &[VoxelBlock]) -> IndexWidth {
    let mut max_dim: u32 = 0;
    let mut max_abs_pos: i64 = 0;
    for block in blocks {
        for &d in &block.size {
            max_dim = max_dim.max(d);
        }
        for &p in &block.position {
            max_abs_pos = max_abs_pos.max(i64::from(p).abs());
        }
    }
    for width in [IndexWidth::U8, IndexWidth::U16] {
        let signed_limit = i64::from(width.limit()) / 2;
        if u64::from(max_dim) < u64::from(width.limit()) && max_abs_pos < signed_limit {
            return width;
        }
    }
    IndexWidth::U32
}

// --- meshing --------------------------------------------------------------

fn solid(block: &VoxelBlock, palette_len: usize, x: i64, y: i64, z: i64) -> bool {
    // A palette index past the end of the palette counts as empty.
    block
        .cell(x, y, z)
        .is_some_and(|index| (index as usize) < palette_len)
}

/// Convert every voxel block into mesh faces and vertices, appended to the
/// model. Runs once in the post-process pass when any block was decoded.
pub(crate) fn mesh_voxel_blocks(model: &mut Model) {
    if model.voxel_blocks.is_empty() {
        return;
    }

    // Uniform scale: half the largest bounding box extent maps the whole
    // voxel model into a unit-ish cube.
    let mut min = [i64::MAX; 3];
    let mut max = [i64::MIN; 3];
    for block in &model.voxel_blocks {
        for axis in 0..3 {
            min[axis] = min[axis].min(i64::from(block.position[axis]));
            max[axis] =
                max[axis].max(i64::from(block.position[axis]) + i64::from(block.size[axis]));
        }
    }
    let mid = Vec3::new(
        (min[0] + max[0]) as f32 / 2.0,
        (min[1] + max[1]) as f32 / 2.0,
        (min[2] + max[2]) as f32 / 2.0,
    );
    let half = (0..3)
        .map(|axis| (max[axis] - min[axis]) as f32 / 2.0)
        .fold(1.0f32, f32::max);
    let inv_scale = 1.0 / half;

    // One shared normal vertex per face direction.
    let normal_base = model.vertices.len() as u32;
    for normal in NORMALS {
        model.vertices.push(Vertex::auxiliary(normal, 1.0));
    }

    let palette_len = model.voxel_types.len();
    let mut corner_cache: HashMap<(usize, [i64; 3]), u32> = HashMap::new();

    let blocks = std::mem::take(&mut model.voxel_blocks);
    for block in &blocks {
        let [w, h, d] = block.size;
        for y in 0..i64::from(h) {
            for z in 0..i64::from(d) {
                for x in 0..i64::from(w) {
                    let Some(palette_index) = block.cell(x, y, z) else {
                        continue;
                    };
                    let Some(voxel_type) = model.voxel_types.get(palette_index as usize) else {
                        continue;
                    };
                    let color = voxel_type.color;
                    let skin = voxel_type.skin;

                    for (direction, neighbor) in NEIGHBORS.iter().enumerate() {
                        if solid(
                            block,
                            palette_len,
                            x + neighbor[0],
                            y + neighbor[1],
                            z + neighbor[2],
                        ) {
                            continue;
                        }

                        let mut quad = [0u32; 4];
                        for (slot, &corner) in FACE_CORNERS[direction].iter().enumerate() {
                            let grid = [
                                i64::from(block.position[0]) + x + CORNERS[corner][0],
                                i64::from(block.position[1]) + y + CORNERS[corner][1],
                                i64::from(block.position[2]) + z + CORNERS[corner][2],
                            ];
                            let index = *corner_cache
                                .entry((direction, grid))
                                .or_insert_with(|| {
                                    let position = (Vec3::new(
                                        grid[0] as f32,
                                        grid[1] as f32,
                                        grid[2] as f32,
                                    ) - mid)
                                        * inv_scale;
                                    model.vertices.push(Vertex {
                                        position,
                                        w: 1.0,
                                        color,
                                        kind: VertexKind::Mesh { skin },
                                    });
                                    (model.vertices.len() - 1) as u32
                                });
                            quad[slot] = index;
                        }

                        let normal = normal_base + direction as u32;
                        for triangle in [[quad[0], quad[2], quad[1]], [quad[0], quad[3], quad[2]]] {
                            model.faces.push(Face {
                                material: None,
                                param: None,
                                vertices: triangle,
                                uvs: [None; 3],
                                normals: [Some(normal); 3],
                                vmax: [None; 3],
                            });
                        }
                    }
                }
            }
        }
    }
    model.voxel_blocks = blocks;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_type_model() -> Model {
        let mut model = Model::new();
        model.voxel_types.push(VoxelType {
            name: "stone".into(),
            color: 0xFF80_8080,
            ..VoxelType::default()
        });
        model
    }

    #[test]
    fn test_isolated_voxel_meshes_six_faces() {
        let mut model = single_type_model();
        model.voxel_blocks.push(VoxelBlock {
            size: [1, 1, 1],
            cells: vec![Some(0)],
            ..VoxelBlock::default()
        });
        mesh_voxel_blocks(&mut model);
        // 6 exposed faces, two triangles each.
        assert_eq!(model.faces.len(), 12);
        // 6 normals + 8 shared-per-direction corner sets of 4.
        assert_eq!(model.vertices.len(), 6 + 6 * 4);
        assert!(model.faces.iter().all(|f| f.normals[0].is_some()));
    }

    #[test]
    fn test_adjacent_voxels_cull_shared_face() {
        let mut model = single_type_model();
        model.voxel_blocks.push(VoxelBlock {
            size: [2, 1, 1],
            cells: vec![Some(0), Some(0)],
            ..VoxelBlock::default()
        });
        mesh_voxel_blocks(&mut model);
        // 10 exposed faces, the shared internal face is culled from both
        // sides.
        assert_eq!(model.faces.len(), 20);
    }

    #[test]
    fn test_out_of_palette_index_is_empty() {
        let mut model = single_type_model();
        model.voxel_blocks.push(VoxelBlock {
            size: [1, 1, 1],
            cells: vec![Some(9)],
            ..VoxelBlock::default()
        });
        mesh_voxel_blocks(&mut model);
        assert_eq!(model.faces.len(), 0);
    }

    #[test]
    fn test_empty_grid_meshes_nothing() {
        let mut model = single_type_model();
        mesh_voxel_blocks(&mut model);
        assert!(model.faces.is_empty());
        assert!(model.vertices.is_empty());
    }

    #[test]
    fn test_voxel_dim_width_upgrade() {
        let small = VoxelBlock {
            size: [10, 10, 10],
            ..VoxelBlock::default()
        };
        assert_eq!(voxel_dim_width(&[small]), IndexWidth::U8);

        // 254 distinct coordinate values no longer fit a 1-byte width.
        let wide = VoxelBlock {
            size: [254, 1, 1],
            ..VoxelBlock::default()
        };
        assert_eq!(voxel_dim_width(&[wide]), IndexWidth::U16);

        let huge = VoxelBlock {
            size: [70000, 1, 1],
            ..VoxelBlock::default()
        };
        assert_eq!(voxel_dim_width(&[huge]), IndexWidth::U32);
    }
}
