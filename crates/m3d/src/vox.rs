//! MagicaVoxel `.vox` reader and mesher.
//!
//! A much simpler sibling of the voxel block codec: one dense grid, one
//! 256-entry palette, no run-length encoding and no variable widths. The
//! grid is stored sparsely in 16-cubed chunks so large mostly-empty
//! models stay cheap, and meshing reuses the same six-neighbor visibility
//! rule as the main voxel mesher.

use std::fmt;

use glam::Vec3;

/// Chunked sparse voxel grid dimensions: 16 cells per axis per chunk.
const CHUNK_SHIFT: u32 = 4;
const CHUNK_CELLS: usize = 16 * 16 * 16;

/// Scale applied to emitted vertex positions, one voxel = 0.25 units.
const VOXEL_SCALE: f32 = 0.25;

/// Corner positions of a unit cube.
const CORNERS: [Vec3; 8] = [
    Vec3::new(0.0, 0.0, 0.0),
    Vec3::new(1.0, 0.0, 0.0),
    Vec3::new(0.0, 1.0, 0.0),
    Vec3::new(1.0, 1.0, 0.0),
    Vec3::new(0.0, 0.0, 1.0),
    Vec3::new(1.0, 0.0, 1.0),
    Vec3::new(0.0, 1.0, 1.0),
    Vec3::new(1.0, 1.0, 1.0),
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

const NEIGHBORS: [[i64; 3]; 6] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
];

/// Errors from the `.vox` reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoxError {
    /// Missing or wrong magic number.
    InvalidFormat { detail: String },
    /// File version predates the supported format.
    VersionTooOld { version: u32 },
}

impl fmt::Display for VoxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFormat { detail } => write!(f, "not a magicavoxel file: {detail}"),
            Self::VersionTooOld { version } => {
                write!(f, "magicavoxel version {version} is older than 150")
            }
        }
    }
}

impl std::error::Error for VoxError {}

/// A chunked sparse voxel grid with its palette.
#[derive(Debug, Clone)]
pub struct VoxGrid {
    size: [u32; 3],
    chunks_per_axis: [u32; 3],
    chunks: Vec<Option<Box<[u8]>>>,
    /// Palette colors as packed RGBA; index 0 is reserved and unused.
    pub palette: [u32; 256],
}

impl VoxGrid {
    fn new(size: [u32; 3]) -> Self {
        let chunks_per_axis = size.map(|s| s.div_ceil(16).max(1));
        let total = chunks_per_axis.iter().map(|&c| c as usize).product();
        Self {
            size,
            chunks_per_axis,
            chunks: vec![None; total],
            palette: [0; 256],
        }
    }

    /// Grid dimensions in voxels.
    #[must_use]
    pub fn size(&self) -> [u32; 3] {
        self.size
    }

    fn chunk_offset(&self, cx: u32, cy: u32, cz: u32) -> usize {
        ((cx * self.chunks_per_axis[1] * self.chunks_per_axis[2])
            + (cz * self.chunks_per_axis[1])
            + cy) as usize
    }

    fn set(&mut self, x: u32, y: u32, z: u32, id: u8) {
        if x >= self.size[0] || y >= self.size[1] || z >= self.size[2] {
            return;
        }
        let offset = self.chunk_offset(x >> CHUNK_SHIFT, y >> CHUNK_SHIFT, z >> CHUNK_SHIFT);
        let chunk = self.chunks[offset].get_or_insert_with(|| vec![0u8; CHUNK_CELLS].into());
        let (lx, ly, lz) = (x & 15, y & 15, z & 15);
        chunk[((lx << (2 * CHUNK_SHIFT)) + (lz << CHUNK_SHIFT) + ly) as usize] = id;
    }

    /// Palette index at a position; out-of-range and unset cells are 0.
    #[must_use]
    pub fn get(&self, x: i64, y: i64, z: i64) -> u8 {
        if x < 0 || y < 0 || z < 0 {
            return 0;
        }
        let (x, y, z) = (x as u32, y as u32, z as u32);
        if x >= self.size[0] || y >= self.size[1] || z >= self.size[2] {
            return 0;
        }
        let offset = self.chunk_offset(x >> CHUNK_SHIFT, y >> CHUNK_SHIFT, z >> CHUNK_SHIFT);
        match &self.chunks[offset] {
            None => 0,
            Some(chunk) => {
                let (lx, ly, lz) = (x & 15, y & 15, z & 15);
                chunk[((lx << (2 * CHUNK_SHIFT)) + (lz << CHUNK_SHIFT) + ly) as usize]
            }
        }
    }

    /// Visibility mask of the six faces of the voxel at a position; a set
    /// bit means that neighbor is empty and the face is exposed.
    #[must_use]
    pub fn visible_faces(&self, x: i64, y: i64, z: i64) -> u8 {
        NEIGHBORS
            .iter()
            .enumerate()
            .filter(|(_, n)| self.get(x + n[0], y + n[1], z + n[2]) == 0)
            .fold(0, |mask, (bit, _)| mask | (1 << bit))
    }
}

/// A triangle mesh built from a voxel grid.
#[derive(Debug, Clone, Default)]
pub struct VoxMesh {
    pub positions: Vec<Vec3>,
    pub indices: Vec<u16>,
    /// Packed RGBA color per vertex.
    pub colors: Vec<u32>,
}

/// Parse a `.vox` container into a sparse grid.
///
/// Recognizes the SIZE, XYZI and RGBA chunks; anything else (including the
/// MAIN wrapper's own content) is skipped by its declared size. Palette
/// entries shift up by one because index 0 is reserved.
pub fn parse_vox(data: &[u8]) -> Result<VoxGrid, VoxError> {
    if data.len() < 8 {
        return Err(VoxError::InvalidFormat {
            detail: format!("{} bytes is too short for the header", data.len()),
        });
    }
    if &data[0..4] != b"VOX " {
        return Err(VoxError::InvalidFormat {
            detail: "missing 'VOX ' magic".into(),
        });
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version < 150 {
        return Err(VoxError::VersionTooOld { version });
    }

    let mut grid = VoxGrid::new([0, 0, 0]);
    let mut offset = 8;
    while offset + 12 <= data.len() {
        let name = &data[offset..offset + 4];
        let content_size =
            u32::from_le_bytes([data[offset + 4], data[offset + 5], data[offset + 6], data[offset + 7]])
                as usize;
        // Bytes 8..12 hold the total size of child chunks; children are
        // walked inline so the field is not needed for traversal.
        let content = data
            .get(offset + 12..offset + 12 + content_size)
            .ok_or_else(|| VoxError::InvalidFormat {
                detail: "chunk content overruns the buffer".into(),
            })?;

        match name {
            b"SIZE" if content.len() >= 12 => {
                let size = [
                    u32::from_le_bytes([content[0], content[1], content[2], content[3]]),
                    u32::from_le_bytes([content[4], content[5], content[6], content[7]]),
                    u32::from_le_bytes([content[8], content[9], content[10], content[11]]),
                ];
                let palette = grid.palette;
                grid = VoxGrid::new(size);
                grid.palette = palette;
            }
            b"XYZI" if content.len() >= 4 => {
                let count =
                    u32::from_le_bytes([content[0], content[1], content[2], content[3]]) as usize;
                let voxels = content.get(4..4 + count * 4).ok_or_else(|| {
                    VoxError::InvalidFormat {
                        detail: "voxel list overruns its chunk".into(),
                    }
                })?;
                for voxel in voxels.chunks_exact(4) {
                    grid.set(
                        u32::from(voxel[0]),
                        u32::from(voxel[1]),
                        u32::from(voxel[2]),
                        voxel[3],
                    );
                }
            }
            b"RGBA" if content.len() >= 255 * 4 => {
                // Entry i of the file maps to palette index i + 1.
                for (i, rgba) in content.chunks_exact(4).take(255).enumerate() {
                    grid.palette[i + 1] =
                        u32::from_le_bytes([rgba[0], rgba[1], rgba[2], rgba[3]]);
                }
            }
            _ => {}
        }
        offset += 12 + content_size;
    }
    Ok(grid)
}

/// Mesh every solid voxel's exposed faces into quads of two triangles.
#[must_use]
pub fn build_mesh(grid: &VoxGrid) -> VoxMesh {
    let mut mesh = VoxMesh::default();
    let [sx, sy, sz] = grid.size();
    for x in 0..i64::from(sx) {
        for z in 0..i64::from(sz) {
            for y in 0..i64::from(sy) {
                let id = grid.get(x, y, z);
                if id != 0 {
                    build_voxel(grid, &mut mesh, x, y, z, id);
                }
            }
        }
    }
    mesh
}

/// Load a `.vox` buffer and mesh it in one step.
pub fn load_vox(data: &[u8]) -> Result<(VoxGrid, VoxMesh), VoxError> {
    let grid = parse_vox(data)?;
    let mesh = build_mesh(&grid);
    Ok((grid, mesh))
}

fn build_voxel(grid: &VoxGrid, mesh: &mut VoxMesh, x: i64, y: i64, z: i64, id: u8) {
    let mask = grid.visible_faces(x, y, z);
    if mask == 0 {
        return;
    }
    let base = Vec3::new(x as f32, y as f32, z as f32);
    let color = grid.palette[usize::from(id)];

    for (direction, corners) in FACE_CORNERS.iter().enumerate() {
        if mask & (1 << direction) == 0 {
            continue;
        }
        let first = mesh.positions.len() as u16;
        for &corner in corners {
            mesh.positions.push((CORNERS[corner] + base) * VOXEL_SCALE);
            mesh.colors.push(color);
        }
        // Two triangles per quad: corners 0-2-1 and 0-3-2.
        mesh.indices
            .extend_from_slice(&[first, first + 2, first + 1, first, first + 3, first + 2]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vox_file(voxels: &[(u8, u8, u8, u8)], size: [u32; 3]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"VOX ");
        data.extend_from_slice(&150u32.to_le_bytes());

        data.extend_from_slice(b"SIZE");
        data.extend_from_slice(&12u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        for s in size {
            data.extend_from_slice(&s.to_le_bytes());
        }

        data.extend_from_slice(b"XYZI");
        data.extend_from_slice(&((4 + voxels.len() * 4) as u32).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&(voxels.len() as u32).to_le_bytes());
        for &(x, y, z, i) in voxels {
            data.extend_from_slice(&[x, y, z, i]);
        }
        data
    }

    #[test]
    fn test_reject_bad_magic() {
        assert!(matches!(
            parse_vox(b"NOTVOX.."),
            Err(VoxError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_reject_old_version() {
        let mut data = Vec::new();
        data.extend_from_slice(b"VOX ");
        data.extend_from_slice(&100u32.to_le_bytes());
        assert_eq!(
            parse_vox(&data),
            Err(VoxError::VersionTooOld { version: 100 })
        );
    }

    #[test]
    fn test_grid_set_get_and_bounds() {
        let grid = parse_vox(&vox_file(&[(0, 0, 0, 7), (17, 0, 0, 9)], [20, 4, 4])).unwrap();
        assert_eq!(grid.get(0, 0, 0), 7);
        // The second voxel lands in a different 16-cube chunk.
        assert_eq!(grid.get(17, 0, 0), 9);
        assert_eq!(grid.get(1, 0, 0), 0);
        assert_eq!(grid.get(-1, 0, 0), 0);
        assert_eq!(grid.get(100, 0, 0), 0);
    }

    #[test]
    fn test_palette_shifts_by_one() {
        let mut data = vox_file(&[(0, 0, 0, 1)], [1, 1, 1]);
        data.extend_from_slice(b"RGBA");
        data.extend_from_slice(&1024u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        let mut palette = Vec::new();
        palette.extend_from_slice(&[10, 20, 30, 255]);
        palette.resize(1024, 0);
        data.extend_from_slice(&palette);

        let grid = parse_vox(&data).unwrap();
        // File entry 0 becomes palette index 1; index 0 stays reserved.
        assert_eq!(grid.palette[0], 0);
        assert_eq!(grid.palette[1], u32::from_le_bytes([10, 20, 30, 255]));
    }

    #[test]
    fn test_isolated_voxel_mesh_counts() {
        let (_, mesh) = load_vox(&vox_file(&[(0, 0, 0, 1)], [1, 1, 1])).unwrap();
        // 6 faces, 4 vertices and 6 indices each.
        assert_eq!(mesh.positions.len(), 24);
        assert_eq!(mesh.indices.len(), 36);
        assert_eq!(mesh.colors.len(), 24);
    }

    #[test]
    fn test_adjacent_voxels_cull_internal_face() {
        let (_, mesh) = load_vox(&vox_file(&[(0, 0, 0, 1), (1, 0, 0, 1)], [2, 1, 1])).unwrap();
        // 10 exposed faces of the two-voxel bar.
        assert_eq!(mesh.indices.len() / 6, 10);
    }

    #[test]
    fn test_visibility_mask() {
        let grid = parse_vox(&vox_file(&[(0, 0, 0, 1), (1, 0, 0, 1)], [2, 1, 1])).unwrap();
        // The left voxel's +X neighbor is solid, every other face exposed.
        assert_eq!(grid.visible_faces(0, 0, 0), 0b11_1101);
    }

    #[test]
    fn test_positions_scaled() {
        let (_, mesh) = load_vox(&vox_file(&[(0, 0, 0, 1)], [1, 1, 1])).unwrap();
        let max = mesh
            .positions
            .iter()
            .fold(0.0f32, |m, p| m.max(p.x).max(p.y).max(p.z));
        assert_eq!(max, VOXEL_SCALE);
    }
}
