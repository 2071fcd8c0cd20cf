//! End-to-end encode/decode properties.

use glam::Vec3;
use m3d::{
    Action, Bone, CommandArg, CoordWidth, ExtraChunk, Face, Frame, FrameTransform, IndexWidth,
    InlinedAsset, Label, Material, MaterialProperty, Model, PropertyValue, SaveOptions, Shape,
    ShapeCommand, Skin, Vertex, VertexKind, VoxelBlock, VoxelType,
};

fn save_options(compress: bool, coord_quality: CoordWidth) -> SaveOptions {
    SaveOptions {
        compress,
        coord_quality,
    }
}

/// A skinned, animated, labeled two-triangle model.
fn rigged_model() -> Model {
    let mut model = Model::new();
    model.name = "quad".into();
    model.author = "roundtrip".into();

    // Two skins over two bones.
    model.skins.push(Skin {
        entries: vec![(0, 1.0)],
    });
    model.skins.push(Skin {
        entries: vec![(0, 0.5), (1, 0.5)],
    });

    // A quad in the XY plane, vertices colored and skinned.
    let corners = [
        Vec3::new(-0.5, -0.5, 0.0),
        Vec3::new(0.5, -0.5, 0.0),
        Vec3::new(0.5, 0.5, 0.0),
        Vec3::new(-0.5, 0.5, 0.0),
    ];
    for (i, corner) in corners.iter().enumerate() {
        model.vertices.push(Vertex {
            position: *corner,
            w: 1.0,
            color: 0xFF00_40C0,
            kind: VertexKind::Mesh {
                skin: Some((i % 2) as u32),
            },
        });
    }

    // Bone bind pose and keyframe targets as auxiliary vertices.
    model.vertices.push(Vertex::auxiliary(Vec3::ZERO, 1.0)); // 4: root pos
    model.vertices.push(Vertex::auxiliary(Vec3::ZERO, 1.0)); // 5: identity quat
    model.vertices.push(Vertex::auxiliary(Vec3::new(0.0, 0.25, 0.0), 1.0)); // 6: child pos
    model.vertices.push(Vertex::auxiliary(Vec3::new(0.0, 1.0, 0.0), 0.0)); // 7: keyframe quat
    model.bones.push(Bone::new(None, "root".into(), 4, 5));
    model.bones.push(Bone::new(Some(0), "tip".into(), 6, 5));

    model.materials.push(Material {
        name: "paint".into(),
        properties: vec![
            MaterialProperty {
                type_id: 0,
                value: PropertyValue::Color(0xFF11_2233),
            },
            MaterialProperty {
                type_id: 3,
                value: PropertyValue::Float(32.0),
            },
            MaterialProperty {
                type_id: 8,
                value: PropertyValue::Uint(2),
            },
        ],
    });

    model.uvs.push(m3d::UvCoord { u: 0.0, v: 0.0 });
    model.uvs.push(m3d::UvCoord { u: 1.0, v: 0.0 });
    model.uvs.push(m3d::UvCoord { u: 1.0, v: 1.0 });
    model.uvs.push(m3d::UvCoord { u: 0.0, v: 1.0 });

    model.faces.push(Face {
        material: Some(0),
        vertices: [0, 1, 2],
        uvs: [Some(0), Some(1), Some(2)],
        ..Face::default()
    });
    model.faces.push(Face {
        material: Some(0),
        vertices: [0, 2, 3],
        uvs: [Some(0), Some(2), Some(3)],
        ..Face::default()
    });

    model.actions.push(Action {
        name: "bend".into(),
        duration_ms: 1000,
        frames: vec![
            Frame {
                timestamp_ms: 0,
                transforms: vec![],
            },
            Frame {
                timestamp_ms: 600,
                transforms: vec![FrameTransform {
                    bone: 1,
                    position: 6,
                    orientation: 7,
                }],
            },
        ],
    });

    model.labels.push(Label {
        name: "hints".into(),
        lang: "en".into(),
        color: 0xFFFF_FFFF,
        vertex: 0,
        text: "lower-left".into(),
    });

    model.shapes.push(Shape {
        name: "outline".into(),
        commands: vec![
            ShapeCommand {
                opcode: 0,
                args: vec![CommandArg::Material("paint".into())],
                groups: vec![],
            },
            ShapeCommand {
                opcode: 16,
                args: vec![],
                groups: vec![
                    vec![CommandArg::Vertex(0)],
                    vec![CommandArg::Vertex(1)],
                    vec![CommandArg::Vertex(2)],
                ],
            },
        ],
    });

    model.assets.push(InlinedAsset {
        name: "notes".into(),
        data: b"opaque bytes".to_vec(),
    });
    model.extras.push(ExtraChunk {
        magic: *b"ZZZZ",
        payload: vec![1, 2, 3, 4, 5],
    });

    model
}

/// Positions of a face's corners resolved through the vertex array.
fn face_corners(model: &Model, face: &Face) -> [Vec3; 3] {
    face.vertices
        .map(|v| model.vertices[v as usize].position)
}

fn assert_geometry_matches(original: &Model, decoded: &Model, tolerance: f32) {
    assert_eq!(decoded.faces.len(), original.faces.len());

    // Face order may change (faces regroup by material on save), so match
    // triangles as sets of resolved corner positions.
    let mut expected: Vec<[[i32; 3]; 3]> = original
        .faces
        .iter()
        .map(|f| quantized_corners(original, f, tolerance))
        .collect();
    let mut actual: Vec<[[i32; 3]; 3]> = decoded
        .faces
        .iter()
        .map(|f| quantized_corners(decoded, f, tolerance))
        .collect();
    expected.sort_unstable();
    actual.sort_unstable();
    assert_eq!(expected, actual);
}

fn quantized_corners(model: &Model, face: &Face, tolerance: f32) -> [[i32; 3]; 3] {
    // Quantize to a grid coarser than the tolerance so equal-within-error
    // positions compare equal.
    let step = (tolerance * 2.0).max(1e-6);
    face_corners(model, face).map(|corner| {
        [
            (corner.x / step).round() as i32,
            (corner.y / step).round() as i32,
            (corner.z / step).round() as i32,
        ]
    })
}

#[test]
fn round_trip_float_coordinates_is_exact() {
    let model = rigged_model();
    let saved = model.to_vec(&save_options(false, CoordWidth::F32)).unwrap();
    let decoded = Model::from_slice(&saved.bytes).unwrap();

    assert_eq!(decoded.error, None);
    assert_eq!(decoded.name, "quad");
    assert_eq!(decoded.author, "roundtrip");
    assert_geometry_matches(&model, &decoded, 1e-6);

    // Materials survive with their typed properties.
    assert_eq!(decoded.materials.len(), 1);
    let material = &decoded.materials[0];
    assert_eq!(material.name, "paint");
    assert_eq!(material.properties[0].value, PropertyValue::Color(0xFF11_2233));
    assert_eq!(material.properties[1].value, PropertyValue::Float(32.0));
    assert_eq!(material.properties[2].value, PropertyValue::Uint(2));
    assert!(decoded.faces.iter().all(|f| f.material == Some(0)));

    // Bone hierarchy and names survive.
    assert_eq!(decoded.bones.len(), 2);
    assert_eq!(decoded.bones[0].parent, None);
    assert_eq!(decoded.bones[1].parent, Some(0));
    assert_eq!(decoded.bones[0].name, "root");
    assert_eq!(decoded.bones[1].name, "tip");
    let tip_pos = decoded.vertices[decoded.bones[1].position as usize].position;
    assert!(tip_pos.abs_diff_eq(Vec3::new(0.0, 0.25, 0.0), 1e-6));

    // Skins survive with normalized weights.
    assert_eq!(decoded.skins.len(), 2);
    for skin in &decoded.skins {
        let sum: f32 = skin.entries.iter().map(|(_, w)| w).sum();
        assert!((sum - 1.0).abs() < 1e-3);
    }

    // Action frames and their sparse transforms survive.
    assert_eq!(decoded.actions.len(), 1);
    let action = &decoded.actions[0];
    assert_eq!(action.name, "bend");
    assert_eq!(action.duration_ms, 1000);
    assert_eq!(action.frames.len(), 2);
    assert_eq!(action.frames[1].timestamp_ms, 600);
    assert_eq!(action.frames[1].transforms.len(), 1);
    let transform = action.frames[1].transforms[0];
    assert_eq!(transform.bone, 1);
    let key_pos = decoded.vertices[transform.position as usize].position;
    assert!(key_pos.abs_diff_eq(Vec3::new(0.0, 0.25, 0.0), 1e-6));

    // Labels, assets and unknown chunks survive.
    assert_eq!(decoded.labels.len(), 1);
    assert_eq!(decoded.labels[0].text, "lower-left");
    assert_eq!(decoded.labels[0].lang, "en");
    assert_eq!(decoded.assets, model.assets);
    assert_eq!(decoded.extras, model.extras);

    // Shape commands survive; their vertex arguments are remapped by the
    // dedup pass, so compare the positions they resolve to.
    assert_eq!(decoded.shapes.len(), 1);
    let shape = &decoded.shapes[0];
    assert_eq!(shape.name, "outline");
    assert_eq!(shape.commands[0].args, vec![CommandArg::Material("paint".into())]);
    assert_eq!(shape.commands[1].opcode, 16);
    let resolved: Vec<Vec3> = shape.commands[1]
        .groups
        .iter()
        .map(|group| match group[0] {
            CommandArg::Vertex(v) => decoded.vertices[v as usize].position,
            ref other => panic!("expected a vertex argument, got {other:?}"),
        })
        .collect();
    assert_eq!(
        resolved,
        vec![
            Vec3::new(-0.5, -0.5, 0.0),
            Vec3::new(0.5, -0.5, 0.0),
            Vec3::new(0.5, 0.5, 0.0),
        ]
    );
}

#[test]
fn round_trip_compressed_equals_uncompressed() {
    let model = rigged_model();
    let plain = model.to_vec(&save_options(false, CoordWidth::F32)).unwrap();
    let packed = model.to_vec(&save_options(true, CoordWidth::F32)).unwrap();

    let from_plain = Model::from_slice(&plain.bytes).unwrap();
    let from_packed = Model::from_slice(&packed.bytes).unwrap();
    assert_eq!(from_plain.vertices, from_packed.vertices);
    assert_eq!(from_plain.faces, from_packed.faces);
    assert_eq!(from_plain.actions, from_packed.actions);
}

#[test]
fn round_trip_quantized_coordinates_within_error() {
    let model = rigged_model();
    for (quality, tolerance) in [
        (CoordWidth::I8, 1.0 / 127.0),
        (CoordWidth::I16, 1.0 / 32767.0),
        (CoordWidth::F64, 1e-6),
    ] {
        let saved = model.to_vec(&save_options(false, quality)).unwrap();
        let decoded = Model::from_slice(&saved.bytes).unwrap();
        assert_geometry_matches(&model, &decoded, tolerance);
    }
}

#[test]
fn index_width_selection_is_monotone_minimal() {
    // 253 distinct vertices still fit 1-byte indices.
    let mut model = Model::new();
    for i in 0..253 {
        model.vertices.push(Vertex::at(Vec3::new(i as f32, 0.0, 0.0)));
    }
    let widths = model
        .to_vec(&save_options(false, CoordWidth::F32))
        .unwrap()
        .widths;
    assert_eq!(widths.vertex, Some(IndexWidth::U8));

    // 254 collide with the reserved sentinel and force 2-byte indices.
    model.vertices.push(Vertex::at(Vec3::new(300.0, 0.0, 0.0)));
    let widths = model
        .to_vec(&save_options(false, CoordWidth::F32))
        .unwrap()
        .widths;
    assert_eq!(widths.vertex, Some(IndexWidth::U16));
}

#[test]
fn truncated_buffers_never_panic_and_stop_in_bounds() {
    let model = rigged_model();
    let saved = model.to_vec(&save_options(false, CoordWidth::F32)).unwrap();

    for len in 0..saved.bytes.len() {
        // Every truncation either fails cleanly or yields a model tagged
        // with an error; no read ever runs past the buffer.
        match Model::from_slice(&saved.bytes[..len]) {
            Ok(model) => assert!(model.error.is_some()),
            Err(_) => {}
        }
    }
}

#[test]
fn corrupted_chunk_length_preserves_prefix() {
    let model = rigged_model();
    let mut bytes = model.to_vec(&save_options(false, CoordWidth::F32)).unwrap().bytes;

    // Find the MESH chunk and declare an impossible length for it.
    let pos = bytes
        .windows(4)
        .position(|w| w == b"MESH")
        .expect("mesh chunk present");
    bytes[pos + 4..pos + 8].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());

    let decoded = Model::from_slice(&bytes).unwrap();
    // Chunks before the corruption were kept, the error is fatal.
    assert!(!decoded.vertices.is_empty());
    assert!(decoded.error.as_ref().is_some_and(m3d::Error::is_fatal));
    assert!(decoded.faces.is_empty());
}

#[test]
fn missing_end_chunk_is_reported() {
    let model = rigged_model();
    let mut bytes = model.to_vec(&save_options(false, CoordWidth::F32)).unwrap().bytes;

    // Drop the terminal chunk and fix up the declared total length.
    bytes.truncate(bytes.len() - 8);
    let total = bytes.len() as u32;
    bytes[4..8].copy_from_slice(&total.to_le_bytes());

    let decoded = Model::from_slice(&bytes).unwrap();
    assert_eq!(decoded.error, Some(m3d::Error::MissingEndChunk));
    // Everything before the missing terminator is still there.
    assert!(!decoded.vertices.is_empty());
}

#[test]
fn voxel_blocks_round_trip_and_mesh_on_load() {
    let mut model = Model::new();
    model.voxel_types.push(VoxelType {
        name: "brick".into(),
        color: 0xFFAA_5533,
        ..VoxelType::default()
    });
    model.voxel_types.push(VoxelType {
        name: "glass".into(),
        color: 0x80FF_FFFF,
        items: vec![("pane".into(), 3)],
        ..VoxelType::default()
    });

    // Cells exercising every run shape: a single, a 128 run and a 129 run.
    let mut cells = vec![Some(1)];
    cells.extend(std::iter::repeat_n(Some(0), 128));
    cells.extend(std::iter::repeat_n(None, 129));
    cells.resize(6 * 6 * 8, Some(0));
    let block = VoxelBlock {
        name: "wall".into(),
        position: [-2, 0, 3],
        size: [6, 6, 8],
        uncertainty: 7,
        group: 1,
        cells,
    };
    model.voxel_blocks.push(block.clone());

    let saved = model.to_vec(&save_options(true, CoordWidth::F32)).unwrap();
    assert_eq!(saved.widths.voxel_dim, Some(IndexWidth::U8));
    assert_eq!(saved.widths.voxel_pixel, Some(IndexWidth::U8));

    let decoded = Model::from_slice(&saved.bytes).unwrap();
    assert_eq!(decoded.error, None);
    assert_eq!(decoded.voxel_types.len(), 2);
    assert_eq!(decoded.voxel_types[1].items, vec![("pane".into(), 3)]);

    // Exact per-cell palette indices survive the RLE round trip.
    assert_eq!(decoded.voxel_blocks.len(), 1);
    let back = &decoded.voxel_blocks[0];
    assert_eq!(back.name, "wall");
    assert_eq!(back.position, block.position);
    assert_eq!(back.size, block.size);
    assert_eq!(back.uncertainty, 7);
    assert_eq!(back.cells, block.cells);

    // Loading also meshed the grid: faces appeared with flat normals.
    assert!(!decoded.faces.is_empty());
    assert!(decoded.faces.iter().all(|f| f.normals[0].is_some()));
}

#[test]
fn normals_are_generated_once_on_load() {
    let mut model = Model::new();
    for position in [
        Vec3::ZERO,
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(0.0, 1.0, 0.0),
    ] {
        model.vertices.push(Vertex::at(position));
    }
    model.faces.push(Face {
        vertices: [0, 1, 2],
        ..Face::default()
    });

    let saved = model.to_vec(&save_options(false, CoordWidth::F32)).unwrap();
    let decoded = Model::from_slice(&saved.bytes).unwrap();

    // Three mesh vertices plus three synthetic normal vertices.
    assert_eq!(decoded.vertices.len(), 6);
    let normal_index = decoded.faces[0].normals[0].unwrap() as usize;
    assert!(decoded.vertices[normal_index]
        .position
        .abs_diff_eq(Vec3::Z, 1e-6));
    assert_eq!(decoded.vertices[normal_index].kind, VertexKind::Auxiliary);

    // Saving the decoded model keeps the explicit normals, and the three
    // identical normal vertices collapse into one; a second load does not
    // regenerate anything.
    let saved_again = decoded.to_vec(&save_options(false, CoordWidth::F32)).unwrap();
    let decoded_again = Model::from_slice(&saved_again.bytes).unwrap();
    assert_eq!(decoded_again.vertices.len(), 4);
    assert!(decoded_again.faces[0].normals.iter().all(Option::is_some));
}

#[test]
fn bind_matrices_are_computed_on_load() {
    let model = rigged_model();
    let saved = model.to_vec(&save_options(false, CoordWidth::F32)).unwrap();
    let decoded = Model::from_slice(&saved.bytes).unwrap();

    // The root bone sits at the origin with identity orientation, so its
    // inverse bind matrix is the identity.
    assert!(decoded.bones[0].matrix.abs_diff_eq(glam::Mat4::IDENTITY, 1e-5));
    // The child bone is translated, its inverse carries the negation.
    let inverse = decoded.bones[1].matrix;
    assert!(inverse
        .transform_point3(Vec3::new(0.0, 0.25, 0.0))
        .abs_diff_eq(Vec3::ZERO, 1e-5));

    // Derived weight lists were rebuilt from the vertex skin bindings.
    assert!(!decoded.bones[0].weights.is_empty());
}

#[test]
fn unresolved_texture_degrades_but_decodes() {
    let mut model = rigged_model();
    model.textures.push(m3d::Texture {
        name: "missing".into(),
        ..m3d::Texture::default()
    });
    model.materials[0].properties.push(MaterialProperty {
        type_id: 128,
        value: PropertyValue::Map(0),
    });

    let saved = model.to_vec(&save_options(false, CoordWidth::F32)).unwrap();
    let decoded = Model::from_slice(&saved.bytes).unwrap();

    // The texture slot exists but stayed empty, and the degraded error is
    // on the model rather than aborting the decode.
    assert_eq!(
        decoded.error,
        Some(m3d::Error::MissingTexture {
            name: "missing".into()
        })
    );
    assert_eq!(decoded.textures.len(), 1);
    assert!(decoded.textures[0].pixels.is_empty());
    assert_eq!(decoded.materials.len(), 1);
    assert!(!decoded.faces.is_empty());
}

#[test]
fn inlined_png_texture_resolves() {
    use std::io::Cursor;

    let mut png = Vec::new();
    image::RgbaImage::from_pixel(2, 2, image::Rgba([255, 0, 0, 255]))
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();

    let mut model = rigged_model();
    model.assets.push(InlinedAsset {
        name: "swatch".into(),
        data: png,
    });
    model.textures.push(m3d::Texture {
        name: "swatch".into(),
        ..m3d::Texture::default()
    });
    model.materials[0].properties.push(MaterialProperty {
        type_id: 128,
        value: PropertyValue::Map(0),
    });

    let saved = model.to_vec(&save_options(false, CoordWidth::F32)).unwrap();
    let decoded = Model::from_slice(&saved.bytes).unwrap();

    assert_eq!(decoded.error, None);
    let texture = decoded
        .textures
        .iter()
        .find(|t| t.name == "swatch")
        .unwrap();
    assert_eq!((texture.width, texture.height), (2, 2));
    assert!(!texture.pixels.is_empty());
}

#[test]
fn procedural_reference_without_interpreter_degrades() {
    let mut model = Model::new();
    model.procedurals.push("surface".into());

    let saved = model.to_vec(&save_options(false, CoordWidth::F32)).unwrap();
    let decoded = Model::from_slice(&saved.bytes).unwrap();
    assert_eq!(decoded.procedurals, vec!["surface".to_owned()]);
    assert_eq!(
        decoded.error,
        Some(m3d::Error::MissingAsset {
            name: "surface".into()
        })
    );
}

#[test]
fn preview_chunk_round_trips_uncompressed_and_compressed() {
    let mut model = rigged_model();
    model.preview = vec![9, 9, 9, 9];
    for compress in [false, true] {
        let saved = model.to_vec(&save_options(compress, CoordWidth::F32)).unwrap();
        let decoded = Model::from_slice(&saved.bytes).unwrap();
        assert_eq!(decoded.preview, vec![9, 9, 9, 9]);
    }
}

#[test]
fn string_canonicalization_applies_on_save() {
    let mut model = rigged_model();
    model.bones[0].name = "left arm/upper ".into();
    let saved = model.to_vec(&save_options(false, CoordWidth::F32)).unwrap();
    let decoded = Model::from_slice(&saved.bytes).unwrap();
    assert_eq!(decoded.bones[0].name, "left_arm_upper");
}
