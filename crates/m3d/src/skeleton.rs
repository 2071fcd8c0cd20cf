//! Skeleton engine: bone hierarchy, skin weights, bind matrices and
//! animated poses.
//!
//! Bind matrices are computed in two passes: compose every bone's world
//! matrix top-down (parents decode strictly before children), then invert
//! every matrix in place so the stored matrix is the world-to-bone
//! bind matrix ready for skinning. The pass order is mandatory.

use glam::{Mat3, Mat4, Quat, Vec3, Vec4};
use m3d_decode::buf;
use m3d_decode::error::DecodeError;
use m3d_decode::index::{self, PackedIndex, read_index, write_index};

use crate::error::{Error, Result};
use crate::model::{Action, Bone, Frame, FrameTransform, Model, Skin, VertexKind};
use crate::read::Ctx;
use crate::write::Enc;

/// Components below this magnitude are snapped to exactly zero when
/// composing rotation matrices, to keep denormal noise out of inverses.
const MATRIX_EPSILON: f32 = 1e-7;

// --- decode ---------------------------------------------------------------

pub(crate) fn decode_bones(model: &mut Model, ctx: &Ctx<'_>, payload: &[u8]) -> Result<()> {
    let bone_w = ctx.need(ctx.widths.bone, "bone")?;
    let vertex_w = ctx.need(ctx.widths.vertex, "vertex")?;
    let mut offset = 0;

    let bone_count = index::read_count(payload, &mut offset, bone_w)?;
    let skin_count = match ctx.widths.skin {
        Some(width) => index::read_count(payload, &mut offset, width)?,
        None => 0,
    };

    let base = model.bones.len() as u32;
    for i in 0..bone_count {
        let parent = match read_index(payload, &mut offset, bone_w)? {
            PackedIndex::Value(p) => {
                if p >= base + i {
                    return Err(Error::BadParent { bone: base + i });
                }
                Some(p)
            }
            PackedIndex::Undefined | PackedIndex::Reserved => None,
        };
        let name = ctx.read_str(payload, &mut offset)?;
        let position = read_index(payload, &mut offset, vertex_w)?
            .value()
            .ok_or(DecodeError::InvalidFormat {
                context: "bone",
                detail: "undefined bind position".into(),
            })?;
        let orientation = read_index(payload, &mut offset, vertex_w)?
            .value()
            .ok_or(DecodeError::InvalidFormat {
                context: "bone",
                detail: "undefined bind orientation".into(),
            })?;
        model.bones.push(Bone::new(parent, name, position, orientation));
    }

    for _ in 0..skin_count {
        let mut skin = Skin::default();
        if ctx.widths.bones_per_skin == 1 {
            if let Some(bone) = read_index(payload, &mut offset, bone_w)?.value() {
                skin.entries.push((bone, 1.0));
            }
        } else {
            for _ in 0..ctx.widths.bones_per_skin {
                let weight = buf::read_u8(payload, &mut offset, "skin weight")?;
                if weight == 0 {
                    continue;
                }
                if let Some(bone) = read_index(payload, &mut offset, bone_w)?.value() {
                    skin.entries.push((bone, f32::from(weight) / 255.0));
                }
            }
        }
        normalize_weights(&mut skin.entries);
        model.skins.push(skin);
    }
    Ok(())
}

/// Renormalize weights whose sum drifted from 1.0. An all-zero row stays
/// unassigned rather than being forced uniform.
fn normalize_weights(entries: &mut [(u32, f32)]) {
    let sum: f32 = entries.iter().map(|(_, w)| w).sum();
    if sum > 0.0 && (sum - 1.0).abs() > f32::EPSILON {
        for (_, w) in entries.iter_mut() {
            *w /= sum;
        }
    }
}

pub(crate) fn decode_action(model: &mut Model, ctx: &Ctx<'_>, payload: &[u8]) -> Result<()> {
    let frame_w = ctx.need(ctx.widths.frame, "frame")?;
    let bone_w = ctx.need(ctx.widths.bone, "bone")?;
    let vertex_w = ctx.need(ctx.widths.vertex, "vertex")?;
    let mut offset = 0;

    let name = ctx.read_str(payload, &mut offset)?;
    let frame_count = index::read_count(payload, &mut offset, frame_w)?;
    let duration_ms = buf::read_u32(payload, &mut offset, "action")?;

    let mut action = Action {
        name,
        duration_ms,
        frames: Vec::with_capacity(frame_count as usize),
    };
    for _ in 0..frame_count {
        let timestamp_ms = buf::read_u32(payload, &mut offset, "frame")?;
        let transform_count = index::read_count(payload, &mut offset, frame_w)?;
        let mut transforms = Vec::with_capacity(transform_count as usize);
        for _ in 0..transform_count {
            let bone = read_index(payload, &mut offset, bone_w)?
                .value()
                .ok_or(DecodeError::InvalidFormat {
                    context: "frame",
                    detail: "undefined bone reference".into(),
                })?;
            let position = read_index(payload, &mut offset, vertex_w)?
                .value()
                .ok_or(DecodeError::InvalidFormat {
                    context: "frame",
                    detail: "undefined position reference".into(),
                })?;
            let orientation = read_index(payload, &mut offset, vertex_w)?
                .value()
                .ok_or(DecodeError::InvalidFormat {
                    context: "frame",
                    detail: "undefined orientation reference".into(),
                })?;
            transforms.push(FrameTransform { bone, position, orientation });
        }
        action.frames.push(Frame { timestamp_ms, transforms });
    }
    model.actions.push(action);
    Ok(())
}

// --- encode ---------------------------------------------------------------

pub(crate) fn encode_bones(enc: &Enc, bones: &[Bone], skins: &[Skin]) -> Result<Vec<u8>> {
    let bone_w = enc.need(enc.widths.bone, "bone")?;
    let vertex_w = enc.need(enc.widths.vertex, "vertex")?;
    let mut out = Vec::new();

    index::write_count(&mut out, bone_w, bones.len() as u32);
    if let Some(skin_w) = enc.widths.skin {
        index::write_count(&mut out, skin_w, skins.len() as u32);
    }

    for bone in bones {
        write_index(&mut out, bone_w, PackedIndex::from_option(bone.parent))?;
        enc.write_str(&mut out, &bone.name)?;
        write_index(&mut out, vertex_w, PackedIndex::Value(bone.position))?;
        write_index(&mut out, vertex_w, PackedIndex::Value(bone.orientation))?;
    }

    for skin in skins {
        if enc.widths.bones_per_skin == 1 {
            let bone = skin.entries.first().map(|&(b, _)| b);
            write_index(&mut out, bone_w, PackedIndex::from_option(bone))?;
        } else {
            for slot in 0..enc.widths.bones_per_skin as usize {
                match skin.entries.get(slot) {
                    Some(&(bone, weight)) => {
                        let quantized = (weight * 255.0).round().clamp(1.0, 255.0) as u8;
                        out.push(quantized);
                        write_index(&mut out, bone_w, PackedIndex::Value(bone))?;
                    }
                    None => out.push(0),
                }
            }
        }
    }
    Ok(out)
}

pub(crate) fn encode_action(enc: &Enc, action: &Action) -> Result<Vec<u8>> {
    let frame_w = enc.need(enc.widths.frame, "frame")?;
    let bone_w = enc.need(enc.widths.bone, "bone")?;
    let vertex_w = enc.need(enc.widths.vertex, "vertex")?;
    let mut out = Vec::new();

    enc.write_str(&mut out, &action.name)?;
    index::write_count(&mut out, frame_w, action.frames.len() as u32);
    out.extend_from_slice(&action.duration_ms.to_le_bytes());
    for frame in &action.frames {
        out.extend_from_slice(&frame.timestamp_ms.to_le_bytes());
        index::write_count(&mut out, frame_w, frame.transforms.len() as u32);
        for transform in &frame.transforms {
            write_index(&mut out, bone_w, PackedIndex::Value(transform.bone))?;
            write_index(&mut out, vertex_w, PackedIndex::Value(transform.position))?;
            write_index(&mut out, vertex_w, PackedIndex::Value(transform.orientation))?;
        }
    }
    Ok(out)
}

// --- derived data ---------------------------------------------------------

/// Rebuild each bone's derived weight list from the vertex skin bindings.
pub(crate) fn build_bone_weights(model: &mut Model) {
    for bone in &mut model.bones {
        bone.weights.clear();
    }
    for (vertex_index, vertex) in model.vertices.iter().enumerate() {
        let VertexKind::Mesh { skin: Some(skin) } = vertex.kind else {
            continue;
        };
        let Some(skin) = model.skins.get(skin as usize) else {
            continue;
        };
        for &(bone, weight) in &skin.entries {
            if let Some(bone) = model.bones.get_mut(bone as usize) {
                bone.weights.push((vertex_index as u32, weight));
            }
        }
    }
}

/// Compose a local transform from a bind position and orientation, with
/// near-zero rotation entries snapped to exactly zero.
fn compose(position: Vec3, orientation: Quat) -> Mat4 {
    let rotation = Mat3::from_quat(orientation.normalize());
    let snap = |v: Vec3| {
        Vec3::new(
            if v.x.abs() < MATRIX_EPSILON { 0.0 } else { v.x },
            if v.y.abs() < MATRIX_EPSILON { 0.0 } else { v.y },
            if v.z.abs() < MATRIX_EPSILON { 0.0 } else { v.z },
        )
    };
    Mat4::from_cols(
        snap(rotation.x_axis).extend(0.0),
        snap(rotation.y_axis).extend(0.0),
        snap(rotation.z_axis).extend(0.0),
        position.extend(1.0),
    )
}

/// Compose world matrices top-down for an arbitrary per-bone (position,
/// orientation) assignment, then invert every matrix in place.
fn world_then_invert(bones: &[Bone], states: &[(Vec3, Quat)]) -> Vec<Mat4> {
    let mut world = Vec::with_capacity(bones.len());
    for (index, bone) in bones.iter().enumerate() {
        let (position, orientation) = states[index];
        let local = compose(position, orientation);
        let matrix = match bone.parent {
            Some(parent) => world[parent as usize] * local,
            None => local,
        };
        world.push(matrix);
    }
    for matrix in &mut world {
        *matrix = matrix.inverse();
    }
    world
}

/// Compute and store the inverse bind matrices on every bone.
pub(crate) fn compute_bind_matrices(model: &mut Model) {
    let states = bind_states(model);
    let matrices = world_then_invert(&model.bones, &states);
    for (bone, matrix) in model.bones.iter_mut().zip(matrices) {
        bone.matrix = matrix;
    }
}

fn bind_states(model: &Model) -> Vec<(Vec3, Quat)> {
    model
        .bones
        .iter()
        .map(|bone| {
            let position = model
                .vertices
                .get(bone.position as usize)
                .map_or(Vec3::ZERO, |v| v.position);
            let orientation = model
                .vertices
                .get(bone.orientation as usize)
                .map_or(Quat::IDENTITY, super::model::Vertex::as_quat);
            (position, orientation)
        })
        .collect()
}

// --- animated poses -------------------------------------------------------

/// One posed bone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseBone {
    /// Index into [`Model::bones`].
    pub bone: u32,
    /// Posed position in model space, relative to the parent bone.
    pub position: Vec3,
    /// Posed orientation, relative to the parent bone.
    pub orientation: Quat,
    /// Inverted posed world matrix, same convention as the bind matrix.
    pub matrix: Mat4,
}

/// A computed skeleton pose.
///
/// When the requested action or frame is out of range the pose degrades to
/// the bind skeleton and carries the error here; it is never only logged.
#[derive(Debug, Clone, PartialEq)]
pub struct Pose {
    pub bones: Vec<PoseBone>,
    pub error: Option<Error>,
}

impl Model {
    /// The unposed bind skeleton.
    #[must_use]
    pub fn bind_pose(&self) -> Pose {
        let states = bind_states(self);
        self.finish_pose(states, None)
    }

    /// Compute the skeleton pose of `action_index` at `msec`.
    ///
    /// Timestamps at or beyond the clip duration wrap modulo the duration.
    /// Between two keyframes, positions interpolate linearly and
    /// orientations by normalized quaternion interpolation with short-arc
    /// correction. An out-of-range action returns the bind skeleton with
    /// the error recorded on the pose.
    #[must_use]
    pub fn pose(&self, action_index: usize, msec: u32) -> Pose {
        let mut states = bind_states(self);
        let Some(action) = self.actions.get(action_index) else {
            tracing::warn!(action_index, "pose requested for unknown action");
            let mut pose = self.bind_pose();
            pose.error = Some(Error::UnknownFrame {
                action: action_index as u32,
            });
            return pose;
        };

        let t = if action.duration_ms > 0 {
            msec % action.duration_ms
        } else {
            0
        };

        let mut error = None;
        let mut previous_ts = 0;
        let mut next_frame = None;
        for frame in &action.frames {
            if frame.timestamp_ms > t {
                next_frame = Some(frame);
                break;
            }
            previous_ts = frame.timestamp_ms;
            self.apply_frame(frame, &mut states, &mut error);
        }

        // Strictly between two keyframes: blend the moved bones toward the
        // next frame's values.
        if let Some(next) = next_frame {
            if t > previous_ts {
                let weight =
                    (t - previous_ts) as f32 / (next.timestamp_ms - previous_ts) as f32;
                for transform in &next.transforms {
                    let Some(state) = states.get_mut(transform.bone as usize) else {
                        error.get_or_insert(Error::UnknownFrame {
                            action: action_index as u32,
                        });
                        continue;
                    };
                    let target_pos = self
                        .vertices
                        .get(transform.position as usize)
                        .map_or(state.0, |v| v.position);
                    let target_ori = self
                        .vertices
                        .get(transform.orientation as usize)
                        .map_or(state.1, super::model::Vertex::as_quat);
                    state.0 = state.0.lerp(target_pos, weight);
                    state.1 = nlerp(state.1, target_ori, weight);
                }
            }
        }

        self.finish_pose(states, error)
    }

    /// Apply frames `0..=frame_index` of an action cumulatively onto the
    /// bind skeleton, with no interpolation.
    ///
    /// Frame data is sparse, so reproducing the exact skeleton at frame
    /// `n` requires replaying every earlier frame of the clip.
    #[must_use]
    pub fn frame(&self, action_index: usize, frame_index: usize) -> Pose {
        let mut states = bind_states(self);
        let valid = self
            .actions
            .get(action_index)
            .is_some_and(|a| frame_index < a.frames.len());
        if !valid {
            tracing::warn!(action_index, frame_index, "unknown frame requested");
            let mut pose = self.bind_pose();
            pose.error = Some(Error::UnknownFrame {
                action: action_index as u32,
            });
            return pose;
        }

        let mut error = None;
        for frame in &self.actions[action_index].frames[..=frame_index] {
            self.apply_frame(frame, &mut states, &mut error);
        }
        self.finish_pose(states, error)
    }

    fn apply_frame(
        &self,
        frame: &Frame,
        states: &mut [(Vec3, Quat)],
        error: &mut Option<Error>,
    ) {
        for transform in &frame.transforms {
            let Some(state) = states.get_mut(transform.bone as usize) else {
                error.get_or_insert(Error::UnknownFrame { action: 0 });
                continue;
            };
            if let Some(v) = self.vertices.get(transform.position as usize) {
                state.0 = v.position;
            }
            if let Some(v) = self.vertices.get(transform.orientation as usize) {
                state.1 = v.as_quat();
            }
        }
    }

    fn finish_pose(&self, states: Vec<(Vec3, Quat)>, error: Option<Error>) -> Pose {
        let matrices = world_then_invert(&self.bones, &states);
        let bones = states
            .into_iter()
            .zip(matrices)
            .enumerate()
            .map(|(index, ((position, orientation), matrix))| PoseBone {
                bone: index as u32,
                position,
                orientation,
                matrix,
            })
            .collect();
        Pose { bones, error }
    }
}

/// Normalized linear quaternion interpolation with short-arc correction.
///
/// The dot product detects a long-arc pair and flips one operand, then the
/// componentwise lerp is renormalized. This approximates spherical
/// interpolation with a small bounded error and no trigonometry.
fn nlerp(a: Quat, b: Quat, t: f32) -> Quat {
    let mut b = Vec4::from(b);
    if a.dot(Quat::from_vec4(b)) < 0.0 {
        b = -b;
    }
    let blended = Vec4::from(a).lerp(b, t);
    Quat::from_vec4(blended).normalize()
}
