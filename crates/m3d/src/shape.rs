//! Byte-level codec for procedural shape command lists.
//!
//! Commands are typed records drawn from a static descriptor table; some
//! commands end with a repeated argument group whose repetition count is
//! part of the encoding. The commands are decoded and re-encoded
//! faithfully but never evaluated here.

use m3d_decode::buf;
use m3d_decode::error::DecodeError;
use m3d_decode::index::{PackedIndex, read_index, write_index};

use crate::error::{Error, Result};
use crate::model::{CommandArg, Model, Shape, ShapeCommand};
use crate::read::Ctx;
use crate::write::Enc;

/// Wire type of one command argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArgType {
    Vertex,
    Uv,
    Face,
    Shape,
    Material,
    Coord,
    Uint,
}

/// One command descriptor: opcode, mnemonic, fixed arguments and the
/// optional repeated argument group.
pub(crate) struct CommandDescriptor {
    pub opcode: u8,
    pub mnemonic: &'static str,
    pub args: &'static [ArgType],
    pub group: &'static [ArgType],
}

/// The static command table.
pub(crate) const COMMANDS: &[CommandDescriptor] = &[
    CommandDescriptor { opcode: 0, mnemonic: "use", args: &[ArgType::Material], group: &[] },
    CommandDescriptor {
        opcode: 1,
        mnemonic: "inc",
        args: &[ArgType::Shape, ArgType::Vertex, ArgType::Vertex, ArgType::Coord],
        group: &[],
    },
    CommandDescriptor {
        opcode: 2,
        mnemonic: "mesh",
        args: &[ArgType::Face, ArgType::Uint],
        group: &[],
    },
    CommandDescriptor { opcode: 3, mnemonic: "div", args: &[ArgType::Coord], group: &[] },
    CommandDescriptor { opcode: 4, mnemonic: "sub", args: &[ArgType::Uint, ArgType::Uint], group: &[] },
    CommandDescriptor { opcode: 5, mnemonic: "len", args: &[ArgType::Coord], group: &[] },
    CommandDescriptor {
        opcode: 6,
        mnemonic: "dist",
        args: &[ArgType::Coord, ArgType::Coord],
        group: &[],
    },
    CommandDescriptor { opcode: 16, mnemonic: "line", args: &[], group: &[ArgType::Vertex] },
    CommandDescriptor {
        opcode: 17,
        mnemonic: "cubic",
        args: &[ArgType::Vertex],
        group: &[ArgType::Vertex, ArgType::Vertex, ArgType::Vertex],
    },
    CommandDescriptor {
        opcode: 18,
        mnemonic: "surf",
        args: &[],
        group: &[ArgType::Vertex, ArgType::Uv],
    },
];

pub(crate) fn descriptor(opcode: u8) -> Option<&'static CommandDescriptor> {
    COMMANDS.iter().find(|d| d.opcode == opcode)
}

// --- decode ---------------------------------------------------------------

fn decode_arg(
    ctx: &Ctx<'_>,
    payload: &[u8],
    offset: &mut usize,
    arg_type: ArgType,
) -> Result<CommandArg> {
    let index = |width, what| -> Result<u32> {
        let width = ctx.need(width, what)?;
        read_index(payload, offset, width)?
            .value()
            .ok_or_else(|| {
                DecodeError::InvalidFormat {
                    context: "shape command",
                    detail: format!("undefined {what} argument"),
                }
                .into()
            })
    };
    Ok(match arg_type {
        ArgType::Vertex => CommandArg::Vertex(index(ctx.widths.vertex, "vertex")?),
        ArgType::Uv => CommandArg::Uv(index(ctx.widths.uv, "uv")?),
        ArgType::Face => CommandArg::Face(index(ctx.widths.face, "face")?),
        ArgType::Shape => CommandArg::Shape(index(ctx.widths.shape, "shape")?),
        ArgType::Material => CommandArg::Material(ctx.read_str(payload, offset)?),
        ArgType::Coord => CommandArg::Coord(buf::read_f32(payload, offset, "shape command")?),
        ArgType::Uint => CommandArg::Uint(buf::read_u32(payload, offset, "shape command")?),
    })
}

pub(crate) fn decode_shape(model: &mut Model, ctx: &Ctx<'_>, payload: &[u8]) -> Result<()> {
    let mut offset = 0;
    let name = ctx.read_str(payload, &mut offset)?;
    let mut shape = Shape {
        name,
        commands: Vec::new(),
    };

    while offset < payload.len() {
        let opcode = buf::read_u8(payload, &mut offset, "shape command")?;
        let Some(descriptor) = descriptor(opcode) else {
            // An unknown opcode has an unknowable argument size; nothing
            // after it can be decoded.
            return Err(Error::UnknownCommand { opcode });
        };

        let mut command = ShapeCommand {
            opcode,
            args: Vec::with_capacity(descriptor.args.len()),
            groups: Vec::new(),
        };
        for &arg_type in descriptor.args {
            command.args.push(decode_arg(ctx, payload, &mut offset, arg_type)?);
        }
        if !descriptor.group.is_empty() {
            let repeat = buf::read_u32(payload, &mut offset, "shape command")?;
            for _ in 0..repeat {
                let mut group = Vec::with_capacity(descriptor.group.len());
                for &arg_type in descriptor.group {
                    group.push(decode_arg(ctx, payload, &mut offset, arg_type)?);
                }
                command.groups.push(group);
            }
        }
        shape.commands.push(command);
    }
    model.shapes.push(shape);
    Ok(())
}

// --- encode ---------------------------------------------------------------

fn encode_arg(enc: &Enc, out: &mut Vec<u8>, arg: &CommandArg) -> Result<()> {
    match arg {
        CommandArg::Vertex(v) => {
            write_index(out, enc.need(enc.widths.vertex, "vertex")?, PackedIndex::Value(*v))?;
        }
        CommandArg::Uv(v) => {
            write_index(out, enc.need(enc.widths.uv, "uv")?, PackedIndex::Value(*v))?;
        }
        CommandArg::Face(v) => {
            write_index(out, enc.need(enc.widths.face, "face")?, PackedIndex::Value(*v))?;
        }
        CommandArg::Shape(v) => {
            write_index(out, enc.need(enc.widths.shape, "shape")?, PackedIndex::Value(*v))?;
        }
        CommandArg::Material(name) => enc.write_str(out, name)?,
        CommandArg::Coord(v) => out.extend_from_slice(&v.to_le_bytes()),
        CommandArg::Uint(v) => out.extend_from_slice(&v.to_le_bytes()),
    }
    Ok(())
}

pub(crate) fn encode_shape(enc: &Enc, shape: &Shape) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    enc.write_str(&mut out, &shape.name)?;
    for command in &shape.commands {
        out.push(command.opcode);
        for arg in &command.args {
            encode_arg(enc, &mut out, arg)?;
        }
        if descriptor(command.opcode).is_some_and(|d| !d.group.is_empty()) {
            out.extend_from_slice(&(command.groups.len() as u32).to_le_bytes());
            for group in &command.groups {
                for arg in group {
                    encode_arg(enc, &mut out, arg)?;
                }
            }
        }
    }
    Ok(out)
}
