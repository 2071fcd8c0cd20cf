//! Run-length codec for voxel palette indices.
//!
//! Each run starts with a length-and-mode byte: bit 7 set means repeat
//! mode, bits 0-6 hold the run length minus one (1 to 128 cells per run).
//! Repeat mode is followed by a single palette index filling the whole
//! run; literal mode by one index per cell.

use crate::error::{DecodeError, DecodeResult};
use crate::index::{IndexWidth, PackedIndex, read_index, write_index};

const MAX_RUN: usize = 128;

/// Decode exactly `cell_count` cells from the stream.
pub fn decode_rle(
    data: &[u8],
    offset: &mut usize,
    cell_count: usize,
    width: IndexWidth,
) -> DecodeResult<Vec<PackedIndex>> {
    let mut cells = Vec::with_capacity(cell_count);
    while cells.len() < cell_count {
        let control = *data
            .get(*offset)
            .ok_or(DecodeError::UnexpectedEof { context: "voxel rle" })?;
        *offset += 1;

        let run = usize::from(control & 0x7F) + 1;
        if cells.len() + run > cell_count {
            return Err(DecodeError::InvalidFormat {
                context: "voxel rle",
                detail: format!(
                    "run of {run} overflows grid of {cell_count} at cell {}",
                    cells.len()
                ),
            });
        }

        if control & 0x80 == 0 {
            // Literal run: one index per cell.
            for _ in 0..run {
                cells.push(read_index(data, offset, width)?);
            }
        } else {
            let value = read_index(data, offset, width)?;
            cells.extend(std::iter::repeat_n(value, run));
        }
    }
    Ok(cells)
}

/// Encode a cell stream, splitting runs longer than 128.
pub fn encode_rle(out: &mut Vec<u8>, cells: &[PackedIndex], width: IndexWidth) -> DecodeResult<()> {
    let mut i = 0;
    while i < cells.len() {
        let run = run_length(cells, i);
        if run >= 2 {
            out.push(0x80 | (run - 1) as u8);
            write_index(out, width, cells[i])?;
            i += run;
        } else {
            // Batch consecutive singletons into one literal run.
            let mut j = i + 1;
            while j < cells.len() && j - i < MAX_RUN && run_length(cells, j) < 2 {
                j += 1;
            }
            out.push((j - i - 1) as u8);
            for cell in &cells[i..j] {
                write_index(out, width, *cell)?;
            }
            i = j;
        }
    }
    Ok(())
}

fn run_length(cells: &[PackedIndex], start: usize) -> usize {
    let first = cells[start];
    cells[start..]
        .iter()
        .take(MAX_RUN)
        .take_while(|&&c| c == first)
        .count()
}
