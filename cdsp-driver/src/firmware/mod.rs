//! Firmware image parsing.
//!
//! Three formats arrive from the upper driver as raw bytes:
//!
//! - [`os_image`]: the coprocessor's resident program, downloaded once at
//!   initialisation.
//! - [`program`]: a pipeline application program descriptor.
//! - [`blob`]: the parameter blob, a chunk stream carrying programs, FIFO
//!   routing, extension settings and parameter lists for both pipelines.
//!
//! Parsing borrows from the caller's buffer and never allocates. All
//! multi-byte fields are little-endian; memory words are 16 bits.

pub mod blob;
pub mod os_image;
pub mod program;

pub use blob::{ExtensionChunk, FifoChunk, ParamList, ParameterBlob, PipelineChunks};
pub use os_image::OsImage;
pub use program::{MemoryLayout, MemoryRegion, OutStartMode, ProgramImage, ProgramIdentity};

use crate::error::{CdspError, Result};

fn field(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    bytes
        .get(offset..offset + len)
        .ok_or(CdspError::Argument("image truncated"))
}

pub(crate) fn le_u16(bytes: &[u8], offset: usize) -> Result<u16> {
    let b = field(bytes, offset, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

pub(crate) fn le_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let b = field(bytes, offset, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}
