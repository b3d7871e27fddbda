//! Pipeline application program descriptors.
//!
//! A descriptor is a 36-byte header followed by the program and data
//! segments. Addresses and sizes in the header count 16-bit words.
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0 | vendor id |
//! | 2 | function id |
//! | 4 | program type (0 = decode, 1 = encode) |
//! | 6 | output type |
//! | 8 / 10 | program / data scramble flags |
//! | 12 | entry address |
//! | 14 / 16 | program load address / size |
//! | 18 / 20 | data load address / size |
//! | 22 / 24 | work area address / size |
//! | 26 / 28 | stack address / size |
//! | 30 | output start mode (0 = immediate, 1 = wait for FIFO point) |
//! | 32 | resource flags |
//! | 34 | maximum load |

use num_enum::TryFromPrimitive;

use super::le_u16;
use crate::constants::PROGRAM_HEADER_BYTES;
use crate::error::{CdspError, Result};
use crate::pipeline::PipelineId;

/// When the output FIFO starts draining after the pipeline starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum OutStartMode {
    /// Start with the pipeline.
    Immediate = 0,
    /// Start once the output FIFO reaches its trigger point.
    WaitForPoint = 1,
}

/// A range of coprocessor memory words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryRegion {
    pub start: u16,
    pub size: u16,
}

impl MemoryRegion {
    pub const fn new(start: u16, size: u16) -> Self {
        Self { start, size }
    }

    /// `[start, start + size)` ranges overlap when both are non-empty and each
    /// begins before the other ends.
    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        let (a, s) = (self.start as u32, self.size as u32);
        let (b, t) = (other.start as u32, other.size as u32);
        s > 0 && t > 0 && a < b + t && b < a + s
    }
}

/// Memory claimed by one resident program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryLayout {
    /// Program memory.
    pub program: MemoryRegion,
    /// Data memory regions.
    pub data: MemoryRegion,
    pub work: MemoryRegion,
    pub stack: MemoryRegion,
}

impl MemoryLayout {
    fn data_regions(&self) -> [MemoryRegion; 3] {
        [self.data, self.work, self.stack]
    }

    /// Check that this layout can coexist with the sibling pipeline's.
    ///
    /// Program memory is compared with program memory. Data memory is
    /// shared, so every data/work/stack region is compared with every one of
    /// the sibling's.
    pub fn check_disjoint(&self, sibling: &MemoryLayout) -> Result<()> {
        if self.program.overlaps(&sibling.program) {
            return Err(CdspError::ResourceOverlap("program memory overlaps sibling"));
        }
        for mine in self.data_regions() {
            for theirs in sibling.data_regions() {
                if mine.overlaps(&theirs) {
                    return Err(CdspError::ResourceOverlap("data memory overlaps sibling"));
                }
            }
        }
        Ok(())
    }
}

/// Parsed descriptor header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub vendor_id: u16,
    pub function_id: u16,
    pub pipeline: PipelineId,
    pub output_type: u16,
    pub prog_scramble: u16,
    pub data_scramble: u16,
    pub entry_addr: u16,
    pub layout: MemoryLayout,
    pub out_start_mode: OutStartMode,
    pub resource_flag: u16,
    pub max_load: u16,
}

/// What the driver remembers about a resident program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramIdentity {
    pub vendor_id: u16,
    pub function_id: u16,
    pub pipeline: PipelineId,
    pub output_type: u16,
    pub out_start_mode: OutStartMode,
    pub layout: MemoryLayout,
}

impl ProgramIdentity {
    /// Same program, as far as reload decisions go.
    pub fn same_program(&self, other: &ProgramIdentity) -> bool {
        self.vendor_id == other.vendor_id && self.function_id == other.function_id
    }
}

/// A validated program descriptor borrowing its segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramImage<'a> {
    pub header: ProgramHeader,
    pub program: &'a [u8],
    pub data: &'a [u8],
}

impl<'a> ProgramImage<'a> {
    /// Parse a descriptor destined for `target`.
    pub fn parse(bytes: &'a [u8], target: PipelineId) -> Result<Self> {
        if bytes.len() < PROGRAM_HEADER_BYTES {
            return Err(CdspError::Argument("program header truncated"));
        }
        let word = |offset| le_u16(bytes, offset);

        let pipeline = match word(4)? {
            0 => PipelineId::Decode,
            1 => PipelineId::Encode,
            _ => return Err(CdspError::Argument("unknown program type")),
        };
        if pipeline != target {
            return Err(CdspError::Argument("program type does not match pipeline"));
        }
        let out_start_mode = OutStartMode::try_from(word(30)?)
            .map_err(|_| CdspError::Argument("unknown output start mode"))?;

        let layout = MemoryLayout {
            program: MemoryRegion::new(word(14)?, word(16)?),
            data: MemoryRegion::new(word(18)?, word(20)?),
            work: MemoryRegion::new(word(22)?, word(24)?),
            stack: MemoryRegion::new(word(26)?, word(28)?),
        };
        if layout.program.size == 0 {
            return Err(CdspError::Argument("program segment is empty"));
        }

        let payload = &bytes[PROGRAM_HEADER_BYTES..];
        let program_len = layout.program.size as usize * 2;
        let data_len = layout.data.size as usize * 2;
        if payload.len() != program_len + data_len {
            return Err(CdspError::Argument("program payload size mismatch"));
        }

        Ok(Self {
            header: ProgramHeader {
                vendor_id: word(0)?,
                function_id: word(2)?,
                pipeline,
                output_type: word(6)?,
                prog_scramble: word(8)?,
                data_scramble: word(10)?,
                entry_addr: word(12)?,
                layout,
                out_start_mode,
                resource_flag: word(32)?,
                max_load: word(34)?,
            },
            program: &payload[..program_len],
            data: &payload[program_len..],
        })
    }

    pub fn identity(&self) -> ProgramIdentity {
        ProgramIdentity {
            vendor_id: self.header.vendor_id,
            function_id: self.header.function_id,
            pipeline: self.header.pipeline,
            output_type: self.header.output_type,
            out_start_mode: self.header.out_start_mode,
            layout: self.header.layout,
        }
    }
}

/// Builds descriptors for tests.
#[cfg(test)]
pub(crate) struct ProgramBuilder {
    pub vendor_id: u16,
    pub function_id: u16,
    pub prog_type: u16,
    pub prog_scramble: u16,
    pub layout: MemoryLayout,
    pub out_start_mode: u16,
}

#[cfg(test)]
impl ProgramBuilder {
    pub fn new(pipeline: PipelineId) -> Self {
        let (prog_type, base) = match pipeline {
            PipelineId::Decode => (0, 0x0000),
            PipelineId::Encode => (1, 0x4000),
        };
        Self {
            vendor_id: 0x1234,
            function_id: 0x0001,
            prog_type,
            prog_scramble: 0,
            layout: MemoryLayout {
                program: MemoryRegion::new(base, 4),
                data: MemoryRegion::new(base, 2),
                work: MemoryRegion::new(base + 0x100, 0x40),
                stack: MemoryRegion::new(base + 0x200, 0x20),
            },
            out_start_mode: 0,
        }
    }

    pub fn build(&self) -> alloc::vec::Vec<u8> {
        let l = &self.layout;
        let fields = [
            self.vendor_id,
            self.function_id,
            self.prog_type,
            0,
            self.prog_scramble,
            0,
            l.program.start,
            l.program.start,
            l.program.size,
            l.data.start,
            l.data.size,
            l.work.start,
            l.work.size,
            l.stack.start,
            l.stack.size,
            self.out_start_mode,
            0,
            100,
        ];
        let mut out = alloc::vec::Vec::new();
        for f in fields {
            out.extend_from_slice(&f.to_le_bytes());
        }
        let words = l.program.size as usize + l.data.size as usize;
        out.extend((0..words * 2).map(|i| i as u8));
        out
    }
}
