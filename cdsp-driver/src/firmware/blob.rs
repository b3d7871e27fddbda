//! Parameter blob.
//!
//! The blob is a stream of chunks, each `[u32 tag][u32 size][payload]`:
//!
//! - Tag bits 15:8 select the kind: `0x10` program, `0x11` parameter list,
//!   `0x12` FIFO routing, `0x13` extension.
//! - Tag bit 16 selects the encode pipeline.
//!
//! At most one chunk of each kind may target a pipeline. Unknown kinds are
//! skipped so newer tools can add chunks.

use log::trace;

use super::{le_u32, ProgramImage};
use crate::constants::{
    COMMAND_ARG_BYTES, EXTENSION_CHUNK_BYTES, FIFO_CHUNK_BYTES, PARAM_RECORD_BYTES,
};
use crate::error::{CdspError, Result};
use crate::pipeline::{ChannelConfig, Connection, DualMonoMode, InputSource, OutputDestination, PipelineId, RateCode};

const CHUNK_HEADER_BYTES: usize = 8;
const KIND_PROGRAM: u8 = 0x10;
const KIND_PARAM_LIST: u8 = 0x11;
const KIND_FIFO: u8 = 0x12;
const KIND_EXTENSION: u8 = 0x13;
const TAG_ENCODE: u32 = 1 << 16;
const POINT_NONE: u32 = 0xFFFF_FFFF;
const KEEP: u8 = 0xFF;

/// Parameter-list chunk: commands replayed to the program after load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamList<'a> {
    records: &'a [u8],
}

impl<'a> ParamList<'a> {
    fn parse(payload: &'a [u8]) -> Result<Self> {
        let count = le_u32(payload, 0)? as usize;
        let records = &payload[4..];
        if count.checked_mul(PARAM_RECORD_BYTES) != Some(records.len()) {
            return Err(CdspError::Argument("parameter list size mismatch"));
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len() / PARAM_RECORD_BYTES
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `(command id, arguments)` pairs in blob order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, [u8; COMMAND_ARG_BYTES])> + 'a {
        self.records.chunks_exact(PARAM_RECORD_BYTES).map(|record| {
            let mut args = [0u8; COMMAND_ARG_BYTES];
            args.copy_from_slice(&record[1..]);
            (record[0], args)
        })
    }
}

/// FIFO routing chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoChunk {
    pub connection: Connection,
    pub channels: ChannelConfig,
    pub input_point: Option<u16>,
    pub record_point: Option<u16>,
    pub output_depth: u32,
    pub record_depth: u32,
    pub output_mix: [u8; 3],
    pub input_record_sel: u8,
}

fn callback_point(raw: u32) -> Result<Option<u16>> {
    match raw {
        POINT_NONE => Ok(None),
        p => u16::try_from(p)
            .map(Some)
            .map_err(|_| CdspError::Argument("FIFO callback point out of range")),
    }
}

impl FifoChunk {
    fn parse(p: &[u8]) -> Result<Self> {
        if p.len() != FIFO_CHUNK_BYTES {
            return Err(CdspError::Argument("FIFO chunk size mismatch"));
        }
        let input = InputSource::try_from(p[0]).map_err(|_| CdspError::Argument("unknown input source"))?;
        let output = OutputDestination::try_from(p[1])
            .map_err(|_| CdspError::Argument("unknown output destination"))?;
        let channels = ChannelConfig::new(p[2], p[3], p[4], p[5]);
        channels.validate()?;
        Ok(Self {
            connection: Connection::new(input, output),
            channels,
            input_point: callback_point(le_u32(p, 6)?)?,
            record_point: callback_point(le_u32(p, 10)?)?,
            output_depth: le_u32(p, 14)?,
            record_depth: le_u32(p, 18)?,
            output_mix: [p[22], p[23], p[24]],
            input_record_sel: p[25],
        })
    }
}

/// Extension chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionChunk {
    pub efifo_sink: [u8; 2],
    /// New rate, or `None` to keep the current one.
    pub rate: Option<RateCode>,
    pub dual_mono: Option<DualMonoMode>,
    pub timer_enabled: bool,
}

impl ExtensionChunk {
    fn parse(p: &[u8]) -> Result<Self> {
        if p.len() != EXTENSION_CHUNK_BYTES {
            return Err(CdspError::Argument("extension chunk size mismatch"));
        }
        let rate = match p[2] {
            KEEP => None,
            code => Some(RateCode::try_from(code).map_err(|_| CdspError::Argument("unknown rate code"))?),
        };
        let dual_mono = match p[3] {
            KEEP => None,
            code => Some(
                DualMonoMode::try_from(code).map_err(|_| CdspError::Argument("unknown dual-mono mode"))?,
            ),
        };
        Ok(Self {
            efifo_sink: [p[0], p[1]],
            rate,
            dual_mono,
            timer_enabled: p[4] & 0x01 != 0,
        })
    }
}

/// Chunks addressed to one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineChunks<'a> {
    pub program: Option<ProgramImage<'a>>,
    pub params: Option<ParamList<'a>>,
    pub fifo: Option<FifoChunk>,
    pub extension: Option<ExtensionChunk>,
}

impl PipelineChunks<'_> {
    pub fn is_empty(&self) -> bool {
        self.program.is_none() && self.params.is_none() && self.fifo.is_none() && self.extension.is_none()
    }
}

fn store<T>(slot: &mut Option<T>, value: T) -> Result<()> {
    if slot.is_some() {
        return Err(CdspError::Argument("duplicate chunk"));
    }
    *slot = Some(value);
    Ok(())
}

/// A fully parsed and validated parameter blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParameterBlob<'a> {
    pub decode: PipelineChunks<'a>,
    pub encode: PipelineChunks<'a>,
}

impl<'a> ParameterBlob<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let mut blob = ParameterBlob::default();
        let mut offset = 0;
        while offset < bytes.len() {
            if bytes.len() - offset < CHUNK_HEADER_BYTES {
                return Err(CdspError::Argument("chunk header truncated"));
            }
            let tag = le_u32(bytes, offset)?;
            let size = le_u32(bytes, offset + 4)? as usize;
            let start = offset + CHUNK_HEADER_BYTES;
            let payload = bytes
                .get(start..)
                .and_then(|rest| rest.get(..size))
                .ok_or(CdspError::Argument("chunk payload truncated"))?;
            offset = start + size;

            let pipeline = if tag & TAG_ENCODE != 0 {
                PipelineId::Encode
            } else {
                PipelineId::Decode
            };
            let kind = (tag >> 8) as u8;
            trace!("blob chunk tag=0x{:08x} size={} -> {:?}", tag, size, pipeline);

            let chunks = match pipeline {
                PipelineId::Decode => &mut blob.decode,
                PipelineId::Encode => &mut blob.encode,
            };
            match kind {
                KIND_PROGRAM => {
                    let length = le_u32(payload, 0)? as usize;
                    if length.checked_add(4) != Some(size) {
                        return Err(CdspError::Argument("program chunk size mismatch"));
                    }
                    store(&mut chunks.program, ProgramImage::parse(&payload[4..], pipeline)?)?;
                }
                KIND_PARAM_LIST => store(&mut chunks.params, ParamList::parse(payload)?)?,
                KIND_FIFO => store(&mut chunks.fifo, FifoChunk::parse(payload)?)?,
                KIND_EXTENSION => store(&mut chunks.extension, ExtensionChunk::parse(payload)?)?,
                _ => trace!("skipping unknown chunk kind 0x{:02x}", kind),
            }
        }
        Ok(blob)
    }

    pub fn get(&self, id: PipelineId) -> &PipelineChunks<'a> {
        match id {
            PipelineId::Decode => &self.decode,
            PipelineId::Encode => &self.encode,
        }
    }
}
