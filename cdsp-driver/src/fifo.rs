//! FIFO kinds, routing math and the shared FIFO configuration.
//!
//! Four hardware FIFOs connect the pipelines to the outside world:
//!
//! | Kind | Direction | Host-routable |
//! |------|-----------|---------------|
//! | Input (IFIFO) | into a pipeline | yes |
//! | External (EFIFO) | into a pipeline | no |
//! | Output (OFIFO) | out of a pipeline | no |
//! | Record (RFIFO) | out of a pipeline | yes |
//!
//! A pipeline *claims* the kinds named by its connection. The two pipelines
//! never claim the same kind at once.

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use crate::error::{CdspError, Result};
use crate::pipeline::{ChannelConfig, Connection, InputSource, OutputDestination};

bitflags! {
    /// Set of FIFO kinds. Bit positions match the FIFO reset, start and
    /// host-select registers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FifoKinds: u8 {
        const INPUT = 1 << 0;
        const EXTERNAL = 1 << 1;
        const OUTPUT = 1 << 2;
        const RECORD = 1 << 3;
    }
}

/// A single FIFO kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoKind {
    Input,
    External,
    Output,
    Record,
}

impl FifoKind {
    pub const fn bit(self) -> FifoKinds {
        match self {
            FifoKind::Input => FifoKinds::INPUT,
            FifoKind::External => FifoKinds::EXTERNAL,
            FifoKind::Output => FifoKinds::OUTPUT,
            FifoKind::Record => FifoKinds::RECORD,
        }
    }

    /// Bit offset of this kind's field in the channel routing byte.
    const fn channel_shift(self) -> u8 {
        match self {
            FifoKind::Input => 0,
            FifoKind::External => 2,
            FifoKind::Output => 4,
            FifoKind::Record => 6,
        }
    }

    const ALL: [FifoKind; 4] = [
        FifoKind::Input,
        FifoKind::External,
        FifoKind::Output,
        FifoKind::Record,
    ];
}

/// Whether a host-routable FIFO goes to its physical port or to host polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum FifoRoute {
    Port = 0,
    Host = 1,
}

/// FIFO kinds designated by a connection.
pub fn claimed_kinds(connection: Connection) -> FifoKinds {
    let input = match connection.input {
        InputSource::InputFifo => FifoKinds::INPUT,
        InputSource::ExternalFifo => FifoKinds::EXTERNAL,
        InputSource::Both => FifoKinds::INPUT | FifoKinds::EXTERNAL,
        InputSource::None | InputSource::OtherPipelineOutput => FifoKinds::empty(),
    };
    let output = match connection.output {
        OutputDestination::OutputFifo => FifoKinds::OUTPUT,
        OutputDestination::RecordFifo => FifoKinds::RECORD,
        OutputDestination::Both => FifoKinds::OUTPUT | FifoKinds::RECORD,
        OutputDestination::None | OutputDestination::OtherPipelineInput => FifoKinds::empty(),
    };
    input | output
}

fn channel_code(channels: u8) -> Result<u8> {
    match channels {
        1 => Ok(0),
        2 => Ok(1),
        4 => Ok(2),
        6 => Ok(3),
        _ => Err(CdspError::Argument("unsupported channel count")),
    }
}

/// Replace the channel fields of `kinds` in the routing byte `current`.
///
/// Input and external FIFOs carry the input-side channel count; output and
/// record FIFOs the output side.
pub fn channel_bits(current: u8, kinds: FifoKinds, channels: &ChannelConfig) -> Result<u8> {
    let mut byte = current;
    for kind in FifoKind::ALL {
        if !kinds.contains(kind.bit()) {
            continue;
        }
        let count = match kind {
            FifoKind::Input | FifoKind::External => channels.input_channels,
            FifoKind::Output | FifoKind::Record => channels.output_channels,
        };
        let shift = kind.channel_shift();
        byte = (byte & !(0b11 << shift)) | (channel_code(count)? << shift);
    }
    Ok(byte)
}

/// Return the channel fields of `kinds` to their reset value.
pub fn clear_channel_bits(current: u8, kinds: FifoKinds) -> u8 {
    FifoKind::ALL
        .into_iter()
        .filter(|kind| kinds.contains(kind.bit()))
        .fold(current, |byte, kind| byte & !(0b11 << kind.channel_shift()))
}

/// FIFO trigger point in 32-bit words for a buffering depth in samples.
pub fn trigger_point(depth: u32, channels: u8, bit_width: u8) -> Result<u16> {
    let bytes = depth as u64 * channels as u64 * (bit_width as u64 / 8);
    u16::try_from(bytes / 4).map_err(|_| CdspError::Argument("FIFO trigger point out of range"))
}

/// FIFO state shared by both pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FifoConfig {
    /// Input FIFO callback point in words, if any.
    pub input_point: Option<u16>,
    /// Record FIFO callback point in words, if any.
    pub record_point: Option<u16>,
    /// Output buffering depth in samples before the output FIFO starts.
    pub output_depth: u32,
    /// Record buffering depth in samples before the record FIFO starts.
    pub record_depth: u32,
    pub output_start_armed: bool,
    pub record_start_armed: bool,
    pub output_mix: [u8; 3],
    pub input_record_sel: u8,
    pub efifo_sink: [u8; 2],
    pub input_host_routed: bool,
    pub record_host_routed: bool,
    /// Bytes written through the input FIFO data port since its last reset.
    pub input_write_size: u32,
    // Register shadows.
    pub channel_bits: u8,
    pub start_bits: u8,
    pub ififo_enable: u8,
    pub ofifo_enable: u8,
    pub rfifo_enable: u8,
    pub host_sel: u8,
}

impl FifoConfig {
    pub fn is_host_routed(&self, kind: FifoKind) -> bool {
        match kind {
            FifoKind::Input => self.input_host_routed,
            FifoKind::Record => self.record_host_routed,
            FifoKind::External | FifoKind::Output => false,
        }
    }
}
