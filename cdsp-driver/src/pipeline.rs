//! Pipeline identifiers, audio path descriptions and the per-pipeline record.

use num_enum::TryFromPrimitive;

use crate::constants::COMMAND_ARG_BYTES;
use crate::error::{CdspError, Result};
use crate::event::{EventFlags, EventInfo, IrqSources};
use crate::firmware::ProgramIdentity;
use crate::regs::{self, PipelineRegs};

// ── Identifiers ────────────────────────────────────────────────────────────

/// One of the two coprocessor pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineId {
    Decode,
    Encode,
}

impl PipelineId {
    pub const ALL: [PipelineId; 2] = [PipelineId::Decode, PipelineId::Encode];

    /// The sibling pipeline.
    pub const fn other(self) -> PipelineId {
        match self {
            PipelineId::Decode => PipelineId::Encode,
            PipelineId::Encode => PipelineId::Decode,
        }
    }

    /// Register group of this pipeline.
    pub const fn regs(self) -> PipelineRegs {
        match self {
            PipelineId::Decode => regs::DECODE,
            PipelineId::Encode => regs::ENCODE,
        }
    }

    /// Bit of this pipeline in the top-level interrupt registers.
    pub const fn irq_source(self) -> IrqSources {
        match self {
            PipelineId::Decode => IrqSources::DECODE,
            PipelineId::Encode => IrqSources::ENCODE,
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// Pipeline lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    /// Coprocessor not booted.
    NotInit,
    /// Booted, no program loaded.
    Init,
    /// Program resident, paths being configured.
    ReadySetup,
    /// Configured and on standby.
    Ready,
    /// Processing samples.
    Playing,
}

// ── Path description ───────────────────────────────────────────────────────

/// Sample rate codes understood by the resident programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum RateCode {
    Hz48000 = 0,
    Hz44100 = 1,
    Hz32000 = 2,
    Hz24000 = 3,
    Hz22050 = 4,
    Hz16000 = 5,
    Hz12000 = 6,
    Hz11025 = 7,
    Hz8000 = 8,
    Hz96000 = 9,
}

impl RateCode {
    /// Sample rate in Hz.
    pub const fn hz(self) -> u32 {
        match self {
            RateCode::Hz48000 => 48_000,
            RateCode::Hz44100 => 44_100,
            RateCode::Hz32000 => 32_000,
            RateCode::Hz24000 => 24_000,
            RateCode::Hz22050 => 22_050,
            RateCode::Hz16000 => 16_000,
            RateCode::Hz12000 => 12_000,
            RateCode::Hz11025 => 11_025,
            RateCode::Hz8000 => 8_000,
            RateCode::Hz96000 => 96_000,
        }
    }
}

/// How a stereo stream is folded for dual-mono material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum DualMonoMode {
    Stereo = 0,
    Left = 1,
    Right = 2,
    Mix = 3,
}

/// Where a pipeline takes its samples from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum InputSource {
    None = 0,
    InputFifo = 1,
    ExternalFifo = 2,
    /// Input and external FIFOs together.
    Both = 3,
    /// The sibling pipeline's output.
    OtherPipelineOutput = 4,
}

/// Where a pipeline sends its samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum OutputDestination {
    None = 0,
    OutputFifo = 1,
    RecordFifo = 2,
    /// Output and record FIFOs together.
    Both = 3,
    /// The sibling pipeline's input.
    OtherPipelineInput = 4,
}

/// A pipeline's input and output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub input: InputSource,
    pub output: OutputDestination,
}

impl Connection {
    pub const fn new(input: InputSource, output: OutputDestination) -> Self {
        Self { input, output }
    }

    /// Whether the input includes the host-writable input FIFO.
    pub fn uses_input_fifo(&self) -> bool {
        matches!(self.input, InputSource::InputFifo | InputSource::Both)
    }

    /// Whether either side is wired to the sibling pipeline.
    pub fn is_coupled(&self) -> bool {
        self.input == InputSource::OtherPipelineOutput
            || self.output == OutputDestination::OtherPipelineInput
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(InputSource::None, OutputDestination::None)
    }
}

/// Channel counts and bit widths on both sides of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub input_channels: u8,
    pub input_bit_width: u8,
    pub output_channels: u8,
    pub output_bit_width: u8,
}

impl ChannelConfig {
    pub const fn new(
        input_channels: u8,
        input_bit_width: u8,
        output_channels: u8,
        output_bit_width: u8,
    ) -> Self {
        Self {
            input_channels,
            input_bit_width,
            output_channels,
            output_bit_width,
        }
    }

    /// Channels must be 1, 2, 4 or 6; bit widths 16, 24 or 32.
    pub fn validate(&self) -> Result<()> {
        for ch in [self.input_channels, self.output_channels] {
            if !matches!(ch, 1 | 2 | 4 | 6) {
                return Err(CdspError::Argument("unsupported channel count"));
            }
        }
        for bw in [self.input_bit_width, self.output_bit_width] {
            if !matches!(bw, 16 | 24 | 32) {
                return Err(CdspError::Argument("unsupported bit width"));
            }
        }
        Ok(())
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new(2, 16, 2, 16)
    }
}

/// Sample format carried by SetFormat and OutputFormatChange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub rate: RateCode,
    pub dual_mono: DualMonoMode,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            rate: RateCode::Hz48000,
            dual_mono: DualMonoMode::Stereo,
        }
    }
}

// ── Per-pipeline record ────────────────────────────────────────────────────

/// Last command or notification exchanged with the running program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingCommand {
    pub id: u8,
    pub args: [u8; COMMAND_ARG_BYTES],
    pub results: [u8; COMMAND_ARG_BYTES],
}

/// Everything the driver tracks for one pipeline.
#[derive(Debug, Clone)]
pub(crate) struct Pipeline {
    pub state: PipelineState,
    pub input_data_end_requested: bool,
    pub input_data_end_active: bool,
    /// Relaying the sibling's format change; the next End restarts instead
    /// of finishing.
    pub format_propagation_active: bool,
    /// Format announced by this pipeline's program and not yet acknowledged.
    pub deferred_format: Option<Format>,
    pub connection: Connection,
    pub channels: ChannelConfig,
    pub format: Format,
    pub identity: Option<ProgramIdentity>,
    pub version: u16,
    pub error_code: u8,
    pub position_supplement_ms: u32,
    pub pending: PendingCommand,
    pub events: EventFlags,
    pub error_info: EventInfo,
    pub ctl: u8,
    pub irq_enable: u8,
    pub timer_enabled: bool,
}

impl Pipeline {
    pub fn new(state: PipelineState) -> Self {
        Self {
            state,
            input_data_end_requested: false,
            input_data_end_active: false,
            format_propagation_active: false,
            deferred_format: None,
            connection: Connection::default(),
            channels: ChannelConfig::default(),
            format: Format::default(),
            identity: None,
            version: 0,
            error_code: 0,
            position_supplement_ms: 0,
            pending: PendingCommand::default(),
            events: EventFlags::empty(),
            error_info: EventInfo::default(),
            ctl: 0,
            irq_enable: 0,
            timer_enabled: false,
        }
    }
}
