//! Interrupt flag layouts, decoded interrupt events and callback events.
//!
//! Decoding is pure: the dispatcher in [`driver`](crate::driver) reads the
//! flag registers and hands the raw bytes to the functions here, which turn
//! them into an ordered sequence of [`IrqEvent`]s. Nothing here allocates.

use bitflags::bitflags;
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::pipeline::PipelineId;

bitflags! {
    /// Top-level interrupt sources ([`IRQ_FLAG`](crate::regs::IRQ_FLAG)).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqSources: u8 {
        const DECODE = 1 << 0;
        const ENCODE = 1 << 1;
        const INPUT_FIFO = 1 << 2;
        const OUTPUT_FIFO = 1 << 3;
        const RECORD_FIFO = 1 << 4;
        const FATAL = 1 << 7;
    }

    /// Per-pipeline interrupt flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipelineIrq: u8 {
        /// Notification from the running program.
        const SFR = 1 << 0;
        const ERROR = 1 << 1;
        const END = 1 << 2;
        /// Timer event.
        const EVENT = 1 << 3;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InputFifoIrq: u8 {
        const POINT = 1 << 0;
        const EMPTY = 1 << 1;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OutputFifoIrq: u8 {
        const POINT = 1 << 0;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFifoIrq: u8 {
        const POINT = 1 << 0;
        const OVERFLOW = 1 << 1;
    }

    /// Pending callback events. Bit order is delivery order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventFlags: u16 {
        const HOST_COMMAND = 1 << 0;
        const END_OF_SEQUENCE = 1 << 1;
        const FIFO_POINT = 1 << 2;
        const RECORD_FIFO_POINT = 1 << 3;
        const FIFO_EMPTY = 1 << 4;
        const RECORD_BUFFER_OVERFLOW = 1 << 5;
        const TIMER = 1 << 6;
        const ERROR1 = 1 << 7;
        const ERROR2 = 1 << 8;
        const HW_ERROR = 1 << 9;
    }
}

/// Coprocessor fatal error code ([`CDSP_ERR`](crate::regs::CDSP_ERR)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FatalCode {
    None = 0,
    MemoryProtection = 1,
    Watchdog = 2,
    DownloadFailure = 3,
    #[num_enum(default)]
    Unknown = 0xFF,
}

// num_enum reads `#[default]` as its catch-all marker, so this stays manual.
impl Default for FatalCode {
    fn default() -> Self {
        FatalCode::None
    }
}

/// Event reported to a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The running program posted a notification; fetch it with
    /// [`get_parameter`](crate::Cdsp::get_parameter).
    HostCommand,
    EndOfSequence,
    /// Input FIFO reached its callback point.
    FifoPoint,
    /// Host-routed record FIFO reached its callback point.
    RecordFifoPoint,
    FifoEmpty,
    RecordBufferOverflow,
    Timer,
    /// Recoverable program error; the pipeline is Ready.
    Error1,
    /// Program-fatal error; the pipeline needs a new program.
    Error2,
    /// Coprocessor fatal error; reinitialize.
    HwError,
}

impl EventKind {
    /// Every kind, in delivery order.
    pub const ALL: [EventKind; 10] = [
        EventKind::HostCommand,
        EventKind::EndOfSequence,
        EventKind::FifoPoint,
        EventKind::RecordFifoPoint,
        EventKind::FifoEmpty,
        EventKind::RecordBufferOverflow,
        EventKind::Timer,
        EventKind::Error1,
        EventKind::Error2,
        EventKind::HwError,
    ];

    pub const fn flag(self) -> EventFlags {
        match self {
            EventKind::HostCommand => EventFlags::HOST_COMMAND,
            EventKind::EndOfSequence => EventFlags::END_OF_SEQUENCE,
            EventKind::FifoPoint => EventFlags::FIFO_POINT,
            EventKind::RecordFifoPoint => EventFlags::RECORD_FIFO_POINT,
            EventKind::FifoEmpty => EventFlags::FIFO_EMPTY,
            EventKind::RecordBufferOverflow => EventFlags::RECORD_BUFFER_OVERFLOW,
            EventKind::Timer => EventFlags::TIMER,
            EventKind::Error1 => EventFlags::ERROR1,
            EventKind::Error2 => EventFlags::ERROR2,
            EventKind::HwError => EventFlags::HW_ERROR,
        }
    }
}

impl EventFlags {
    /// Pending kinds in delivery order.
    pub fn kinds(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(kind.flag()))
    }
}

/// Extra words delivered with an event. Errors carry the output position and
/// the error code; other events carry zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventInfo {
    pub position: u32,
    pub code: u32,
}

/// One decoded interrupt condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqEvent {
    Notification(PipelineId),
    ProgramError(PipelineId),
    EndOfData(PipelineId),
    Timer(PipelineId),
    InputFifo { point: bool, empty: bool },
    OutputFifoPoint,
    RecordFifo { point: bool, overflow: bool },
    Fatal,
}

static SOURCE_ORDER: [IrqSources; 5] = [
    IrqSources::DECODE,
    IrqSources::ENCODE,
    IrqSources::INPUT_FIFO,
    IrqSources::OUTPUT_FIFO,
    IrqSources::RECORD_FIFO,
];

static FATAL_ONLY: [IrqSources; 1] = [IrqSources::FATAL];

/// Sources to service, in order. A fatal condition masks everything else.
pub fn pending_sources(flags: u8) -> impl Iterator<Item = IrqSources> {
    let flags = IrqSources::from_bits_truncate(flags);
    let order: &'static [IrqSources] = if flags.contains(IrqSources::FATAL) {
        &FATAL_ONLY
    } else {
        &SOURCE_ORDER
    };
    order.iter().copied().filter(move |source| flags.contains(*source))
}

/// Events for one pipeline's flag byte, in bit order.
pub fn decode_pipeline(id: PipelineId, flags: u8) -> impl Iterator<Item = IrqEvent> {
    let flags = PipelineIrq::from_bits_truncate(flags);
    [
        (PipelineIrq::SFR, IrqEvent::Notification(id)),
        (PipelineIrq::ERROR, IrqEvent::ProgramError(id)),
        (PipelineIrq::END, IrqEvent::EndOfData(id)),
        (PipelineIrq::EVENT, IrqEvent::Timer(id)),
    ]
    .into_iter()
    .filter(move |(bit, _)| flags.contains(*bit))
    .map(|(_, event)| event)
}

/// Event for a FIFO source's flag byte, if any flag is set.
pub fn decode_fifo(source: IrqSources, flags: u8) -> Option<IrqEvent> {
    let event = if source == IrqSources::INPUT_FIFO {
        let f = InputFifoIrq::from_bits_truncate(flags);
        IrqEvent::InputFifo {
            point: f.contains(InputFifoIrq::POINT),
            empty: f.contains(InputFifoIrq::EMPTY),
        }
    } else if source == IrqSources::OUTPUT_FIFO {
        if !OutputFifoIrq::from_bits_truncate(flags).contains(OutputFifoIrq::POINT) {
            return None;
        }
        IrqEvent::OutputFifoPoint
    } else if source == IrqSources::RECORD_FIFO {
        let f = RecordFifoIrq::from_bits_truncate(flags);
        IrqEvent::RecordFifo {
            point: f.contains(RecordFifoIrq::POINT),
            overflow: f.contains(RecordFifoIrq::OVERFLOW),
        }
    } else {
        return None;
    };
    match event {
        IrqEvent::InputFifo {
            point: false,
            empty: false,
        }
        | IrqEvent::RecordFifo {
            point: false,
            overflow: false,
        } => None,
        other => Some(other),
    }
}
