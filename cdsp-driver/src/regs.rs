//! CDSP register addresses and bitfield definitions.
//!
//! Register addresses are 16-bit; every register holds one byte. Multi-byte
//! quantities (positions, FIFO points, remaining counters) are split across
//! consecutive registers, most significant byte first.

// ── Core control ───────────────────────────────────────────────────────────

/// Core reset control.
/// - Bit 1 — HOLD (core halted, memory window writable)
/// - Bit 0 — SOFT_RESET
pub const CDSP_RESET: u16 = 0x0000;
pub const RESET_SOFT: u8 = 1 << 0;
pub const RESET_HOLD: u8 = 1 << 1;

/// Core status (read-only).
/// - Bit 1 — DOWNLOAD_ERR (resident program rejected its image)
/// - Bit 0 — BOOT_DONE
pub const CDSP_STATUS: u16 = 0x0001;
pub const STATUS_BOOT_DONE: u8 = 1 << 0;
pub const STATUS_DOWNLOAD_ERR: u8 = 1 << 1;

/// Memory window control.
/// - Bit 7 — AUTO_INC (address advances after each data byte)
/// - Bit 6 — DESCRAMBLE (hardware descrambles incoming bytes)
/// - Bit 0 — SPACE (0 = program memory, 1 = data memory)
pub const CDSP_MEM_CTL: u16 = 0x0002;
pub const MEM_SPACE_PROGRAM: u8 = 0;
pub const MEM_SPACE_DATA: u8 = 1 << 0;
pub const MEM_DESCRAMBLE: u8 = 1 << 6;
pub const MEM_AUTO_INC: u8 = 1 << 7;

/// Memory window word address.
pub const CDSP_MEM_ADR_H: u16 = 0x0003;
pub const CDSP_MEM_ADR_L: u16 = 0x0004;

/// Memory window data port.
pub const CDSP_MEM_DATA: u16 = 0x0005;

/// Fatal error code latched by the coprocessor (see [`FatalCode`](crate::event::FatalCode)).
pub const CDSP_ERR: u16 = 0x0006;

// ── Top-level interrupts ───────────────────────────────────────────────────

/// Top-level interrupt flags (write 1 to clear).
/// - Bit 7 — CDSP fatal
/// - Bit 4 — RFIFO
/// - Bit 3 — OFIFO
/// - Bit 2 — IFIFO
/// - Bit 1 — encode pipeline
/// - Bit 0 — decode pipeline
pub const IRQ_FLAG: u16 = 0x0008;

/// Top-level interrupt enables, same layout as [`IRQ_FLAG`].
pub const IRQ_ENABLE: u16 = 0x0009;

// ── FIFO block ─────────────────────────────────────────────────────────────

/// FIFO reset pulse.
/// - Bit 3 — RFIFO
/// - Bit 2 — OFIFO
/// - Bit 1 — EFIFO
/// - Bit 0 — IFIFO
pub const FIFO_RST: u16 = 0x0010;

/// FIFO start bits, same bit layout as [`FIFO_RST`]. Only OFIFO and RFIFO
/// are meaningful.
pub const FIFO_START: u16 = 0x0011;

/// Channel routing byte, two bits per FIFO kind.
/// - Bits 7:6 — RFIFO
/// - Bits 5:4 — OFIFO
/// - Bits 3:2 — EFIFO
/// - Bits 1:0 — IFIFO
pub const FIFO_CH: u16 = 0x0012;

/// Output mix selectors.
pub const FIFO_MIX0: u16 = 0x0013;
pub const FIFO_MIX1: u16 = 0x0014;
pub const FIFO_MIX2: u16 = 0x0015;

/// Input/record bit width and source selector.
pub const FIFO_IN_REC_SEL: u16 = 0x0016;

/// External-FIFO sink selectors.
pub const EFIFO_SINK0: u16 = 0x0017;
pub const EFIFO_SINK1: u16 = 0x0018;

/// Host routing, same bit layout as [`FIFO_RST`]. A set bit routes the FIFO
/// to host polling instead of its physical port.
pub const FIFO_HOST_SEL: u16 = 0x0019;

/// Input FIFO interrupt flags (write 1 to clear).
/// - Bit 1 — EMPTY
/// - Bit 0 — POINT
pub const IFIFO_FLAG: u16 = 0x001A;
/// Input FIFO interrupt enables, same layout as [`IFIFO_FLAG`].
pub const IFIFO_ENABLE: u16 = 0x001B;
/// Input FIFO callback point, in 32-bit words.
pub const IFIFO_POINT_H: u16 = 0x001C;
pub const IFIFO_POINT_L: u16 = 0x001D;
/// Input FIFO free space in bytes (read-only).
pub const IFIFO_REMAIN_H: u16 = 0x001E;
pub const IFIFO_REMAIN_L: u16 = 0x001F;
/// Input FIFO host data port.
pub const IFIFO_DATA: u16 = 0x0020;

/// Output FIFO interrupt flags (write 1 to clear).
/// - Bit 0 — POINT
pub const OFIFO_FLAG: u16 = 0x0021;
/// Output FIFO interrupt enables.
pub const OFIFO_ENABLE: u16 = 0x0022;
/// Output FIFO trigger point, in 32-bit words.
pub const OFIFO_POINT_H: u16 = 0x0023;
pub const OFIFO_POINT_L: u16 = 0x0024;
/// Output FIFO status (read-only).
/// - Bit 0 — EMPTY
pub const OFIFO_STATUS: u16 = 0x0025;

/// Record FIFO interrupt flags (write 1 to clear).
/// - Bit 1 — OVERFLOW
/// - Bit 0 — POINT
pub const RFIFO_FLAG: u16 = 0x0026;
/// Record FIFO interrupt enables, same layout as [`RFIFO_FLAG`].
pub const RFIFO_ENABLE: u16 = 0x0027;
/// Record FIFO trigger point, in 32-bit words.
pub const RFIFO_POINT_H: u16 = 0x0028;
pub const RFIFO_POINT_L: u16 = 0x0029;
/// Record FIFO bytes available to the host (read-only).
pub const RFIFO_REMAIN_H: u16 = 0x002A;
pub const RFIFO_REMAIN_L: u16 = 0x002B;
/// Record FIFO host data port.
pub const RFIFO_DATA: u16 = 0x002C;
/// Record FIFO status (read-only).
/// - Bit 0 — EMPTY
pub const RFIFO_STATUS: u16 = 0x002D;

/// Shared FIFO status bit.
pub const FIFO_STATUS_EMPTY: u8 = 1 << 0;

// ── Per-pipeline register groups ───────────────────────────────────────────

/// Pipeline control.
/// - Bit 1 — POS_RESET (clears the position counters)
/// - Bit 0 — START
pub const CTL_START: u8 = 1 << 0;
pub const CTL_POS_RESET: u8 = 1 << 1;

/// Completion bit shared by the host and coprocessor command registers.
pub const CMD_COMPLETION: u8 = 1 << 7;

/// Register group for one pipeline. Decode and encode have identical layouts
/// at different base addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineRegs {
    base: u16,
}

/// Decode pipeline register group.
pub const DECODE: PipelineRegs = PipelineRegs { base: 0x0040 };

/// Encode pipeline register group.
pub const ENCODE: PipelineRegs = PipelineRegs { base: 0x0080 };

impl PipelineRegs {
    /// Pipeline control (START, POS_RESET).
    pub const fn ctl(self) -> u16 {
        self.base
    }

    /// Pipeline interrupt flags (write 1 to clear).
    /// - Bit 3 — EVENT (timer)
    /// - Bit 2 — END
    /// - Bit 1 — ERROR
    /// - Bit 0 — SFR (notification)
    pub const fn irq_flag(self) -> u16 {
        self.base + 0x02
    }

    /// Pipeline interrupt enables, same layout as [`irq_flag`](Self::irq_flag).
    pub const fn irq_enable(self) -> u16 {
        self.base + 0x03
    }

    /// Host-to-coprocessor command id; bit 7 is the completion bit.
    pub const fn host_cmd(self) -> u16 {
        self.base + 0x04
    }

    /// Result code of the last completed command.
    pub const fn host_res(self) -> u16 {
        self.base + 0x05
    }

    /// Host command argument / result byte `index` (0–15).
    pub const fn host_arg(self, index: usize) -> u16 {
        self.base + 0x06 + index as u16
    }

    /// Coprocessor-to-host notification id; bit 7 is the completion bit.
    pub const fn os_cmd(self) -> u16 {
        self.base + 0x16
    }

    /// Notification argument / acknowledgement byte `index` (0–15).
    pub const fn os_arg(self, index: usize) -> u16 {
        self.base + 0x17 + index as u16
    }

    /// Program error code latched with the ERROR interrupt.
    pub const fn err_code(self) -> u16 {
        self.base + 0x27
    }

    /// Input position counter byte `index` (0 = most significant), in samples.
    pub const fn in_pos(self, index: usize) -> u16 {
        self.base + 0x28 + index as u16
    }

    /// Output position counter byte `index` (0 = most significant), in samples.
    pub const fn out_pos(self, index: usize) -> u16 {
        self.base + 0x2C + index as u16
    }

    /// Program version.
    pub const fn version_h(self) -> u16 {
        self.base + 0x30
    }

    pub const fn version_l(self) -> u16 {
        self.base + 0x31
    }
}
