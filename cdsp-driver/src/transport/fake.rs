//! Scriptable fake coprocessor for tests.
//!
//! Keeps a byte register file and reacts to writes the way the resident
//! program does: boots when the core reset is released, completes host
//! commands (with configurable result codes, or never), records
//! acknowledgements, clears write-1-to-clear flag registers and streams the
//! FIFO data ports.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use super::{RegisterTransport, TransportError};
use crate::constants::COMMAND_ARG_BYTES;
use crate::event::{IrqSources, PipelineIrq};
use crate::pipeline::PipelineId;
use crate::regs;

enum Op {
    Write { addr: u16, value: u8 },
    Wait { addr: u16, mask: u8, value: u8 },
}

/// One command or acknowledgement seen by the fake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Exchange {
    pub pipeline: PipelineId,
    pub id: u8,
    pub args: [u8; COMMAND_ARG_BYTES],
}

pub(crate) struct FakeCdsp {
    pub regs: [u8; 0x100],
    queue: Vec<Op>,
    pub writes: Vec<(u16, u8)>,
    pub commands: Vec<Exchange>,
    pub acks: Vec<Exchange>,
    pub fifo_resets: Vec<u8>,
    pub mem_bytes: usize,
    pub boots: usize,
    pub input_data: Vec<u8>,
    pub record_data: VecDeque<u8>,
    pub boot_fails: bool,
    results: Vec<(u8, u8)>,
    hangs: Vec<u8>,
}

impl FakeCdsp {
    pub fn new() -> Self {
        Self {
            regs: [0; 0x100],
            queue: Vec::new(),
            writes: Vec::new(),
            commands: Vec::new(),
            acks: Vec::new(),
            fifo_resets: Vec::new(),
            mem_bytes: 0,
            boots: 0,
            input_data: Vec::new(),
            record_data: VecDeque::new(),
            boot_fails: false,
            results: Vec::new(),
            hangs: Vec::new(),
        }
    }

    /// A fake whose resident program is already running.
    pub fn booted() -> Self {
        let mut fake = Self::new();
        fake.boot();
        fake.boots = 0;
        fake
    }

    // ── Scripting ─────────────────────────────────────────────────────

    /// Answer command `id` with result code `code` from now on.
    pub fn set_result(&mut self, id: u8, code: u8) {
        self.results.retain(|&(c, _)| c != id);
        self.results.push((id, code));
    }

    /// Never complete command `id`.
    pub fn hang(&mut self, id: u8) {
        self.hangs.push(id);
    }

    pub fn unhang(&mut self, id: u8) {
        self.hangs.retain(|&c| c != id);
    }

    pub fn reg(&self, addr: u16) -> u8 {
        self.regs[addr as usize]
    }

    pub fn set_reg(&mut self, addr: u16, value: u8) {
        self.regs[addr as usize] = value;
    }

    fn set_u16(&mut self, hi: u16, lo: u16, value: u16) {
        self.regs[hi as usize] = (value >> 8) as u8;
        self.regs[lo as usize] = value as u8;
    }

    /// Post a notification from the running program and raise its interrupt.
    pub fn raise_notification(&mut self, pipeline: PipelineId, id: u8, args: &[u8]) {
        let group = pipeline.regs();
        self.set_reg(group.os_cmd(), id & !regs::CMD_COMPLETION);
        for (i, &b) in args.iter().enumerate() {
            self.set_reg(group.os_arg(i), b);
        }
        self.raise_pipeline(pipeline, PipelineIrq::SFR);
    }

    pub fn raise_pipeline(&mut self, pipeline: PipelineId, flags: PipelineIrq) {
        let addr = pipeline.regs().irq_flag() as usize;
        self.regs[addr] |= flags.bits();
        self.regs[regs::IRQ_FLAG as usize] |= pipeline.irq_source().bits();
    }

    pub fn raise_error(&mut self, pipeline: PipelineId, code: u8) {
        self.set_reg(pipeline.regs().err_code(), code);
        self.raise_pipeline(pipeline, PipelineIrq::ERROR);
    }

    pub fn raise_fifo(&mut self, source: IrqSources, flag_addr: u16, bits: u8) {
        self.regs[flag_addr as usize] |= bits;
        self.regs[regs::IRQ_FLAG as usize] |= source.bits();
    }

    pub fn raise_fatal(&mut self, code: u8) {
        self.set_reg(regs::CDSP_ERR, code);
        self.regs[regs::IRQ_FLAG as usize] |= IrqSources::FATAL.bits();
    }

    pub fn set_positions(&mut self, pipeline: PipelineId, input: u32, output: u32) {
        let group = pipeline.regs();
        for i in 0..4 {
            let shift = 24 - 8 * i as u32;
            self.set_reg(group.in_pos(i), (input >> shift) as u8);
            self.set_reg(group.out_pos(i), (output >> shift) as u8);
        }
    }

    pub fn fill_record(&mut self, data: &[u8]) {
        self.record_data.extend(data.iter().copied());
        let len = self.record_data.len() as u16;
        self.set_u16(regs::RFIFO_REMAIN_H, regs::RFIFO_REMAIN_L, len);
    }

    /// Command ids sent to `pipeline`, in order.
    pub fn command_ids(&self, pipeline: PipelineId) -> Vec<u8> {
        self.commands
            .iter()
            .filter(|c| c.pipeline == pipeline)
            .map(|c| c.id)
            .collect()
    }

    pub fn clear_logs(&mut self) {
        self.writes.clear();
        self.commands.clear();
        self.acks.clear();
        self.fifo_resets.clear();
    }

    // ── Coprocessor behaviour ─────────────────────────────────────────

    fn pipeline_of(addr: u16) -> Option<PipelineId> {
        [PipelineId::Decode, PipelineId::Encode]
            .into_iter()
            .find(|p| {
                let base = p.regs().ctl();
                addr >= base && addr < base + 0x40
            })
    }

    fn boot(&mut self) {
        self.boots += 1;
        if self.boot_fails {
            self.set_reg(regs::CDSP_STATUS, regs::STATUS_DOWNLOAD_ERR);
            return;
        }
        self.set_reg(regs::CDSP_STATUS, regs::STATUS_BOOT_DONE);
        for p in [PipelineId::Decode, PipelineId::Encode] {
            self.set_reg(p.regs().host_cmd(), regs::CMD_COMPLETION);
            self.set_reg(p.regs().os_cmd(), regs::CMD_COMPLETION);
        }
        self.set_u16(regs::IFIFO_REMAIN_H, regs::IFIFO_REMAIN_L, 0x1000);
        self.set_reg(regs::OFIFO_STATUS, regs::FIFO_STATUS_EMPTY);
        self.set_reg(regs::RFIFO_STATUS, regs::FIFO_STATUS_EMPTY);
    }

    fn command(&mut self, pipeline: PipelineId, value: u8) {
        let group = pipeline.regs();
        let mut args = [0u8; COMMAND_ARG_BYTES];
        for (i, arg) in args.iter_mut().enumerate() {
            *arg = self.reg(group.host_arg(i));
        }
        self.commands.push(Exchange {
            pipeline,
            id: value,
            args,
        });
        if self.hangs.contains(&value) {
            return;
        }
        let code = self
            .results
            .iter()
            .find(|&&(c, _)| c == value)
            .map_or(0, |&(_, code)| code);
        self.set_reg(group.host_res(), code);
        for i in 0..COMMAND_ARG_BYTES {
            self.set_reg(group.host_arg(i), 0);
        }
        self.set_reg(group.host_cmd(), value | regs::CMD_COMPLETION);
    }

    fn apply_write(&mut self, addr: u16, value: u8) {
        self.writes.push((addr, value));
        let slot = addr as usize;
        match addr {
            regs::CDSP_RESET => {
                let previous = self.regs[slot];
                self.regs[slot] = value;
                if value == 0 && previous != 0 {
                    self.boot();
                } else if value != 0 {
                    self.set_reg(regs::CDSP_STATUS, 0);
                }
            }
            regs::CDSP_MEM_DATA => self.mem_bytes += 1,
            regs::IRQ_FLAG | regs::IFIFO_FLAG | regs::OFIFO_FLAG | regs::RFIFO_FLAG => {
                self.regs[slot] &= !value;
            }
            regs::FIFO_RST => {
                self.regs[slot] = value;
                if value != 0 {
                    self.fifo_resets.push(value);
                }
            }
            regs::IFIFO_DATA => {
                self.input_data.push(value);
                let remain = ((self.reg(regs::IFIFO_REMAIN_H) as u16) << 8)
                    | self.reg(regs::IFIFO_REMAIN_L) as u16;
                self.set_u16(regs::IFIFO_REMAIN_H, regs::IFIFO_REMAIN_L, remain.saturating_sub(1));
            }
            _ => match Self::pipeline_of(addr) {
                Some(p) if addr == p.regs().irq_flag() => self.regs[slot] &= !value,
                Some(p) if addr == p.regs().host_cmd() => {
                    self.regs[slot] = value;
                    if value & regs::CMD_COMPLETION == 0 {
                        self.command(p, value);
                    }
                }
                Some(p) if addr == p.regs().os_cmd() => {
                    self.regs[slot] = value;
                    if value & regs::CMD_COMPLETION != 0 {
                        let mut args = [0u8; COMMAND_ARG_BYTES];
                        for (i, arg) in args.iter_mut().enumerate() {
                            *arg = self.reg(p.regs().os_arg(i));
                        }
                        self.acks.push(Exchange {
                            pipeline: p,
                            id: value & !regs::CMD_COMPLETION,
                            args,
                        });
                    }
                }
                _ => self.regs[slot] = value,
            },
        }
    }
}

impl RegisterTransport for FakeCdsp {
    fn read(&mut self, addr: u16) -> Result<u8, TransportError> {
        if addr == regs::RFIFO_DATA {
            let byte = self.record_data.pop_front().unwrap_or(0);
            let len = self.record_data.len() as u16;
            self.set_u16(regs::RFIFO_REMAIN_H, regs::RFIFO_REMAIN_L, len);
            return Ok(byte);
        }
        Ok(self.reg(addr))
    }

    fn write(&mut self, addr: u16, value: u8) {
        self.queue.push(Op::Write { addr, value });
    }

    fn wait_for_bits(&mut self, addr: u16, mask: u8, value: u8, _timeout_us: u32) {
        self.queue.push(Op::Wait { addr, mask, value });
    }

    fn execute(&mut self) -> Result<(), TransportError> {
        let ops = core::mem::take(&mut self.queue);
        for op in ops {
            match op {
                Op::Write { addr, value } => self.apply_write(addr, value),
                Op::Wait { addr, mask, value } => {
                    if self.reg(addr) & mask != value {
                        return Err(TransportError::Timeout);
                    }
                }
            }
        }
        Ok(())
    }
}
