//! FIFO sequencing: resets, trigger points, start bits, routing and host I/O.
//!
//! Output and record FIFOs start in two steps. Starting a pipeline arms the
//! FIFO's point interrupt; the interrupt (or immediate output-start mode, or
//! end of input) sets the armed flag, and only then is the FIFO start bit
//! set. A host-routed record FIFO skips the armed flag and starts with the
//! pipeline.

use log::{debug, trace};

use super::Cdsp;
use crate::error::{CdspError, Result};
use crate::event::{InputFifoIrq, OutputFifoIrq, RecordFifoIrq};
use crate::fifo::{self, FifoKind, FifoKinds, FifoRoute};
use crate::firmware::{ExtensionChunk, FifoChunk};
use crate::pipeline::{Connection, InputSource, OutputDestination, PipelineId, PipelineState};
use crate::regs;
use crate::transport::{self, RegisterTransport};

/// Whether a coupled downstream pipeline would claim a host-routed record
/// FIFO. Format propagation cannot drain such a FIFO.
pub(crate) fn record_coupling_conflict(connections: &[Connection; 2], record_host_routed: bool) -> bool {
    if !record_host_routed {
        return false;
    }
    PipelineId::ALL.into_iter().any(|id| {
        let own = connections[id.index()];
        let sibling = connections[id.other().index()];
        let downstream = own.input == InputSource::OtherPipelineOutput
            || sibling.output == OutputDestination::OtherPipelineInput;
        downstream && fifo::claimed_kinds(own).contains(FifoKinds::RECORD)
    })
}

impl<T: RegisterTransport> Cdsp<T> {
    /// Pipeline currently claiming every kind in `kinds`.
    pub(crate) fn owner_of(&self, kinds: FifoKinds) -> Option<PipelineId> {
        PipelineId::ALL
            .into_iter()
            .find(|&id| self.claimed(id).contains(kinds))
    }

    fn playing_owner(&self, kinds: FifoKinds) -> Option<PipelineId> {
        self.owner_of(kinds)
            .filter(|&id| self.state(id) == PipelineState::Playing)
    }

    /// Pulse the hardware reset of `kinds`, whoever claims them.
    pub(crate) fn pulse_fifo_reset(&mut self, kinds: FifoKinds) -> Result<()> {
        if kinds.is_empty() {
            return Ok(());
        }
        trace!("FIFO reset {:?}", kinds);
        self.bus.write(regs::FIFO_RST, kinds.bits());
        self.bus.write(regs::FIFO_RST, 0);
        self.bus.execute()?;
        if kinds.contains(FifoKinds::INPUT) {
            self.fifo.input_write_size = 0;
        }
        Ok(())
    }

    /// Reset the requested kinds that pipeline `id` currently claims.
    pub fn reset_fifo(&mut self, id: PipelineId, kinds: FifoKinds) -> Result<()> {
        let owned = kinds & self.claimed(id);
        self.pulse_fifo_reset(owned)
    }

    /// Write the channel routing byte, returning the previous value.
    pub fn route_channel_bits(&mut self, byte: u8) -> Result<u8> {
        let previous = self.fifo.channel_bits;
        if byte != previous {
            self.bus.write(regs::FIFO_CH, byte);
            self.bus.execute()?;
            self.fifo.channel_bits = byte;
        }
        Ok(previous)
    }

    // ── Arming (queued; the caller executes) ───────────────────────────

    pub(crate) fn arm_output_fifo(&mut self, point: u16) {
        transport::write_u16(&mut self.bus, regs::OFIFO_POINT_H, regs::OFIFO_POINT_L, point);
        self.fifo.ofifo_enable = OutputFifoIrq::POINT.bits();
        self.bus.write(regs::OFIFO_ENABLE, self.fifo.ofifo_enable);
    }

    pub(crate) fn arm_record_fifo(&mut self, point: u16) {
        let (point, enable) = if self.fifo.record_host_routed {
            let mut enable = RecordFifoIrq::OVERFLOW;
            if self.fifo.record_point.is_some() {
                enable |= RecordFifoIrq::POINT;
            }
            (self.fifo.record_point.unwrap_or(0), enable)
        } else {
            (point, RecordFifoIrq::POINT)
        };
        transport::write_u16(&mut self.bus, regs::RFIFO_POINT_H, regs::RFIFO_POINT_L, point);
        self.fifo.rfifo_enable = enable.bits();
        self.bus.write(regs::RFIFO_ENABLE, self.fifo.rfifo_enable);
    }

    pub(crate) fn arm_input_fifo(&mut self) {
        let mut enable = InputFifoIrq::EMPTY;
        if let Some(point) = self.fifo.input_point {
            transport::write_u16(&mut self.bus, regs::IFIFO_POINT_H, regs::IFIFO_POINT_L, point);
            enable |= InputFifoIrq::POINT;
        }
        self.fifo.ififo_enable = enable.bits();
        self.bus.write(regs::IFIFO_ENABLE, self.fifo.ififo_enable);
    }

    /// Disable the FIFO interrupts and start bits owned by `id`.
    pub(crate) fn disarm_fifos(&mut self, id: PipelineId) {
        let kinds = self.claimed(id);
        if kinds.contains(FifoKinds::INPUT) {
            self.fifo.ififo_enable = 0;
            self.bus.write(regs::IFIFO_ENABLE, 0);
        }
        if kinds.contains(FifoKinds::OUTPUT) {
            self.fifo.ofifo_enable = 0;
            self.fifo.output_start_armed = false;
            self.bus.write(regs::OFIFO_ENABLE, 0);
        }
        if kinds.contains(FifoKinds::RECORD) {
            self.fifo.rfifo_enable = 0;
            self.fifo.record_start_armed = false;
            self.bus.write(regs::RFIFO_ENABLE, 0);
        }
        let start = (kinds & (FifoKinds::OUTPUT | FifoKinds::RECORD)).bits();
        if self.fifo.start_bits & start != 0 {
            self.fifo.start_bits &= !start;
            self.bus.write(regs::FIFO_START, self.fifo.start_bits);
        }
    }

    // ── Start ──────────────────────────────────────────────────────────

    fn set_start_bit(&mut self, kind: FifoKinds) -> Result<()> {
        if self.fifo.start_bits & kind.bits() != 0 {
            return Ok(());
        }
        let bits = self.fifo.start_bits | kind.bits();
        self.bus.write(regs::FIFO_START, bits);
        self.bus.execute()?;
        self.fifo.start_bits = bits;
        debug!("FIFO start {:?}", kind);
        Ok(())
    }

    /// Start the output FIFO of a Playing pipeline once it is armed.
    pub(crate) fn start_output_fifo(&mut self, id: PipelineId) -> Result<()> {
        if self.state(id) != PipelineState::Playing
            || !self.claimed(id).contains(FifoKinds::OUTPUT)
            || !self.fifo.output_start_armed
        {
            return Ok(());
        }
        self.set_start_bit(FifoKinds::OUTPUT)
    }

    /// Start the record FIFO of a Playing pipeline once it is armed, or at
    /// once when host-routed.
    pub(crate) fn start_record_fifo(&mut self, id: PipelineId) -> Result<()> {
        if self.state(id) != PipelineState::Playing
            || !self.claimed(id).contains(FifoKinds::RECORD)
            || !(self.fifo.record_host_routed || self.fifo.record_start_armed)
        {
            return Ok(());
        }
        self.set_start_bit(FifoKinds::RECORD)
    }

    // ── Routing ────────────────────────────────────────────────────────

    /// Route the input or record FIFO to its port or to host polling.
    pub fn select_fifo_routing(&mut self, kind: FifoKind, route: FifoRoute) -> Result<()> {
        if !matches!(kind, FifoKind::Input | FifoKind::Record) {
            return Err(CdspError::Argument("only input and record FIFOs are host-routable"));
        }
        self.require_initialized()?;
        if self.playing_owner(kind.bit()).is_some() {
            return Err(CdspError::State("FIFO in use by a playing pipeline"));
        }
        let host = route == FifoRoute::Host;
        let connections = [self.connection(PipelineId::Decode), self.connection(PipelineId::Encode)];
        if kind == FifoKind::Record && record_coupling_conflict(&connections, host) {
            return Err(CdspError::Argument("coupled pipeline cannot use host-routed record FIFO"));
        }

        match kind {
            FifoKind::Input => self.fifo.input_host_routed = host,
            _ => self.fifo.record_host_routed = host,
        }
        let bit = kind.bit().bits();
        self.fifo.host_sel = if host {
            self.fifo.host_sel | bit
        } else {
            self.fifo.host_sel & !bit
        };
        self.bus.write(regs::FIFO_HOST_SEL, self.fifo.host_sel);
        self.bus.execute()?;
        debug!("{:?} FIFO routed to {:?}", kind, route);
        Ok(())
    }

    // ── Host I/O ───────────────────────────────────────────────────────

    /// Write up to `data.len()` bytes into the host-routed input FIFO.
    /// Returns how many bytes the FIFO accepted.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
        self.require_initialized()?;
        if !self.fifo.input_host_routed {
            return Err(CdspError::State("input FIFO is not host-routed"));
        }
        let room = transport::read_be(&mut self.bus, [regs::IFIFO_REMAIN_H, regs::IFIFO_REMAIN_L])? as usize;
        let count = data.len().min(room);
        self.bus.write_burst(regs::IFIFO_DATA, &data[..count]);
        if self.playing_owner(FifoKinds::INPUT).is_some() {
            self.arm_input_fifo();
        }
        self.bus.execute()?;
        self.fifo.input_write_size = self.fifo.input_write_size.wrapping_add(count as u32);
        trace!("wrote {} of {} bytes to the input FIFO", count, data.len());
        Ok(count)
    }

    /// Read up to `buf.len()` bytes from the host-routed record FIFO.
    /// Returns how many bytes were read.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.require_initialized()?;
        if !self.fifo.record_host_routed {
            return Err(CdspError::State("record FIFO is not host-routed"));
        }
        let available = transport::read_be(&mut self.bus, [regs::RFIFO_REMAIN_H, regs::RFIFO_REMAIN_L])? as usize;
        let count = buf.len().min(available);
        for byte in buf[..count].iter_mut() {
            *byte = self.bus.read(regs::RFIFO_DATA)?;
        }
        if self.playing_owner(FifoKinds::RECORD).is_some() {
            self.arm_record_fifo(0);
            self.bus.execute()?;
        }
        trace!("read {} bytes from the record FIFO", count);
        Ok(count)
    }

    // ── Blob chunks ────────────────────────────────────────────────────

    /// Checks a FIFO chunk for pipeline `id` needs before anything changes.
    pub(crate) fn check_fifo_chunk(&self, id: PipelineId, chunk: &FifoChunk) -> Result<()> {
        let kinds = fifo::claimed_kinds(chunk.connection);
        let ch = chunk.channels;
        if kinds.contains(FifoKinds::OUTPUT) {
            fifo::trigger_point(chunk.output_depth, ch.output_channels, ch.output_bit_width)?;
        }
        if kinds.contains(FifoKinds::RECORD) {
            fifo::trigger_point(chunk.record_depth, ch.output_channels, ch.output_bit_width)?;
        }
        // The input/record selector is shared by both FIFOs.
        let sibling = id.other();
        if kinds.intersects(FifoKinds::INPUT | FifoKinds::RECORD)
            && self.state(sibling) == PipelineState::Playing
            && self.claimed(sibling).intersects(FifoKinds::INPUT | FifoKinds::RECORD)
        {
            return Err(CdspError::State("input/record selector in use by a playing pipeline"));
        }
        Ok(())
    }

    /// Checks an extension chunk for pipeline `id` needs before anything
    /// changes.
    pub(crate) fn check_extension_chunk(&self, id: PipelineId) -> Result<()> {
        match self.playing_owner(FifoKinds::EXTERNAL) {
            Some(owner) if owner != id => Err(CdspError::State("external FIFO in use by a playing pipeline")),
            _ => Ok(()),
        }
    }

    pub(crate) fn apply_fifo_chunk(&mut self, id: PipelineId, chunk: &FifoChunk) -> Result<()> {
        if !matches!(self.state(id), PipelineState::ReadySetup | PipelineState::Ready) {
            return Err(CdspError::State("pipeline cannot be reconfigured now"));
        }
        self.check_fifo_chunk(id, chunk)?;
        self.configure_connection(id, chunk.connection, chunk.channels)?;

        let kinds = self.claimed(id);
        if kinds.contains(FifoKinds::INPUT) {
            self.fifo.input_point = chunk.input_point;
        }
        if kinds.contains(FifoKinds::OUTPUT) {
            self.fifo.output_depth = chunk.output_depth;
            self.fifo.output_mix = chunk.output_mix;
            for (addr, value) in [regs::FIFO_MIX0, regs::FIFO_MIX1, regs::FIFO_MIX2]
                .into_iter()
                .zip(chunk.output_mix)
            {
                self.bus.write(addr, value);
            }
        }
        if kinds.contains(FifoKinds::RECORD) {
            self.fifo.record_point = chunk.record_point;
            self.fifo.record_depth = chunk.record_depth;
        }
        if kinds.intersects(FifoKinds::INPUT | FifoKinds::RECORD) {
            self.fifo.input_record_sel = chunk.input_record_sel;
            self.bus.write(regs::FIFO_IN_REC_SEL, chunk.input_record_sel);
        }
        self.bus.execute()?;
        Ok(())
    }

    pub(crate) fn apply_extension_chunk(&mut self, id: PipelineId, ext: &ExtensionChunk) -> Result<()> {
        let state = self.state(id);
        if !matches!(state, PipelineState::ReadySetup | PipelineState::Ready) {
            return Err(CdspError::State("pipeline cannot be reconfigured now"));
        }
        self.check_extension_chunk(id)?;
        self.pipe_mut(id).timer_enabled = ext.timer_enabled;

        self.fifo.efifo_sink = ext.efifo_sink;
        self.bus.write(regs::EFIFO_SINK0, ext.efifo_sink[0]);
        self.bus.write(regs::EFIFO_SINK1, ext.efifo_sink[1]);
        self.bus.execute()?;

        let current = self.pipe(id).format;
        let rate = ext.rate.unwrap_or(current.rate);
        let dual_mono = ext.dual_mono.unwrap_or(current.dual_mono);
        if rate != current.rate || dual_mono != current.dual_mono {
            if state == PipelineState::Ready {
                self.reset_pipeline(id)?;
            }
            self.set_format(id, rate, dual_mono)?;
        }
        Ok(())
    }
}
