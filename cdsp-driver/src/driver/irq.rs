//! Interrupt dispatch and callback delivery.
//!
//! [`Cdsp::handle_interrupt`] runs once per assertion of the codec interrupt
//! line. It reads the top-level flags, services each pending source in a
//! fixed order (a fatal condition masks the rest), clears what it serviced
//! and finally invokes the registered callbacks with everything collected.

use log::{debug, error, trace, warn};

use super::Cdsp;
use crate::constants::{COMMAND_ARG_BYTES, PROGRAM_ERROR_MAX};
use crate::error::{CdspError, Result};
use crate::event::{
    self, EventFlags, EventInfo, EventKind, FatalCode, InputFifoIrq, IrqEvent, IrqSources,
    OutputFifoIrq, RecordFifoIrq,
};
use crate::fifo::{FifoConfig, FifoKinds};
use crate::pipeline::{
    DualMonoMode, Format, InputSource, OutputDestination, PendingCommand, Pipeline, PipelineId,
    PipelineState, RateCode,
};
use crate::protocol::{self, Command, NOTIFY_OUTPUT_FORMAT_CHANGE};
use crate::regs::{self, CMD_COMPLETION};
use crate::transport::RegisterTransport;

impl<T: RegisterTransport> Cdsp<T> {
    /// Service every pending interrupt source, then deliver callbacks.
    ///
    /// Failures inside one source are logged and do not stop the others.
    /// Does nothing before [`initialize`](Self::initialize).
    pub fn handle_interrupt(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        let flags = self.bus.read(regs::IRQ_FLAG)?;
        trace!("IRQ flags {:02x}", flags);

        for source in event::pending_sources(flags) {
            if let Err(err) = self.service(source) {
                error!("{:?} interrupt: {}", source, err);
            }
            let clear = if source == IrqSources::FATAL { 0xFF } else { source.bits() };
            self.bus.write(regs::IRQ_FLAG, clear);
            self.bus.execute()?;
        }

        self.deliver_callbacks();
        Ok(())
    }

    fn service(&mut self, source: IrqSources) -> Result<()> {
        if source == IrqSources::FATAL {
            self.handle_fatal();
            return Ok(());
        }
        if let Some(id) = PipelineId::ALL.into_iter().find(|id| id.irq_source() == source) {
            let addr = id.regs().irq_flag();
            let flags = self.bus.read(addr)?;
            self.bus.write(addr, flags);
            self.bus.execute()?;
            // Flags latch whether or not their source is enabled.
            let enabled = flags & self.pipe(id).irq_enable;
            for event in event::decode_pipeline(id, enabled) {
                if let Err(err) = self.dispatch(event) {
                    error!("{:?}: {:?} failed: {}", id, event, err);
                }
            }
            return Ok(());
        }

        let addr = if source == IrqSources::INPUT_FIFO {
            regs::IFIFO_FLAG
        } else if source == IrqSources::OUTPUT_FIFO {
            regs::OFIFO_FLAG
        } else {
            regs::RFIFO_FLAG
        };
        let flags = self.bus.read(addr)?;
        self.bus.write(addr, flags);
        self.bus.execute()?;
        match event::decode_fifo(source, flags) {
            Some(event) => self.dispatch(event),
            None => Ok(()),
        }
    }

    fn dispatch(&mut self, event: IrqEvent) -> Result<()> {
        match event {
            IrqEvent::Notification(id) => self.on_notification(id),
            IrqEvent::ProgramError(id) => self.on_program_error(id),
            IrqEvent::EndOfData(id) => self.on_end(id),
            IrqEvent::Timer(id) => {
                self.mark(id, EventFlags::TIMER);
                Ok(())
            }
            IrqEvent::InputFifo { point, empty } => self.on_input_fifo(point, empty),
            IrqEvent::OutputFifoPoint => self.on_output_point(),
            IrqEvent::RecordFifo { point, overflow } => self.on_record_fifo(point, overflow),
            IrqEvent::Fatal => {
                self.handle_fatal();
                Ok(())
            }
        }
    }

    fn mark(&mut self, id: PipelineId, events: EventFlags) {
        self.pipe_mut(id).events |= events;
    }

    // ── Pipeline events ────────────────────────────────────────────────

    fn on_notification(&mut self, id: PipelineId) -> Result<()> {
        let Some(notification) = protocol::receive_notification(&mut self.bus, id)? else {
            warn!("{:?}: SFR raised with no notification posted", id);
            return Ok(());
        };
        if notification.id == NOTIFY_OUTPUT_FORMAT_CHANGE {
            return self.on_format_change(id, &notification.args);
        }
        self.pipe_mut(id).pending = PendingCommand {
            id: notification.id,
            args: notification.args,
            results: [0; COMMAND_ARG_BYTES],
        };
        self.mark(id, EventFlags::HOST_COMMAND);
        Ok(())
    }

    /// The program on `up` announced a new output format.
    ///
    /// A coupled Playing sibling is drained first: its End interrupt finishes
    /// the handoff. A stopped sibling adopts the format at once.
    fn on_format_change(&mut self, up: PipelineId, args: &[u8; COMMAND_ARG_BYTES]) -> Result<()> {
        let parsed = (RateCode::try_from(args[0]), DualMonoMode::try_from(args[1]));
        let (Ok(rate), Ok(dual_mono)) = parsed else {
            warn!("{:?}: bad output format {:02x?}", up, &args[..2]);
            protocol::acknowledge_notification(&mut self.bus, up, NOTIFY_OUTPUT_FORMAT_CHANGE, &[])?;
            return Err(CdspError::Argument("unknown output format"));
        };
        let format = Format { rate, dual_mono };
        let down = up.other();
        let coupled = self.connection(up).output == OutputDestination::OtherPipelineInput
            || self.connection(down).input == InputSource::OtherPipelineOutput;
        debug!("{:?}: output format {} Hz {:?}", up, rate.hz(), dual_mono);

        if !coupled {
            self.pipe_mut(up).format = format;
            return self.acknowledge_format(up);
        }

        self.pipe_mut(up).deferred_format = Some(format);
        if self.state(down) == PipelineState::Playing {
            self.pipe_mut(down).format_propagation_active = true;
            self.fifo.output_start_armed = true;
            self.fifo.record_start_armed = true;
            self.start_output_fifo(down)?;
            self.start_record_fifo(down)?;
            let flag = self.fifo.record_host_routed as u8;
            self.command(down, Command::InputDataEnd, &[flag])?;
            self.pipe_mut(down).input_data_end_active = true;
            return Ok(());
        }

        let applied = self.adopt_format(down, format);
        self.acknowledge_format(up)?;
        applied
    }

    fn adopt_format(&mut self, id: PipelineId, format: Format) -> Result<()> {
        match self.state(id) {
            PipelineState::Ready => self.reset_pipeline(id)?,
            PipelineState::ReadySetup => {}
            _ => return Ok(()),
        }
        self.set_format(id, format.rate, format.dual_mono)
    }

    /// Drain `down`, restart it in the sibling's new format and release the
    /// sibling's held notification.
    fn finish_format_propagation(&mut self, down: PipelineId) -> Result<()> {
        let up = down.other();
        let kinds = self.claimed(down);
        for (kind, status) in [
            (FifoKinds::OUTPUT, regs::OFIFO_STATUS),
            (FifoKinds::RECORD, regs::RFIFO_STATUS),
        ] {
            if !kinds.contains(kind) {
                continue;
            }
            let mut polls = 0;
            while self.bus.read(status)? & regs::FIFO_STATUS_EMPTY == 0 {
                polls += 1;
                if polls >= self.config.drain_poll_limit {
                    warn!("{:?}: {:?} FIFO did not drain", down, kind);
                    break;
                }
            }
        }

        self.stop(down)?;
        let played = self.read_position(down, true)?;
        let supplement = self.pipe(down).position_supplement_ms.wrapping_add(played);
        self.reset_pipeline(down)?;
        self.pipe_mut(down).position_supplement_ms = supplement;

        let format = self.pipe(up).deferred_format.unwrap_or(self.pipe(down).format);
        self.set_format(down, format.rate, format.dual_mono)?;
        self.acknowledge_format(up)?;
        self.pipe_mut(down).format_propagation_active = false;
        debug!("{:?}: restarting at {} Hz", down, format.rate.hz());
        self.start(down)
    }

    fn on_end(&mut self, id: PipelineId) -> Result<()> {
        if self.pipe(id).format_propagation_active {
            return self.finish_format_propagation(id);
        }
        let state = self.state(id);
        if matches!(state, PipelineState::Ready | PipelineState::Playing) {
            self.command(id, Command::ClearInputDataEnd, &[])?;
        }
        let pipe = self.pipe_mut(id);
        pipe.input_data_end_requested = false;
        pipe.input_data_end_active = false;
        if state == PipelineState::Playing {
            self.stop(id)?;
        }
        self.mark(id, EventFlags::END_OF_SEQUENCE);
        Ok(())
    }

    fn on_program_error(&mut self, id: PipelineId) -> Result<()> {
        let code = self.bus.read(id.regs().err_code())?;
        let position = self.read_position(id, false)?;
        self.pipe_mut(id).error_code = code;
        warn!("{:?}: program error 0x{:02x} at {} ms", id, code, position);

        if self.state(id) == PipelineState::Playing {
            if let Err(err) = self.stop(id) {
                warn!("{:?}: stop after error failed: {}", id, err);
            }
        }

        let flag = if code > PROGRAM_ERROR_MAX {
            let g = id.regs();
            self.bus.write(g.host_cmd(), CMD_COMPLETION);
            self.bus.write(g.irq_enable(), 0);
            self.bus.execute()?;
            let pipe = self.pipe_mut(id);
            pipe.deferred_format = None;
            pipe.format_propagation_active = false;
            pipe.pending = PendingCommand::default();
            pipe.irq_enable = 0;
            pipe.identity = None;
            if pipe.state > PipelineState::ReadySetup {
                self.set_state(id, PipelineState::ReadySetup);
            }
            EventFlags::ERROR2
        } else {
            EventFlags::ERROR1
        };

        let pipe = self.pipe_mut(id);
        pipe.error_info = EventInfo {
            position,
            code: code as u32,
        };
        pipe.events |= flag;
        Ok(())
    }

    // ── FIFO events ────────────────────────────────────────────────────

    fn on_input_fifo(&mut self, point: bool, empty: bool) -> Result<()> {
        let mut fired = InputFifoIrq::empty();
        let mut events = EventFlags::empty();
        if point {
            fired |= InputFifoIrq::POINT;
            events |= EventFlags::FIFO_POINT;
        }
        if empty {
            fired |= InputFifoIrq::EMPTY;
            events |= EventFlags::FIFO_EMPTY;
        }
        self.fifo.ififo_enable &= !fired.bits();
        self.bus.write(regs::IFIFO_ENABLE, self.fifo.ififo_enable);
        self.bus.execute()?;
        if let Some(owner) = self.owner_of(FifoKinds::INPUT) {
            self.mark(owner, events);
        }
        Ok(())
    }

    fn on_output_point(&mut self) -> Result<()> {
        self.fifo.ofifo_enable &= !OutputFifoIrq::POINT.bits();
        self.bus.write(regs::OFIFO_ENABLE, self.fifo.ofifo_enable);
        self.bus.execute()?;
        self.fifo.output_start_armed = true;
        match self.owner_of(FifoKinds::OUTPUT) {
            Some(owner) => self.start_output_fifo(owner),
            None => Ok(()),
        }
    }

    fn on_record_fifo(&mut self, point: bool, overflow: bool) -> Result<()> {
        let mut fired = RecordFifoIrq::empty();
        if point {
            fired |= RecordFifoIrq::POINT;
        }
        if overflow {
            fired |= RecordFifoIrq::OVERFLOW;
        }
        self.fifo.rfifo_enable &= !fired.bits();
        self.bus.write(regs::RFIFO_ENABLE, self.fifo.rfifo_enable);
        self.bus.execute()?;

        let Some(owner) = self.owner_of(FifoKinds::RECORD) else {
            return Ok(());
        };
        if self.fifo.record_host_routed {
            let mut events = EventFlags::empty();
            if point {
                events |= EventFlags::RECORD_FIFO_POINT;
            }
            if overflow {
                events |= EventFlags::RECORD_BUFFER_OVERFLOW;
            }
            self.mark(owner, events);
            Ok(())
        } else if point {
            self.fifo.record_start_armed = true;
            self.start_record_fifo(owner)
        } else {
            Ok(())
        }
    }

    // ── Fatal ──────────────────────────────────────────────────────────

    fn handle_fatal(&mut self) {
        let code = self
            .bus
            .read(regs::CDSP_ERR)
            .map_or(FatalCode::Unknown, FatalCode::from);
        error!("coprocessor fatal error: {:?}", code);

        for id in PipelineId::ALL {
            self.bus.write(id.regs().irq_enable(), 0);
            self.bus.write(id.regs().ctl(), 0);
        }
        for addr in [regs::IFIFO_ENABLE, regs::OFIFO_ENABLE, regs::RFIFO_ENABLE, regs::FIFO_START] {
            self.bus.write(addr, 0);
        }
        self.bus.write(regs::IRQ_ENABLE, IrqSources::FATAL.bits());
        if let Err(err) = self.bus.execute() {
            error!("disarming after fatal error failed: {}", err);
        }

        self.hw_error = code;
        let info = EventInfo {
            position: 0,
            code: u8::from(code) as u32,
        };
        for pipe in self.pipelines.iter_mut() {
            let events = pipe.events;
            *pipe = Pipeline::new(PipelineState::NotInit);
            pipe.events = events | EventFlags::HW_ERROR;
            pipe.error_info = info;
        }
        self.fifo = FifoConfig::default();
        self.initialized = false;
    }

    // ── Callbacks ──────────────────────────────────────────────────────

    fn deliver_callbacks(&mut self) {
        for id in PipelineId::ALL {
            let pipe = &mut self.pipelines[id.index()];
            let events = core::mem::take(&mut pipe.events);
            let error_info = pipe.error_info;
            if events.is_empty() {
                continue;
            }
            let Some(callback) = self.callbacks[id.index()].as_mut() else {
                debug!("{:?}: dropping {:?}, no callback registered", id, events);
                continue;
            };
            for kind in events.kinds() {
                let info = match kind {
                    EventKind::Error1 | EventKind::Error2 | EventKind::HwError => error_info,
                    _ => EventInfo::default(),
                };
                callback(id, kind, info);
            }
        }
    }
}
