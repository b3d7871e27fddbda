//! Pipeline lifecycle: program load, connection, format, start and stop.
//!
//! ```text
//! NotInit ──initialize──▶ Init ──load_program──▶ ReadySetup
//!                                                  │  ▲
//!                                     start (setup)│  │reset
//!                                                  ▼  │
//!                             Playing ◀──start── Ready
//!                                │                  ▲
//!                                └──────stop────────┘
//! ```

use log::{debug, info, warn};

use super::Cdsp;
use crate::error::{CdspError, Result};
use crate::event::PipelineIrq;
use crate::fifo::{self, FifoKinds};
use crate::firmware::{OutStartMode, ProgramImage};
use crate::pipeline::{
    ChannelConfig, Connection, DualMonoMode, Format, Pipeline, PipelineId, PipelineState, RateCode,
};
use crate::protocol::{self, Command, NOTIFY_OUTPUT_FORMAT_CHANGE};
use crate::regs::{self, CTL_POS_RESET, CTL_START};
use crate::transport::{self, RegisterTransport};

fn program_info_args(image: &ProgramImage<'_>) -> [u8; 16] {
    let h = &image.header;
    let words = [
        h.entry_addr,
        h.layout.work.start,
        h.layout.work.size,
        h.layout.stack.start,
        h.layout.stack.size,
        h.out_start_mode as u16,
        h.resource_flag,
        h.max_load,
    ];
    let mut args = [0u8; 16];
    for (chunk, word) in args.chunks_exact_mut(2).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    args
}

fn connection_args(connection: &Connection, channels: &ChannelConfig) -> [u8; 6] {
    [
        connection.input as u8,
        connection.output as u8,
        channels.input_channels,
        channels.input_bit_width,
        channels.output_channels,
        channels.output_bit_width,
    ]
}

impl<T: RegisterTransport> Cdsp<T> {
    // ── Program load ───────────────────────────────────────────────────

    /// Validate and load a program descriptor onto pipeline `id`.
    ///
    /// Reloading the resident program while it is ReadySetup or Ready is a
    /// no-op.
    pub fn load_program(&mut self, id: PipelineId, descriptor: &[u8]) -> Result<()> {
        let image = ProgramImage::parse(descriptor, id)?;
        self.load_image(id, &image)
    }

    pub(crate) fn load_image(&mut self, id: PipelineId, image: &ProgramImage<'_>) -> Result<()> {
        let state = self.state(id);
        if state == PipelineState::NotInit {
            return Err(CdspError::State("coprocessor not initialized"));
        }
        let identity = image.identity();
        let current = self.pipe(id).identity;
        if let Some(current) = current {
            if current.same_program(&identity)
                && matches!(state, PipelineState::ReadySetup | PipelineState::Ready)
            {
                debug!("{:?}: program {:04x}:{:04x} already resident", id, identity.vendor_id, identity.function_id);
                return Ok(());
            }
        }
        if let Some(sibling) = self.pipe(id.other()).identity {
            identity.layout.check_disjoint(&sibling.layout)?;
        }

        if state == PipelineState::Playing {
            self.stop(id)?;
        }
        if current.is_some() {
            self.close(id)?;
        }
        let download = current.map_or(true, |c| !c.same_program(&identity));

        if let Err(err) = self.install(id, image, download) {
            warn!("{:?}: program load failed: {}", id, err);
            self.unwind_load(id);
            return Err(err);
        }
        Ok(())
    }

    fn install(&mut self, id: PipelineId, image: &ProgramImage<'_>, download: bool) -> Result<()> {
        let header = &image.header;
        if download {
            info!(
                "{:?}: downloading program {:04x}:{:04x} ({} + {} bytes)",
                id,
                header.vendor_id,
                header.function_id,
                image.program.len(),
                image.data.len()
            );
            self.queue_download(
                regs::MEM_SPACE_PROGRAM,
                header.layout.program.start,
                image.program,
                header.prog_scramble != 0,
            );
            self.queue_download(
                regs::MEM_SPACE_DATA,
                header.layout.data.start,
                image.data,
                header.data_scramble != 0,
            );
            self.bus.execute()?;
        }
        self.pipe_mut(id).identity = Some(image.identity());
        self.command(id, Command::SetProgramInfo, &program_info_args(image))?;
        self.open(id)?;
        self.set_state(id, PipelineState::ReadySetup);
        Ok(())
    }

    /// Terminate whatever a failed load left behind.
    fn unwind_load(&mut self, id: PipelineId) {
        if let Err(err) = self.command(id, Command::Terminate, &[]) {
            warn!("{:?}: terminate during unwind failed: {}", id, err);
        }
        let pipe = self.pipe_mut(id);
        pipe.identity = None;
        pipe.irq_enable = 0;
        pipe.ctl = 0;
        self.bus.write(id.regs().irq_enable(), 0);
        self.bus.write(id.regs().ctl(), 0);
        if let Err(err) = self.bus.execute() {
            warn!("{:?}: disarm during unwind failed: {}", id, err);
        }
        self.set_state(id, PipelineState::Init);
    }

    /// Arm notifications, reset the position counters, read the program
    /// version and reapply the last connection.
    fn open(&mut self, id: PipelineId) -> Result<()> {
        let g = id.regs();
        let enable = PipelineIrq::SFR.bits();
        self.bus.write(g.irq_enable(), enable);
        self.bus.write(g.ctl(), CTL_POS_RESET);
        self.bus.write(g.ctl(), 0);
        self.bus.execute()?;
        let version = transport::read_be(&mut self.bus, [g.version_h(), g.version_l()])? as u16;

        let pipe = self.pipe_mut(id);
        pipe.irq_enable = enable;
        pipe.ctl = 0;
        pipe.version = version;
        pipe.position_supplement_ms = 0;
        let connection = pipe.connection;
        let channels = pipe.channels;
        debug!("{:?}: program version {:04x}", id, version);

        if connection != Connection::default() {
            self.command(id, Command::SetConnection, &connection_args(&connection, &channels))?;
        }
        Ok(())
    }

    /// Release the running program: answer a held format notification, reset
    /// the program and disarm its interrupts.
    fn close(&mut self, id: PipelineId) -> Result<()> {
        if self.pipe(id).deferred_format.is_some() {
            self.acknowledge_format(id)?;
        }
        self.command(id, Command::Reset, &[])?;
        let g = id.regs();
        self.bus.write(g.irq_enable(), 0);
        self.bus.write(g.ctl(), 0);
        self.bus.execute()?;
        let pipe = self.pipe_mut(id);
        pipe.irq_enable = 0;
        pipe.ctl = 0;
        Ok(())
    }

    pub(crate) fn acknowledge_format(&mut self, id: PipelineId) -> Result<()> {
        protocol::acknowledge_notification(&mut self.bus, id, NOTIFY_OUTPUT_FORMAT_CHANGE, &[])?;
        self.pipe_mut(id).deferred_format = None;
        Ok(())
    }

    // ── Connection and format ──────────────────────────────────────────

    /// Route pipeline `id` and set its channel layout.
    ///
    /// Only FIFO kinds whose membership changes are reset, and never those
    /// the sibling claims.
    pub fn configure_connection(
        &mut self,
        id: PipelineId,
        connection: Connection,
        channels: ChannelConfig,
    ) -> Result<()> {
        let pipe = self.pipe(id);
        if pipe.connection == connection && pipe.channels == channels {
            return Ok(());
        }
        channels.validate()?;
        let state = pipe.state;
        if !matches!(state, PipelineState::ReadySetup | PipelineState::Ready) {
            return Err(CdspError::State("connection can only change when stopped"));
        }

        let old_kinds = fifo::claimed_kinds(pipe.connection);
        let new_kinds = fifo::claimed_kinds(connection);
        let sibling = id.other();
        let sibling_kinds = self.claimed(sibling);
        if new_kinds.intersects(sibling_kinds) {
            return Err(CdspError::ResourceOverlap("FIFO already claimed by sibling"));
        }
        let mut connections = [self.connection(PipelineId::Decode), self.connection(PipelineId::Encode)];
        connections[id.index()] = connection;
        if super::fifo_ops::record_coupling_conflict(&connections, self.fifo.record_host_routed) {
            return Err(CdspError::Argument("coupled pipeline cannot use host-routed record FIFO"));
        }
        let kept = fifo::clear_channel_bits(self.fifo.channel_bits, old_kinds - new_kinds);
        let routing = fifo::channel_bits(kept, new_kinds, &channels)?;

        if state == PipelineState::Ready {
            self.reset_pipeline(id)?;
        }
        self.command(id, Command::SetConnection, &connection_args(&connection, &channels))?;
        let pipe = self.pipe_mut(id);
        pipe.connection = connection;
        pipe.channels = channels;

        let changed = (old_kinds ^ new_kinds) - sibling_kinds;
        self.pulse_fifo_reset(changed)?;
        self.route_channel_bits(routing)?;
        debug!("{:?}: connected {:?} -> {:?}", id, connection.input, connection.output);
        Ok(())
    }

    /// Set the sample format. ReadySetup only.
    pub fn set_format(&mut self, id: PipelineId, rate: RateCode, dual_mono: DualMonoMode) -> Result<()> {
        if self.state(id) != PipelineState::ReadySetup {
            return Err(CdspError::State("format can only change in ReadySetup"));
        }
        self.command(id, Command::SetFormat, &[rate as u8, dual_mono as u8])?;
        self.pipe_mut(id).format = Format { rate, dual_mono };
        debug!("{:?}: format {} Hz {:?}", id, rate.hz(), dual_mono);
        Ok(())
    }

    /// Drop a Ready pipeline back to ReadySetup and clear its positions.
    pub(crate) fn reset_pipeline(&mut self, id: PipelineId) -> Result<()> {
        self.command(id, Command::Reset, &[])?;
        let ctl = self.pipe(id).ctl;
        self.bus.write(id.regs().ctl(), ctl | CTL_POS_RESET);
        self.bus.write(id.regs().ctl(), ctl);
        self.bus.execute()?;
        let pipe = self.pipe_mut(id);
        pipe.position_supplement_ms = 0;
        pipe.input_data_end_requested = false;
        pipe.input_data_end_active = false;
        self.set_state(id, PipelineState::ReadySetup);
        Ok(())
    }

    // ── Start / stop ───────────────────────────────────────────────────

    /// Start pipeline `id`, running the setup step first when in ReadySetup.
    pub fn start(&mut self, id: PipelineId) -> Result<()> {
        let state = self.state(id);
        if !matches!(state, PipelineState::ReadySetup | PipelineState::Ready) {
            return Err(CdspError::State("start requires ReadySetup or Ready"));
        }
        if self.pipe(id).connection.is_coupled()
            && !matches!(
                self.state(id.other()),
                PipelineState::ReadySetup | PipelineState::Ready | PipelineState::Playing
            )
        {
            return Err(CdspError::State("coupled pipeline is not configured"));
        }
        let points = self.trigger_points(id)?;
        if state == PipelineState::ReadySetup {
            self.start_setup(id)?;
        }
        self.start_data(id, points)
    }

    /// Output and record FIFO trigger points for pipeline `id`.
    fn trigger_points(&self, id: PipelineId) -> Result<(u16, u16)> {
        let channels = self.pipe(id).channels;
        Ok((
            fifo::trigger_point(self.fifo.output_depth, channels.output_channels, channels.output_bit_width)?,
            fifo::trigger_point(self.fifo.record_depth, channels.output_channels, channels.output_bit_width)?,
        ))
    }

    /// ReadySetup → Ready.
    fn start_setup(&mut self, id: PipelineId) -> Result<()> {
        self.command(id, Command::Standby, &[])?;
        self.reset_fifo(id, FifoKinds::all())?;
        if self.pipe(id).input_data_end_requested {
            let flag = self.fifo.record_host_routed as u8;
            self.command(id, Command::InputDataEnd, &[flag])?;
            let pipe = self.pipe_mut(id);
            pipe.input_data_end_requested = false;
            pipe.input_data_end_active = true;
            self.fifo.output_start_armed = true;
            self.fifo.record_start_armed = true;
        }
        self.set_state(id, PipelineState::Ready);
        Ok(())
    }

    /// Ready → Playing.
    fn start_data(&mut self, id: PipelineId, (output_point, record_point): (u16, u16)) -> Result<()> {
        let kinds = self.claimed(id);
        let pipe = self.pipe(id);
        let immediate = pipe
            .identity
            .is_some_and(|i| i.out_start_mode == OutStartMode::Immediate);
        let timer = pipe.timer_enabled;

        self.reset_fifo(id, FifoKinds::INPUT | FifoKinds::EXTERNAL)?;
        if kinds.contains(FifoKinds::OUTPUT) {
            if immediate {
                self.fifo.output_start_armed = true;
            }
            self.arm_output_fifo(output_point);
        }
        if kinds.contains(FifoKinds::RECORD) {
            self.arm_record_fifo(record_point);
        }
        if kinds.contains(FifoKinds::INPUT) && self.fifo.input_host_routed {
            self.arm_input_fifo();
        }

        let mut enable = PipelineIrq::SFR | PipelineIrq::ERROR | PipelineIrq::END;
        if timer {
            enable |= PipelineIrq::EVENT;
        }
        let ctl = self.pipe(id).ctl | CTL_START;
        self.bus.write(id.regs().irq_enable(), enable.bits());
        self.bus.write(id.regs().ctl(), ctl);
        self.bus.execute()?;
        let pipe = self.pipe_mut(id);
        pipe.irq_enable = enable.bits();
        pipe.ctl = ctl;
        self.set_state(id, PipelineState::Playing);

        self.start_output_fifo(id)?;
        self.start_record_fifo(id)
    }

    /// Stop a Playing pipeline. Stopping a Ready pipeline is a no-op.
    ///
    /// The hardware is quiesced and the pipeline returns to Ready whatever
    /// the program answers to the stop verification.
    pub fn stop(&mut self, id: PipelineId) -> Result<()> {
        match self.state(id) {
            PipelineState::Ready => return Ok(()),
            PipelineState::Playing => {}
            _ => return Err(CdspError::State("pipeline is not playing")),
        }
        if let Err(err) = protocol::send_command(
            &mut self.bus,
            id,
            Command::VerifyStopCompletion.into(),
            &[],
            self.config.stop_timeout_us,
        ) {
            warn!("{:?}: stop verification failed: {}", id, err);
        }

        let ctl = self.pipe(id).ctl & !CTL_START;
        let enable = PipelineIrq::SFR.bits();
        self.bus.write(id.regs().ctl(), ctl);
        self.bus.write(id.regs().irq_enable(), enable);
        self.disarm_fifos(id);
        self.bus.execute()?;
        let pipe = self.pipe_mut(id);
        pipe.ctl = ctl;
        pipe.irq_enable = enable;
        self.set_state(id, PipelineState::Ready);
        Ok(())
    }

    // ── End of input ───────────────────────────────────────────────────

    /// Mark the end of the host's input stream.
    ///
    /// The program drains what it has and raises End. Output starts are
    /// forced so a stream shorter than the trigger depth still plays. In
    /// ReadySetup the request is held until start.
    pub fn set_input_data_end(&mut self, id: PipelineId) -> Result<()> {
        if !self.pipe(id).connection.uses_input_fifo() {
            return Err(CdspError::State("input FIFO not in use"));
        }
        match self.state(id) {
            PipelineState::ReadySetup => {
                self.pipe_mut(id).input_data_end_requested = true;
                Ok(())
            }
            state @ (PipelineState::Ready | PipelineState::Playing) => {
                if self.pipe(id).input_data_end_active {
                    return Ok(());
                }
                let flag = self.fifo.record_host_routed as u8;
                self.command(id, Command::InputDataEnd, &[flag])?;
                let pipe = self.pipe_mut(id);
                pipe.input_data_end_requested = false;
                pipe.input_data_end_active = true;
                self.fifo.output_start_armed = true;
                self.fifo.record_start_armed = true;
                if state == PipelineState::Playing {
                    self.start_output_fifo(id)?;
                    self.start_record_fifo(id)?;
                }
                Ok(())
            }
            _ => Err(CdspError::State("no program loaded")),
        }
    }

    pub fn clear_input_data_end(&mut self, id: PipelineId) -> Result<()> {
        if !self.pipe(id).connection.uses_input_fifo() {
            return Err(CdspError::State("input FIFO not in use"));
        }
        match self.state(id) {
            PipelineState::ReadySetup => {}
            PipelineState::Ready | PipelineState::Playing => {
                self.command(id, Command::ClearInputDataEnd, &[])?;
            }
            _ => return Err(CdspError::State("no program loaded")),
        }
        let pipe = self.pipe_mut(id);
        pipe.input_data_end_requested = false;
        pipe.input_data_end_active = false;
        Ok(())
    }

    // ── Terminate ──────────────────────────────────────────────────────

    /// Unload the program on `id` and return it to Init.
    pub fn terminate_pipeline(&mut self, id: PipelineId) -> Result<()> {
        let state = self.state(id);
        match state {
            PipelineState::NotInit => return Err(CdspError::State("coprocessor not initialized")),
            PipelineState::Init => return Ok(()),
            PipelineState::Playing => self.stop(id)?,
            _ => {}
        }
        self.close(id)?;
        match self.command(id, Command::Terminate, &[]) {
            Ok(_) => {}
            Err(CdspError::Timeout) => warn!("{:?}: terminate timed out", id),
            Err(err) => return Err(err),
        }

        let kinds = self.claimed(id);
        self.pulse_fifo_reset(kinds)?;
        self.route_channel_bits(fifo::clear_channel_bits(self.fifo.channel_bits, kinds))?;
        if kinds.contains(FifoKinds::OUTPUT) {
            self.fifo.output_start_armed = false;
        }
        if kinds.contains(FifoKinds::RECORD) {
            self.fifo.record_start_armed = false;
        }

        *self.pipe_mut(id) = Pipeline::new(PipelineState::Init);
        info!("{:?}: program terminated", id);
        Ok(())
    }
}
