//! The owning driver context.
//!
//! [`Cdsp`] holds the register transport, both pipeline records, the shared
//! FIFO configuration and the registered callbacks. Operations are split by
//! concern:
//!
//! - this module: initialisation, configuration blobs, parameters, status
//! - [`lifecycle`]: per-pipeline program load, connection and start/stop
//! - [`fifo_ops`]: FIFO reset, start sequencing, routing and host I/O
//! - [`irq`]: interrupt dispatch and callback delivery

mod fifo_ops;
mod irq;
mod lifecycle;

#[cfg(test)]
mod integration_tests;

use alloc::boxed::Box;

use log::{debug, error, info, warn};

use crate::constants::{
    COMMAND_ARG_BYTES, DEFAULT_BOOT_TIMEOUT_US, DEFAULT_COMMAND_TIMEOUT_US, DEFAULT_DRAIN_POLL_LIMIT,
    DEFAULT_STOP_TIMEOUT_US,
};
use crate::error::{CdspError, HardwareSeverity, Result};
use crate::event::{EventInfo, EventKind, FatalCode, IrqSources};
use crate::fifo::{self, FifoConfig, FifoKinds};
use crate::firmware::{OsImage, ParamList, ParameterBlob, ProgramIdentity};
use crate::pipeline::{Connection, Format, PendingCommand, Pipeline, PipelineId, PipelineState, RateCode};
use crate::protocol::{self, Command, USER_COMMAND_MIN};
use crate::regs::{self, CMD_COMPLETION};
use crate::transport::{self, RegisterTransport, TransportError};

/// Receives pipeline events from [`Cdsp::handle_interrupt`].
///
/// Error events carry the output position (ms) and error code in
/// [`EventInfo`]; every other event carries zeros.
pub type Callback = Box<dyn FnMut(PipelineId, EventKind, EventInfo)>;

/// Timeouts and polling limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Bound on one command round trip.
    pub command_timeout_us: u32,
    /// Bound on the stop-verification command. Expiry is logged, not fatal.
    pub stop_timeout_us: u32,
    /// Bound on the resident program's boot after download.
    pub boot_timeout_us: u32,
    /// Status reads allowed while waiting for a FIFO to drain.
    pub drain_poll_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_timeout_us: DEFAULT_COMMAND_TIMEOUT_US,
            stop_timeout_us: DEFAULT_STOP_TIMEOUT_US,
            boot_timeout_us: DEFAULT_BOOT_TIMEOUT_US,
            drain_poll_limit: DEFAULT_DRAIN_POLL_LIMIT,
        }
    }
}

/// Values available through [`Cdsp::query_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// Input position in milliseconds.
    InputPosition(PipelineId),
    /// Output position in milliseconds.
    OutputPosition(PipelineId),
    /// Free bytes in the input FIFO.
    InputFifoRemaining,
    /// Bytes waiting in the record FIFO.
    RecordFifoRemaining,
    /// Latched coprocessor fatal code.
    FatalCode,
    /// Last program error code.
    ErrorCode(PipelineId),
    /// Program version read at open.
    Version(PipelineId),
}

/// Convert a sample count to milliseconds, rounding the partial second up.
pub(crate) fn samples_to_ms(samples: u32, rate_hz: u32) -> u32 {
    let whole = (samples / rate_hz).wrapping_mul(1000);
    let part = ((samples % rate_hz) as u64 * 1000).div_ceil(rate_hz as u64) as u32;
    whole.wrapping_add(part)
}

/// CDSP driver context.
pub struct Cdsp<T> {
    bus: T,
    config: Config,
    pipelines: [Pipeline; 2],
    fifo: FifoConfig,
    hw_error: FatalCode,
    initialized: bool,
    callbacks: [Option<Callback>; 2],
}

impl<T: RegisterTransport> Cdsp<T> {
    /// Create a driver with the default [`Config`]. Nothing touches the bus
    /// until [`initialize`](Self::initialize).
    pub fn new(bus: T) -> Self {
        Self::with_config(bus, Config::default())
    }

    pub fn with_config(bus: T, config: Config) -> Self {
        Self {
            bus,
            config,
            pipelines: [
                Pipeline::new(PipelineState::NotInit),
                Pipeline::new(PipelineState::NotInit),
            ],
            fifo: FifoConfig::default(),
            hw_error: FatalCode::None,
            initialized: false,
            callbacks: [None, None],
        }
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn state(&self, id: PipelineId) -> PipelineState {
        self.pipe(id).state
    }

    pub fn identity(&self, id: PipelineId) -> Option<&ProgramIdentity> {
        self.pipe(id).identity.as_ref()
    }

    pub fn connection(&self, id: PipelineId) -> Connection {
        self.pipe(id).connection
    }

    pub fn format(&self, id: PipelineId) -> Format {
        self.pipe(id).format
    }

    pub fn fifo_config(&self) -> &FifoConfig {
        &self.fifo
    }

    pub fn hw_error(&self) -> FatalCode {
        self.hw_error
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.bus
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.bus
    }

    /// Consume the driver and return the transport.
    pub fn release(self) -> T {
        self.bus
    }

    pub fn register_callback(&mut self, id: PipelineId, callback: Callback) {
        self.callbacks[id.index()] = Some(callback);
    }

    // ── Internal helpers ───────────────────────────────────────────────

    pub(crate) fn pipe(&self, id: PipelineId) -> &Pipeline {
        &self.pipelines[id.index()]
    }

    pub(crate) fn pipe_mut(&mut self, id: PipelineId) -> &mut Pipeline {
        &mut self.pipelines[id.index()]
    }

    pub(crate) fn set_state(&mut self, id: PipelineId, state: PipelineState) {
        let pipe = self.pipe_mut(id);
        if pipe.state != state {
            debug!("{:?}: {:?} -> {:?}", id, pipe.state, state);
            pipe.state = state;
        }
    }

    pub(crate) fn claimed(&self, id: PipelineId) -> FifoKinds {
        fifo::claimed_kinds(self.pipe(id).connection)
    }

    pub(crate) fn command(
        &mut self,
        id: PipelineId,
        command: Command,
        args: &[u8],
    ) -> Result<[u8; COMMAND_ARG_BYTES]> {
        protocol::send_command(&mut self.bus, id, command.into(), args, self.config.command_timeout_us)
    }

    fn require_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(CdspError::State("driver not initialized"))
        }
    }

    /// Queue a download of `bytes` into coprocessor memory at word `addr`.
    pub(crate) fn queue_download(&mut self, space: u8, addr: u16, bytes: &[u8], scrambled: bool) {
        if bytes.is_empty() {
            return;
        }
        let mut ctl = space | regs::MEM_AUTO_INC;
        if scrambled {
            ctl |= regs::MEM_DESCRAMBLE;
        }
        self.bus.write(regs::CDSP_MEM_CTL, ctl);
        transport::write_u16(&mut self.bus, regs::CDSP_MEM_ADR_H, regs::CDSP_MEM_ADR_L, addr);
        self.bus.write_burst(regs::CDSP_MEM_DATA, bytes);
    }

    // ── Initialisation ─────────────────────────────────────────────────

    /// Download and boot the resident program, then bring both pipelines to
    /// Init with default FIFO settings.
    ///
    /// A boot failure latches [`FatalCode::DownloadFailure`] and returns
    /// `Hardware(Fatal)`.
    pub fn initialize(&mut self, os_image: &[u8]) -> Result<()> {
        let os = OsImage::parse(os_image)?;
        info!(
            "downloading OS image ({} program bytes, {} data bytes)",
            os.program.len(),
            os.data.len()
        );

        self.initialized = false;
        self.bus.write(regs::CDSP_RESET, regs::RESET_HOLD);
        self.queue_download(regs::MEM_SPACE_PROGRAM, 0, os.program, false);
        self.queue_download(regs::MEM_SPACE_DATA, 0, os.data, false);
        self.bus.write(regs::CDSP_RESET, 0);
        self.bus.wait_for_bits(
            regs::CDSP_STATUS,
            regs::STATUS_BOOT_DONE,
            regs::STATUS_BOOT_DONE,
            self.config.boot_timeout_us,
        );
        let booted = match self.bus.execute() {
            Ok(()) => self.bus.read(regs::CDSP_STATUS)? & regs::STATUS_DOWNLOAD_ERR == 0,
            Err(TransportError::Timeout) => false,
            Err(err) => return Err(err.into()),
        };
        if !booted {
            error!("resident program failed to boot");
            self.hw_error = FatalCode::DownloadFailure;
            self.pipelines = [
                Pipeline::new(PipelineState::NotInit),
                Pipeline::new(PipelineState::NotInit),
            ];
            return Err(CdspError::Hardware(HardwareSeverity::Fatal));
        }

        self.pipelines = [
            Pipeline::new(PipelineState::Init),
            Pipeline::new(PipelineState::Init),
        ];
        self.fifo = FifoConfig::default();
        self.hw_error = FatalCode::None;
        self.write_defaults()?;
        self.initialized = true;
        info!("coprocessor running");
        Ok(())
    }

    fn write_defaults(&mut self) -> Result<()> {
        let bus = &mut self.bus;
        bus.write(regs::IRQ_FLAG, 0xFF);
        for id in PipelineId::ALL {
            bus.write(id.regs().ctl(), 0);
            bus.write(id.regs().irq_enable(), 0);
            bus.write(id.regs().irq_flag(), 0xFF);
        }
        bus.write(regs::FIFO_RST, FifoKinds::all().bits());
        bus.write(regs::FIFO_RST, 0);
        for addr in [
            regs::FIFO_START,
            regs::FIFO_CH,
            regs::FIFO_MIX0,
            regs::FIFO_MIX1,
            regs::FIFO_MIX2,
            regs::FIFO_IN_REC_SEL,
            regs::EFIFO_SINK0,
            regs::EFIFO_SINK1,
            regs::FIFO_HOST_SEL,
            regs::IFIFO_ENABLE,
            regs::OFIFO_ENABLE,
            regs::RFIFO_ENABLE,
        ] {
            bus.write(addr, 0);
        }
        for addr in [regs::IFIFO_FLAG, regs::OFIFO_FLAG, regs::RFIFO_FLAG] {
            bus.write(addr, 0xFF);
        }
        let sources = IrqSources::DECODE
            | IrqSources::ENCODE
            | IrqSources::INPUT_FIFO
            | IrqSources::OUTPUT_FIFO
            | IrqSources::RECORD_FIFO
            | IrqSources::FATAL;
        bus.write(regs::IRQ_ENABLE, sources.bits());
        bus.execute()?;
        Ok(())
    }

    /// Terminate both pipelines and hold the coprocessor in reset.
    pub fn terminate(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        for id in PipelineId::ALL {
            if self.state(id) > PipelineState::Init {
                if let Err(err) = self.terminate_pipeline(id) {
                    warn!("{:?}: terminate failed: {}", id, err);
                }
            }
        }
        self.bus.write(regs::IRQ_ENABLE, 0);
        self.bus.write(regs::CDSP_RESET, regs::RESET_HOLD);
        self.bus.execute()?;

        self.pipelines = [
            Pipeline::new(PipelineState::NotInit),
            Pipeline::new(PipelineState::NotInit),
        ];
        self.fifo = FifoConfig::default();
        self.initialized = false;
        info!("coprocessor stopped");
        Ok(())
    }

    // ── Configuration blobs ────────────────────────────────────────────

    /// Validate a parameter blob against the current state without applying
    /// anything.
    pub fn check_configuration(&self, blob: &[u8]) -> Result<()> {
        let parsed = ParameterBlob::parse(blob)?;
        self.validate_blob(&parsed)
    }

    fn validate_blob(&self, blob: &ParameterBlob<'_>) -> Result<()> {
        self.require_initialized()?;

        let mut connections = [Connection::default(); 2];
        let mut layouts = [None; 2];
        for id in PipelineId::ALL {
            let chunks = blob.get(id);
            let pipe = self.pipe(id);
            connections[id.index()] = chunks.fifo.map_or(pipe.connection, |f| f.connection);
            layouts[id.index()] = chunks
                .program
                .map(|p| p.identity().layout)
                .or(pipe.identity.map(|i| i.layout));
            if chunks.is_empty() {
                continue;
            }

            // State each pipeline will be in once its program chunk is applied.
            let state = match (chunks.program, pipe.state) {
                (_, PipelineState::NotInit) => {
                    return Err(CdspError::State("coprocessor not initialized"));
                }
                (Some(_), _) => PipelineState::ReadySetup,
                (None, state) => state,
            };
            let configurable = matches!(state, PipelineState::ReadySetup | PipelineState::Ready);
            if (chunks.fifo.is_some() || chunks.extension.is_some()) && !configurable {
                return Err(CdspError::State("pipeline cannot be reconfigured now"));
            }
            if chunks.params.is_some() && state == PipelineState::Init {
                return Err(CdspError::State("no program loaded"));
            }
            if let Some(routing) = chunks.fifo {
                self.check_fifo_chunk(id, &routing)?;
            }
            if chunks.extension.is_some() {
                self.check_extension_chunk(id)?;
            }
        }

        if let [Some(decode), Some(encode)] = layouts {
            decode.check_disjoint(&encode)?;
        }
        if fifo::claimed_kinds(connections[0]).intersects(fifo::claimed_kinds(connections[1])) {
            return Err(CdspError::ResourceOverlap("FIFO claimed by both pipelines"));
        }
        if fifo_ops::record_coupling_conflict(&connections, self.fifo.record_host_routed) {
            return Err(CdspError::Argument("coupled pipeline cannot use host-routed record FIFO"));
        }
        Ok(())
    }

    /// Validate and apply a parameter blob.
    ///
    /// Per pipeline: program, FIFO routing, extension, then the parameter
    /// list. Nothing is applied if validation fails.
    pub fn apply_configuration(&mut self, blob: &[u8]) -> Result<()> {
        let parsed = ParameterBlob::parse(blob)?;
        self.validate_blob(&parsed)?;
        for id in PipelineId::ALL {
            let chunks = *parsed.get(id);
            if chunks.is_empty() {
                continue;
            }
            if let Some(program) = chunks.program {
                self.load_image(id, &program)?;
            }
            if let Some(routing) = chunks.fifo {
                self.apply_fifo_chunk(id, &routing)?;
            }
            if let Some(ext) = chunks.extension {
                self.apply_extension_chunk(id, &ext)?;
            }
            if let Some(params) = chunks.params {
                self.apply_params(id, &params)?;
            }
        }
        Ok(())
    }

    fn apply_params(&mut self, id: PipelineId, params: &ParamList<'_>) -> Result<()> {
        debug!("{:?}: applying {} parameters", id, params.len());
        for (command, args) in params.iter() {
            protocol::send_command(&mut self.bus, id, command, &args, self.config.command_timeout_us)?;
        }
        Ok(())
    }

    /// Change the sample rate. Allowed in ReadySetup and Ready; a Ready
    /// pipeline is reset first.
    pub fn set_sample_rate(&mut self, id: PipelineId, rate: u8) -> Result<()> {
        let rate = RateCode::try_from(rate).map_err(|_| CdspError::Argument("unknown rate code"))?;
        match self.state(id) {
            PipelineState::ReadySetup => {}
            PipelineState::Ready => self.reset_pipeline(id)?,
            _ => return Err(CdspError::State("sample rate can only change when stopped")),
        }
        let dual_mono = self.pipe(id).format.dual_mono;
        self.set_format(id, rate, dual_mono)
    }

    // ── Parameters ─────────────────────────────────────────────────────

    /// Last command sent with [`set_parameter`](Self::set_parameter), or the
    /// last notification received from the program.
    pub fn get_parameter(&self, id: PipelineId) -> PendingCommand {
        self.pipe(id).pending
    }

    /// Send a program-specific command.
    ///
    /// A `command` with the completion bit set acknowledges the pending
    /// notification with `args` as its results instead.
    pub fn set_parameter(&mut self, id: PipelineId, command: u8, args: &[u8]) -> Result<()> {
        self.require_initialized()?;
        if args.len() > COMMAND_ARG_BYTES {
            return Err(CdspError::Argument("too many command arguments"));
        }
        if command & CMD_COMPLETION != 0 {
            let notification = command & !CMD_COMPLETION;
            protocol::acknowledge_notification(&mut self.bus, id, notification, args)?;
            let pending = &mut self.pipe_mut(id).pending;
            pending.results = [0; COMMAND_ARG_BYTES];
            pending.results[..args.len()].copy_from_slice(args);
            return Ok(());
        }
        if command < USER_COMMAND_MIN {
            return Err(CdspError::Argument("reserved command id"));
        }
        if !matches!(
            self.state(id),
            PipelineState::ReadySetup | PipelineState::Ready | PipelineState::Playing
        ) {
            return Err(CdspError::State("no program loaded"));
        }
        protocol::send_command(&mut self.bus, id, command, args, self.config.command_timeout_us)?;
        let mut pending = PendingCommand {
            id: command,
            ..PendingCommand::default()
        };
        pending.args[..args.len()].copy_from_slice(args);
        self.pipe_mut(id).pending = pending;
        Ok(())
    }

    // ── Status ─────────────────────────────────────────────────────────

    fn read_position(&mut self, id: PipelineId, input: bool) -> Result<u32> {
        let g = id.regs();
        let addrs = if input {
            [g.in_pos(0), g.in_pos(1), g.in_pos(2), g.in_pos(3)]
        } else {
            [g.out_pos(0), g.out_pos(1), g.out_pos(2), g.out_pos(3)]
        };
        let samples = transport::read_be(&mut self.bus, addrs)?;
        Ok(samples_to_ms(samples, self.pipe(id).format.rate.hz()))
    }

    pub fn query_status(&mut self, kind: StatusKind) -> Result<u32> {
        match kind {
            StatusKind::FatalCode => Ok(u8::from(self.hw_error) as u32),
            StatusKind::ErrorCode(id) => Ok(self.pipe(id).error_code as u32),
            StatusKind::Version(id) => Ok(self.pipe(id).version as u32),
            StatusKind::InputPosition(id) => {
                self.require_initialized()?;
                let ms = self.read_position(id, true)?;
                Ok(ms.wrapping_add(self.pipe(id).position_supplement_ms))
            }
            StatusKind::OutputPosition(id) => {
                self.require_initialized()?;
                self.read_position(id, false)
            }
            StatusKind::InputFifoRemaining => {
                self.require_initialized()?;
                Ok(transport::read_be(&mut self.bus, [regs::IFIFO_REMAIN_H, regs::IFIFO_REMAIN_L])?)
            }
            StatusKind::RecordFifoRemaining => {
                self.require_initialized()?;
                Ok(transport::read_be(&mut self.bus, [regs::RFIFO_REMAIN_H, regs::RFIFO_REMAIN_L])?)
            }
        }
    }
}
