//! # cdsp-driver
//!
//! A `no_std` driver for the audio coprocessor ("CDSP") embedded in
//! mixed-signal audio codecs. The coprocessor runs a resident program plus two
//! downloadable application programs, one per pipeline (decode and encode),
//! which move samples through four hardware FIFOs.
//!
//! ## Architecture
//!
//! | Layer | Module | Purpose |
//! |-------|--------|---------|
//! | Bus | [`transport`] | Queued register access, wait-for-bits, I²C adapter |
//! | Registers | [`regs`] | Register addresses and bitfields |
//! | Firmware | [`firmware`] | OS image, program descriptor and parameter blob parsing |
//! | Protocol | [`protocol`] | Half-duplex command / notification exchange |
//! | Model | [`pipeline`] / [`fifo`] / [`event`] | Pipeline records, FIFO configuration, interrupt events |
//! | Driver | [`driver`] | Lifecycle, FIFO sequencing, interrupt dispatch, callbacks |
//!
//! ## Quick start
//!
//! ```ignore
//! use cdsp_driver::{Cdsp, I2cTransport, PipelineId};
//!
//! let mut cdsp = Cdsp::new(I2cTransport::new(i2c, delay));
//! cdsp.initialize(OS_IMAGE)?;
//! cdsp.apply_configuration(PARAMETER_BLOB)?;
//! cdsp.register_callback(PipelineId::Decode, Box::new(|id, kind, info| {
//!     // forward to the upper driver
//! }));
//! cdsp.start(PipelineId::Decode)?;
//!
//! // From the codec interrupt line, with the driver lock held:
//! cdsp.handle_interrupt()?;
//! ```
//!
//! ## Features
//!
//! | Feature | Default | Enables |
//! |---------|---------|---------|
//! | `i2c` | yes | [`transport::I2cTransport`] (requires `embedded-hal`) |
//!
//! ## Concurrency
//!
//! Every entry point takes `&mut self`. The surrounding driver owns the lock;
//! nothing in this crate spawns threads or blocks on anything other than the
//! transport's bounded polling.

#![no_std]

extern crate alloc;

pub mod constants;
pub mod error;
pub mod regs;
pub mod transport;
pub mod firmware;
pub mod protocol;
pub mod pipeline;
pub mod fifo;
pub mod event;
pub mod driver;

pub use driver::{Callback, Cdsp, Config, StatusKind};
pub use error::{CdspError, HardwareSeverity, Result};
pub use event::{EventInfo, EventKind, FatalCode};
pub use fifo::{FifoKind, FifoKinds, FifoRoute};
pub use firmware::ProgramIdentity;
pub use pipeline::{
    ChannelConfig, Connection, DualMonoMode, Format, InputSource, OutputDestination,
    PendingCommand, PipelineId, PipelineState, RateCode,
};
pub use transport::{RegisterTransport, TransportError};

#[cfg(feature = "i2c")]
pub use transport::I2cTransport;
