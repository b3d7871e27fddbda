//! Half-duplex command protocol with the running programs.
//!
//! Each pipeline has two mailboxes:
//!
//! - **Host command**: the host writes argument bytes, then the command id
//!   with the completion bit clear. The program executes it, writes a result
//!   code and result bytes, and sets the completion bit.
//! - **Notification**: the program posts an id (completion bit clear) and
//!   argument bytes and raises the SFR interrupt. The host answers by writing
//!   result bytes and the id with the completion bit set.
//!
//! Only one command may be outstanding per pipeline.

use log::{trace, warn};
use num_enum::IntoPrimitive;

use crate::constants::COMMAND_ARG_BYTES;
use crate::error::{CdspError, HardwareSeverity, Result};
use crate::pipeline::PipelineId;
use crate::regs::CMD_COMPLETION;
use crate::transport::{RegisterTransport, TransportError};

/// Commands understood by every resident program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    SetProgramInfo = 0x01,
    SetConnection = 0x02,
    SetFormat = 0x03,
    Standby = 0x04,
    Reset = 0x05,
    Terminate = 0x06,
    InputDataEnd = 0x07,
    ClearInputDataEnd = 0x08,
    VerifyStopCompletion = 0x09,
}

/// First id available to program-specific parameters.
pub const USER_COMMAND_MIN: u8 = 0x10;

/// Notification announcing a new output format: `[rate, dual_mono, 0, 0]`.
pub const NOTIFY_OUTPUT_FORMAT_CHANGE: u8 = 0x11;

const RESULT_ARGUMENT: u8 = 0xF1;
const RESULT_STATE: u8 = 0xF2;
const RESULT_ERROR_MIN: u8 = 0xF0;

/// A notification posted by a running program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub id: u8,
    pub args: [u8; COMMAND_ARG_BYTES],
}

/// Number of argument bytes a notification id carries.
pub const fn notification_arg_count(id: u8) -> usize {
    match id {
        0x01..=0x0F => 0,
        0x10..=0x1F => 4,
        _ => COMMAND_ARG_BYTES,
    }
}

/// Send `command` with `args` to `pipeline` and wait for its completion.
///
/// Returns the 16 result bytes. A timeout closes the mailbox by setting the
/// completion bit itself so the next command is not blocked.
pub fn send_command<T: RegisterTransport + ?Sized>(
    bus: &mut T,
    pipeline: PipelineId,
    command: u8,
    args: &[u8],
    timeout_us: u32,
) -> Result<[u8; COMMAND_ARG_BYTES]> {
    if args.len() > COMMAND_ARG_BYTES {
        return Err(CdspError::Argument("too many command arguments"));
    }
    let id = command & !CMD_COMPLETION;
    let group = pipeline.regs();
    trace!("{:?}: command 0x{:02x} {:02x?}", pipeline, id, args);

    bus.wait_for_bits(group.host_cmd(), CMD_COMPLETION, CMD_COMPLETION, timeout_us);
    for (i, &byte) in args.iter().enumerate() {
        bus.write(group.host_arg(i), byte);
    }
    bus.write(group.host_cmd(), id);
    bus.wait_for_bits(group.host_cmd(), CMD_COMPLETION, CMD_COMPLETION, timeout_us);

    match bus.execute() {
        Ok(()) => {}
        Err(TransportError::Timeout) => {
            warn!("{:?}: command 0x{:02x} timed out", pipeline, id);
            bus.write(group.host_cmd(), id | CMD_COMPLETION);
            bus.execute()?;
            return Err(CdspError::Timeout);
        }
        Err(err) => return Err(err.into()),
    }

    let code = bus.read(group.host_res())?;
    if code >= RESULT_ERROR_MIN {
        warn!("{:?}: command 0x{:02x} failed with 0x{:02x}", pipeline, id, code);
        return Err(match code {
            RESULT_ARGUMENT => CdspError::Argument("command rejected its arguments"),
            RESULT_STATE => CdspError::State("command rejected in program state"),
            _ => CdspError::Hardware(HardwareSeverity::Recoverable),
        });
    }

    let mut results = [0u8; COMMAND_ARG_BYTES];
    for (i, byte) in results.iter_mut().enumerate() {
        *byte = bus.read(group.host_arg(i))?;
    }
    Ok(results)
}

/// Read the notification currently posted to `pipeline`, if any.
pub fn receive_notification<T: RegisterTransport + ?Sized>(
    bus: &mut T,
    pipeline: PipelineId,
) -> Result<Option<Notification>> {
    let group = pipeline.regs();
    let raw = bus.read(group.os_cmd())?;
    if raw & CMD_COMPLETION != 0 {
        return Ok(None);
    }
    let mut args = [0u8; COMMAND_ARG_BYTES];
    for (i, byte) in args.iter_mut().take(notification_arg_count(raw)).enumerate() {
        *byte = bus.read(group.os_arg(i))?;
    }
    trace!("{:?}: notification 0x{:02x} {:02x?}", pipeline, raw, args);
    Ok(Some(Notification { id: raw, args }))
}

/// Answer notification `id` on `pipeline` with `results`.
pub fn acknowledge_notification<T: RegisterTransport + ?Sized>(
    bus: &mut T,
    pipeline: PipelineId,
    id: u8,
    results: &[u8],
) -> Result<()> {
    if results.len() > COMMAND_ARG_BYTES {
        return Err(CdspError::Argument("too many result bytes"));
    }
    let group = pipeline.regs();
    for (i, &byte) in results.iter().enumerate() {
        bus.write(group.os_arg(i), byte);
    }
    bus.write(group.os_cmd(), id | CMD_COMPLETION);
    bus.execute()?;
    Ok(())
}
