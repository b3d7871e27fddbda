//! I²C register transport.
//!
//! The codec's control port takes a 16-bit register address followed by
//! one data byte per register. Writing several bytes after one address keeps
//! hitting the same register, which is how the memory window and FIFO data
//! ports are streamed.
//!
//! # Example
//!
//! ```ignore
//! let mut bus = I2cTransport::new(i2c, delay);
//! bus.write(regs::FIFO_RST, 0x0F);
//! bus.write(regs::FIFO_RST, 0x00);
//! bus.execute()?;
//! ```

use alloc::vec::Vec;

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::{I2c, Operation};
use log::{trace, warn};

use super::{RegisterTransport, TransportError};
use crate::constants::POLL_INTERVAL_US;

/// One queued bus operation.
enum Op {
    Write { addr: u16, value: u8 },
    Burst { addr: u16, data: Vec<u8> },
    Wait { addr: u16, mask: u8, value: u8, timeout_us: u32 },
}

/// [`RegisterTransport`] over an `embedded-hal` I²C bus.
///
/// Generic over I²C bus and delay provider. The delay paces wait-for-bits
/// polling only.
pub struct I2cTransport<I2C, D> {
    i2c: I2C,
    delay: D,
    address: u8,
    queue: Vec<Op>,
}

impl<I2C, D> I2cTransport<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    /// Default 7-bit control port address.
    pub const DEFAULT_ADDRESS: u8 = 0x3A;

    /// Create a transport with the default I²C address.
    pub fn new(i2c: I2C, delay: D) -> Self {
        Self::new_with_address(i2c, delay, Self::DEFAULT_ADDRESS)
    }

    /// Create a transport with a specific I²C address.
    pub fn new_with_address(i2c: I2C, delay: D, address: u8) -> Self {
        Self {
            i2c,
            delay,
            address,
            queue: Vec::new(),
        }
    }

    /// Consume the transport and return the I²C bus and delay.
    pub fn release(self) -> (I2C, D) {
        (self.i2c, self.delay)
    }

    // ── Low-level I²C helpers ──────────────────────────────────────────

    fn write_register(&mut self, register: u16, value: u8) -> Result<(), TransportError> {
        let buf = [(register >> 8) as u8, register as u8, value];
        self.i2c.write(self.address, &buf).map_err(bus_error)
    }

    fn read_register(&mut self, register: u16) -> Result<u8, TransportError> {
        let reg_buf = [(register >> 8) as u8, register as u8];
        let mut val_buf = [0u8; 1];
        self.i2c
            .write_read(self.address, &reg_buf, &mut val_buf)
            .map_err(bus_error)?;
        Ok(val_buf[0])
    }

    /// Stream `data` into one register in a single bus transaction.
    fn write_port(&mut self, register: u16, data: &[u8]) -> Result<(), TransportError> {
        let header = [(register >> 8) as u8, register as u8];
        let mut ops = [Operation::Write(&header), Operation::Write(data)];
        self.i2c.transaction(self.address, &mut ops).map_err(bus_error)
    }

    fn poll(&mut self, addr: u16, mask: u8, value: u8, timeout_us: u32) -> Result<(), TransportError> {
        let mut waited = 0u32;
        loop {
            let current = self.read_register(addr)?;
            if current & mask == value {
                return Ok(());
            }
            if waited >= timeout_us {
                warn!(
                    "wait on 0x{:04x} timed out after {} us (0x{:02x} & 0x{:02x} != 0x{:02x})",
                    addr, waited, current, mask, value
                );
                return Err(TransportError::Timeout);
            }
            self.delay.delay_us(POLL_INTERVAL_US);
            waited = waited.saturating_add(POLL_INTERVAL_US);
        }
    }
}

fn bus_error<E: embedded_hal::i2c::Error>(err: E) -> TransportError {
    warn!("i2c transfer failed: {:?}", err.kind());
    TransportError::Bus
}

impl<I2C, D> RegisterTransport for I2cTransport<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    fn read(&mut self, addr: u16) -> Result<u8, TransportError> {
        self.read_register(addr)
    }

    fn write(&mut self, addr: u16, value: u8) {
        self.queue.push(Op::Write { addr, value });
    }

    fn write_burst(&mut self, addr: u16, data: &[u8]) {
        if !data.is_empty() {
            self.queue.push(Op::Burst {
                addr,
                data: data.to_vec(),
            });
        }
    }

    fn wait_for_bits(&mut self, addr: u16, mask: u8, value: u8, timeout_us: u32) {
        self.queue.push(Op::Wait {
            addr,
            mask,
            value,
            timeout_us,
        });
    }

    fn execute(&mut self) -> Result<(), TransportError> {
        let ops = core::mem::take(&mut self.queue);
        trace!("executing {} queued operations", ops.len());
        for op in ops {
            match op {
                Op::Write { addr, value } => self.write_register(addr, value)?,
                Op::Burst { addr, data } => self.write_port(addr, &data)?,
                Op::Wait {
                    addr,
                    mask,
                    value,
                    timeout_us,
                } => self.poll(addr, mask, value, timeout_us)?,
            }
        }
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
