//! Register transport between the driver and the codec.
//!
//! The driver never touches the bus directly. It queues writes and
//! wait-for-bits conditions, then applies them as one unit with
//! [`execute()`](RegisterTransport::execute). Reads are immediate and do not
//! apply queued operations, so callers execute before reading anything their
//! queued writes affect.

use thiserror::Error;

#[cfg(feature = "i2c")]
mod i2c;

#[cfg(feature = "i2c")]
pub use i2c::I2cTransport;

#[cfg(test)]
pub(crate) mod fake;

/// Failures reported by a [`RegisterTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// A queued wait-for-bits condition was not met before its timeout.
    #[error("register wait timed out")]
    Timeout,
    /// The underlying bus reported an error.
    #[error("bus error")]
    Bus,
}

/// Narrow register interface to the codec.
pub trait RegisterTransport {
    /// Read one register immediately.
    fn read(&mut self, addr: u16) -> Result<u8, TransportError>;

    /// Queue a register write.
    fn write(&mut self, addr: u16, value: u8);

    /// Queue consecutive writes of `data` to the same register (a data port).
    fn write_burst(&mut self, addr: u16, data: &[u8]) {
        for &byte in data {
            self.write(addr, byte);
        }
    }

    /// Queue a wait until `(register & mask) == value`, failing
    /// [`execute()`](Self::execute) if the condition is not met within
    /// `timeout_us` microseconds.
    fn wait_for_bits(&mut self, addr: u16, mask: u8, value: u8, timeout_us: u32);

    /// Apply every queued operation in order. Stops at the first failure and
    /// returns it; the queue is empty afterwards either way.
    fn execute(&mut self) -> Result<(), TransportError>;
}

/// Read a big-endian value spread over `N` consecutive byte registers.
pub(crate) fn read_be<T: RegisterTransport + ?Sized, const N: usize>(
    bus: &mut T,
    addrs: [u16; N],
) -> Result<u32, TransportError> {
    let mut value = 0u32;
    for addr in addrs {
        value = (value << 8) | bus.read(addr)? as u32;
    }
    Ok(value)
}

/// Queue a big-endian 16-bit write to a high/low register pair.
pub(crate) fn write_u16<T: RegisterTransport + ?Sized>(bus: &mut T, hi: u16, lo: u16, value: u16) {
    bus.write(hi, (value >> 8) as u8);
    bus.write(lo, value as u8);
}
