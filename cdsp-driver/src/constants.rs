/// Number of argument (and result) bytes carried by one command.
pub const COMMAND_ARG_BYTES: usize = 16;

/// Size of a program descriptor header in bytes.
pub const PROGRAM_HEADER_BYTES: usize = 36;

/// Size of one parameter-list record: command id plus arguments.
pub const PARAM_RECORD_BYTES: usize = 1 + COMMAND_ARG_BYTES;

/// Fixed payload size of a FIFO-routing chunk.
pub const FIFO_CHUNK_BYTES: usize = 26;

/// Fixed payload size of an extension chunk.
pub const EXTENSION_CHUNK_BYTES: usize = 5;

/// Default timeout for one command round trip, in microseconds.
pub const DEFAULT_COMMAND_TIMEOUT_US: u32 = 100_000;

/// Default bound on the stop-verification wait, in microseconds.
pub const DEFAULT_STOP_TIMEOUT_US: u32 = 50_000;

/// Default time allowed for the resident program to boot, in microseconds.
pub const DEFAULT_BOOT_TIMEOUT_US: u32 = 1_000_000;

/// Default number of status polls while waiting for a FIFO to drain.
pub const DEFAULT_DRAIN_POLL_LIMIT: u32 = 1_000;

/// Interval between register polls in [`I2cTransport`](crate::transport::I2cTransport).
pub const POLL_INTERVAL_US: u32 = 10;

/// Highest error code that a downloaded program may report as recoverable.
pub const PROGRAM_ERROR_MAX: u8 = 0x7F;
