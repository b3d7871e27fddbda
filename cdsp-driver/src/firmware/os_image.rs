//! Resident program ("OS") image.
//!
//! Layout:
//!
//! ```text
//! [u16 program_word_count][u16 data_word_count][program words][data words]
//! ```

use super::le_u16;
use crate::error::{CdspError, Result};

const HEADER_BYTES: usize = 4;

/// A validated OS image, borrowing its segments from the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsImage<'a> {
    /// Program memory segment (2 bytes per word).
    pub program: &'a [u8],
    /// Data memory segment (2 bytes per word).
    pub data: &'a [u8],
}

impl<'a> OsImage<'a> {
    /// Parse and validate an OS image.
    ///
    /// Both word counts must be non-zero and the total length must match the
    /// header exactly.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let program_words = le_u16(bytes, 0)? as usize;
        let data_words = le_u16(bytes, 2)? as usize;
        if program_words == 0 || data_words == 0 {
            return Err(CdspError::Argument("OS image segment is empty"));
        }
        let program_len = program_words * 2;
        let data_len = data_words * 2;
        if bytes.len() != HEADER_BYTES + program_len + data_len {
            return Err(CdspError::Argument("OS image size mismatch"));
        }
        let body = &bytes[HEADER_BYTES..];
        Ok(Self {
            program: &body[..program_len],
            data: &body[program_len..],
        })
    }
}
