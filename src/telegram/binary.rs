//! Tag-length-value walker for binary telegram frames.
//!
//! After the frame header comes a flat sequence of typed elements. A 6-byte
//! octet string carries an OBIS code and associates it with the numeric
//! element that follows; the association slot is single-valued and does not
//! stack. Array and structure headers are consumed as flat 2-byte advances;
//! the meters this was written against never nest compound types in a way
//! that flat consumption mishandles.

use std::time::{Duration, Instant};

use log::debug;

use super::{Step, TelegramError};
use crate::sensors::{ObisCode, SensorRegistry};

// Opening flag plus the two format/length bytes.
const FRAME_HEADER_LEN: usize = 3;
/// HDLC control byte introducing the data headers.
const CONTROL_BYTE: u8 = 0x13;
// Header bytes between the control byte and the first data element.
const DATA_HEADER_LEN: usize = 6;

/// Resumable cursor over the elements of one binary telegram.
pub struct BinaryParser {
    cursor: usize,
    pending_code: Option<ObisCode>,
    primed: bool,
}

impl BinaryParser {
    pub fn new() -> Self {
        BinaryParser {
            cursor: 0,
            pending_code: None,
            primed: false,
        }
    }

    /// Forget all telegram state, ready for a fresh frame.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.pending_code = None;
        self.primed = false;
    }

    /// Decode elements from `data` until the cursor reaches `boundary` (the
    /// checksum offset) or `slice` elapses. The first call on a telegram
    /// locates the control byte and skips the data headers.
    pub fn step(
        &mut self,
        data: &[u8],
        boundary: usize,
        registry: &SensorRegistry,
        slice: Duration,
    ) -> Result<Step, TelegramError> {
        let started = Instant::now();
        if !self.primed {
            self.prime(data, boundary)?;
        }
        while self.cursor < boundary {
            self.decode_element(data, boundary, registry)?;
            if started.elapsed() >= slice {
                return Ok(Step::Yielded);
            }
        }
        Ok(Step::Done)
    }

    fn prime(&mut self, data: &[u8], boundary: usize) -> Result<(), TelegramError> {
        let control = data[FRAME_HEADER_LEN..boundary]
            .iter()
            .position(|&byte| byte == CONTROL_BYTE)
            .ok_or(TelegramError::ControlByteMissing)?;
        self.cursor = FRAME_HEADER_LEN + control + 1 + DATA_HEADER_LEN;
        self.primed = true;
        Ok(())
    }

    fn decode_element(
        &mut self,
        data: &[u8],
        boundary: usize,
        registry: &SensorRegistry,
    ) -> Result<(), TelegramError> {
        let tag = data[self.cursor];
        match tag {
            // null
            0x00 => self.cursor += 1,
            // array and structure headers; elements follow flatly
            0x01 | 0x02 => self.cursor += 2,
            // unsigned 32 bit, scaled by 1/1000
            0x06 => {
                let raw = self.read(data, boundary, 4)?;
                let value = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
                self.dispatch(registry, value as f64 / 1000.0);
                self.cursor += 5;
            }
            // octet string; a 6-byte one carries an OBIS code
            0x09 => {
                let length = self.read(data, boundary, 1)?[0] as usize;
                let octets = &self.read(data, boundary, 1 + length)?[1..];
                if let Ok(octets) = <[u8; 6]>::try_from(octets) {
                    self.pending_code = Some(ObisCode::from_octets(&octets));
                }
                self.cursor += 2 + length;
            }
            // visible string, skipped
            0x0A => {
                let length = self.read(data, boundary, 1)?[0] as usize;
                self.cursor += 2 + length;
            }
            // date-time, skipped
            0x0C => self.cursor += 13,
            // scaler/unit byte, skipped
            0x0F => self.cursor += 2,
            // unsigned 16 bit, scaled by 1/10
            0x10 => {
                let raw = self.read(data, boundary, 2)?;
                let value = u16::from_be_bytes([raw[0], raw[1]]);
                self.dispatch(registry, value as f64 / 10.0);
                self.cursor += 3;
            }
            // signed 16 bit, sign-extended, scaled by 1/10
            0x12 => {
                let raw = self.read(data, boundary, 2)?;
                let value = i16::from_be_bytes([raw[0], raw[1]]);
                self.dispatch(registry, value as f64 / 10.0);
                self.cursor += 3;
            }
            // enum, skipped
            0x16 => self.cursor += 2,
            other => return Err(TelegramError::UnsupportedTag(other, self.cursor)),
        }
        Ok(())
    }

    /// The `count` bytes following the tag at the cursor, bounds-checked
    /// against the checksum boundary.
    fn read<'a>(
        &self,
        data: &'a [u8],
        boundary: usize,
        count: usize,
    ) -> Result<&'a [u8], TelegramError> {
        let start = self.cursor + 1;
        if start + count > boundary {
            return Err(TelegramError::TruncatedElement(self.cursor));
        }
        Ok(&data[start..start + count])
    }

    fn dispatch(&self, registry: &SensorRegistry, value: f64) {
        match self.pending_code {
            Some(code) => {
                if !registry.dispatch(code, value) {
                    debug!("no sensor matching 1-0:{} (0x{:x})", code, code.raw());
                }
            }
            None => debug!("numeric element without a preceding OBIS code, skipped"),
        }
    }
}

impl Default for BinaryParser {
    fn default() -> Self {
        BinaryParser::new()
    }
}
