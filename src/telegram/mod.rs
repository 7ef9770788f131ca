//! Telegram framing and decoding.
//!
//! A telegram arrives one byte at a time and is accumulated in a
//! [`TelegramBuffer`]. The first byte decides the wire format: `/` starts a
//! human-readable ASCII (DSMR-style) telegram, `0x7E` an HDLC-style binary
//! frame. The buffer tracks the offset where the trailing checksum begins as
//! bytes arrive, so verification can run as soon as the terminator is seen.

use thiserror::Error;

pub mod ascii;
pub mod binary;
pub mod crc;

/// Opening and closing flag of a binary frame.
pub const BINARY_FLAG: u8 = 0x7E;
/// First byte of an ASCII telegram (identification line).
pub const ASCII_START: u8 = b'/';

// Binary frame layout: flag, format/length-high, length-low.
const BINARY_HEADER_LEN: usize = 3;
// Top 3 bits of the byte after the opening flag (HDLC frame format type 3).
const BINARY_FORMAT_BITS: u8 = 0b101;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelegramError {
    #[error("unrecognized telegram start byte 0x{0:02X}")]
    UnknownFormat(u8),
    #[error("telegram buffer overrun (capacity {0})")]
    BufferOverrun(usize),
    #[error("unknown binary frame format byte 0x{0:02X}")]
    BadFrameFormat(u8),
    #[error("implausible binary frame length {0}")]
    BadFrameLength(usize),
    #[error("expected closing flag, got 0x{0:02X}")]
    UnexpectedEnd(u8),
    #[error("CRC mismatch, calculated {calculated:04X} != {received:04X}")]
    CrcMismatch { calculated: u16, received: u16 },
    #[error("unreadable CRC field")]
    BadCrcField,
    #[error("control byte missing from binary frame")]
    ControlByteMissing,
    #[error("unsupported element type 0x{0:02X} at offset {1}")]
    UnsupportedTag(u8, usize),
    #[error("element at offset {0} extends past the checksum boundary")]
    TruncatedElement(usize),
}

/// Wire format of the telegram being accumulated, detected from its first
/// byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Unknown,
    Ascii,
    Binary,
}

/// Progress of one time-sliced parsing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The time slice ran out with elements still to process.
    Yielded,
    /// The end of the telegram was reached.
    Done,
}

/// Result of feeding one byte to the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Telegram still incomplete, keep feeding.
    NeedMore,
    /// The closing terminator arrived; the buffer holds one full telegram.
    TelegramComplete,
}

/// Accumulates one telegram, detecting the format and the checksum boundary
/// incrementally.
///
/// The buffer lives for a single acquisition cycle and is reset when the
/// next read phase starts. The write cursor never exceeds the configured
/// capacity; an oversized telegram fails the cycle instead.
pub struct TelegramBuffer {
    data: Vec<u8>,
    capacity: usize,
    format: Format,
    crc_boundary: Option<usize>,
}

impl TelegramBuffer {
    pub fn new(capacity: usize) -> Self {
        TelegramBuffer {
            data: Vec::with_capacity(capacity),
            capacity,
            format: Format::Unknown,
            crc_boundary: None,
        }
    }

    /// Drop any accumulated bytes and start a fresh telegram.
    pub fn reset(&mut self) {
        self.data.clear();
        self.format = Format::Unknown;
        self.crc_boundary = None;
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset where the checksum bytes start, once enough of the telegram
    /// has arrived to know it.
    pub fn crc_boundary(&self) -> Option<usize> {
        self.crc_boundary
    }

    /// Append one received byte, classifying the format on the first byte
    /// and watching for the checksum boundary and the end of the telegram.
    pub fn feed(&mut self, byte: u8) -> Result<FeedOutcome, TelegramError> {
        if self.data.len() == self.capacity {
            return Err(TelegramError::BufferOverrun(self.capacity));
        }
        if self.data.is_empty() {
            self.format = match byte {
                ASCII_START => Format::Ascii,
                BINARY_FLAG => Format::Binary,
                other => return Err(TelegramError::UnknownFormat(other)),
            };
        }
        self.data.push(byte);

        match self.format {
            Format::Ascii => self.feed_ascii(byte),
            Format::Binary => self.feed_binary(byte),
            Format::Unknown => unreachable!("format classified on first byte"),
        }
    }

    fn feed_ascii(&mut self, byte: u8) -> Result<FeedOutcome, TelegramError> {
        match self.crc_boundary {
            None => {
                // The exclamation mark ends the payload; the checksum
                // characters follow it.
                if byte == b'!' {
                    self.crc_boundary = Some(self.data.len());
                }
                Ok(FeedOutcome::NeedMore)
            }
            Some(_) => {
                // The checksum is a single line.
                if byte == b'\n' {
                    Ok(FeedOutcome::TelegramComplete)
                } else {
                    Ok(FeedOutcome::NeedMore)
                }
            }
        }
    }

    fn feed_binary(&mut self, byte: u8) -> Result<FeedOutcome, TelegramError> {
        let received = self.data.len();
        if received == 2 {
            if byte >> 5 != BINARY_FORMAT_BITS {
                return Err(TelegramError::BadFrameFormat(byte));
            }
        } else if received == BINARY_HEADER_LEN {
            let length =
                ((self.data[1] as usize & 0x1F) << 8) + self.data[2] as usize;
            if length <= BINARY_HEADER_LEN {
                return Err(TelegramError::BadFrameLength(length.saturating_sub(1)));
            }
            let boundary = length - 1;
            if boundary + 3 > self.capacity {
                return Err(TelegramError::BadFrameLength(boundary));
            }
            self.crc_boundary = Some(boundary);
        } else if let Some(boundary) = self.crc_boundary {
            // Two checksum bytes sit at the boundary, then the closing flag.
            if received == boundary + 3 {
                if byte != BINARY_FLAG {
                    return Err(TelegramError::UnexpectedEnd(byte));
                }
                return Ok(FeedOutcome::TelegramComplete);
            }
        }
        Ok(FeedOutcome::NeedMore)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(buffer: &mut TelegramBuffer, bytes: &[u8]) -> Result<FeedOutcome, TelegramError> {
        let mut outcome = FeedOutcome::NeedMore;
        for &byte in bytes {
            outcome = buffer.feed(byte)?;
        }
        Ok(outcome)
    }

    #[test]
    fn test_format_classification() {
        let mut buffer = TelegramBuffer::new(64);
        buffer.feed(b'/').unwrap();
        assert_eq!(buffer.format(), Format::Ascii);

        buffer.reset();
        buffer.feed(0x7E).unwrap();
        assert_eq!(buffer.format(), Format::Binary);
    }

    #[test]
    fn test_unknown_first_byte() {
        let mut buffer = TelegramBuffer::new(64);
        assert_eq!(buffer.feed(b'X'), Err(TelegramError::UnknownFormat(b'X')));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_ascii_boundary_and_completion() {
        let mut buffer = TelegramBuffer::new(64);
        let telegram = b"/id\r\n1-0:1.8.0(1.0)\r\n!";
        assert_eq!(feed_all(&mut buffer, telegram), Ok(FeedOutcome::NeedMore));
        // Boundary points at the first checksum character, after the '!'.
        assert_eq!(buffer.crc_boundary(), Some(telegram.len()));

        assert_eq!(buffer.feed(b'A'), Ok(FeedOutcome::NeedMore));
        assert_eq!(buffer.feed(b'3'), Ok(FeedOutcome::NeedMore));
        assert_eq!(buffer.feed(b'\r'), Ok(FeedOutcome::NeedMore));
        assert_eq!(buffer.feed(b'\n'), Ok(FeedOutcome::TelegramComplete));
    }

    #[test]
    fn test_buffer_overrun_at_capacity() {
        let mut buffer = TelegramBuffer::new(8);
        feed_all(&mut buffer, b"/1234567").unwrap();
        assert_eq!(buffer.feed(b'8'), Err(TelegramError::BufferOverrun(8)));
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn test_binary_bad_format_bits() {
        let mut buffer = TelegramBuffer::new(64);
        buffer.feed(0x7E).unwrap();
        // Top three bits 0b010 instead of 0b101.
        assert_eq!(buffer.feed(0x40), Err(TelegramError::BadFrameFormat(0x40)));
    }

    #[test]
    fn test_binary_boundary_from_length_field() {
        let mut buffer = TelegramBuffer::new(64);
        buffer.feed(0x7E).unwrap();
        buffer.feed(0xA0).unwrap();
        buffer.feed(0x15).unwrap();
        // ((0xA0 & 0x1F) << 8) + 0x15 - 1 = 0x14
        assert_eq!(buffer.crc_boundary(), Some(0x14));
    }

    #[test]
    fn test_binary_implausible_length() {
        let mut buffer = TelegramBuffer::new(64);
        buffer.feed(0x7E).unwrap();
        buffer.feed(0xA0).unwrap();
        assert_eq!(buffer.feed(0x02), Err(TelegramError::BadFrameLength(1)));

        let mut buffer = TelegramBuffer::new(16);
        buffer.feed(0x7E).unwrap();
        buffer.feed(0xA0).unwrap();
        assert_eq!(buffer.feed(0xFF), Err(TelegramError::BadFrameLength(0xFE)));
    }

    #[test]
    fn test_binary_completion_requires_closing_flag() {
        // Boundary 4: one filler byte, two CRC bytes, then the flag.
        let mut buffer = TelegramBuffer::new(64);
        feed_all(&mut buffer, &[0x7E, 0xA0, 0x05, 0xAA, 0x01, 0x02]).unwrap();
        assert_eq!(buffer.feed(0x7E), Ok(FeedOutcome::TelegramComplete));

        let mut buffer = TelegramBuffer::new(64);
        feed_all(&mut buffer, &[0x7E, 0xA0, 0x05, 0xAA, 0x01, 0x02]).unwrap();
        assert_eq!(buffer.feed(0x33), Err(TelegramError::UnexpectedEnd(0x33)));
    }
}
