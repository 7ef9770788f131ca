//! P1 port telegram reader
//!
//! Decodes the telegrams a utility smart meter emits on its serial P1 port
//! into a stream of labeled numeric measurements. Both wire formats are
//! supported: the human-readable ASCII (DSMR-style) format protected by a
//! CRC16/ARC checksum, and the compact binary TLV format framed by 0x7E
//! flags and protected by CRC16/X25. Acquisition is driven one cooperative
//! tick at a time and never blocks, so the reader can share a
//! single-threaded scheduler with other tasks.

pub mod config;
pub mod reader;
pub mod sensors;
pub mod telegram;

// Re-export common types for easier access
pub use config::CONFIG;
pub use reader::io::{ByteSink, ByteSource, FixedSettings, NoSignals, ReaderSettings, StatusSignals};
pub use reader::{P1Reader, ReaderOptions};
pub use sensors::{MeasurementSink, ObisCode, Sensor, SensorRegistry};
pub use telegram::{Format, TelegramBuffer, TelegramError};
