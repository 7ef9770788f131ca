//! Hardware seams of the acquisition loop.
//!
//! The reader never touches a UART or a GPIO pin directly; the host hands it
//! these capabilities and the state machine calls them at its transitions.
//! All operations must be non-blocking, since the loop is driven by a
//! cooperative scheduler and has to return promptly from every tick.

use std::time::Duration;

/// Non-blocking byte input from the meter.
pub trait ByteSource {
    /// How many bytes can be read right now without blocking.
    fn available(&mut self) -> usize;

    /// Read one byte, or `None` if nothing is pending.
    fn read(&mut self) -> Option<u8>;
}

/// Non-blocking byte output toward an optional secondary consumer of the
/// verified raw telegram.
pub trait ByteSink {
    /// Gates whether the resend phase does any work. Read at state entry,
    /// so it can change between telegrams.
    fn enabled(&self) -> bool;

    fn write(&mut self, byte: u8);
}

/// The two handshake outputs the reader toggles: "ready to receive"
/// (back-pressures the meter while a telegram is checked and parsed) and
/// "activity" (high while a cycle is in flight).
pub trait StatusSignals {
    fn set_ready_to_receive(&mut self, on: bool);

    fn set_activity(&mut self, on: bool);
}

/// Signal output for hosts without handshake lines.
pub struct NoSignals;

impl StatusSignals for NoSignals {
    fn set_ready_to_receive(&mut self, _on: bool) {}

    fn set_activity(&mut self, _on: bool) {}
}

/// Live-tunable settings, queried fresh on every tick rather than captured
/// at startup.
pub trait ReaderSettings {
    /// Minimum time between the starts of two read cycles.
    fn minimum_period(&self) -> Duration;
}

/// A constant minimum period, for hosts without live configuration.
pub struct FixedSettings(pub Duration);

impl ReaderSettings for FixedSettings {
    fn minimum_period(&self) -> Duration {
        self.0
    }
}
