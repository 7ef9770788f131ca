//! The telegram acquisition state machine.
//!
//! One [`P1Reader`] runs forever, one cooperative tick at a time: it
//! accumulates a telegram from the byte source, verifies its checksum,
//! parses it with the format-specific parser, optionally re-forwards the
//! verified raw bytes to a secondary consumer, then waits out the configured
//! minimum period before starting over. All cross-tick progress lives in
//! persisted cursors, so every tick returns promptly and a stalled meter
//! only costs O(1) bookkeeping per invocation.
//!
//! Nothing that goes wrong on the wire is fatal. Format, capacity and
//! integrity errors all funnel into an error-recovery state that drains the
//! meter's in-flight transmission and lets the next telegram start clean.

use std::str;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::sensors::SensorRegistry;
use crate::telegram::ascii::AsciiParser;
use crate::telegram::binary::BinaryParser;
use crate::telegram::crc::{crc16_arc, crc16_x25};
use crate::telegram::{FeedOutcome, Format, Step, TelegramBuffer, TelegramError};

pub mod io;

use io::{ByteSink, ByteSource, ReaderSettings, StatusSignals};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingMessage,
    VerifyingCrc,
    ProcessingAscii,
    ProcessingBinary,
    Resending,
    Waiting,
    ErrorRecovery,
}

/// Tuning knobs fixed at reader construction. The minimum inter-cycle
/// period is not here; it is re-read live through [`ReaderSettings`] on
/// every tick.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Telegram buffer capacity in bytes.
    pub buffer_capacity: usize,
    /// Budget for one processing tick, so a large telegram cannot starve
    /// the other cooperative tasks.
    pub processing_slice: Duration,
    /// Bytes re-forwarded to the secondary consumer per tick.
    pub resend_chunk: usize,
    /// Bytes discarded from the source per error-recovery tick.
    pub drain_chunk: usize,
    /// Quiet time after draining before the next cycle may start.
    pub recovery_settle: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            buffer_capacity: 2048,
            processing_slice: Duration::from_millis(25),
            resend_chunk: 200,
            drain_chunk: 200,
            recovery_settle: Duration::from_millis(500),
        }
    }
}

/// Phase entry timestamps for one cycle; diagnostics only.
#[derive(Default, Clone, Copy)]
struct CycleTimers {
    reading: Option<Instant>,
    verifying: Option<Instant>,
    processing: Option<Instant>,
    resending: Option<Instant>,
}

impl CycleTimers {
    fn log_cycle(&self) {
        let (Some(reading), Some(verifying)) = (self.reading, self.verifying) else {
            return;
        };
        let done = Instant::now();
        let receive = verifying.duration_since(reading);
        let decode = done.duration_since(verifying);
        if let Some(resending) = self.resending {
            debug!(
                "cycle timing: receive {:?}, decode {:?} (resend {:?}), total {:?}",
                receive,
                decode,
                done.duration_since(resending),
                done.duration_since(reading)
            );
        } else {
            debug!(
                "cycle timing: receive {:?}, decode {:?}, total {:?}",
                receive,
                decode,
                done.duration_since(reading)
            );
        }
    }
}

/// The P1 port telegram reader.
///
/// Construct it with the startup-time sensor registry and the host's I/O
/// capabilities, then call [`tick`](P1Reader::tick) from the scheduler. Each
/// tick executes at most one state's work and never blocks.
pub struct P1Reader {
    state: State,
    buffer: TelegramBuffer,
    ascii: AsciiParser,
    binary: BinaryParser,
    registry: SensorRegistry,
    source: Box<dyn ByteSource>,
    secondary: Option<Box<dyn ByteSink>>,
    signals: Box<dyn StatusSignals>,
    settings: Box<dyn ReaderSettings>,
    options: ReaderOptions,
    resend_cursor: usize,
    period_start: Instant,
    recovery_entered: Instant,
    timers: CycleTimers,
}

impl P1Reader {
    pub fn new(
        registry: SensorRegistry,
        source: Box<dyn ByteSource>,
        secondary: Option<Box<dyn ByteSink>>,
        signals: Box<dyn StatusSignals>,
        settings: Box<dyn ReaderSettings>,
        options: ReaderOptions,
    ) -> Self {
        let now = Instant::now();
        let mut reader = P1Reader {
            state: State::Waiting,
            buffer: TelegramBuffer::new(options.buffer_capacity),
            ascii: AsciiParser::new(),
            binary: BinaryParser::new(),
            registry,
            source,
            secondary,
            signals,
            settings,
            options,
            resend_cursor: 0,
            period_start: now,
            recovery_entered: now,
            timers: CycleTimers::default(),
        };
        reader.enter(State::ReadingMessage);
        reader
    }

    /// Run at most one state's work. Called by the host scheduler; returns
    /// promptly, bounded by the processing time slice.
    pub fn tick(&mut self) {
        match self.state {
            State::ReadingMessage => self.read_available(),
            State::VerifyingCrc => self.verify_crc(),
            State::ProcessingAscii => self.process_ascii(),
            State::ProcessingBinary => self.process_binary(),
            State::Resending => self.resend(),
            State::Waiting => self.wait_for_period(),
            State::ErrorRecovery => self.recover(),
        }
    }

    /// True while the reader sits between cycles.
    pub fn is_waiting(&self) -> bool {
        self.state == State::Waiting
    }

    fn enter(&mut self, state: State) {
        match state {
            State::ReadingMessage => {
                self.buffer.reset();
                self.signals.set_ready_to_receive(true);
                self.signals.set_activity(true);
                self.period_start = Instant::now();
                self.timers = CycleTimers::default();
                self.timers.reading = Some(self.period_start);
            }
            State::VerifyingCrc => {
                // Back-pressure the meter while checksum and parsing run.
                self.signals.set_ready_to_receive(false);
                self.timers.verifying = Some(Instant::now());
            }
            State::ProcessingAscii => {
                self.ascii.reset();
                self.timers.processing = Some(Instant::now());
            }
            State::ProcessingBinary => {
                self.binary.reset();
                self.timers.processing = Some(Instant::now());
            }
            State::Resending => {
                let enabled = self
                    .secondary
                    .as_ref()
                    .map(|sink| sink.enabled())
                    .unwrap_or(false);
                if !enabled {
                    self.enter(State::Waiting);
                    return;
                }
                self.resend_cursor = 0;
                self.timers.resending = Some(Instant::now());
            }
            State::Waiting => {
                self.signals.set_activity(false);
                self.timers.log_cycle();
            }
            State::ErrorRecovery => {
                self.signals.set_ready_to_receive(false);
                self.recovery_entered = Instant::now();
            }
        }
        self.state = state;
    }

    fn fail(&mut self, error: TelegramError) {
        warn!("{}; telegram discarded", error);
        self.enter(State::ErrorRecovery);
    }

    fn read_available(&mut self) {
        while self.source.available() > 0 {
            let byte = match self.source.read() {
                Some(byte) => byte,
                None => break,
            };
            match self.buffer.feed(byte) {
                Ok(FeedOutcome::NeedMore) => {}
                Ok(FeedOutcome::TelegramComplete) => {
                    self.enter(State::VerifyingCrc);
                    return;
                }
                Err(error) => {
                    if matches!(error, TelegramError::BufferOverrun(_)) {
                        // The rest of this burst can only be more of the
                        // same oversized telegram.
                        while self.source.available() > 0 {
                            let _ = self.source.read();
                        }
                    }
                    self.fail(error);
                    return;
                }
            }
        }
    }

    fn verify_crc(&mut self) {
        let result = match self.buffer.format() {
            Format::Ascii => self.check_ascii_crc(),
            Format::Binary => self.check_binary_crc(),
            Format::Unknown => Err(TelegramError::BadCrcField),
        };
        match result {
            Ok(()) => match self.buffer.format() {
                Format::Ascii => self.enter(State::ProcessingAscii),
                Format::Binary => self.enter(State::ProcessingBinary),
                Format::Unknown => self.fail(TelegramError::BadCrcField),
            },
            Err(error) => {
                self.dump_buffer();
                self.fail(error);
            }
        }
    }

    fn check_ascii_crc(&self) -> Result<(), TelegramError> {
        let boundary = self
            .buffer
            .crc_boundary()
            .ok_or(TelegramError::BadCrcField)?;
        let data = self.buffer.data();
        let calculated = crc16_arc(&data[..boundary]);
        let field =
            str::from_utf8(&data[boundary..]).map_err(|_| TelegramError::BadCrcField)?;
        let received = u16::from_str_radix(field.trim_end(), 16)
            .map_err(|_| TelegramError::BadCrcField)?;
        if calculated != received {
            return Err(TelegramError::CrcMismatch { calculated, received });
        }
        Ok(())
    }

    fn check_binary_crc(&self) -> Result<(), TelegramError> {
        let boundary = self
            .buffer
            .crc_boundary()
            .ok_or(TelegramError::BadCrcField)?;
        let data = self.buffer.data();
        if data.len() < boundary + 2 {
            return Err(TelegramError::BadCrcField);
        }
        let calculated = crc16_x25(&data[1..boundary]);
        let received = u16::from_le_bytes([data[boundary], data[boundary + 1]]);
        if calculated != received {
            return Err(TelegramError::CrcMismatch { calculated, received });
        }
        Ok(())
    }

    fn dump_buffer(&self) {
        match self.buffer.format() {
            Format::Binary => debug!("rejected frame: {}", hex::encode(self.buffer.data())),
            _ => debug!(
                "rejected telegram:\n{}",
                String::from_utf8_lossy(self.buffer.data())
            ),
        }
    }

    fn process_ascii(&mut self) {
        let Some(boundary) = self.buffer.crc_boundary() else {
            self.fail(TelegramError::BadCrcField);
            return;
        };
        let payload = &self.buffer.data()[..boundary];
        let step = self
            .ascii
            .step(payload, &self.registry, self.options.processing_slice);
        if step == Step::Done {
            self.enter(State::Resending);
        }
    }

    fn process_binary(&mut self) {
        let Some(boundary) = self.buffer.crc_boundary() else {
            self.fail(TelegramError::BadCrcField);
            return;
        };
        let result = self.binary.step(
            self.buffer.data(),
            boundary,
            &self.registry,
            self.options.processing_slice,
        );
        match result {
            Ok(Step::Done) => self.enter(State::Resending),
            Ok(Step::Yielded) => {}
            Err(error) => self.fail(error),
        }
    }

    fn resend(&mut self) {
        let Some(sink) = self.secondary.as_mut() else {
            self.enter(State::Waiting);
            return;
        };
        let data = self.buffer.data();
        let end = (self.resend_cursor + self.options.resend_chunk).min(data.len());
        while self.resend_cursor < end {
            sink.write(data[self.resend_cursor]);
            self.resend_cursor += 1;
        }
        if self.resend_cursor >= data.len() {
            self.enter(State::Waiting);
        }
    }

    fn wait_for_period(&mut self) {
        // Read live so a configuration change takes effect without restart.
        let minimum_period = self.settings.minimum_period();
        if self.period_start.elapsed() >= minimum_period {
            self.enter(State::ReadingMessage);
        }
    }

    fn recover(&mut self) {
        let mut drained = 0;
        while drained < self.options.drain_chunk && self.source.available() > 0 {
            if self.source.read().is_none() {
                break;
            }
            drained += 1;
        }
        if drained > 0 {
            debug!("error recovery drained {} stale bytes", drained);
        }
        if self.source.available() == 0
            && self.recovery_entered.elapsed() >= self.options.recovery_settle
        {
            self.enter(State::Waiting);
        }
    }
}
