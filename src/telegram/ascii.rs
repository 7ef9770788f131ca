//! Line-by-line parser for ASCII (DSMR-style) telegrams.
//!
//! Runs over the verified buffer and is resumable: the cursor survives
//! between scheduler ticks, so an oversized telegram is processed a slice
//! at a time instead of starving the other cooperative tasks.

use std::str;
use std::time::{Duration, Instant};

use log::debug;

use super::Step;
use crate::sensors::{ObisCode, SensorRegistry};

/// Resumable cursor over the payload lines of one ASCII telegram.
pub struct AsciiParser {
    cursor: usize,
}

impl AsciiParser {
    pub fn new() -> Self {
        AsciiParser { cursor: 0 }
    }

    /// Rewind to the start of the payload, ready for a fresh telegram.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Process lines from `payload` until the telegram ends or `slice`
    /// elapses. `payload` must stop at the checksum boundary, so its final
    /// byte is the `!` terminator.
    pub fn step(&mut self, payload: &[u8], registry: &SensorRegistry, slice: Duration) -> Step {
        let started = Instant::now();
        loop {
            while self.cursor < payload.len()
                && matches!(payload[self.cursor], b'\r' | b'\n')
            {
                self.cursor += 1;
            }
            if self.cursor >= payload.len()
                || payload[self.cursor] == b'!'
                || payload[self.cursor] == 0
            {
                return Step::Done;
            }

            let rest = &payload[self.cursor..];
            let line_len = rest
                .iter()
                .position(|&b| matches!(b, b'\r' | b'\n' | 0 | b'!'))
                .unwrap_or(rest.len());
            parse_line(&rest[..line_len], registry);
            self.cursor += line_len;

            if started.elapsed() >= slice {
                return Step::Yielded;
            }
        }
    }
}

impl Default for AsciiParser {
    fn default() -> Self {
        AsciiParser::new()
    }
}

fn parse_line(line: &[u8], registry: &SensorRegistry) {
    let text = match str::from_utf8(line) {
        Ok(text) => text,
        Err(_) => {
            debug!("skipping non-UTF8 line {}", hex::encode(line));
            return;
        }
    };
    match parse_value_line(text) {
        Some((code, value)) => {
            if !registry.dispatch(code, value) {
                debug!("no sensor matching 1-0:{} (0x{:x})", code, code.raw());
            }
        }
        None => {
            // Identification lines and auxiliary records land here; they are
            // expected, not an error.
            debug!("could not parse value from line '{}'", text);
        }
    }
}

/// Parse the pattern `1-0:<major>.<minor>.<micro>(<float-value>...`.
fn parse_value_line(text: &str) -> Option<(ObisCode, f64)> {
    let rest = text.strip_prefix("1-0:")?;
    let paren = rest.find('(')?;
    let (code_part, value_part) = (&rest[..paren], &rest[paren + 1..]);

    let mut fields = code_part.split('.');
    let major: u32 = fields.next()?.parse().ok()?;
    let minor: u32 = fields.next()?.parse().ok()?;
    let micro: u32 = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }

    // The value runs up to the unit separator or the closing parenthesis.
    let numeric: &str = value_part
        .split(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '-' | '+')))
        .next()?;
    let value: f64 = numeric.parse().ok()?;

    Some((ObisCode::new(major, minor, micro), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::sensors::MeasurementSink;

    struct Recorder {
        values: Rc<RefCell<Vec<f64>>>,
    }

    impl MeasurementSink for Recorder {
        fn publish(&self, value: f64) {
            self.values.borrow_mut().push(value);
        }
    }

    fn recording_registry(major: u32, minor: u32, micro: u32) -> (SensorRegistry, Rc<RefCell<Vec<f64>>>) {
        let values = Rc::new(RefCell::new(Vec::new()));
        let mut registry = SensorRegistry::new();
        registry.bind(
            ObisCode::new(major, minor, micro),
            Box::new(Recorder { values: values.clone() }),
        );
        (registry, values)
    }

    const SLICE: Duration = Duration::from_millis(25);

    #[test]
    fn test_parse_value_line() {
        let (code, value) = parse_value_line("1-0:1.8.0(001234.567*kWh)").unwrap();
        assert_eq!(code, ObisCode::new(1, 8, 0));
        assert_eq!(value, 1234.567);
    }

    #[test]
    fn test_parse_value_line_rejects_other_mediums() {
        assert!(parse_value_line("0-0:1.0.0(210101120000W)").is_none());
        assert!(parse_value_line("not a record").is_none());
        assert!(parse_value_line("1-0:1.8(123)").is_none());
        assert!(parse_value_line("1-0:1.8.0()").is_none());
    }

    #[test]
    fn test_parse_negative_value() {
        let (_, value) = parse_value_line("1-0:16.7.0(-00.423*kW)").unwrap();
        assert_eq!(value, -0.423);
    }

    #[test]
    fn test_step_dispatches_registered_lines() {
        let payload = b"/ELL5\\253833635_A\r\n\r\n1-0:1.8.0(001234.567*kWh)\r\n1-0:3.8.0(000001.023*kvarh)\r\n!";
        let (registry, values) = recording_registry(1, 8, 0);

        let mut parser = AsciiParser::new();
        assert_eq!(parser.step(payload, &registry, SLICE), Step::Done);
        // The 3.8.0 record has no binding and the identification line does
        // not parse; neither stops processing.
        assert_eq!(*values.borrow(), vec![1234.567]);
    }

    #[test]
    fn test_step_stops_at_terminator() {
        let payload = b"1-0:1.8.0(1.0)\r\n!1-0:1.8.0(2.0)\r\n";
        let (registry, values) = recording_registry(1, 8, 0);

        let mut parser = AsciiParser::new();
        assert_eq!(parser.step(payload, &registry, SLICE), Step::Done);
        assert_eq!(*values.borrow(), vec![1.0]);
    }

    #[test]
    fn test_reparse_is_idempotent() {
        let payload = b"1-0:1.8.0(1.5)\r\n1-0:1.8.0(2.5)\r\n!";
        let (registry, values) = recording_registry(1, 8, 0);

        let mut parser = AsciiParser::new();
        parser.step(payload, &registry, SLICE);
        parser.reset();
        parser.step(payload, &registry, SLICE);
        assert_eq!(*values.borrow(), vec![1.5, 2.5, 1.5, 2.5]);
    }

    #[test]
    fn test_zero_slice_yields_between_lines() {
        let payload = b"1-0:1.8.0(1.0)\r\n1-0:1.8.0(2.0)\r\n!";
        let (registry, values) = recording_registry(1, 8, 0);

        let mut parser = AsciiParser::new();
        assert_eq!(parser.step(payload, &registry, Duration::ZERO), Step::Yielded);
        assert_eq!(*values.borrow(), vec![1.0]);
        assert_eq!(parser.step(payload, &registry, Duration::ZERO), Step::Yielded);
        assert_eq!(parser.step(payload, &registry, Duration::ZERO), Step::Done);
        assert_eq!(*values.borrow(), vec![1.0, 2.0]);
    }
}
