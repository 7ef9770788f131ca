//! Sensor registration and measurement dispatch.
//!
//! Measurements are addressed by OBIS-style codes. The registry is built
//! once at startup through explicit registration calls and is read-only
//! afterwards, so lookups are safe from any number of readers once the
//! acquisition loop is running.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

/// A three-part OBIS-style measurement code, packed into a single u32 for
/// cheap comparison: `(major & 0xFFF) << 16 | (minor & 0xFF) << 8 | micro`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObisCode(u32);

impl ObisCode {
    pub fn new(major: u32, minor: u32, micro: u32) -> Self {
        ObisCode((major & 0xFFF) << 16 | (minor & 0xFF) << 8 | (micro & 0xFF))
    }

    /// Build a code from the middle three positions of a 6-byte OBIS octet
    /// string (`A-B:C.D.E*F` is transmitted as `[A, B, C, D, E, F]`).
    pub fn from_octets(octets: &[u8; 6]) -> Self {
        ObisCode::new(octets[2] as u32, octets[3] as u32, octets[4] as u32)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn major(&self) -> u32 {
        (self.0 >> 16) & 0xFFF
    }

    pub fn minor(&self) -> u32 {
        (self.0 >> 8) & 0xFF
    }

    pub fn micro(&self) -> u32 {
        self.0 & 0xFF
    }
}

impl fmt::Display for ObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.micro())
    }
}

/// A capability accepting decoded measurement values.
pub trait MeasurementSink {
    fn publish(&self, value: f64);
}

struct SensorState {
    code: ObisCode,
    // f64 bits; NAN means no value published yet.
    value: AtomicU64,
}

/// A cheaply clonable handle to a registered sensor, holding the most
/// recently published value.
#[derive(Clone)]
pub struct Sensor {
    state: Arc<SensorState>,
}

impl Sensor {
    fn new(code: ObisCode) -> Self {
        Sensor {
            state: Arc::new(SensorState {
                code,
                value: AtomicU64::new(f64::NAN.to_bits()),
            }),
        }
    }

    pub fn code(&self) -> ObisCode {
        self.state.code
    }

    /// The last published value, or `None` if no telegram has carried one yet.
    pub fn value(&self) -> Option<f64> {
        let value = f64::from_bits(self.state.value.load(Ordering::Relaxed));
        if value.is_nan() {
            None
        } else {
            Some(value)
        }
    }
}

impl MeasurementSink for Sensor {
    fn publish(&self, value: f64) {
        debug!("sensor 1-0:{} <- {}", self.state.code, value);
        self.state.value.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Lookup table from packed OBIS code to measurement sink.
///
/// Bindings are append-only; the first exact match wins, so a duplicate
/// registration of the same code leaves the earlier one in effect.
pub struct SensorRegistry {
    bindings: Vec<(ObisCode, Box<dyn MeasurementSink>)>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        SensorRegistry { bindings: Vec::new() }
    }

    /// Register a sensor for the given code and return a handle to it.
    pub fn add_sensor(&mut self, major: u32, minor: u32, micro: u32) -> Sensor {
        let code = ObisCode::new(major, minor, micro);
        let sensor = Sensor::new(code);
        self.bind(code, Box::new(sensor.clone()));
        sensor
    }

    /// Bind an arbitrary sink to a code.
    pub fn bind(&mut self, code: ObisCode, sink: Box<dyn MeasurementSink>) {
        self.bindings.push((code, sink));
    }

    pub fn get(&self, code: ObisCode) -> Option<&dyn MeasurementSink> {
        self.bindings
            .iter()
            .find(|(bound, _)| *bound == code)
            .map(|(_, sink)| sink.as_ref())
    }

    /// Publish `value` to the sink bound to `code`. Returns false when no
    /// binding exists; unregistered codes are expected and left to the
    /// caller to log.
    pub fn dispatch(&self, code: ObisCode, value: f64) -> bool {
        match self.get(code) {
            Some(sink) => {
                sink.publish(value);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl Default for SensorRegistry {
    fn default() -> Self {
        SensorRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_packing() {
        let code = ObisCode::new(1, 8, 0);
        assert_eq!(code.raw(), 0x0001_0800);
        assert_eq!(code.major(), 1);
        assert_eq!(code.minor(), 8);
        assert_eq!(code.micro(), 0);
        assert_eq!(code.to_string(), "1.8.0");
    }

    #[test]
    fn test_code_masks_oversized_parts() {
        let code = ObisCode::new(0xFFFF, 0x1FF, 0x3FF);
        assert_eq!(code.major(), 0xFFF);
        assert_eq!(code.minor(), 0xFF);
        assert_eq!(code.micro(), 0xFF);
    }

    #[test]
    fn test_code_from_octets() {
        let octets = [0x01, 0x00, 0x01, 0x08, 0x00, 0xFF];
        assert_eq!(ObisCode::from_octets(&octets), ObisCode::new(1, 8, 0));
    }

    #[test]
    fn test_registry_dispatch() {
        let mut registry = SensorRegistry::new();
        let sensor = registry.add_sensor(1, 8, 0);
        assert_eq!(sensor.value(), None);

        assert!(registry.dispatch(ObisCode::new(1, 8, 0), 1234.567));
        assert_eq!(sensor.value(), Some(1234.567));

        assert!(!registry.dispatch(ObisCode::new(2, 8, 0), 1.0));
    }

    #[test]
    fn test_first_registration_wins() {
        let mut registry = SensorRegistry::new();
        let first = registry.add_sensor(1, 7, 0);
        let second = registry.add_sensor(1, 7, 0);

        registry.dispatch(ObisCode::new(1, 7, 0), 42.0);
        assert_eq!(first.value(), Some(42.0));
        assert_eq!(second.value(), None);
    }
}
