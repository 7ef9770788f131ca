use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_yml;
use std::fs::File;
use std::io::prelude::*;
use std::sync::RwLock;
use std::time::Duration;

use crate::reader::ReaderOptions;

fn minimum_period_ms_default() -> u64 { return 2000 }
fn buffer_capacity_default() -> usize { return 2048 }
fn processing_slice_ms_default() -> u64 { return 25 }
fn drain_chunk_default() -> usize { return 200 }
fn recovery_settle_ms_default() -> u64 { return 500 }

fn resend_enabled_default() -> bool { return false }
fn resend_chunk_default() -> usize { return 200 }

#[derive(Deserialize, Serialize, Clone)]
pub struct ResendConfig {
    #[serde(default="resend_enabled_default")]
    pub enabled: bool,
    #[serde(default="resend_chunk_default")]
    pub chunk: usize,
    /// File the demo binary appends forwarded telegrams to.
    pub file: Option<String>,
}

fn resend_default() -> ResendConfig {
    return ResendConfig {
        enabled: resend_enabled_default(),
        chunk: resend_chunk_default(),
        file: None,
    }
}

#[derive(Deserialize, Serialize, Clone)]
pub struct ReaderConfig {
    /// Minimum time between cycle starts; read live on every tick.
    #[serde(default="minimum_period_ms_default")]
    pub minimum_period_ms: u64,
    #[serde(default="buffer_capacity_default")]
    pub buffer_capacity: usize,
    #[serde(default="processing_slice_ms_default")]
    pub processing_slice_ms: u64,
    #[serde(default="drain_chunk_default")]
    pub drain_chunk: usize,
    #[serde(default="recovery_settle_ms_default")]
    pub recovery_settle_ms: u64,
    #[serde(default="resend_default")]
    pub resend: ResendConfig,
}

fn reader_default() -> ReaderConfig {
    return ReaderConfig {
        minimum_period_ms: minimum_period_ms_default(),
        buffer_capacity: buffer_capacity_default(),
        processing_slice_ms: processing_slice_ms_default(),
        drain_chunk: drain_chunk_default(),
        recovery_settle_ms: recovery_settle_ms_default(),
        resend: resend_default(),
    }
}

#[derive(Deserialize, Serialize, Clone)]
pub struct SensorConfig {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

fn replay_bytes_per_tick_default() -> usize { return 64 }
fn replay_tick_ms_default() -> u64 { return 10 }

#[derive(Deserialize, Serialize, Clone)]
pub struct ReplayConfig {
    /// Raw telegram capture the demo binary feeds through the reader.
    pub file: String,
    #[serde(default="replay_bytes_per_tick_default")]
    pub bytes_per_tick: usize,
    #[serde(default="replay_tick_ms_default")]
    pub tick_ms: u64,
}

fn sensors_default() -> Vec<SensorConfig> { return Vec::new() }

#[derive(Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default="reader_default")]
    pub reader: ReaderConfig,
    #[serde(default="sensors_default")]
    pub sensors: Vec<SensorConfig>,
    pub replay: Option<ReplayConfig>,
}

impl Config {
    pub fn from_yaml(contents: &str) -> Result<Config, serde_yml::Error> {
        return serde_yml::from_str(contents);
    }
}

impl From<&ReaderConfig> for ReaderOptions {
    fn from(config: &ReaderConfig) -> ReaderOptions {
        ReaderOptions {
            buffer_capacity: config.buffer_capacity,
            processing_slice: Duration::from_millis(config.processing_slice_ms),
            resend_chunk: config.resend.chunk,
            drain_chunk: config.drain_chunk,
            recovery_settle: Duration::from_millis(config.recovery_settle_ms),
        }
    }
}

pub struct ConfigHolder {
    pub config: Config,
}

impl ConfigHolder {
    pub fn load() -> Self {
        /* Check for the two paths of the config file */
        let mut file = File::open("config/p1reader.yaml");
        if file.is_err() {
            file = Ok(File::open("p1reader.yaml")
                .expect("Unable to read the config on config/p1reader.yaml or p1reader.yaml"));
        }

        let mut file = file.unwrap();

        let mut contents = String::new();
        file.read_to_string(&mut contents).expect("Unable to read config file");
        let c = Config::from_yaml(&contents).expect("Unable to parse config file");
        return ConfigHolder { config: c }
    }
}

lazy_static! {
    pub static ref CONFIG: RwLock<ConfigHolder> = RwLock::new(ConfigHolder::load());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_sections() {
        let config = Config::from_yaml("reader: {}\n").unwrap();
        assert_eq!(config.reader.minimum_period_ms, 2000);
        assert_eq!(config.reader.buffer_capacity, 2048);
        assert_eq!(config.reader.processing_slice_ms, 25);
        assert_eq!(config.reader.resend.enabled, false);
        assert_eq!(config.reader.resend.chunk, 200);
        assert!(config.sensors.is_empty());
        assert!(config.replay.is_none());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
reader:
  minimum_period_ms: 5000
  resend:
    enabled: true
    chunk: 100
    file: forwarded.bin
sensors:
  - { name: energy_consumed, major: 1, minor: 8, micro: 0 }
  - { name: momentary_power, major: 1, minor: 7, micro: 0 }
replay:
  file: capture.bin
  bytes_per_tick: 32
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.reader.minimum_period_ms, 5000);
        assert!(config.reader.resend.enabled);
        assert_eq!(config.reader.resend.chunk, 100);
        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.sensors[0].name, "energy_consumed");
        let replay = config.replay.unwrap();
        assert_eq!(replay.file, "capture.bin");
        assert_eq!(replay.bytes_per_tick, 32);
        assert_eq!(replay.tick_ms, 10);
    }

    #[test]
    fn test_reader_options_conversion() {
        let config = Config::from_yaml("reader: { processing_slice_ms: 5, buffer_capacity: 512 }\n").unwrap();
        let options = ReaderOptions::from(&config.reader);
        assert_eq!(options.buffer_capacity, 512);
        assert_eq!(options.processing_slice, Duration::from_millis(5));
        assert_eq!(options.recovery_settle, Duration::from_millis(500));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "reader:\n  minimum_period_ms: 1234\n").unwrap();
        let contents = std::fs::read_to_string(file.path()).unwrap();
        let config = Config::from_yaml(&contents).unwrap();
        assert_eq!(config.reader.minimum_period_ms, 1234);
    }
}
