use p1reader::config::{ReplayConfig, SensorConfig};
use p1reader::reader::io::{ByteSink, ByteSource, ReaderSettings, StatusSignals};
use p1reader::{P1Reader, ReaderOptions, Sensor, SensorRegistry, CONFIG};

use log::{debug, info, warn};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::rc::Rc;
use std::time::Duration;

/// Feeds a captured telegram stream to the reader a few bytes per tick,
/// standing in for the serial transport. The scheduler loop refills the
/// budget before each tick, so the capture arrives in bursts the way a
/// meter paces its output.
struct ReplaySource {
    queue: Rc<RefCell<VecDeque<u8>>>,
    budget: Rc<Cell<usize>>,
}

impl ByteSource for ReplaySource {
    fn available(&mut self) -> usize {
        self.queue.borrow().len().min(self.budget.get())
    }

    fn read(&mut self) -> Option<u8> {
        if self.budget.get() == 0 {
            return None;
        }
        let byte = self.queue.borrow_mut().pop_front();
        if byte.is_some() {
            self.budget.set(self.budget.get() - 1);
        }
        byte
    }
}

/// Appends forwarded telegram bytes to a file.
struct FileSink {
    file: fs::File,
}

impl ByteSink for FileSink {
    fn enabled(&self) -> bool {
        true
    }

    fn write(&mut self, byte: u8) {
        if let Err(e) = self.file.write_all(&[byte]) {
            warn!("resend write failed: {e}");
        }
    }
}

/// Logs handshake line changes instead of driving GPIO pins.
struct LoggedSignals;

impl StatusSignals for LoggedSignals {
    fn set_ready_to_receive(&mut self, on: bool) {
        debug!("ready-to-receive -> {}", if on { "high" } else { "low" });
    }

    fn set_activity(&mut self, on: bool) {
        debug!("activity -> {}", if on { "high" } else { "low" });
    }
}

/// Reads the minimum period from the live configuration on every tick.
struct LiveSettings;

impl ReaderSettings for LiveSettings {
    fn minimum_period(&self) -> Duration {
        let ms = CONFIG.read().unwrap().config.reader.minimum_period_ms;
        Duration::from_millis(ms)
    }
}

fn build_registry(sensors: &[SensorConfig]) -> (SensorRegistry, Vec<(String, Sensor)>) {
    let mut registry = SensorRegistry::new();
    let mut handles = Vec::new();
    for sensor in sensors {
        let handle = registry.add_sensor(sensor.major, sensor.minor, sensor.micro);
        info!(
            "registered sensor '{}' for 1-0:{}.{}.{}",
            sensor.name, sensor.major, sensor.minor, sensor.micro
        );
        handles.push((sensor.name.clone(), handle));
    }
    (registry, handles)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter = std::env::var("P1_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let (reader_config, sensors, replay) = {
        let config = CONFIG.read().unwrap();
        (
            config.config.reader.clone(),
            config.config.sensors.clone(),
            config.config.replay.clone(),
        )
    };

    let Some(ReplayConfig { file, bytes_per_tick, tick_ms }) = replay else {
        warn!("no replay section in the configuration, nothing to do");
        return Ok(());
    };

    let capture = fs::read(&file)?;
    info!("replaying {} bytes from {}", capture.len(), file);
    let queue = Rc::new(RefCell::new(VecDeque::from(capture)));
    let budget = Rc::new(Cell::new(0));

    let (registry, handles) = build_registry(&sensors);
    if registry.is_empty() {
        warn!("no sensors configured, decoded values will be discarded");
    } else {
        info!("{} sensors registered", registry.len());
    }

    let secondary: Option<Box<dyn ByteSink>> = match (reader_config.resend.enabled, &reader_config.resend.file) {
        (true, Some(path)) => {
            let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            info!("forwarding verified telegrams to {}", path);
            Some(Box::new(FileSink { file }))
        }
        (true, None) => {
            warn!("resend enabled but no resend file configured");
            None
        }
        _ => None,
    };

    let mut reader = P1Reader::new(
        registry,
        Box::new(ReplaySource { queue: queue.clone(), budget: budget.clone() }),
        secondary,
        Box::new(LoggedSignals),
        Box::new(LiveSettings),
        ReaderOptions::from(&reader_config),
    );

    let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
    let mut idle_ticks = 0;
    loop {
        interval.tick().await;
        budget.set(bytes_per_tick);
        reader.tick();

        if queue.borrow().is_empty() && reader.is_waiting() {
            idle_ticks += 1;
        } else {
            idle_ticks = 0;
        }
        // The capture is exhausted and the reader has settled; report and exit.
        if idle_ticks > 50 {
            break;
        }
    }

    for (name, sensor) in &handles {
        match sensor.value() {
            Some(value) => info!("{} (1-0:{}): {}", name, sensor.code(), value),
            None => info!("{} (1-0:{}): no value received", name, sensor.code()),
        }
    }
    Ok(())
}
