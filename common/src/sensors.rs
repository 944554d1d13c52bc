use tracing::{debug, warn};

use crate::{error::SensorError, types::SensorSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Temperature,
    Humidity,
    Pressure,
    GasResistance,
    LightLevel,
    SoundLevel,
    Battery,
}

impl Quantity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Pressure => "pressure",
            Self::GasResistance => "gasResistance",
            Self::LightLevel => "lightLevel",
            Self::SoundLevel => "soundLevel",
            Self::Battery => "battery",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reading {
    values: Vec<(Quantity, f32)>,
}

impl Reading {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(quantity: Quantity, value: f32) -> Self {
        Self::new().with(quantity, value)
    }

    pub fn with(mut self, quantity: Quantity, value: f32) -> Self {
        self.values.push((quantity, value));
        self
    }

    pub fn values(&self) -> &[(Quantity, f32)] {
        &self.values
    }
}

pub trait SensorDriver {
    fn name(&self) -> &'static str;
    fn read(&mut self) -> Result<Reading, SensorError>;
}

pub struct SensorBank {
    drivers: Vec<Box<dyn SensorDriver + Send>>,
    last: SensorSnapshot,
}

impl SensorBank {
    pub fn new() -> Self {
        Self {
            drivers: Vec::new(),
            last: SensorSnapshot::default(),
        }
    }

    pub fn with_driver(mut self, driver: impl SensorDriver + Send + 'static) -> Self {
        self.drivers.push(Box::new(driver));
        self
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    pub fn last(&self) -> &SensorSnapshot {
        &self.last
    }

    // Failed or non-finite readings keep the last-known-good value.
    pub fn sample(&mut self, motion: bool, captured_at: i64) -> SensorSnapshot {
        let mut next = self.last;
        next.motion_status = motion;
        next.captured_at = captured_at;

        for driver in self.drivers.iter_mut() {
            match driver.read() {
                Ok(reading) => {
                    for &(quantity, value) in reading.values() {
                        if value.is_finite() {
                            set_field(&mut next, quantity, value);
                        } else {
                            warn!(
                                "{} produced non-finite {}; keeping {}",
                                driver.name(),
                                quantity.as_str(),
                                field(&next, quantity)
                            );
                        }
                    }
                }
                Err(err) => warn!("sensor read failed, keeping last values: {err}"),
            }
        }

        debug!(
            "sampled: T={:.1} H={:.1} P={:.1} light={:.1}",
            next.temperature, next.humidity, next.pressure, next.light_level
        );
        self.last = next;
        next
    }
}

impl Default for SensorBank {
    fn default() -> Self {
        Self::new()
    }
}

fn set_field(snapshot: &mut SensorSnapshot, quantity: Quantity, value: f32) {
    match quantity {
        Quantity::Temperature => snapshot.temperature = value,
        Quantity::Humidity => snapshot.humidity = value,
        Quantity::Pressure => snapshot.pressure = value,
        Quantity::GasResistance => snapshot.gas_resistance = value,
        Quantity::LightLevel => snapshot.light_level = value,
        Quantity::SoundLevel => snapshot.sound_level = value,
        Quantity::Battery => snapshot.battery_level = value,
    }
}

fn field(snapshot: &SensorSnapshot, quantity: Quantity) -> f32 {
    match quantity {
        Quantity::Temperature => snapshot.temperature,
        Quantity::Humidity => snapshot.humidity,
        Quantity::Pressure => snapshot.pressure,
        Quantity::GasResistance => snapshot.gas_resistance,
        Quantity::LightLevel => snapshot.light_level,
        Quantity::SoundLevel => snapshot.sound_level,
        Quantity::Battery => snapshot.battery_level,
    }
}
