//! Per-frame telemetry forwarded to an external bus

use std::time::SystemTime;

use flume::Sender;
use tracing::debug;

use crate::capture::SensorReadings;
use crate::error::TelemetryError;

/// Driver scalars of one frame, tagged with its capture time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    /// Microseconds
    pub exposure_time: f32,
    pub gain: f32,
    /// Degrees Celsius, NaN when the sensor does not report it
    pub temperature: f32,
    pub timestamp: SystemTime,
}

impl TelemetrySample {
    pub fn from_readings(readings: &SensorReadings, timestamp: SystemTime) -> Self {
        Self {
            exposure_time: readings.exposure_time_us,
            gain: readings.gain,
            temperature: readings.temperature_c,
            timestamp,
        }
    }

    /// The bus messages for this sample. Temperature is omitted when unknown.
    pub fn messages(&self, sender_id: u32) -> Vec<TelemetryMessage> {
        let mut out = vec![TelemetryMessage {
            sender_id,
            timestamp: self.timestamp,
            kind: TelemetryKind::ExposureTime(self.exposure_time),
        }];
        if !self.temperature.is_nan() {
            out.push(TelemetryMessage {
                sender_id,
                timestamp: self.timestamp,
                kind: TelemetryKind::Temperature(self.temperature),
            });
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TelemetryKind {
    /// µs
    ExposureTime(f32),
    /// °C
    Temperature(f32),
}

/// One scalar message as it travels on the bus
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryMessage {
    pub sender_id: u32,
    pub timestamp: SystemTime,
    pub kind: TelemetryKind,
}

/// Receives one sample per published frame
pub trait TelemetrySink: Send {
    fn publish(&mut self, sample: &TelemetrySample) -> Result<(), TelemetryError>;
}

/// Writes samples to the log at debug level
pub struct LogSink {
    sender_id: u32,
}

impl LogSink {
    pub fn new(sender_id: u32) -> Self {
        Self { sender_id }
    }
}

impl TelemetrySink for LogSink {
    fn publish(&mut self, sample: &TelemetrySample) -> Result<(), TelemetryError> {
        debug!(
            sender_id = self.sender_id,
            exposure_us = sample.exposure_time,
            gain = sample.gain,
            temperature_c = sample.temperature,
            "telemetry"
        );
        Ok(())
    }
}

/// Forwards bus messages over a flume channel to an in-process bridge
pub struct ChannelSink {
    sender_id: u32,
    tx: Sender<TelemetryMessage>,
}

impl ChannelSink {
    pub fn new(sender_id: u32, tx: Sender<TelemetryMessage>) -> Self {
        Self { sender_id, tx }
    }
}

impl TelemetrySink for ChannelSink {
    fn publish(&mut self, sample: &TelemetrySample) -> Result<(), TelemetryError> {
        for message in sample.messages(self.sender_id) {
            self.tx
                .send(message)
                .map_err(|_| TelemetryError::Disconnected)?;
        }
        Ok(())
    }
}
