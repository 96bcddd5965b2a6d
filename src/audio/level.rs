//! Microphone level metering for visual feedback

use std::time::{Duration, Instant};

use super::validation::samples_le;

/// Tuning for [`LevelMeter`]. The values are empirical, not physical constants.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelMeterConfig {
    /// dBFS mapped to 0.0
    pub noise_floor_db: f32,
    /// dBFS mapped to 1.0
    pub ceiling_db: f32,
    /// Exponent of the compressive curve (< 1 lifts quiet input)
    pub curve_exponent: f32,
    /// Weight of a new value when the level is rising
    pub attack: f32,
    /// Weight of a new value when the level is falling
    pub release: f32,
    pub emit_interval: Duration,
}

impl Default for LevelMeterConfig {
    fn default() -> Self {
        Self {
            noise_floor_db: -50.0,
            ceiling_db: -10.0,
            curve_exponent: 0.6,
            attack: 0.6,
            release: 0.15,
            emit_interval: Duration::from_millis(50),
        }
    }
}

pub struct LevelMeter {
    config: LevelMeterConfig,
    smoothed: f32,
    last_emit: Option<Instant>,
}

impl LevelMeter {
    pub fn new(config: LevelMeterConfig) -> Self {
        Self {
            config,
            smoothed: 0.0,
            last_emit: None,
        }
    }

    /// Feed one validated buffer. Returns a level to publish when the emit
    /// interval has elapsed since the last published one.
    pub fn process(&mut self, buffer: &[u8], now: Instant) -> Option<f32> {
        let target = self.normalized(rms(buffer));
        let weight = if target > self.smoothed {
            self.config.attack
        } else {
            self.config.release
        };
        self.smoothed += (target - self.smoothed) * weight;
        self.smoothed = self.smoothed.clamp(0.0, 1.0);

        let due = self
            .last_emit
            .map_or(true, |at| now.duration_since(at) >= self.config.emit_interval);
        if due {
            self.last_emit = Some(now);
            Some(self.smoothed)
        } else {
            None
        }
    }

    /// Level after dB conversion, normalization and the power curve, before smoothing.
    pub fn normalized(&self, rms: f32) -> f32 {
        if rms <= 0.0 {
            return 0.0;
        }
        let db = 20.0 * rms.log10();
        let span = self.config.ceiling_db - self.config.noise_floor_db;
        let linear = ((db - self.config.noise_floor_db) / span).clamp(0.0, 1.0);
        linear.powf(self.config.curve_exponent)
    }

}

/// RMS of PCM16 LE samples, scaled to full scale = 1.0.
pub fn rms(buffer: &[u8]) -> f32 {
    let mut count = 0usize;
    let mut sum_sq = 0f64;
    for s in samples_le(buffer) {
        let v = s as f64 / 32768.0;
        sum_sq += v * v;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        (sum_sq / count as f64).sqrt() as f32
    }
}
