//! Battery voltage sampling and noise filtering.
//!
//! One raw ADC conversion is collected per tick, converted to millivolts
//! through the board's resistor-divider formula, and pushed into a ring
//! buffer covering the last 15 seconds. The filtered voltage is the mean of
//! the buffer, clamped into the active curve's band to reject supply ripple.

use crate::error::AdcError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default size of the moving-average window (samples, one per second).
pub const DEFAULT_WINDOW: usize = 15;

/// Delay between consecutive reads in a priming burst.
const BURST_INTERVAL: Duration = Duration::from_millis(1);

/// ADC resolution divisor (10-bit converter).
const ADC_FULL_SCALE: i64 = 1024;

/// Resistor-divider calibration for converting raw samples to millivolts.
///
/// `vref_mv` is SoC-family specific; the known values are 1800, 2500 and
/// 3300 mV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DividerConfig {
    pub vref_mv: i32,
    pub pull_up_ohm: i32,
    pub pull_down_ohm: i32,
}

impl Default for DividerConfig {
    fn default() -> Self {
        Self {
            vref_mv: 2500,
            pull_up_ohm: 200,
            pull_down_ohm: 200,
        }
    }
}

impl DividerConfig {
    /// Convert a raw converter value to battery millivolts.
    pub fn to_millivolts(&self, raw: i32) -> i32 {
        let raw = raw as i64;
        let vref = self.vref_mv as i64;
        let up = self.pull_up_ohm as i64;
        let down = self.pull_down_ohm as i64;
        (raw * vref * (up + down) / (ADC_FULL_SCALE * down)) as i32
    }
}

/// Source of raw ADC conversions.
///
/// The periodic path is kick-and-collect: `start_conversion` requests a new
/// conversion whose completion updates the value returned by `latest`.
/// `read_sync` blocks for a fresh conversion and is used only for priming
/// bursts at cold start and resume.
pub trait AdcReader: Send + Sync {
    fn start_conversion(&self);
    fn latest(&self) -> Result<i32, AdcError>;
    fn read_sync(&self) -> Result<i32, AdcError>;
}

/// ADC channel backed by an IIO sysfs attribute
/// (`/sys/bus/iio/devices/iio:deviceN/in_voltageM_raw`).
pub struct SysfsAdc {
    path: String,
    raw: AtomicI32,
    valid: AtomicBool,
}

impl SysfsAdc {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            raw: AtomicI32::new(0),
            valid: AtomicBool::new(false),
        }
    }

    fn read_attr(&self) -> Result<i32, AdcError> {
        let contents = fs::read_to_string(&self.path).map_err(AdcError::ReadFailed)?;
        contents
            .trim()
            .parse::<i32>()
            .map_err(|_| AdcError::InvalidSample(contents.trim().to_string()))
    }
}

impl AdcReader for SysfsAdc {
    fn start_conversion(&self) {
        match self.read_attr() {
            Ok(raw) => {
                // Completion side touches exactly one scalar.
                self.raw.store(raw, Ordering::Relaxed);
                self.valid.store(true, Ordering::Release);
            }
            Err(e) => {
                debug!("ADC conversion failed: {}", e);
            }
        }
    }

    fn latest(&self) -> Result<i32, AdcError> {
        if self.valid.load(Ordering::Acquire) {
            Ok(self.raw.load(Ordering::Relaxed))
        } else {
            Err(AdcError::NotReady)
        }
    }

    fn read_sync(&self) -> Result<i32, AdcError> {
        let raw = self.read_attr()?;
        self.raw.store(raw, Ordering::Relaxed);
        self.valid.store(true, Ordering::Release);
        Ok(raw)
    }
}

/// Noise-filtered battery voltage sampler.
pub struct VoltageSampler {
    reader: Arc<dyn AdcReader>,
    divider: DividerConfig,
    window: usize,
    samples: VecDeque<i32>,
    /// Pushes since the last invalidation; capacity movement is gated on
    /// this reaching the window size.
    primed_ticks: usize,
    filtered_mv: i32,
    last_raw: i32,
}

impl VoltageSampler {
    pub fn new(reader: Arc<dyn AdcReader>, divider: DividerConfig, window: usize) -> Self {
        Self {
            reader,
            divider,
            window: window.max(1),
            samples: VecDeque::with_capacity(window.max(1)),
            primed_ticks: 0,
            filtered_mv: 0,
            last_raw: 0,
        }
    }

    /// Collect the previous tick's conversion and kick off the next one.
    ///
    /// A read failure skips this tick's push; the buffer and filtered value
    /// are left unchanged.
    pub fn sample_tick(&mut self, band: (i32, i32)) {
        let result = self.reader.latest();
        self.reader.start_conversion();

        match result {
            Ok(raw) => self.push(raw, band),
            Err(e) => {
                debug!("skipping voltage sample: {}", e);
            }
        }
    }

    /// One blocking sample, used by priming bursts.
    pub fn sample_sync(&mut self, band: (i32, i32)) {
        match self.reader.read_sync() {
            Ok(raw) => self.push(raw, band),
            Err(e) => {
                warn!("sync voltage sample failed: {}", e);
            }
        }
    }

    /// Fill the window with one bounded burst of blocking reads.
    ///
    /// Performs exactly `window` reads with a fixed inter-read delay. Used
    /// only at cold start, resume, and source transitions; never on the
    /// periodic tick path.
    pub fn prime_burst(&mut self, band: (i32, i32)) {
        for _ in 0..self.window {
            std::thread::sleep(BURST_INTERVAL);
            self.sample_sync(band);
        }
    }

    fn push(&mut self, raw: i32, band: (i32, i32)) {
        self.last_raw = raw;
        if self.samples.len() >= self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(self.divider.to_millivolts(raw));

        self.primed_ticks = (self.primed_ticks + 1).min(self.window + 1);

        let sum: i64 = self.samples.iter().map(|&mv| mv as i64).sum();
        let mean = (sum / self.samples.len() as i64) as i32;
        self.filtered_mv = mean.clamp(band.0, band.1);
    }

    /// Whether the window has been refilled since the last invalidation.
    pub fn primed(&self) -> bool {
        self.primed_ticks >= self.window
    }

    /// Mark the window stale after a charge-source transition. History is
    /// kept; only the priming gate resets.
    pub fn invalidate(&mut self) {
        self.primed_ticks = 0;
    }

    pub fn filtered_mv(&self) -> i32 {
        self.filtered_mv
    }

    pub fn last_raw(&self) -> i32 {
        self.last_raw
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted ADC returning a fixed sequence of results.
    pub struct ScriptedAdc {
        script: Mutex<VecDeque<Result<i32, ()>>>,
        fallback: i32,
    }

    impl ScriptedAdc {
        pub fn constant(raw: i32) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: raw,
            }
        }

        pub fn sequence(values: Vec<Result<i32, ()>>, fallback: i32) -> Self {
            Self {
                script: Mutex::new(values.into()),
                fallback,
            }
        }

        fn next(&self) -> Result<i32, AdcError> {
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(raw)) => Ok(raw),
                Some(Err(())) => Err(AdcError::NotReady),
                None => Ok(self.fallback),
            }
        }
    }

    impl AdcReader for ScriptedAdc {
        fn start_conversion(&self) {}

        fn latest(&self) -> Result<i32, AdcError> {
            self.next()
        }

        fn read_sync(&self) -> Result<i32, AdcError> {
            self.next()
        }
    }

    fn wide_band() -> (i32, i32) {
        (0, 10_000)
    }

    #[test]
    fn test_sysfs_adc_reads_attribute() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in_voltage0_raw");
        std::fs::write(&path, "512\n").unwrap();

        let adc = SysfsAdc::new(path.to_string_lossy().to_string());
        // No conversion completed yet.
        assert!(adc.latest().is_err());
        assert_eq!(adc.read_sync().unwrap(), 512);

        std::fs::write(&path, "600\n").unwrap();
        adc.start_conversion();
        assert_eq!(adc.latest().unwrap(), 600);
    }

    #[test]
    fn test_divider_conversion() {
        let divider = DividerConfig {
            vref_mv: 2500,
            pull_up_ohm: 200,
            pull_down_ohm: 200,
        };
        // mv = raw * 2500 * 400 / (1024 * 200)
        assert_eq!(divider.to_millivolts(778), 778 * 2500 * 400 / (1024 * 200));
        assert_eq!(divider.to_millivolts(0), 0);
    }

    #[test]
    fn test_priming_burst_fills_window() {
        // raw 778 with the default divider lands close to 3800 mV.
        let divider = DividerConfig::default();
        let raw = 778;
        let adc = Arc::new(ScriptedAdc::constant(raw));
        let mut sampler = VoltageSampler::new(adc, divider, DEFAULT_WINDOW);

        assert!(!sampler.primed());
        sampler.prime_burst(wide_band());
        assert!(sampler.primed());
        assert_eq!(sampler.filtered_mv(), divider.to_millivolts(raw));
    }

    #[test]
    fn test_mean_over_filled_portion() {
        let divider = DividerConfig {
            vref_mv: 1024,
            pull_up_ohm: 0,
            pull_down_ohm: 1,
        };
        // This divider makes mv == raw.
        let adc = Arc::new(ScriptedAdc::sequence(
            vec![Ok(3700), Ok(3800), Ok(3900)],
            3800,
        ));
        let mut sampler = VoltageSampler::new(adc, divider, 15);
        sampler.sample_sync(wide_band());
        sampler.sample_sync(wide_band());
        sampler.sample_sync(wide_band());
        assert_eq!(sampler.filtered_mv(), (3700 + 3800 + 3900) / 3);
    }

    #[test]
    fn test_failed_read_skips_sample() {
        let divider = DividerConfig {
            vref_mv: 1024,
            pull_up_ohm: 0,
            pull_down_ohm: 1,
        };
        let adc = Arc::new(ScriptedAdc::sequence(vec![Ok(3800), Err(())], 3800));
        let mut sampler = VoltageSampler::new(adc, divider, 15);
        sampler.sample_sync(wide_band());
        let before = sampler.filtered_mv();
        sampler.sample_sync(wide_band());
        assert_eq!(sampler.filtered_mv(), before);
        assert_eq!(sampler.samples.len(), 1);
    }

    #[test]
    fn test_ripple_clamp() {
        let divider = DividerConfig {
            vref_mv: 1024,
            pull_up_ohm: 0,
            pull_down_ohm: 1,
        };
        let adc = Arc::new(ScriptedAdc::constant(4500));
        let mut sampler = VoltageSampler::new(adc, divider, 15);
        sampler.sample_sync((3490, 4018));
        assert_eq!(sampler.filtered_mv(), 4018);

        let adc = Arc::new(ScriptedAdc::constant(3000));
        let mut sampler = VoltageSampler::new(adc, divider, 15);
        sampler.sample_sync((3490, 4018));
        assert_eq!(sampler.filtered_mv(), 3490);
    }

    #[test]
    fn test_invalidate_resets_gate_but_keeps_history() {
        let divider = DividerConfig {
            vref_mv: 1024,
            pull_up_ohm: 0,
            pull_down_ohm: 1,
        };
        let adc = Arc::new(ScriptedAdc::constant(3800));
        let mut sampler = VoltageSampler::new(adc, divider, 5);
        sampler.prime_burst(wide_band());
        assert!(sampler.primed());

        sampler.invalidate();
        assert!(!sampler.primed());
        // Filtered value still reflects the retained samples.
        assert_eq!(sampler.filtered_mv(), 3800);

        // Window must refill completely before the gate reopens.
        for i in 0..5 {
            assert_eq!(sampler.primed(), false, "gate open after {} samples", i);
            sampler.sample_sync(wide_band());
        }
        assert!(sampler.primed());
    }
}
