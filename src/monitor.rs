//! Battery monitor composition.
//!
//! One `BatteryMonitor` exists per physical battery. It owns the sampler,
//! the charge-source detector, the estimator and the persisted record, and
//! is driven by a once-per-second tick from the runtime. The tick order
//! matches the measurement pipeline: detect the supply first (it selects
//! the lookup curve and clamp band), then refresh status and full-charge
//! bookkeeping, then sample, then converge.

use crate::charger::ChargeSourceDetector;
use crate::estimator::{BatteryStatus, CapacityEstimator, ChargeRequest, Reading};
use crate::sampler::VoltageSampler;
use crate::store::CapacityStore;
use crate::supply::{
    reported_status, BatteryHealth, BatteryProperty, BatterySnapshot, BatteryTechnology,
    PropertyValue,
};
use crate::table::CapacityTable;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Maximum priming rounds when the detected source keeps flipping during a
/// burst. Keeps cold start and resume strictly bounded.
const MAX_PRIME_ROUNDS: u32 = 3;

/// Monitor-level policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    /// Power-off threshold, mV; 0 selects the table's zero voltage.
    pub low_voltage_protection_mv: i32,
    /// Whether the displayed capacity is persisted and reloaded at boot.
    pub save_capacity: bool,
    /// Bounded retries for the power-on capacity load (storage may come up
    /// after the daemon).
    pub poweron_load_attempts: u32,
    pub poweron_retry_delay_ms: u64,
    /// Suspended duration at or above which resume recomputes from a fresh
    /// burst instead of trusting the snapshot.
    pub resume_recompute_secs: u64,
    /// Mid-band capacity changes skipped between persists (wear limit).
    pub persist_throttle: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            low_voltage_protection_mv: 0,
            save_capacity: true,
            poweron_load_attempts: 50,
            poweron_retry_delay_ms: 100,
            resume_recompute_secs: 3600,
            persist_throttle: 5,
        }
    }
}

/// The composed battery state machine.
pub struct BatteryMonitor {
    table: CapacityTable,
    sampler: VoltageSampler,
    detector: ChargeSourceDetector,
    estimator: CapacityEstimator,
    store: Option<CapacityStore>,
    settings: MonitorSettings,
    snapshot_tx: watch::Sender<BatterySnapshot>,

    poweron_check: bool,
    persist_skips: u32,
    suspend_capacity: u8,
    suspend_time: u64,
    resume_time: u64,
    resume_pending: bool,
    debug_ticks: u32,
}

impl BatteryMonitor {
    pub fn new(
        table: CapacityTable,
        sampler: VoltageSampler,
        detector: ChargeSourceDetector,
        estimator: CapacityEstimator,
        store: Option<CapacityStore>,
        settings: MonitorSettings,
        snapshot_tx: watch::Sender<BatterySnapshot>,
    ) -> Self {
        let poweron_check = settings.save_capacity && store.is_some();
        Self {
            table,
            sampler,
            detector,
            estimator,
            store,
            settings,
            snapshot_tx,
            poweron_check,
            persist_skips: 0,
            suspend_capacity: 0,
            suspend_time: 0,
            resume_time: 0,
            resume_pending: false,
            debug_ticks: 0,
        }
    }

    /// Cold-start detection. Blocking: runs one bounded priming burst per
    /// round, restarting while the detected source keeps flipping, then
    /// seeds the first displayed value so consumers never see a default.
    pub fn power_on_check(&mut self) {
        let mut det = self.detector.detect_tick();
        for _ in 0..MAX_PRIME_ROUNDS {
            self.sampler
                .prime_burst(self.table.clamp_band(det.source.charging()));
            let again = self.detector.detect_tick();
            let stable = again.source == det.source;
            det = again;
            if stable {
                break;
            }
        }

        let charging = det.source.charging();
        let mv = self.sampler.filtered_mv();
        let capacity = self.table.lookup(mv, charging);
        let status = if charging {
            BatteryStatus::Charging
        } else {
            BatteryStatus::NotCharging
        };
        self.estimator.seed(capacity, status);
        if charging {
            self.estimator.latch_anchor(mv);
        }
        info!(
            voltage_mv = mv,
            capacity,
            source = ?det.source,
            "battery detected"
        );
        self.publish();

        // Hard low-voltage policy: an orderly power-off, not an error.
        let threshold = if self.settings.low_voltage_protection_mv > 0 {
            self.settings.low_voltage_protection_mv
        } else {
            self.table.zero_voltage_mv
        };
        if mv <= threshold && !charging {
            warn!(voltage_mv = mv, threshold, "battery below power-down voltage");
            self.detector.request_power_off();
        } else if self.detector.batt_low() {
            warn!(voltage_mv = mv, "battery-low line asserted");
        }
    }

    /// One periodic update. `now_secs` is wall-clock seconds; the
    /// full-charge hold timer must survive suspend, which freezes tick
    /// counting but not the wall clock.
    pub fn tick(&mut self, now_secs: u64) {
        if self.resume_pending {
            self.resume_pending = false;
            let slept = self.resume_time.saturating_sub(self.suspend_time);
            if slept >= self.settings.resume_recompute_secs {
                debug!(slept, "long suspend, recomputing capacity");
                self.resume_check();
            } else {
                self.estimator
                    .seed(self.suspend_capacity, self.estimator.status());
            }
        }

        if self.poweron_check {
            self.poweron_check = false;
            self.poweron_capacity_seed();
        }

        let det = self.detector.detect_tick();
        let mut changed = det.changed;
        if det.changed {
            // The effective IR offset shifts abruptly with the source; the
            // averaged history no longer represents the rail. Refill it
            // immediately and hold capacity movement until the window has
            // also refilled at tick cadence.
            self.sampler
                .prime_burst(self.table.clamp_band(det.source.charging()));
            self.sampler.invalidate();
        }

        let charging = det.source.charging();
        let charge_ok = self.detector.charge_complete(charging);

        let status_out = self.estimator.update_status(det.source, charge_ok, now_secs);
        if let Some(req) = status_out.charge_request {
            self.detector.set_charging(req == ChargeRequest::Start);
        }
        if let Some(led) = status_out.led {
            self.detector.set_charge_led(led);
        }
        changed |= status_out.changed;

        self.sampler.sample_tick(self.table.clamp_band(charging));

        let reading = Reading {
            source: det.source,
            charge_ok,
            voltage_mv: self.sampler.filtered_mv(),
            primed: self.sampler.primed(),
            display_load: self.detector.display_load(),
        };
        changed |= self.estimator.converge(&self.table, &reading);

        self.detector.update_wake_lock(charging);

        if changed {
            self.persist_throttled();
            self.publish();
        }

        self.debug_ticks += 1;
        if self.debug_ticks >= 10 {
            self.debug_ticks = 0;
            debug!(
                raw = self.sampler.last_raw(),
                voltage_mv = self.sampler.filtered_mv(),
                capacity = self.estimator.capacity(),
                status = ?self.estimator.status(),
                source = ?det.source,
                "monitor state"
            );
        }
    }

    /// Replace the live estimate with the persisted one at first tick.
    /// Storage may not be mounted yet when the daemon starts, hence the
    /// bounded retry loop.
    fn poweron_capacity_seed(&mut self) {
        let Some(store) = &self.store else {
            return;
        };

        let mut loaded = None;
        for attempt in 0..self.settings.poweron_load_attempts.max(1) {
            match store.load() {
                Ok(v) => {
                    loaded = Some(v);
                    break;
                }
                Err(e) => {
                    debug!(attempt, "persisted capacity not readable: {}", e);
                    std::thread::sleep(Duration::from_millis(
                        self.settings.poweron_retry_delay_ms,
                    ));
                }
            }
        }

        let live = self.estimator.capacity();
        let mut capacity = match loaded {
            Some(v) => v,
            None => {
                warn!("no persisted capacity, seeding from live estimate");
                live
            }
        };
        if capacity == 0 {
            capacity = 1;
        }

        info!(capacity, live, "power-on capacity seeded");
        self.estimator.seed(capacity, self.estimator.status());
        store.save_lossy(capacity);
        self.persist_skips = 1;
        self.publish();
    }

    /// Persist on change, throttled in the uninteresting middle band to
    /// limit storage wear.
    fn persist_throttled(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        let capacity = self.estimator.capacity();
        if capacity > 10 && capacity < 95 {
            if self.persist_skips >= self.settings.persist_throttle {
                store.save_lossy(capacity);
                self.persist_skips = 0;
            } else {
                self.persist_skips += 1;
            }
        } else {
            store.save_lossy(capacity);
            self.persist_skips = 0;
        }
    }

    /// Snapshot state ahead of system suspend. Ticks stop until resume.
    pub fn suspend(&mut self, now_secs: u64) {
        self.suspend_capacity = self.estimator.capacity();
        self.suspend_time = now_secs;
        info!(capacity = self.suspend_capacity, "suspending battery monitor");
    }

    /// Note resume; the next tick decides between restoring the snapshot
    /// and a full recompute.
    pub fn resume(&mut self, now_secs: u64) {
        self.resume_time = now_secs;
        self.resume_pending = true;
    }

    /// Fresh burst and recompute after a long suspend. The direction rule
    /// keeps the displayed value from jumping the wrong way: charging can
    /// only have raised the true capacity, discharging only lowered it.
    fn resume_check(&mut self) {
        let mut det = self.detector.detect_tick();
        for _ in 0..MAX_PRIME_ROUNDS {
            self.sampler
                .prime_burst(self.table.clamp_band(det.source.charging()));
            let again = self.detector.detect_tick();
            let stable = again.source == det.source;
            det = again;
            if stable {
                break;
            }
        }
        self.sampler.invalidate();

        let charging = det.source.charging();
        let mv = self.sampler.filtered_mv();
        let new_capacity = match self.estimator.anchor() {
            Some(anchor) if charging => self.table.lookup_anchored(mv, &anchor),
            _ => self.table.lookup(mv, charging),
        };
        let old_capacity = self.suspend_capacity;
        let capacity = if charging {
            new_capacity.max(old_capacity)
        } else {
            new_capacity.min(old_capacity)
        };
        let status = if charging {
            BatteryStatus::Charging
        } else {
            BatteryStatus::NotCharging
        };
        info!(new_capacity, old_capacity, capacity, "resume recompute");
        self.estimator.seed(capacity, status);
    }

    /// Final persist on daemon shutdown, unthrottled.
    pub fn shutdown_persist(&self) {
        if let Some(store) = &self.store {
            store.save_lossy(self.estimator.capacity());
        }
    }

    /// Out-of-band DC presence edge; safe from any context.
    pub fn note_dc_event(&self) {
        self.detector.note_dc_event();
    }

    pub fn capacity(&self) -> u8 {
        self.estimator.capacity()
    }

    pub fn status(&self) -> BatteryStatus {
        self.estimator.status()
    }

    pub fn voltage_mv(&self) -> i32 {
        self.sampler.filtered_mv()
    }

    /// Power-supply-style property access.
    pub fn property(&self, property: BatteryProperty) -> PropertyValue {
        match property {
            BatteryProperty::Status => {
                PropertyValue::Status(reported_status(self.estimator.status()))
            }
            BatteryProperty::Health => PropertyValue::Health(BatteryHealth::Good),
            BatteryProperty::Present => PropertyValue::Bool(self.sampler.filtered_mv() > 0),
            BatteryProperty::VoltageNow => PropertyValue::Millivolts(self.sampler.filtered_mv()),
            BatteryProperty::Capacity => PropertyValue::Percent(self.estimator.capacity()),
            BatteryProperty::Technology => {
                PropertyValue::Technology(BatteryTechnology::LithiumIon)
            }
            BatteryProperty::VoltageMaxDesign => {
                PropertyValue::Millivolts(self.table.max_voltage_mv)
            }
            BatteryProperty::VoltageMinDesign => {
                PropertyValue::Millivolts(self.table.zero_voltage_mv)
            }
        }
    }

    fn publish(&self) {
        let snapshot = BatterySnapshot::new(
            self.estimator.status(),
            self.detector.source(),
            self.sampler.filtered_mv(),
            self.estimator.capacity(),
        );
        self.snapshot_tx.send_replace(snapshot);
    }
}
