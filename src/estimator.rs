//! Displayed-capacity convergence state machine.
//!
//! The voltage-derived target capacity is noisy and jumps with load; the
//! value shown to the user must not. Each tick the estimator compares the
//! table target against the displayed capacity and nudges the displayed
//! value by at most one percent, paced by per-direction counters whose
//! thresholds shrink as the gap grows. Full-charge is declared only through
//! a debounced hardware signal, or through wall-clock fallbacks when the
//! board has none.

use crate::charger::ChargeSource;
use crate::table::{CapacityTable, ChargeAnchor};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Reported battery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryStatus {
    Charging,
    Discharging,
    NotCharging,
    Full,
}

/// Request toward the charger IC emitted by a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeRequest {
    Start,
    Stop,
}

/// Outcome of one status pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusOutcome {
    pub changed: bool,
    pub charge_request: Option<ChargeRequest>,
    pub led: Option<bool>,
}

/// Pacing constants, in ticks unless noted. Defaults match the shipped
/// hardware calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimatorTuning {
    /// Base ticks between upward moves while charging.
    pub charge_min_ticks: u32,
    /// Base ticks between downward moves while discharging.
    pub discharge_min_ticks: u32,
    /// Rewind distance for the plateau counter after a fallback bump.
    pub charge_mid_ticks: u32,
    /// Plateau ceiling before the no-signal fallback bump fires.
    pub charge_max_ticks: u32,
    /// Consecutive asserted charge-complete ticks required for full.
    pub full_debounce_ticks: u32,
    /// Displayed capacity below which the plateau fallback never fires.
    pub plateau_floor: u8,
    /// Displayed capacity under which a previously-full battery recharges.
    pub recharge_below: u8,
    /// Wall-clock seconds at 99% before capacity is promoted to 100.
    pub time_to_full_secs: u64,
}

impl Default for EstimatorTuning {
    fn default() -> Self {
        Self {
            charge_min_ticks: 45,
            discharge_min_ticks: 45,
            charge_mid_ticks: 90,
            charge_max_ticks: 600,
            full_debounce_ticks: 10,
            plateau_floor: 85,
            recharge_below: 90,
            time_to_full_secs: 3600,
        }
    }
}

impl EstimatorTuning {
    /// Gap-scaled pacing: the farther the target is from the displayed
    /// value, the sooner the next move is allowed.
    fn ladder(base: u32, gap: u8) -> u32 {
        if gap > 10 {
            base.saturating_sub(10)
        } else if gap > 7 {
            base.saturating_sub(5)
        } else if gap > 3 {
            base.saturating_sub(2)
        } else {
            base
        }
        .max(1)
    }
}

/// Per-tick inputs to the convergence pass.
#[derive(Debug, Clone, Copy)]
pub struct Reading {
    pub source: ChargeSource,
    /// Hardware charge-complete signal; `None` when the board has none.
    pub charge_ok: Option<bool>,
    /// Filtered battery voltage.
    pub voltage_mv: i32,
    /// Whether the moving-average window has refilled since the last
    /// source transition.
    pub primed: bool,
    /// Display currently loading the rail (charge-direction lookup is
    /// offset-compensated when set).
    pub display_load: bool,
}

/// The rate-limited capacity estimator.
pub struct CapacityEstimator {
    tuning: EstimatorTuning,
    capacity: u8,
    status: BatteryStatus,

    discharge_cnt: u32,
    ac_charge_cnt: u32,
    usb_charge_cnt: u32,
    usb_discharge_cnt: u32,
    /// Long-horizon counter for the stuck-without-signal fallback.
    plateau_cnt: u32,
    /// Consecutive ticks the charge-complete signal has been asserted.
    full_ticks: u32,
    /// Wall-clock second at which the displayed value reached 99 while
    /// charging without an asserted full signal.
    time_to_full: Option<u64>,
    charge_full_flag: bool,
    anchor: Option<ChargeAnchor>,
    /// Target from the previous convergence pass.
    last_target: u8,
}

impl CapacityEstimator {
    pub fn new(tuning: EstimatorTuning) -> Self {
        Self {
            tuning,
            capacity: 0,
            status: BatteryStatus::NotCharging,
            discharge_cnt: 0,
            ac_charge_cnt: 0,
            usb_charge_cnt: 0,
            usb_discharge_cnt: 0,
            plateau_cnt: 0,
            full_ticks: 0,
            time_to_full: None,
            charge_full_flag: false,
            anchor: None,
            last_target: 0,
        }
    }

    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    pub fn status(&self) -> BatteryStatus {
        self.status
    }

    pub fn charge_full(&self) -> bool {
        self.charge_full_flag
    }

    pub fn anchor(&self) -> Option<ChargeAnchor> {
        self.anchor
    }

    /// Seed the displayed value outside the normal pacing (power-on,
    /// resume restore). Pacing counters restart.
    pub fn seed(&mut self, capacity: u8, status: BatteryStatus) {
        self.capacity = capacity.min(100);
        self.status = status;
        self.discharge_cnt = 0;
        self.ac_charge_cnt = 0;
        self.usb_charge_cnt = 0;
        self.usb_discharge_cnt = 0;
        self.plateau_cnt = 0;
    }

    /// Latch the charge-episode anchor if a charging episode is starting.
    pub fn latch_anchor(&mut self, voltage_mv: i32) {
        if self.anchor.is_none() {
            self.anchor = Some(ChargeAnchor::new(voltage_mv, self.capacity));
            debug!(voltage_mv, capacity = self.capacity, "charge anchor latched");
        }
    }

    /// Status and full-charge bookkeeping; runs before the tick's voltage
    /// sample, exactly once per tick.
    pub fn update_status(
        &mut self,
        source: ChargeSource,
        charge_ok: Option<bool>,
        now_secs: u64,
    ) -> StatusOutcome {
        let mut out = StatusOutcome::default();

        if !source.charging() {
            self.charge_full_flag = false;
            self.full_ticks = 0;
            self.time_to_full = None;
            if self.status != BatteryStatus::NotCharging {
                self.status = BatteryStatus::NotCharging;
                out.changed = true;
            }
            out.charge_request = Some(ChargeRequest::Stop);
            return out;
        }

        // A previously-full battery that has sagged below the recharge
        // threshold is topped up again.
        if self.charge_full_flag && self.capacity < self.tuning.recharge_below {
            out.charge_request = Some(ChargeRequest::Start);
            out.led = Some(false);
        } else {
            out.charge_request = Some(ChargeRequest::Start);
        }

        match charge_ok {
            None => {
                // No full-detect hardware at all: trust 100% from the
                // lookup, otherwise run the one-hour 99% promotion.
                if self.capacity == 100 {
                    if self.status != BatteryStatus::Full {
                        self.status = BatteryStatus::Full;
                        self.charge_full_flag = true;
                        out.charge_request = Some(ChargeRequest::Stop);
                        out.led = Some(true);
                        out.changed = true;
                    }
                } else {
                    self.charge_full_flag = false;
                    self.status = BatteryStatus::Charging;
                    out.led = Some(false);
                    if self.promote_after_hour(now_secs) {
                        out.changed = true;
                    }
                }
            }
            Some(false) => {
                self.full_ticks = 0;
                self.status = BatteryStatus::Charging;
                if self.capacity == 99 {
                    match self.time_to_full {
                        None => self.time_to_full = Some(now_secs),
                        Some(started) => {
                            if now_secs.saturating_sub(started) > self.tuning.time_to_full_secs {
                                self.capacity = 100;
                                self.time_to_full = None;
                                self.status = BatteryStatus::Full;
                                self.charge_full_flag = true;
                                out.changed = true;
                                debug!("99% hold timer elapsed, declaring full");
                            }
                        }
                    }
                }
            }
            Some(true) => {
                self.full_ticks += 1;
                if self.full_ticks > self.tuning.full_debounce_ticks {
                    self.full_ticks = self.tuning.full_debounce_ticks + 1;
                }

                if self.full_ticks >= self.tuning.full_debounce_ticks && self.capacity >= 99 {
                    if self.status != BatteryStatus::Full {
                        self.status = BatteryStatus::Full;
                        out.charge_request = Some(ChargeRequest::Stop);
                        self.capacity = 100;
                        self.charge_full_flag = true;
                        out.changed = true;
                        debug!("charge-complete debounce met, declaring full");
                    }
                } else {
                    self.charge_full_flag = false;
                    self.status = BatteryStatus::Charging;
                }
            }
        }

        out
    }

    fn promote_after_hour(&mut self, now_secs: u64) -> bool {
        if self.capacity != 99 {
            return false;
        }
        match self.time_to_full {
            None => {
                self.time_to_full = Some(now_secs);
                false
            }
            Some(started) => {
                if now_secs.saturating_sub(started) > self.tuning.time_to_full_secs {
                    self.capacity = 100;
                    self.time_to_full = None;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Convergence pass; runs after the tick's voltage sample. Returns
    /// whether the displayed capacity moved.
    pub fn converge(&mut self, table: &CapacityTable, reading: &Reading) -> bool {
        if !reading.primed {
            // No judgment on insufficient history.
            self.discharge_cnt = 0;
            self.plateau_cnt = 0;
            self.ac_charge_cnt = 0;
            return false;
        }

        match reading.source {
            ChargeSource::None => self.discharge_tick(table, reading.voltage_mv),
            ChargeSource::Ac => self.charge_tick_ac(table, reading),
            ChargeSource::Usb => self.charge_tick_usb(table, reading),
        }
    }

    fn charge_target(&self, table: &CapacityTable, reading: &Reading) -> u8 {
        let mv = if reading.display_load {
            reading.voltage_mv + table.charge_offset_mv
        } else {
            reading.voltage_mv
        };
        let mut target = match &self.anchor {
            Some(anchor) => table.lookup_anchored(mv, anchor),
            None => table.lookup(mv, true),
        };
        // 100% from voltage alone is not believed while the hardware
        // explicitly says charging is still in progress.
        if target == 100 && reading.charge_ok == Some(false) {
            target = 99;
        }
        target
    }

    fn discharge_tick(&mut self, table: &CapacityTable, voltage_mv: i32) -> bool {
        let target = table.lookup(voltage_mv, false);
        let mut changed = false;

        if target < self.capacity {
            let gap = self.capacity - target;
            let threshold = EstimatorTuning::ladder(self.tuning.discharge_min_ticks, gap);
            self.discharge_cnt += 1;
            if self.discharge_cnt >= threshold {
                self.discharge_cnt = 0;
                if self.capacity > 0 {
                    self.capacity -= 1;
                    changed = true;
                }
            }
        } else {
            // No upward correction while discharging.
            self.discharge_cnt = 0;
        }

        self.plateau_cnt = 0;
        self.usb_discharge_cnt = 0;
        self.usb_charge_cnt = 0;
        self.ac_charge_cnt = 0;
        self.anchor = None;
        self.last_target = target;
        changed
    }

    fn charge_tick_ac(&mut self, table: &CapacityTable, reading: &Reading) -> bool {
        self.latch_anchor(reading.voltage_mv);
        let target = self.charge_target(table, reading);
        let mut changed = false;

        if target > self.capacity {
            let gap = target - self.capacity;
            let threshold = EstimatorTuning::ladder(self.tuning.charge_min_ticks, gap);
            self.ac_charge_cnt += 1;
            if self.ac_charge_cnt >= threshold {
                self.ac_charge_cnt = 0;
                changed = self.bump_up();
            }
            self.plateau_cnt = 0;
        } else {
            self.ac_charge_cnt = 0;
            changed = self.plateau_tick(target, reading.charge_ok, self.tuning.charge_min_ticks);
        }

        self.last_target = target;
        changed
    }

    fn charge_tick_usb(&mut self, table: &CapacityTable, reading: &Reading) -> bool {
        self.latch_anchor(reading.voltage_mv);
        let target = self.charge_target(table, reading);
        let mut changed = false;

        if target > self.capacity {
            let gap = target - self.capacity;
            let threshold = EstimatorTuning::ladder(self.tuning.charge_min_ticks, gap);
            self.usb_charge_cnt += 1;
            if self.usb_charge_cnt >= threshold {
                self.usb_charge_cnt = 0;
                changed = self.bump_up();
            }
            self.plateau_cnt = 0;
            self.usb_discharge_cnt = 0;
        } else if target < self.capacity {
            // A USB port may not keep up with the load; downward movement
            // is allowed at discharge pacing.
            let gap = self.capacity - target;
            let threshold = EstimatorTuning::ladder(self.tuning.discharge_min_ticks, gap);
            self.usb_discharge_cnt += 1;
            if self.usb_discharge_cnt >= threshold {
                self.usb_discharge_cnt = 0;
                if self.capacity > 0 {
                    self.capacity -= 1;
                    changed = true;
                }
            }
            self.usb_charge_cnt = 0;
        } else {
            self.usb_discharge_cnt = 0;
            // Asserted charge-complete tops up faster than the plateau
            // fallback would.
            let top_up = self.tuning.charge_min_ticks.saturating_sub(30).max(1);
            changed = self.plateau_tick(target, reading.charge_ok, top_up);
        }

        self.last_target = target;
        changed
    }

    /// Plateau handling while the target is not above the displayed value.
    ///
    /// With an asserted charge-complete signal the displayed value keeps
    /// creeping toward 99 at `ok_ticks` pacing. Without one, a bump is
    /// forced only after the target has been stuck for the plateau ceiling
    /// with the battery nearly full, compensating aged cells whose charge
    /// voltage never reaches the table top.
    fn plateau_tick(&mut self, target: u8, charge_ok: Option<bool>, ok_ticks: u32) -> bool {
        match charge_ok {
            Some(true) => {
                self.plateau_cnt += 1;
                if self.plateau_cnt >= ok_ticks {
                    self.plateau_cnt = 0;
                    return self.bump_up();
                }
                false
            }
            _ => {
                if target > self.last_target {
                    self.plateau_cnt = 0;
                    return false;
                }
                self.plateau_cnt += 1;
                if self.capacity >= self.tuning.plateau_floor
                    && self.plateau_cnt > self.tuning.charge_max_ticks
                {
                    self.plateau_cnt = self
                        .tuning
                        .charge_max_ticks
                        .saturating_sub(self.tuning.charge_mid_ticks);
                    return self.bump_up();
                }
                false
            }
        }
    }

    /// Upward moves stop at 99; 100 is reserved for confirmed full.
    fn bump_up(&mut self) -> bool {
        if self.capacity < 99 {
            self.capacity += 1;
            true
        } else {
            false
        }
    }
}
