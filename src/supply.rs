//! Power-supply-style reporting surface.
//!
//! The vocabulary external consumers see: property kinds mirroring the
//! power-supply class, and a serializable snapshot published whenever the
//! monitor's state changes.

use crate::charger::ChargeSource;
use crate::estimator::BatteryStatus;
use serde::{Deserialize, Serialize};

/// Reportable battery properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryProperty {
    Status,
    Health,
    Present,
    VoltageNow,
    Capacity,
    Technology,
    VoltageMaxDesign,
    VoltageMinDesign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryHealth {
    Good,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryTechnology {
    LithiumIon,
}

/// Value of one reported property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyValue {
    Status(BatteryStatus),
    Health(BatteryHealth),
    Bool(bool),
    Millivolts(i32),
    Percent(u8),
    Technology(BatteryTechnology),
}

/// State published to consumers on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatterySnapshot {
    pub status: BatteryStatus,
    pub ac_online: bool,
    pub usb_online: bool,
    pub voltage_mv: i32,
    pub capacity: u8,
    pub present: bool,
}

impl BatterySnapshot {
    pub fn new(
        status: BatteryStatus,
        source: ChargeSource,
        voltage_mv: i32,
        capacity: u8,
    ) -> Self {
        Self {
            status: reported_status(status),
            ac_online: source == ChargeSource::Ac,
            usb_online: source == ChargeSource::Usb,
            voltage_mv,
            capacity,
            present: voltage_mv > 0,
        }
    }
}

impl Default for BatterySnapshot {
    fn default() -> Self {
        Self {
            status: BatteryStatus::Discharging,
            ac_online: false,
            usb_online: false,
            voltage_mv: 0,
            capacity: 0,
            present: false,
        }
    }
}

/// Map the internal no-supply state to the externally reported one: a
/// present battery with no supply attached is draining.
pub fn reported_status(status: BatteryStatus) -> BatteryStatus {
    match status {
        BatteryStatus::NotCharging => BatteryStatus::Discharging,
        other => other,
    }
}
