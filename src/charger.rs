//! Charge-source detection.
//!
//! Resolves, once per tick, whether the board is fed from a DC adapter, a
//! USB host, or nothing, using whichever detection hardware the board
//! configuration wires up: dedicated presence GPIOs, platform callbacks, or
//! the USB transceiver state. Boards without a given method simply leave it
//! unconfigured; absence is a configuration variant, not an error.

use crate::error::GpioError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default number of ticks an ambiguous USB session must persist before it
/// is promoted to a non-standard AC charger.
pub const DEFAULT_USB_IDENTIFY_TICKS: u32 = 5;

/// External supply currently delivering current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeSource {
    None,
    Usb,
    Ac,
}

impl ChargeSource {
    pub fn charging(self) -> bool {
        self != ChargeSource::None
    }
}

/// One detection pin: GPIO number plus the level that means "active".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinConfig {
    pub pin: u32,
    pub active_high: bool,
}

/// Detection pins a board may wire. Unwired pins stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PinSet {
    pub dc_det: Option<PinConfig>,
    pub usb_det: Option<PinConfig>,
    pub charge_ok: Option<PinConfig>,
    pub batt_low: Option<PinConfig>,
}

/// Reads a GPIO input level.
pub trait GpioReader: Send + Sync {
    fn level(&self, pin: u32) -> Result<bool, GpioError>;
}

/// GPIO lines exported through `/sys/class/gpio`.
pub struct SysfsGpio {
    base: String,
}

impl SysfsGpio {
    pub fn new() -> Self {
        Self {
            base: "/sys/class/gpio".to_string(),
        }
    }

    pub fn with_base(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioReader for SysfsGpio {
    fn level(&self, pin: u32) -> Result<bool, GpioError> {
        let path = format!("{}/gpio{}/value", self.base, pin);
        let contents = fs::read_to_string(&path)
            .map_err(|source| GpioError::ReadFailed { pin, source })?;
        match contents.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(GpioError::InvalidValue {
                pin,
                value: other.to_string(),
            }),
        }
    }
}

/// USB session state as reported by the OTG transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbusState {
    /// No VBUS present.
    Disconnected,
    /// VBUS present, session negotiation possible (host or dumb charger).
    SessionValid,
    /// Dedicated charger signature on D+/D-.
    ChargerDetected,
}

/// Vendor USB PHY/OTG status queries.
pub trait UsbTransceiver: Send + Sync {
    fn vbus_state(&self) -> VbusState;
    /// Whether the gadget stack has enumerated against a host.
    fn gadget_connected(&self) -> bool;
}

/// Held while the device must not enter suspend.
pub trait WakeLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Wake lock backed by the kernel's `/sys/power/wake_lock` interface.
/// Failures are ignored: the interface is absent on non-Android kernels
/// and the lock is best-effort.
pub struct SysfsWakeLock {
    name: String,
}

impl SysfsWakeLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl WakeLock for SysfsWakeLock {
    fn acquire(&self) {
        let _ = fs::write("/sys/power/wake_lock", &self.name);
    }

    fn release(&self) {
        let _ = fs::write("/sys/power/wake_unlock", &self.name);
    }
}

type BoolHook = Box<dyn Fn() -> bool + Send + Sync>;

/// Optional platform callbacks, resolved once at construction from board
/// configuration. Boards provide only the hooks their hardware supports.
#[derive(Default)]
pub struct PlatformHooks {
    /// Adapter presence, for boards without a DC detect pin.
    pub is_dc_charging: Option<BoolHook>,
    /// USB supply presence, for boards without transceiver access.
    pub is_usb_charging: Option<BoolHook>,
    /// Charge-complete signal, for boards without a charge-ok pin.
    pub charging_ok: Option<BoolHook>,
    /// Enable (true) or limit (false) current draw from the USB port.
    pub control_usb_charging: Option<Box<dyn Fn(bool) + Send + Sync>>,
    /// Enable or disable charging at the charger IC.
    pub set_charging: Option<Box<dyn Fn(bool) + Send + Sync>>,
    /// Charge indicator LED.
    pub ctrl_charge_led: Option<Box<dyn Fn(bool) + Send + Sync>>,
    /// Whether the display is currently loading the rail (voltage sag
    /// compensation while charging).
    pub display_load: Option<BoolHook>,
    /// Keeps the system awake while a supply is attached.
    pub wake_lock: Option<Box<dyn WakeLock>>,
    /// Orderly power-off for the hard low-voltage policy.
    pub power_off: Option<Box<dyn Fn() + Send + Sync>>,
}

/// Result of one detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub source: ChargeSource,
    /// Source differs from the previous tick, or an out-of-band DC event
    /// arrived; the voltage window must be treated as stale.
    pub changed: bool,
}

/// Per-tick charge-source resolver.
pub struct ChargeSourceDetector {
    gpio: Arc<dyn GpioReader>,
    usb: Option<Arc<dyn UsbTransceiver>>,
    hooks: PlatformHooks,
    pins: PinSet,
    usb_identify_ticks: u32,
    usb_identify_cnt: u32,
    source: ChargeSource,
    first_pass: bool,
    /// Set from interrupt-like contexts; consumed on the next tick.
    dc_event: AtomicBool,
    wake_locked: bool,
}

impl ChargeSourceDetector {
    pub fn new(
        gpio: Arc<dyn GpioReader>,
        usb: Option<Arc<dyn UsbTransceiver>>,
        hooks: PlatformHooks,
        pins: PinSet,
        usb_identify_ticks: u32,
    ) -> Self {
        Self {
            gpio,
            usb,
            hooks,
            pins,
            usb_identify_ticks: usb_identify_ticks.max(1),
            usb_identify_cnt: 0,
            source: ChargeSource::None,
            first_pass: true,
            dc_event: AtomicBool::new(false),
            wake_locked: false,
        }
    }

    /// Record an edge event from the DC presence line. Safe from any
    /// context: only an atomic flag is touched; the tick does the work.
    pub fn note_dc_event(&self) {
        self.dc_event.store(true, Ordering::Release);
    }

    fn pin_active(&self, pin: PinConfig) -> bool {
        match self.gpio.level(pin.pin) {
            Ok(level) => level == pin.active_high,
            Err(e) => {
                debug!("detection pin read failed: {}", e);
                false
            }
        }
    }

    fn ac_present(&self) -> bool {
        if let Some(pin) = self.pins.dc_det {
            return self.pin_active(pin);
        }
        if let Some(hook) = &self.hooks.is_dc_charging {
            return hook();
        }
        false
    }

    /// USB-side classification: `None`, device-mode `Usb`, or a charger
    /// signature / debounce-confirmed dumb supply as `Ac`.
    fn usb_probe(&mut self) -> ChargeSource {
        if let Some(usb) = self.usb.clone() {
            return match usb.vbus_state() {
                VbusState::SessionValid => {
                    if usb.gadget_connected() {
                        self.usb_identify_cnt = 0;
                        ChargeSource::Usb
                    } else if self.bump_identify() {
                        // Connected but never enumerated: non-standard AC.
                        ChargeSource::Ac
                    } else {
                        ChargeSource::None
                    }
                }
                VbusState::ChargerDetected => {
                    self.usb_identify_cnt = 0;
                    ChargeSource::Ac
                }
                VbusState::Disconnected => {
                    self.usb_identify_cnt = 0;
                    ChargeSource::None
                }
            };
        }
        if let Some(pin) = self.pins.usb_det {
            if self.pin_active(pin) {
                return ChargeSource::Usb;
            }
            return ChargeSource::None;
        }
        if let Some(hook) = &self.hooks.is_usb_charging {
            if hook() {
                return ChargeSource::Usb;
            }
        }
        ChargeSource::None
    }

    fn bump_identify(&mut self) -> bool {
        self.usb_identify_cnt += 1;
        if self.usb_identify_cnt >= self.usb_identify_ticks {
            self.usb_identify_cnt = self.usb_identify_ticks + 1;
            true
        } else {
            false
        }
    }

    /// Resolve the current source. AC detection wins over USB; both present
    /// collapses to AC.
    pub fn detect_tick(&mut self) -> Detection {
        let usb_side = self.usb_probe();
        let source = if self.ac_present() || usb_side == ChargeSource::Ac {
            ChargeSource::Ac
        } else {
            usb_side
        };

        match source {
            ChargeSource::Ac => {
                if let Some(hook) = &self.hooks.control_usb_charging {
                    hook(true);
                }
            }
            ChargeSource::Usb => {
                if let Some(hook) = &self.hooks.control_usb_charging {
                    hook(false);
                }
            }
            ChargeSource::None => {}
        }

        let dc_event = self.dc_event.swap(false, Ordering::AcqRel);
        let changed = !self.first_pass && (source != self.source || dc_event);
        if source != self.source {
            debug!(?source, "charge source changed");
        }
        self.first_pass = false;
        self.source = source;
        Detection { source, changed }
    }

    pub fn source(&self) -> ChargeSource {
        self.source
    }

    /// Hardware charge-complete signal. `None` when the board has neither a
    /// charge-ok pin nor a callback, or when not charging (the signal is
    /// meaningless without charge current).
    pub fn charge_complete(&self, charging: bool) -> Option<bool> {
        if !charging {
            return None;
        }
        if let Some(pin) = self.pins.charge_ok {
            return Some(self.pin_active(pin));
        }
        if let Some(hook) = &self.hooks.charging_ok {
            return Some(hook());
        }
        None
    }

    /// Battery-critically-low pin, when wired.
    pub fn batt_low(&self) -> bool {
        match self.pins.batt_low {
            Some(pin) => self.pin_active(pin),
            None => false,
        }
    }

    pub fn set_charging(&self, enable: bool) {
        if let Some(hook) = &self.hooks.set_charging {
            hook(enable);
        }
    }

    pub fn set_charge_led(&self, on: bool) {
        if let Some(hook) = &self.hooks.ctrl_charge_led {
            hook(on);
        }
    }

    pub fn display_load(&self) -> bool {
        self.hooks.display_load.as_ref().map(|h| h()).unwrap_or(false)
    }

    /// Hold the wake lock while a supply is attached, release otherwise.
    pub fn update_wake_lock(&mut self, charging: bool) {
        let Some(lock) = &self.hooks.wake_lock else {
            return;
        };
        if charging && !self.wake_locked {
            lock.acquire();
            self.wake_locked = true;
        } else if !charging && self.wake_locked {
            lock.release();
            self.wake_locked = false;
        }
    }

    pub fn request_power_off(&self) {
        if let Some(hook) = &self.hooks.power_off {
            warn!("initiating orderly power-off");
            hook();
        } else {
            warn!("power-off requested but no platform hook configured");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeGpio {
        levels: Mutex<HashMap<u32, bool>>,
    }

    impl FakeGpio {
        fn new(levels: &[(u32, bool)]) -> Arc<Self> {
            Arc::new(Self {
                levels: Mutex::new(levels.iter().copied().collect()),
            })
        }

        fn set(&self, pin: u32, level: bool) {
            self.levels.lock().unwrap().insert(pin, level);
        }
    }

    impl GpioReader for FakeGpio {
        fn level(&self, pin: u32) -> Result<bool, GpioError> {
            self.levels
                .lock()
                .unwrap()
                .get(&pin)
                .copied()
                .ok_or(GpioError::InvalidValue {
                    pin,
                    value: "unwired".to_string(),
                })
        }
    }

    struct FakeUsb {
        vbus: Mutex<VbusState>,
        gadget: Mutex<bool>,
    }

    impl FakeUsb {
        fn new(vbus: VbusState, gadget: bool) -> Arc<Self> {
            Arc::new(Self {
                vbus: Mutex::new(vbus),
                gadget: Mutex::new(gadget),
            })
        }
    }

    impl UsbTransceiver for FakeUsb {
        fn vbus_state(&self) -> VbusState {
            *self.vbus.lock().unwrap()
        }

        fn gadget_connected(&self) -> bool {
            *self.gadget.lock().unwrap()
        }
    }

    #[test]
    fn test_sysfs_gpio_reads_exported_value() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("gpio7")).unwrap();
        std::fs::write(dir.path().join("gpio7/value"), "1\n").unwrap();

        let gpio = SysfsGpio::with_base(dir.path().to_string_lossy().to_string());
        assert!(gpio.level(7).unwrap());

        std::fs::write(dir.path().join("gpio7/value"), "0\n").unwrap();
        assert!(!gpio.level(7).unwrap());

        // Unexported line.
        assert!(gpio.level(9).is_err());
    }

    fn dc_pin() -> PinSet {
        PinSet {
            dc_det: Some(PinConfig {
                pin: 7,
                active_high: false,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_dc_pin_detection() {
        let gpio = FakeGpio::new(&[(7, false)]);
        let mut det = ChargeSourceDetector::new(
            gpio.clone(),
            None,
            PlatformHooks::default(),
            dc_pin(),
            DEFAULT_USB_IDENTIFY_TICKS,
        );
        assert_eq!(det.detect_tick().source, ChargeSource::Ac);

        gpio.set(7, true);
        let d = det.detect_tick();
        assert_eq!(d.source, ChargeSource::None);
        assert!(d.changed);
    }

    #[test]
    fn test_first_pass_is_not_a_transition() {
        let gpio = FakeGpio::new(&[(7, false)]);
        let mut det = ChargeSourceDetector::new(
            gpio,
            None,
            PlatformHooks::default(),
            dc_pin(),
            DEFAULT_USB_IDENTIFY_TICKS,
        );
        assert!(!det.detect_tick().changed);
        assert!(!det.detect_tick().changed);
    }

    #[test]
    fn test_hook_fallback_without_pin() {
        let gpio = FakeGpio::new(&[]);
        let hooks = PlatformHooks {
            is_dc_charging: Some(Box::new(|| true)),
            ..Default::default()
        };
        let mut det = ChargeSourceDetector::new(
            gpio,
            None,
            hooks,
            PinSet::default(),
            DEFAULT_USB_IDENTIFY_TICKS,
        );
        assert_eq!(det.detect_tick().source, ChargeSource::Ac);
    }

    #[test]
    fn test_usb_device_mode() {
        let gpio = FakeGpio::new(&[]);
        let usb = FakeUsb::new(VbusState::SessionValid, true);
        let mut det = ChargeSourceDetector::new(
            gpio,
            Some(usb),
            PlatformHooks::default(),
            PinSet::default(),
            DEFAULT_USB_IDENTIFY_TICKS,
        );
        assert_eq!(det.detect_tick().source, ChargeSource::Usb);
    }

    #[test]
    fn test_ambiguous_usb_promoted_after_debounce() {
        let gpio = FakeGpio::new(&[]);
        let usb = FakeUsb::new(VbusState::SessionValid, false);
        let mut det = ChargeSourceDetector::new(
            gpio,
            Some(usb),
            PlatformHooks::default(),
            PinSet::default(),
            5,
        );
        // Four ambiguous ticks stay None, the fifth promotes to AC.
        for _ in 0..4 {
            assert_eq!(det.detect_tick().source, ChargeSource::None);
        }
        assert_eq!(det.detect_tick().source, ChargeSource::Ac);
        // And it stays promoted.
        assert_eq!(det.detect_tick().source, ChargeSource::Ac);
    }

    #[test]
    fn test_disconnect_resets_debounce() {
        let gpio = FakeGpio::new(&[]);
        let usb = FakeUsb::new(VbusState::SessionValid, false);
        let mut det = ChargeSourceDetector::new(
            gpio,
            Some(usb.clone()),
            PlatformHooks::default(),
            PinSet::default(),
            5,
        );
        for _ in 0..3 {
            det.detect_tick();
        }
        *usb.vbus.lock().unwrap() = VbusState::Disconnected;
        det.detect_tick();
        *usb.vbus.lock().unwrap() = VbusState::SessionValid;
        for _ in 0..4 {
            assert_eq!(det.detect_tick().source, ChargeSource::None);
        }
        assert_eq!(det.detect_tick().source, ChargeSource::Ac);
    }

    #[test]
    fn test_ac_wins_over_usb() {
        let gpio = FakeGpio::new(&[(7, false)]);
        let usb = FakeUsb::new(VbusState::SessionValid, true);
        let mut det = ChargeSourceDetector::new(
            gpio,
            Some(usb),
            PlatformHooks::default(),
            dc_pin(),
            DEFAULT_USB_IDENTIFY_TICKS,
        );
        assert_eq!(det.detect_tick().source, ChargeSource::Ac);
    }

    #[test]
    fn test_dc_event_forces_stale_window() {
        let gpio = FakeGpio::new(&[(7, false)]);
        let mut det = ChargeSourceDetector::new(
            gpio,
            None,
            PlatformHooks::default(),
            dc_pin(),
            DEFAULT_USB_IDENTIFY_TICKS,
        );
        det.detect_tick();
        det.note_dc_event();
        let d = det.detect_tick();
        assert!(d.changed);
        // The flag is consumed.
        assert!(!det.detect_tick().changed);
    }

    #[test]
    fn test_charge_complete_requires_charging_and_hardware() {
        let gpio = FakeGpio::new(&[(3, true)]);
        let pins = PinSet {
            charge_ok: Some(PinConfig {
                pin: 3,
                active_high: true,
            }),
            ..Default::default()
        };
        let det = ChargeSourceDetector::new(
            gpio,
            None,
            PlatformHooks::default(),
            pins,
            DEFAULT_USB_IDENTIFY_TICKS,
        );
        assert_eq!(det.charge_complete(false), None);
        assert_eq!(det.charge_complete(true), Some(true));

        let det = ChargeSourceDetector::new(
            FakeGpio::new(&[]),
            None,
            PlatformHooks::default(),
            PinSet::default(),
            DEFAULT_USB_IDENTIFY_TICKS,
        );
        assert_eq!(det.charge_complete(true), None);
    }
}
