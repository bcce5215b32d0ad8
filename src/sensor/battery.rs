//! Battery state-of-charge policy and operating modes.
//!
//! Everything downstream keys off SOC, never raw voltage: the fuel
//! gauge driver reports SOC (or we derive one linearly from voltage)
//! and this module maps it to a status bitmask with hysteresis in both
//! directions. LiPo cells suffer permanent damage below ~3.0 V/cell,
//! which is why the emergency band latches until the charge has
//! genuinely recovered.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

/// SOC below which the full-power band is re-armed.
pub const SOC_HIGHPOWER_MIN: f32 = 85.0;

/// SOC at or above which full-power activities run.
pub const SOC_HIGHPOWER_MAX: f32 = 95.0;

bitflags! {
    /// Battery status as a mask, so schedules can opt into several
    /// bands at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BatteryStatus: u16 {
        const MOBILE     = 0x0001;
        const BURN       = 0x0002;
        const TEST       = 0x0004;
        const FULL       = 0x0008;
        const NORMAL     = 0x0010;
        const LOW        = 0x0020;
        const WARNING    = 0x0040;
        const EMERGENCY  = 0x0080;
        const DEAD       = 0x0100;
        const NO_SENSORS = 0x0200;
    }
}

/// Device operating mode, settable from the operator CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    Normal,
    Mobile,
    TestSensor,
    TestFast,
    TestBurn,
    TestDead,
}

impl OpMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpMode::Normal => "normal",
            OpMode::Mobile => "mobile",
            OpMode::TestSensor => "test-sensor",
            OpMode::TestFast => "test-fast",
            OpMode::TestBurn => "test-burn",
            OpMode::TestDead => "test-dead",
        }
    }
}

impl fmt::Display for OpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "normal" => Ok(OpMode::Normal),
            "mobile" => Ok(OpMode::Mobile),
            "test-sensor" => Ok(OpMode::TestSensor),
            "test-fast" => Ok(OpMode::TestFast),
            "test-burn" => Ok(OpMode::TestBurn),
            "test-dead" => Ok(OpMode::TestDead),
            other => Err(format!("unknown operating mode: {}", other)),
        }
    }
}

/// Derive a simulated SOC from pack voltage, linear from 3.5 V (empty)
/// to 4.0 V (full). The scheduler's behavior rides entirely on this
/// curve, so it is deliberately conservative.
pub fn compute_soc_from_voltage(voltage: f32) -> f32 {
    let min_v = 3.5;
    let max_v = 4.0;
    let cur = if voltage < min_v { 0.0 } else { voltage - min_v };
    cur * 100.0 / (max_v - min_v)
}

/// Tracks SOC and maps it to a [`BatteryStatus`], carrying the two
/// hysteresis latches across calls.
pub struct BatteryMonitor {
    last_soc: f32,
    /// Latched below 20% SOC; holds EMERGENCY until back above 70%.
    recovery_mode: bool,
    /// True while waiting to charge back up to SOC_HIGHPOWER_MAX.
    /// Starts true so we charge fully at boot before drawing down.
    full_recovery_mode: bool,
}

impl BatteryMonitor {
    pub fn new() -> Self {
        Self {
            last_soc: 0.0,
            recovery_mode: false,
            full_recovery_mode: true,
        }
    }

    pub fn set_soc(&mut self, soc: f32) {
        self.last_soc = soc;
    }

    pub fn set_soc_unknown(&mut self) {
        self.last_soc = 100.0;
    }

    pub fn soc(&self) -> f32 {
        self.last_soc
    }

    /// Map the current SOC (and operating mode) to a status band.
    pub fn status(&mut self, op_mode: OpMode) -> BatteryStatus {
        match op_mode {
            OpMode::TestBurn => return BatteryStatus::BURN,
            OpMode::TestFast => return BatteryStatus::TEST,
            OpMode::Mobile => return BatteryStatus::MOBILE,
            OpMode::TestDead => return BatteryStatus::NO_SENSORS,
            OpMode::Normal | OpMode::TestSensor => {}
        }

        // Never measured: assume normal.
        if self.last_soc == 0.0 {
            return BatteryStatus::NORMAL;
        }

        if self.last_soc < 5.0 {
            return BatteryStatus::DEAD;
        }

        if self.recovery_mode {
            if self.last_soc < 70.0 {
                return BatteryStatus::EMERGENCY;
            }
            self.recovery_mode = false;
            return BatteryStatus::NORMAL;
        } else if self.last_soc < 20.0 {
            self.recovery_mode = true;
            return BatteryStatus::EMERGENCY;
        }

        if self.last_soc < 40.0 {
            return BatteryStatus::WARNING;
        }

        if self.last_soc < 60.0 {
            return BatteryStatus::LOW;
        }

        // Full is debounced between the high-power thresholds.
        if self.last_soc < SOC_HIGHPOWER_MIN {
            self.full_recovery_mode = true;
            return BatteryStatus::NORMAL;
        }
        if self.full_recovery_mode && self.last_soc < SOC_HIGHPOWER_MAX {
            return BatteryStatus::NORMAL;
        }
        self.full_recovery_mode = false;
        BatteryStatus::FULL
    }
}

impl Default for BatteryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Name for a status band, for the operator CLI.
pub fn battery_status_name(status: BatteryStatus) -> &'static str {
    if status == BatteryStatus::MOBILE {
        "BAT_MOBILE"
    } else if status == BatteryStatus::BURN {
        "BAT_BURN"
    } else if status == BatteryStatus::TEST {
        "BAT_TEST"
    } else if status == BatteryStatus::FULL {
        "BAT_FULL"
    } else if status == BatteryStatus::NORMAL {
        "BAT_NORMAL"
    } else if status == BatteryStatus::LOW {
        "BAT_LOW"
    } else if status == BatteryStatus::WARNING {
        "BAT_WARNING"
    } else if status == BatteryStatus::EMERGENCY {
        "BAT_EMERGENCY"
    } else if status == BatteryStatus::DEAD {
        "BAT_DEAD"
    } else if status == BatteryStatus::NO_SENSORS {
        "BAT_NO_SENSORS"
    } else {
        "BAT_UNKNOWN"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voltage_to_soc_is_linear() {
        assert_eq!(compute_soc_from_voltage(3.5), 0.0);
        assert_eq!(compute_soc_from_voltage(4.0), 100.0);
        assert!((compute_soc_from_voltage(3.75) - 50.0).abs() < 0.01);
        assert_eq!(compute_soc_from_voltage(3.0), 0.0);
    }

    #[test]
    fn test_unmeasured_battery_is_normal() {
        let mut bat = BatteryMonitor::new();
        assert_eq!(bat.status(OpMode::Normal), BatteryStatus::NORMAL);
    }

    #[test]
    fn test_threshold_bands() {
        let mut bat = BatteryMonitor::new();
        bat.set_soc(3.0);
        assert_eq!(bat.status(OpMode::Normal), BatteryStatus::DEAD);
        let mut bat = BatteryMonitor::new();
        bat.set_soc(30.0);
        assert_eq!(bat.status(OpMode::Normal), BatteryStatus::WARNING);
        let mut bat = BatteryMonitor::new();
        bat.set_soc(50.0);
        assert_eq!(bat.status(OpMode::Normal), BatteryStatus::LOW);
        let mut bat = BatteryMonitor::new();
        bat.set_soc(75.0);
        assert_eq!(bat.status(OpMode::Normal), BatteryStatus::NORMAL);
    }

    #[test]
    fn test_emergency_latches_until_recovered() {
        let mut bat = BatteryMonitor::new();
        bat.set_soc(15.0);
        assert_eq!(bat.status(OpMode::Normal), BatteryStatus::EMERGENCY);
        // Charging back up, but still latched below 70%.
        bat.set_soc(50.0);
        assert_eq!(bat.status(OpMode::Normal), BatteryStatus::EMERGENCY);
        bat.set_soc(71.0);
        assert_eq!(bat.status(OpMode::Normal), BatteryStatus::NORMAL);
        // Latch released: 50% now reads LOW, not EMERGENCY.
        bat.set_soc(50.0);
        assert_eq!(bat.status(OpMode::Normal), BatteryStatus::LOW);
    }

    #[test]
    fn test_full_band_debounce() {
        let mut bat = BatteryMonitor::new();
        // Boot: below MAX stays NORMAL until fully charged once.
        bat.set_soc(90.0);
        assert_eq!(bat.status(OpMode::Normal), BatteryStatus::NORMAL);
        bat.set_soc(96.0);
        assert_eq!(bat.status(OpMode::Normal), BatteryStatus::FULL);
        // Drifting below MAX but above MIN keeps FULL.
        bat.set_soc(90.0);
        assert_eq!(bat.status(OpMode::Normal), BatteryStatus::FULL);
        // Below MIN re-arms the debounce.
        bat.set_soc(80.0);
        assert_eq!(bat.status(OpMode::Normal), BatteryStatus::NORMAL);
        bat.set_soc(90.0);
        assert_eq!(bat.status(OpMode::Normal), BatteryStatus::NORMAL);
    }

    #[test]
    fn test_mode_overrides() {
        let mut bat = BatteryMonitor::new();
        bat.set_soc(50.0);
        assert_eq!(bat.status(OpMode::TestBurn), BatteryStatus::BURN);
        assert_eq!(bat.status(OpMode::TestFast), BatteryStatus::TEST);
        assert_eq!(bat.status(OpMode::Mobile), BatteryStatus::MOBILE);
        assert_eq!(bat.status(OpMode::TestDead), BatteryStatus::NO_SENSORS);
    }

    #[test]
    fn test_op_mode_names_roundtrip() {
        for mode in [
            OpMode::Normal,
            OpMode::Mobile,
            OpMode::TestSensor,
            OpMode::TestFast,
            OpMode::TestBurn,
            OpMode::TestDead,
        ] {
            assert_eq!(mode.as_str().parse::<OpMode>().unwrap(), mode);
        }
        assert!("warp-speed".parse::<OpMode>().is_err());
    }
}
