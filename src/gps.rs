//! GPS fix types and coordinate conversion.
//!
//! Fixes flow in from several sources (static configuration, I²C
//! u-blox, the cellular modem's integrated receiver, an external
//! u-blox on the shared UART, last-known-good storage); the comm
//! supervisor fans them in by precedence. This module holds the shared
//! value types plus the degree-minute encoding used by the modem's
//! `+CGPSINFO` reports.

/// Minutes to keep trying for a live fix before falling back to the
/// last-known-good coordinates.
pub const GPS_ABORT_MINUTES: u32 = 10;

/// How much of a location a source currently has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpsStatus {
    /// The source is not present in this configuration.
    NotConfigured,
    /// The source exists but has produced no sentences yet.
    NoData,
    /// Sentences are arriving but carry no location.
    NoLocation,
    /// Latitude/longitude only.
    Partial,
    /// Latitude, longitude and altitude.
    Full,
}

/// A location sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

impl GpsFix {
    pub fn is_zero(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }
}

/// Convert the modem's `ddmm.mmmm` degree-minute encoding to decimal
/// degrees, negating for the `S`/`W` hemispheres. Returns `None` for
/// unparseable input (empty fields are routine while acquiring).
pub fn degrees_from_ddmm(value: &str, hemisphere: &str) -> Option<f64> {
    let raw: f64 = value.trim().parse().ok()?;
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    let mut result = degrees + minutes / 60.0;
    match hemisphere.trim() {
        "S" | "s" | "W" | "w" => result = -result,
        _ => {}
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddmm_north() {
        // 42°33.9' N
        let deg = degrees_from_ddmm("4233.9000", "N").unwrap();
        assert!((deg - 42.565).abs() < 0.0001);
    }

    #[test]
    fn test_ddmm_west_is_negative() {
        let deg = degrees_from_ddmm("07047.0400", "W").unwrap();
        assert!((deg + 70.784).abs() < 0.0001);
    }

    #[test]
    fn test_empty_field_is_none() {
        assert_eq!(degrees_from_ddmm("", "N"), None);
    }

    #[test]
    fn test_zero_fix_detection() {
        assert!(GpsFix::default().is_zero());
        let fix = GpsFix {
            latitude: 1.0,
            longitude: 2.0,
            altitude: 0.0,
        };
        assert!(!fix.is_zero());
    }
}
