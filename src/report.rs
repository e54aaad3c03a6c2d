//! Phase reports: adaptation from engine measurements, unit conversion, and
//! human-readable formatting.

use std::fmt;

use serde::Serialize;

use crate::engine::EngineReport;

/// Outcome of one phase: a measured transfer rate.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct Report {
    /// Bits per second.
    pub bits_per_second: f64,
}

impl Report {
    pub fn new(bits_per_second: f64) -> Self {
        Self {
            bits_per_second: bits_per_second.max(0.0),
        }
    }

    /// Megabits per second.
    pub fn mbps(&self) -> f64 {
        self.bits_per_second / 1_000_000.0
    }

    /// Megabytes per second.
    pub fn megabytes_per_second(&self) -> f64 {
        self.bits_per_second / 8_000_000.0
    }

    pub fn quality(&self) -> SpeedQuality {
        SpeedQuality::from_mbps(self.mbps())
    }
}

/// Extract the transfer rate from an engine report.
///
/// The engine's `f64` rate is carried over as-is; any rounding happens only
/// when a rate is formatted for display.
pub fn adapt(report: &EngineReport) -> Report {
    Report::new(report.transfer_rate_bit)
}

// ---------------------------------------------------------------------------
// Quality rating
// ---------------------------------------------------------------------------

/// Coarse rating of a measured speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SpeedQuality {
    Poor,
    Fair,
    Good,
    VeryGood,
    Excellent,
}

impl SpeedQuality {
    pub fn from_mbps(mbps: f64) -> Self {
        if mbps >= 100.0 {
            SpeedQuality::Excellent
        } else if mbps >= 40.0 {
            SpeedQuality::VeryGood
        } else if mbps >= 10.0 {
            SpeedQuality::Good
        } else if mbps >= 5.0 {
            SpeedQuality::Fair
        } else {
            SpeedQuality::Poor
        }
    }
}

impl fmt::Display for SpeedQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SpeedQuality::Excellent => "Excellent",
            SpeedQuality::VeryGood => "Very Good",
            SpeedQuality::Good => "Good",
            SpeedQuality::Fair => "Fair",
            SpeedQuality::Poor => "Poor",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Display unit for [`format_rate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateUnit {
    /// Both Mbps and MB/s.
    #[default]
    Both,
    Mbps,
    MegabytesPerSecond,
}

/// Format a report with two decimals, e.g. `"94.21 Mbps (11.78 MB/s)"`.
pub fn format_rate(report: &Report, unit: RateUnit) -> String {
    match unit {
        RateUnit::Mbps => format!("{:.2} Mbps", report.mbps()),
        RateUnit::MegabytesPerSecond => format!("{:.2} MB/s", report.megabytes_per_second()),
        RateUnit::Both => format!(
            "{:.2} Mbps ({:.2} MB/s)",
            report.mbps(),
            report.megabytes_per_second()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine_report(rate: f64) -> EngineReport {
        EngineReport {
            transfer_rate_bit: rate,
            bytes_transferred: 0,
            total_bytes: None,
            elapsed: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_adapt_is_lossless_and_idempotent() {
        let raw = engine_report(123_456_789.012_345_6);
        let first = adapt(&raw);
        let second = adapt(&raw);
        assert_eq!(first, second);
        assert_eq!(first.bits_per_second.to_bits(), raw.transfer_rate_bit.to_bits());
    }

    #[test]
    fn test_unit_conversion() {
        let report = Report::new(94_210_000.0);
        assert!((report.mbps() - 94.21).abs() < 1e-9);
        assert!((report.megabytes_per_second() - 11.77625).abs() < 1e-9);
    }

    #[test]
    fn test_format_rate() {
        let report = Report::new(94_210_000.0);
        assert_eq!(format_rate(&report, RateUnit::Mbps), "94.21 Mbps");
        assert_eq!(format_rate(&report, RateUnit::MegabytesPerSecond), "11.78 MB/s");
        assert_eq!(format_rate(&report, RateUnit::Both), "94.21 Mbps (11.78 MB/s)");
    }

    #[test]
    fn test_quality_thresholds() {
        assert_eq!(SpeedQuality::from_mbps(100.0), SpeedQuality::Excellent);
        assert_eq!(SpeedQuality::from_mbps(99.99), SpeedQuality::VeryGood);
        assert_eq!(SpeedQuality::from_mbps(40.0), SpeedQuality::VeryGood);
        assert_eq!(SpeedQuality::from_mbps(10.0), SpeedQuality::Good);
        assert_eq!(SpeedQuality::from_mbps(5.0), SpeedQuality::Fair);
        assert_eq!(SpeedQuality::from_mbps(4.9), SpeedQuality::Poor);
        assert_eq!(SpeedQuality::VeryGood.to_string(), "Very Good");
    }

    #[test]
    fn test_negative_rate_clamped() {
        assert_eq!(Report::new(-5.0).bits_per_second, 0.0);
    }
}
