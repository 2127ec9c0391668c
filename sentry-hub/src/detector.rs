//! # detector
//!
//! Tier-1 threshold detection. Deterministic over the reading history it has
//! seen since the last [`ThresholdDetector::reset`]; no I/O, no clock, no rate
//! limiting.
//!
//! A reading *exceeds* when its g-force or its tilt is strictly above the
//! configured threshold. `is_triggered` needs `consecutive_triggers`
//! exceedances in a row, each within `lookback` of the previous one, so a
//! single spike never escalates.

use std::time::Duration;

use sentry_types::{SensorReading, Severity, ThresholdResult, TriggerType, STANDARD_GRAVITY};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    pub g_force_threshold: f64,
    pub tilt_threshold_deg: f64,
    pub consecutive_triggers: u32,
    /// Exceedances further apart than this do not count as consecutive.
    pub lookback: Duration,
    pub gravity: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            g_force_threshold: 8.0,
            tilt_threshold_deg: 90.0,
            consecutive_triggers: 2,
            lookback: Duration::from_secs(30),
            gravity: STANDARD_GRAVITY,
        }
    }
}

/// Classification of a single reading, ignoring history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exceedance {
    pub trigger_type: Option<TriggerType>,
    pub severity: Severity,
    pub g_force: f64,
    pub tilt: f64,
}

pub fn classify(config: &DetectorConfig, reading: &SensorReading) -> Exceedance {
    let g_force = reading.g_force(config.gravity);
    let tilt = reading.tilt_deg();
    let impact = g_force > config.g_force_threshold;
    let tilted = tilt > config.tilt_threshold_deg;

    let trigger_type = match (impact, tilted) {
        (true, true) => Some(TriggerType::Combined),
        (true, false) => Some(TriggerType::Impact),
        (false, true) => Some(TriggerType::Tilt),
        (false, false) => None,
    };

    let ratio = (g_force / config.g_force_threshold).max(tilt / config.tilt_threshold_deg);
    let mut severity = match ratio {
        r if r >= 1.5 => Severity::High,
        r if r >= 1.25 => Severity::Medium,
        _ => Severity::Low,
    };
    if trigger_type == Some(TriggerType::Combined) {
        severity = severity.max(Severity::Medium);
    }

    Exceedance { trigger_type, severity, g_force, tilt }
}

pub struct ThresholdDetector {
    config: DetectorConfig,
    consecutive: u32,
    last_exceedance: Option<chrono::DateTime<chrono::Utc>>,
}

impl ThresholdDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config, consecutive: 0, last_exceedance: None }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Exceedances counted towards the current streak.
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn evaluate(&mut self, reading: &SensorReading) -> ThresholdResult {
        let ex = classify(&self.config, reading);

        if ex.trigger_type.is_some() {
            let within_window = self.last_exceedance.map_or(true, |prev| {
                (reading.timestamp - prev)
                    .to_std()
                    .map_or(true, |gap| gap <= self.config.lookback)
            });
            self.consecutive = if within_window { self.consecutive + 1 } else { 1 };
            self.last_exceedance = Some(reading.timestamp);
        } else {
            self.consecutive = 0;
            self.last_exceedance = None;
        }

        ThresholdResult {
            is_triggered: self.consecutive >= self.config.consecutive_triggers.max(1),
            trigger_type: ex.trigger_type,
            severity: ex.severity,
            g_force: ex.g_force,
            tilt: ex.tilt,
            timestamp: reading.timestamp,
        }
    }

    /// Forget the current streak so the next crash can be detected from scratch.
    pub fn reset(&mut self) {
        self.consecutive = 0;
        self.last_exceedance = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading(az: f64, roll: f64, secs: i64) -> SensorReading {
        SensorReading {
            device_id: "dev".into(),
            ax: 0.0,
            ay: 0.0,
            az,
            roll,
            pitch: 0.0,
            tilt_detected: false,
            timestamp: Utc::now() + chrono::Duration::seconds(secs),
            sequence: None,
        }
    }

    #[test]
    fn test_resting_never_triggers() {
        let mut d = ThresholdDetector::new(DetectorConfig::default());
        for i in 0..10 {
            let r = d.evaluate(&reading(9.81, 0.0, i * 2));
            assert!(!r.is_triggered);
            assert!(r.trigger_type.is_none());
            assert!((r.g_force - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_single_spike_does_not_trigger() {
        let mut d = ThresholdDetector::new(DetectorConfig::default());
        let r = d.evaluate(&reading(120.0, 0.0, 0));
        assert!(!r.is_triggered);
        assert_eq!(r.trigger_type, Some(TriggerType::Impact));
        assert_eq!(d.consecutive(), 1);
    }

    #[test]
    fn test_two_consecutive_exceedances_trigger_high_impact() {
        let mut d = ThresholdDetector::new(DetectorConfig::default());
        d.evaluate(&reading(120.0, 0.0, 0));
        let r = d.evaluate(&reading(120.0, 0.0, 2));
        assert!(r.is_triggered);
        assert_eq!(r.trigger_type, Some(TriggerType::Impact));
        assert_eq!(r.severity, Severity::High);
        assert!(r.g_force > 12.0 && r.g_force < 12.5);
    }

    #[test]
    fn test_normal_reading_breaks_streak() {
        let mut d = ThresholdDetector::new(DetectorConfig::default());
        d.evaluate(&reading(120.0, 0.0, 0));
        d.evaluate(&reading(9.81, 0.0, 2));
        let r = d.evaluate(&reading(120.0, 0.0, 4));
        assert!(!r.is_triggered);
    }

    #[test]
    fn test_exceedances_outside_lookback_are_not_consecutive() {
        let mut d = ThresholdDetector::new(DetectorConfig::default());
        d.evaluate(&reading(120.0, 0.0, 0));
        let r = d.evaluate(&reading(120.0, 0.0, 45));
        assert!(!r.is_triggered);
        assert_eq!(d.consecutive(), 1);
    }

    #[test]
    fn test_threshold_comparison_is_strict() {
        let config = DetectorConfig { gravity: 1.0, ..Default::default() };
        let at_threshold = reading(8.0, 90.0, 0);
        assert!(classify(&config, &at_threshold).trigger_type.is_none());
    }

    #[test]
    fn test_tilt_and_combined_classification() {
        let config = DetectorConfig::default();
        let tilt = classify(&config, &reading(9.81, 100.0, 0));
        assert_eq!(tilt.trigger_type, Some(TriggerType::Tilt));
        assert_eq!(tilt.severity, Severity::Low);

        let combined = classify(&config, &reading(85.0, 95.0, 0));
        assert_eq!(combined.trigger_type, Some(TriggerType::Combined));
        assert_eq!(combined.severity, Severity::Medium);

        let flipped = classify(&config, &reading(9.81, 170.0, 0));
        assert_eq!(flipped.severity, Severity::High);
    }

    #[test]
    fn test_severity_is_monotonic_in_g_force() {
        let config = DetectorConfig::default();
        let mut last = Severity::Low;
        for az in (80..200).map(f64::from) {
            let s = classify(&config, &reading(az, 0.0, 0)).severity;
            assert!(s >= last);
            last = s;
        }
        assert_eq!(last, Severity::High);
    }

    #[test]
    fn test_reset_clears_streak() {
        let mut d = ThresholdDetector::new(DetectorConfig::default());
        d.evaluate(&reading(120.0, 0.0, 0));
        d.evaluate(&reading(120.0, 0.0, 2));
        d.reset();
        assert_eq!(d.consecutive(), 0);
        assert!(!d.evaluate(&reading(120.0, 0.0, 4)).is_triggered);
    }
}
