//! rider.rs: Rider motion model
//!
//! One rider on a road with gentle S-bends. Produces what the wearable's IMU
//! and GPS receiver would report:
//! - Gravity on body z, scaled by 1/cos(lean) through a coordinated turn
//! - Gaussian road vibration on every axis (heavier under RoughRoad)
//! - Lean angle following the bends, heading integrating the turn rate
//! - GPS track advancing at cruise speed, altitude held constant
//!
//! Under the Crash scenario the rider takes an impact spike for two samples
//! and then lies on their side, motionless and tilted past 90°.
//!
//! Pure math, no I/O: the gateway decides when to sample.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use serde_json::{json, Value};

use sentry_types::STANDARD_GRAVITY;

use crate::scenarios::{ScenarioConfig, ScenarioType};

const METERS_PER_DEG_LAT: f64 = 111_320.0;
const IMPACT_SAMPLES: u32 = 2;

#[derive(Debug, Clone, Deserialize)]
pub struct RiderConfig {
    pub start_lat: f64,
    pub start_lon: f64,
    pub start_alt_m: f64,
    pub cruise_speed_mps: f64,
    pub vibration_sigma_g: f64,
    pub max_lean_deg: f64,
    pub turn_period_s: f64,
}

impl Default for RiderConfig {
    fn default() -> Self {
        Self {
            start_lat: 47.3769,
            start_lon: 8.5417,
            start_alt_m: 408.0,
            cruise_speed_mps: 11.0,
            vibration_sigma_g: 0.08,
            max_lean_deg: 35.0,
            turn_period_s: 40.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RidePhase {
    Riding,
    Impact { remaining: u32 },
    Down,
}

/// One IMU sample in the wearable's body frame. Accelerations in m/s², angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub roll: f64,
    pub pitch: f64,
    pub tilt_detected: bool,
}

pub struct RiderSim {
    cfg: RiderConfig,
    pub elapsed_s: f64,
    pub lat: f64,
    pub lon: f64,
    pub alt_m: f64,
    pub heading_deg: f64,
    pub speed_mps: f64,
    pub lean_deg: f64,
    pub phase: RidePhase,
    motion_seq: u32,
    gps_seq: u32,
}

impl RiderSim {
    pub fn new(cfg: RiderConfig) -> Self {
        Self {
            lat: cfg.start_lat,
            lon: cfg.start_lon,
            alt_m: cfg.start_alt_m,
            speed_mps: cfg.cruise_speed_mps,
            cfg,
            elapsed_s: 0.0,
            heading_deg: 0.0,
            lean_deg: 0.0,
            phase: RidePhase::Riding,
            motion_seq: 0,
            gps_seq: 0,
        }
    }

    /// Back on the bike at the starting point.
    pub fn reset(&mut self) {
        *self = Self::new(self.cfg.clone());
    }

    /// Advance the ride by `dt` seconds.
    pub fn tick(&mut self, dt: f64, scenario: &ScenarioConfig) {
        self.elapsed_s += dt;

        if self.phase == RidePhase::Riding
            && scenario.has(ScenarioType::Crash)
            && self.elapsed_s >= scenario.crash_after_s
        {
            self.phase = RidePhase::Impact { remaining: IMPACT_SAMPLES };
        }

        if self.phase != RidePhase::Riding {
            self.speed_mps = 0.0;
            return;
        }

        let omega = std::f64::consts::TAU / self.cfg.turn_period_s.max(1.0);
        self.lean_deg = self.cfg.max_lean_deg * (omega * self.elapsed_s).sin();

        // coordinated turn: yaw rate = g·tan(lean) / v
        let v = self.speed_mps.max(0.1);
        let yaw_rate = STANDARD_GRAVITY * self.lean_deg.to_radians().tan() / v;
        self.heading_deg = (self.heading_deg + yaw_rate.to_degrees() * dt).rem_euclid(360.0);

        let h = self.heading_deg.to_radians();
        let north = self.speed_mps * h.cos() * dt;
        let east = self.speed_mps * h.sin() * dt;
        self.lat += north / METERS_PER_DEG_LAT;
        self.lon += east / (METERS_PER_DEG_LAT * self.lat.to_radians().cos());
    }

    /// Take one IMU sample. Consumes an impact sample while the crash is in progress.
    pub fn sample_motion<R: Rng>(&mut self, scenario: &ScenarioConfig, rng: &mut R) -> MotionSample {
        let g = STANDARD_GRAVITY;
        match self.phase {
            RidePhase::Impact { remaining } => {
                self.phase = if remaining > 1 {
                    RidePhase::Impact { remaining: remaining - 1 }
                } else {
                    RidePhase::Down
                };
                let peak = scenario.impact_g * g;
                MotionSample {
                    ax: peak * 0.35 + gaussian(rng, 0.5 * g),
                    ay: peak * 0.45 + gaussian(rng, 0.5 * g),
                    az: peak * 0.82 + gaussian(rng, 0.5 * g),
                    roll: 60.0 + gaussian(rng, 15.0),
                    pitch: gaussian(rng, 20.0),
                    tilt_detected: true,
                }
            }
            RidePhase::Down => MotionSample {
                // lying on the side: gravity moves to body y
                ax: gaussian(rng, 0.02 * g),
                ay: g + gaussian(rng, 0.02 * g),
                az: gaussian(rng, 0.02 * g),
                roll: 95.0 + gaussian(rng, 1.0),
                pitch: gaussian(rng, 2.0),
                tilt_detected: true,
            },
            RidePhase::Riding => {
                let sigma_g = if scenario.has(ScenarioType::RoughRoad) {
                    scenario.rough_road_sigma_g
                } else {
                    self.cfg.vibration_sigma_g
                };
                let sigma = sigma_g * g;
                let lean = self.lean_deg.to_radians();
                MotionSample {
                    ax: gaussian(rng, sigma * 0.5),
                    ay: gaussian(rng, sigma * 0.5),
                    az: g / lean.cos().max(0.2) + gaussian(rng, sigma),
                    roll: self.lean_deg + gaussian(rng, 1.0),
                    pitch: gaussian(rng, 1.5),
                    tilt_detected: false,
                }
            }
        }
    }

    /// Motion document as the firmware sends it: nested envelope, uptime in ms.
    pub fn motion_document(&mut self, sample: &MotionSample) -> Value {
        self.motion_seq = self.motion_seq.wrapping_add(1);
        json!({
            "type": "sensor_data",
            "sequence": self.motion_seq,
            "timestamp": self.uptime_ms(),
            "sensor": {
                "ax": round2(sample.ax),
                "ay": round2(sample.ay),
                "az": round2(sample.az),
                "roll": round2(sample.roll),
                "pitch": round2(sample.pitch),
                "tilt_detected": sample.tilt_detected,
            }
        })
    }

    /// GPS document. Without a fix the receiver reports nulls.
    pub fn gps_document<R: Rng>(&mut self, scenario: &ScenarioConfig, rng: &mut R) -> Value {
        self.gps_seq = self.gps_seq.wrapping_add(1);
        let gps = if scenario.has(ScenarioType::NoGpsFix) {
            json!({
                "fix": false,
                "satellites": 0,
                "latitude": null,
                "longitude": null,
                "altitude": null,
                "accuracy": null,
                "speed": null,
            })
        } else {
            json!({
                "fix": true,
                "satellites": rng.gen_range(7..=12),
                "latitude": self.lat + gaussian(rng, 2e-5),
                "longitude": self.lon + gaussian(rng, 2e-5),
                "altitude": round2(self.alt_m + gaussian(rng, 1.5)),
                "accuracy": round2(rng.gen_range(2.5..6.0)),
                "speed": round2((self.speed_mps + gaussian(rng, 0.2)).max(0.0)),
            })
        };
        json!({
            "type": "gps_data",
            "sequence": self.gps_seq,
            "timestamp": self.uptime_ms(),
            "gps": gps,
        })
    }

    fn uptime_ms(&self) -> u64 {
        (self.elapsed_s * 1000.0) as u64
    }
}

fn gaussian<R: Rng>(rng: &mut R, sigma: f64) -> f64 {
    match Normal::new(0.0, sigma.abs()) {
        Ok(n) => n.sample(rng),
        Err(_) => 0.0,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn g_force(s: &MotionSample) -> f64 {
        (s.ax * s.ax + s.ay * s.ay + s.az * s.az).sqrt() / STANDARD_GRAVITY
    }

    #[test]
    fn test_calm_riding_stays_near_one_g() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut rider = RiderSim::new(RiderConfig::default());
        let sc = ScenarioConfig::default();
        for _ in 0..50 {
            rider.tick(0.5, &sc);
            let s = rider.sample_motion(&sc, &mut rng);
            assert!(g_force(&s) < 2.5, "calm ride produced {} g", g_force(&s));
            assert!(s.roll.abs() < 45.0);
            assert!(!s.tilt_detected);
        }
        assert!(rider.lat != RiderConfig::default().start_lat || rider.lon != RiderConfig::default().start_lon);
    }

    #[test]
    fn test_crash_produces_two_impacts_then_lies_tilted() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut rider = RiderSim::new(RiderConfig::default());
        let sc = ScenarioConfig { active: vec![ScenarioType::Crash], crash_after_s: 4.0, ..Default::default() };

        rider.tick(2.0, &sc);
        assert_eq!(rider.phase, RidePhase::Riding);
        rider.tick(2.0, &sc);
        assert_eq!(rider.phase, RidePhase::Impact { remaining: 2 });

        for _ in 0..2 {
            let s = rider.sample_motion(&sc, &mut rng);
            assert!(g_force(&s) > 10.0);
        }
        assert_eq!(rider.phase, RidePhase::Down);

        rider.tick(2.0, &sc);
        let s = rider.sample_motion(&sc, &mut rng);
        assert!(s.roll > 90.0);
        assert!(s.tilt_detected);
        assert!((g_force(&s) - 1.0).abs() < 0.2);
        assert_eq!(rider.speed_mps, 0.0);
    }

    #[test]
    fn test_documents_match_wire_schema() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut rider = RiderSim::new(RiderConfig::default());
        let sc = ScenarioConfig::default();
        let s = rider.sample_motion(&sc, &mut rng);
        let doc = rider.motion_document(&s);
        let reading = sentry_types::schema::motion_from_document(&doc, "dev", chrono::Utc::now()).unwrap();
        assert_eq!(reading.sequence, Some(1));
        assert!((reading.az - s.az).abs() < 0.01);

        let doc = rider.gps_document(&sc, &mut rng);
        let fix = sentry_types::schema::gps_from_document(&doc, chrono::Utc::now()).unwrap();
        assert!(fix.has_position());
    }

    #[test]
    fn test_no_fix_reports_null_coordinates() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut rider = RiderSim::new(RiderConfig::default());
        let sc = ScenarioConfig { active: vec![ScenarioType::NoGpsFix], ..Default::default() };
        let doc = rider.gps_document(&sc, &mut rng);
        assert_eq!(doc["gps"]["fix"], false);
        assert!(doc["gps"]["latitude"].is_null());
        let fix = sentry_types::schema::gps_from_document(&doc, chrono::Utc::now()).unwrap();
        assert!(!fix.has_position());
    }
}
