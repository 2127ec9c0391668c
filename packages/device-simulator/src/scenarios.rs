//! scenarios.rs: Injectable rider and radio scenarios
//!
//! Each scenario exercises one path through the hub: a crash that should
//! escalate, rough roads that should not, and a link that loses fragments or
//! drops outright. Toggle them from the CLI, config.toml or the control socket.

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioType {
    /// Impact spike after `crash_after_s`, then the rider lies tilted and still
    Crash,
    /// Heavy vibration that hovers just under the impact threshold
    RoughRoad,
    /// Randomly lose notification fragments in the air
    FragmentLoss,
    /// Report a link loss every `link_drop_interval_s`
    LinkDrop,
    /// GPS receiver never acquires satellites
    NoGpsFix,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScenarioConfig {
    pub active: Vec<ScenarioType>,
    pub crash_after_s: f64,
    pub impact_g: f64,
    pub rough_road_sigma_g: f64,
    pub fragment_loss_rate: f64,
    pub link_drop_interval_s: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            active: vec![],
            crash_after_s: 30.0,
            impact_g: 14.0,
            rough_road_sigma_g: 1.6,
            fragment_loss_rate: 0.15,
            link_drop_interval_s: 45,
        }
    }
}

impl ScenarioConfig {
    pub fn has(&self, s: ScenarioType) -> bool {
        self.active.contains(&s)
    }

    pub fn enable(&mut self, s: ScenarioType) {
        if !self.has(s) {
            self.active.push(s);
        }
    }

    /// Whether the next fragment is lost in the air.
    pub fn drop_fragment<R: Rng>(&self, rng: &mut R) -> bool {
        self.has(ScenarioType::FragmentLoss) && rng.gen_bool(self.fragment_loss_rate.clamp(0.0, 1.0))
    }

    /// Link drop period, if the scenario is on.
    pub fn link_drop_period(&self) -> Option<std::time::Duration> {
        if !self.has(ScenarioType::LinkDrop) || self.link_drop_interval_s == 0 {
            return None;
        }
        Some(std::time::Duration::from_secs(self.link_drop_interval_s))
    }
}

// ── Presets ───────────────────────────────────────────────────────────────────

pub fn preset_crash() -> ScenarioConfig {
    ScenarioConfig {
        active: vec![ScenarioType::Crash],
        crash_after_s: 20.0,
        ..Default::default()
    }
}

pub fn preset_rough_road() -> ScenarioConfig {
    ScenarioConfig { active: vec![ScenarioType::RoughRoad], ..Default::default() }
}

/// Lossy, flapping link with no satellite fix: the reconnect and reassembly torture test.
pub fn preset_flaky_link() -> ScenarioConfig {
    ScenarioConfig {
        active: vec![ScenarioType::FragmentLoss, ScenarioType::LinkDrop, ScenarioType::NoGpsFix],
        fragment_loss_rate: 0.25,
        link_drop_interval_s: 30,
        ..Default::default()
    }
}

pub fn preset(name: &str) -> Option<ScenarioConfig> {
    match name {
        "crash" => Some(preset_crash()),
        "rough_road" => Some(preset_rough_road()),
        "flaky_link" => Some(preset_flaky_link()),
        "default" => Some(ScenarioConfig::default()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_scenario_names_are_screaming_snake_case() {
        let json = serde_json::to_string(&ScenarioType::NoGpsFix).unwrap();
        assert_eq!(json, "\"NO_GPS_FIX\"");
        let parsed: ScenarioConfig = serde_json::from_value(serde_json::json!({
            "active": ["CRASH", "ROUGH_ROAD"],
            "crash_after_s": 5.0,
            "impact_g": 12.0,
            "rough_road_sigma_g": 1.0,
            "fragment_loss_rate": 0.0,
            "link_drop_interval_s": 10
        }))
        .unwrap();
        assert!(parsed.has(ScenarioType::Crash));
        assert!(parsed.has(ScenarioType::RoughRoad));
        assert!(!parsed.has(ScenarioType::LinkDrop));
    }

    #[test]
    fn test_fragment_loss_only_when_active() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut sc = ScenarioConfig { fragment_loss_rate: 1.0, ..Default::default() };
        assert!(!sc.drop_fragment(&mut rng));
        sc.enable(ScenarioType::FragmentLoss);
        sc.enable(ScenarioType::FragmentLoss);
        assert_eq!(sc.active.len(), 1);
        assert!(sc.drop_fragment(&mut rng));
    }

    #[test]
    fn test_link_drop_period() {
        assert_eq!(ScenarioConfig::default().link_drop_period(), None);
        assert_eq!(
            preset_flaky_link().link_drop_period(),
            Some(std::time::Duration::from_secs(30))
        );
        assert!(preset("nope").is_none());
    }
}
