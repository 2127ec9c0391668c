use std::path::PathBuf;
use std::time::Duration;

use crate::detector::DetectorConfig;
use crate::escalation::{clamp_cooldown, EscalationConfig, DEFAULT_COOLDOWN_SECS};
use crate::lifecycle::ReconnectPolicy;
use crate::radio::udp_bridge::BridgeConfig;
use crate::transport::TransportConfig;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Everything the hub binary needs, read from `SENTRY_*` environment variables.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub http_port: u16,
    pub bridge: BridgeConfig,
    pub transport: TransportConfig,
    pub reconnect: ReconnectPolicy,
    pub detector: DetectorConfig,
    pub escalation: EscalationConfig,
    pub settings_path: PathBuf,
    /// `None` disables the on-disk audit chain
    pub audit_path: Option<PathBuf>,
    /// Rotate the audit file once it reaches this size; 0 never rotates
    pub audit_max_bytes: u64,
    /// Reconnect to the last paired device at start-up
    pub auto_connect: bool,
    pub scan_duration: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        let transport = TransportConfig {
            connect_attempts: env_or("SENTRY_CONNECT_ATTEMPTS", 3u32).max(1),
            attempt_timeout: Duration::from_millis(env_or("SENTRY_CONNECT_TIMEOUT_MS", 10_000u64)),
            stale_after: Duration::from_millis(env_or("SENTRY_STALE_MS", 6_000u64)),
            ..TransportConfig::default()
        };
        let reconnect = ReconnectPolicy {
            max_attempts: env_or("SENTRY_RECONNECT_MAX", 5u32),
            ..ReconnectPolicy::default()
        };
        let escalation = EscalationConfig {
            api_base_url: env_or("SENTRY_API_URL", "http://localhost:8000".to_string()),
            api_key: std::env::var("SENTRY_DEVICE_API_KEY").ok().filter(|k| !k.is_empty()),
            cooldown: clamp_cooldown(env_or("SENTRY_COOLDOWN_SECONDS", DEFAULT_COOLDOWN_SECS)),
            ..EscalationConfig::default()
        };
        let audit = env_or("SENTRY_AUDIT_PATH", "audit.jsonl".to_string());

        Self {
            http_port: env_or("SENTRY_HTTP_PORT", 3001u16),
            bridge: BridgeConfig::default(),
            transport,
            reconnect,
            detector: DetectorConfig::default(),
            escalation,
            settings_path: PathBuf::from(env_or("SENTRY_SETTINGS_PATH", "settings.json".to_string())),
            audit_path: (!audit.is_empty()).then(|| PathBuf::from(audit)),
            audit_max_bytes: env_or("SENTRY_AUDIT_MAX_BYTES", 10 * 1024 * 1024u64),
            auto_connect: env_or("SENTRY_AUTO_CONNECT", false),
            scan_duration: Duration::from_secs(5),
        }
    }
}
