use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    error::MonitorError,
    store::{load_document, ConfigKey, ConfigStore},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredentials {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

impl NetworkCredentials {
    pub fn is_complete(&self) -> bool {
        !self.ssid.trim().is_empty() && !self.password.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCredentials {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

impl AccountCredentials {
    pub fn is_complete(&self) -> bool {
        !self.email.trim().is_empty() && !self.password.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentProfile {
    #[serde(default, deserialize_with = "deserialize_record_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(
        rename = "enable_monitoring",
        alias = "enableMonitoring",
        default
    )]
    pub enable_monitoring: bool,
}

impl EnvironmentProfile {
    pub fn device_id(&self) -> Option<&str> {
        let id = self.id.trim();
        (!id.is_empty()).then_some(id)
    }
}

fn deserialize_record_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Option::<RawId>::deserialize(deserializer)? {
        Some(RawId::Text(text)) => text,
        Some(RawId::Number(number)) => number.to_string(),
        None => String::new(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSet {
    pub network: NetworkCredentials,
    pub account: AccountCredentials,
    pub environment: EnvironmentProfile,
}

impl ConfigSet {
    pub fn load(store: &dyn ConfigStore) -> Result<Self, MonitorError> {
        let network: NetworkCredentials = load_document(store, ConfigKey::Network)?;
        if !network.is_complete() {
            return Err(MonitorError::ConfigInvalid {
                key: ConfigKey::Network,
                reason: "ssid and password are required".to_string(),
            });
        }

        let account: AccountCredentials = load_document(store, ConfigKey::Account)?;
        if !account.is_complete() {
            return Err(MonitorError::ConfigInvalid {
                key: ConfigKey::Account,
                reason: "email and password are required".to_string(),
            });
        }

        let environment = load_document(store, ConfigKey::Environment)?;

        Ok(Self {
            network,
            account,
            environment,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f32,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1_000,
            backoff_factor: 1.0,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Wait after the `attempt`-th status poll (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay_ms as f64 * f64::from(self.backoff_factor).powi(exponent);
        let capped = scaled.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn sanitize(&mut self) {
        self.max_attempts = self.max_attempts.clamp(1, 60);
        self.initial_delay_ms = self.initial_delay_ms.clamp(10, 60_000);
        if !self.backoff_factor.is_finite() {
            self.backoff_factor = 1.0;
        }
        self.backoff_factor = self.backoff_factor.clamp(1.0, 4.0);
        self.max_delay_ms = self.max_delay_ms.clamp(self.initial_delay_ms, 120_000);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub utc_offset_secs: i32,
    pub timezone: Option<String>,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            utc_offset_secs: 3 * 3_600,
            timezone: None,
        }
    }
}

impl ClockConfig {
    pub fn local_time(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        if let Some(tz) = self.timezone.as_deref().and_then(|tz| tz.parse::<Tz>().ok()) {
            let local = now.with_timezone(&tz);
            return local.with_timezone(&local.offset().fix());
        }

        let offset = FixedOffset::east_opt(self.utc_offset_secs)
            .unwrap_or_else(|| Utc.fix());
        now.with_timezone(&offset)
    }

    pub fn sanitize(&mut self) {
        self.utc_offset_secs = self.utc_offset_secs.clamp(-14 * 3_600, 14 * 3_600);
        if let Some(tz) = self.timezone.as_deref() {
            if tz.trim().is_empty() || tz.parse::<Tz>().is_err() {
                warn!("ignoring unknown timezone `{tz}`, using fixed offset");
                self.timezone = None;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: String,
    pub telemetry_table: String,
    pub realtime_schema: String,
    pub realtime_table: String,
    pub realtime_event: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://aquawatch.supabase.co".to_string(),
            api_key: String::new(),
            telemetry_table: "measurements".to_string(),
            realtime_schema: "public".to_string(),
            realtime_table: "aquariums".to_string(),
            realtime_event: "UPDATE".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeBridgeConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub topic_prefix: String,
    pub client_id: String,
}

impl Default for RealtimeBridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            user: String::new(),
            pass: String::new(),
            topic_prefix: "aquawatch/realtime".to_string(),
            client_id: "aquawatch-monitor".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub tick_interval_ms: u64,
    pub http_timeout_ms: u64,
    pub wifi_retry: RetryPolicy,
    pub sync_window_minutes: u32,
    pub clock: ClockConfig,
    pub backend: BackendConfig,
    pub realtime: RealtimeBridgeConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            http_timeout_ms: 10_000,
            wifi_retry: RetryPolicy::default(),
            sync_window_minutes: 5,
            clock: ClockConfig::default(),
            backend: BackendConfig::default(),
            realtime: RealtimeBridgeConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Loads the device document, falling back to defaults when it is absent
    /// or unreadable. Device tunables never block local operation.
    pub fn load(store: &dyn ConfigStore) -> Self {
        let mut config = match load_document::<DeviceConfig>(store, ConfigKey::Device) {
            Ok(config) => config,
            Err(MonitorError::ConfigMissing { .. }) => DeviceConfig::default(),
            Err(err) => {
                warn!("falling back to default device config: {err}");
                DeviceConfig::default()
            }
        };
        config.sanitize();
        config
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn sanitize(&mut self) {
        self.tick_interval_ms = self.tick_interval_ms.clamp(100, 60_000);
        self.http_timeout_ms = self.http_timeout_ms.clamp(1_000, 60_000);
        self.sync_window_minutes = self.sync_window_minutes.clamp(1, 60);
        self.wifi_retry.sanitize();
        self.clock.sanitize();

        let trimmed = self.backend.base_url.trim().trim_end_matches('/').to_string();
        self.backend.base_url = trimmed;
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn retry_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 5_000,
        };

        let delays: Vec<u64> = (1..=5)
            .map(|attempt| policy.delay_for(attempt).as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);
    }

    #[test]
    fn default_retry_is_fixed_spacing() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = DeviceConfig {
            tick_interval_ms: 0,
            http_timeout_ms: 600_000,
            sync_window_minutes: 0,
            wifi_retry: RetryPolicy {
                max_attempts: 0,
                initial_delay_ms: 0,
                backoff_factor: f32::NAN,
                max_delay_ms: 1,
            },
            clock: ClockConfig {
                utc_offset_secs: 99 * 3_600,
                timezone: Some("Mars/Olympus_Mons".to_string()),
            },
            ..DeviceConfig::default()
        };
        config.backend.base_url = "https://example.test/ ".to_string();

        config.sanitize();

        assert_eq!(config.tick_interval_ms, 100);
        assert_eq!(config.http_timeout_ms, 60_000);
        assert_eq!(config.sync_window_minutes, 1);
        assert_eq!(config.wifi_retry.max_attempts, 1);
        assert_eq!(config.wifi_retry.initial_delay_ms, 10);
        assert_eq!(config.wifi_retry.backoff_factor, 1.0);
        assert_eq!(config.wifi_retry.max_delay_ms, 10);
        assert_eq!(config.clock.utc_offset_secs, 14 * 3_600);
        assert_eq!(config.clock.timezone, None);
        assert_eq!(config.backend.base_url, "https://example.test");
    }

    #[test]
    fn local_time_uses_fixed_offset() {
        let clock = ClockConfig::default();
        let utc = Utc.with_ymd_and_hms(2024, 6, 1, 6, 58, 0).unwrap();

        let local = clock.local_time(utc);

        assert_eq!((local.hour(), local.minute()), (9, 58));
    }

    #[test]
    fn local_time_prefers_timezone() {
        let clock = ClockConfig {
            utc_offset_secs: 0,
            timezone: Some("Europe/Berlin".to_string()),
        };
        let summer = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap();
        let winter = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        assert_eq!(clock.local_time(summer).hour(), 14);
        assert_eq!(clock.local_time(winter).hour(), 13);
    }

    #[test]
    fn environment_accepts_numeric_id_and_both_flag_spellings() {
        let snake: EnvironmentProfile =
            serde_json::from_str(r#"{"id":42,"name":"Reef","enable_monitoring":true}"#).unwrap();
        let camel: EnvironmentProfile =
            serde_json::from_str(r#"{"id":"a1","name":"Reef","enableMonitoring":true}"#).unwrap();
        let missing: EnvironmentProfile = serde_json::from_str(r#"{"name":"Reef"}"#).unwrap();

        assert_eq!(snake.device_id(), Some("42"));
        assert!(snake.enable_monitoring);
        assert_eq!(camel.device_id(), Some("a1"));
        assert!(camel.enable_monitoring);
        assert_eq!(missing.device_id(), None);
        assert!(!missing.enable_monitoring);
    }

    #[test]
    fn config_set_requires_all_documents() {
        let store = MemoryStore::new()
            .with(ConfigKey::Network, r#"{"ssid":"tank","password":"secret"}"#)
            .with(ConfigKey::Account, r#"{"email":"a@b.c","password":"pw"}"#);

        assert_eq!(
            ConfigSet::load(&store).unwrap_err(),
            MonitorError::ConfigMissing {
                key: ConfigKey::Environment
            }
        );

        let store = store.with(
            ConfigKey::Environment,
            r#"{"id":"7","name":"Reef","enable_monitoring":true}"#,
        );
        let set = ConfigSet::load(&store).unwrap();
        assert_eq!(set.network.ssid, "tank");
        assert_eq!(set.environment.device_id(), Some("7"));
    }

    #[test]
    fn config_set_rejects_partial_credentials() {
        let store = MemoryStore::new()
            .with(ConfigKey::Network, r#"{"ssid":"tank"}"#)
            .with(ConfigKey::Account, r#"{"email":"a@b.c","password":"pw"}"#)
            .with(ConfigKey::Environment, r#"{"id":"7"}"#);

        assert!(matches!(
            ConfigSet::load(&store),
            Err(MonitorError::ConfigInvalid {
                key: ConfigKey::Network,
                ..
            })
        ));
    }

    #[test]
    fn device_config_falls_back_to_defaults() {
        let store = MemoryStore::new().with(ConfigKey::Device, "not json");
        assert_eq!(DeviceConfig::load(&store), DeviceConfig::default());

        let store = MemoryStore::new().with(
            ConfigKey::Device,
            r#"{"tick_interval_ms":500,"sync_window_minutes":10}"#,
        );
        let config = DeviceConfig::load(&store);
        assert_eq!(config.tick_interval_ms, 500);
        assert_eq!(config.sync_window_minutes, 10);
        assert_eq!(config.wifi_retry, RetryPolicy::default());
    }
}
