use serde::Serialize;

use crate::{
    config::EnvironmentProfile,
    connectivity::{ConnectivityStatus, LinkStatus, ScannedNetwork},
    telemetry::{SyncWindowState, TelemetrySample},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingMode {
    LocalOnly,
    Ready,
}

impl OperatingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalOnly => "LOCAL_ONLY",
            Self::Ready => "READY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "enableMonitoring")]
    pub enable_monitoring: bool,
}

impl From<&EnvironmentProfile> for EnvironmentSummary {
    fn from(profile: &EnvironmentProfile) -> Self {
        Self {
            id: profile.id.clone(),
            name: profile.name.clone(),
            enable_monitoring: profile.enable_monitoring,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStatus {
    pub connectivity: ConnectivityStatus,
    #[serde(rename = "linkStatus")]
    pub link_status: &'static str,
    pub mode: OperatingMode,
    pub ssid: Option<String>,
    pub ip: Option<String>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    pub sample: Option<TelemetrySample>,
    pub sync: SyncWindowState,
    #[serde(rename = "sessionActive")]
    pub session_active: bool,
    #[serde(rename = "realtimeSubscribed")]
    pub realtime_subscribed: bool,
    pub environment: Option<EnvironmentSummary>,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    #[serde(rename = "localTime")]
    pub local_time: Option<String>,
    #[serde(skip)]
    pub networks: Vec<ScannedNetwork>,
}

impl Default for MonitorStatus {
    fn default() -> Self {
        Self {
            connectivity: ConnectivityStatus::Idle,
            link_status: LinkStatus::Idle.as_str(),
            mode: OperatingMode::LocalOnly,
            ssid: None,
            ip: None,
            last_error: None,
            sample: None,
            sync: SyncWindowState::default(),
            session_active: false,
            realtime_subscribed: false,
            environment: None,
            time_synced: false,
            local_time: None,
            networks: Vec::new(),
        }
    }
}
