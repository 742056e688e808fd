use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;

use crate::{
    backend::{telemetry_request, HttpTransport},
    clock::is_time_set,
    config::{ClockConfig, ConfigSet},
    endpoints::STATUS_INSERT_CREATED,
    error::{AuthError, MonitorError},
    session::SessionManager,
};

/// Synchronous probe getters. Each call may block for one hardware
/// conversion but never longer.
pub trait SensorSource {
    fn temperature(&mut self) -> f32;
    fn ph(&mut self) -> f32;
    fn turbidity(&mut self) -> f32;
    fn dissolved_oxygen(&mut self) -> f32;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub temperature: f32,
    pub ph: f32,
    pub turbidity: f32,
    #[serde(rename = "dissolvedOxygen")]
    pub dissolved_oxygen: f32,
    /// UTC epoch seconds.
    pub timestamp: i64,
}

impl TelemetrySample {
    pub fn capture(sensors: &mut dyn SensorSource, now: DateTime<Utc>) -> Self {
        Self {
            temperature: sensors.temperature(),
            ph: sensors.ph(),
            turbidity: sensors.turbidity(),
            dissolved_oxygen: sensors.dissolved_oxygen(),
            timestamp: now.timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord<'a> {
    pub aquarium_id: &'a str,
    pub sample: &'a TelemetrySample,
}

impl TelemetryRecord<'_> {
    pub fn to_json(&self) -> serde_json::Value {
        let created_at = DateTime::<Utc>::from_timestamp(self.sample.timestamp, 0)
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true));

        json!({
            "aquarium_id": self.aquarium_id,
            "temperature": self.sample.temperature,
            "ph": self.sample.ph,
            "turbidity": self.sample.turbidity,
            "dissolved_oxygen": self.sample.dissolved_oxygen,
            "created_at": created_at,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncWindowState {
    #[serde(rename = "lastSentWindow")]
    pub last_sent_window: Option<i64>,
    #[serde(rename = "sentCount")]
    pub sent_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSlot {
    pub window: i64,
    /// True on the first minute of the window, the only minute a sync may
    /// start in.
    pub due: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    TimeNotSet,
    NotDue,
    AlreadySent { window: i64 },
    Degraded,
    MonitoringDisabled,
    Offline,
    ProfileLatched,
    Failed(MonitorError),
    Sent { window: i64 },
}

impl SyncOutcome {
    /// True when the backend was contacted.
    pub fn attempted(&self) -> bool {
        matches!(self, Self::Sent { .. } | Self::Failed(_))
    }
}

pub struct SyncContext<'a> {
    pub now: DateTime<Utc>,
    pub connected: bool,
    pub config: Option<&'a ConfigSet>,
    pub sample: &'a TelemetrySample,
}

#[derive(Debug, Clone)]
pub struct TelemetryScheduler {
    window_minutes: u32,
    clock: ClockConfig,
    state: SyncWindowState,
    attempts: u32,
    profile_incomplete: bool,
}

impl TelemetryScheduler {
    pub fn new(window_minutes: u32, clock: ClockConfig) -> Self {
        Self {
            window_minutes: window_minutes.max(1),
            clock,
            state: SyncWindowState::default(),
            attempts: 0,
            profile_incomplete: false,
        }
    }

    pub fn state(&self) -> SyncWindowState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A new width or clock renumbers the windows and drops the sent marker.
    pub fn reconfigure(&mut self, window_minutes: u32, clock: ClockConfig) {
        let window_minutes = window_minutes.max(1);
        if window_minutes != self.window_minutes || clock != self.clock {
            self.state.last_sent_window = None;
        }
        self.window_minutes = window_minutes;
        self.clock = clock;
    }

    pub fn clear_profile_latch(&mut self) {
        self.profile_incomplete = false;
    }

    pub fn slot(&self, now: DateTime<Utc>) -> WindowSlot {
        let local = self.clock.local_time(now);
        let offset = i64::from(local.offset().local_minus_utc());
        let local_minutes = (now.timestamp() + offset).div_euclid(60);
        let width = i64::from(self.window_minutes);

        WindowSlot {
            window: local_minutes.div_euclid(width),
            due: local_minutes.rem_euclid(width) == 0,
        }
    }

    /// Runs the window check and, when everything lines up, one sync cycle.
    ///
    /// The window is marked only after the backend confirmed the insert, so a
    /// failure is retried by the next qualifying tick of the same window.
    pub fn maybe_sync(
        &mut self,
        ctx: SyncContext<'_>,
        session: &mut SessionManager,
        transport: &mut dyn HttpTransport,
    ) -> SyncOutcome {
        if !is_time_set(ctx.now) {
            return SyncOutcome::TimeNotSet;
        }

        let slot = self.slot(ctx.now);
        if !slot.due {
            return SyncOutcome::NotDue;
        }
        if self.state.last_sent_window == Some(slot.window) {
            return SyncOutcome::AlreadySent {
                window: slot.window,
            };
        }

        let Some(config) = ctx.config else {
            return SyncOutcome::Degraded;
        };
        if !config.environment.enable_monitoring {
            return SyncOutcome::MonitoringDisabled;
        }
        if !ctx.connected {
            return SyncOutcome::Offline;
        }
        if self.profile_incomplete {
            return SyncOutcome::ProfileLatched;
        }

        self.attempts = self.attempts.saturating_add(1);
        debug!("sync window {} due", slot.window);

        if let Err(err) = session.try_ensure(transport, &config.account) {
            warn!("authentication failed: {err}");
            return SyncOutcome::Failed(MonitorError::AuthFailed(err));
        }

        let Some(aquarium_id) = config.environment.device_id() else {
            warn!("environment profile has no id, uploads disabled until it changes");
            self.profile_incomplete = true;
            return SyncOutcome::Failed(MonitorError::ProfileIncomplete);
        };

        match self.upload(ctx.sample, aquarium_id, session, transport) {
            Ok(()) => {
                self.state.last_sent_window = Some(slot.window);
                self.state.sent_count = self.state.sent_count.saturating_add(1);
                info!(
                    "telemetry sent for window {} ({} total)",
                    slot.window, self.state.sent_count
                );
                SyncOutcome::Sent {
                    window: slot.window,
                }
            }
            Err(err) => {
                warn!("{err}");
                SyncOutcome::Failed(err)
            }
        }
    }

    fn upload(
        &self,
        sample: &TelemetrySample,
        aquarium_id: &str,
        session: &mut SessionManager,
        transport: &mut dyn HttpTransport,
    ) -> Result<(), MonitorError> {
        let Some(bearer) = session.bearer() else {
            return Err(MonitorError::AuthFailed(AuthError::NoSession));
        };

        let record = TelemetryRecord {
            aquarium_id,
            sample,
        };
        let request = telemetry_request(session.backend(), bearer, &record);

        let response = transport
            .post(&request)
            .map_err(MonitorError::UploadTransport)?;

        match response.status {
            STATUS_INSERT_CREATED => Ok(()),
            401 | 403 => {
                session.invalidate();
                Err(MonitorError::UploadFailed {
                    status: response.status,
                })
            }
            status => Err(MonitorError::UploadFailed { status }),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::{AccountCredentials, BackendConfig, EnvironmentProfile, NetworkCredentials},
        error::TransportError,
        session::tests::{ScriptedTransport, TOKENS_A, TOKENS_B},
    };

    struct ConstantProbes;

    impl SensorSource for ConstantProbes {
        fn temperature(&mut self) -> f32 {
            25.5
        }
        fn ph(&mut self) -> f32 {
            7.1
        }
        fn turbidity(&mut self) -> f32 {
            3.0
        }
        fn dissolved_oxygen(&mut self) -> f32 {
            8.25
        }
    }

    fn config_set(id: &str, monitoring: bool) -> ConfigSet {
        ConfigSet {
            network: NetworkCredentials {
                ssid: "tank".into(),
                password: "secret".into(),
            },
            account: AccountCredentials {
                email: "fish@example.test".into(),
                password: "pw".into(),
            },
            environment: EnvironmentProfile {
                id: id.into(),
                name: "Reef".into(),
                enable_monitoring: monitoring,
            },
        }
    }

    fn utc(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, minute, second).unwrap()
    }

    fn scheduler() -> TelemetryScheduler {
        TelemetryScheduler::new(5, ClockConfig::default())
    }

    fn run(
        scheduler: &mut TelemetryScheduler,
        session: &mut SessionManager,
        transport: &mut ScriptedTransport,
        config: &ConfigSet,
        now: DateTime<Utc>,
    ) -> SyncOutcome {
        let sample = TelemetrySample::capture(&mut ConstantProbes, now);
        scheduler.maybe_sync(
            SyncContext {
                now,
                connected: true,
                config: Some(config),
                sample: &sample,
            },
            session,
            transport,
        )
    }

    #[test]
    fn slot_respects_utc_offset() {
        let scheduler = scheduler();

        assert!(!scheduler.slot(utc(6, 58, 0)).due);
        let ten = scheduler.slot(utc(7, 0, 0));
        assert!(ten.due);
        assert_eq!(ten.window, scheduler.slot(utc(7, 4, 59)).window);
        assert_ne!(ten.window, scheduler.slot(utc(7, 5, 0)).window);
    }

    #[test]
    fn named_timezone_follows_daylight_saving() {
        let scheduler = TelemetryScheduler::new(
            5,
            ClockConfig {
                utc_offset_secs: 0,
                timezone: Some("Europe/Berlin".to_string()),
            },
        );
        let at = |month, day, hour, minute| {
            Utc.with_ymd_and_hms(2024, month, day, hour, minute, 0)
                .unwrap()
        };

        // Spring forward: 01:55 CET is followed by 03:00 CEST.
        let before = scheduler.slot(at(3, 31, 0, 55));
        let after = scheduler.slot(at(3, 31, 1, 0));
        assert!(before.due && after.due);
        assert_eq!(after.window - before.window, 13);

        // Fall back: 02:00 CEST and 02:00 CET share a window.
        let first = scheduler.slot(at(10, 27, 0, 0));
        let repeat = scheduler.slot(at(10, 27, 1, 0));
        assert!(repeat.due);
        assert_eq!(first.window, repeat.window);
        assert_ne!(first.window, scheduler.slot(at(10, 27, 0, 55)).window);
    }

    #[test]
    fn window_width_change_clears_sent_marker() {
        let mut scheduler = scheduler();
        let mut session = SessionManager::new(BackendConfig::default());
        let mut transport = ScriptedTransport::default()
            .reply(200, TOKENS_A)
            .reply(201, "");
        let config = config_set("7", true);
        run(&mut scheduler, &mut session, &mut transport, &config, utc(7, 0, 0));
        assert!(scheduler.state().last_sent_window.is_some());

        scheduler.reconfigure(5, ClockConfig::default());
        assert!(scheduler.state().last_sent_window.is_some());

        scheduler.reconfigure(10, ClockConfig::default());
        assert_eq!(
            scheduler.state(),
            SyncWindowState {
                last_sent_window: None,
                sent_count: 1,
            }
        );
    }

    #[test]
    fn one_upload_per_window_regardless_of_tick_rate() {
        let mut scheduler = scheduler();
        let mut session = SessionManager::new(BackendConfig::default());
        let mut transport = ScriptedTransport::default()
            .reply(200, TOKENS_A)
            .reply(201, "");
        let config = config_set("7", true);

        let mut outcomes = Vec::new();
        for second in 0..300 {
            let now = utc(7, 0, 0) + chrono::Duration::seconds(second);
            outcomes.push(run(&mut scheduler, &mut session, &mut transport, &config, now));
        }

        let sent: Vec<&SyncOutcome> = outcomes.iter().filter(|o| o.attempted()).collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(scheduler.attempts(), 1);
        assert_eq!(
            scheduler.state(),
            SyncWindowState {
                last_sent_window: Some(scheduler.slot(utc(7, 0, 0)).window),
                sent_count: 1,
            }
        );
        assert_eq!(transport.requests.len(), 2);
    }

    #[test]
    fn failed_upload_retries_within_window_only() {
        let mut scheduler = scheduler();
        let mut session = SessionManager::new(BackendConfig::default());
        let mut transport = ScriptedTransport::default()
            .reply(200, TOKENS_A)
            .reply(500, "{}")
            .reply(200, TOKENS_B)
            .reply(201, "");
        let config = config_set("7", true);

        let first = run(&mut scheduler, &mut session, &mut transport, &config, utc(7, 0, 0));
        assert_eq!(
            first,
            SyncOutcome::Failed(MonitorError::UploadFailed { status: 500 })
        );
        assert_eq!(scheduler.state().last_sent_window, None);
        assert!(session.has_session());

        let retry = run(&mut scheduler, &mut session, &mut transport, &config, utc(7, 0, 1));
        assert!(matches!(retry, SyncOutcome::Sent { .. }));
        assert_eq!(scheduler.state().sent_count, 1);
    }

    #[test]
    fn closed_window_is_abandoned() {
        let mut scheduler = scheduler();
        let mut session = SessionManager::new(BackendConfig::default());
        let mut transport = ScriptedTransport::default().fail(TransportError::Timeout);
        let config = config_set("7", true);

        let first = run(&mut scheduler, &mut session, &mut transport, &config, utc(7, 0, 0));
        assert!(first.attempted());

        for minute in 1..5 {
            let outcome = run(
                &mut scheduler,
                &mut session,
                &mut transport,
                &config,
                utc(7, minute, 0),
            );
            assert_eq!(outcome, SyncOutcome::NotDue);
        }
        assert_eq!(transport.requests.len(), 1);
        assert_eq!(scheduler.state(), SyncWindowState::default());
    }

    #[test]
    fn upload_rejection_clears_session() {
        let mut scheduler = scheduler();
        let mut session = SessionManager::new(BackendConfig::default());
        let mut transport = ScriptedTransport::default()
            .reply(200, TOKENS_A)
            .reply(401, "{}")
            .reply(200, TOKENS_B)
            .reply(201, "");
        let config = config_set("7", true);

        let first = run(&mut scheduler, &mut session, &mut transport, &config, utc(7, 0, 0));
        assert_eq!(
            first,
            SyncOutcome::Failed(MonitorError::UploadFailed { status: 401 })
        );
        assert!(!session.has_session());

        run(&mut scheduler, &mut session, &mut transport, &config, utc(7, 0, 1));
        assert!(transport.urls()[2].ends_with("grant_type=password"));
        assert_eq!(scheduler.state().sent_count, 1);
    }

    #[test]
    fn auth_failure_leaves_window_open() {
        let mut scheduler = scheduler();
        let mut session = SessionManager::new(BackendConfig::default());
        let mut transport = ScriptedTransport::default().reply(400, "{}");
        let config = config_set("7", true);

        let outcome = run(&mut scheduler, &mut session, &mut transport, &config, utc(7, 0, 0));

        assert_eq!(
            outcome,
            SyncOutcome::Failed(MonitorError::AuthFailed(AuthError::Rejected {
                status: 400
            }))
        );
        assert_eq!(transport.requests.len(), 1);
        assert_eq!(scheduler.state().last_sent_window, None);
    }

    #[test]
    fn missing_profile_id_fails_closed_until_reload() {
        let mut scheduler = scheduler();
        let mut session = SessionManager::new(BackendConfig::default());
        let mut transport = ScriptedTransport::default().reply(200, TOKENS_A);
        let config = config_set("  ", true);

        let first = run(&mut scheduler, &mut session, &mut transport, &config, utc(7, 0, 0));
        let second = run(&mut scheduler, &mut session, &mut transport, &config, utc(7, 0, 1));

        assert_eq!(first, SyncOutcome::Failed(MonitorError::ProfileIncomplete));
        assert!(first.attempted());
        assert_eq!(second, SyncOutcome::ProfileLatched);
        assert!(!second.attempted());
        assert_eq!(transport.requests.len(), 1);

        scheduler.clear_profile_latch();
        let fixed = config_set("7", true);
        let mut transport = ScriptedTransport::default()
            .reply(200, TOKENS_B)
            .reply(201, "");
        let third = run(&mut scheduler, &mut session, &mut transport, &fixed, utc(7, 0, 2));
        assert!(matches!(third, SyncOutcome::Sent { .. }));
    }

    #[test]
    fn gates_short_circuit_before_any_request() {
        let mut scheduler = scheduler();
        let mut session = SessionManager::new(BackendConfig::default());
        let mut transport = ScriptedTransport::default();
        let disabled = config_set("7", false);
        let sample = TelemetrySample::capture(&mut ConstantProbes, utc(7, 0, 0));

        let mut check = |now, connected, config: Option<&ConfigSet>| {
            scheduler.maybe_sync(
                SyncContext {
                    now,
                    connected,
                    config,
                    sample: &sample,
                },
                &mut session,
                &mut transport,
            )
        };

        assert_eq!(
            check(DateTime::<Utc>::UNIX_EPOCH, true, Some(&disabled)),
            SyncOutcome::TimeNotSet
        );
        assert_eq!(check(utc(7, 0, 0), true, None), SyncOutcome::Degraded);
        assert_eq!(
            check(utc(7, 0, 0), true, Some(&disabled)),
            SyncOutcome::MonitoringDisabled
        );
        let enabled = config_set("7", true);
        assert_eq!(
            check(utc(7, 0, 0), false, Some(&enabled)),
            SyncOutcome::Offline
        );

        assert!(transport.requests.is_empty());
    }

    #[test]
    fn record_is_tagged_with_profile_id_and_utc_time() {
        let sample = TelemetrySample::capture(&mut ConstantProbes, utc(7, 0, 0));
        let record = TelemetryRecord {
            aquarium_id: "7",
            sample: &sample,
        };

        assert_eq!(
            record.to_json(),
            json!({
                "aquarium_id": "7",
                "temperature": 25.5,
                "ph": 7.1f32,
                "turbidity": 3.0,
                "dissolved_oxygen": 8.25,
                "created_at": "2024-06-01T07:00:00Z",
            })
        );
    }
}
