use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::{
    backend::HttpTransport,
    clock::{is_time_set, Clock},
    config::{ConfigSet, DeviceConfig, NetworkCredentials},
    connectivity::{ConnectivityManager, ConnectivityStatus, LinkStatus, NetworkScan, WifiRadio},
    realtime::{RealtimeChannel, RealtimeConfigListener},
    session::SessionManager,
    store::{load_document, ConfigKey, ConfigStore},
    telemetry::{SensorSource, SyncContext, SyncOutcome, TelemetrySample, TelemetryScheduler},
    types::{EnvironmentSummary, MonitorStatus, OperatingMode},
};

pub struct Devices<'a> {
    pub radio: &'a mut dyn WifiRadio,
    pub transport: &'a mut dyn HttpTransport,
    pub realtime: &'a mut dyn RealtimeChannel,
    pub sensors: &'a mut dyn SensorSource,
    pub store: &'a mut dyn ConfigStore,
    pub clock: &'a dyn Clock,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub sample: TelemetrySample,
    pub sync: SyncOutcome,
    pub reloaded: bool,
}

/// Single-threaded controller. Every collaborator is touched only from
/// [`Monitor::tick`], so no state here needs locking.
#[derive(Debug)]
pub struct Monitor {
    device: DeviceConfig,
    network: Option<NetworkCredentials>,
    config: Option<ConfigSet>,
    mode: OperatingMode,
    connectivity: ConnectivityManager,
    scan: NetworkScan,
    session: SessionManager,
    scheduler: TelemetryScheduler,
    listener: RealtimeConfigListener,
    latest: Option<TelemetrySample>,
    last_error: Option<String>,
    link: LinkStatus,
    ip: Option<String>,
    last_tick: Option<DateTime<Utc>>,
    pending_reload: bool,
    pending_reconnect: bool,
}

impl Monitor {
    pub fn new(store: &dyn ConfigStore) -> Self {
        let device = DeviceConfig::load(store);
        let mut monitor = Self {
            connectivity: ConnectivityManager::new(device.wifi_retry.clone()),
            scan: NetworkScan::new(),
            session: SessionManager::new(device.backend.clone()),
            scheduler: TelemetryScheduler::new(device.sync_window_minutes, device.clock.clone()),
            listener: RealtimeConfigListener::new(),
            device,
            network: None,
            config: None,
            mode: OperatingMode::LocalOnly,
            latest: None,
            last_error: None,
            link: LinkStatus::Idle,
            ip: None,
            last_tick: None,
            pending_reload: false,
            pending_reconnect: false,
        };
        monitor.reload_config(store);
        monitor
    }

    pub fn device_config(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn connectivity(&self) -> ConnectivityStatus {
        self.connectivity.status()
    }

    pub fn scheduler(&self) -> &TelemetryScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> Option<&ConfigSet> {
        self.config.as_ref()
    }

    pub fn request_reload(&mut self) {
        self.pending_reload = true;
    }

    pub fn request_reconnect(&mut self) {
        self.pending_reload = true;
        self.pending_reconnect = true;
    }

    pub fn request_scan(&mut self) {
        self.scan.request();
    }

    /// Re-reads every document. A missing or invalid account/environment
    /// document drops the monitor into local-only mode; network credentials
    /// alone are enough to join.
    pub fn reload_config(&mut self, store: &dyn ConfigStore) {
        self.device = DeviceConfig::load(store);
        self.connectivity.set_policy(self.device.wifi_retry.clone());
        self.scheduler
            .reconfigure(self.device.sync_window_minutes, self.device.clock.clone());
        self.session.set_backend(self.device.backend.clone());
        self.scheduler.clear_profile_latch();

        let network = load_document::<NetworkCredentials>(store, ConfigKey::Network)
            .ok()
            .filter(NetworkCredentials::is_complete);
        if network.is_some() && network != self.network && self.network.is_some() {
            info!("network credentials changed, scheduling reconnect");
            self.connectivity.request_reconnect();
        }
        self.network = network;

        match ConfigSet::load(store) {
            Ok(config) => {
                let account_changed = self
                    .config
                    .as_ref()
                    .is_some_and(|previous| previous.account != config.account);
                if account_changed {
                    self.session.invalidate();
                }
                if self.mode != OperatingMode::Ready {
                    info!("configuration complete, monitoring ready");
                }
                self.mode = OperatingMode::Ready;
                self.config = Some(config);
            }
            Err(err) => {
                if self.mode != OperatingMode::LocalOnly || self.last_error.is_none() {
                    warn!("local-only mode: {err}");
                }
                self.mode = OperatingMode::LocalOnly;
                self.config = None;
                self.session.invalidate();
                self.last_error = Some(err.to_string());
            }
        }
    }

    pub fn tick(&mut self, devices: Devices<'_>) -> TickReport {
        let Devices {
            radio,
            transport,
            realtime,
            sensors,
            store,
            clock,
        } = devices;

        let now = clock.now_utc();
        self.last_tick = Some(now);
        let sample = TelemetrySample::capture(sensors, now);
        self.latest = Some(sample);

        let mut reloaded = false;
        if std::mem::take(&mut self.pending_reload) {
            self.reload_config(store);
            reloaded = true;
        }
        if std::mem::take(&mut self.pending_reconnect) {
            self.connectivity.request_reconnect();
        }

        self.keep_link(radio, clock.uptime());
        self.scan.service(
            radio,
            self.connectivity.status() == ConnectivityStatus::Connecting,
        );

        if self.connectivity.is_connected() {
            if let Some(config) = self.config.as_ref() {
                self.listener
                    .ensure_subscribed(realtime, &self.device.backend, &config.environment, now);
            }
            if self.listener.pump(realtime, store) {
                self.reload_config(store);
                reloaded = true;
            }
        }
        if self.config.is_none() || !self.connectivity.is_connected() {
            self.listener.release(realtime);
        }

        let sync = self.scheduler.maybe_sync(
            SyncContext {
                now,
                connected: self.connectivity.is_connected(),
                config: self.config.as_ref(),
                sample: &sample,
            },
            &mut self.session,
            transport,
        );
        match &sync {
            SyncOutcome::Failed(err) => self.last_error = Some(err.to_string()),
            SyncOutcome::Sent { .. } => self.last_error = None,
            _ => {}
        }

        self.link = radio.link_status();
        TickReport {
            sample,
            sync,
            reloaded,
        }
    }

    fn keep_link(&mut self, radio: &mut dyn WifiRadio, uptime: Duration) {
        let needs_join = match self.connectivity.observe(radio, uptime) {
            Ok(ConnectivityStatus::Idle) => true,
            Ok(ConnectivityStatus::NoCredentials) => self.network.is_some(),
            Ok(_) => false,
            Err(err) => {
                self.last_error = Some(err.to_string());
                false
            }
        };
        if needs_join {
            if let Err(err) = self.connectivity.begin(radio, self.network.as_ref(), uptime) {
                debug!("join skipped or failed: {err}");
                if self.network.is_some() {
                    self.last_error = Some(err.to_string());
                }
            }
        }

        if !self.connectivity.is_connected() {
            self.ip = None;
        } else if self.ip.is_none() {
            self.ip = radio.ip_address();
            if let Some(ip) = self.ip.as_deref() {
                info!("station address {ip}");
            }
        }
    }

    pub fn snapshot(&self) -> MonitorStatus {
        let now = self.last_tick;
        MonitorStatus {
            connectivity: self.connectivity.status(),
            link_status: self.link.as_str(),
            mode: self.mode,
            ssid: self.network.as_ref().map(|network| network.ssid.clone()),
            ip: self.ip.clone(),
            last_error: self.last_error.clone(),
            sample: self.latest,
            sync: self.scheduler.state(),
            session_active: self.session.has_session(),
            realtime_subscribed: self.listener.is_subscribed(),
            environment: self
                .config
                .as_ref()
                .map(|config| EnvironmentSummary::from(&config.environment)),
            time_synced: now.is_some_and(is_time_set),
            local_time: now.filter(|now| is_time_set(*now)).map(|now| {
                self.device
                    .clock
                    .local_time(now)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            }),
            networks: self.scan.networks().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        clock::FixedClock,
        connectivity::ScannedNetwork,
        error::MonitorError,
        realtime::tests::FakeChannel,
        session::tests::{ScriptedTransport, TOKENS_A, TOKENS_B},
        store::MemoryStore,
    };

    #[derive(Default)]
    struct StationRadio {
        begins: u32,
        polls: u32,
        up: bool,
        unreachable: bool,
        scans: u32,
    }

    impl WifiRadio for StationRadio {
        fn begin(&mut self, _credentials: &NetworkCredentials) -> Result<(), String> {
            self.begins += 1;
            self.up = !self.unreachable;
            Ok(())
        }

        fn link_status(&mut self) -> LinkStatus {
            self.polls += 1;
            if self.up {
                LinkStatus::Connected
            } else {
                LinkStatus::Disconnected
            }
        }

        fn ip_address(&mut self) -> Option<String> {
            self.up.then(|| "192.168.4.20".to_string())
        }

        fn start_scan(&mut self) -> Result<(), String> {
            self.scans += 1;
            Ok(())
        }

        fn scan_results(&mut self) -> Option<Vec<ScannedNetwork>> {
            Some(vec![ScannedNetwork {
                ssid: "tank".to_string(),
                rssi: -52,
                open: false,
            }])
        }
    }

    struct Probes;

    impl SensorSource for Probes {
        fn temperature(&mut self) -> f32 {
            24.0
        }
        fn ph(&mut self) -> f32 {
            7.0
        }
        fn turbidity(&mut self) -> f32 {
            1.5
        }
        fn dissolved_oxygen(&mut self) -> f32 {
            8.0
        }
    }

    struct Rig {
        radio: StationRadio,
        transport: ScriptedTransport,
        channel: FakeChannel,
        store: MemoryStore,
        clock: FixedClock,
    }

    impl Rig {
        fn new(store: MemoryStore, transport: ScriptedTransport) -> Self {
            Self {
                radio: StationRadio::default(),
                transport,
                channel: FakeChannel::default(),
                store,
                clock: FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 6, 59, 58).unwrap()),
            }
        }

        fn tick(&mut self, monitor: &mut Monitor) -> TickReport {
            let report = monitor.tick(Devices {
                radio: &mut self.radio,
                transport: &mut self.transport,
                realtime: &mut self.channel,
                sensors: &mut Probes,
                store: &mut self.store,
                clock: &self.clock,
            });
            self.clock.advance(1);
            report
        }
    }

    fn provisioned() -> MemoryStore {
        MemoryStore::new()
            .with(ConfigKey::Network, r#"{"ssid":"tank","password":"secret"}"#)
            .with(ConfigKey::Account, r#"{"email":"fish@example.test","password":"pw"}"#)
            .with(
                ConfigKey::Environment,
                r#"{"id":"7","name":"Reef","enable_monitoring":true}"#,
            )
    }

    #[test]
    fn unprovisioned_device_stays_local_only() {
        let mut rig = Rig::new(MemoryStore::new(), ScriptedTransport::default());
        let mut monitor = Monitor::new(&rig.store);

        for _ in 0..600 {
            let report = rig.tick(&mut monitor);
            assert_eq!(report.sample.temperature, 24.0);
            assert!(!report.sync.attempted());
        }

        assert_eq!(monitor.mode(), OperatingMode::LocalOnly);
        assert_eq!(monitor.connectivity(), ConnectivityStatus::NoCredentials);
        assert_eq!(rig.radio.begins, 0);
        assert!(rig.transport.requests.is_empty());
        assert!(rig.channel.subscribed.is_empty());
        let status = monitor.snapshot();
        assert!(status.sample.is_some());
        assert_eq!(
            status.last_error,
            Some(
                MonitorError::ConfigMissing {
                    key: ConfigKey::Network
                }
                .to_string()
            )
        );
    }

    #[test]
    fn first_qualifying_tick_uploads_once() {
        let transport = ScriptedTransport::default()
            .reply(200, TOKENS_A)
            .reply(201, "");
        let mut rig = Rig::new(provisioned(), transport);
        let mut monitor = Monitor::new(&rig.store);
        assert_eq!(monitor.mode(), OperatingMode::Ready);

        let mut reports = Vec::new();
        for _ in 0..302 {
            reports.push(rig.tick(&mut monitor));
        }

        assert_eq!(rig.radio.begins, 1);
        assert_eq!(reports[0].sync, SyncOutcome::NotDue);
        let window = monitor
            .scheduler()
            .slot(Utc.with_ymd_and_hms(2024, 6, 1, 7, 0, 0).unwrap())
            .window;
        assert_eq!(reports[2].sync, SyncOutcome::Sent { window });
        assert_eq!(reports.iter().filter(|r| r.sync.attempted()).count(), 1);
        assert_eq!(monitor.scheduler().state().sent_count, 1);
        assert_eq!(monitor.scheduler().state().last_sent_window, Some(window));
        assert_eq!(rig.transport.requests.len(), 2);

        let upload: serde_json::Value =
            serde_json::from_str(&rig.transport.requests[1].body).unwrap();
        assert_eq!(upload["aquarium_id"], "7");

        assert_eq!(rig.channel.subscribed.len(), 1);
        assert_eq!(rig.channel.presence.len(), 1);
        let status = monitor.snapshot();
        assert!(status.session_active);
        assert_eq!(status.ip.as_deref(), Some("192.168.4.20"));
        assert_eq!(status.link_status, "Connected");
    }

    #[test]
    fn remote_disable_stops_the_next_upload() {
        let mut rig = Rig::new(provisioned(), ScriptedTransport::default());
        let mut monitor = Monitor::new(&rig.store);

        let first = rig.tick(&mut monitor);
        assert_eq!(first.sync, SyncOutcome::NotDue);
        assert_eq!(rig.channel.subscribed[0].filter, "id=eq.7");

        rig.tick(&mut monitor);
        rig.channel
            .push(r#"{"record":{"id":"7","name":"Reef","enable_monitoring":false}}"#);
        let due = rig.tick(&mut monitor);

        assert!(due.reloaded);
        assert_eq!(due.sync, SyncOutcome::MonitoringDisabled);
        assert!(rig.transport.requests.is_empty());
        assert_eq!(
            monitor.snapshot().environment.map(|env| env.enable_monitoring),
            Some(false)
        );
    }

    #[test]
    fn malformed_change_event_keeps_profile() {
        let mut rig = Rig::new(provisioned(), ScriptedTransport::default());
        let mut monitor = Monitor::new(&rig.store);
        rig.tick(&mut monitor);

        rig.channel.push(r#"{"type":"UPDATE"}"#);
        let report = rig.tick(&mut monitor);

        assert!(!report.reloaded);
        assert_eq!(
            rig.store.read(ConfigKey::Environment).unwrap().as_deref(),
            Some(r#"{"id":"7","name":"Reef","enable_monitoring":true}"#)
        );
        assert_eq!(monitor.mode(), OperatingMode::Ready);
    }

    #[test]
    fn reload_request_leaves_local_only_mode() {
        let mut rig = Rig::new(MemoryStore::new(), ScriptedTransport::default());
        let mut monitor = Monitor::new(&rig.store);
        rig.tick(&mut monitor);
        assert_eq!(rig.radio.begins, 0);

        rig.store = provisioned();
        monitor.request_reload();
        let report = rig.tick(&mut monitor);

        assert!(report.reloaded);
        assert_eq!(monitor.mode(), OperatingMode::Ready);
        assert_eq!(monitor.connectivity(), ConnectivityStatus::Connected);
        assert_eq!(rig.radio.begins, 1);
    }

    #[test]
    fn network_alone_joins_but_stays_degraded() {
        let store =
            MemoryStore::new().with(ConfigKey::Network, r#"{"ssid":"tank","password":"secret"}"#);
        let mut rig = Rig::new(store, ScriptedTransport::default());
        let mut monitor = Monitor::new(&rig.store);

        for _ in 0..5 {
            rig.tick(&mut monitor);
        }

        assert_eq!(monitor.connectivity(), ConnectivityStatus::Connected);
        assert_eq!(monitor.mode(), OperatingMode::LocalOnly);
        assert!(rig.transport.requests.is_empty());
        assert!(rig.channel.subscribed.is_empty());
    }

    #[test]
    fn unreachable_network_keeps_connecting_between_ticks() {
        let store =
            MemoryStore::new().with(ConfigKey::Network, r#"{"ssid":"tank","password":"secret"}"#);
        let mut rig = Rig::new(store, ScriptedTransport::default());
        rig.radio.unreachable = true;
        let mut monitor = Monitor::new(&rig.store);

        let statuses: Vec<ConnectivityStatus> = (0..3)
            .map(|_| {
                rig.tick(&mut monitor);
                monitor.snapshot().connectivity
            })
            .collect();

        assert_eq!(statuses, vec![ConnectivityStatus::Connecting; 3]);
        assert_eq!(rig.radio.begins, 1);
        assert_eq!(monitor.snapshot().ip, None);
    }

    #[test]
    fn failed_join_is_retried_on_a_later_tick() {
        let mut rig = Rig::new(provisioned(), ScriptedTransport::default());
        rig.radio.unreachable = true;
        let mut monitor = Monitor::new(&rig.store);

        rig.tick(&mut monitor);
        assert_eq!(monitor.connectivity(), ConnectivityStatus::Connecting);
        for _ in 1..10 {
            rig.tick(&mut monitor);
        }
        assert_eq!(monitor.connectivity(), ConnectivityStatus::Failed);
        assert_eq!(rig.radio.begins, 1);
        assert_eq!(
            monitor.snapshot().last_error,
            Some(MonitorError::NetworkJoinFailed { attempts: 10 }.to_string())
        );

        rig.radio.unreachable = false;
        rig.tick(&mut monitor);
        assert_eq!(monitor.connectivity(), ConnectivityStatus::Connected);
        assert_eq!(rig.radio.begins, 2);
    }

    #[test]
    fn link_loss_triggers_rejoin_and_resubscribe() {
        let mut rig = Rig::new(provisioned(), ScriptedTransport::default());
        let mut monitor = Monitor::new(&rig.store);
        rig.tick(&mut monitor);

        rig.radio.up = false;
        rig.radio.unreachable = true;
        rig.tick(&mut monitor);
        assert_eq!(monitor.connectivity(), ConnectivityStatus::Connecting);
        assert!(!monitor.snapshot().realtime_subscribed);

        rig.radio.up = true;
        rig.tick(&mut monitor);
        assert!(monitor.snapshot().realtime_subscribed);
        assert_eq!(rig.channel.subscribed.len(), 2);
        assert_eq!(rig.radio.begins, 2);
    }

    #[test]
    fn account_change_forces_a_fresh_login() {
        let transport = ScriptedTransport::default()
            .reply(200, TOKENS_A)
            .reply(201, "")
            .reply(200, TOKENS_B)
            .reply(201, "");
        let mut rig = Rig::new(provisioned(), transport);
        let mut monitor = Monitor::new(&rig.store);
        for _ in 0..3 {
            rig.tick(&mut monitor);
        }
        assert!(monitor.snapshot().session_active);

        rig.store
            .write(
                ConfigKey::Account,
                r#"{"email":"keeper@example.test","password":"pw2"}"#,
            )
            .unwrap();
        monitor.request_reload();
        let report = rig.tick(&mut monitor);
        assert!(report.reloaded);
        assert!(!monitor.snapshot().session_active);

        // 07:00:01 now; the next window opens at 07:05:00.
        let reports: Vec<TickReport> = (0..299).map(|_| rig.tick(&mut monitor)).collect();

        assert!(matches!(reports[298].sync, SyncOutcome::Sent { .. }));
        assert_eq!(rig.transport.requests.len(), 4);
        assert!(rig.transport.urls()[2].ends_with("grant_type=password"));
        let login: serde_json::Value =
            serde_json::from_str(&rig.transport.requests[2].body).unwrap();
        assert_eq!(login["email"], "keeper@example.test");
    }

    #[test]
    fn scan_results_reach_the_snapshot() {
        let mut rig = Rig::new(MemoryStore::new(), ScriptedTransport::default());
        let mut monitor = Monitor::new(&rig.store);

        rig.tick(&mut monitor);
        rig.tick(&mut monitor);
        assert_eq!(rig.radio.scans, 1);
        assert_eq!(monitor.snapshot().networks[0].ssid, "tank");

        monitor.request_scan();
        rig.tick(&mut monitor);
        assert_eq!(rig.radio.scans, 2);
    }
}
