use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    config::{NetworkCredentials, RetryPolicy},
    error::MonitorError,
    store::ConfigKey,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    Idle,
    NoSsidAvailable,
    ScanCompleted,
    Connected,
    ConnectFailed,
    ConnectionLost,
    Disconnected,
}

impl LinkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::NoSsidAvailable => "Wifi not found",
            Self::ScanCompleted => "Scan completed",
            Self::Connected => "Connected",
            Self::ConnectFailed => "Failed to connect",
            Self::ConnectionLost => "Connection lost",
            Self::Disconnected => "Disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityStatus {
    Idle,
    Connecting,
    Connected,
    Failed,
    NoCredentials,
}

impl ConnectivityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Failed => "FAILED",
            Self::NoCredentials => "NO_CREDENTIALS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedNetwork {
    pub ssid: String,
    pub rssi: i8,
    pub open: bool,
}

pub trait WifiRadio {
    fn begin(&mut self, credentials: &NetworkCredentials) -> Result<(), String>;
    fn link_status(&mut self) -> LinkStatus;

    fn ip_address(&mut self) -> Option<String> {
        None
    }

    fn start_scan(&mut self) -> Result<(), String>;
    /// `None` while the scan is still running.
    fn scan_results(&mut self) -> Option<Vec<ScannedNetwork>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JoinAttempt {
    polls: u32,
    next_poll: Duration,
}

#[derive(Debug, Clone)]
pub struct ConnectivityManager {
    policy: RetryPolicy,
    status: ConnectivityStatus,
    join: Option<JoinAttempt>,
    consecutive_failures: u32,
}

impl ConnectivityManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            status: ConnectivityStatus::Idle,
            join: None,
            consecutive_failures: 0,
        }
    }

    pub fn status(&self) -> ConnectivityStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectivityStatus::Connected
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    /// Advances the state machine by at most one radio poll.
    ///
    /// A lost link and a previous failure both fall back to `Idle`. A join in
    /// progress is polled once its backoff has elapsed; the poll that exhausts
    /// `max_attempts` moves to `Failed` and returns the error.
    pub fn observe(
        &mut self,
        radio: &mut dyn WifiRadio,
        uptime: Duration,
    ) -> Result<ConnectivityStatus, MonitorError> {
        match self.status {
            ConnectivityStatus::Connected => {
                let link = radio.link_status();
                if link != LinkStatus::Connected {
                    warn!("wifi link lost ({})", link.as_str());
                    self.status = ConnectivityStatus::Idle;
                }
            }
            ConnectivityStatus::Failed => self.status = ConnectivityStatus::Idle,
            ConnectivityStatus::Connecting => self.poll(radio, uptime)?,
            ConnectivityStatus::Idle | ConnectivityStatus::NoCredentials => {}
        }
        Ok(self.status)
    }

    pub fn request_reconnect(&mut self) {
        self.join = None;
        self.status = ConnectivityStatus::Idle;
    }

    /// Starts a join and takes the first status poll. Missing or partial
    /// credentials fail without touching the radio.
    pub fn begin(
        &mut self,
        radio: &mut dyn WifiRadio,
        credentials: Option<&NetworkCredentials>,
        uptime: Duration,
    ) -> Result<(), MonitorError> {
        let Some(credentials) = credentials.filter(|credentials| credentials.is_complete()) else {
            self.join = None;
            self.status = ConnectivityStatus::NoCredentials;
            return Err(MonitorError::ConfigMissing {
                key: ConfigKey::Network,
            });
        };

        info!("wifi connecting to `{}`", credentials.ssid);
        if let Err(err) = radio.begin(credentials) {
            warn!("wifi join could not start: {err}");
            return Err(self.fail(0));
        }

        self.status = ConnectivityStatus::Connecting;
        self.join = Some(JoinAttempt {
            polls: 0,
            next_poll: uptime,
        });
        self.poll(radio, uptime)
    }

    fn poll(&mut self, radio: &mut dyn WifiRadio, uptime: Duration) -> Result<(), MonitorError> {
        let Some(mut join) = self.join else {
            self.status = ConnectivityStatus::Idle;
            return Ok(());
        };
        if uptime < join.next_poll {
            return Ok(());
        }

        join.polls += 1;
        let link = radio.link_status();
        if link == LinkStatus::Connected {
            info!("wifi connected on poll {}/{}", join.polls, self.policy.max_attempts);
            self.join = None;
            self.status = ConnectivityStatus::Connected;
            self.consecutive_failures = 0;
            return Ok(());
        }

        if join.polls >= self.policy.max_attempts {
            warn!(
                "wifi connect gave up after {} polls ({})",
                join.polls,
                link.as_str()
            );
            return Err(self.fail(join.polls));
        }

        join.next_poll = uptime + self.policy.delay_for(join.polls);
        self.join = Some(join);
        Ok(())
    }

    fn fail(&mut self, attempts: u32) -> MonitorError {
        self.join = None;
        self.status = ConnectivityStatus::Failed;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        MonitorError::NetworkJoinFailed { attempts }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkScan {
    requested: bool,
    running: bool,
    networks: Vec<ScannedNetwork>,
}

impl Default for NetworkScan {
    fn default() -> Self {
        Self {
            requested: true,
            running: false,
            networks: Vec::new(),
        }
    }
}

impl NetworkScan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&mut self) {
        self.requested = true;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn networks(&self) -> &[ScannedNetwork] {
        &self.networks
    }

    pub fn service(&mut self, radio: &mut dyn WifiRadio, joining: bool) {
        if self.running {
            match radio.scan_results() {
                Some(networks) => {
                    debug!("wifi scan found {} networks", networks.len());
                    self.networks = networks;
                    self.running = false;
                }
                None => return,
            }
        }

        if !self.requested || joining {
            return;
        }
        match radio.start_scan() {
            Ok(()) => {
                self.requested = false;
                self.running = true;
            }
            Err(err) => debug!("wifi scan could not start: {err}"),
        }
    }
}
