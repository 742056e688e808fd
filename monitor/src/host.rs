use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
};
use tracing::{debug, info, warn};

use aquawatch_common::{
    presence_topic, provisioning, ApiEffect, ApiReply, Clock, ConfigKey, ConfigStore,
    DeviceConfig, Devices, HttpRequest, HttpResponse, HttpTransport, LinkStatus, Monitor,
    MonitorStatus, NetworkCredentials, PresencePayload, RealtimeBridgeConfig, RealtimeChannel,
    ScannedNetwork, SensorSource, StoreError, Subscription, SyncOutcome, TransportError,
    WifiRadio,
};

const MAX_CHANGE_PAYLOAD_BYTES: usize = 4096;

#[derive(Clone)]
struct AppState {
    store: FileStore,
    status: Arc<Mutex<MonitorStatus>>,
    reload: Arc<AtomicBool>,
    reconnect: Arc<AtomicBool>,
    scan: Arc<AtomicBool>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("AQUAWATCH_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.aquawatch"));
    let mut store = FileStore::new(data_dir);

    let device = apply_env_overrides(&mut store).context("failed to seed device config")?;

    let (events_tx, events_rx) = mpsc::channel();
    let (realtime, eventloop) = MqttRealtime::new(&device.realtime, events_rx);
    spawn_realtime_loop(realtime.client.clone(), realtime.active.clone(), eventloop, events_tx);

    let app_state = AppState {
        store: store.clone(),
        status: Arc::new(Mutex::new(MonitorStatus::default())),
        reload: Arc::new(AtomicBool::new(false)),
        reconnect: Arc::new(AtomicBool::new(false)),
        scan: Arc::new(AtomicBool::new(false)),
    };

    spawn_controller(app_state.clone(), store, realtime)?;

    let web_root = std::env::var("AQUAWATCH_WEB_ROOT")
        .unwrap_or_else(|_| format!("{}/web", env!("CARGO_MANIFEST_DIR")));
    let serve_dir =
        ServeDir::new(&web_root).not_found_service(ServeFile::new(format!("{web_root}/index.html")));

    let app = Router::new()
        .route(
            "/api/wifi-conf",
            get(handle_get_wifi_conf).post(handle_save_wifi_conf),
        )
        .route(
            "/api/user-conf",
            get(handle_get_user_conf).post(handle_save_user_conf),
        )
        .route(
            "/api/environment",
            get(handle_get_environment).post(handle_save_environment),
        )
        .route("/api/status", get(handle_get_status))
        .route("/api/telemetry", get(handle_get_telemetry))
        .route("/api/scan", get(handle_scan))
        .route("/api/connect", get(handle_connect))
        .route("/api/restart", get(handle_restart))
        .fallback_service(serve_dir)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(app_state);

    let port = std::env::var("AQUAWATCH_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind provisioning server at {addr}"))?;

    info!("provisioning api listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Folds `AQUAWATCH_*` overrides into the stored device document so the
/// controller thread picks them up on every reload.
fn apply_env_overrides(store: &mut FileStore) -> anyhow::Result<DeviceConfig> {
    let mut device = DeviceConfig::load(&*store);
    let before = device.clone();

    if let Ok(url) = std::env::var("AQUAWATCH_BACKEND_URL") {
        device.backend.base_url = url;
    }
    if let Ok(key) = std::env::var("AQUAWATCH_API_KEY") {
        device.backend.api_key = key;
    }
    if let Ok(host) = std::env::var("AQUAWATCH_MQTT_HOST") {
        device.realtime.host = host;
    }
    if let Some(port) = std::env::var("AQUAWATCH_MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        device.realtime.port = port;
    }
    device.sanitize();

    if device != before {
        let document = serde_json::to_string_pretty(&device)?;
        store.write(ConfigKey::Device, &document)?;
        info!("device config updated from environment");
    }
    Ok(device)
}

fn spawn_controller(state: AppState, store: FileStore, realtime: MqttRealtime) -> anyhow::Result<()> {
    std::thread::Builder::new()
        .name("controller".to_string())
        .spawn(move || {
            if let Err(err) = controller_loop(state, store, realtime) {
                warn!("controller stopped: {err:#}");
            }
        })
        .context("failed to spawn controller thread")?;
    Ok(())
}

fn controller_loop(
    state: AppState,
    mut store: FileStore,
    mut realtime: MqttRealtime,
) -> anyhow::Result<()> {
    let mut monitor = Monitor::new(&store);
    let mut transport = ReqwestTransport::new(monitor.device_config().http_timeout())?;
    let mut radio = HostRadio::default();
    let mut probes = SimulatedProbes::default();
    let clock = SystemClock::new();

    info!("controller started in {} mode", monitor.mode().as_str());

    loop {
        let started = Instant::now();

        if state.reload.swap(false, Ordering::AcqRel) {
            monitor.request_reload();
        }
        if state.reconnect.swap(false, Ordering::AcqRel) {
            monitor.request_reconnect();
        }
        if state.scan.swap(false, Ordering::AcqRel) {
            monitor.request_scan();
        }

        let report = monitor.tick(Devices {
            radio: &mut radio,
            transport: &mut transport,
            realtime: &mut realtime,
            sensors: &mut probes,
            store: &mut store,
            clock: &clock,
        });
        match &report.sync {
            SyncOutcome::Sent { window } => info!("window {window} synced"),
            SyncOutcome::Failed(err) => debug!("sync failed: {err}"),
            _ => {}
        }

        let timeout = monitor.device_config().http_timeout();
        if timeout != transport.timeout {
            transport = ReqwestTransport::new(timeout)?;
        }

        if let Ok(mut status) = state.status.lock() {
            *status = monitor.snapshot();
        }

        let elapsed = started.elapsed();
        std::thread::sleep(monitor.device_config().tick_interval().saturating_sub(elapsed));
    }
}

fn reply_response(state: &AppState, reply: ApiReply) -> Response {
    match reply.effect {
        ApiEffect::Reload => state.reload.store(true, Ordering::Release),
        ApiEffect::Reconnect => {
            state.reload.store(true, Ordering::Release);
            state.reconnect.store(true, Ordering::Release);
        }
        ApiEffect::Scan => state.scan.store(true, Ordering::Release),
        ApiEffect::Restart | ApiEffect::None => {}
    }

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply.body)).into_response()
}

async fn handle_get_wifi_conf(State(state): State<AppState>) -> Response {
    let reply = provisioning::get_network(&mut state.store.clone());
    reply_response(&state, reply)
}

async fn handle_save_wifi_conf(State(state): State<AppState>, body: Bytes) -> Response {
    let reply = provisioning::save_network(&mut state.store.clone(), &body);
    reply_response(&state, reply)
}

async fn handle_get_user_conf(State(state): State<AppState>) -> Response {
    let reply = provisioning::get_account(&mut state.store.clone());
    reply_response(&state, reply)
}

async fn handle_save_user_conf(State(state): State<AppState>, body: Bytes) -> Response {
    let reply = provisioning::save_account(&mut state.store.clone(), &body);
    reply_response(&state, reply)
}

async fn handle_get_environment(State(state): State<AppState>) -> Response {
    let reply = provisioning::get_environment(&mut state.store.clone());
    reply_response(&state, reply)
}

async fn handle_save_environment(State(state): State<AppState>, body: Bytes) -> Response {
    let reply = provisioning::save_environment(&mut state.store.clone(), &body);
    reply_response(&state, reply)
}

async fn handle_get_status(State(state): State<AppState>) -> Response {
    let snapshot = current_status(&state);
    reply_response(&state, provisioning::status(&snapshot))
}

async fn handle_get_telemetry(State(state): State<AppState>) -> Response {
    let snapshot = current_status(&state);
    reply_response(&state, provisioning::telemetry(&snapshot))
}

async fn handle_scan(State(state): State<AppState>) -> Response {
    let snapshot = current_status(&state);
    reply_response(&state, provisioning::scan(&snapshot.networks))
}

async fn handle_connect(State(state): State<AppState>) -> Response {
    let reply = provisioning::connect(&mut state.store.clone());
    reply_response(&state, reply)
}

async fn handle_restart() -> impl IntoResponse {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(aquawatch_common::ApiMessage {
            message: "Restart is only available in ESP32 builds".to_string(),
            data: None,
        }),
    )
}

fn current_status(state: &AppState) -> MonitorStatus {
    state
        .status
        .lock()
        .map(|status| status.clone())
        .unwrap_or_default()
}

/// JSON documents under a data directory, one file per key.
#[derive(Clone)]
struct FileStore {
    dir: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl FileStore {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir: Arc::new(dir),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn path(&self, key: ConfigKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.lock
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }
}

fn io_error(key: ConfigKey, err: std::io::Error) -> StoreError {
    StoreError::Io {
        key: key.as_str(),
        message: err.to_string(),
    }
}

impl ConfigStore for FileStore {
    fn read(&self, key: ConfigKey) -> Result<Option<String>, StoreError> {
        let _guard = self.guard()?;
        match std::fs::read_to_string(self.path(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(key, err)),
        }
    }

    fn write(&mut self, key: ConfigKey, document: &str) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        std::fs::create_dir_all(self.dir.as_ref()).map_err(|err| io_error(key, err))?;

        let path = self.path(key);
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, document).map_err(|err| io_error(key, err))?;
        std::fs::rename(&staging, &path).map_err(|err| io_error(key, err))
    }

    fn delete(&mut self, key: ConfigKey) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(key, err)),
        }
    }
}

struct ReqwestTransport {
    client: reqwest::blocking::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client, timeout })
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Io(err.to_string())
    }
}

impl HttpTransport for ReqwestTransport {
    fn post(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.post(&request.url).body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(*name, value.as_str());
        }

        let response = builder.send().map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(transport_error)?;
        Ok(HttpResponse { status, body })
    }
}

/// Realtime change feed carried over the MQTT bridge.
struct MqttRealtime {
    client: AsyncClient,
    prefix: String,
    active: Arc<Mutex<Option<String>>>,
    events: mpsc::Receiver<Vec<u8>>,
}

impl MqttRealtime {
    fn new(config: &RealtimeBridgeConfig, events: mpsc::Receiver<Vec<u8>>) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if !config.user.is_empty() {
            options.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, 32);
        let realtime = Self {
            client,
            prefix: config.topic_prefix.clone(),
            active: Arc::new(Mutex::new(None)),
            events,
        };
        (realtime, eventloop)
    }

    fn set_active(&self, topic: Option<String>) {
        if let Ok(mut active) = self.active.lock() {
            *active = topic;
        }
    }
}

impl RealtimeChannel for MqttRealtime {
    fn subscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError> {
        let topic = subscription.topic(&self.prefix);
        self.client
            .try_subscribe(topic.clone(), QoS::AtLeastOnce)
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        self.set_active(Some(topic));
        Ok(())
    }

    fn unsubscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError> {
        self.set_active(None);
        self.client
            .try_unsubscribe(subscription.topic(&self.prefix))
            .map_err(|err| TransportError::Connect(err.to_string()))
    }

    fn send_presence(&mut self, device_id: &str, payload: &PresencePayload) {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(err) => {
                warn!("presence serialization failed: {err}");
                return;
            }
        };
        let topic = presence_topic(&self.prefix, device_id);
        if let Err(err) = self.client.try_publish(topic, QoS::AtMostOnce, false, body) {
            warn!("presence publish failed: {err}");
        }
    }

    fn poll_event(&mut self) -> Option<Vec<u8>> {
        self.events.try_recv().ok()
    }
}

fn spawn_realtime_loop(
    client: AsyncClient,
    active: Arc<Mutex<Option<String>>>,
    mut eventloop: EventLoop,
    events: mpsc::Sender<Vec<u8>>,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if message.payload.len() > MAX_CHANGE_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized change event on {} ({} bytes)",
                            message.topic,
                            message.payload.len()
                        );
                        continue;
                    }
                    if events.send(message.payload.to_vec()).is_err() {
                        warn!("controller gone, stopping realtime bridge");
                        return;
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("realtime bridge connected");
                    let topic = active.lock().ok().and_then(|active| active.clone());
                    if let Some(topic) = topic {
                        if let Err(err) = client.subscribe(topic, QoS::AtLeastOnce).await {
                            warn!("realtime resubscribe failed: {err}");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("realtime bridge poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// The host shares the machine's own network connection.
#[derive(Default)]
struct HostRadio {
    ssid: Option<String>,
}

impl WifiRadio for HostRadio {
    fn begin(&mut self, credentials: &NetworkCredentials) -> Result<(), String> {
        self.ssid = Some(credentials.ssid.clone());
        Ok(())
    }

    fn link_status(&mut self) -> LinkStatus {
        if self.ssid.is_some() {
            LinkStatus::Connected
        } else {
            LinkStatus::Idle
        }
    }

    fn ip_address(&mut self) -> Option<String> {
        self.ssid.as_ref().map(|_| "127.0.0.1".to_string())
    }

    fn start_scan(&mut self) -> Result<(), String> {
        Ok(())
    }

    // No radio to sweep; the saved network is the only one in range.
    fn scan_results(&mut self) -> Option<Vec<ScannedNetwork>> {
        Some(
            self.ssid
                .iter()
                .map(|ssid| ScannedNetwork {
                    ssid: ssid.clone(),
                    rssi: -40,
                    open: false,
                })
                .collect(),
        )
    }
}

struct SystemClock {
    boot: Instant,
}

impl SystemClock {
    fn new() -> Self {
        Self {
            boot: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn uptime(&self) -> Duration {
        self.boot.elapsed()
    }
}

#[derive(Default)]
struct SimulatedProbes {
    tick: u64,
}

impl SensorSource for SimulatedProbes {
    // Hardware integration point: the esp32 build reads the real probes.
    fn temperature(&mut self) -> f32 {
        self.tick = self.tick.wrapping_add(1);
        24.0 + (self.tick % 8) as f32 * 0.1
    }

    fn ph(&mut self) -> f32 {
        7.0 + (self.tick % 6) as f32 * 0.05
    }

    fn turbidity(&mut self) -> f32 {
        2.0 + (self.tick % 5) as f32 * 0.3
    }

    fn dissolved_oxygen(&mut self) -> f32 {
        8.2 - (self.tick % 4) as f32 * 0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path().join("data"));

        assert_eq!(store.read(ConfigKey::Network).unwrap(), None);

        store
            .write(ConfigKey::Network, r#"{"ssid":"tank","password":"secret"}"#)
            .unwrap();
        assert!(dir.path().join("data").join("wifi.json").exists());
        assert_eq!(
            store.read(ConfigKey::Network).unwrap().as_deref(),
            Some(r#"{"ssid":"tank","password":"secret"}"#)
        );

        store.delete(ConfigKey::Network).unwrap();
        store.delete(ConfigKey::Network).unwrap();
        assert_eq!(store.read(ConfigKey::Network).unwrap(), None);
    }

    #[test]
    fn file_store_clones_share_documents() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FileStore::new(dir.path().to_path_buf());
        let reader = writer.clone();

        writer.write(ConfigKey::Environment, r#"{"id":"7"}"#).unwrap();

        assert_eq!(
            reader.read(ConfigKey::Environment).unwrap().as_deref(),
            Some(r#"{"id":"7"}"#)
        );
    }

    #[test]
    fn provisioning_writes_land_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path().to_path_buf());

        let reply = provisioning::save_account(
            &mut store,
            br#"{"email":"fish@example.test","password":"pw"}"#,
        );
        assert_eq!(reply.status, 200);

        let monitor = Monitor::new(&store);
        assert_eq!(monitor.mode().as_str(), "LOCAL_ONLY");
        assert!(dir.path().join("user.json").exists());
    }

    #[test]
    fn host_radio_connects_after_begin() {
        let mut radio = HostRadio::default();
        assert_eq!(radio.link_status(), LinkStatus::Idle);

        radio
            .begin(&NetworkCredentials {
                ssid: "tank".to_string(),
                password: "secret".to_string(),
            })
            .unwrap();

        assert_eq!(radio.link_status(), LinkStatus::Connected);
        assert_eq!(radio.ip_address().as_deref(), Some("127.0.0.1"));

        radio.start_scan().unwrap();
        let networks = radio.scan_results().unwrap();
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].ssid, "tank");
    }
}
