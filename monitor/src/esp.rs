use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{
        AccessPointConfiguration, AccessPointInfo, AuthMethod, ClientConfiguration, Configuration,
    },
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::Ets,
    gpio::{AnyIOPin, Gpio32, Gpio34, Gpio35, IOPin, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    io::EspIOError,
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{config::ScanConfig, EspWifi},
};
use log::{debug, info, warn};
use one_wire_bus::{Address, OneWire};

use aquawatch_common::{
    presence_topic, provisioning, ApiEffect, ApiReply, Clock, ConfigKey, ConfigStore,
    DeviceConfig, Devices, HttpRequest, HttpResponse, HttpTransport, LinkStatus, Monitor,
    MonitorStatus, NetworkCredentials, PresencePayload, RealtimeBridgeConfig, RealtimeChannel,
    ScannedNetwork, SensorSource, StoreError, Subscription, SyncOutcome, TransportError,
    WifiRadio,
};

const NVS_NAMESPACE: &str = "aquawatch";
const NVS_VALUE_LIMIT: usize = 4096;
const MAX_HTTP_BODY: usize = 4096;
const MAX_RESPONSE_BODY: usize = 8192;
const MAX_CHANGE_PAYLOAD_BYTES: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;

const PROVISIONING_AP_SSID: &str = "Aqua Watch";
const PROVISIONING_AP_PASSWORD: &str = "aquawatch";

const DS18B20_PIN: i32 = 4;
const ADC_FULL_SCALE: f32 = 4095.0;
const ADC_SUPPLY_MV: f32 = 3300.0;

const INDEX_HTML: &str = include_str!("../web/index.html");

// Saturated dissolved oxygen (ug/L) for 0..=40 degC.
const DO_SATURATION: [u16; 41] = [
    14460, 14220, 13820, 13440, 13090, 12740, 12420, 12110, 11810, 11530, 11260, 11010, 10770,
    10530, 10300, 10080, 9860, 9660, 9460, 9270, 9080, 8900, 8730, 8570, 8410, 8250, 8110, 7960,
    7820, 7690, 7560, 7430, 7300, 7180, 7070, 6950, 6840, 6730, 6630, 6530, 6410,
];

#[derive(Clone)]
struct SharedState {
    store: NvsStore,
    status: Arc<Mutex<MonitorStatus>>,
    reload: Arc<AtomicBool>,
    reconnect: Arc<AtomicBool>,
    scan: Arc<AtomicBool>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let mut wifi = EspWifi::new(peripherals.modem, sys_loop, Some(nvs_partition))?;
    let access_point = provisioning_access_point()?;
    wifi.set_configuration(&Configuration::Mixed(
        ClientConfiguration::default(),
        access_point.clone(),
    ))?;
    wifi.start().context("failed to start wifi")?;
    info!(
        "provisioning AP `{}` up (password: `{}`)",
        PROVISIONING_AP_SSID, PROVISIONING_AP_PASSWORD
    );
    let radio = EspRadio {
        wifi,
        access_point,
        joining: false,
    };

    let probes = Probes::new(
        pins.gpio4.downgrade(),
        peripherals.adc1,
        pins.gpio35,
        pins.gpio34,
        pins.gpio32,
    )?;

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let device = DeviceConfig::load(&store);
    let (events_tx, events_rx) = mpsc::channel();
    let (realtime, connection) = EspMqttRealtime::new(&device.realtime, events_rx)?;
    spawn_realtime_receiver(realtime.client.clone(), realtime.active.clone(), connection, events_tx);

    let state = SharedState {
        store: store.clone(),
        status: Arc::new(Mutex::new(MonitorStatus::default())),
        reload: Arc::new(AtomicBool::new(false)),
        reconnect: Arc::new(AtomicBool::new(false)),
        scan: Arc::new(AtomicBool::new(false)),
    };

    spawn_controller(state.clone(), store, radio, probes, realtime)?;

    let server = create_http_server(state)?;

    // Keep services alive for the program lifetime.
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn provisioning_access_point() -> anyhow::Result<AccessPointConfiguration> {
    Ok(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: PROVISIONING_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    })
}

fn spawn_controller(
    state: SharedState,
    store: NvsStore,
    radio: EspRadio,
    probes: Probes,
    realtime: EspMqttRealtime,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("controller".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = controller_loop(state, store, radio, probes, realtime) {
                warn!("controller stopped: {err:#}");
            }
        })
        .context("failed to spawn controller thread")?;
    Ok(())
}

fn controller_loop(
    state: SharedState,
    mut store: NvsStore,
    mut radio: EspRadio,
    mut probes: Probes,
    mut realtime: EspMqttRealtime,
) -> anyhow::Result<()> {
    add_current_task_to_watchdog()?;

    let mut monitor = Monitor::new(&store);
    let mut transport = EspTransport {
        timeout: monitor.device_config().http_timeout(),
    };
    let clock = SystemClock::new();

    info!("controller started in {} mode", monitor.mode().as_str());

    loop {
        let started = Instant::now();
        feed_watchdog();

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

        transport.timeout = monitor.device_config().http_timeout();

        if let Ok(mut status) = state.status.lock() {
            *status = monitor.snapshot();
        }

        feed_watchdog();
        let elapsed = started.elapsed();
        thread::sleep(monitor.device_config().tick_interval().saturating_sub(elapsed));
    }
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for path in ["/", "/index.html", "/generate_204", "/hotspot-detect.html"] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    type StoreRoute = fn(&mut dyn ConfigStore) -> ApiReply;
    type StoreWriteRoute = fn(&mut dyn ConfigStore, &[u8]) -> ApiReply;

    let reads: [(&str, StoreRoute); 4] = [
        ("/api/wifi-conf", provisioning::get_network),
        ("/api/user-conf", provisioning::get_account),
        ("/api/environment", provisioning::get_environment),
        ("/api/connect", provisioning::connect),
    ];
    for (path, route) in reads {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            let reply = route(&mut state.store.clone());
            write_reply(&state, req, reply)
        })?;
    }

    let writes: [(&str, StoreWriteRoute); 3] = [
        ("/api/wifi-conf", provisioning::save_network),
        ("/api/user-conf", provisioning::save_account),
        ("/api/environment", provisioning::save_environment),
    ];
    for (path, route) in writes {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let reply = route(&mut state.store.clone(), &body);
            write_reply(&state, req, reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/status", Method::Get, move |req| {
            let reply = provisioning::status(&current_status(&state));
            write_reply(&state, req, reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/scan", Method::Get, move |req| {
            let reply = provisioning::scan(&current_status(&state).networks);
            write_reply(&state, req, reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/telemetry", Method::Get, move |req| {
            let reply = provisioning::telemetry(&current_status(&state));
            write_reply(&state, req, reply)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/restart", Method::Get, move |req| {
        write_reply(&state, req, provisioning::restart())
    })?;

    Ok(server)
}

fn current_status(state: &SharedState) -> MonitorStatus {
    state
        .status
        .lock()
        .map(|status| status.clone())
        .unwrap_or_default()
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_reply(
    state: &SharedState,
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    reply: ApiReply,
) -> anyhow::Result<()> {
    match reply.effect {
        ApiEffect::Reload => state.reload.store(true, Ordering::Release),
        ApiEffect::Reconnect => {
            state.reload.store(true, Ordering::Release);
            state.reconnect.store(true, Ordering::Release);
        }
        ApiEffect::Scan => state.scan.store(true, Ordering::Release),
        ApiEffect::Restart => schedule_restart(),
        ApiEffect::None => {}
    }

    req.into_response(
        reply.status,
        None,
        &[
            ("Content-Type", "application/json; charset=utf-8"),
            ("Access-Control-Allow-Origin", "*"),
        ],
    )?
    .write_all(reply.to_json().as_bytes())?;
    Ok(())
}

fn schedule_restart() {
    let spawned = thread::Builder::new()
        .name("restart-request".into())
        .spawn(|| {
            thread::sleep(Duration::from_millis(500));
            unsafe { esp_idf_svc::sys::esp_restart() };
        });
    if let Err(err) = spawned {
        warn!("failed to spawn restart thread: {err}");
    }
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    fn open(&self, key: ConfigKey) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, StoreError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(|err| StoreError::Io {
            key: key.as_str(),
            message: format!("{err:?}"),
        })
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.lock
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }
}

fn nvs_error(key: ConfigKey, err: esp_idf_svc::sys::EspError) -> StoreError {
    StoreError::Io {
        key: key.as_str(),
        message: format!("{err:?}"),
    }
}

impl ConfigStore for NvsStore {
    fn read(&self, key: ConfigKey) -> Result<Option<String>, StoreError> {
        let _guard = self.guard()?;
        let nvs = self.open(key)?;
        let mut buffer = vec![0_u8; NVS_VALUE_LIMIT];
        let value = nvs
            .get_str(key.as_str(), &mut buffer)
            .map_err(|err| nvs_error(key, err))?;
        Ok(value.map(str::to_string))
    }

    fn write(&mut self, key: ConfigKey, document: &str) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        let mut nvs = self.open(key)?;
        nvs.set_str(key.as_str(), document)
            .map_err(|err| nvs_error(key, err))
    }

    fn delete(&mut self, key: ConfigKey) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        let mut nvs = self.open(key)?;
        nvs.remove(key.as_str())
            .map(|_| ())
            .map_err(|err| nvs_error(key, err))
    }
}

/// Station interface of the radio. The provisioning AP stays up alongside it.
struct EspRadio {
    wifi: EspWifi<'static>,
    access_point: AccessPointConfiguration,
    joining: bool,
}

impl WifiRadio for EspRadio {
    fn begin(&mut self, credentials: &NetworkCredentials) -> Result<(), String> {
        let client = ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| "wifi ssid too long".to_string())?,
            password: credentials
                .password
                .as_str()
                .try_into()
                .map_err(|_| "wifi password too long".to_string())?,
            auth_method: AuthMethod::WPAWPA2Personal,
            ..Default::default()
        };

        if let Err(err) = self.wifi.disconnect() {
            debug!("wifi disconnect before join: {err:?}");
        }
        self.wifi
            .set_configuration(&Configuration::Mixed(client, self.access_point.clone()))
            .map_err(|err| format!("{err:?}"))?;
        if !self.wifi.is_started().map_err(|err| format!("{err:?}"))? {
            self.wifi.start().map_err(|err| format!("{err:?}"))?;
        }
        self.wifi.connect().map_err(|err| format!("{err:?}"))?;
        self.joining = true;
        Ok(())
    }

    fn link_status(&mut self) -> LinkStatus {
        if !self.joining {
            return LinkStatus::Idle;
        }
        match (self.wifi.is_connected(), self.wifi.is_up()) {
            (Ok(true), Ok(true)) => LinkStatus::Connected,
            (Ok(true), _) => LinkStatus::Idle,
            _ => LinkStatus::Disconnected,
        }
    }

    fn ip_address(&mut self) -> Option<String> {
        let info = self.wifi.sta_netif().get_ip_info().ok()?;
        (!info.ip.is_unspecified()).then(|| info.ip.to_string())
    }

    fn start_scan(&mut self) -> Result<(), String> {
        self.wifi
            .start_scan(&ScanConfig::default(), false)
            .map_err(|err| format!("{err:?}"))
    }

    fn scan_results(&mut self) -> Option<Vec<ScannedNetwork>> {
        if !self.wifi.is_scan_done().unwrap_or(false) {
            return None;
        }
        match self.wifi.get_scan_result() {
            Ok(access_points) => Some(access_points.iter().map(scanned_network).collect()),
            Err(err) => {
                warn!("wifi scan results unavailable: {err:?}");
                Some(Vec::new())
            }
        }
    }
}

fn scanned_network(access_point: &AccessPointInfo) -> ScannedNetwork {
    ScannedNetwork {
        ssid: access_point.ssid.to_string(),
        rssi: access_point.signal_strength,
        open: matches!(access_point.auth_method, None | Some(AuthMethod::None)),
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

struct EspTransport {
    timeout: Duration,
}

fn transport_error(err: EspIOError) -> TransportError {
    let code = err.0.code();
    if code == esp_idf_svc::sys::ESP_ERR_TIMEOUT as esp_idf_svc::sys::esp_err_t
        || code == esp_idf_svc::sys::ESP_ERR_HTTP_EAGAIN as esp_idf_svc::sys::esp_err_t
    {
        TransportError::Timeout
    } else {
        TransportError::Io(format!("{err:?}"))
    }
}

impl HttpTransport for EspTransport {
    fn post(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let conf = HttpClientConfiguration {
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&conf)
            .map_err(|err| TransportError::Connect(format!("{err:?}")))?;
        let mut client = HttpClient::wrap(connection);

        let content_length = request.body.len().to_string();
        let mut headers: Vec<(&str, &str)> = request
            .headers
            .iter()
            .map(|(name, value)| (*name, value.as_str()))
            .collect();
        headers.push(("Content-Length", content_length.as_str()));

        let mut outgoing = client
            .request(Method::Post, &request.url, &headers)
            .map_err(transport_error)?;
        outgoing
            .write_all(request.body.as_bytes())
            .map_err(transport_error)?;
        outgoing.flush().map_err(transport_error)?;
        let mut response = outgoing.submit().map_err(transport_error)?;

        let status = response.status();
        let mut body = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            let read = response.read(&mut chunk).map_err(transport_error)?;
            if read == 0 || body.len() >= MAX_RESPONSE_BODY {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }

        Ok(HttpResponse {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

/// Realtime change feed carried over the MQTT bridge.
struct EspMqttRealtime {
    client: Arc<Mutex<EspMqttClient<'static>>>,
    prefix: String,
    active: Arc<Mutex<Option<String>>>,
    events: mpsc::Receiver<Vec<u8>>,
}

impl EspMqttRealtime {
    fn new(
        config: &RealtimeBridgeConfig,
        events: mpsc::Receiver<Vec<u8>>,
    ) -> anyhow::Result<(Self, EspMqttConnection)> {
        let url = format!("mqtt://{}:{}", config.host, config.port);
        let conf = MqttClientConfiguration {
            client_id: Some(config.client_id.as_str()),
            username: (!config.user.is_empty()).then_some(config.user.as_str()),
            password: (!config.pass.is_empty()).then_some(config.pass.as_str()),
            ..Default::default()
        };
        let (client, connection) = EspMqttClient::new(url.as_str(), &conf)?;

        let realtime = Self {
            client: Arc::new(Mutex::new(client)),
            prefix: config.topic_prefix.clone(),
            active: Arc::new(Mutex::new(None)),
            events,
        };
        Ok((realtime, connection))
    }

    fn set_active(&self, topic: Option<String>) {
        if let Ok(mut active) = self.active.lock() {
            *active = topic;
        }
    }

    fn client(&self) -> Result<std::sync::MutexGuard<'_, EspMqttClient<'static>>, TransportError> {
        self.client
            .lock()
            .map_err(|_| TransportError::Io("mqtt client lock poisoned".to_string()))
    }
}

impl RealtimeChannel for EspMqttRealtime {
    fn subscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError> {
        let topic = subscription.topic(&self.prefix);
        self.client()?
            .subscribe(&topic, QoS::AtLeastOnce)
            .map_err(|err| TransportError::Connect(format!("{err:?}")))?;
        self.set_active(Some(topic));
        Ok(())
    }

    fn unsubscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError> {
        self.set_active(None);
        self.client()?
            .unsubscribe(&subscription.topic(&self.prefix))
            .map(|_| ())
            .map_err(|err| TransportError::Connect(format!("{err:?}")))
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
        let published = self
            .client()
            .and_then(|mut client| {
                client
                    .enqueue(&topic, QoS::AtMostOnce, false, &body)
                    .map_err(|err| TransportError::Io(format!("{err:?}")))
            });
        if let Err(err) = published {
            warn!("presence publish failed: {err}");
        }
    }

    fn poll_event(&mut self) -> Option<Vec<u8>> {
        self.events.try_recv().ok()
    }
}

fn spawn_realtime_receiver(
    client: Arc<Mutex<EspMqttClient<'static>>>,
    active: Arc<Mutex<Option<String>>>,
    mut conn: EspMqttConnection,
    events: mpsc::Sender<Vec<u8>>,
) {
    let spawned = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("realtime bridge connected");
                        let topic = active.lock().ok().and_then(|active| active.clone());
                        if let (Some(topic), Ok(mut client)) = (topic, client.lock()) {
                            if let Err(err) = client.subscribe(&topic, QoS::AtLeastOnce) {
                                warn!("realtime resubscribe failed: {err:?}");
                            }
                        }
                    }
                    EventPayload::Received {
                        topic,
                        data,
                        details,
                        ..
                    } => {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_CHANGE_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized change event on {} ({} bytes)",
                                topic.unwrap_or("?"),
                                data.len()
                            );
                            continue;
                        }
                        if events.send(data.to_vec()).is_err() {
                            warn!("controller gone, stopping realtime bridge");
                            return;
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    warn!("realtime bridge receive error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        });
    if let Err(err) = spawned {
        warn!("failed to spawn realtime receiver: {err}");
    }
}

type AdcPin<P> = AdcChannelDriver<'static, P, Arc<AdcDriver<'static, ADC1>>>;

/// DS18B20 water temperature plus the three analog probes on ADC1.
struct Probes {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    ds18_address: Option<Address>,
    delay: Ets,
    last_temperature: f32,
    ph: AdcPin<Gpio35>,
    turbidity: AdcPin<Gpio34>,
    oxygen: AdcPin<Gpio32>,
}

impl Probes {
    fn new(
        ds18_pin: AnyIOPin,
        adc: ADC1,
        ph_pin: Gpio35,
        turbidity_pin: Gpio34,
        oxygen_pin: Gpio32,
    ) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(ds18_pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;
        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let adc = Arc::new(AdcDriver::new(adc)?);
        let channel = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };

        let mut probes = Self {
            one_wire,
            ds18_address: None,
            delay: Ets,
            last_temperature: 25.0,
            ph: AdcChannelDriver::new(adc.clone(), ph_pin, &channel)?,
            turbidity: AdcChannelDriver::new(adc.clone(), turbidity_pin, &channel)?,
            oxygen: AdcChannelDriver::new(adc, oxygen_pin, &channel)?,
        };
        probes.refresh_ds18_address();
        Ok(probes)
    }

    fn refresh_ds18_address(&mut self) {
        self.ds18_address = None;
        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) if address.family_code() == ds18b20::FAMILY_CODE => {
                    self.ds18_address = Some(address);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        match self.ds18_address {
            Some(address) => info!("DS18B20 ready on GPIO{DS18B20_PIN} ({address:?})"),
            None => warn!("no DS18B20 found on GPIO{DS18B20_PIN}"),
        }
    }

    fn read_celsius(&mut self) -> Option<f32> {
        if self.ds18_address.is_none() {
            self.refresh_ds18_address();
        }

        let address = self.ds18_address?;
        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {address:?}: {err:?}");
                self.ds18_address = None;
                return None;
            }
        };

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            self.ds18_address = None;
            return None;
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => Some(data.temperature),
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                self.ds18_address = None;
                None
            }
        }
    }
}

fn read_raw<P>(channel: &mut AdcPin<P>, probe: &str) -> u16
where
    P: esp_idf_hal::gpio::ADCPin<Adc = ADC1>,
{
    channel.read_raw().unwrap_or_else(|err| {
        warn!("{probe} probe read failed: {err:?}");
        0
    })
}

fn millivolts(raw: u16) -> f32 {
    f32::from(raw) * ADC_SUPPLY_MV / ADC_FULL_SCALE
}

/// Two-point calibration with neutral at 1500 mV and pH 4 at 2032.44 mV.
fn ph_from_millivolts(mv: f32) -> f32 {
    7.0 + (1500.0 - mv) / 177.48
}

fn turbidity_from_raw(raw: u16) -> f32 {
    (f32::from(raw) * 100.0 / 2450.0).clamp(0.0, 100.0)
}

fn dissolved_oxygen_from_raw(raw: u16, temperature_c: f32) -> f32 {
    let index = temperature_c.round().clamp(0.0, 40.0) as usize;
    let probe_mv = 5000.0 * f32::from(raw) / ADC_FULL_SCALE;
    let saturation_mv = 1500.0 + 35.0 * index as f32 - 21.0 * 35.0;
    probe_mv * f32::from(DO_SATURATION[index]) / saturation_mv / 1000.0
}

impl SensorSource for Probes {
    fn temperature(&mut self) -> f32 {
        if let Some(celsius) = self.read_celsius() {
            self.last_temperature = celsius;
        }
        self.last_temperature
    }

    fn ph(&mut self) -> f32 {
        ph_from_millivolts(millivolts(read_raw(&mut self.ph, "pH")))
    }

    fn turbidity(&mut self) -> f32 {
        turbidity_from_raw(read_raw(&mut self.turbidity, "turbidity"))
    }

    fn dissolved_oxygen(&mut self) -> f32 {
        dissolved_oxygen_from_raw(read_raw(&mut self.oxygen, "oxygen"), self.last_temperature)
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}
