pub mod backend;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod endpoints;
pub mod error;
pub mod monitor;
pub mod provisioning;
pub mod realtime;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod types;

pub use backend::{HttpRequest, HttpResponse, HttpTransport};
pub use clock::{is_time_set, Clock};
pub use config::{
    AccountCredentials, BackendConfig, ClockConfig, ConfigSet, DeviceConfig, EnvironmentProfile,
    NetworkCredentials, RealtimeBridgeConfig, RetryPolicy,
};
pub use connectivity::{
    ConnectivityManager, ConnectivityStatus, LinkStatus, NetworkScan, ScannedNetwork, WifiRadio,
};
pub use error::{AuthError, MonitorError, StoreError, TransportError};
pub use monitor::{Devices, Monitor, TickReport};
pub use provisioning::{ApiEffect, ApiMessage, ApiReply};
pub use realtime::{presence_topic, PresencePayload, RealtimeChannel, Subscription};
pub use session::SessionManager;
pub use store::{ConfigKey, ConfigStore, MemoryStore};
pub use telemetry::{SensorSource, SyncOutcome, SyncWindowState, TelemetrySample};
pub use types::{MonitorStatus, OperatingMode};
