//! Local provisioning API, independent of the HTTP server that hosts it.
//!
//! Handlers work on the configuration store only. Anything that must reach
//! the running monitor is returned as an [`ApiEffect`] for the caller to
//! forward to the next tick.

use log::{info, warn};
use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    config::{AccountCredentials, EnvironmentProfile, NetworkCredentials},
    connectivity::ScannedNetwork,
    store::{ConfigKey, ConfigStore},
    types::MonitorStatus,
};

pub const MSG_BODY_REQUIRED: &str = "Body is required.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiEffect {
    None,
    Reload,
    Reconnect,
    Restart,
    Scan,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiMessage {
    pub message: String,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiReply {
    pub status: u16,
    pub body: ApiMessage,
    pub effect: ApiEffect,
}

impl ApiReply {
    fn new(status: u16, message: &str, data: Option<Value>) -> Self {
        Self {
            status,
            body: ApiMessage {
                message: message.to_string(),
                data,
            },
            effect: ApiEffect::None,
        }
    }

    fn with_effect(mut self, effect: ApiEffect) -> Self {
        self.effect = effect;
        self
    }

    pub fn to_json(&self) -> String {
        json!({ "message": self.body.message, "data": self.body.data }).to_string()
    }
}

struct DocumentRoute {
    key: ConfigKey,
    missing_status: u16,
    missing: &'static str,
    unreadable: &'static str,
    fetched: &'static str,
    required: &'static str,
    saved: &'static str,
    save_failed: &'static str,
    effect: ApiEffect,
}

const NETWORK_ROUTE: DocumentRoute = DocumentRoute {
    key: ConfigKey::Network,
    missing_status: 200,
    missing: "No WiFi configuration saved.",
    unreadable: "Failed to read WiFi configuration.",
    fetched: "Wifi conf. fetched successfully",
    required: "SSID and Password are required.",
    saved: "WiFi configuration has been saved.",
    save_failed: "Failed to save WiFi configuration.",
    effect: ApiEffect::Reconnect,
};

const ACCOUNT_ROUTE: DocumentRoute = DocumentRoute {
    key: ConfigKey::Account,
    missing_status: 400,
    missing: "No user configuration saved.",
    unreadable: "Failed to read user configuration.",
    fetched: "User conf. fetched successfully",
    required: "Email and Password are required.",
    saved: "User configuration has been saved.",
    save_failed: "Failed to save user configuration.",
    effect: ApiEffect::Reload,
};

const ENVIRONMENT_ROUTE: DocumentRoute = DocumentRoute {
    key: ConfigKey::Environment,
    missing_status: 400,
    missing: "No environment saved.",
    unreadable: "Failed to read environment.",
    fetched: "Environment fetched successfully",
    required: "ID, Name and Monitoring flag are required.",
    saved: "Environment has been saved.",
    save_failed: "Failed to save environment.",
    effect: ApiEffect::Reload,
};

fn non_empty_str<'a>(object: &'a Value, field: &str) -> Option<&'a str> {
    object
        .get(field)
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
}

pub fn validate_network(body: &Value) -> Option<NetworkCredentials> {
    let credentials = NetworkCredentials {
        ssid: non_empty_str(body, "ssid")?.to_string(),
        password: non_empty_str(body, "password")?.to_string(),
    };
    credentials.is_complete().then_some(credentials)
}

pub fn validate_account(body: &Value) -> Option<AccountCredentials> {
    let credentials = AccountCredentials {
        email: non_empty_str(body, "email")?.to_string(),
        password: non_empty_str(body, "password")?.to_string(),
    };
    credentials.is_complete().then_some(credentials)
}

pub fn validate_environment(body: &Value) -> Option<EnvironmentProfile> {
    let id = match body.get("id")? {
        Value::String(id) if !id.trim().is_empty() => id.trim().to_string(),
        Value::Number(id) => id.to_string(),
        _ => return None,
    };
    let name = non_empty_str(body, "name")?.to_string();
    let enable_monitoring = body
        .get("enable_monitoring")
        .or_else(|| body.get("enableMonitoring"))
        .and_then(Value::as_bool)?;

    Some(EnvironmentProfile {
        id,
        name,
        enable_monitoring,
    })
}

fn network_view(value: &Value) -> Value {
    json!({
        "ssid": value.get("ssid").and_then(Value::as_str).unwrap_or_default(),
        "passwordSet": non_empty_str(value, "password").is_some(),
    })
}

fn account_view(value: &Value) -> Value {
    json!({
        "email": value.get("email").and_then(Value::as_str).unwrap_or_default(),
        "passwordSet": non_empty_str(value, "password").is_some(),
    })
}

fn environment_view(value: &Value) -> Value {
    let id = match value.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => String::new(),
    };
    json!({
        "id": id,
        "name": value.get("name").and_then(Value::as_str).unwrap_or_default(),
        "enable_monitoring": value
            .get("enable_monitoring")
            .or_else(|| value.get("enableMonitoring"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn get_document(
    store: &mut dyn ConfigStore,
    route: &DocumentRoute,
    view: fn(&Value) -> Value,
) -> ApiReply {
    let raw = match store.read(route.key) {
        Ok(Some(raw)) if !raw.trim().is_empty() => raw,
        Ok(_) => return ApiReply::new(route.missing_status, route.missing, None),
        Err(err) => {
            warn!("reading {} failed: {err}", route.key.as_str());
            return ApiReply::new(500, route.unreadable, None);
        }
    };

    match serde_json::from_str::<Value>(&raw) {
        Ok(value) if value.is_object() => ApiReply::new(200, route.fetched, Some(view(&value))),
        _ => {
            warn!("stored {} document is corrupt, removing it", route.key.as_str());
            if let Err(err) = store.delete(route.key) {
                warn!("removing {} failed: {err}", route.key.as_str());
            }
            ApiReply::new(400, route.unreadable, None)
        }
    }
}

fn save_document<T: Serialize>(
    store: &mut dyn ConfigStore,
    route: &DocumentRoute,
    body: &[u8],
    validate: fn(&Value) -> Option<T>,
) -> ApiReply {
    if body.iter().all(u8::is_ascii_whitespace) {
        return ApiReply::new(400, MSG_BODY_REQUIRED, None);
    }

    let Some(document) = serde_json::from_slice::<Value>(body)
        .ok()
        .as_ref()
        .and_then(validate)
    else {
        return ApiReply::new(400, route.required, None);
    };

    let written = serde_json::to_string(&document)
        .map_err(|err| err.to_string())
        .and_then(|raw| store.write(route.key, &raw).map_err(|err| err.to_string()));

    match written {
        Ok(()) => {
            info!("{} document saved", route.key.as_str());
            ApiReply::new(200, route.saved, None).with_effect(route.effect)
        }
        Err(err) => {
            warn!("saving {} failed: {err}", route.key.as_str());
            ApiReply::new(500, route.save_failed, None)
        }
    }
}

pub fn get_network(store: &mut dyn ConfigStore) -> ApiReply {
    get_document(store, &NETWORK_ROUTE, network_view)
}

pub fn save_network(store: &mut dyn ConfigStore, body: &[u8]) -> ApiReply {
    save_document(store, &NETWORK_ROUTE, body, validate_network)
}

pub fn get_account(store: &mut dyn ConfigStore) -> ApiReply {
    get_document(store, &ACCOUNT_ROUTE, account_view)
}

pub fn save_account(store: &mut dyn ConfigStore, body: &[u8]) -> ApiReply {
    save_document(store, &ACCOUNT_ROUTE, body, validate_account)
}

pub fn get_environment(store: &mut dyn ConfigStore) -> ApiReply {
    get_document(store, &ENVIRONMENT_ROUTE, environment_view)
}

pub fn save_environment(store: &mut dyn ConfigStore, body: &[u8]) -> ApiReply {
    save_document(store, &ENVIRONMENT_ROUTE, body, validate_environment)
}

pub fn connect(store: &mut dyn ConfigStore) -> ApiReply {
    let reply = get_network(store);
    if reply.status != 200 || reply.body.data.is_none() {
        let status = if reply.status == 200 { 400 } else { reply.status };
        return ApiReply::new(status, &reply.body.message, None);
    }
    ApiReply::new(200, "Connecting...", None).with_effect(ApiEffect::Reconnect)
}

pub fn restart() -> ApiReply {
    ApiReply::new(200, "Restarting...", None).with_effect(ApiEffect::Restart)
}

pub fn status(snapshot: &MonitorStatus) -> ApiReply {
    let data = serde_json::to_value(snapshot).ok();
    ApiReply::new(200, snapshot.link_status, data)
}

/// Serves the last finished scan and asks the monitor for a fresh one.
/// Entries are numbered from 1 in the order the radio reported them.
pub fn scan(networks: &[ScannedNetwork]) -> ApiReply {
    let entries: Vec<Value> = networks
        .iter()
        .enumerate()
        .map(|(index, network)| {
            json!({
                "ssid": network.ssid,
                "rssi": network.rssi,
                "id": index + 1,
                "isOpen": if network.open { "open" } else { "closed" },
            })
        })
        .collect();
    let message = if entries.is_empty() {
        "Scanning..."
    } else {
        "Scan completed"
    };
    ApiReply::new(200, message, Some(Value::Array(entries))).with_effect(ApiEffect::Scan)
}

pub fn telemetry(snapshot: &MonitorStatus) -> ApiReply {
    match snapshot.sample.as_ref().and_then(|sample| serde_json::to_value(sample).ok()) {
        Some(sample) => ApiReply::new(200, "Latest sample", Some(sample)),
        None => ApiReply::new(200, "No sample yet.", None),
    }
}
