use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    config::{BackendConfig, EnvironmentProfile},
    endpoints::TOPIC_PRESENCE_SEGMENT,
    error::TransportError,
    store::{ConfigKey, ConfigStore},
};

pub const MAX_EVENTS_PER_PUMP: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub schema: String,
    pub table: String,
    pub event: String,
    pub filter: String,
}

impl Subscription {
    pub fn for_device(backend: &BackendConfig, device_id: &str) -> Self {
        Self {
            schema: backend.realtime_schema.clone(),
            table: backend.realtime_table.clone(),
            event: backend.realtime_event.clone(),
            filter: format!("id=eq.{device_id}"),
        }
    }

    pub fn topic(&self, prefix: &str) -> String {
        format!(
            "{prefix}/{}/{}/{}/{}",
            self.schema, self.table, self.event, self.filter
        )
    }
}

pub fn presence_topic(prefix: &str, device_id: &str) -> String {
    format!("{prefix}/{TOPIC_PRESENCE_SEGMENT}/{device_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresencePayload {
    pub device_id: String,
    pub name: String,
    pub online_at: String,
}

impl PresencePayload {
    pub fn new(profile: &EnvironmentProfile, device_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            name: profile.name.clone(),
            online_at: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

pub trait RealtimeChannel {
    fn subscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError>;
    fn unsubscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError>;
    fn send_presence(&mut self, device_id: &str, payload: &PresencePayload);
    /// Never blocks. `None` when nothing is queued.
    fn poll_event(&mut self) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeApplied {
    Persisted,
    Skipped,
}

/// Persists the `record` of a change payload as the new environment profile.
///
/// Anything other than a JSON object under `record` leaves the stored profile
/// untouched.
pub fn apply_change(payload: &[u8], store: &mut dyn ConfigStore) -> ChangeApplied {
    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(err) => {
            warn!("discarding unparsable change event: {err}");
            return ChangeApplied::Skipped;
        }
    };

    let Some(record) = value.get("record").filter(|record| record.is_object()) else {
        warn!("discarding change event without a record object");
        return ChangeApplied::Skipped;
    };

    match store.write(ConfigKey::Environment, &record.to_string()) {
        Ok(()) => {
            info!("environment profile replaced by remote change");
            ChangeApplied::Persisted
        }
        Err(err) => {
            warn!("could not persist remote environment change: {err}");
            ChangeApplied::Skipped
        }
    }
}

#[derive(Debug, Default)]
pub struct RealtimeConfigListener {
    active: Option<Subscription>,
    applied: u32,
    skipped: u32,
}

impl RealtimeConfigListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self) -> bool {
        self.active.is_some()
    }

    pub fn applied(&self) -> u32 {
        self.applied
    }

    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    pub fn ensure_subscribed(
        &mut self,
        channel: &mut dyn RealtimeChannel,
        backend: &BackendConfig,
        profile: &EnvironmentProfile,
        now: DateTime<Utc>,
    ) {
        let Some(device_id) = profile.device_id() else {
            self.release(channel);
            return;
        };

        let wanted = Subscription::for_device(backend, device_id);
        if self.active.as_ref() == Some(&wanted) {
            return;
        }

        self.release(channel);
        match channel.subscribe(&wanted) {
            Ok(()) => {
                info!(
                    "listening for changes on {}.{} ({})",
                    wanted.schema, wanted.table, wanted.filter
                );
                let presence = PresencePayload::new(profile, device_id, now);
                channel.send_presence(device_id, &presence);
                self.active = Some(wanted);
            }
            Err(err) => warn!("realtime subscribe failed: {err}"),
        }
    }

    pub fn release(&mut self, channel: &mut dyn RealtimeChannel) {
        if let Some(active) = self.active.take() {
            if let Err(err) = channel.unsubscribe(&active) {
                debug!("realtime unsubscribe failed: {err}");
            }
        }
    }

    /// Drains queued change events into the store. Returns true when at
    /// least one was persisted and a configuration reload is needed.
    pub fn pump(&mut self, channel: &mut dyn RealtimeChannel, store: &mut dyn ConfigStore) -> bool {
        let mut reload = false;
        for _ in 0..MAX_EVENTS_PER_PUMP {
            let Some(payload) = channel.poll_event() else {
                break;
            };
            match apply_change(&payload, store) {
                ChangeApplied::Persisted => {
                    self.applied = self.applied.saturating_add(1);
                    reload = true;
                }
                ChangeApplied::Skipped => self.skipped = self.skipped.saturating_add(1),
            }
        }
        reload
    }
}
