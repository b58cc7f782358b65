// ── Cloud ──
//
// One configured cloud: its persisted record, dirty set, REST client and
// MQTT session slot. `set_paused` starts and stops the two sync loops.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use indexmap::IndexSet;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wazigate_api::{CloudClient, TransportConfig};
use wazigate_mqtt::{Client, Message, QoS, Queue};

use super::dirty::{DirtySet, Flag, Transition};
use super::entity::{Entity, Status};
use super::{mqtt_sync, rest_sync};
use crate::bridge::{Downstream, Handler};
use crate::error::CoreError;
use crate::model::{EntityKind, Meta};
use crate::store::Store;

/// Default push interval when neither the entity nor the config sets one.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

// ── Persisted record ─────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default = "empty_token", with = "secret")]
    pub token: SecretString,
}

fn empty_token() -> SecretString {
    SecretString::from(String::new())
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: String::new(),
            token: empty_token(),
        }
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self {
            username: self.username.clone(),
            token: SecretString::from(self.token.expose_secret().to_owned()),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

mod secret {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(token: &SecretString, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(token.expose_secret())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SecretString, D::Error> {
        String::deserialize(d).map(SecretString::from)
    }
}

/// A cloud as stored in `clouds.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub paused: bool,
    pub rest: String,
    #[serde(default)]
    pub mqtt: String,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub registered: bool,
}

impl CloudConfig {
    pub fn new(id: impl Into<String>, rest: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            paused: true,
            rest: rest.into(),
            mqtt: String::new(),
            credentials: Credentials::default(),
            status_code: 0,
            status_text: String::new(),
            registered: false,
        }
    }
}

// ── Shared context ───────────────────────────────────────────────────

/// Collaborators every cloud of a gateway shares.
pub struct CloudContext {
    pub local_id: String,
    pub store: Arc<dyn Store>,
    pub downstream: Arc<dyn Downstream>,
    pub session_dir: PathBuf,
    pub transport: TransportConfig,
    pub default_interval: Duration,
    pub read_timeout: Option<Duration>,
    handler: OnceLock<Weak<dyn Handler>>,
    config_changed: Notify,
}

impl CloudContext {
    pub fn new(
        local_id: impl Into<String>,
        store: Arc<dyn Store>,
        downstream: Arc<dyn Downstream>,
        session_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            store,
            downstream,
            session_dir: session_dir.into(),
            transport: TransportConfig::default(),
            default_interval: DEFAULT_SYNC_INTERVAL,
            read_timeout: None,
            handler: OnceLock::new(),
            config_changed: Notify::new(),
        }
    }

    /// Handler serving tunnelled requests. Only the first call has effect.
    pub fn set_handler(&self, handler: &Arc<dyn Handler>) {
        if self.handler.set(Arc::downgrade(handler)).is_err() {
            warn!("tunnel handler already installed; ignoring");
        }
    }

    pub fn handler(&self) -> Option<Arc<dyn Handler>> {
        self.handler.get().and_then(Weak::upgrade)
    }

    pub(crate) fn config_changed(&self) {
        self.config_changed.notify_one();
    }

    pub(crate) async fn wait_config_changed(&self) {
        self.config_changed.notified().await;
    }
}

// ── Cloud ────────────────────────────────────────────────────────────

struct CloudState {
    config: CloudConfig,
    pausing: bool,
    generation: u64,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct CloudInner {
    ctx: Arc<CloudContext>,
    state: Mutex<CloudState>,
    dirty: DirtySet,
    devices: Mutex<IndexSet<String>>,
    api: ArcSwapOption<CloudClient>,
    mqtt: ArcSwapOption<Client>,
    queue: OnceCell<Arc<Queue>>,
}

/// Cheaply cloneable handle to one cloud.
#[derive(Clone)]
pub struct Cloud {
    inner: Arc<CloudInner>,
}

/// Serializable view of a cloud for listings and the status API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudSnapshot {
    #[serde(flatten)]
    pub config: CloudConfig,
    pub pausing: bool,
    pub dirty: usize,
}

impl Cloud {
    pub fn new(ctx: Arc<CloudContext>, config: CloudConfig) -> Self {
        Self {
            inner: Arc::new(CloudInner {
                ctx,
                state: Mutex::new(CloudState {
                    config,
                    pausing: false,
                    generation: 0,
                    cancel: CancellationToken::new(),
                    tasks: Vec::new(),
                }),
                dirty: DirtySet::new(),
                devices: Mutex::new(IndexSet::new()),
                api: ArcSwapOption::empty(),
                mqtt: ArcSwapOption::empty(),
                queue: OnceCell::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn devices(&self) -> MutexGuard<'_, IndexSet<String>> {
        self.inner.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn id(&self) -> String {
        self.state().config.id.clone()
    }

    pub fn config(&self) -> CloudConfig {
        self.state().config.clone()
    }

    pub fn snapshot(&self) -> CloudSnapshot {
        let state = self.state();
        CloudSnapshot {
            config: state.config.clone(),
            pausing: state.pausing,
            dirty: self.inner.dirty.len(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state().config.paused
    }

    pub fn is_pausing(&self) -> bool {
        self.state().pausing
    }

    pub fn context(&self) -> &Arc<CloudContext> {
        &self.inner.ctx
    }

    pub fn dirty(&self) -> &DirtySet {
        &self.inner.dirty
    }

    /// Devices whose actuators the MQTT session follows.
    pub fn tracked_devices(&self) -> Vec<String> {
        self.devices().iter().cloned().collect()
    }

    pub(crate) fn clear_devices(&self) {
        self.devices().clear();
    }

    /// REST client for the current address, built on first use.
    pub fn api(&self) -> Result<Arc<CloudClient>, CoreError> {
        if let Some(api) = self.inner.api.load_full() {
            return Ok(api);
        }
        let rest = self.state().config.rest.clone();
        let api = Arc::new(CloudClient::new(&rest, &self.inner.ctx.transport)?);
        self.inner.api.store(Some(Arc::clone(&api)));
        Ok(api)
    }

    /// `host:port` of the cloud broker.
    pub fn mqtt_addr(&self) -> Result<String, CoreError> {
        let state = self.state();
        Ok(wazigate_api::mqtt_addr(
            &state.config.rest,
            Some(state.config.mqtt.as_str()),
        )?)
    }

    pub fn credentials(&self) -> Credentials {
        self.state().config.credentials.clone()
    }

    /// Outbound MQTT queue, spooled under the session directory.
    pub(crate) async fn queue(&self) -> Result<Arc<Queue>, CoreError> {
        let id = self.id();
        let dir = self.inner.ctx.session_dir.clone();
        let queue = self
            .inner
            .queue
            .get_or_try_init(|| async move { Queue::open(dir, id).await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(queue))
    }

    pub(crate) fn set_mqtt_client(&self, client: Option<Client>) {
        self.inner.mqtt.store(client.map(Arc::new));
    }

    /// Whether an MQTT session to the cloud is currently attached.
    pub fn has_mqtt_client(&self) -> bool {
        self.inner.mqtt.load().is_some()
    }

    // ── Status ───────────────────────────────────────────────────────

    /// Record the outcome of the last cloud request.
    pub fn set_status(&self, code: u16, text: impl Into<String>) {
        let text = text.into();
        {
            let mut state = self.state();
            if state.config.status_code == code && state.config.status_text == text {
                return;
            }
            info!(cloud = %state.config.id, code, text = %text, "cloud status");
            state.config.status_code = code;
            state.config.status_text = text;
        }
        self.inner.ctx.config_changed();
    }

    /// Record a failed request; errors without an answer are not recorded.
    pub(crate) fn record_error(&self, err: &CoreError) {
        if let Some(code) = err.upstream_status() {
            self.set_status(code, err.to_string());
        }
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        let changed = {
            let mut state = self.state();
            let changed = state.config.registered != registered;
            state.config.registered = registered;
            changed
        };
        if changed {
            self.inner.ctx.config_changed();
        }
    }

    // ── Flagging ─────────────────────────────────────────────────────

    /// Mutate the dirty entry of `entity`. Entities whose meta says
    /// `doNotSync` are never added.
    pub fn flag(&self, entity: Entity, flag: Flag, meta: Option<&Meta>) {
        if matches!(flag, Flag::Set { .. }) && meta.is_some_and(Meta::do_not_sync) {
            return;
        }
        let sleep = match entity.kind() {
            Some((EntityKind::Sensor, _)) => meta
                .and_then(Meta::sync_interval)
                .unwrap_or(self.inner.ctx.default_interval),
            _ => Duration::ZERO,
        };
        let topic_entity = entity.clone();
        match self.inner.dirty.flag(entity, flag, sleep) {
            Transition::Unchanged => {}
            Transition::Updated(status) => self.publish_status(&topic_entity, Some(&status)),
            Transition::Removed => self.publish_status(&topic_entity, None),
        }
    }

    fn publish_status(&self, entity: &Entity, status: Option<&Status>) {
        #[derive(Serialize)]
        struct StatusEvent<'a> {
            entity: &'a Entity,
            status: Option<&'a Status>,
        }

        let id = self.id();
        match serde_json::to_vec(&StatusEvent { entity, status }) {
            Ok(payload) => {
                let msg = Message::new(format!("clouds/{id}/status"), payload);
                self.inner.ctx.downstream.publish(&msg);
            }
            Err(e) => debug!(cloud = %id, error = %e, "status event not encoded"),
        }
    }

    /// Follow a device's actuators on the MQTT session.
    pub async fn include_device(&self, device: &str) {
        if !self.devices().insert(device.to_owned()) {
            return;
        }
        let Some(client) = self.inner.mqtt.load_full() else {
            return;
        };
        if let Err(e) = client.subscribe(&actuator_filter(device), QoS::AtLeastOnce).await {
            warn!(cloud = %self.id(), device, error = %e, "actuator subscribe failed");
        }
    }

    // ── Authentication ───────────────────────────────────────────────

    /// Exchange the stored credentials for a token.
    pub async fn authenticate(&self) -> Result<(), CoreError> {
        let api = self.api()?;
        let creds = self.credentials();
        match api.authenticate(&creds.username, &creds.token).await {
            Ok(()) => {
                debug!(cloud = %self.id(), "authenticated");
                Ok(())
            }
            Err(e) => {
                let err = CoreError::from(e);
                self.record_error(&err);
                Err(err)
            }
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Pause or resume synchronization and return an HTTP-style code.
    ///
    /// Resuming authenticates first: rejected credentials keep the cloud
    /// paused, an unreachable cloud resumes anyway with `202`.
    pub async fn set_paused(&self, paused: bool) -> Result<u16, CoreError> {
        {
            let state = self.state();
            if state.pausing {
                return Err(CoreError::Locked {
                    message: "the cloud is pausing".into(),
                });
            }
            if state.config.paused == paused {
                return Ok(200);
            }
        }
        if paused { self.pause().await } else { self.resume().await }
    }

    async fn pause(&self) -> Result<u16, CoreError> {
        self.state().config.paused = true;
        info!(cloud = %self.id(), "pausing");
        self.halt().await;
        self.inner.ctx.config_changed();
        Ok(200)
    }

    /// Stop the sync loops without touching the persisted pause flag.
    pub async fn stop(&self) {
        self.halt().await;
    }

    async fn halt(&self) {
        let tasks = {
            let mut state = self.state();
            state.pausing = true;
            state.cancel.cancel();
            std::mem::take(&mut state.tasks)
        };
        if let Some(client) = self.inner.mqtt.swap(None) {
            client.disconnect().await;
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!(cloud = %self.id(), error = %e, "sync task ended abnormally");
            }
        }
        self.state().pausing = false;
    }

    async fn resume(&self) -> Result<u16, CoreError> {
        let code = match self.authenticate().await {
            Ok(()) => 200,
            Err(e) if e.is_network() => {
                warn!(cloud = %self.id(), error = %e, "cloud unreachable, resuming anyway");
                202
            }
            Err(e) => return Err(e),
        };
        self.state().config.paused = false;
        self.inner.ctx.config_changed();
        self.spawn();
        Ok(code)
    }

    /// Start the sync loops if the cloud is not paused.
    pub(crate) fn start(&self) {
        if !self.is_paused() {
            self.spawn();
        }
    }

    fn spawn(&self) {
        let mut state = self.state();
        state.generation += 1;
        state.cancel = CancellationToken::new();
        let cancel = state.cancel.clone();
        info!(cloud = %state.config.id, generation = state.generation, "starting sync");
        state
            .tasks
            .push(tokio::spawn(rest_sync::run(self.clone(), cancel)));
    }

    /// Start the MQTT session loop under the current run.
    pub(crate) fn spawn_mqtt(&self, cancel: &CancellationToken) {
        let mut state = self.state();
        if cancel.is_cancelled() {
            return;
        }
        state
            .tasks
            .push(tokio::spawn(mqtt_sync::run(self.clone(), cancel.clone())));
    }

    // ── Configuration ────────────────────────────────────────────────

    fn require_paused(&self) -> Result<MutexGuard<'_, CloudState>, CoreError> {
        let state = self.state();
        if state.pausing || !state.config.paused {
            return Err(CoreError::Locked {
                message: "the cloud must be paused".into(),
            });
        }
        Ok(state)
    }

    /// Replace the credentials after checking them with the cloud.
    ///
    /// Returns `202` when the cloud could not be reached; the credentials
    /// are stored regardless.
    pub async fn set_credentials(
        &self,
        username: impl Into<String>,
        token: SecretString,
    ) -> Result<u16, CoreError> {
        drop(self.require_paused()?);
        let username = username.into();
        let code = match self.api()?.request_token(&username, &token).await {
            Ok(_) => 200,
            Err(e) => {
                let err = CoreError::from(e);
                if !err.is_network() {
                    self.record_error(&err);
                    return Err(err);
                }
                202
            }
        };
        {
            let mut state = self.require_paused()?;
            state.config.credentials = Credentials { username, token };
        }
        self.inner.ctx.config_changed();
        Ok(code)
    }

    pub fn set_rest_addr(&self, addr: &str) -> Result<(), CoreError> {
        let rest = wazigate_api::rest_addr(addr)?;
        {
            let mut state = self.require_paused()?;
            state.config.rest = rest;
            state.config.registered = false;
        }
        self.inner.api.store(None);
        self.inner.ctx.config_changed();
        Ok(())
    }

    pub fn set_mqtt_addr(&self, addr: &str) -> Result<(), CoreError> {
        let mqtt = addr.trim().to_owned();
        if !mqtt.is_empty() {
            let rest = self.state().config.rest.clone();
            wazigate_api::mqtt_addr(&rest, Some(&mqtt))?;
        }
        self.require_paused()?.config.mqtt = mqtt;
        self.inner.ctx.config_changed();
        Ok(())
    }
}

/// Subscription filter for a device's actuator values on the cloud.
pub(crate) fn actuator_filter(device: &str) -> String {
    format!("devices/{device}/actuators/+/values")
}
