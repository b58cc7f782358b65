// ── Clouds registry ──
//
// All configured clouds, persisted to `clouds.json` as a map of cloud id
// to cloud record. Registry-wide flag calls fan out to every cloud.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use indexmap::IndexMap;
use secrecy::SecretString;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cloud::{Cloud, CloudConfig, CloudContext, CloudSnapshot};
use super::dirty::Flag;
use super::entity::{Action, Entity};
use crate::error::CoreError;
use crate::model::{Device, EntityKind, Meta};

/// Id of the cloud registered on first start.
pub const DEFAULT_CLOUD_ID: &str = "waziup";
/// REST address of the default cloud.
pub const DEFAULT_CLOUD_REST: &str = "//api.waziup.io/api/v2";

struct CloudsInner {
    ctx: Arc<CloudContext>,
    clouds: RwLock<IndexMap<String, Cloud>>,
    path: PathBuf,
    save_lock: tokio::sync::Mutex<()>,
}

/// Cheaply cloneable handle to the clouds of a gateway.
#[derive(Clone)]
pub struct Clouds {
    inner: Arc<CloudsInner>,
}

impl Clouds {
    /// Empty registry persisting to `path`.
    pub fn new(ctx: Arc<CloudContext>, path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(CloudsInner {
                ctx,
                clouds: RwLock::new(IndexMap::new()),
                path: path.into(),
                save_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Read `path`. A missing file yields the default cloud, paused, and
    /// is written back. Call [`start`](Self::start) to run the clouds.
    pub async fn load(ctx: Arc<CloudContext>, path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let registry = Self::new(ctx, path);
        let configs = match tokio::fs::read_to_string(registry.path()).await {
            Ok(raw) => parse_configs(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %registry.path().display(), "no clouds file, registering default cloud");
                let rest = wazigate_api::rest_addr(DEFAULT_CLOUD_REST)?;
                let mut defaults = IndexMap::new();
                defaults.insert(
                    DEFAULT_CLOUD_ID.to_owned(),
                    CloudConfig::new(DEFAULT_CLOUD_ID, rest),
                );
                defaults
            }
            Err(e) => return Err(e.into()),
        };

        {
            let mut clouds = registry.clouds_mut();
            for (id, config) in configs {
                let cloud = Cloud::new(Arc::clone(&registry.inner.ctx), config);
                clouds.insert(id, cloud);
            }
        }
        registry.save().await?;
        Ok(registry)
    }

    /// Start every cloud that is not paused.
    pub fn start(&self) {
        for cloud in self.list() {
            cloud.start();
        }
    }

    fn clouds(&self) -> RwLockReadGuard<'_, IndexMap<String, Cloud>> {
        self.inner.clouds.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn clouds_mut(&self) -> RwLockWriteGuard<'_, IndexMap<String, Cloud>> {
        self.inner.clouds.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn context(&self) -> &Arc<CloudContext> {
        &self.inner.ctx
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Result<Cloud, CoreError> {
        self.clouds()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::CloudNotFound { id: id.to_owned() })
    }

    pub fn list(&self) -> Vec<Cloud> {
        self.clouds().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clouds().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clouds().is_empty()
    }

    pub fn snapshot(&self) -> IndexMap<String, CloudSnapshot> {
        self.clouds()
            .iter()
            .map(|(id, cloud)| (id.clone(), cloud.snapshot()))
            .collect()
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Register a new cloud and start it unless it is paused.
    pub async fn add(&self, mut config: CloudConfig) -> Result<Cloud, CoreError> {
        if config.id.trim().is_empty() {
            return Err(CoreError::validation("cloud id must not be empty"));
        }
        config.rest = wazigate_api::rest_addr(&config.rest)?;
        let cloud = {
            let mut clouds = self.clouds_mut();
            if clouds.contains_key(&config.id) {
                return Err(CoreError::CloudExists { id: config.id });
            }
            let cloud = Cloud::new(Arc::clone(&self.inner.ctx), config.clone());
            clouds.insert(config.id.clone(), cloud.clone());
            cloud
        };
        info!(cloud = %config.id, rest = %config.rest, "cloud added");
        self.save().await?;
        cloud.start();
        Ok(cloud)
    }

    /// Stop and forget a cloud.
    pub async fn remove(&self, id: &str) -> Result<(), CoreError> {
        let cloud = self.get(id)?;
        cloud.set_paused(true).await?;
        self.clouds_mut().shift_remove(id);
        info!(cloud = id, "cloud removed");
        self.save().await
    }

    pub async fn set_paused(&self, id: &str, paused: bool) -> Result<u16, CoreError> {
        let code = self.get(id)?.set_paused(paused).await?;
        self.save().await?;
        Ok(code)
    }

    pub async fn set_credentials(
        &self,
        id: &str,
        username: &str,
        token: SecretString,
    ) -> Result<u16, CoreError> {
        let code = self.get(id)?.set_credentials(username, token).await?;
        self.save().await?;
        Ok(code)
    }

    pub async fn set_rest_addr(&self, id: &str, addr: &str) -> Result<(), CoreError> {
        self.get(id)?.set_rest_addr(addr)?;
        self.save().await
    }

    pub async fn set_mqtt_addr(&self, id: &str, addr: &str) -> Result<(), CoreError> {
        self.get(id)?.set_mqtt_addr(addr)?;
        self.save().await
    }

    /// Stop every cloud's sync loops; the persisted pause flags stay.
    pub async fn stop_all(&self) {
        for cloud in self.list() {
            cloud.stop().await;
        }
    }

    // ── Flag fan-out ─────────────────────────────────────────────────

    async fn device(&self, id: &str) -> Option<Device> {
        match self.inner.ctx.store.get_device(id).await {
            Ok(device) => Some(device),
            Err(e) => {
                debug!(device = id, error = %e, "not flagging");
                None
            }
        }
    }

    fn flag_all(&self, entity: &Entity, action: Action, meta: &Meta) {
        for cloud in self.list() {
            cloud.flag(entity.clone(), Flag::set(action), Some(meta));
        }
    }

    /// Flag a device on every cloud, e.g. `create` or `modify`.
    pub async fn flag_device(&self, device: &str, action: Action) {
        if let Some(doc) = self.device(device).await {
            self.flag_all(&Entity::device(device), action, &doc.meta);
        }
    }

    pub async fn flag_sensor(&self, device: &str, sensor: &str, action: Action) {
        self.flag_child(device, EntityKind::Sensor, sensor, action).await;
    }

    pub async fn flag_actuator(&self, device: &str, actuator: &str, action: Action) {
        self.flag_child(device, EntityKind::Actuator, actuator, action).await;
    }

    async fn flag_child(&self, device: &str, kind: EntityKind, id: &str, action: Action) {
        let Some(doc) = self.device(device).await else {
            return;
        };
        if doc.meta.do_not_sync() {
            return;
        }
        let meta = doc
            .entity_state(kind, id)
            .map(|s| s.meta.clone())
            .unwrap_or_default();
        self.flag_all(&Entity::child(device, kind, id), action, &meta);
    }

    /// Follow a new device's actuators on every cloud session.
    pub async fn include_device(&self, device: &str) {
        for cloud in self.list() {
            cloud.include_device(device).await;
        }
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Write `clouds.json` atomically.
    pub async fn save(&self) -> Result<(), CoreError> {
        let _guard = self.inner.save_lock.lock().await;
        let configs: IndexMap<String, CloudConfig> = self
            .clouds()
            .iter()
            .map(|(id, cloud)| (id.clone(), cloud.config()))
            .collect();
        let json = serde_json::to_string_pretty(&configs).map_err(|e| CoreError::Storage {
            message: format!("encoding clouds: {e}"),
        })?;

        let path = self.path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), clouds = configs.len(), "clouds saved");
        Ok(())
    }

    /// Save whenever a sync loop changes a cloud's record.
    pub fn spawn_saver(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = registry.inner.ctx.wait_config_changed() => {
                        if let Err(e) = registry.save().await {
                            warn!(error = %e, "saving clouds failed");
                        }
                    }
                }
            }
        })
    }
}

/// Parse a `clouds.json` document. Records without an id take their key.
pub fn parse_configs(raw: &str) -> Result<IndexMap<String, CloudConfig>, CoreError> {
    let mut configs: IndexMap<String, CloudConfig> =
        serde_json::from_str(raw).map_err(|e| CoreError::Config {
            message: format!("clouds file: {e}"),
        })?;
    for (id, config) in &mut configs {
        if config.id.is_empty() {
            config.id.clone_from(id);
        }
    }
    Ok(configs)
}
