// ── Gateway context ──
//
// Owns the process-wide pieces of an edge gateway: its id, the local
// broker, the store, the codec registry and the clouds. Everything is
// passed in explicitly so tests get their own instance.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wazigate_api::TransportConfig;
use wazigate_mqtt::{Broker, BrokerOptions};

use crate::bridge::{BridgeFilter, Downstream, Handler, ValueRouter};
use crate::clouds::cloud::DEFAULT_SYNC_INTERVAL;
use crate::clouds::{Action, CloudContext, Clouds};
use crate::codec::Codecs;
use crate::error::CoreError;
use crate::local_id;
use crate::model::Device;
use crate::store::Store;

/// Startup parameters for [`Gateway::start`].
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Overrides the id derived from the hardware address.
    pub local_id: Option<String>,
    pub clouds_file: PathBuf,
    /// Directory of the outbound queue spill files.
    pub session_dir: PathBuf,
    /// Push interval for sensors without a `syncInterval`.
    pub sync_interval: Duration,
    /// Read deadline of the cloud MQTT sessions.
    pub read_timeout: Option<Duration>,
    pub transport: TransportConfig,
    pub broker: BrokerOptions,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            local_id: None,
            clouds_file: PathBuf::from("clouds.json"),
            session_dir: PathBuf::from("session"),
            sync_interval: DEFAULT_SYNC_INTERVAL,
            read_timeout: None,
            transport: TransportConfig::default(),
            broker: BrokerOptions::default(),
        }
    }
}

/// What a router is built from.
pub struct RouterParts {
    pub store: Arc<dyn Store>,
    pub codecs: Arc<Codecs>,
    pub clouds: Clouds,
    pub downstream: Arc<dyn Downstream>,
    pub local_id: String,
}

struct GatewayInner {
    local_id: String,
    broker: Broker,
    store: Arc<dyn Store>,
    codecs: Arc<Codecs>,
    clouds: Clouds,
    handler: Arc<dyn Handler>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to a running gateway.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    /// Start with the built-in [`ValueRouter`].
    pub async fn start(options: GatewayOptions, store: Arc<dyn Store>) -> Result<Self, CoreError> {
        Self::start_with(options, store, |parts| {
            Arc::new(ValueRouter::new(
                parts.store,
                parts.codecs,
                parts.clouds,
                parts.downstream,
                parts.local_id,
            ))
        })
        .await
    }

    /// Start with a custom router serving bridged publishes and tunnel
    /// requests.
    pub async fn start_with<F>(
        options: GatewayOptions,
        store: Arc<dyn Store>,
        router: F,
    ) -> Result<Self, CoreError>
    where
        F: FnOnce(RouterParts) -> Arc<dyn Handler>,
    {
        let local_id = local_id::resolve(options.local_id.as_deref());
        info!(local_id = %local_id, "starting gateway");

        ensure_local_device(store.as_ref(), &local_id).await?;

        let broker = Broker::new(options.broker.clone());
        let downstream: Arc<dyn Downstream> = Arc::new(broker.clone());
        let codecs = Arc::new(Codecs::default());

        let mut ctx = CloudContext::new(
            local_id.clone(),
            Arc::clone(&store),
            Arc::clone(&downstream),
            options.session_dir.clone(),
        );
        ctx.transport = options.transport.clone();
        ctx.default_interval = options.sync_interval;
        ctx.read_timeout = options.read_timeout;
        let ctx = Arc::new(ctx);

        let clouds = Clouds::load(Arc::clone(&ctx), options.clouds_file.clone()).await?;

        let handler = router(RouterParts {
            store: Arc::clone(&store),
            codecs: Arc::clone(&codecs),
            clouds: clouds.clone(),
            downstream,
            local_id: local_id.clone(),
        });
        ctx.set_handler(&handler);
        broker.set_publish_filter(Arc::new(BridgeFilter::new(Arc::clone(&handler))));

        let cancel = CancellationToken::new();
        let saver = clouds.spawn_saver(cancel.child_token());
        clouds.start();
        info!(clouds = clouds.len(), "gateway started");

        Ok(Self {
            inner: Arc::new(GatewayInner {
                local_id,
                broker,
                store,
                codecs,
                clouds,
                handler,
                cancel,
                tasks: Mutex::new(vec![saver]),
            }),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn codecs(&self) -> &Arc<Codecs> {
        &self.inner.codecs
    }

    pub fn clouds(&self) -> &Clouds {
        &self.inner.clouds
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.inner.handler
    }

    /// Store a new device, follow its actuators and queue its creation on
    /// every cloud.
    pub async fn create_device(&self, device: Device) -> Result<(), CoreError> {
        let id = device.id.clone();
        self.inner.store.put_device(device).await?;
        self.inner.clouds.include_device(&id).await;
        self.inner.clouds.flag_device(&id, Action::CREATE).await;
        Ok(())
    }

    /// Rename a device and queue the new name for every cloud.
    pub async fn set_device_name(&self, id: &str, name: &str) -> Result<(), CoreError> {
        let mut device = self.inner.store.get_device(id).await?;
        name.clone_into(&mut device.name);
        self.inner.store.put_device(device).await?;
        self.inner.clouds.flag_device(id, Action::MODIFY).await;
        Ok(())
    }

    /// Stop accepting clients, stop the clouds and persist them.
    pub async fn shutdown(&self) {
        info!("gateway shutting down");
        self.inner.broker.shutdown();
        self.inner.clouds.stop_all().await;
        if let Err(e) = self.inner.clouds.save().await {
            warn!(error = %e, "saving clouds on shutdown failed");
        }
        self.inner.cancel.cancel();

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "gateway task ended abnormally");
            }
        }
    }
}

/// Create the gateway's own device when the store lacks it.
async fn ensure_local_device(store: &dyn Store, local_id: &str) -> Result<(), CoreError> {
    match store.get_device(local_id).await {
        Ok(_) => Ok(()),
        Err(CoreError::DeviceNotFound { .. }) => {
            info!(local_id, "creating local device");
            store
                .put_device(Device::new(local_id, format!("Gateway {local_id}")))
                .await
        }
        Err(e) => Err(e),
    }
}
