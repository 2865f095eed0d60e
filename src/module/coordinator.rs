//! Client-side lifecycle coordinator
//!
//! Drives each module key through load, mount, unmount and unload. Each
//! phase has its own keyed lock: at most one load and one mount per key is
//! in flight, and a phase that finds its work already done skips it. Hot
//! add/remove notifications from the server go through the same locks as
//! explicit requests.
//!
//! Lock order: boot holds the load lock and the mount lock one after the
//! other, never both; release takes the load lock while holding the mount
//! lock. No path takes them the other way round.

use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::module::ipc::client::ModuleClient;
use crate::module::ipc::protocol::{Operation, NOTIFY_ADD, NOTIFY_REMOVE};
use crate::module::ipc::transport::{ListenerId, MessageResult, Transport};
use crate::module::registry::ModuleRegistry;
use crate::module::sync::KeyedMutex;
use crate::module::traits::{
    CodeLoader, ModuleApi, ModuleCode, ModuleContext, ModuleError, ModuleKey, ModuleKind,
    ModuleState,
};

const EVENT_CAPACITY: usize = 1024;

/// Lifecycle notifications. `LoadStart` is always followed by `Load` and
/// `Mount` for the same key, whether or not the phases succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    LoadStart(ModuleKey),
    Load(ModuleKey),
    Mount(ModuleKey),
    Release(ModuleKey),
}

/// Options for [`LifecycleCoordinator::request_modules`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Rebuild on the server even if an artifact exists
    pub force: bool,
    /// Ask the server to announce the modules to other clients
    pub hotload: bool,
}

enum Mode {
    Connected(Arc<Transport>),
    Offline,
}

/// Whether a request announces its phases to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notify {
    Events,
    /// Dependency requests made by modules through their host handle
    Quiet,
}

/// Per-kind module lifecycle manager
pub struct LifecycleCoordinator {
    kind: ModuleKind,
    mode: Mode,
    loader: Arc<dyn CodeLoader>,
    registry: ModuleRegistry,
    loads: KeyedMutex<ModuleKey>,
    mounts: KeyedMutex<ModuleKey>,
    events: broadcast::Sender<LifecycleEvent>,
    listeners: Mutex<Vec<ListenerId>>,
    this: Weak<LifecycleCoordinator>,
}

impl LifecycleCoordinator {
    /// Coordinator resolving modules through the server behind `transport`,
    /// reacting to its hot reload notifications
    pub fn connected(
        kind: ModuleKind,
        transport: Arc<Transport>,
        loader: Arc<dyn CodeLoader>,
    ) -> Arc<Self> {
        let coordinator = Self::build(kind, Mode::Connected(Arc::clone(&transport)), loader);
        coordinator.attach_hot_reload(&transport);
        coordinator
    }

    /// Coordinator resolving modules from in-process code only
    pub fn offline(kind: ModuleKind, loader: Arc<dyn CodeLoader>) -> Arc<Self> {
        Self::build(kind, Mode::Offline, loader)
    }

    /// Coordinator for the `[client]` section. Unless `offline` is set, a
    /// [`ModuleClient`] is spawned to carry the connection; its task handle
    /// is returned alongside and ends once the coordinator is dropped.
    pub fn from_config(
        kind: ModuleKind,
        config: &ClientConfig,
        loader: Arc<dyn CodeLoader>,
    ) -> (Arc<Self>, Option<JoinHandle<()>>) {
        if config.offline {
            info!(%kind, "Module client running offline");
            return (Self::offline(kind, loader), None);
        }

        let (client, transport) = ModuleClient::from_config(config);
        info!(%kind, server = %config.server_addr, "Module client connecting");
        let driver = client.spawn();
        (Self::connected(kind, transport, loader), Some(driver))
    }

    fn build(kind: ModuleKind, mode: Mode, loader: Arc<dyn CodeLoader>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|this| Self {
            kind,
            mode,
            loader,
            registry: ModuleRegistry::new(),
            loads: KeyedMutex::new(),
            mounts: KeyedMutex::new(),
            events,
            listeners: Mutex::new(Vec::new()),
            this: this.clone(),
        })
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn is_offline(&self) -> bool {
        matches!(self.mode, Mode::Offline)
    }

    /// Receive lifecycle events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Handle modules can use to reach this coordinator
    pub fn host_handle(&self) -> HostHandle {
        HostHandle {
            coordinator: self.this.clone(),
        }
    }

    /// Load and mount `keys`; one independent result per key, in order
    pub async fn request_modules(
        &self,
        keys: &[ModuleKey],
        options: RequestOptions,
    ) -> Vec<Result<Arc<ModuleApi>, ModuleError>> {
        self.request_batch(keys, options, Notify::Events).await
    }

    async fn request_batch(
        &self,
        keys: &[ModuleKey],
        options: RequestOptions,
        notify: Notify,
    ) -> Vec<Result<Arc<ModuleApi>, ModuleError>> {
        if keys.is_empty() {
            return Vec::new();
        }

        for key in keys {
            self.emit(notify, LifecycleEvent::LoadStart(key.clone()));
        }

        let resolved = match self.resolve(keys, options).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(kind = %self.kind, "Failed to resolve modules: {}", e);
                for key in keys {
                    self.emit(notify, LifecycleEvent::Load(key.clone()));
                    self.emit(notify, LifecycleEvent::Mount(key.clone()));
                }
                return keys.iter().map(|_| Err(e.clone())).collect();
            }
        };

        join_all(
            keys.iter()
                .zip(resolved)
                .map(|(key, has_client)| self.boot(key, has_client, notify)),
        )
        .await
    }

    pub async fn request_module(
        &self,
        key: &ModuleKey,
        options: RequestOptions,
    ) -> Result<Arc<ModuleApi>, ModuleError> {
        self.request_modules(std::slice::from_ref(key), options)
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(ModuleError::NotFound(key.to_string())))
    }

    /// Whether each key ships client code, per key
    async fn resolve(
        &self,
        keys: &[ModuleKey],
        options: RequestOptions,
    ) -> Result<Vec<Result<bool, ModuleError>>, ModuleError> {
        let transport = match &self.mode {
            Mode::Offline => {
                return Ok(keys
                    .iter()
                    .map(|key| Ok(self.loader.has_code(self.kind, key)))
                    .collect());
            }
            Mode::Connected(transport) => transport,
        };

        let mut args = Map::new();
        args.insert(
            self.kind.collection().to_string(),
            Value::Array(keys.iter().map(|k| Value::String(k.to_string())).collect()),
        );
        args.insert("force".to_string(), Value::Bool(options.force));
        args.insert("hotload".to_string(), Value::Bool(options.hotload));

        let result = transport
            .request(&Operation::Request(self.kind).name(), Value::Object(args))
            .await?;

        let entries = result.as_array().ok_or_else(|| {
            ModuleError::Serialization(format!("expected a list of {}", self.kind.collection()))
        })?;

        let mut has_client = HashMap::new();
        for entry in entries {
            if let Some(key) = entry.get(self.kind.field()).and_then(Value::as_str) {
                let client = entry
                    .get("hasClient")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                has_client.insert(key.to_string(), client);
            }
        }

        Ok(keys
            .iter()
            .map(|key| {
                has_client.get(key.as_str()).copied().ok_or_else(|| {
                    ModuleError::NotFound(format!("server did not resolve {}", key))
                })
            })
            .collect())
    }

    /// Load phase, then mount phase, for one key
    async fn boot(
        &self,
        key: &ModuleKey,
        has_client: Result<bool, ModuleError>,
        notify: Notify,
    ) -> Result<Arc<ModuleApi>, ModuleError> {
        let code = match has_client {
            Ok(true) => {
                let loaded = self.load(key).await;
                self.emit(notify, LifecycleEvent::Load(key.clone()));
                match loaded {
                    Ok(code) => Some(code),
                    Err(e) => {
                        warn!(kind = %self.kind, module = %key, "Failed to load module: {}", e);
                        self.emit(notify, LifecycleEvent::Mount(key.clone()));
                        return Err(e);
                    }
                }
            }
            Ok(false) => {
                self.emit(notify, LifecycleEvent::Load(key.clone()));
                None
            }
            Err(e) => {
                self.emit(notify, LifecycleEvent::Load(key.clone()));
                self.emit(notify, LifecycleEvent::Mount(key.clone()));
                return Err(e);
            }
        };

        let mounted = self.mount(key, code).await;
        if let Err(ref e) = mounted {
            warn!(kind = %self.kind, module = %key, "Failed to mount module: {}", e);
        }
        self.emit(notify, LifecycleEvent::Mount(key.clone()));
        mounted
    }

    async fn load(&self, key: &ModuleKey) -> Result<ModuleCode, ModuleError> {
        let ticket = self.loads.acquire(key.clone()).await;

        if let Some(code) = self.registry.code(key).await {
            debug!(kind = %self.kind, module = %key, "Module already loaded");
            return Ok(code);
        }

        debug!(kind = %self.kind, module = %key, "Loading module");
        let code = self.loader.load(self.kind, key).await?;
        self.registry.set_code(key, Arc::clone(&code)).await;
        ticket.release();
        Ok(code)
    }

    async fn mount(
        &self,
        key: &ModuleKey,
        code: Option<ModuleCode>,
    ) -> Result<Arc<ModuleApi>, ModuleError> {
        let ticket = self.mounts.acquire(key.clone()).await;

        if let Some(api) = self.registry.api(key).await {
            debug!(kind = %self.kind, module = %key, "Module already mounted");
            return Ok(api);
        }

        let (instance, capability) = match code {
            Some(code) => {
                self.registry.restore_code(key, Arc::clone(&code)).await;
                let context = ModuleContext {
                    key: key.clone(),
                    kind: self.kind,
                    host: self.host_handle(),
                };
                let mut instance = code
                    .instantiate(context)
                    .await
                    .map_err(|e| activation_error(key, e))?;
                let capability = instance
                    .mount()
                    .await
                    .map_err(|e| activation_error(key, e))?;
                (Some(instance), capability)
            }
            None => (None, None),
        };

        let api = Arc::new(ModuleApi::new(key.clone(), capability));
        self.registry
            .set_mounted(key, instance, Arc::clone(&api))
            .await;
        info!(kind = %self.kind, module = %key, "Module mounted");
        ticket.release();
        Ok(api)
    }

    /// Unmount and unload `key`. Teardown errors are logged, not returned.
    pub async fn release_module(&self, key: &ModuleKey) {
        let mount_ticket = self.mounts.acquire(key.clone()).await;

        let (instance, api) = self.registry.take_mounted(key).await;
        if let Some(mut instance) = instance {
            if let Err(e) = instance.unmount().await {
                warn!(kind = %self.kind, module = %key, "Module teardown failed: {}", e);
            }
        }

        let load_ticket = self.loads.acquire(key.clone()).await;
        let code = self.registry.take_code(key).await;
        load_ticket.release();
        mount_ticket.release();

        if api.is_some() || code.is_some() {
            info!(kind = %self.kind, module = %key, "Module released");
        }
        self.emit(Notify::Events, LifecycleEvent::Release(key.clone()));
    }

    pub async fn release_modules(&self, keys: &[ModuleKey]) {
        join_all(keys.iter().map(|key| self.release_module(key))).await;
    }

    /// Ask the server to remove `key`, then release it locally. Returns the
    /// capability object that was mounted before the removal.
    pub async fn remove_module(
        &self,
        key: &ModuleKey,
    ) -> Result<Option<Arc<ModuleApi>>, ModuleError> {
        if let Mode::Connected(transport) = &self.mode {
            let mut fields = Map::new();
            fields.insert(
                self.kind.field().to_string(),
                Value::String(key.to_string()),
            );
            transport
                .command(&Operation::Remove(self.kind).name(), fields)
                .await?;
        }

        let old = self.registry.api(key).await;
        self.release_module(key).await;
        Ok(old)
    }

    pub async fn remove_modules(
        &self,
        keys: &[ModuleKey],
    ) -> Vec<Result<Option<Arc<ModuleApi>>, ModuleError>> {
        join_all(keys.iter().map(|key| self.remove_module(key))).await
    }

    /// The mounted capability object for `key`
    pub async fn api(&self, key: &ModuleKey) -> Option<Arc<ModuleApi>> {
        self.registry.api(key).await
    }

    pub async fn state(&self, key: &ModuleKey) -> ModuleState {
        self.registry.state(key).await
    }

    /// Key that owns `api`, while it is still the mounted capability object
    pub async fn key_of(&self, api: &Arc<ModuleApi>) -> Option<ModuleKey> {
        self.registry.key_of(api).await
    }

    pub async fn mounted_keys(&self) -> Vec<ModuleKey> {
        self.registry.mounted_keys().await
    }

    fn emit(&self, notify: Notify, event: LifecycleEvent) {
        if notify == Notify::Quiet {
            return;
        }
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn attach_hot_reload(&self, transport: &Transport) {
        let add = {
            let coordinator = self.this.clone();
            let kind = self.kind;
            transport.on_message_type(NOTIFY_ADD, move |result| {
                let Some(key) = notified_key(kind, NOTIFY_ADD, result) else {
                    return;
                };
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    let Some(coordinator) = coordinator.upgrade() else {
                        return;
                    };
                    info!(%kind, module = %key, "Hot add");
                    if let Err(e) = coordinator
                        .request_module(&key, RequestOptions::default())
                        .await
                    {
                        warn!(%kind, module = %key, "Hot add failed: {}", e);
                    }
                });
            })
        };

        let remove = {
            let coordinator = self.this.clone();
            let kind = self.kind;
            transport.on_message_type(NOTIFY_REMOVE, move |result| {
                let Some(key) = notified_key(kind, NOTIFY_REMOVE, result) else {
                    return;
                };
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    if let Some(coordinator) = coordinator.upgrade() {
                        info!(%kind, module = %key, "Hot remove");
                        coordinator.release_module(&key).await;
                    }
                });
            })
        };

        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([add, remove]);
    }
}

impl Drop for LifecycleCoordinator {
    fn drop(&mut self) {
        if let Mode::Connected(ref transport) = self.mode {
            let listeners = self.listeners.get_mut().unwrap_or_else(PoisonError::into_inner);
            for id in listeners.drain(..) {
                transport.remove_listener(id);
            }
        }
    }
}

/// A module hook failure, whatever the hook reported, is an activation error
fn activation_error(key: &ModuleKey, error: ModuleError) -> ModuleError {
    match error {
        ModuleError::Activation(_) => error,
        other => ModuleError::Activation(format!("{}: {}", key, other)),
    }
}

/// Key announced by a hot reload notification for `kind`, if any
fn notified_key(kind: ModuleKind, message_type: &str, result: MessageResult) -> Option<ModuleKey> {
    match result {
        Ok(Some(value)) => value
            .get(kind.field())
            .and_then(Value::as_str)
            .map(ModuleKey::from),
        Ok(None) => None,
        Err(e) => {
            warn!(%kind, message_type, "Hot reload listener: {}", e);
            None
        }
    }
}

/// Weak handle to the coordinator, given to modules at instantiation
#[derive(Clone)]
pub struct HostHandle {
    coordinator: Weak<LifecycleCoordinator>,
}

impl HostHandle {
    fn upgrade(&self) -> Result<Arc<LifecycleCoordinator>, ModuleError> {
        self.coordinator
            .upgrade()
            .ok_or_else(|| ModuleError::NotFound("coordinator has shut down".to_string()))
    }

    /// Capability object of another mounted module
    pub async fn api(&self, key: &ModuleKey) -> Option<Arc<ModuleApi>> {
        match self.coordinator.upgrade() {
            Some(coordinator) => coordinator.api(key).await,
            None => None,
        }
    }

    /// Load and mount a dependency without emitting lifecycle events.
    /// Requesting the module's own key from its mount hook never completes.
    pub async fn request_module(&self, key: &ModuleKey) -> Result<Arc<ModuleApi>, ModuleError> {
        self.upgrade()?
            .request_batch(
                std::slice::from_ref(key),
                RequestOptions::default(),
                Notify::Quiet,
            )
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(ModuleError::NotFound(key.to_string())))
    }
}

impl std::fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHandle")
            .field("attached", &(self.coordinator.strong_count() > 0))
            .finish()
    }
}
