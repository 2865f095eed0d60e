//! Shared fixtures for integration tests
//!
//! Fake build tools that write real files into a temporary work directory,
//! and module factories that count what happens to them.

#![allow(dead_code)]

use async_trait::async_trait;
use modhost::module::{
    Bundler, Capability, CodeLoader, ModuleCatalog, ModuleCode, ModuleContext, ModuleError,
    ModuleFactory, ModuleInstance, ModuleKey, ModuleKind, ModuleStore, PackageManager,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

/// Tracks how many tool invocations overlap
#[derive(Default)]
pub struct Concurrency {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Package manager that "fetches" a package by writing a minimal one
#[derive(Default)]
pub struct FakePackageManager {
    pub calls: Mutex<Vec<String>>,
    pub fail_install: Mutex<Option<ModuleError>>,
    pub delay: Option<Duration>,
    pub concurrency: Arc<Concurrency>,
}

impl FakePackageManager {
    pub fn with_delay(delay: Duration, concurrency: Arc<Concurrency>) -> Self {
        Self {
            delay: Some(delay),
            concurrency,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_installs_with(&self, error: ModuleError) {
        *self.fail_install.lock().unwrap() = Some(error);
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
    }
}

#[async_trait]
impl PackageManager for FakePackageManager {
    async fn add(&self, cwd: &Path, name: &str) -> Result<(), ModuleError> {
        self.concurrency.enter();
        self.calls.lock().unwrap().push(format!("add {}", name));
        self.pause().await;

        let dir = cwd.join("node_modules").join(name);
        tokio::fs::create_dir_all(&dir).await?;
        let package = json!({
            "name": name,
            "version": "1.0.0",
            "main": "index.js",
            "description": "published package",
        });
        tokio::fs::write(dir.join("package.json"), package.to_string()).await?;
        tokio::fs::write(dir.join("index.js"), format!("// {}\n", name)).await?;

        self.concurrency.exit();
        Ok(())
    }

    async fn install(&self, path: &Path) -> Result<(), ModuleError> {
        self.concurrency.enter();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.calls.lock().unwrap().push(format!("install {}", name));
        self.pause().await;
        self.concurrency.exit();

        if let Some(error) = self.fail_install.lock().unwrap().clone() {
            return Err(error);
        }
        if !path.join("package.json").exists() {
            return Err(ModuleError::NotFound(format!("no package.json in {:?}", path)));
        }
        Ok(())
    }
}

/// Bundler that copies the entry file to the output
#[derive(Default)]
pub struct FakeBundler {
    pub builds: AtomicUsize,
    pub concurrency: Arc<Concurrency>,
}

impl FakeBundler {
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Bundler for FakeBundler {
    async fn build(&self, entry: &Path, output: &Path) -> Result<(), ModuleError> {
        self.concurrency.enter();
        self.builds.fetch_add(1, Ordering::SeqCst);
        let copied = tokio::fs::copy(entry, output).await;
        self.concurrency.exit();
        copied.map(|_| ()).map_err(|e| {
            ModuleError::Tool {
                tool: format!("bundle {:?}: {}", entry, e),
                code: Some(1),
            }
        })
    }
}

/// Isolated work directory with a store wired to fake tools
pub struct StoreFixture {
    pub temp_dir: TempDir,
    pub work_dir: PathBuf,
    pub local_dir: PathBuf,
    pub package_manager: Arc<FakePackageManager>,
    pub bundler: Arc<FakeBundler>,
    pub store: Arc<ModuleStore>,
}

impl StoreFixture {
    pub fn new() -> Self {
        Self::with_package_manager(FakePackageManager::default())
    }

    pub fn with_package_manager(package_manager: FakePackageManager) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let work_dir = temp_dir.path().join("work");
        let local_dir = temp_dir.path().join("local");
        std::fs::create_dir_all(&local_dir).unwrap();

        let bundler = Arc::new(FakeBundler {
            concurrency: Arc::clone(&package_manager.concurrency),
            ..FakeBundler::default()
        });
        let package_manager = Arc::new(package_manager);
        let store = Arc::new(ModuleStore::new(
            work_dir.clone(),
            local_dir.clone(),
            Arc::clone(&package_manager) as Arc<dyn PackageManager>,
            Arc::clone(&bundler) as Arc<dyn Bundler>,
        ));

        Self {
            temp_dir,
            work_dir,
            local_dir,
            package_manager,
            bundler,
            store,
        }
    }

    /// Write a locally-authored module under the local root
    pub fn create_local_module(&self, relative: &str, name: &str, client_source: &str) -> PathBuf {
        let dir = self.local_dir.join(relative);
        std::fs::create_dir_all(&dir).unwrap();
        let package = json!({ "name": name, "version": "0.2.0", "client": "client.js" });
        std::fs::write(dir.join("package.json"), package.to_string()).unwrap();
        std::fs::write(dir.join("client.js"), client_source).unwrap();
        dir
    }

    pub fn artifact_path(&self, kind: ModuleKind, name: &str) -> PathBuf {
        self.work_dir
            .join(kind.collection())
            .join("build")
            .join(format!("{}.js", name))
    }
}

/// Counters shared by a factory and all of its instances
#[derive(Default)]
pub struct ModuleCounters {
    pub instantiations: AtomicUsize,
    pub mounts: AtomicUsize,
    pub unmounts: AtomicUsize,
}

impl ModuleCounters {
    pub fn instantiations(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }

    pub fn mounts(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    pub fn unmounts(&self) -> usize {
        self.unmounts.load(Ordering::SeqCst)
    }
}

/// Capability object exposed by [`TestFactory`] modules
#[derive(Debug, PartialEq, Eq)]
pub struct Greeting(pub String);

/// Module code with configurable behaviour
#[derive(Default)]
pub struct TestFactory {
    pub counters: Arc<ModuleCounters>,
    pub mount_delay: Option<Duration>,
    pub fail_mount: bool,
    /// Error the mount hook reports instead of succeeding
    pub mount_error: Option<ModuleError>,
    pub fail_unmount: bool,
    /// Key to request through the host while mounting
    pub dependency: Option<ModuleKey>,
}

impl TestFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_mount() -> Self {
        Self {
            fail_mount: true,
            ..Self::default()
        }
    }

    pub fn mount_failing_with(error: ModuleError) -> Self {
        Self {
            mount_error: Some(error),
            ..Self::default()
        }
    }

    pub fn failing_unmount() -> Self {
        Self {
            fail_unmount: true,
            ..Self::default()
        }
    }
}

struct TestInstance {
    key: ModuleKey,
    context: ModuleContext,
    counters: Arc<ModuleCounters>,
    mount_delay: Option<Duration>,
    fail_mount: bool,
    mount_error: Option<ModuleError>,
    fail_unmount: bool,
    dependency: Option<ModuleKey>,
}

#[async_trait]
impl ModuleFactory for TestFactory {
    async fn instantiate(
        &self,
        context: ModuleContext,
    ) -> Result<Box<dyn ModuleInstance>, ModuleError> {
        self.counters.instantiations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TestInstance {
            key: context.key.clone(),
            context,
            counters: Arc::clone(&self.counters),
            mount_delay: self.mount_delay,
            fail_mount: self.fail_mount,
            mount_error: self.mount_error.clone(),
            fail_unmount: self.fail_unmount,
            dependency: self.dependency.clone(),
        }))
    }
}

#[async_trait]
impl ModuleInstance for TestInstance {
    async fn mount(&mut self) -> Result<Option<Capability>, ModuleError> {
        if let Some(delay) = self.mount_delay {
            sleep(delay).await;
        }
        if let Some(ref dependency) = self.dependency {
            self.context.host.request_module(dependency).await?;
        }
        if self.fail_mount {
            return Err(ModuleError::Activation(format!("{} refused to mount", self.key)));
        }
        if let Some(ref error) = self.mount_error {
            return Err(error.clone());
        }
        self.counters.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Arc::new(Greeting(format!("hello from {}", self.key)))))
    }

    async fn unmount(&mut self) -> Result<(), ModuleError> {
        self.counters.unmounts.fetch_add(1, Ordering::SeqCst);
        if self.fail_unmount {
            return Err(ModuleError::Activation(format!("{} refused to unmount", self.key)));
        }
        Ok(())
    }
}

/// Catalog-backed loader that counts and optionally delays loads
pub struct CountingLoader {
    pub catalog: ModuleCatalog,
    pub loads: AtomicUsize,
    pub delay: Option<Duration>,
}

impl CountingLoader {
    pub fn new() -> Self {
        Self {
            catalog: ModuleCatalog::new(),
            loads: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }

    /// Register `factory` as plugin code for `key`; returns its counters
    pub fn register(&self, key: &str, factory: TestFactory) -> Arc<ModuleCounters> {
        let counters = Arc::clone(&factory.counters);
        self.catalog
            .register(ModuleKind::Plugin, key, Arc::new(factory) as ModuleCode);
        counters
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeLoader for CountingLoader {
    async fn load(&self, kind: ModuleKind, key: &ModuleKey) -> Result<ModuleCode, ModuleError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        self.catalog.load(kind, key).await
    }

    fn has_code(&self, kind: ModuleKind, key: &ModuleKey) -> bool {
        self.catalog.has_code(kind, key)
    }
}
