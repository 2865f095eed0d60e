//! Server-side module materialization
//!
//! `ModuleStore` turns a [`ModuleRef`] into a servable [`Artifact`]:
//! resolve the descriptor (package-manager fetch, local copy, or inline
//! write), install dependencies, then bundle the client entry. Every step
//! that touches the install area, the artifact directory or an external tool
//! runs inside the store's [`BuildQueue`]. The artifact file itself is the
//! cache: once it exists the whole pipeline is skipped.
//!
//! Layout under the work directory, per kind:
//!
//! ```text
//! <work_dir>/<engines|plugins>/node_modules/<name>/package.json
//! <work_dir>/<engines|plugins>/build/<artifact>.js
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::module::build::{BuildQueue, Bundler, PackageManager};
use crate::module::registry::{ModuleDescriptor, ModuleRef};
use crate::module::traits::{ModuleError, ModuleKind};
use crate::module::validation::{DescriptorValidator, DESCRIPTOR_FILE};

const ARTIFACT_EXTENSION: &str = "js";

/// A materialized, servable module artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ModuleKind,
    /// Artifact name (module key with `/` flattened to `_`)
    pub name: String,
    pub path: PathBuf,
    /// False for modules that declare no client entry (empty artifact)
    pub has_client: bool,
}

/// Idempotent, cache-checked materialization pipeline
pub struct ModuleStore {
    /// Root of the per-kind install areas and artifact directories
    work_dir: PathBuf,
    /// Root that absolute local module references are resolved against
    local_root: PathBuf,
    queue: BuildQueue,
    package_manager: Arc<dyn PackageManager>,
    bundler: Arc<dyn Bundler>,
}

impl ModuleStore {
    pub fn new<P: AsRef<Path>>(
        work_dir: P,
        local_root: P,
        package_manager: Arc<dyn PackageManager>,
        bundler: Arc<dyn Bundler>,
    ) -> Self {
        Self {
            work_dir: work_dir.as_ref().to_path_buf(),
            local_root: local_root.as_ref().to_path_buf(),
            queue: BuildQueue::new(),
            package_manager,
            bundler,
        }
    }

    /// Share a build queue with other stores using the same tools
    pub fn with_queue(mut self, queue: BuildQueue) -> Self {
        self.queue = queue;
        self
    }

    pub fn queue(&self) -> &BuildQueue {
        &self.queue
    }

    pub fn kind_dir(&self, kind: ModuleKind) -> PathBuf {
        self.work_dir.join(kind.collection())
    }

    pub fn install_dir(&self, kind: ModuleKind, name: &str) -> PathBuf {
        self.kind_dir(kind).join("node_modules").join(name)
    }

    pub fn build_dir(&self, kind: ModuleKind) -> PathBuf {
        self.kind_dir(kind).join("build")
    }

    pub fn artifact_path(&self, kind: ModuleKind, artifact_name: &str) -> PathBuf {
        self.build_dir(kind)
            .join(format!("{}.{}", artifact_name, ARTIFACT_EXTENSION))
    }

    fn local_source_dir(&self, path: &str) -> PathBuf {
        self.local_root.join(path.trim_start_matches('/'))
    }

    /// Make sure the artifact for `module` exists, building it if needed
    pub async fn ensure_materialized(
        &self,
        module: &ModuleRef,
        kind: ModuleKind,
    ) -> Result<Artifact, ModuleError> {
        let name = module.artifact_name();

        if let Some(artifact) = self.cached(kind, &name).await? {
            debug!(%kind, artifact = %name, "Artifact cache hit");
            return Ok(artifact);
        }

        info!(%kind, module = %module.key(), "Materializing module");

        let (descriptor, install_dir) = match module {
            ModuleRef::Named(package) => self.fetch_named(kind, package).await?,
            ModuleRef::LocalPath(path) => self.fetch_local(kind, path).await?,
            ModuleRef::Inline(descriptor) => self.write_inline(kind, descriptor).await?,
        };

        let artifact = self.build(kind, &name, &descriptor, &install_dir).await?;
        info!(%kind, artifact = %artifact.name, "Module materialized");
        Ok(artifact)
    }

    /// Delete the install location and the artifact; absent files are fine
    pub async fn remove_materialized(
        &self,
        module: &ModuleRef,
        kind: ModuleKind,
    ) -> Result<(), ModuleError> {
        let artifact_path = self.artifact_path(kind, &module.artifact_name());
        let install_dir = match module {
            ModuleRef::Named(package) => Some(self.install_dir(kind, package)),
            ModuleRef::Inline(descriptor) => Some(self.install_dir(kind, &descriptor.name)),
            ModuleRef::LocalPath(path) => {
                // The install location is named after the descriptor; if the
                // source is gone only the artifact can be removed
                match ModuleDescriptor::from_dir(self.local_source_dir(path)).await {
                    Ok(descriptor) if DescriptorValidator::new().validate_name(&descriptor.name).is_ok() => {
                        Some(self.install_dir(kind, &descriptor.name))
                    }
                    _ => None,
                }
            }
        };

        info!(%kind, module = %module.key(), "Removing materialized module");

        self.queue
            .run("remove", async {
                if let Some(ref dir) = install_dir {
                    remove_dir_if_exists(dir).await?;
                }
                remove_file_if_exists(&artifact_path).await
            })
            .await
    }

    /// Names of every artifact of `kind`, sorted
    pub async fn list_artifacts(&self, kind: ModuleKind) -> Result<Vec<String>, ModuleError> {
        let mut entries = match tokio::fs::read_dir(self.build_dir(kind)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// The artifact, if it already exists
    pub async fn cached(
        &self,
        kind: ModuleKind,
        artifact_name: &str,
    ) -> Result<Option<Artifact>, ModuleError> {
        let path = self.artifact_path(kind, artifact_name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(Artifact {
                kind,
                name: artifact_name.to_string(),
                path,
                has_client: meta.len() > 0,
            })),
            Ok(_) => Err(ModuleError::Io(format!(
                "artifact path {:?} is not a file",
                path
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Registry name: fetch into the kind's dependency area, then read back
    async fn fetch_named(
        &self,
        kind: ModuleKind,
        package: &str,
    ) -> Result<(ModuleDescriptor, PathBuf), ModuleError> {
        let kind_dir = self.kind_dir(kind);
        let package_manager = Arc::clone(&self.package_manager);

        self.queue
            .run("add", async {
                tokio::fs::create_dir_all(&kind_dir).await?;
                package_manager.add(&kind_dir, package).await
            })
            .await?;

        let install_dir = self.install_dir(kind, package);
        let descriptor = ModuleDescriptor::from_dir(&install_dir).await?;
        Ok((descriptor, install_dir))
    }

    /// Local content: copy into the install area unless already there, then install
    async fn fetch_local(
        &self,
        kind: ModuleKind,
        path: &str,
    ) -> Result<(ModuleDescriptor, PathBuf), ModuleError> {
        let source = self.local_source_dir(path);
        let descriptor = ModuleDescriptor::from_dir(&source).await?;
        DescriptorValidator::new()
            .validate_name(&descriptor.name)
            .map_err(ModuleError::Validation)?;

        let install_dir = self.install_dir(kind, &descriptor.name);
        let package_manager = Arc::clone(&self.package_manager);

        self.queue
            .run("install", async {
                if !path_exists(&install_dir).await? {
                    debug!("Copying {:?} -> {:?}", source, install_dir);
                    copy_dir(&source, &install_dir).await?;
                }
                package_manager.install(&install_dir).await
            })
            .await?;

        Ok((descriptor, install_dir))
    }

    /// Inline declaration: write descriptor and files into a fresh location, then install
    async fn write_inline(
        &self,
        kind: ModuleKind,
        descriptor: &ModuleDescriptor,
    ) -> Result<(ModuleDescriptor, PathBuf), ModuleError> {
        let install_dir = self.install_dir(kind, &descriptor.name);
        let package_manager = Arc::clone(&self.package_manager);
        let package_json = serde_json::to_string_pretty(&descriptor.to_package_json())?;

        self.queue
            .run("install", async {
                remove_dir_if_exists(&install_dir).await?;
                tokio::fs::create_dir_all(&install_dir).await?;
                tokio::fs::write(install_dir.join(DESCRIPTOR_FILE), &package_json).await?;

                if let Some(ref files) = descriptor.files {
                    for (file_name, contents) in files {
                        let file_path = install_dir.join(file_name);
                        if let Some(parent) = file_path.parent() {
                            tokio::fs::create_dir_all(parent).await?;
                        }
                        tokio::fs::write(&file_path, contents).await?;
                    }
                }

                package_manager.install(&install_dir).await
            })
            .await?;

        Ok((descriptor.clone(), install_dir))
    }

    /// Bundle the client entry into the artifact, unless a racing request
    /// already did while this one was queued
    async fn build(
        &self,
        kind: ModuleKind,
        artifact_name: &str,
        descriptor: &ModuleDescriptor,
        install_dir: &Path,
    ) -> Result<Artifact, ModuleError> {
        let artifact_path = self.artifact_path(kind, artifact_name);
        let bundler = Arc::clone(&self.bundler);

        self.queue
            .run("build", async {
                if let Some(artifact) = self.cached(kind, artifact_name).await? {
                    debug!(%kind, artifact = %artifact_name, "Artifact built while queued");
                    return Ok(artifact);
                }

                tokio::fs::create_dir_all(self.build_dir(kind)).await?;

                if descriptor.has_client() {
                    let entry = descriptor.client_entry_path(install_dir);
                    bundler.build(&entry, &artifact_path).await?;
                } else {
                    debug!(%kind, artifact = %artifact_name, "No client entry, writing empty artifact");
                    tokio::fs::write(&artifact_path, b"").await?;
                }

                self.cached(kind, artifact_name).await?.ok_or_else(|| {
                    ModuleError::NotFound(format!(
                        "bundler produced no artifact at {:?}",
                        artifact_path
                    ))
                })
            })
            .await
    }
}

async fn path_exists(path: &Path) -> Result<bool, ModuleError> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), ModuleError> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<(), ModuleError> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Recursive copy; symlinks are skipped
async fn copy_dir(from: &Path, to: &Path) -> Result<(), ModuleError> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];

    while let Some((source, target)) = pending.pop() {
        tokio::fs::create_dir_all(&target).await?;
        let mut entries = tokio::fs::read_dir(&source).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let destination = target.join(entry.file_name());
            if file_type.is_dir() {
                pending.push((entry.path(), destination));
            } else if file_type.is_file() {
                tokio::fs::copy(entry.path(), &destination).await?;
            } else {
                debug!("Skipping non-regular file {:?}", entry.path());
            }
        }
    }

    Ok(())
}
