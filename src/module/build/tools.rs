//! External build tools
//!
//! The package manager installs module sources and their dependencies, the
//! bundler turns a module's client entry into a single servable artifact.
//! Both are only ever invoked from inside a [`BuildQueue`](super::BuildQueue)
//! task.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::module::traits::ModuleError;

/// Package manager interface
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Fetch `name` from the shared registry into `cwd`'s dependency area
    async fn add(&self, cwd: &Path, name: &str) -> Result<(), ModuleError>;

    /// Resolve and install the dependencies declared by the package at `path`
    async fn install(&self, path: &Path) -> Result<(), ModuleError>;
}

/// Bundler interface
#[async_trait]
pub trait Bundler: Send + Sync {
    /// Transform `entry` (and everything it imports) into `output`
    async fn build(&self, entry: &Path, output: &Path) -> Result<(), ModuleError>;
}

/// Package manager backed by an external command (`yarn` by default)
#[derive(Debug, Clone)]
pub struct CommandPackageManager {
    program: PathBuf,
}

impl CommandPackageManager {
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
        }
    }
}

impl Default for CommandPackageManager {
    fn default() -> Self {
        Self::new("yarn")
    }
}

#[async_trait]
impl PackageManager for CommandPackageManager {
    async fn add(&self, cwd: &Path, name: &str) -> Result<(), ModuleError> {
        info!("Adding package {} in {:?}", name, cwd);
        let mut command = Command::new(&self.program);
        command.arg("add").arg(name).current_dir(cwd);
        run_tool(command, &format!("{} add", self.program.display())).await
    }

    async fn install(&self, path: &Path) -> Result<(), ModuleError> {
        info!("Installing dependencies in {:?}", path);
        let mut command = Command::new(&self.program);
        command.arg("install").current_dir(path);
        run_tool(command, &format!("{} install", self.program.display())).await
    }
}

/// Bundler backed by an external command taking `<entry> <output>`
#[derive(Debug, Clone)]
pub struct CommandBundler {
    program: PathBuf,
    cwd: Option<PathBuf>,
}

impl CommandBundler {
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            cwd: None,
        }
    }

    /// Directory the bundler runs in
    pub fn with_cwd<P: AsRef<Path>>(mut self, cwd: P) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }
}

#[async_trait]
impl Bundler for CommandBundler {
    async fn build(&self, entry: &Path, output: &Path) -> Result<(), ModuleError> {
        info!("Bundling {:?} -> {:?}", entry, output);
        let mut command = Command::new(&self.program);
        command.arg(entry).arg(output);
        if let Some(ref cwd) = self.cwd {
            command.current_dir(cwd);
        }
        run_tool(command, &self.program.display().to_string()).await
    }
}

/// Run a tool to completion; output goes to the host's stdout/stderr
async fn run_tool(mut command: Command, tool: &str) -> Result<(), ModuleError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    debug!("Running tool: {:?}", command);

    let status = command.status().await.map_err(|e| {
        ModuleError::Io(format!("Failed to spawn {}: {}", tool, e))
    })?;

    if status.success() {
        Ok(())
    } else {
        Err(ModuleError::Tool {
            tool: tool.to_string(),
            code: status.code(),
        })
    }
}
