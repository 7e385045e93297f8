//! High-level operations: bring a cluster up, tear it down, fetch its
//! kubeconfig.
//!
//! Each operation loads the cluster document, drives an [`Engine`] through
//! the required lifecycle steps and always closes the sessions it opened,
//! even when a step in between fails.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ClusterSpec, ConfigError};
use crate::engine::{Engine, EngineError};
use crate::installer::InstallerCache;
use crate::session::ssh::DEFAULT_CONNECT_TIMEOUT;
use crate::session::{Connector, SshConnector};

/// Default location of the cluster document.
pub const DEFAULT_CONFIG_PATH: &str = "kestrel.yml";

/// Default location of the local kubeconfig.
pub const DEFAULT_KUBECONFIG_PATH: &str = "~/.kube/config";

/// Errors returned by the operations.
#[derive(Error, Debug)]
pub enum OpsError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A local installation script was requested but cannot be read.
    #[error("failed to read installer script {path}: {source}")]
    InstallerScript {
        path: String,
        source: std::io::Error,
    },
}

impl From<ConfigError> for OpsError {
    fn from(e: ConfigError) -> Self {
        Self::Engine(EngineError::from(e))
    }
}

/// Options shared by all operations.
#[derive(Debug, Clone)]
pub struct Options {
    /// Cluster document.
    pub config: PathBuf,
    /// Local kubeconfig to merge credentials into; `~` is expanded.
    pub kubeconfig: String,
    /// Session establishment timeout.
    pub timeout: Duration,
    /// Local copy of the k3s installation script.
    pub installer_script: Option<PathBuf>,
    /// Keep the k3s entry names in the kubeconfig.
    pub machine_mode: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: PathBuf::from(DEFAULT_CONFIG_PATH),
            kubeconfig: DEFAULT_KUBECONFIG_PATH.to_string(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
            installer_script: None,
            machine_mode: false,
        }
    }
}

impl Options {
    #[must_use]
    pub fn with_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = path.into();
        self
    }

    #[must_use]
    pub fn with_kubeconfig(mut self, path: impl Into<String>) -> Self {
        self.kubeconfig = path.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_installer_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.installer_script = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_machine_mode(mut self, machine_mode: bool) -> Self {
        self.machine_mode = machine_mode;
        self
    }
}

/// Whether the process runs in automation, signalled by a non-empty `CI`
/// environment variable.
#[must_use]
pub fn machine_mode_from_env() -> bool {
    std::env::var_os("CI").is_some_and(|v| !v.is_empty())
}

/// Read and parse the cluster document at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is empty or is malformed.
pub fn load_config(path: &Path) -> Result<ClusterSpec, ConfigError> {
    ClusterSpec::load(path)
}

async fn installer(options: &Options) -> Result<Arc<InstallerCache>, OpsError> {
    match &options.installer_script {
        Some(path) => {
            info!(path = %path.display(), "Using local k3s installer");
            let script = tokio::fs::read(path)
                .await
                .map_err(|source| OpsError::InstallerScript {
                    path: path.display().to_string(),
                    source,
                })?;
            Ok(Arc::new(InstallerCache::preloaded(script)))
        }
        None => Ok(Arc::new(
            InstallerCache::new().map_err(EngineError::from)?,
        )),
    }
}

async fn connected<C: Connector>(
    connector: C,
    options: &Options,
) -> Result<Engine<C>, OpsError> {
    let spec = load_config(&options.config)?;
    let mut engine = Engine::new(connector, installer(options).await?);
    engine.set_spec(spec)?;
    engine.connect().await?;
    Ok(engine)
}

/// Close the sessions of `engine` and combine the outcome with `result`.
/// The first error wins; a disconnect error after a failure is only logged.
async fn finish<C: Connector, T>(
    mut engine: Engine<C>,
    result: Result<T, EngineError>,
) -> Result<T, OpsError> {
    let disconnected = engine.disconnect().await;
    match (result, disconnected) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e.into()),
        (Err(e), Err(disconnect)) => {
            warn!(error = %disconnect, "Failed to disconnect cleanly");
            Err(e.into())
        }
    }
}

/// Install the cluster and merge its kubeconfig into
/// [`Options::kubeconfig`]. Returns the path of the written kubeconfig.
///
/// # Errors
///
/// Returns the first error encountered.
pub async fn up(options: &Options) -> Result<PathBuf, OpsError> {
    up_with(SshConnector::new(options.timeout), options).await
}

/// [`up`] with a custom connector.
///
/// # Errors
///
/// Returns the first error encountered.
pub async fn up_with<C: Connector>(connector: C, options: &Options) -> Result<PathBuf, OpsError> {
    let mut engine = connected(connector, options).await?;

    let result = match engine.install().await {
        Ok(()) => {
            engine
                .kubeconfig(&options.kubeconfig, options.machine_mode)
                .await
        }
        Err(e) => Err(e),
    };

    let path = finish(engine, result).await?;
    info!(kubeconfig = %path.display(), "Cluster is up");
    Ok(path)
}

/// Uninstall k3s from every node.
///
/// # Errors
///
/// Returns the first error encountered.
pub async fn down(options: &Options) -> Result<(), OpsError> {
    down_with(SshConnector::new(options.timeout), options).await
}

/// [`down`] with a custom connector.
///
/// # Errors
///
/// Returns the first error encountered.
pub async fn down_with<C: Connector>(connector: C, options: &Options) -> Result<(), OpsError> {
    let mut engine = connected(connector, options).await?;
    let result = engine.uninstall().await;
    finish(engine, result).await?;
    info!("Cluster is down");
    Ok(())
}

/// Merge the kubeconfig of an installed cluster into
/// [`Options::kubeconfig`]. Returns the path of the written kubeconfig.
///
/// # Errors
///
/// Returns the first error encountered.
pub async fn kubeconfig(options: &Options) -> Result<PathBuf, OpsError> {
    kubeconfig_with(SshConnector::new(options.timeout), options).await
}

/// [`kubeconfig`] with a custom connector.
///
/// # Errors
///
/// Returns the first error encountered.
pub async fn kubeconfig_with<C: Connector>(
    connector: C,
    options: &Options,
) -> Result<PathBuf, OpsError> {
    let engine = connected(connector, options).await?;
    let result = engine
        .kubeconfig(&options.kubeconfig, options.machine_mode)
        .await;
    finish(engine, result).await
}
