//! Kubeconfig reconciliation.
//!
//! k3s writes an admin kubeconfig to `/etc/rancher/k3s/k3s.yaml` whose
//! cluster, user and context entries are all named `default` and whose
//! server points at the loopback address. [`rewrite`] turns that document
//! into one usable from the operator's machine and [`reconcile`] merges it
//! into a local kubeconfig file. The document model is `kube`'s.

use std::io::Write;
use std::path::{Path, PathBuf};

use kube::config::{KubeconfigError, NamedAuthInfo, NamedCluster, NamedContext};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::config::{expand_home, DEFAULT_API_PORT};

pub use kube::config::Kubeconfig;

/// Name k3s gives to every entry of the kubeconfig it generates.
pub const SENTINEL_NAME: &str = "default";

/// Errors raised while reconciling a kubeconfig.
#[derive(Error, Debug)]
pub enum CredentialError {
    /// The document is not a valid kubeconfig.
    #[error("invalid kubeconfig: {0}")]
    Parse(#[from] KubeconfigError),

    /// The document could not be serialized.
    #[error("failed to serialize kubeconfig: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The remote document lacks an entry k3s always generates.
    #[error("kubeconfig has no {kind} named {name:?}")]
    MissingEntry { kind: &'static str, name: String },

    /// The advertised API server URL cannot be parsed.
    #[error("invalid API server URL {url:?}: {reason}")]
    ServerUrl { url: String, reason: String },

    /// The destination path needs a home directory that cannot be resolved.
    #[error("cannot resolve home directory for {path}")]
    NoHome { path: String },

    /// The local kubeconfig could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    /// The local kubeconfig could not be written.
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

/// How entries of the fetched kubeconfig are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Naming {
    /// Keep the `default` names, for automation that relies on them.
    Sentinel,
    /// Rename entries after the API server host, for humans.
    Derived,
}

impl Naming {
    /// Machine mode keeps the sentinel names.
    #[must_use]
    pub fn for_machine_mode(machine_mode: bool) -> Self {
        if machine_mode {
            Self::Sentinel
        } else {
            Self::Derived
        }
    }
}

/// Entries addressable by name.
trait Named {
    fn name(&self) -> &str;
}

impl Named for NamedCluster {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for NamedContext {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for NamedAuthInfo {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Replace same-named entries in place, append the rest.
fn upsert<T: Named>(existing: &mut Vec<T>, incoming: Vec<T>) {
    for entry in incoming {
        match existing.iter_mut().find(|e| e.name() == entry.name()) {
            Some(slot) => *slot = entry,
            None => existing.push(entry),
        }
    }
}

fn find_mut<'a, T: Named>(
    entries: &'a mut [T],
    kind: &'static str,
    name: &str,
) -> Result<&'a mut T, CredentialError> {
    entries
        .iter_mut()
        .find(|e| e.name() == name)
        .ok_or_else(|| missing(kind, name))
}

fn missing(kind: &'static str, name: &str) -> CredentialError {
    CredentialError::MissingEntry {
        kind,
        name: name.to_string(),
    }
}

/// Parse a kubeconfig document. An empty document yields an empty config.
///
/// # Errors
///
/// Returns an error if the document is not a valid kubeconfig.
pub fn parse(contents: &str) -> Result<Kubeconfig, CredentialError> {
    if contents.trim().is_empty() {
        return Ok(Kubeconfig::default());
    }
    Ok(Kubeconfig::from_yaml(contents)?)
}

/// Serialize a kubeconfig document.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn to_yaml(doc: &Kubeconfig) -> Result<String, CredentialError> {
    Ok(serde_yaml::to_string(doc)?)
}

/// Point the k3s-generated document at `server_url` and name its entries
/// according to `naming`.
///
/// # Errors
///
/// Returns an error if the `default` cluster is missing, or, with
/// [`Naming::Derived`], if a `default` entry is missing or the URL is
/// invalid.
pub fn rewrite(
    doc: &mut Kubeconfig,
    server_url: &str,
    naming: Naming,
) -> Result<(), CredentialError> {
    find_mut(&mut doc.clusters, "cluster", SENTINEL_NAME)?
        .cluster
        .as_mut()
        .ok_or_else(|| missing("cluster", SENTINEL_NAME))?
        .server = Some(server_url.to_string());

    if naming == Naming::Sentinel {
        return Ok(());
    }

    let cluster = cluster_name(server_url)?;
    let context = format!("admin@{cluster}");

    find_mut(&mut doc.clusters, "cluster", SENTINEL_NAME)?
        .name
        .clone_from(&cluster);
    find_mut(&mut doc.auth_infos, "user", SENTINEL_NAME)?
        .name
        .clone_from(&context);

    let entry = find_mut(&mut doc.contexts, "context", SENTINEL_NAME)?;
    entry.name.clone_from(&context);
    let body = entry
        .context
        .as_mut()
        .ok_or_else(|| missing("context", SENTINEL_NAME))?;
    body.cluster = cluster;
    body.user = context.clone().into();

    doc.current_context = Some(context);
    Ok(())
}

/// Merge `incoming` into `existing`.
///
/// Entries of `incoming` replace same-named entries; all other entries are
/// kept. The current context is only adopted when none is set.
pub fn merge(existing: &mut Kubeconfig, incoming: Kubeconfig) {
    upsert(&mut existing.clusters, incoming.clusters);
    upsert(&mut existing.auth_infos, incoming.auth_infos);
    upsert(&mut existing.contexts, incoming.contexts);

    if existing
        .current_context
        .as_deref()
        .filter(|c| !c.is_empty())
        .is_none()
    {
        existing.current_context = incoming.current_context;
    }
    if existing.api_version.is_none() {
        existing.api_version = incoming.api_version;
    }
    if existing.kind.is_none() {
        existing.kind = incoming.kind;
    }
}

/// Human-readable cluster name for `server_url`: its host, with the port
/// appended unless it is the default API port.
///
/// # Errors
///
/// Returns an error if the URL cannot be parsed or has no host.
pub fn cluster_name(server_url: &str) -> Result<String, CredentialError> {
    let invalid = |reason: String| CredentialError::ServerUrl {
        url: server_url.to_string(),
        reason,
    };

    let url = Url::parse(server_url).map_err(|e| invalid(e.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| invalid("no host".to_string()))?
        .trim_start_matches('[')
        .trim_end_matches(']');

    match url.port_or_known_default() {
        Some(port) if port != DEFAULT_API_PORT => Ok(format!("{host}:{port}")),
        _ => Ok(host.to_string()),
    }
}

/// Resolve a destination path, expanding a leading `~`.
///
/// # Errors
///
/// Returns an error if the home directory is needed but unknown.
pub fn resolve_path(destination: &str) -> Result<PathBuf, CredentialError> {
    expand_home(destination).ok_or_else(|| CredentialError::NoHome {
        path: destination.to_string(),
    })
}

/// Merge `fetched` into the kubeconfig at `destination`, creating it if
/// needed. Returns the document that was written.
///
/// # Errors
///
/// Returns an error if the existing file cannot be read or parsed, or the
/// result cannot be written. The destination is left untouched on error.
pub fn reconcile(fetched: Kubeconfig, destination: &Path) -> Result<Kubeconfig, CredentialError> {
    let merged = match std::fs::read_to_string(destination) {
        Ok(contents) => {
            debug!(path = %destination.display(), "Merging into existing kubeconfig");
            let mut existing = parse(&contents)?;
            merge(&mut existing, fetched);
            existing
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => fetched,
        Err(source) => {
            return Err(CredentialError::Read {
                path: destination.display().to_string(),
                source,
            })
        }
    };

    write_atomic(destination, to_yaml(&merged)?.as_bytes())?;
    info!(path = %destination.display(), "Kubeconfig written");
    Ok(merged)
}

/// Write `contents` to a temporary file next to `path` and rename it into
/// place. The file is only readable by its owner.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CredentialError> {
    let write_err = |source: std::io::Error| CredentialError::Write {
        path: path.display().to_string(),
        source,
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(write_err)?;

    let mut file = NamedTempFile::new_in(parent).map_err(write_err)?;
    file.write_all(contents).map_err(write_err)?;
    file.as_file().sync_all().map_err(write_err)?;
    file.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}
