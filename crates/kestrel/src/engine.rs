//! Orchestration engine.
//!
//! The engine drives every node of a [`ClusterSpec`] through the lifecycle
//! `Uninitialized → SpecSet → Connected → Installing → Installed →
//! Disconnected`. Control-plane nodes are installed one after another, the
//! first one bootstrapping the cluster; worker nodes are then installed
//! concurrently, one task per node.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{
    ClusterSpec, ConfigError, NodeRef, NodeSpec, Role, RoleSelector, Violation, Violations,
};
use crate::installer::{FetchError, InstallerCache};
use crate::kubeconfig::{self, CredentialError, Naming};
use crate::session::{Cmd, Connector, RemoteSession, SessionError};
use crate::settings::{AgentSettings, Merge, ServerSettings};

/// Scratch directory on every node.
pub const WORK_DIR: &str = "/tmp/kestrel";

/// Location of the uploaded installation script.
pub const INSTALL_SCRIPT_PATH: &str = "/tmp/kestrel/install.sh";

/// Upload location of the rendered k3s configuration.
pub const CONFIG_UPLOAD_PATH: &str = "/tmp/kestrel/config.yaml";

/// Directory holding the k3s configuration.
pub const CONFIG_DIR: &str = "/etc/rancher/k3s";

/// Location of the k3s configuration file.
pub const CONFIG_PATH: &str = "/etc/rancher/k3s/config.yaml";

/// Join token written by a k3s server.
pub const TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/token";

/// Admin kubeconfig written by a k3s server.
pub const KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

/// Lifecycle state of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    SpecSet,
    Connected,
    Installing,
    Installed,
    Disconnected,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::SpecSet => "spec-set",
            Self::Connected => "connected",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Per-node step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    UploadInstaller,
    UploadConfig,
    Configure,
    Install,
    ReadToken,
    Uninstall,
    FetchKubeconfig,
    Disconnect,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UploadInstaller => "uploading installer",
            Self::UploadConfig => "uploading configuration",
            Self::Configure => "configuring k3s",
            Self::Install => "installing k3s",
            Self::ReadToken => "reading join token",
            Self::Uninstall => "uninstalling k3s",
            Self::FetchKubeconfig => "downloading kubeconfig",
            Self::Disconnect => "closing session",
        };
        f.write_str(name)
    }
}

/// Failure attributed to one node.
#[derive(Debug)]
pub struct NodeFailure {
    /// Host of the failed node.
    pub host: String,
    /// What went wrong.
    pub error: Box<EngineError>,
}

/// Failures of several nodes, reported together.
#[derive(Debug, Default)]
pub struct NodeFailures(pub Vec<NodeFailure>);

impl NodeFailures {
    /// Hosts of the failed nodes.
    #[must_use]
    pub fn hosts(&self) -> Vec<&str> {
        self.0.iter().map(|f| f.host.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn push(&mut self, host: impl Into<String>, error: EngineError) {
        self.0.push(NodeFailure {
            host: host.into(),
            error: Box::new(error),
        });
    }
}

impl fmt::Display for NodeFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", failure.error)?;
        }
        Ok(())
    }
}

/// Errors returned by the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The cluster specification was rejected.
    #[error(transparent)]
    ConfigInvalid(#[from] ConfigError),

    /// The operation is not allowed in the current state.
    #[error("cannot {operation} while engine is {state}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },

    /// A session to a node or to the proxy could not be established.
    #[error("failed to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: SessionError,
    },

    /// An upload or command failed on a node.
    #[error("{step} on {host} failed: {source}")]
    Remote {
        host: String,
        step: Step,
        #[source]
        source: SessionError,
    },

    /// The installation script could not be downloaded.
    #[error("failed to fetch installer: {0}")]
    Fetch(#[from] FetchError),

    /// The k3s configuration of a node could not be rendered.
    #[error("failed to render k3s configuration: {0}")]
    Render(#[from] serde_yaml::Error),

    /// The kubeconfig could not be reconciled.
    #[error("kubeconfig: {0}")]
    Credential(#[from] CredentialError),

    /// A worker task ended without reporting a result.
    #[error("installation task of {host} aborted: {reason}")]
    TaskAborted { host: String, reason: String },

    /// One or more worker installations failed.
    #[error("{count} worker(s) failed: {0}", count = .0.len())]
    WorkersFailed(NodeFailures),

    /// One or more sessions could not be closed cleanly.
    #[error("disconnect failed: {0}")]
    Disconnect(NodeFailures),
}

impl EngineError {
    fn remote(host: &str, step: Step) -> impl FnOnce(SessionError) -> Self + '_ {
        move |source| Self::Remote {
            host: host.to_string(),
            step,
            source,
        }
    }
}

/// Address and secret a node uses to join the cluster.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinCredentials {
    pub url: String,
    pub token: String,
}

impl fmt::Debug for JoinCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinCredentials")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Drives a cluster through its lifecycle.
pub struct Engine<C: Connector> {
    connector: C,
    installer: Arc<InstallerCache>,
    state: EngineState,
    spec: Option<Arc<ClusterSpec>>,
    server_url: String,
    join: Option<JoinCredentials>,
    /// One session per node, indexed like `spec.nodes`.
    sessions: Vec<Arc<C::Session>>,
    proxy: Option<C::Session>,
    cleanup_pending: Arc<AtomicBool>,
}

impl<C: Connector> fmt::Debug for Engine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("server_url", &self.server_url)
            .field("sessions", &self.sessions.len())
            .field("proxy", &self.proxy.is_some())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Engine<C> {
    /// Create an engine opening sessions with `connector` and taking the
    /// installation script from `installer`.
    pub fn new(connector: C, installer: Arc<InstallerCache>) -> Self {
        Self {
            connector,
            installer,
            state: EngineState::Uninitialized,
            spec: None,
            server_url: String::new(),
            join: None,
            sessions: Vec::new(),
            proxy: None,
            cleanup_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Advertised URL of the Kubernetes API; empty before [`Self::set_spec`].
    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Join credentials discovered on the first control-plane node.
    #[must_use]
    pub fn join_credentials(&self) -> Option<&JoinCredentials> {
        self.join.as_ref()
    }

    /// Whether temporary files may exist on the nodes.
    #[must_use]
    pub fn cleanup_pending(&self) -> bool {
        self.cleanup_pending.load(Ordering::SeqCst)
    }

    fn require(&self, operation: &'static str, allowed: &[EngineState]) -> Result<(), EngineError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn spec(&self, operation: &'static str) -> Result<Arc<ClusterSpec>, EngineError> {
        self.spec.clone().ok_or(EngineError::InvalidState {
            operation,
            state: self.state,
        })
    }

    fn session(&self, index: usize) -> Result<Arc<C::Session>, EngineError> {
        self.sessions
            .get(index)
            .cloned()
            .ok_or(EngineError::InvalidState {
                operation: "use node session",
                state: self.state,
            })
    }

    /// Validate `spec` and make it the desired state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ConfigInvalid`] if validation fails; the engine
    /// keeps its previous state and specification.
    pub fn set_spec(&mut self, spec: ClusterSpec) -> Result<(), EngineError> {
        self.require("set spec", &[EngineState::Uninitialized, EngineState::SpecSet])?;
        spec.validate()?;

        let server_url = spec.api_server_url().ok_or_else(|| {
            ConfigError::Invalid(Violations(vec![Violation::NoControlPlane]))
        })?;
        debug!(
            server_url = %server_url,
            nodes = spec.nodes.len(),
            "Cluster specification accepted"
        );

        self.server_url = server_url;
        self.spec = Some(Arc::new(spec));
        self.state = EngineState::SpecSet;
        Ok(())
    }

    /// Open one session per node, through the proxy if one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Connect`] naming the first node (or the proxy)
    /// that could not be reached. Sessions opened up to that point are
    /// closed.
    pub async fn connect(&mut self) -> Result<(), EngineError> {
        self.require("connect", &[EngineState::SpecSet])?;
        let spec = self.spec("connect")?;

        let proxy = match spec.proxy() {
            Some(target) => {
                info!(host = %target.host, "Connecting to SSH proxy");
                let session = self.connector.open(target, None).await.map_err(|source| {
                    EngineError::Connect {
                        host: target.host.clone(),
                        source,
                    }
                })?;
                Some(session)
            }
            None => None,
        };

        let mut sessions = Vec::with_capacity(spec.nodes.len());
        for node in &spec.nodes {
            info!(host = %node.host(), role = %node.role, "Connecting to node");
            match self.connector.open(&node.ssh, proxy.as_ref()).await {
                Ok(session) => sessions.push(Arc::new(session)),
                Err(source) => {
                    close_quietly(&sessions, proxy.as_ref()).await;
                    return Err(EngineError::Connect {
                        host: node.host().to_string(),
                        source,
                    });
                }
            }
        }

        self.sessions = sessions;
        self.proxy = proxy;
        self.state = EngineState::Connected;
        Ok(())
    }

    /// Install k3s on every node.
    ///
    /// # Errors
    ///
    /// A control-plane failure aborts the installation and leaves the engine
    /// `Connected`. Worker failures are collected into
    /// [`EngineError::WorkersFailed`] once every worker task has finished;
    /// the engine is `Installed` in that case.
    pub async fn install(&mut self) -> Result<(), EngineError> {
        self.require("install", &[EngineState::Connected])?;
        let spec = self.spec("install")?;

        self.state = EngineState::Installing;
        let join = match self.install_control_planes(&spec).await {
            Ok(join) => join,
            Err(e) => {
                self.state = EngineState::Connected;
                return Err(e);
            }
        };
        self.join = Some(join.clone());

        let failures = self.install_workers(&spec, &join).await;
        self.state = EngineState::Installed;

        if failures.is_empty() {
            info!("Cluster installed");
            Ok(())
        } else {
            Err(EngineError::WorkersFailed(failures))
        }
    }

    async fn install_control_planes(
        &self,
        spec: &ClusterSpec,
    ) -> Result<JoinCredentials, EngineError> {
        let servers = spec.select_nodes(Role::Server);
        let cluster_init = servers.len() > 1;
        let mut join: Option<JoinCredentials> = None;

        for (position, NodeRef { index, node }) in servers.into_iter().enumerate() {
            let session = self.session(index)?;
            let mode = if position == 0 && cluster_init {
                "server --cluster-init"
            } else {
                "server"
            };
            let config = render_server_config(spec, node)?;
            let env = install_env(&spec.version, mode, join.as_ref());

            let span = info_span!("node", host = %node.host());
            let token = async {
                info!(role = %node.role, "Installing k3s server");
                provision(
                    &*session,
                    node.host(),
                    &self.installer,
                    &config,
                    &env,
                    &self.cleanup_pending,
                )
                .await?;
                read_token(&*session, node.host()).await
            }
            .instrument(span)
            .await?;

            match &join {
                None => {
                    join = Some(JoinCredentials {
                        url: self.server_url.clone(),
                        token,
                    });
                }
                Some(existing) if existing.token != token => {
                    warn!(
                        host = %node.host(),
                        "Join token differs from the first control-plane node"
                    );
                }
                Some(_) => {}
            }
        }

        join.ok_or(EngineError::InvalidState {
            operation: "install without control-plane nodes",
            state: self.state,
        })
    }

    async fn install_workers(&self, spec: &ClusterSpec, join: &JoinCredentials) -> NodeFailures {
        let mut failures = NodeFailures::default();
        let mut pending = BTreeSet::new();
        let mut set = JoinSet::new();

        for NodeRef { index, node } in spec.select_nodes(Role::Agent) {
            let host = node.host().to_string();
            let session = match self.session(index) {
                Ok(session) => session,
                Err(e) => {
                    failures.push(host, e);
                    continue;
                }
            };
            let config = match render_agent_config(spec, node) {
                Ok(config) => config,
                Err(e) => {
                    failures.push(host, e);
                    continue;
                }
            };
            let env = install_env(&spec.version, "agent", Some(join));
            let installer = Arc::clone(&self.installer);
            let cleanup = Arc::clone(&self.cleanup_pending);

            pending.insert(index);
            let span = info_span!("node", host = %host);
            set.spawn(
                async move {
                    info!("Installing k3s agent");
                    let result =
                        provision(&*session, &host, &installer, &config, &env, &cleanup).await;
                    if result.is_ok() {
                        info!("Worker installed");
                    }
                    (index, host, result)
                }
                .instrument(span),
            );
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, host, result)) => {
                    pending.remove(&index);
                    if let Err(e) = result {
                        error!(host = %host, error = %e, "Worker installation failed");
                        failures.push(host, e);
                    }
                }
                Err(e) => error!(error = %e, "Worker installation task failed to complete"),
            }
        }

        for index in pending {
            let host = spec.nodes[index].host().to_string();
            failures.push(
                host.clone(),
                EngineError::TaskAborted {
                    host,
                    reason: "task panicked or was cancelled".to_string(),
                },
            );
        }

        failures
    }

    /// Run the k3s uninstallation script on every node.
    ///
    /// # Errors
    ///
    /// Stops at the first node whose script fails; the error carries the
    /// node and the script's stderr.
    pub async fn uninstall(&mut self) -> Result<(), EngineError> {
        self.require("uninstall", &[EngineState::Connected, EngineState::Installed])?;
        let spec = self.spec("uninstall")?;

        for NodeRef { index, node } in spec.select_nodes(RoleSelector::Any) {
            let session = self.session(index)?;
            let script = match node.role {
                Role::Server => "k3s-uninstall.sh",
                Role::Agent => "k3s-agent-uninstall.sh",
            };

            async {
                info!(role = %node.role, "Uninstalling k3s");
                session
                    .exec(&Cmd::new(script).shell())
                    .await
                    .map_err(EngineError::remote(node.host(), Step::Uninstall))
            }
            .instrument(info_span!("node", host = %node.host()))
            .await?;
        }

        self.state = EngineState::Connected;
        Ok(())
    }

    /// Download the admin kubeconfig from the first control-plane node and
    /// merge it into the local file at `destination`.
    ///
    /// In machine mode the k3s entry names are kept; otherwise they are
    /// renamed after the API server host. Returns the resolved path.
    ///
    /// # Errors
    ///
    /// Returns an error if the download fails or the local file cannot be
    /// read, parsed or written.
    pub async fn kubeconfig(
        &self,
        destination: &str,
        machine_mode: bool,
    ) -> Result<PathBuf, EngineError> {
        self.require("fetch kubeconfig", &[EngineState::Connected, EngineState::Installed])?;
        let spec = self.spec("fetch kubeconfig")?;

        let NodeRef { index, node } = spec
            .select_nodes(Role::Server)
            .into_iter()
            .next()
            .ok_or(ConfigError::Invalid(Violations(vec![Violation::NoControlPlane])))?;
        let session = self.session(index)?;

        info!(host = %node.host(), "Downloading kubeconfig");
        let output = session
            .exec(&Cmd::new(format!("sudo cat {KUBECONFIG_PATH}")))
            .await
            .map_err(EngineError::remote(node.host(), Step::FetchKubeconfig))?;

        let mut fetched = kubeconfig::parse(&output.stdout_lossy())?;
        kubeconfig::rewrite(
            &mut fetched,
            &self.server_url,
            Naming::for_machine_mode(machine_mode),
        )?;

        let path = kubeconfig::resolve_path(destination)?;
        kubeconfig::reconcile(fetched, &path)?;
        Ok(path)
    }

    /// Remove temporary files from every node and close all sessions.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Disconnect`] listing every session that could
    /// not be closed. The engine is `Disconnected` either way.
    pub async fn disconnect(&mut self) -> Result<(), EngineError> {
        self.require(
            "disconnect",
            &[EngineState::Connected, EngineState::Installing, EngineState::Installed],
        )?;
        let spec = self.spec("disconnect")?;
        let cleanup = self.cleanup_pending();
        let mut failures = NodeFailures::default();

        for (node, session) in spec.nodes.iter().zip(std::mem::take(&mut self.sessions)) {
            let host = node.host();
            let span = info_span!("node", host = %host);
            async {
                if cleanup {
                    debug!("Removing temporary files");
                    if let Err(e) = session.exec(&Cmd::new(format!("rm -rf {WORK_DIR}"))).await {
                        warn!(error = %e, "Failed to remove temporary files");
                    }
                }
                if let Err(e) = session.disconnect().await {
                    failures.push(host, EngineError::remote(host, Step::Disconnect)(e));
                }
            }
            .instrument(span)
            .await;
        }

        if let Some(proxy) = self.proxy.take() {
            if let Err(e) = proxy.disconnect().await {
                let host = spec.proxy().map_or("proxy", |p| p.host.as_str());
                failures.push(host, EngineError::remote(host, Step::Disconnect)(e));
            }
        }

        self.state = EngineState::Disconnected;
        if failures.is_empty() {
            info!("Disconnected from all nodes");
            Ok(())
        } else {
            Err(EngineError::Disconnect(failures))
        }
    }
}

/// Close sessions after a failed connect, logging but otherwise ignoring
/// errors.
async fn close_quietly<S: RemoteSession>(sessions: &[Arc<S>], proxy: Option<&S>) {
    for session in sessions {
        if let Err(e) = session.disconnect().await {
            warn!(error = %e, "Failed to close session");
        }
    }
    if let Some(proxy) = proxy {
        if let Err(e) = proxy.disconnect().await {
            warn!(error = %e, "Failed to close proxy session");
        }
    }
}

/// Effective server settings of `node`. The advertise address defaults to
/// the node's SSH host.
fn server_settings(spec: &ClusterSpec, node: &NodeSpec) -> ServerSettings {
    let mut settings = spec.cluster.server.merge(&node.server);
    if settings.advertise_address.is_empty() {
        settings.advertise_address = node.host().to_string();
    }
    settings
}

fn agent_settings(spec: &ClusterSpec, node: &NodeSpec) -> AgentSettings {
    spec.cluster.agent.merge(&node.agent)
}

fn render_server_config(spec: &ClusterSpec, node: &NodeSpec) -> Result<String, EngineError> {
    Ok(serde_yaml::to_string(&server_settings(spec, node))?)
}

fn render_agent_config(spec: &ClusterSpec, node: &NodeSpec) -> Result<String, EngineError> {
    Ok(serde_yaml::to_string(&agent_settings(spec, node))?)
}

/// Environment of the installation script.
fn install_env(
    channel: &str,
    mode: &str,
    join: Option<&JoinCredentials>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        ("INSTALL_K3S_FORCE_RESTART".to_string(), "true".to_string()),
        ("INSTALL_K3S_EXEC".to_string(), mode.to_string()),
        ("INSTALL_K3S_CHANNEL".to_string(), channel.to_string()),
    ]);
    if let Some(join) = join {
        env.insert("K3S_URL".to_string(), join.url.clone());
        env.insert("K3S_TOKEN".to_string(), join.token.clone());
    }
    env
}

/// Upload the installer and the k3s configuration to a node, then run the
/// installer.
async fn provision<S: RemoteSession + ?Sized>(
    session: &S,
    host: &str,
    installer: &InstallerCache,
    config: &str,
    env: &BTreeMap<String, String>,
    cleanup_pending: &AtomicBool,
) -> Result<(), EngineError> {
    let script = installer.fetch().await?;

    cleanup_pending.store(true, Ordering::SeqCst);
    debug!("Uploading installer");
    session
        .upload(INSTALL_SCRIPT_PATH, &script)
        .await
        .map_err(EngineError::remote(host, Step::UploadInstaller))?;
    session
        .exec(&Cmd::new(format!("chmod +x {INSTALL_SCRIPT_PATH}")))
        .await
        .map_err(EngineError::remote(host, Step::UploadInstaller))?;

    debug!("Uploading k3s configuration");
    session
        .upload(CONFIG_UPLOAD_PATH, config.as_bytes())
        .await
        .map_err(EngineError::remote(host, Step::UploadConfig))?;
    session
        .exec(&Cmd::new(format!("sudo mkdir -m 755 -p {CONFIG_DIR}")))
        .await
        .map_err(EngineError::remote(host, Step::Configure))?;
    session
        .exec(
            &Cmd::new(format!(
                "sudo chown root:root {CONFIG_UPLOAD_PATH} && \
                 sudo chmod 644 {CONFIG_UPLOAD_PATH} && \
                 sudo mv {CONFIG_UPLOAD_PATH} {CONFIG_PATH}"
            ))
            .shell(),
        )
        .await
        .map_err(EngineError::remote(host, Step::Configure))?;

    info!("Running k3s installer");
    session
        .exec(&Cmd::new(INSTALL_SCRIPT_PATH).envs(env).log_output())
        .await
        .map_err(EngineError::remote(host, Step::Install))?;
    Ok(())
}

async fn read_token<S: RemoteSession + ?Sized>(
    session: &S,
    host: &str,
) -> Result<String, EngineError> {
    let output = session
        .exec(&Cmd::new(format!("sudo cat {TOKEN_PATH}")))
        .await
        .map_err(EngineError::remote(host, Step::ReadToken))?;
    Ok(output.stdout_lossy().trim().to_string())
}
