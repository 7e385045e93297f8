//! Cluster configuration model.
//!
//! This module defines the desired state of a cluster as read from the
//! `kestrel.yml` document, together with its validation rules.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::settings::{AgentSettings, ServerSettings};

/// Release channels accepted as `version`.
pub const CHANNELS: [&str; 3] = ["stable", "latest", "testing"];

/// Default port of the Kubernetes API served by k3s.
pub const DEFAULT_API_PORT: u16 = 6443;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default SSH user.
pub const DEFAULT_SSH_USER: &str = "root";

/// Expand a leading `~` to the home directory of the invoking user.
///
/// Returns `None` when the path needs a home directory that cannot be
/// determined.
#[must_use]
pub fn expand_home(path: &str) -> Option<PathBuf> {
    match path.strip_prefix('~') {
        Some(rest) => dirs::home_dir().map(|home| home.join(rest.trim_start_matches('/'))),
        None => Some(PathBuf::from(path)),
    }
}

/// Errors raised while loading or validating the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The document is empty.
    #[error("configuration empty")]
    Empty,

    /// The configuration file could not be read.
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    /// The document is not valid YAML or has the wrong shape.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// One or more validation rules are violated.
    #[error("config invalid: {0}")]
    Invalid(Violations),
}

/// A single violated validation rule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// `version` is not a supported release channel.
    #[error("unsupported version {version:?}, must be one of: stable, latest, testing")]
    UnsupportedVersion { version: String },

    /// `nodes` is empty.
    #[error("no nodes specified")]
    NoNodes,

    /// No node has the server role.
    #[error("no control-plane nodes specified")]
    NoControlPlane,

    /// An even number of control-plane nodes cannot maintain quorum.
    #[error("control-plane node count must be odd to maintain quorum, got {count}")]
    EvenControlPlanes { count: usize },
}

/// Ordered list of violations, reported together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violations(pub Vec<Violation>);

impl Violations {
    /// The first violated rule.
    #[must_use]
    pub fn first(&self) -> Option<&Violation> {
        self.0.first()
    }

    /// Whether `violation` is among the violated rules.
    #[must_use]
    pub fn contains(&self, violation: &Violation) -> bool {
        self.0.contains(violation)
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Control-plane node running the k3s server.
    Server,
    /// Worker node running the k3s agent.
    Agent,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

/// Node selector. `Any` is a query wildcard and never a stored role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleSelector {
    /// Match every node.
    Any,
    /// Match nodes with exactly this role.
    Only(Role),
}

impl RoleSelector {
    /// Whether a node with `role` is selected.
    #[must_use]
    pub fn matches(self, role: Role) -> bool {
        match self {
            Self::Any => true,
            Self::Only(wanted) => wanted == role,
        }
    }
}

impl From<Role> for RoleSelector {
    fn from(role: Role) -> Self {
        Self::Only(role)
    }
}

/// SSH connection settings of a node or of the bastion host.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectionConfig {
    /// Host name or address.
    #[serde(default)]
    pub host: String,
    /// Port, 22 when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Login user, `root` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password for password authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Inline private key (PEM/OpenSSH). Takes precedence over `key-file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Path to a private key file; a leading `~` is expanded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    /// Passphrase of an encrypted private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Expected `SHA256:` host key fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl ConnectionConfig {
    /// Configured port or the SSH default.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.filter(|p| *p != 0).unwrap_or(DEFAULT_SSH_PORT)
    }

    /// Configured user or `root`.
    #[must_use]
    pub fn user(&self) -> &str {
        self.user
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_SSH_USER)
    }

    /// `host:port` address of the target.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }
}

// Credentials never end up in logs.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &redact(&self.password))
            .field("key", &redact(&self.key))
            .field("key_file", &self.key_file)
            .field("passphrase", &redact(&self.passphrase))
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Settings shared by every node of a role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Shared control-plane settings.
    #[serde(default)]
    pub server: ServerSettings,
    /// Shared worker settings.
    #[serde(default)]
    pub agent: AgentSettings,
}

/// One target machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Role of the node.
    pub role: Role,
    /// How to reach the node.
    pub ssh: ConnectionConfig,
    /// Node-specific server settings; only meaningful for servers.
    #[serde(default)]
    pub server: ServerSettings,
    /// Node-specific agent settings; only meaningful for agents.
    #[serde(default)]
    pub agent: AgentSettings,
}

impl NodeSpec {
    /// Host of the node, used to identify it in logs and errors.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.ssh.host
    }
}

/// Stable reference to a node inside a [`ClusterSpec`].
#[derive(Debug, Clone, Copy)]
pub struct NodeRef<'a> {
    /// Position of the node in `nodes`.
    pub index: usize,
    /// The node itself.
    pub node: &'a NodeSpec,
}

/// Desired state of a k3s cluster.
///
/// See <https://docs.k3s.io/installation/configuration> for the meaning of
/// the settings carried by the fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Release channel to install.
    #[serde(default)]
    pub version: String,

    /// Settings shared among all nodes.
    #[serde(default)]
    pub cluster: ClusterSettings,

    /// Nodes to deploy the cluster on, with connection information and
    /// node-specific settings.
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,

    /// Optional bastion host all node connections are tunneled through.
    #[serde(default, rename = "ssh-proxy", skip_serializing_if = "Option::is_none")]
    pub ssh_proxy: Option<ConnectionConfig>,
}

impl ClusterSpec {
    /// Parse a cluster document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Empty`] for an empty document and
    /// [`ConfigError::Parse`] when the YAML does not match the model.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Err(ConfigError::Empty);
        }

        let value: serde_yaml::Value = serde_yaml::from_str(contents)?;
        if value.is_null() {
            return Err(ConfigError::Empty);
        }

        Ok(serde_yaml::from_value(value)?)
    }

    /// Read and parse a cluster document from disk. No validation is done.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "Loading cluster configuration");

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_yaml(&contents)
    }

    /// Check every validation rule, in order, and report all violations.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing every violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();

        if !CHANNELS.contains(&self.version.as_str()) {
            violations.push(Violation::UnsupportedVersion {
                version: self.version.clone(),
            });
        }

        if self.nodes.is_empty() {
            violations.push(Violation::NoNodes);
        }

        let control_planes = self.control_plane_count();
        if control_planes == 0 {
            violations.push(Violation::NoControlPlane);
        } else if control_planes % 2 == 0 {
            violations.push(Violation::EvenControlPlanes {
                count: control_planes,
            });
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(Violations(violations)))
        }
    }

    /// Number of control-plane nodes.
    #[must_use]
    pub fn control_plane_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.role == Role::Server).count()
    }

    /// Nodes matching `selector`, in configuration order.
    #[must_use]
    pub fn select_nodes(&self, selector: impl Into<RoleSelector>) -> Vec<NodeRef<'_>> {
        let selector = selector.into();
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| selector.matches(node.role))
            .map(|(index, node)| NodeRef { index, node })
            .collect()
    }

    /// The bastion host, if one with a host is configured.
    #[must_use]
    pub fn proxy(&self) -> Option<&ConnectionConfig> {
        self.ssh_proxy.as_ref().filter(|p| !p.host.is_empty())
    }

    /// URL under which the Kubernetes API of the cluster is advertised.
    ///
    /// The host is the first TLS SAN if any, else the first control-plane
    /// host. The port is `advertise-port`, else `https-listen-port`, else
    /// 6443. Returns `None` without control-plane nodes.
    #[must_use]
    pub fn api_server_url(&self) -> Option<String> {
        let server = &self.cluster.server;

        let port = [server.advertise_port, server.https_listen_port]
            .into_iter()
            .find(|p| *p != 0)
            .unwrap_or(DEFAULT_API_PORT);

        let host = match server.tls_san.first() {
            Some(san) => san.as_str(),
            None => self.select_nodes(Role::Server).first()?.node.host(),
        };

        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };

        Some(format!("https://{host}:{port}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(role: Role, host: &str) -> NodeSpec {
        NodeSpec {
            role,
            ssh: ConnectionConfig {
                host: host.into(),
                ..Default::default()
            },
            server: ServerSettings::default(),
            agent: AgentSettings::default(),
        }
    }

    fn spec_with(servers: usize, agents: usize) -> ClusterSpec {
        let mut nodes = Vec::new();
        for i in 0..servers {
            nodes.push(node(Role::Server, &format!("10.0.0.{}", i + 1)));
        }
        for i in 0..agents {
            nodes.push(node(Role::Agent, &format!("10.0.1.{}", i + 1)));
        }
        ClusterSpec {
            version: "stable".into(),
            nodes,
            ..Default::default()
        }
    }

    fn violations(spec: &ClusterSpec) -> Vec<Violation> {
        match spec.validate() {
            Err(ConfigError::Invalid(v)) => v.0,
            Err(e) => panic!("unexpected error: {e}"),
            Ok(()) => Vec::new(),
        }
    }

    #[test]
    fn test_odd_control_plane_counts_are_valid() {
        for count in [1, 3, 5] {
            assert!(spec_with(count, 2).validate().is_ok(), "count {count}");
        }
    }

    #[test]
    fn test_even_control_plane_counts_are_rejected() {
        for count in [2, 4, 6] {
            assert_eq!(
                violations(&spec_with(count, 1)),
                vec![Violation::EvenControlPlanes { count }]
            );
        }
    }

    #[test]
    fn test_no_nodes_reports_all_violations_in_order() {
        let spec = ClusterSpec {
            version: "v1.29".into(),
            ..Default::default()
        };

        assert_eq!(
            violations(&spec),
            vec![
                Violation::UnsupportedVersion {
                    version: "v1.29".into()
                },
                Violation::NoNodes,
                Violation::NoControlPlane,
            ]
        );
    }

    #[test]
    fn test_workers_only_is_rejected() {
        assert_eq!(violations(&spec_with(0, 3)), vec![Violation::NoControlPlane]);
    }

    #[test]
    fn test_all_channels_accepted() {
        for channel in CHANNELS {
            let mut spec = spec_with(1, 0);
            spec.version = channel.into();
            assert!(spec.validate().is_ok());
        }
    }

    #[test]
    fn test_select_nodes_preserves_order_and_indices() {
        let mut spec = spec_with(1, 2);
        spec.nodes.insert(1, node(Role::Server, "10.0.0.9"));

        let servers = spec.select_nodes(Role::Server);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].node.host(), "10.0.0.1");
        assert_eq!(servers[1].index, 1);

        let agents = spec.select_nodes(Role::Agent);
        assert_eq!(
            agents.iter().map(|n| n.index).collect::<Vec<_>>(),
            vec![2, 3]
        );

        let all = spec.select_nodes(RoleSelector::Any);
        assert_eq!(all.len(), 4);
        assert!(std::ptr::eq(all[3].node, &spec.nodes[3]));
    }

    #[test]
    fn test_api_server_url_defaults_to_first_control_plane() {
        let spec = spec_with(3, 1);
        assert_eq!(
            spec.api_server_url().as_deref(),
            Some("https://10.0.0.1:6443")
        );
    }

    #[test]
    fn test_api_server_url_prefers_tls_san_and_advertise_port() {
        let mut spec = spec_with(1, 0);
        spec.cluster.server.tls_san = vec!["k8s.example.com".into(), "other".into()];
        spec.cluster.server.https_listen_port = 7443;
        assert_eq!(
            spec.api_server_url().as_deref(),
            Some("https://k8s.example.com:7443")
        );

        spec.cluster.server.advertise_port = 8443;
        assert_eq!(
            spec.api_server_url().as_deref(),
            Some("https://k8s.example.com:8443")
        );
    }

    #[test]
    fn test_api_server_url_brackets_ipv6() {
        let mut spec = spec_with(0, 0);
        spec.nodes.push(node(Role::Server, "fd00::1"));
        assert_eq!(
            spec.api_server_url().as_deref(),
            Some("https://[fd00::1]:6443")
        );
    }

    #[test]
    fn test_parse_document() {
        let yaml = r"
version: stable
cluster:
  server:
    tls-san:
      - k8s.example.com
    disable:
      - traefik
  agent:
    node-label:
      - tier=shared
nodes:
  - role: server
    ssh:
      host: 10.0.0.1
      user: ubuntu
      key-file: ~/.ssh/id_ed25519
      fingerprint: SHA256:abc
    server:
      node-label:
        - zone=a
  - role: agent
    ssh:
      host: 10.0.0.2
      port: 2222
      password: hunter2
ssh-proxy:
  host: bastion.example.com
  user: jump
";

        let spec = ClusterSpec::from_yaml(yaml).unwrap();
        assert!(spec.validate().is_ok());
        assert_eq!(spec.cluster.server.tls_san, vec!["k8s.example.com"]);
        assert_eq!(spec.cluster.agent.node_label, vec!["tier=shared"]);
        assert_eq!(spec.nodes[0].ssh.user(), "ubuntu");
        assert_eq!(spec.nodes[0].ssh.key_file.as_deref(), Some("~/.ssh/id_ed25519"));
        assert_eq!(spec.nodes[0].server.node_label, vec!["zone=a"]);
        assert_eq!(spec.nodes[1].role, Role::Agent);
        assert_eq!(spec.nodes[1].ssh.address(), "10.0.0.2:2222");
        assert_eq!(spec.proxy().map(|p| p.host.as_str()), Some("bastion.example.com"));
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let yaml = "version: latest\nnodes:\n  - role: worker\n    ssh: {host: a}\n";
        let err = ClusterSpec::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("unknown variant `worker`"), "{err}");
    }

    #[test]
    fn test_empty_document_is_rejected() {
        assert!(matches!(ClusterSpec::from_yaml(""), Err(ConfigError::Empty)));
        assert!(matches!(ClusterSpec::from_yaml("~\n"), Err(ConfigError::Empty)));
    }

    #[test]
    fn test_proxy_without_host_is_ignored() {
        let spec = ClusterSpec::from_yaml("version: stable\nssh-proxy:\n  user: jump\n").unwrap();
        assert!(spec.proxy().is_none());
    }

    #[test]
    fn test_expand_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_home("~/.kube/config"), Some(home.join(".kube/config")));
        assert_eq!(expand_home("~"), Some(home));
        assert_eq!(
            expand_home("/etc/kestrel.yml"),
            Some(PathBuf::from("/etc/kestrel.yml"))
        );
    }

    #[test]
    fn test_connection_defaults() {
        let conn = ConnectionConfig {
            host: "example.com".into(),
            ..Default::default()
        };
        assert_eq!(conn.port(), 22);
        assert_eq!(conn.user(), "root");
        assert_eq!(conn.address(), "example.com:22");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let conn = ConnectionConfig {
            host: "example.com".into(),
            password: Some("hunter2".into()),
            key: Some("-----BEGIN".into()),
            ..Default::default()
        };
        let debug = format!("{conn:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("BEGIN"));
        assert!(debug.contains("<redacted>"));
    }
}
