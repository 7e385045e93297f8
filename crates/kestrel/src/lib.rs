//! Declarative k3s cluster provisioning over SSH.
//!
//! A cluster is described by a single YAML document listing its nodes, their
//! roles and the k3s settings to apply. The [`Engine`] connects to every
//! node (optionally through a bastion host), installs k3s on the
//! control-plane nodes one after another, joins the workers concurrently and
//! finally merges the cluster's admin credentials into a local kubeconfig.
//!
//! # Example
//!
//! ```rust,ignore
//! use kestrel::ops::{self, Options};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = Options::default().with_config("kestrel.yml");
//!     let kubeconfig = ops::up(&options).await?;
//!     println!("kubeconfig written to {}", kubeconfig.display());
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod engine;
pub mod installer;
pub mod kubeconfig;
pub mod ops;
pub mod session;
pub mod settings;

pub use config::{ClusterSpec, ConfigError, ConnectionConfig, NodeSpec, Role, RoleSelector};
pub use engine::{Engine, EngineError, EngineState};
pub use installer::{FetchError, InstallerCache};
pub use kubeconfig::{CredentialError, Kubeconfig};
pub use session::{Cmd, CommandOutput, Connector, RemoteSession, SessionError};
pub use settings::{AgentSettings, Merge, ServerSettings};
