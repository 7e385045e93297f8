//! Up command - install or upgrade a cluster.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use kestrel::ops::{self, DEFAULT_CONFIG_PATH, DEFAULT_KUBECONFIG_PATH};

use crate::{ui, GlobalArgs};

/// Install k3s on every node and write the kubeconfig.
#[derive(Args)]
pub struct UpCommand {
    /// Cluster configuration file.
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Kubeconfig to merge the cluster credentials into.
    #[arg(short, long, default_value = DEFAULT_KUBECONFIG_PATH)]
    pub output: String,
}

impl UpCommand {
    /// Run the up command.
    ///
    /// # Errors
    ///
    /// Returns an error if any node fails to install.
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        ui::print_step(&format!("Bringing up cluster from {}", self.config.display()));

        let options = global
            .options(self.config.clone())
            .with_kubeconfig(&self.output);
        let kubeconfig = ops::up(&options)
            .await
            .context("Failed to bring up cluster")?;

        ui::print_success("Cluster is up");
        ui::print_kv("Kubeconfig", &kubeconfig.display().to_string());
        Ok(())
    }
}
