//! Kubeconfig command - fetch cluster credentials.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use kestrel::ops::{self, DEFAULT_CONFIG_PATH, DEFAULT_KUBECONFIG_PATH};

use crate::{ui, GlobalArgs};

/// Merge the admin credentials of the cluster into a local kubeconfig.
#[derive(Args)]
pub struct KubeconfigCommand {
    /// Cluster configuration file.
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Kubeconfig to merge the cluster credentials into.
    #[arg(short, long, default_value = DEFAULT_KUBECONFIG_PATH)]
    pub output: String,
}

impl KubeconfigCommand {
    /// Run the kubeconfig command.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials cannot be fetched or written.
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        let options = global
            .options(self.config.clone())
            .with_kubeconfig(&self.output);
        let path = ops::kubeconfig(&options)
            .await
            .context("Failed to fetch kubeconfig")?;

        ui::print_success(&format!("Kubeconfig written to {}", path.display()));
        Ok(())
    }
}
