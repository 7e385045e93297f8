//! Down command - remove a cluster.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use kestrel::ops::{self, DEFAULT_CONFIG_PATH};

use crate::{ui, GlobalArgs};

/// Uninstall k3s from every node.
#[derive(Args)]
pub struct DownCommand {
    /// Cluster configuration file.
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

impl DownCommand {
    /// Run the down command.
    ///
    /// # Errors
    ///
    /// Returns an error if any node fails to uninstall.
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        ui::print_step(&format!("Tearing down cluster from {}", self.config.display()));
        ui::print_warning("All workloads and cluster data on the nodes will be removed");

        ops::down(&global.options(self.config.clone()))
            .await
            .context("Failed to tear down cluster")?;

        ui::print_success("Cluster is down");
        Ok(())
    }
}
