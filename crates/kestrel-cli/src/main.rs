//! kestrel CLI.
//!
//! Installs, removes and connects to k3s clusters described by a YAML
//! document, driving every node over SSH.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use kestrel::ops::{self, Options};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;
mod ui;

use commands::down::DownCommand;
use commands::kubeconfig::KubeconfigCommand;
use commands::up::UpCommand;

/// kestrel - declarative k3s clusters over SSH.
#[derive(Parser)]
#[command(
    name = "kestrel",
    version,
    about = "Declarative k3s cluster provisioning over SSH",
    long_about = "Install and remove k3s clusters described by a YAML document.\n\n\
                  Every node is reached over SSH, optionally through a bastion host.\n\
                  All operations are idempotent - re-running the same command\n\
                  converges the cluster to the described state."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by all subcommands.
#[derive(Args)]
pub struct GlobalArgs {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// SSH connection timeout in seconds.
    #[arg(long, global = true, default_value = "5")]
    timeout: u64,

    /// Use a local copy of the k3s installation script instead of
    /// downloading it.
    #[arg(long, global = true, value_name = "PATH")]
    installer_script: Option<PathBuf>,
}

impl GlobalArgs {
    /// Operation options for the cluster document at `config`.
    pub fn options(&self, config: PathBuf) -> Options {
        let mut options = Options::default()
            .with_config(config)
            .with_timeout(Duration::from_secs(self.timeout))
            .with_machine_mode(ops::machine_mode_from_env());
        if let Some(script) = &self.installer_script {
            options = options.with_installer_script(script);
        }
        debug!(?options, "Resolved options");
        options
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Install or upgrade the cluster.
    ///
    /// Installs k3s on every node and merges the cluster credentials into
    /// the local kubeconfig.
    Up(UpCommand),

    /// Uninstall k3s from every node of the cluster.
    Down(DownCommand),

    /// Merge the cluster credentials into the local kubeconfig.
    Kubeconfig(KubeconfigCommand),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.global.verbose {
        EnvFilter::new("info,kestrel=debug,kestrel_cli=debug")
    } else {
        EnvFilter::new("warn,kestrel=info,kestrel_cli=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        ui::print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Up(cmd) => cmd.run(&cli.global).await,
        Commands::Down(cmd) => cmd.run(&cli.global).await,
        Commands::Kubeconfig(cmd) => cmd.run(&cli.global).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["kestrel", "up"]).unwrap();
        assert!(!cli.global.verbose);
        assert_eq!(cli.global.timeout, 5);
        match cli.command {
            Commands::Up(cmd) => assert_eq!(cmd.config, PathBuf::from("kestrel.yml")),
            _ => panic!("expected up"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "kestrel",
            "kubeconfig",
            "cluster.yml",
            "--output",
            "/tmp/config",
            "--timeout",
            "30",
            "--installer-script",
            "install.sh",
            "-v",
        ])
        .unwrap();

        assert!(cli.global.verbose);
        let options = cli.global.options(PathBuf::from("cluster.yml"));
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert_eq!(options.installer_script, Some(PathBuf::from("install.sh")));
        match cli.command {
            Commands::Kubeconfig(cmd) => assert_eq!(cmd.output, "/tmp/config"),
            _ => panic!("expected kubeconfig"),
        }
    }
}
