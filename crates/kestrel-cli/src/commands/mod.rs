//! Subcommands.

pub mod down;
pub mod kubeconfig;
pub mod up;
