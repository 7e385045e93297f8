//! Remote execution sessions.
//!
//! The engine drives nodes exclusively through the [`RemoteSession`]
//! capability (run a command, upload a file, disconnect) and opens sessions
//! through a [`Connector`]. [`ssh`] provides the production implementation.

pub mod ssh;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ConnectionConfig;

pub use ssh::{SshConnector, SshSession};

/// Errors raised by a remote session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// SSH protocol or transport failure.
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Private key could not be loaded or decrypted.
    #[error("Key error: {0}")]
    Key(#[from] russh_keys::Error),

    /// Local I/O failure (e.g. reading a key file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Neither a key nor a password is configured.
    #[error("no authentication method specified")]
    NoAuthMethod,

    /// The server rejected the credentials.
    #[error("authentication failed for {user}@{host}")]
    AuthRejected { user: String, host: String },

    /// Session establishment did not finish in time.
    #[error("connection to {address} timed out after {secs}s")]
    Timeout { address: String, secs: u64 },

    /// The remote command exited unsuccessfully.
    #[error("command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: u32,
        stderr: String,
    },

    /// The remote side closed the channel without reporting an exit status.
    #[error("command `{command}` ended without exit status")]
    NoExitStatus { command: String },
}

/// What to do with the standard output of a remote command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Collect stdout into [`CommandOutput::stdout`].
    #[default]
    Capture,
    /// Emit every stdout line as a log record of the node.
    Log,
}

/// A command to run on a remote host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmd {
    /// Command line.
    pub command: String,
    /// Environment passed to the command.
    pub env: BTreeMap<String, String>,
    /// Run through `sh -c` even without environment.
    pub shell: bool,
    /// Payload written to the command's stdin.
    pub stdin: Option<Vec<u8>>,
    /// Handling of stdout.
    pub output: OutputMode,
}

impl Cmd {
    /// A plain command with captured output.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add several environment variables.
    #[must_use]
    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Run through a shell.
    #[must_use]
    pub fn shell(mut self) -> Self {
        self.shell = true;
        self
    }

    /// Feed `data` to stdin.
    #[must_use]
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Stream stdout to the log instead of capturing it.
    #[must_use]
    pub fn log_output(mut self) -> Self {
        self.output = OutputMode::Log;
        self
    }

    /// The command line as sent to the remote host.
    ///
    /// Environment is injected with `env K='v' sh -c '<command>'`, which
    /// requires no server-side `AcceptEnv` configuration.
    #[must_use]
    pub fn render(&self) -> String {
        let mut line = if self.shell || !self.env.is_empty() {
            format!("sh -c {}", shell_quote(&self.command))
        } else {
            self.command.clone()
        };

        if !self.env.is_empty() {
            let vars: Vec<String> = self
                .env
                .iter()
                .map(|(k, v)| format!("{k}={}", shell_quote(v)))
                .collect();
            line = format!("env {} {line}", vars.join(" "));
        }

        line
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)
    }
}

/// Quote `value` as a single POSIX shell word.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status reported by the remote side.
    pub status: u32,
    /// Captured stdout; empty for [`OutputMode::Log`].
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stdout as text, lossily decoded.
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr as text, lossily decoded and trimmed.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Turn a non-zero exit status into [`SessionError::CommandFailed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the command did not exit with status 0.
    pub fn check(self, cmd: &Cmd) -> Result<Self, SessionError> {
        if self.success() {
            Ok(self)
        } else {
            Err(SessionError::CommandFailed {
                command: cmd.command.clone(),
                status: self.status,
                stderr: self.stderr_lossy(),
            })
        }
    }
}

/// A live session to one remote host.
///
/// A session is owned by one node and is never used by two tasks at once.
#[async_trait]
pub trait RemoteSession: Send + Sync + 'static {
    /// Run a command and wait for it to exit. A non-zero exit status is
    /// reported in the output, not as an error.
    async fn run(&self, cmd: &Cmd) -> Result<CommandOutput, SessionError>;

    /// Write `contents` to `path` on the remote host, creating parent
    /// directories as needed.
    async fn upload(&self, path: &str, contents: &[u8]) -> Result<(), SessionError>;

    /// Close the session.
    async fn disconnect(&self) -> Result<(), SessionError>;

    /// Run a command and fail on a non-zero exit status.
    async fn exec(&self, cmd: &Cmd) -> Result<CommandOutput, SessionError> {
        self.run(cmd).await?.check(cmd)
    }
}

/// Opens sessions to hosts, optionally through an existing session acting
/// as bastion.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Session type produced by this connector.
    type Session: RemoteSession;

    /// Open a session to `target`. With `via`, the connection is tunneled
    /// through that session instead of dialing `target` directly.
    async fn open(
        &self,
        target: &ConnectionConfig,
        via: Option<&Self::Session>,
    ) -> Result<Self::Session, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_command_is_not_wrapped() {
        assert_eq!(Cmd::new("chmod +x /tmp/x").render(), "chmod +x /tmp/x");
    }

    #[test]
    fn test_shell_command_is_wrapped() {
        assert_eq!(
            Cmd::new("k3s-uninstall.sh").shell().render(),
            "sh -c 'k3s-uninstall.sh'"
        );
    }

    #[test]
    fn test_env_is_rendered_sorted_and_quoted() {
        let cmd = Cmd::new("/tmp/kestrel/install.sh")
            .env("K3S_URL", "https://10.0.0.1:6443")
            .env("INSTALL_K3S_EXEC", "server --cluster-init");

        assert_eq!(
            cmd.render(),
            "env INSTALL_K3S_EXEC='server --cluster-init' K3S_URL='https://10.0.0.1:6443' \
             sh -c '/tmp/kestrel/install.sh'"
        );
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_check_reports_stderr() {
        let cmd = Cmd::new("false");
        let output = CommandOutput {
            status: 1,
            stdout: Vec::new(),
            stderr: b"boom\n".to_vec(),
        };

        match output.check(&cmd) {
            Err(SessionError::CommandFailed {
                status, stderr, ..
            }) => {
                assert_eq!(status, 1);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
