//! SSH implementation of [`RemoteSession`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Cmd, CommandOutput, Connector, OutputMode, RemoteSession, SessionError};
use crate::config::{expand_home, ConnectionConfig};

/// Default timeout for session establishment.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Host key verification for one connection.
struct HostKeyPolicy {
    host: String,
    fingerprint: Option<String>,
}

#[async_trait]
impl client::Handler for HostKeyPolicy {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(expected) = &self.fingerprint else {
            return Ok(true);
        };

        let actual = server_public_key.fingerprint();
        let expected = expected.strip_prefix("SHA256:").unwrap_or(expected);
        if expected == actual {
            Ok(true)
        } else {
            warn!(
                host = %self.host,
                fingerprint = %format!("SHA256:{actual}"),
                "Host key fingerprint mismatch"
            );
            Ok(false)
        }
    }
}

/// Opens [`SshSession`]s.
#[derive(Debug, Clone)]
pub struct SshConnector {
    timeout: Duration,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl SshConnector {
    /// Create a connector with the given session establishment timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client_config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        })
    }

    async fn handshake(
        &self,
        target: &ConnectionConfig,
        via: Option<&SshSession>,
    ) -> Result<Handle<HostKeyPolicy>, SessionError> {
        let policy = HostKeyPolicy {
            host: target.host.clone(),
            fingerprint: target.fingerprint.clone().filter(|f| !f.is_empty()),
        };
        if policy.fingerprint.is_none() {
            warn!(host = %target.host, "Skipping host key verification is insecure!");
            warn!(host = %target.host, "This allows for person-in-the-middle attacks!");
            warn!(host = %target.host, "Please consider using fingerprint verification!");
        }

        let config = self.client_config();
        match via {
            Some(proxy) => {
                debug!(
                    target = %target.address(),
                    proxy = %proxy.host,
                    "Opening tunnel through proxy"
                );
                let channel = proxy
                    .handle
                    .channel_open_direct_tcpip(
                        target.host.clone(),
                        u32::from(target.port()),
                        "127.0.0.1",
                        0,
                    )
                    .await?;
                Ok(client::connect_stream(config, channel.into_stream(), policy).await?)
            }
            None => {
                let address = (target.host.as_str(), target.port());
                Ok(client::connect(config, address, policy).await?)
            }
        }
    }

    async fn authenticate(
        handle: &mut Handle<HostKeyPolicy>,
        target: &ConnectionConfig,
    ) -> Result<(), SessionError> {
        let user = target.user();

        let accepted = if let Some(key) = load_key(target)? {
            handle.authenticate_publickey(user, Arc::new(key)).await?
        } else if let Some(password) = target.password.as_deref().filter(|p| !p.is_empty()) {
            warn!(host = %target.host, "Using password authentication is insecure!");
            warn!(host = %target.host, "Please consider using public key authentication!");
            handle.authenticate_password(user, password).await?
        } else {
            return Err(SessionError::NoAuthMethod);
        };

        if accepted {
            Ok(())
        } else {
            Err(SessionError::AuthRejected {
                user: user.to_string(),
                host: target.host.clone(),
            })
        }
    }
}

/// Load the private key of `target`. An inline key takes precedence over a
/// key file.
fn load_key(target: &ConnectionConfig) -> Result<Option<KeyPair>, SessionError> {
    let inline = target.key.clone().filter(|k| !k.is_empty());
    let key = match (inline, target.key_file.as_deref().filter(|f| !f.is_empty())) {
        (Some(key), _) => key,
        (None, Some(path)) => {
            let path = expand_home(path).ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "home directory not found")
            })?;
            std::fs::read_to_string(path)?
        }
        (None, None) => return Ok(None),
    };

    let passphrase = target.passphrase.as_deref().filter(|p| !p.is_empty());
    Ok(Some(russh_keys::decode_secret_key(&key, passphrase)?))
}

#[async_trait]
impl Connector for SshConnector {
    type Session = SshSession;

    async fn open(
        &self,
        target: &ConnectionConfig,
        via: Option<&SshSession>,
    ) -> Result<SshSession, SessionError> {
        let address = target.address();
        let connect = async {
            let mut handle = self.handshake(target, via).await?;
            Self::authenticate(&mut handle, target).await?;
            Ok::<_, SessionError>(handle)
        };

        let handle = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| SessionError::Timeout {
                address: address.clone(),
                secs: self.timeout.as_secs(),
            })??;

        debug!(address = %address, "SSH session established");
        Ok(SshSession {
            host: target.host.clone(),
            handle,
            closed: Mutex::new(false),
        })
    }
}

/// An authenticated SSH session to one host.
pub struct SshSession {
    host: String,
    handle: Handle<HostKeyPolicy>,
    closed: Mutex<bool>,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession").field("host", &self.host).finish()
    }
}

/// Splits streamed stdout into lines and logs each complete line.
struct LineLogger<'a> {
    host: &'a str,
    pending: Vec<u8>,
}

impl<'a> LineLogger<'a> {
    fn new(host: &'a str) -> Self {
        Self {
            host,
            pending: Vec::new(),
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&line);
        }
    }

    fn finish(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line);
        }
    }

    fn emit(&self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end();
        if !line.is_empty() {
            info!(target: "kestrel::remote", host = %self.host, "{line}");
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&self, cmd: &Cmd) -> Result<CommandOutput, SessionError> {
        let line = cmd.render();
        debug!(host = %self.host, command = %cmd.command, "Running remote command");

        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, line.as_str()).await?;

        if let Some(stdin) = &cmd.stdin {
            channel.data(stdin.as_slice()).await?;
        }
        channel.eof().await?;

        let mut output = CommandOutput::default();
        let mut status = None;
        let mut logger = LineLogger::new(&self.host);

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => match cmd.output {
                    OutputMode::Capture => output.stdout.extend_from_slice(data),
                    OutputMode::Log => logger.push(data),
                },
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    output.stderr.extend_from_slice(data);
                }
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                _ => {}
            }
        }
        logger.finish();

        output.status = status.ok_or_else(|| SessionError::NoExitStatus {
            command: cmd.command.clone(),
        })?;
        Ok(output)
    }

    async fn upload(&self, path: &str, contents: &[u8]) -> Result<(), SessionError> {
        debug!(host = %self.host, path, bytes = contents.len(), "Uploading file");

        let quoted = super::shell_quote(path);
        let script = match path.rsplit_once('/') {
            Some((parent, _)) if !parent.is_empty() => {
                format!("mkdir -p {} && cat > {quoted}", super::shell_quote(parent))
            }
            _ => format!("cat > {quoted}"),
        };

        let cmd = Cmd::new(script).shell().stdin(contents);
        self.exec(&cmd).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Ok(());
        }

        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        *closed = true;
        debug!(host = %self.host, "SSH session closed");
        Ok(())
    }
}
