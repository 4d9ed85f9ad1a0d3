use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client;
use russh::ChannelMsg;
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::known_hosts::{HostKeyCheck, KnownHosts};
use super::{keys, shell_quote, CommandOutput, Connection, Connector, SshTarget};
use crate::config::{HostVerification, SshConfig};
use crate::error::{FleetError, Result};

/// How a connector decides whether to trust the key a host presents.
#[derive(Debug, Clone)]
pub enum HostVerifier {
    Strict(Arc<KnownHosts>),
    /// Accept anything. Only reachable through an explicit insecure config.
    AcceptAny,
}

/// russh-backed [`Connector`] authenticating with a single private key.
pub struct SshConnector {
    signer: Arc<KeyPair>,
    verifier: HostVerifier,
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new(signer: Arc<KeyPair>, verifier: HostVerifier) -> Self {
        Self {
            signer,
            verifier,
            config: Arc::new(client::Config::default()),
        }
    }

    /// Load the key and trust store named by `config`.
    pub async fn from_config(config: &SshConfig) -> Result<Self> {
        config.validate()?;
        let signer = keys::load_signer(&config.key_path).await?;
        let verifier = match config.host_verification {
            HostVerification::Strict => {
                HostVerifier::Strict(Arc::new(KnownHosts::open(&config.known_hosts_path).await?))
            }
            HostVerification::InsecureAcceptAny => {
                tracing::warn!("Host key verification is disabled");
                HostVerifier::AcceptAny
            }
        };
        Ok(Self::new(signer, verifier))
    }
}

enum Mode {
    Verify(HostVerifier),
    /// Record the presented key and abort the handshake.
    Capture,
}

struct Handler {
    host: String,
    port: u16,
    mode: Mode,
    verdict: Arc<Mutex<Option<HostKeyCheck>>>,
    presented: Arc<Mutex<Option<(String, String)>>>,
}

#[async_trait]
impl client::Handler for Handler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let key_type = key.name().to_string();
        let encoded = key.public_key_base64();
        *self.presented.lock() = Some((key_type.clone(), encoded.clone()));

        match &self.mode {
            Mode::Capture => Ok(false),
            Mode::Verify(HostVerifier::AcceptAny) => Ok(true),
            Mode::Verify(HostVerifier::Strict(store)) => {
                let check = store.check(&self.host, self.port, &key_type, &encoded);
                *self.verdict.lock() = Some(check);
                Ok(check == HostKeyCheck::Trusted)
            }
        }
    }
}

async fn handshake(
    config: Arc<client::Config>,
    target: &SshTarget,
    mode: Mode,
) -> (
    std::result::Result<client::Handle<Handler>, FleetError>,
    Option<HostKeyCheck>,
    Option<(String, String)>,
) {
    let addr = target.addr();
    let stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(e) => {
            let err = FleetError::Connect {
                addr,
                reason: e.to_string(),
            };
            return (Err(err), None, None);
        }
    };

    let verdict = Arc::new(Mutex::new(None));
    let presented = Arc::new(Mutex::new(None));
    let handler = Handler {
        host: target.host.clone(),
        port: target.port,
        mode,
        verdict: verdict.clone(),
        presented: presented.clone(),
    };

    let result = client::connect_stream(config, stream, handler)
        .await
        .map_err(|e| FleetError::Ssh(format!("handshake with {}: {}", addr, e)));
    let verdict = *verdict.lock();
    let presented = presented.lock().take();
    (result, verdict, presented)
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn Connection>> {
        let (handle, verdict, _) =
            handshake(self.config.clone(), target, Mode::Verify(self.verifier.clone())).await;

        let mut handle = match (handle, verdict) {
            (_, Some(HostKeyCheck::Mismatch)) => {
                return Err(FleetError::HostKeyMismatch {
                    host: target.addr(),
                })
            }
            (_, Some(HostKeyCheck::Unknown)) => {
                return Err(FleetError::UnknownHost {
                    host: target.addr(),
                })
            }
            (result, _) => result?,
        };

        let authenticated = handle
            .authenticate_publickey(&target.user, self.signer.clone())
            .await
            .map_err(|e| FleetError::Ssh(format!("authenticating to {}: {}", target.addr(), e)))?;
        if !authenticated {
            return Err(FleetError::AuthRejected {
                user: target.user.clone(),
            });
        }

        tracing::debug!(addr = %target.addr(), user = %target.user, "SSH session established");
        Ok(Box::new(SshConnection {
            handle,
            addr: target.addr(),
        }))
    }
}

/// Connect only far enough to read the host key `target` presents.
///
/// Returns `(key_type, base64)` for an explicit trust decision; nothing is recorded.
pub async fn fetch_host_key(target: &SshTarget, timeout: Duration) -> Result<(String, String)> {
    let config = Arc::new(client::Config::default());
    let (result, _, presented) =
        tokio::time::timeout(timeout, handshake(config, target, Mode::Capture))
            .await
            .map_err(|_| FleetError::Timeout(format!("reading host key of {}", target.addr())))?;
    match (presented, result) {
        (Some(key), _) => Ok(key),
        (None, Err(e)) => Err(e),
        (None, Ok(_)) => Err(FleetError::Internal(format!(
            "{} completed a handshake without presenting a key",
            target.addr()
        ))),
    }
}

struct SshConnection {
    handle: client::Handle<Handler>,
    addr: String,
}

impl SshConnection {
    fn ssh_err(&self, what: &str, e: russh::Error) -> FleetError {
        FleetError::Ssh(format!("{} on {}: {}", what, self.addr, e))
    }

    async fn open_exec(&mut self, command: &str) -> Result<russh::Channel<client::Msg>> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.ssh_err("open channel", e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| self.ssh_err("exec", e))?;
        Ok(channel)
    }
}

/// Drain a channel. Stdout goes to `out`; stderr is collected.
async fn collect(
    channel: &mut russh::Channel<client::Msg>,
    out: &mut (dyn AsyncWrite + Unpin + Send),
) -> Result<(u64, Vec<u8>, i32)> {
    let mut written = 0u64;
    let mut stderr = Vec::new();
    let mut exit_code = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                out.write_all(&data).await?;
                written += data.len() as u64;
            }
            ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                stderr.extend_from_slice(&data);
            }
            ChannelMsg::ExitStatus { exit_status } => {
                exit_code = Some(exit_status as i32);
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                let note = format!("killed by signal {:?}\n", signal_name);
                stderr.extend_from_slice(note.as_bytes());
                exit_code.get_or_insert(255);
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    let exit_code = exit_code
        .ok_or_else(|| FleetError::Ssh("channel closed without exit status".to_string()))?;
    Ok((written, stderr, exit_code))
}

#[async_trait]
impl Connection for SshConnection {
    async fn exec(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let mut channel = self.open_exec(command).await?;
        if let Some(input) = stdin {
            channel
                .data(input)
                .await
                .map_err(|e| self.ssh_err("write stdin", e))?;
        }
        channel.eof().await.map_err(|e| self.ssh_err("eof", e))?;

        let mut stdout = Vec::new();
        let (_, stderr, exit_code) = collect(&mut channel, &mut stdout).await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn write_file(
        &mut self,
        remote: &str,
        data: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64> {
        let mut channel = self
            .open_exec(&format!("cat > {}", shell_quote(remote)))
            .await?;

        let mut buf = vec![0u8; 32 * 1024];
        let mut sent = 0u64;
        loop {
            let n = data.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            channel
                .data(&buf[..n])
                .await
                .map_err(|e| self.ssh_err("write", e))?;
            sent += n as u64;
        }
        channel.eof().await.map_err(|e| self.ssh_err("eof", e))?;

        let (_, stderr, exit_code) = collect(&mut channel, &mut tokio::io::sink()).await?;
        if exit_code != 0 {
            return Err(FleetError::Ssh(format!(
                "writing {} on {} exited {}: {}",
                remote,
                self.addr,
                exit_code,
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        Ok(sent)
    }

    async fn read_file(
        &mut self,
        remote: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let mut channel = self.open_exec(&format!("cat {}", shell_quote(remote))).await?;
        channel.eof().await.map_err(|e| self.ssh_err("eof", e))?;

        let (read, stderr, exit_code) = collect(&mut channel, out).await?;
        if exit_code != 0 {
            return Err(FleetError::Ssh(format!(
                "reading {} on {} exited {}: {}",
                remote,
                self.addr,
                exit_code,
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        Ok(read)
    }

    async fn close(&mut self) -> Result<()> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| self.ssh_err("disconnect", e))
    }
}
