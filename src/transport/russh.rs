//! russh 기반 SSH 세션
//!
//! 호스트키 검사는 핸드셰이크 콜백에서 `check_host_key`로 수행하므로
//! strict 불일치는 인증 전에 연결을 끊습니다.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::russh::client::{self, Handle, Msg};
use ::russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use ::russh::{Channel, ChannelMsg, Disconnect};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{check_host_key, ExecStream, OutputChunk, SshTransport, TransportFactory};
use crate::error::{Result, VaultError};
use crate::models::{HostPin, Timeouts};
use crate::verifier::HostKeyVerifier;

/// 핸드셰이크에서 검사한 결과
type HostKeyOutcome = Arc<Mutex<Option<Result<HostPin>>>>;

struct ClientHandler {
    verifier: Arc<dyn HostKeyVerifier>,
    expected: Option<HostPin>,
    strict_host_key: bool,
    outcome: HostKeyOutcome,
}

impl client::Handler for ClientHandler {
    type Error = ::russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &::russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let checked = match server_public_key.to_bytes() {
            Ok(wire) => check_host_key(
                self.verifier.as_ref(),
                &wire,
                self.expected.as_ref(),
                self.strict_host_key,
            ),
            Err(e) => Err(VaultError::InvalidKeyFormat(format!("host key: {}", e))),
        };
        let accepted = checked.is_ok();
        *self.outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some(checked);
        Ok(accepted)
    }
}

fn transport_err(e: ::russh::Error) -> VaultError {
    VaultError::Transport(e.to_string())
}

pub struct RusshTransport {
    verifier: Arc<dyn HostKeyVerifier>,
    handle: tokio::sync::Mutex<Option<Handle<ClientHandler>>>,
    exit_status: tokio::sync::Mutex<Option<oneshot::Receiver<i32>>>,
    cancel: CancellationToken,
}

impl RusshTransport {
    pub fn new(verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self {
            verifier,
            handle: tokio::sync::Mutex::new(None),
            exit_status: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }
}

/// 채널 메시지를 출력 스트림과 종료 코드로 분배
///
/// 소비자가 출력을 다 읽어야 종료 상태까지 도달합니다.
async fn pump(
    mut channel: Channel<Msg>,
    tx: mpsc::Sender<OutputChunk>,
    exit_tx: oneshot::Sender<i32>,
    cancel: CancellationToken,
) {
    let mut exit_tx = Some(exit_tx);
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = channel.close().await;
                break;
            }
            msg = channel.wait() => msg,
        };

        match msg {
            Some(ChannelMsg::Data { data }) => {
                let _ = tx.send(OutputChunk::stdout(data.to_vec())).await;
            }
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                let _ = tx.send(OutputChunk::stderr(data.to_vec())).await;
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                if let Some(exit_tx) = exit_tx.take() {
                    let _ = exit_tx.send(exit_status as i32);
                }
            }
            Some(_) => {}
            None => break,
        }
    }
}

#[async_trait]
impl SshTransport for RusshTransport {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeouts: &Timeouts,
        expected_pin: Option<&HostPin>,
        strict_host_key: bool,
    ) -> Result<HostPin> {
        let outcome: HostKeyOutcome = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            verifier: self.verifier.clone(),
            expected: expected_pin.cloned(),
            strict_host_key,
            outcome: outcome.clone(),
        };
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_millis(timeouts.read_ms)),
            ..Default::default()
        });

        let connecting = client::connect(config, (host.to_string(), port), handler);
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return Err(VaultError::Cancelled),
            r = tokio::time::timeout(Duration::from_millis(timeouts.connect_ms), connecting) => r,
        };

        let checked = outcome.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = match connected {
            Err(_) => return Err(VaultError::ConnectionTimeout(timeouts.connect_ms)),
            Ok(Err(e)) => {
                // 호스트키 거부가 원인이면 그 오류를 그대로 전달
                return Err(match checked {
                    Some(Err(host_err)) => host_err,
                    _ => transport_err(e),
                });
            }
            Ok(Ok(handle)) => handle,
        };

        let pin = match checked {
            Some(result) => result?,
            None => {
                return Err(VaultError::Transport(
                    "server host key was never presented".to_string(),
                ))
            }
        };

        *self.handle.lock().await = Some(handle);
        debug!(host, port, pin = %pin, "ssh session established");
        Ok(pin)
    }

    async fn auth_username_password(&self, username: &str, password: &str) -> Result<()> {
        let mut guard = self.handle.lock().await;
        let handle = guard
            .as_mut()
            .ok_or_else(|| VaultError::Transport("not connected".to_string()))?;

        let result = handle
            .authenticate_password(username, password)
            .await
            .map_err(transport_err)?;
        if !result.success() {
            return Err(VaultError::AuthenticationFailure(format!(
                "password rejected for {}",
                username
            )));
        }
        Ok(())
    }

    async fn auth_username_key(&self, username: &str, private_key_pem: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(private_key_pem)
            .map_err(|_| VaultError::InvalidKeyFormat("PEM is not valid UTF-8".to_string()))?;
        let key = decode_secret_key(text, None)
            .map_err(|e| VaultError::InvalidKeyFormat(e.to_string()))?;

        let mut guard = self.handle.lock().await;
        let handle = guard
            .as_mut()
            .ok_or_else(|| VaultError::Transport("not connected".to_string()))?;

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(transport_err)?
            .flatten();
        let result = handle
            .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
            .await
            .map_err(transport_err)?;
        if !result.success() {
            return Err(VaultError::AuthenticationFailure(format!(
                "public key rejected for {}",
                username
            )));
        }
        Ok(())
    }

    async fn exec(&self, command: &str, pty: bool) -> Result<ExecStream> {
        let mut pending_exit = self.exit_status.lock().await;
        if pending_exit.is_some() {
            return Err(VaultError::Transport(
                "a command is already running on this session".to_string(),
            ));
        }

        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| VaultError::Transport("not connected".to_string()))?;

        let channel = handle.channel_open_session().await.map_err(transport_err)?;
        if pty {
            channel
                .request_pty(false, "xterm", 80, 24, 0, 0, &[])
                .await
                .map_err(transport_err)?;
        }
        channel.exec(true, command).await.map_err(transport_err)?;

        let (tx, stream) = ExecStream::channel(self.cancel.clone());
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(pump(channel, tx, exit_tx, self.cancel.clone()));
        *pending_exit = Some(exit_rx);

        Ok(stream)
    }

    async fn wait_exit_code(&self, timeout_ms: u64) -> Result<i32> {
        let exit_rx = self
            .exit_status
            .lock()
            .await
            .take()
            .ok_or_else(|| VaultError::Transport("no command is running".to_string()))?;

        tokio::select! {
            _ = self.cancel.cancelled() => Err(VaultError::Cancelled),
            r = tokio::time::timeout(Duration::from_millis(timeout_ms), exit_rx) => match r {
                Err(_) => Err(VaultError::CommandTimeout(timeout_ms)),
                Ok(Err(_)) => Err(VaultError::Transport(
                    "channel closed without exit status".to_string(),
                )),
                Ok(Ok(code)) => Ok(code),
            },
        }
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn disconnect(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                warn!(error = %e, "ssh disconnect failed");
            }
        }
    }
}

pub struct RusshTransportFactory {
    verifier: Arc<dyn HostKeyVerifier>,
}

impl RusshTransportFactory {
    pub fn new(verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self { verifier }
    }
}

impl TransportFactory for RusshTransportFactory {
    fn create(&self) -> Box<dyn SshTransport> {
        Box::new(RusshTransport::new(self.verifier.clone()))
    }
}
