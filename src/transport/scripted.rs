//! 스크립트 기반 SSH 세션
//!
//! 네트워크 없이 정해진 호스트키/자격 증명/출력으로 동작하는 결정적 전송 계층.
//! 오프라인 개발 및 오케스트레이터 테스트에 사용합니다.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{check_host_key, ExecStream, OutputChunk, SshTransport, TransportFactory};
use crate::error::{Result, VaultError};
use crate::models::{HostPin, Timeouts};
use crate::vault::pem;
use crate::verifier::{FingerprintVerifier, HostKeyVerifier};

/// 원격 호스트 동작 정의
#[derive(Debug, Clone)]
pub struct ScriptedHost {
    /// SSH wire 포맷 호스트 공개키
    pub host_key: Vec<u8>,
    pub password: Option<String>,
    /// 키 인증을 허용할 OpenSSH 공개키들
    pub authorized_keys: Vec<String>,
    pub output: Vec<OutputChunk>,
    /// `None`이면 명령이 끝나지 않음
    pub exit_code: Option<i32>,
    pub connect_delay: Option<Duration>,
    pub refuse_connection: bool,
}

impl ScriptedHost {
    pub fn new(host_key: Vec<u8>) -> Self {
        Self {
            host_key,
            password: None,
            authorized_keys: Vec::new(),
            output: Vec::new(),
            exit_code: Some(0),
            connect_delay: None,
            refuse_connection: false,
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn authorize_key(mut self, public_key_openssh: &str) -> Self {
        self.authorized_keys.push(public_key_openssh.to_string());
        self
    }

    pub fn with_stdout(mut self, data: &str) -> Self {
        self.output.push(OutputChunk::stdout(data));
        self
    }

    pub fn with_stderr(mut self, data: &str) -> Self {
        self.output.push(OutputChunk::stderr(data));
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// 종료 상태를 보내지 않는 명령
    pub fn hanging(mut self) -> Self {
        self.exit_code = None;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn refusing(mut self) -> Self {
        self.refuse_connection = true;
        self
    }
}

/// 기록된 호출
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect { host: String, port: u16 },
    AuthPassword { username: String },
    AuthKey { username: String },
    Exec { command: String, pty: bool },
    WaitExitCode,
    Cancel,
    Disconnect,
}

/// 여러 세션이 공유하는 호출 기록
pub type CallLog = Arc<Mutex<Vec<TransportCall>>>;

#[derive(Debug, Default)]
struct Session {
    connected: bool,
    authenticated: bool,
    executing: bool,
}

pub struct ScriptedTransport {
    script: ScriptedHost,
    verifier: Arc<dyn HostKeyVerifier>,
    calls: CallLog,
    session: Mutex<Session>,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// 코멘트를 뺀 `<type> <base64>` 부분
fn key_body(openssh: &str) -> Option<(&str, &str)> {
    let mut parts = openssh.split_whitespace();
    Some((parts.next()?, parts.next()?))
}

impl ScriptedTransport {
    pub fn new(script: ScriptedHost, verifier: Arc<dyn HostKeyVerifier>, calls: CallLog) -> Self {
        Self {
            script,
            verifier,
            calls,
            session: Mutex::new(Session::default()),
            cancel: CancellationToken::new(),
        }
    }

    fn record(&self, call: TransportCall) {
        lock(&self.calls).push(call);
    }

    fn require_connected(&self) -> Result<()> {
        if lock(&self.session).connected {
            Ok(())
        } else {
            Err(VaultError::Transport("not connected".to_string()))
        }
    }

    fn require_authenticated(&self) -> Result<()> {
        let session = lock(&self.session);
        if !session.connected {
            return Err(VaultError::Transport("not connected".to_string()));
        }
        if !session.authenticated {
            return Err(VaultError::Transport("not authenticated".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SshTransport for ScriptedTransport {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeouts: &Timeouts,
        expected_pin: Option<&HostPin>,
        strict_host_key: bool,
    ) -> Result<HostPin> {
        self.record(TransportCall::Connect {
            host: host.to_string(),
            port,
        });

        if self.script.refuse_connection {
            return Err(VaultError::Transport(format!(
                "connection refused: {}:{}",
                host, port
            )));
        }

        if let Some(delay) = self.script.connect_delay {
            let limit = Duration::from_millis(timeouts.connect_ms);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(VaultError::Cancelled),
                _ = tokio::time::sleep(delay.min(limit)) => {}
            }
            if delay >= limit {
                return Err(VaultError::ConnectionTimeout(timeouts.connect_ms));
            }
        }

        let observed = check_host_key(
            self.verifier.as_ref(),
            &self.script.host_key,
            expected_pin,
            strict_host_key,
        )?;

        lock(&self.session).connected = true;
        debug!(host, port, pin = %observed, "scripted session connected");
        Ok(observed)
    }

    async fn auth_username_password(&self, username: &str, password: &str) -> Result<()> {
        self.record(TransportCall::AuthPassword {
            username: username.to_string(),
        });
        self.require_connected()?;

        if self.script.password.as_deref() != Some(password) {
            return Err(VaultError::AuthenticationFailure(format!(
                "password rejected for {}",
                username
            )));
        }
        lock(&self.session).authenticated = true;
        Ok(())
    }

    async fn auth_username_key(&self, username: &str, private_key_pem: &[u8]) -> Result<()> {
        self.record(TransportCall::AuthKey {
            username: username.to_string(),
        });
        self.require_connected()?;

        let offered = pem::derive_public_key(private_key_pem, "")?;
        let accepted = self
            .script
            .authorized_keys
            .iter()
            .any(|k| key_body(k).is_some() && key_body(k) == key_body(&offered.openssh));
        if !accepted {
            return Err(VaultError::AuthenticationFailure(format!(
                "public key rejected for {}",
                username
            )));
        }
        lock(&self.session).authenticated = true;
        Ok(())
    }

    async fn exec(&self, command: &str, pty: bool) -> Result<ExecStream> {
        self.record(TransportCall::Exec {
            command: command.to_string(),
            pty,
        });
        self.require_authenticated()?;
        {
            let mut session = lock(&self.session);
            if session.executing {
                return Err(VaultError::Transport(
                    "a command is already running on this session".to_string(),
                ));
            }
            session.executing = true;
        }

        let (tx, stream) = ExecStream::channel(self.cancel.clone());
        let chunks = self.script.output.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            for chunk in chunks {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(chunk) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(stream)
    }

    async fn wait_exit_code(&self, timeout_ms: u64) -> Result<i32> {
        self.record(TransportCall::WaitExitCode);
        if !lock(&self.session).executing {
            return Err(VaultError::Transport("no command is running".to_string()));
        }

        let exit_code = self.script.exit_code;
        let finished = async move {
            match exit_code {
                Some(code) => code,
                None => std::future::pending::<i32>().await,
            }
        };

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(VaultError::Cancelled),
            outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), finished) => {
                outcome.map_err(|_| VaultError::CommandTimeout(timeout_ms))
            }
        };

        lock(&self.session).executing = false;
        result
    }

    fn cancel(&self) {
        self.record(TransportCall::Cancel);
        self.cancel.cancel();
    }

    async fn disconnect(&self) {
        self.record(TransportCall::Disconnect);
        let mut session = lock(&self.session);
        session.connected = false;
        session.authenticated = false;
        session.executing = false;
    }
}

/// 같은 스크립트와 호출 기록을 공유하는 세션 생성기
pub struct ScriptedTransportFactory {
    script: ScriptedHost,
    verifier: Arc<dyn HostKeyVerifier>,
    calls: CallLog,
}

impl ScriptedTransportFactory {
    pub fn new(script: ScriptedHost) -> Self {
        Self::with_verifier(script, Arc::new(FingerprintVerifier::new()))
    }

    pub fn with_verifier(script: ScriptedHost, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self {
            script,
            verifier,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 지금까지 모든 세션에서 기록된 호출
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.calls).clone()
    }
}

impl TransportFactory for ScriptedTransportFactory {
    fn create(&self) -> Box<dyn SshTransport> {
        Box::new(ScriptedTransport::new(
            self.script.clone(),
            self.verifier.clone(),
            self.calls.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use ssh_key::{Algorithm, LineEnding, PrivateKey};

    fn host_key() -> Vec<u8> {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .to_bytes()
            .unwrap()
    }

    fn client_key() -> (String, String) {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let pem = key.to_openssh(LineEnding::LF).unwrap().to_string();
        let public = key.public_key().to_openssh().unwrap();
        (pem, public)
    }

    #[tokio::test]
    async fn test_password_session_streams_output() {
        let factory = ScriptedTransportFactory::new(
            ScriptedHost::new(host_key())
                .with_password("hunter2")
                .with_stdout("hello ")
                .with_stderr("careful")
                .with_stdout("world"),
        );
        let transport = factory.create();

        transport
            .connect("db1", 22, &Timeouts::default(), None, false)
            .await
            .unwrap();
        transport.auth_username_password("root", "hunter2").await.unwrap();
        let output = transport
            .exec("echo", false)
            .await
            .unwrap()
            .collect_output()
            .await
            .unwrap();
        assert_eq!(output.stdout, "hello world");
        assert_eq!(output.stderr, "careful");
        assert_eq!(transport.wait_exit_code(1_000).await.unwrap(), 0);
        transport.disconnect().await;

        assert_eq!(factory.calls().last(), Some(&TransportCall::Disconnect));
    }

    #[tokio::test]
    async fn test_key_auth_matches_authorized_key() {
        let (pem, public) = client_key();
        let (other_pem, _) = client_key();
        let factory = ScriptedTransportFactory::new(ScriptedHost::new(host_key()).authorize_key(&public));

        let transport = factory.create();
        transport
            .connect("db1", 22, &Timeouts::default(), None, false)
            .await
            .unwrap();
        transport.auth_username_key("deploy", pem.as_bytes()).await.unwrap();

        let transport = factory.create();
        transport
            .connect("db1", 22, &Timeouts::default(), None, false)
            .await
            .unwrap();
        assert!(matches!(
            transport.auth_username_key("deploy", other_pem.as_bytes()).await,
            Err(VaultError::AuthenticationFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_strict_mismatch_fails_on_connect() {
        let factory = ScriptedTransportFactory::new(ScriptedHost::new(host_key()).with_password("pw"));
        let transport = factory.create();
        let stale = HostPin::new("ssh-ed25519", "SHA256:stale");

        let err = transport
            .connect("db1", 22, &Timeouts::default(), Some(&stale), true)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::HostKeyMismatch { .. }));

        // 연결되지 않았으므로 인증 불가
        assert!(transport.auth_username_password("root", "pw").await.is_err());
    }

    #[tokio::test]
    async fn test_exec_requires_auth() {
        let factory = ScriptedTransportFactory::new(ScriptedHost::new(host_key()));
        let transport = factory.create();
        transport
            .connect("db1", 22, &Timeouts::default(), None, false)
            .await
            .unwrap();
        assert!(matches!(
            transport.exec("id", false).await,
            Err(VaultError::Transport(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let factory = ScriptedTransportFactory::new(
            ScriptedHost::new(host_key()).with_connect_delay(Duration::from_secs(60)),
        );
        let transport = factory.create();
        let timeouts = Timeouts {
            connect_ms: 500,
            read_ms: 1_000,
        };
        assert!(matches!(
            transport.connect("slow", 22, &timeouts, None, false).await,
            Err(VaultError::ConnectionTimeout(500))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_command_times_out() {
        let factory = ScriptedTransportFactory::new(
            ScriptedHost::new(host_key()).with_password("pw").hanging(),
        );
        let transport = factory.create();
        transport
            .connect("db1", 22, &Timeouts::default(), None, false)
            .await
            .unwrap();
        transport.auth_username_password("root", "pw").await.unwrap();
        let _stream = transport.exec("sleep infinity", false).await.unwrap();

        assert!(matches!(
            transport.wait_exit_code(2_000).await,
            Err(VaultError::CommandTimeout(2_000))
        ));
    }

    #[tokio::test]
    async fn test_cancel_wakes_pending_wait() {
        let factory = ScriptedTransportFactory::new(
            ScriptedHost::new(host_key()).with_password("pw").hanging(),
        );
        let transport: Arc<dyn SshTransport> = Arc::from(factory.create());
        transport
            .connect("db1", 22, &Timeouts::default(), None, false)
            .await
            .unwrap();
        transport.auth_username_password("root", "pw").await.unwrap();
        let _stream = transport.exec("sleep infinity", false).await.unwrap();

        let waiter = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.wait_exit_code(60_000).await })
        };
        tokio::task::yield_now().await;
        transport.cancel();

        assert!(matches!(waiter.await.unwrap(), Err(VaultError::Cancelled)));
    }
}
