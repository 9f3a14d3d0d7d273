//! SSH Transport 계약
//!
//! 오케스트레이터가 구동하는 추상 SSH 세션. 실제 프로토콜 구현은 외부 협력자입니다.
//!
//! - 세션당 한 번에 하나의 명령만 실행 (재진입 불가)
//! - `exec` 출력은 bounded 채널로 전달되며 소비자가 점진적으로 읽음
//! - `cancel()`은 진행 중인 `exec`/`wait_exit_code`와 동시에 호출해도 안전

#[cfg(feature = "russh")]
pub mod russh;
pub mod scripted;

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Result, VaultError};
use crate::models::{HostPin, Timeouts};
use crate::verifier::HostKeyVerifier;

/// exec 출력 채널 용량 (청크 단위)
pub const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// 출력 스트림 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Stdout,
    Stderr,
}

/// 원격 명령 출력 조각
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub kind: OutputKind,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: OutputKind::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: OutputKind::Stderr,
            data: data.into(),
        }
    }
}

/// 모아 둔 명령 출력
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// `exec` 출력 스트림
///
/// 도착 순서대로 유한한 청크를 내보냅니다. 송신 측(전송 계층)은 명령이 끝나거나
/// 세션이 취소되면 채널을 닫아야 합니다.
pub struct ExecStream {
    rx: mpsc::Receiver<OutputChunk>,
    cancel: CancellationToken,
}

impl ExecStream {
    /// 송신 측과 스트림 쌍 생성
    pub fn channel(cancel: CancellationToken) -> (mpsc::Sender<OutputChunk>, ExecStream) {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        (tx, ExecStream { rx, cancel })
    }

    /// 끝까지 읽어서 stdout/stderr로 모음
    ///
    /// 중간에 취소되면 `Cancelled`.
    pub async fn collect_output(mut self) -> Result<CapturedOutput> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        while let Some(chunk) = self.next().await {
            match chunk.kind {
                OutputKind::Stdout => stdout.extend_from_slice(&chunk.data),
                OutputKind::Stderr => stderr.extend_from_slice(&chunk.data),
            }
        }

        if self.cancel.is_cancelled() {
            return Err(VaultError::Cancelled);
        }

        Ok(CapturedOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

impl Stream for ExecStream {
    type Item = OutputChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            self.rx.close();
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

/// 추상 SSH 세션
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// 핸드셰이크 후 관측한 호스트 핀 반환.
    /// `strict_host_key`이고 `expected_pin`과 다르면 인증 전에 `HostKeyMismatch`로 실패.
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeouts: &Timeouts,
        expected_pin: Option<&HostPin>,
        strict_host_key: bool,
    ) -> Result<HostPin>;

    async fn auth_username_password(&self, username: &str, password: &str) -> Result<()>;

    /// 거부되면 `AuthenticationFailure`
    async fn auth_username_key(&self, username: &str, private_key_pem: &[u8]) -> Result<()>;

    async fn exec(&self, command: &str, pty: bool) -> Result<ExecStream>;

    /// 시간 초과 시 `CommandTimeout`
    async fn wait_exit_code(&self, timeout_ms: u64) -> Result<i32>;

    /// 진행 중인 작업의 협조적 중단
    fn cancel(&self);

    async fn disconnect(&self);
}

/// 작업마다 새 세션 생성
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn SshTransport>;
}

/// 핸드셰이크에서 받은 호스트 공개키 검사
///
/// strict 모드에서 핀이 다르면 실패(fail closed). 비 strict 모드에서는 경고만 남기고
/// 관측한 핀을 그대로 돌려줍니다.
pub fn check_host_key(
    verifier: &dyn HostKeyVerifier,
    host_key: &[u8],
    expected: Option<&HostPin>,
    strict_host_key: bool,
) -> Result<HostPin> {
    let observed = verifier.compute_fingerprint(host_key)?;

    if let Some(pin) = expected {
        if !verifier.verify_pinned(Some(pin), &observed) {
            if strict_host_key {
                return Err(VaultError::HostKeyMismatch {
                    expected: pin.to_string(),
                    observed: observed.to_string(),
                });
            }
            warn!(expected = %pin, observed = %observed, "host key changed (strict checking disabled)");
        }
    }

    Ok(observed)
}
