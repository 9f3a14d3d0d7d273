//! SSH Provisioning Orchestrator
//!
//! Gatekeeper → Vault → Transport 순서로 조합해 두 가지 흐름을 제공합니다.
//!
//! - `deploy_key_to_host`: 비밀번호로 접속해 공개키를 `authorized_keys`에 설치
//!   (`deploy_key_with_pin`/`deploy_host`는 저장된 호스트 핀을 먼저 확인)
//! - `test_key_based_auth`: 저장된 개인키로 접속해 검증 명령 실행
//!
//! 어떤 오류도 호출자에게 전파하지 않고 `ProvisionResult`로 변환합니다.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{info, warn};

use crate::error::{Result, VaultError};
use crate::gate::KeyGate;
use crate::models::{HostPin, HostRecord, HostTarget, ProvisionResult, Timeouts};
use crate::transport::{SshTransport, TransportFactory};
use crate::vault::KeyVault;

/// 키 인증 확인에 쓰는 명령
pub const VALIDATION_COMMAND: &str = "echo ok";

const REMOTE_COMMAND_FAILED: &str = "REMOTE_COMMAND_FAILED";

/// 원격 명령 실행 결과
struct CommandOutput {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

pub struct ProvisioningOrchestrator {
    gate: Arc<dyn KeyGate>,
    vault: Arc<dyn KeyVault>,
    transports: Arc<dyn TransportFactory>,
}

impl ProvisioningOrchestrator {
    pub fn new(
        gate: Arc<dyn KeyGate>,
        vault: Arc<dyn KeyVault>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            gate,
            vault,
            transports,
        }
    }

    /// 공개키를 원격 호스트에 배포
    ///
    /// 최초 접속(TOFU)으로 연결하며 관측한 호스트 핀을 결과에 담아 돌려줍니다.
    pub async fn deploy_key_to_host(
        &self,
        target: &HostTarget,
        password: &str,
        key_blob_id: &str,
        timeouts: Timeouts,
    ) -> ProvisionResult {
        self.deploy_key_with_pin(target, password, key_blob_id, timeouts, None, false)
            .await
    }

    /// 호스트 핀을 확인하며 공개키 배포
    ///
    /// strict 모드에서 핀이 다르면 비밀번호를 보내기 전에 연결을 끊습니다.
    pub async fn deploy_key_with_pin(
        &self,
        target: &HostTarget,
        password: &str,
        key_blob_id: &str,
        timeouts: Timeouts,
        expected_pin: Option<&HostPin>,
        strict_host_key: bool,
    ) -> ProvisionResult {
        let started = Instant::now();
        let mut observed = None;
        let outcome = AssertUnwindSafe(self.deploy(
            target,
            password,
            key_blob_id,
            &timeouts,
            expected_pin,
            strict_host_key,
            &mut observed,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(panic_error(panic)));

        let result = finish(started, outcome, observed);
        info!(
            target = %target,
            key_id = key_blob_id,
            strict = strict_host_key,
            success = result.success,
            duration_ms = result.duration_ms,
            "deploy key finished"
        );
        result
    }

    /// 호스트 레코드의 설정(키, 핀, strict, 타임아웃)으로 공개키 배포
    pub async fn deploy_host(&self, host: &HostRecord, password: &str) -> ProvisionResult {
        match &host.key_blob_id {
            Some(key_id) => {
                self.deploy_key_with_pin(
                    &host.target(),
                    password,
                    key_id,
                    host.timeouts,
                    host.pinned.as_ref(),
                    host.strict_host_key,
                )
                .await
            }
            None => no_key_assigned(host),
        }
    }

    /// 저장된 키로 접속 가능한지 확인
    pub async fn test_key_based_auth(
        &self,
        target: &HostTarget,
        key_blob_id: &str,
        timeouts: Timeouts,
        expected_pin: Option<&HostPin>,
        strict_host_key: bool,
    ) -> ProvisionResult {
        let started = Instant::now();
        let mut observed = None;
        let outcome = AssertUnwindSafe(self.test_auth(
            target,
            key_blob_id,
            &timeouts,
            expected_pin,
            strict_host_key,
            &mut observed,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(panic_error(panic)));

        let result = finish(started, outcome, observed);
        info!(
            target = %target,
            key_id = key_blob_id,
            strict = strict_host_key,
            success = result.success,
            duration_ms = result.duration_ms,
            "key auth test finished"
        );
        result
    }

    /// 호스트 레코드의 설정(키, 핀, strict, 타임아웃)으로 키 인증 확인
    pub async fn test_host(&self, host: &HostRecord) -> ProvisionResult {
        match &host.key_blob_id {
            Some(key_id) => {
                self.test_key_based_auth(
                    &host.target(),
                    key_id,
                    host.timeouts,
                    host.pinned.as_ref(),
                    host.strict_host_key,
                )
                .await
            }
            None => no_key_assigned(host),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn deploy(
        &self,
        target: &HostTarget,
        password: &str,
        key_blob_id: &str,
        timeouts: &Timeouts,
        expected_pin: Option<&HostPin>,
        strict_host_key: bool,
        observed: &mut Option<HostPin>,
    ) -> Result<CommandOutput> {
        self.gate.require_gate_for_key_operation().await?;
        let public_key = self.vault.get_public_key_openssh(key_blob_id).await?;
        let command = install_key_command(&public_key)?;

        let transport = self.transports.create();
        let result: Result<CommandOutput> = async {
            let pin = transport
                .connect(
                    &target.hostname,
                    target.port,
                    timeouts,
                    expected_pin,
                    strict_host_key,
                )
                .await?;
            *observed = Some(pin);
            transport
                .auth_username_password(&target.username, password)
                .await?;
            run_command(transport.as_ref(), &command, timeouts).await
        }
        .await;
        transport.disconnect().await;

        result
    }

    async fn test_auth(
        &self,
        target: &HostTarget,
        key_blob_id: &str,
        timeouts: &Timeouts,
        expected_pin: Option<&HostPin>,
        strict_host_key: bool,
        observed: &mut Option<HostPin>,
    ) -> Result<CommandOutput> {
        self.gate.require_gate_for_key_operation().await?;
        let private_key = self.vault.decrypt_private_key(key_blob_id).await?;

        let transport = self.transports.create();
        let result: Result<CommandOutput> = async {
            let pin = transport
                .connect(
                    &target.hostname,
                    target.port,
                    timeouts,
                    expected_pin,
                    strict_host_key,
                )
                .await?;
            *observed = Some(pin);
            transport
                .auth_username_key(&target.username, &private_key)
                .await?;
            run_command(transport.as_ref(), VALIDATION_COMMAND, timeouts).await
        }
        .await;
        transport.disconnect().await;

        result
    }
}

/// 명령 실행 후 출력을 끝까지 읽고 종료 코드 대기
async fn run_command(
    transport: &dyn SshTransport,
    command: &str,
    timeouts: &Timeouts,
) -> Result<CommandOutput> {
    let stream = transport.exec(command, false).await?;

    let captured = match tokio::time::timeout(
        Duration::from_millis(timeouts.read_ms),
        stream.collect_output(),
    )
    .await
    {
        Ok(captured) => captured?,
        Err(_) => {
            transport.cancel();
            return Err(VaultError::CommandTimeout(timeouts.read_ms));
        }
    };

    let exit_code = transport.wait_exit_code(timeouts.read_ms).await?;
    Ok(CommandOutput {
        stdout: captured.stdout,
        stderr: captured.stderr,
        exit_code,
    })
}

/// 셸 단일 인용
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// `authorized_keys`에 공개키가 없을 때만 추가하는 명령
///
/// 존재 여부는 코멘트를 제외한 `<타입> <본문>` 두 필드로 판단하므로
/// 옵션이 붙거나 코멘트가 다른 기존 줄도 같은 키로 봅니다.
/// 디렉터리는 700, 파일은 600. 파일 끝에 개행이 없으면 먼저 개행을 붙입니다.
fn install_key_command(public_key: &str) -> Result<String> {
    let key = public_key.trim();
    if key.contains(['\n', '\r']) {
        return Err(VaultError::InvalidKeyFormat(
            "public key must be a single non-empty line".to_string(),
        ));
    }
    let mut fields = key.split_whitespace();
    let (Some(kind), Some(blob)) = (fields.next(), fields.next()) else {
        return Err(VaultError::InvalidKeyFormat(
            "public key must have a type and a base64 body".to_string(),
        ));
    };

    let kind = shell_quote(kind);
    let blob = shell_quote(blob);
    let key = shell_quote(key);
    let file = "~/.ssh/authorized_keys";
    Ok(format!(
        "umask 077 && mkdir -p ~/.ssh && chmod 700 ~/.ssh && touch {file} && chmod 600 {file} && \
         {{ [ ! -s {file} ] || [ -z \"$(tail -c 1 {file})\" ] || echo >> {file}; }} && \
         {{ awk -v t={kind} -v b={blob} \
         '{{ for (i = 1; i < NF; i++) if ($i == t && $(i + 1) == b) found = 1 }} END {{ exit !found }}' {file} \
         || printf '%s\\n' {key} >> {file}; }}"
    ))
}

fn panic_error(panic: Box<dyn std::any::Any + Send>) -> VaultError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    warn!(message = %message, "provisioning flow panicked");
    VaultError::Internal(message)
}

fn no_key_assigned(host: &HostRecord) -> ProvisionResult {
    finish(
        Instant::now(),
        Err(VaultError::InvalidConfig(format!(
            "host {} has no key assigned",
            host.id
        ))),
        None,
    )
}

fn elapsed_ms(started: Instant) -> u64 {
    (started.elapsed().as_millis() as u64).max(1)
}

/// 결과 집계 (유일한 오류 변환 지점)
fn finish(
    started: Instant,
    outcome: Result<CommandOutput>,
    observed_pin: Option<HostPin>,
) -> ProvisionResult {
    let duration_ms = elapsed_ms(started);
    match outcome {
        Ok(output) if output.exit_code == 0 => ProvisionResult {
            success: true,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms,
            exit_code: Some(0),
            error_message: None,
            error_code: None,
            observed_pin,
        },
        Ok(output) => ProvisionResult {
            success: false,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms,
            exit_code: Some(output.exit_code),
            error_message: Some(format!(
                "remote command exited with status {}",
                output.exit_code
            )),
            error_code: Some(REMOTE_COMMAND_FAILED.to_string()),
            observed_pin,
        },
        Err(e) => ProvisionResult {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms,
            exit_code: None,
            error_message: Some(e.to_string()),
            error_code: Some(e.code().to_string()),
            observed_pin,
        },
    }
}
