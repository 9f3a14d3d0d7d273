//! Access Gatekeeper
//!
//! 개인키 복호화 전에 반드시 열려 있어야 하는 시간 제한 인가 창.
//!
//! - 상태: Closed / Open(expires_at)
//! - 외부 인증 이벤트(`open_gate`)로만 열리고, `lock()` 또는 TTL 만료로 닫힘
//! - 프로세스 전역 상태는 하나의 Mutex 아래에서만 읽고 씀

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{VaultConfig, MAX_GATE_TTL_MINUTES};
use crate::error::{Result, VaultError};

/// 키 작업 전 인가 확인
#[async_trait]
pub trait KeyGate: Send + Sync {
    /// 열려 있고 만료되지 않았으면 Ok, 아니면 `GateNotAuthorized`
    async fn require_gate_for_key_operation(&self) -> Result<()>;
}

/// 게이트 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Closed,
    Open { expires_at: Instant },
}

struct GateInner {
    state: GateState,
    ttl: Duration,
}

/// 시간 제한 인가 게이트
pub struct AccessGatekeeper {
    inner: Mutex<GateInner>,
}

/// 1분 이상, `MAX_GATE_TTL_MINUTES` 이하만 허용
fn ttl_from_minutes(minutes: u64) -> Result<Duration> {
    if minutes == 0 || minutes > MAX_GATE_TTL_MINUTES {
        return Err(VaultError::InvalidConfig(format!(
            "gate TTL must be between 1 and {} minutes",
            MAX_GATE_TTL_MINUTES
        )));
    }
    Ok(Duration::from_secs(minutes * 60))
}

impl AccessGatekeeper {
    pub fn new(ttl_minutes: u64) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(GateInner {
                state: GateState::Closed,
                ttl: ttl_from_minutes(ttl_minutes)?,
            }),
        })
    }

    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        Self::new(config.gate_ttl_minutes)
    }

    // 상태가 단순 enum이라 poison 이후에도 그대로 사용 가능
    fn inner(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 외부 인증(생체/PIN 등) 성공 후 호출. 현재 TTL만큼 열림
    pub fn open_gate(&self) -> Instant {
        let mut inner = self.inner();
        let expires_at = Instant::now() + inner.ttl;
        inner.state = GateState::Open { expires_at };
        info!(ttl_secs = inner.ttl.as_secs(), "key gate opened");
        expires_at
    }

    /// 명시적 잠금
    pub fn lock(&self) {
        self.inner().state = GateState::Closed;
        info!("key gate locked");
    }

    /// 이후 열리는 게이트의 유효 시간 변경
    ///
    /// 이미 열려 있는 게이트의 만료 시각은 바뀌지 않습니다.
    pub fn set_gate_ttl_minutes(&self, minutes: u64) -> Result<()> {
        let ttl = ttl_from_minutes(minutes)?;
        self.inner().ttl = ttl;
        debug!(minutes, "key gate TTL updated");
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        self.inner().ttl
    }

    /// 만료를 반영한 현재 상태
    pub fn state(&self) -> GateState {
        let mut inner = self.inner();
        Self::expire_if_needed(&mut inner);
        inner.state
    }

    /// 만료까지 남은 시간 (닫혀 있으면 `None`)
    pub fn remaining(&self) -> Option<Duration> {
        match self.state() {
            GateState::Closed => None,
            GateState::Open { expires_at } => Some(expires_at.saturating_duration_since(Instant::now())),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), GateState::Open { .. })
    }

    fn expire_if_needed(inner: &mut GateInner) {
        if let GateState::Open { expires_at } = inner.state {
            if Instant::now() >= expires_at {
                inner.state = GateState::Closed;
                info!("key gate expired");
            }
        }
    }
}

#[async_trait]
impl KeyGate for AccessGatekeeper {
    async fn require_gate_for_key_operation(&self) -> Result<()> {
        let mut inner = self.inner();
        Self::expire_if_needed(&mut inner);
        match inner.state {
            GateState::Open { .. } => Ok(()),
            GateState::Closed => Err(VaultError::GateNotAuthorized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_by_default() {
        let gate = AccessGatekeeper::new(5).unwrap();
        assert!(matches!(
            gate.require_gate_for_key_operation().await,
            Err(VaultError::GateNotAuthorized)
        ));
        assert_eq!(gate.remaining(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_then_expire() {
        let gate = AccessGatekeeper::new(5).unwrap();
        gate.open_gate();
        gate.require_gate_for_key_operation().await.unwrap();

        tokio::time::advance(Duration::from_secs(4 * 60 + 59)).await;
        gate.require_gate_for_key_operation().await.unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(
            gate.require_gate_for_key_operation().await,
            Err(VaultError::GateNotAuthorized)
        ));
        assert_eq!(gate.state(), GateState::Closed);
    }

    #[tokio::test]
    async fn test_explicit_lock_closes() {
        let gate = AccessGatekeeper::new(5).unwrap();
        gate.open_gate();
        assert!(gate.is_open());

        gate.lock();
        assert!(!gate.is_open());
        assert!(gate.require_gate_for_key_operation().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_change_is_not_retroactive() {
        let gate = AccessGatekeeper::new(10).unwrap();
        gate.open_gate();

        gate.set_gate_ttl_minutes(1).unwrap();
        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        // 열릴 당시의 10분이 유지됨
        gate.require_gate_for_key_operation().await.unwrap();

        // 다시 열면 새 TTL 적용
        gate.open_gate();
        assert_eq!(gate.remaining(), Some(Duration::from_secs(60)));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(gate.require_gate_for_key_operation().await.is_err());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        assert!(matches!(
            AccessGatekeeper::new(0),
            Err(VaultError::InvalidConfig(_))
        ));
        let gate = AccessGatekeeper::new(3).unwrap();
        assert!(gate.set_gate_ttl_minutes(0).is_err());
        assert_eq!(gate.ttl(), Duration::from_secs(180));
    }

    #[tokio::test]
    async fn test_ttl_above_maximum_rejected() {
        assert!(matches!(
            AccessGatekeeper::new(u64::MAX),
            Err(VaultError::InvalidConfig(_))
        ));

        let gate = AccessGatekeeper::new(MAX_GATE_TTL_MINUTES).unwrap();
        assert!(gate.set_gate_ttl_minutes(MAX_GATE_TTL_MINUTES + 1).is_err());
        assert!(gate.set_gate_ttl_minutes(u64::MAX / 60).is_err());

        // 최대값으로 열어도 만료 시각 계산이 넘치지 않음
        gate.open_gate();
        assert!(gate.is_open());
        assert!(gate.remaining() <= Some(Duration::from_secs(MAX_GATE_TTL_MINUTES * 60)));
    }

    #[tokio::test]
    async fn test_concurrent_checks_see_same_state() {
        let gate = std::sync::Arc::new(AccessGatekeeper::new(5).unwrap());
        gate.open_gate();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.require_gate_for_key_operation().await.is_ok()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }
    }
}
