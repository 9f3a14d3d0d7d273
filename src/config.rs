//! 설정
//!
//! 환경 변수(`SSH_VAULT_*`)와 `.env.local`/`.env` 파일에서 설정을 읽습니다.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::models::Timeouts;

/// Keychain 서비스 이름
pub const DEFAULT_KEYCHAIN_SERVICE: &str = "com.sshvault.app";
/// 마스터키 Keychain 키
pub const DEFAULT_MASTER_KEY_ENTRY: &str = "sshvault:master_key_v1";
/// 게이트 기본 유효 시간 (분)
pub const DEFAULT_GATE_TTL_MINUTES: u64 = 5;
/// 게이트 최대 유효 시간 (분, 하루)
pub const MAX_GATE_TTL_MINUTES: u64 = 24 * 60;

const ENV_PREFIX: &str = "SSH_VAULT_";

/// 코어 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    pub keychain_service: String,
    pub master_key_entry: String,
    pub gate_ttl_minutes: u64,
    /// 생성한 공개키 뒤에 붙는 식별 코멘트
    pub key_comment: String,
    pub timeouts: Timeouts,
    pub database_path: Option<PathBuf>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            keychain_service: DEFAULT_KEYCHAIN_SERVICE.to_string(),
            master_key_entry: DEFAULT_MASTER_KEY_ENTRY.to_string(),
            gate_ttl_minutes: DEFAULT_GATE_TTL_MINUTES,
            key_comment: default_key_comment(),
            timeouts: Timeouts::default(),
            database_path: None,
        }
    }
}

fn default_key_comment() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string());
    format!("{}@ssh-vault", user)
}

impl VaultConfig {
    /// `.env.local` / `.env` 를 로드한 뒤 환경 변수로 설정 구성
    pub fn from_env() -> Result<Self> {
        load_env_files();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 키 조회 함수로부터 설정 구성 (테스트에서 환경 변수 없이 사용)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(v) = get("KEYCHAIN_SERVICE") {
            config.keychain_service = v;
        }
        if let Some(v) = get("MASTER_KEY_ENTRY") {
            config.master_key_entry = v;
        }
        if let Some(v) = get("GATE_TTL_MINUTES") {
            config.gate_ttl_minutes = parse_number("GATE_TTL_MINUTES", &v)?;
        }
        if let Some(v) = get("KEY_COMMENT") {
            config.key_comment = v;
        }
        if let Some(v) = get("CONNECT_TIMEOUT_MS") {
            config.timeouts.connect_ms = parse_number("CONNECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("READ_TIMEOUT_MS") {
            config.timeouts.read_ms = parse_number("READ_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(v));
        }

        config.validate()?;
        Ok(config)
    }

    /// 값 범위 검증
    pub fn validate(&self) -> Result<()> {
        if self.gate_ttl_minutes == 0 || self.gate_ttl_minutes > MAX_GATE_TTL_MINUTES {
            return Err(VaultError::InvalidConfig(format!(
                "gate TTL must be between 1 and {} minutes",
                MAX_GATE_TTL_MINUTES
            )));
        }
        if self.timeouts.connect_ms == 0 || self.timeouts.read_ms == 0 {
            return Err(VaultError::InvalidConfig(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.keychain_service.trim().is_empty() || self.master_key_entry.trim().is_empty() {
            return Err(VaultError::InvalidConfig(
                "keychain service and entry must not be empty".to_string(),
            ));
        }
        if self.key_comment.trim().is_empty() || self.key_comment.contains(['\n', '\r']) {
            return Err(VaultError::InvalidConfig(
                "key comment must be a single non-empty line".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64> {
    value.parse::<u64>().map_err(|_| {
        VaultError::InvalidConfig(format!("{}{} is not a number: {}", ENV_PREFIX, name, value))
    })
}

fn find_upwards(start: PathBuf, filename: &str, max_hops: usize) -> Option<PathBuf> {
    let mut cur = start;
    for _ in 0..=max_hops {
        let candidate = cur.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        if !cur.pop() {
            break;
        }
    }
    None
}

/// `.env.local` 우선, 없으면 `.env`
///
/// 이미 설정된 환경 변수는 덮어쓰지 않습니다. 파일이 없어도 실패하지 않습니다.
fn load_env_files() {
    let cwd = std::env::current_dir().ok();
    for filename in [".env.local", ".env"] {
        let found = cwd
            .clone()
            .and_then(|dir| find_upwards(dir, filename, 6));
        if let Some(path) = found {
            load_env_file(&path);
        }
    }
}

fn load_env_file(path: &Path) {
    match dotenvy::from_path(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "loaded env file"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to load env file"),
    }
}
