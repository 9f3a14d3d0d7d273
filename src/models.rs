//! SSH Vault Data Models
//!
//! Vault, Verifier, 오케스트레이터가 주고받는 데이터 모델

use serde::{Deserialize, Serialize};

/// 키 블롭 식별자 (UUID v4 문자열)
pub type KeyBlobId = String;

/// AEAD 봉인 결과 (IV + 태그 + 암호문)
///
/// 암호화 시 태그는 암호문 뒤에 붙어서 나오며, 저장 전에 분리합니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// 마스터키(KEK)로 감싼 DEK
///
/// 단독으로 저장되지 않고 항상 `KeyBlob`의 일부로만 저장됩니다.
pub type WrappedKey = SealedBox;

/// 암호화된 개인키 레코드
///
/// 생성 이후 삭제 외에는 변경되지 않습니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBlob {
    pub id: KeyBlobId,
    pub algorithm: String,
    /// DEK로 암호화한 개인키 PEM
    pub encrypted: SealedBox,
    /// 마스터키로 감싼 DEK
    pub wrapped_dek: WrappedKey,
    pub public_key_openssh: String,
    /// 생성 시각 (unix millis)
    pub created_at: i64,
}

/// 관리 화면용 키 요약 (암호문 미포함)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySummary {
    pub id: KeyBlobId,
    pub algorithm: String,
    #[serde(rename = "publicKeyOpenssh")]
    pub public_key_openssh: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

impl From<&KeyBlob> for KeySummary {
    fn from(blob: &KeyBlob) -> Self {
        Self {
            id: blob.id.clone(),
            algorithm: blob.algorithm.clone(),
            public_key_openssh: blob.public_key_openssh.clone(),
            created_at: blob.created_at,
        }
    }
}

/// 원격 호스트 공개키의 정규 식별자
///
/// 알고리즘과 다이제스트 모두 정확히 일치해야 같은 핀입니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPin {
    pub algorithm: String,
    pub fingerprint: String,
}

impl HostPin {
    pub fn new(algorithm: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            fingerprint: fingerprint.into(),
        }
    }
}

impl std::fmt::Display for HostPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.algorithm, self.fingerprint)
    }
}

/// 호출 단위 타임아웃
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(rename = "connectMs")]
    pub connect_ms: u64,
    #[serde(rename = "readMs")]
    pub read_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            read_ms: 30_000,
        }
    }
}

/// 접속 대상 (호스트명, 포트, 사용자)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTarget {
    pub hostname: String,
    pub port: u16,
    pub username: String,
}

impl HostTarget {
    pub fn new(hostname: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            username: username.into(),
        }
    }
}

impl std::fmt::Display for HostTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.hostname, self.port)
    }
}

/// 등록된 호스트 레코드 (코어 입장에서는 읽기 전용)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    #[serde(rename = "pinnedFingerprint")]
    pub pinned: Option<HostPin>,
    #[serde(rename = "keyBlobId")]
    pub key_blob_id: Option<KeyBlobId>,
    #[serde(rename = "strictHostKey")]
    pub strict_host_key: bool,
    pub timeouts: Timeouts,
}

impl HostRecord {
    pub fn target(&self) -> HostTarget {
        HostTarget::new(self.hostname.clone(), self.port, self.username.clone())
    }
}

/// 프로비저닝 결과
///
/// 작업당 한 번 생성되며 이후 변경되지 않습니다.
/// `stdout`/`stderr`는 값이 없으면 빈 문자열, `duration_ms`는 항상 0보다 큽니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    /// 핸드셰이크에서 관측한 호스트 핀 (최초 접속 시 호출자가 저장)
    pub observed_pin: Option<HostPin>,
}
