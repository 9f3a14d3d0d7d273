//! SSH Vault Error Types
//!
//! 크레이트 전역 에러 타입 정의

use serde::Serialize;
use thiserror::Error;

/// SSH Vault 에러
///
/// Vault, Keystore, Verifier, Gatekeeper는 이 에러를 호출자에게 그대로 전달합니다.
/// 프로비저닝 오케스트레이터만 이 에러를 `ProvisionResult`로 변환합니다.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Key unwrap failed: {0}")]
    KeyUnwrapFailure(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailure(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Key operation not authorized: gate is closed or expired")]
    GateNotAuthorized,

    #[error("Host key mismatch: expected {expected}, observed {observed}")]
    HostKeyMismatch { expected: String, observed: String },

    #[error("Authentication failed for {0}")]
    AuthenticationFailure(String),

    #[error("Connection timed out after {0} ms")]
    ConnectionTimeout(u64),

    #[error("Command timed out after {0} ms")]
    CommandTimeout(u64),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Keychain error: {0}")]
    Keychain(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// UI 경계에서 사용하는 안정적인 에러 코드
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::InvalidKeyFormat(_) => "INVALID_KEY_FORMAT",
            VaultError::KeyNotFound(_) => "KEY_NOT_FOUND",
            VaultError::KeyUnwrapFailure(_) => "KEY_UNWRAP_FAILURE",
            VaultError::DecryptionFailure(_) => "DECRYPTION_FAILURE",
            VaultError::EncryptionFailed(_) => "ENCRYPTION_FAILED",
            VaultError::GateNotAuthorized => "GATE_NOT_AUTHORIZED",
            VaultError::HostKeyMismatch { .. } => "HOST_KEY_MISMATCH",
            VaultError::AuthenticationFailure(_) => "AUTHENTICATION_FAILURE",
            VaultError::ConnectionTimeout(_) => "CONNECTION_TIMEOUT",
            VaultError::CommandTimeout(_) => "COMMAND_TIMEOUT",
            VaultError::Cancelled => "CANCELLED",
            VaultError::Transport(_) => "TRANSPORT_ERROR",
            VaultError::Keychain(_) => "KEYCHAIN_ERROR",
            VaultError::InvalidConfig(_) => "INVALID_CONFIG",
            VaultError::Database(_) => "DB_ERROR",
            VaultError::Io(_) => "IO_ERROR",
            VaultError::Serialization(_) => "SERIALIZATION_ERROR",
            VaultError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// 호출자 응답용 직렬화 가능한 에러
#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
}

impl From<&VaultError> for ErrorInfo {
    fn from(error: &VaultError) -> Self {
        let details = match error {
            VaultError::HostKeyMismatch { expected, observed } => {
                Some(format!("pinned={} observed={}", expected, observed))
            }
            _ => None,
        };

        ErrorInfo {
            code: error.code().to_string(),
            message: error.to_string(),
            details,
        }
    }
}

impl From<VaultError> for ErrorInfo {
    fn from(error: VaultError) -> Self {
        ErrorInfo::from(&error)
    }
}

/// SSH Vault 결과 타입
pub type Result<T> = std::result::Result<T, VaultError>;
