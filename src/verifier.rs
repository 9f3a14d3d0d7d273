//! Host Key Verifier
//!
//! 원격 호스트 공개키의 지문(`SHA256:<base64>`, OpenSSH 표기)을 계산하고 핀과 비교합니다.
//! 검증기는 아무것도 저장하지 않습니다. 최초 접속(TOFU)에서 관측한 핀의 저장은 호출자 책임입니다.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use ssh_key::PublicKey;

use crate::error::{Result, VaultError};
use crate::models::HostPin;

/// 호스트 신원 검증 기능
pub trait HostKeyVerifier: Send + Sync {
    /// 같은 입력에는 항상 같은 핀
    fn compute_fingerprint(&self, public_key: &[u8]) -> Result<HostPin>;

    /// `expected`가 `None`이면 최초 접속으로 보고 `true`.
    /// 그 외에는 알고리즘과 다이제스트가 모두 정확히 같을 때만 `true`.
    fn verify_pinned(&self, expected: Option<&HostPin>, observed: &HostPin) -> bool;
}

/// SHA-256 지문 검증기
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintVerifier;

impl FingerprintVerifier {
    pub fn new() -> Self {
        Self
    }

    /// SSH wire 포맷 블롭, 또는 `<type> <base64> [comment]` 한 줄
    fn parse(public_key: &[u8]) -> Result<PublicKey> {
        if let Ok(key) = PublicKey::from_bytes(public_key) {
            return Ok(key);
        }

        let text = std::str::from_utf8(public_key).map_err(|_| {
            VaultError::InvalidKeyFormat("unrecognized public key encoding".to_string())
        })?;
        PublicKey::from_openssh(text.trim())
            .map_err(|e| VaultError::InvalidKeyFormat(format!("public key: {}", e)))
    }
}

impl HostKeyVerifier for FingerprintVerifier {
    fn compute_fingerprint(&self, public_key: &[u8]) -> Result<HostPin> {
        let key = Self::parse(public_key)?;

        // 코멘트를 제외한 정규 wire 인코딩 위에서 계산
        let wire = key
            .to_bytes()
            .map_err(|e| VaultError::InvalidKeyFormat(format!("public key encoding: {}", e)))?;
        let digest = Sha256::digest(&wire);

        Ok(HostPin::new(
            key.algorithm().as_str(),
            format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)),
        ))
    }

    fn verify_pinned(&self, expected: Option<&HostPin>, observed: &HostPin) -> bool {
        match expected {
            None => true,
            Some(pin) => pin.algorithm == observed.algorithm && pin.fingerprint == observed.fingerprint,
        }
    }
}
