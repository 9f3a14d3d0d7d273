//! AEAD 봉인/개봉
//!
//! ChaCha20-Poly1305 (IV 12 bytes, 태그 16 bytes).
//! 암호화 결과(= 암호문 + 태그)에서 태그를 분리해 `SealedBox`로 저장하고,
//! 복호화 시 다시 이어붙여 검증합니다.

use chacha20poly1305::{
    aead::{self, Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::Rng;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};
use crate::models::SealedBox;

/// 대칭키 길이 (256-bit)
pub const KEY_LEN: usize = 32;

/// IV 길이 (ChaCha20-Poly1305용 12 bytes)
pub const IV_LEN: usize = 12;

/// 인증 태그 길이
pub const TAG_LEN: usize = 16;

/// 새 대칭키 생성 (CSPRNG)
pub fn generate_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::thread_rng().fill(&mut key[..]);
    key
}

/// 평문을 봉인
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<SealedBox> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill(&mut iv);

    let cipher = ChaCha20Poly1305::new(key.into());
    let mut ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

    // 출력 끝 16 bytes가 태그
    let tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);

    Ok(SealedBox {
        iv: iv.to_vec(),
        tag,
        ciphertext,
    })
}

/// 봉인 해제
///
/// IV/태그 길이가 맞지 않거나 태그 검증에 실패하면 `aead::Error`.
pub fn open(
    key: &[u8; KEY_LEN],
    sealed: &SealedBox,
) -> std::result::Result<Zeroizing<Vec<u8>>, aead::Error> {
    if sealed.iv.len() != IV_LEN || sealed.tag.len() != TAG_LEN {
        return Err(aead::Error);
    }

    let mut combined = Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(&sealed.ciphertext);
    combined.extend_from_slice(&sealed.tag);

    let cipher = ChaCha20Poly1305::new(key.into());
    let plaintext = cipher.decrypt(Nonce::from_slice(&sealed.iv), combined.as_ref())?;

    Ok(Zeroizing::new(plaintext))
}
