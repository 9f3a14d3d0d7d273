//! Keystore Manager - 마스터키(KEK) 관리 및 DEK 래핑
//!
//! - 마스터키는 OS Keychain에 1개만 저장 (`sshvault:master_key_v1`)
//! - 최초 사용 시 1회 로드 후 메모리에 캐시 (drop 시 zeroize)
//! - 마스터키 자체는 어떤 메서드로도 외부에 노출되지 않음

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use keyring::Entry;
use tokio::sync::RwLock;
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use crate::config::VaultConfig;
use crate::crypto::{self, KEY_LEN};
use crate::error::{Result, VaultError};
use crate::models::WrappedKey;

/// 마스터키로 DEK를 감싸고 푸는 기능
///
/// 모든 메서드는 암묵적으로 `ensure_keys()`를 먼저 호출합니다.
#[async_trait]
pub trait KeystoreManager: Send + Sync {
    /// 마스터키가 없으면 생성, 있으면 아무것도 하지 않음 (멱등)
    async fn ensure_keys(&self) -> Result<()>;

    /// 임의 길이의 비밀값을 마스터키로 암호화
    async fn wrap_dek(&self, raw: &[u8]) -> Result<WrappedKey>;

    /// 태그 검증 실패 시 `KeyUnwrapFailure`
    async fn unwrap_dek(&self, wrapped: &WrappedKey) -> Result<Zeroizing<Vec<u8>>>;
}

/// Zeroize가 적용된 마스터키 래퍼
struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl MasterKey {
    fn wrap(&self, raw: &[u8]) -> Result<WrappedKey> {
        crypto::seal(&self.bytes, raw)
    }

    fn unwrap(&self, wrapped: &WrappedKey) -> Result<Zeroizing<Vec<u8>>> {
        crypto::open(&self.bytes, wrapped)
            .map_err(|_| VaultError::KeyUnwrapFailure("authentication tag mismatch".to_string()))
    }
}

/// OS Keychain 기반 Keystore
pub struct KeyringKeystore {
    entry: Entry,
    master_key: RwLock<Option<MasterKey>>,
}

impl KeyringKeystore {
    pub fn new(service: &str, entry_name: &str) -> Result<Self> {
        let entry =
            Entry::new(service, entry_name).map_err(|e| VaultError::Keychain(e.to_string()))?;
        Ok(Self::from_entry(entry))
    }

    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        Self::new(&config.keychain_service, &config.master_key_entry)
    }

    /// 이미 만들어진 Keychain 엔트리 사용
    pub fn from_entry(entry: Entry) -> Self {
        Self {
            entry,
            master_key: RwLock::new(None),
        }
    }

    /// Keychain에서 마스터키 로드 (엔트리가 없으면 `None`)
    fn load_master_key(&self) -> Result<Option<MasterKey>> {
        let encoded = match self.entry.get_password() {
            Ok(password) => Zeroizing::new(password),
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(VaultError::Keychain(e.to_string())),
        };

        let decoded = Zeroizing::new(
            BASE64
                .decode(encoded.as_bytes())
                .map_err(|_| VaultError::Keychain("invalid master key encoding".to_string()))?,
        );

        // 길이가 다른 엔트리를 조용히 교체하면 기존 블롭을 모두 잃게 됨
        if decoded.len() != KEY_LEN {
            return Err(VaultError::Keychain("invalid master key length".to_string()));
        }

        let mut key = MasterKey {
            bytes: [0u8; KEY_LEN],
        };
        key.bytes.copy_from_slice(&decoded);
        Ok(Some(key))
    }

    /// Keychain에 마스터키 저장
    fn save_master_key(&self, key: &MasterKey) -> Result<()> {
        let encoded = Zeroizing::new(BASE64.encode(key.bytes));
        self.entry
            .set_password(&encoded)
            .map_err(|e| VaultError::Keychain(e.to_string()))
    }

    async fn with_master_key<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&MasterKey) -> Result<T> + Send,
    {
        self.ensure_keys().await?;
        let guard = self.master_key.read().await;
        let key = guard
            .as_ref()
            .ok_or_else(|| VaultError::Keychain("master key not loaded".to_string()))?;
        f(key)
    }
}

#[async_trait]
impl KeystoreManager for KeyringKeystore {
    async fn ensure_keys(&self) -> Result<()> {
        if self.master_key.read().await.is_some() {
            return Ok(());
        }

        let mut slot = self.master_key.write().await;
        // 쓰기 잠금을 기다리는 동안 다른 호출이 로드했을 수 있음
        if slot.is_some() {
            return Ok(());
        }

        let key = match self.load_master_key()? {
            Some(key) => {
                info!("master key loaded from keychain");
                key
            }
            None => {
                info!("no master key found, generating new one");
                let fresh = crypto::generate_key();
                let key = MasterKey { bytes: *fresh };
                self.save_master_key(&key)?;
                info!("new master key saved to keychain");
                key
            }
        };

        *slot = Some(key);
        Ok(())
    }

    async fn wrap_dek(&self, raw: &[u8]) -> Result<WrappedKey> {
        let wrapped = self.with_master_key(|key| key.wrap(raw)).await?;
        debug!(len = raw.len(), "dek wrapped");
        Ok(wrapped)
    }

    async fn unwrap_dek(&self, wrapped: &WrappedKey) -> Result<Zeroizing<Vec<u8>>> {
        self.with_master_key(|key| key.unwrap(wrapped)).await
    }
}

/// 메모리 Keystore (테스트 및 Keychain이 없는 환경용)
pub struct MemoryKeystore {
    master_key: MasterKey,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        let fresh = crypto::generate_key();
        Self::with_key(*fresh)
    }

    /// 고정 마스터키 사용 (결정적 테스트용)
    pub fn with_key(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            master_key: MasterKey { bytes },
        }
    }
}

impl Default for MemoryKeystore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeystoreManager for MemoryKeystore {
    async fn ensure_keys(&self) -> Result<()> {
        Ok(())
    }

    async fn wrap_dek(&self, raw: &[u8]) -> Result<WrappedKey> {
        self.master_key.wrap(raw)
    }

    async fn unwrap_dek(&self, wrapped: &WrappedKey) -> Result<Zeroizing<Vec<u8>>> {
        self.master_key.unwrap(wrapped)
    }
}
