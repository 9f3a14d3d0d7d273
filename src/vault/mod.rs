//! Credential Vault 모듈
//!
//! 개인키를 봉투 암호화(envelope encryption)로 보관합니다.
//!
//! - 키마다 새 DEK(256-bit)를 만들고 개인키 PEM을 DEK로 암호화
//! - DEK는 Keystore의 마스터키로 감싼 뒤에만 저장 (평문 DEK는 저장하지 않음)
//! - 저장소(`KeyBlobRepository`)와 Keystore는 생성자에서 주입

pub mod pem;

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey, PublicKey};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::{self, KEY_LEN};
use crate::db::KeyBlobRepository;
use crate::error::{Result, VaultError};
use crate::keystore::KeystoreManager;
use crate::models::{KeyBlob, KeyBlobId, KeySummary};

/// 개인키 보관 기능
#[async_trait]
pub trait KeyVault: Send + Sync {
    /// PEM 개인키를 가져와 암호화 저장
    async fn import_private_key_pem(&self, pem: &[u8]) -> Result<KeyBlobId>;

    /// 새 Ed25519 키쌍 생성 후 저장, `(id, OpenSSH 공개키)` 반환
    async fn generate_ed25519(&self) -> Result<(KeyBlobId, String)>;

    /// 저장된 개인키 PEM 복호화
    async fn decrypt_private_key(&self, id: &str) -> Result<Zeroizing<Vec<u8>>>;

    /// 삭제 (없는 id는 no-op)
    async fn delete_key(&self, id: &str) -> Result<()>;

    async fn get_public_key_openssh(&self, id: &str) -> Result<String>;

    /// 구조 검증만 수행 (복호화하지 않음)
    fn validate_private_key_pem(&self, pem: &[u8]) -> bool;

    /// 저장된 키 요약 목록 (암호문 미포함)
    async fn list_keys(&self) -> Result<Vec<KeySummary>>;
}

/// 저장소 + Keystore 기반 Vault
pub struct CredentialVault<R: KeyBlobRepository> {
    repo: Arc<R>,
    keystore: Arc<dyn KeystoreManager>,
    key_comment: String,
}

impl<R: KeyBlobRepository> CredentialVault<R> {
    pub fn new(repo: Arc<R>, keystore: Arc<dyn KeystoreManager>, key_comment: impl Into<String>) -> Self {
        Self {
            repo,
            keystore,
            key_comment: key_comment.into(),
        }
    }

    /// 봉투 암호화 후 저장
    async fn store(&self, algorithm: String, private_pem: &[u8], public_key_openssh: String) -> Result<KeyBlobId> {
        let dek = crypto::generate_key();
        let encrypted = crypto::seal(&dek, private_pem)?;
        let wrapped_dek = self.keystore.wrap_dek(&dek[..]).await?;

        let blob = KeyBlob {
            id: uuid::Uuid::new_v4().to_string(),
            algorithm,
            encrypted,
            wrapped_dek,
            public_key_openssh,
            created_at: chrono::Utc::now().timestamp_millis(),
        };

        self.repo.insert_key_blob(&blob)?;
        info!(key_id = %blob.id, algorithm = %blob.algorithm, "key blob stored");

        Ok(blob.id)
    }

    fn load(&self, id: &str) -> Result<KeyBlob> {
        self.repo
            .get_key_blob_by_id(id)?
            .ok_or_else(|| VaultError::KeyNotFound(id.to_string()))
    }
}

#[async_trait]
impl<R: KeyBlobRepository + 'static> KeyVault for CredentialVault<R> {
    async fn import_private_key_pem(&self, pem: &[u8]) -> Result<KeyBlobId> {
        if !pem::is_valid(pem) {
            return Err(VaultError::InvalidKeyFormat(
                "missing or mismatched PEM private key markers".to_string(),
            ));
        }

        let derived = pem::derive_public_key(pem, &self.key_comment)?;
        self.store(derived.algorithm, pem, derived.openssh).await
    }

    async fn generate_ed25519(&self) -> Result<(KeyBlobId, String)> {
        let private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| VaultError::EncryptionFailed(format!("key generation: {}", e)))?;
        let private_pem = private
            .to_openssh(LineEnding::LF)
            .map_err(|e| VaultError::EncryptionFailed(format!("key encoding: {}", e)))?;

        let public = PublicKey::new(private.public_key().key_data().clone(), self.key_comment.as_str());
        let public_openssh = public
            .to_openssh()
            .map_err(|e| VaultError::EncryptionFailed(format!("public key encoding: {}", e)))?;

        let id = self
            .store(
                Algorithm::Ed25519.as_str().to_string(),
                private_pem.as_bytes(),
                public_openssh.clone(),
            )
            .await?;

        Ok((id, public_openssh))
    }

    async fn decrypt_private_key(&self, id: &str) -> Result<Zeroizing<Vec<u8>>> {
        let blob = self.load(id)?;

        let raw = self.keystore.unwrap_dek(&blob.wrapped_dek).await?;
        if raw.len() != KEY_LEN {
            return Err(VaultError::KeyUnwrapFailure(format!(
                "unexpected DEK length {}",
                raw.len()
            )));
        }
        let mut dek = Zeroizing::new([0u8; KEY_LEN]);
        dek.copy_from_slice(&raw);

        let plaintext = crypto::open(&dek, &blob.encrypted).map_err(|_| {
            VaultError::DecryptionFailure("authentication tag mismatch".to_string())
        })?;

        debug!(key_id = %id, "private key decrypted");
        Ok(plaintext)
    }

    async fn delete_key(&self, id: &str) -> Result<()> {
        if self.repo.get_key_blob_by_id(id)?.is_none() {
            debug!(key_id = %id, "delete requested for unknown key, ignoring");
            return Ok(());
        }

        self.repo.delete_key_blob(id)?;
        info!(key_id = %id, "key blob deleted");
        Ok(())
    }

    async fn get_public_key_openssh(&self, id: &str) -> Result<String> {
        Ok(self.load(id)?.public_key_openssh)
    }

    fn validate_private_key_pem(&self, pem: &[u8]) -> bool {
        pem::is_valid(pem)
    }

    async fn list_keys(&self) -> Result<Vec<KeySummary>> {
        Ok(self
            .repo
            .list_key_blobs()?
            .iter()
            .map(KeySummary::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, MemoryRepository};
    use crate::keystore::MemoryKeystore;
    use der::pem::LineEnding as Pkcs8LineEnding;
    use ed25519_dalek::pkcs8::EncodePrivateKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 삭제 호출 횟수를 기록하는 저장소
    #[derive(Default)]
    struct CountingRepository {
        inner: MemoryRepository,
        deletes: AtomicUsize,
    }

    impl KeyBlobRepository for CountingRepository {
        fn insert_key_blob(&self, blob: &KeyBlob) -> Result<()> {
            self.inner.insert_key_blob(blob)
        }

        fn get_key_blob_by_id(&self, id: &str) -> Result<Option<KeyBlob>> {
            self.inner.get_key_blob_by_id(id)
        }

        fn delete_key_blob(&self, id: &str) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete_key_blob(id)
        }

        fn list_key_blobs(&self) -> Result<Vec<KeyBlob>> {
            self.inner.list_key_blobs()
        }
    }

    fn memory_vault() -> (CredentialVault<CountingRepository>, Arc<CountingRepository>) {
        let repo = Arc::new(CountingRepository::default());
        let vault = CredentialVault::new(repo.clone(), Arc::new(MemoryKeystore::new()), "ops@laptop");
        (vault, repo)
    }

    fn openssh_pem() -> String {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        key.to_openssh(LineEnding::LF).unwrap().to_string()
    }

    /// 저장된 블롭을 변조해서 다시 넣음
    fn tamper(repo: &CountingRepository, id: &str, f: impl FnOnce(&mut KeyBlob)) {
        let mut blob = repo.inner.get_key_blob_by_id(id).unwrap().unwrap();
        f(&mut blob);
        repo.inner.delete_key_blob(id).unwrap();
        repo.inner.insert_key_blob(&blob).unwrap();
    }

    #[tokio::test]
    async fn test_import_decrypt_roundtrip_openssh() {
        let (vault, _) = memory_vault();
        let pem = openssh_pem();

        let id = vault.import_private_key_pem(pem.as_bytes()).await.unwrap();
        let decrypted = vault.decrypt_private_key(&id).await.unwrap();
        assert_eq!(decrypted.as_slice(), pem.as_bytes());
    }

    #[tokio::test]
    async fn test_import_decrypt_roundtrip_pkcs8() {
        let (vault, _) = memory_vault();
        let signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let pem = signing.to_pkcs8_pem(Pkcs8LineEnding::LF).unwrap();

        let id = vault.import_private_key_pem(pem.as_bytes()).await.unwrap();
        assert_eq!(
            vault.decrypt_private_key(&id).await.unwrap().as_slice(),
            pem.as_bytes()
        );
        assert!(vault
            .get_public_key_openssh(&id)
            .await
            .unwrap()
            .starts_with("ssh-ed25519 "));
    }

    #[tokio::test]
    async fn test_validated_legacy_formats_import_and_roundtrip() {
        let (vault, _) = memory_vault();
        let cases = [
            (
                include_str!("testdata/rsa_pkcs1.pem"),
                include_str!("testdata/rsa_pkcs1.pub"),
            ),
            (
                include_str!("testdata/ec_p256_sec1.pem"),
                include_str!("testdata/ec_p256_sec1.pub"),
            ),
            (
                include_str!("testdata/ec_p384_pkcs8.pem"),
                include_str!("testdata/ec_p384_pkcs8.pub"),
            ),
            (
                include_str!("testdata/dsa_legacy.pem"),
                include_str!("testdata/dsa_legacy.pub"),
            ),
        ];

        for (pem, expected_pub) in cases {
            assert!(vault.validate_private_key_pem(pem.as_bytes()));
            let id = vault.import_private_key_pem(pem.as_bytes()).await.unwrap();
            assert_eq!(
                vault.decrypt_private_key(&id).await.unwrap().as_slice(),
                pem.as_bytes()
            );
            let public = vault.get_public_key_openssh(&id).await.unwrap();
            assert!(public.starts_with(expected_pub.trim()), "{}", public);
        }
    }

    #[tokio::test]
    async fn test_stored_blob_never_contains_plaintext() {
        let (vault, repo) = memory_vault();
        let pem = openssh_pem();
        let id = vault.import_private_key_pem(pem.as_bytes()).await.unwrap();

        let blob = repo.get_key_blob_by_id(&id).unwrap().unwrap();
        assert_ne!(blob.encrypted.ciphertext.as_slice(), pem.as_bytes());
        assert_eq!(blob.encrypted.iv.len(), crypto::IV_LEN);
        assert_eq!(blob.encrypted.tag.len(), crypto::TAG_LEN);
        assert_eq!(blob.wrapped_dek.ciphertext.len(), KEY_LEN);
    }

    #[tokio::test]
    async fn test_import_rejects_invalid_pem() {
        let (vault, repo) = memory_vault();
        let err = vault
            .import_private_key_pem(b"ssh-ed25519 AAAAC3Nza not-a-private-key")
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidKeyFormat(_)));
        assert!(repo.list_key_blobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generate_ed25519_public_key_format() {
        let (vault, _) = memory_vault();
        let (id, public) = vault.generate_ed25519().await.unwrap();

        let re = regex::Regex::new(r"^ssh-ed25519 [A-Za-z0-9+/=]+ .+$").unwrap();
        assert!(re.is_match(&public), "unexpected public key: {}", public);
        assert_eq!(vault.get_public_key_openssh(&id).await.unwrap(), public);

        // 복호화한 개인키에서 같은 공개키가 나와야 함
        let pem = vault.decrypt_private_key(&id).await.unwrap();
        let text = std::str::from_utf8(&pem).unwrap();
        let private = PrivateKey::from_openssh(text).unwrap();
        assert_eq!(private.public_key().key_data(), PublicKey::from_openssh(&public).unwrap().key_data());
    }

    #[tokio::test]
    async fn test_unknown_id_is_key_not_found() {
        let (vault, _) = memory_vault();
        assert!(matches!(
            vault.decrypt_private_key("missing").await.unwrap_err(),
            VaultError::KeyNotFound(_)
        ));
        assert!(matches!(
            vault.get_public_key_openssh("missing").await.unwrap_err(),
            VaultError::KeyNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_tampered_payload_fails_decryption() {
        let (vault, repo) = memory_vault();
        let id = vault.import_private_key_pem(openssh_pem().as_bytes()).await.unwrap();

        tamper(&repo, &id, |blob| blob.encrypted.ciphertext[0] ^= 0x01);

        assert!(matches!(
            vault.decrypt_private_key(&id).await.unwrap_err(),
            VaultError::DecryptionFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_tampered_wrapped_dek_fails_unwrap() {
        let (vault, repo) = memory_vault();
        let id = vault.import_private_key_pem(openssh_pem().as_bytes()).await.unwrap();

        tamper(&repo, &id, |blob| blob.wrapped_dek.tag[3] ^= 0x80);

        assert!(matches!(
            vault.decrypt_private_key(&id).await.unwrap_err(),
            VaultError::KeyUnwrapFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_existing_and_missing() {
        let (vault, repo) = memory_vault();

        vault.delete_key("does-not-exist").await.unwrap();
        assert_eq!(repo.deletes.load(Ordering::SeqCst), 0);

        let (id, _) = vault.generate_ed25519().await.unwrap();
        vault.delete_key(&id).await.unwrap();
        assert_eq!(repo.deletes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            vault.decrypt_private_key(&id).await.unwrap_err(),
            VaultError::KeyNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_validate_private_key_pem() {
        let (vault, _) = memory_vault();
        assert!(vault.validate_private_key_pem(openssh_pem().as_bytes()));
        assert!(!vault.validate_private_key_pem(b""));
        assert!(!vault.validate_private_key_pem(b"-----BEGIN CERTIFICATE-----\nMII\n-----END CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn test_list_keys() {
        let (vault, _) = memory_vault();
        let (a, _) = vault.generate_ed25519().await.unwrap();
        let b = vault.import_private_key_pem(openssh_pem().as_bytes()).await.unwrap();

        let mut ids: Vec<String> = vault.list_keys().await.unwrap().into_iter().map(|k| k.id).collect();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_sqlite_backed_vault() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("vault.db")).unwrap();
        db.initialize().unwrap();

        let vault = CredentialVault::new(Arc::new(db), Arc::new(MemoryKeystore::new()), "c@h");
        let pem = openssh_pem();
        let id = vault.import_private_key_pem(pem.as_bytes()).await.unwrap();

        assert_eq!(vault.decrypt_private_key(&id).await.unwrap().as_slice(), pem.as_bytes());
    }

    #[tokio::test]
    async fn test_other_master_key_cannot_decrypt() {
        let repo = Arc::new(MemoryRepository::new());
        let writer = CredentialVault::new(repo.clone(), Arc::new(MemoryKeystore::new()), "c");
        let reader = CredentialVault::new(repo, Arc::new(MemoryKeystore::new()), "c");

        let (id, _) = writer.generate_ed25519().await.unwrap();
        assert!(matches!(
            reader.decrypt_private_key(&id).await.unwrap_err(),
            VaultError::KeyUnwrapFailure(_)
        ));
    }
}
