//! SSH Vault - 자격증명 보관 및 원격 키 프로비저닝 코어
//!
//! 개인키를 봉투 암호화로 보관하고, 원격 호스트 신원을 확인한 뒤,
//! 시간 제한 인가 게이트 아래에서만 키를 꺼내 SSH 작업에 사용합니다.
//!
//! 구성 요소는 모두 생성자 주입으로 조립합니다:
//!
//! ```no_run
//! use std::sync::Arc;
//! use ssh_vault::{
//!     AccessGatekeeper, CredentialVault, Database, KeyringKeystore, ProvisioningOrchestrator,
//!     VaultConfig,
//! };
//! use ssh_vault::transport::scripted::{ScriptedHost, ScriptedTransportFactory};
//!
//! # fn main() -> ssh_vault::Result<()> {
//! let config = VaultConfig::from_env()?;
//! let db = Arc::new(match &config.database_path {
//!     Some(path) => Database::new(path)?,
//!     None => Database::open_in_memory()?,
//! });
//! db.initialize()?;
//! let keystore = Arc::new(KeyringKeystore::from_config(&config)?);
//! let vault = Arc::new(CredentialVault::new(db, keystore, config.key_comment.clone()));
//! let gate = Arc::new(AccessGatekeeper::from_config(&config)?);
//! let transports = Arc::new(ScriptedTransportFactory::new(ScriptedHost::new(Vec::new())));
//!
//! let _orchestrator = ProvisioningOrchestrator::new(gate, vault, transports);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod gate;
pub mod keystore;
pub mod models;
pub mod provision;
pub mod transport;
pub mod vault;
pub mod verifier;

pub use config::VaultConfig;
pub use db::{Database, KeyBlobRepository, MemoryRepository};
pub use error::{ErrorInfo, Result, VaultError};
pub use gate::{AccessGatekeeper, GateState, KeyGate};
pub use keystore::{KeyringKeystore, KeystoreManager, MemoryKeystore};
pub use models::{
    HostPin, HostRecord, HostTarget, KeyBlob, KeyBlobId, KeySummary, ProvisionResult, SealedBox,
    Timeouts, WrappedKey,
};
pub use provision::ProvisioningOrchestrator;
pub use transport::{ExecStream, OutputChunk, OutputKind, SshTransport, TransportFactory};
pub use vault::{CredentialVault, KeyVault};
pub use verifier::{FingerprintVerifier, HostKeyVerifier};
