//! Database Module
//!
//! 키 블롭/호스트 저장소. Vault는 `KeyBlobRepository`만 알고 있으며
//! 실제 저장 매체(SQLite, 메모리)는 생성자에서 주입됩니다.

mod schema;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::{Result, VaultError};
use crate::models::{HostPin, HostRecord, KeyBlob, SealedBox, Timeouts};

/// Vault가 사용하는 키 블롭 저장소 계약
pub trait KeyBlobRepository: Send + Sync {
    fn insert_key_blob(&self, blob: &KeyBlob) -> Result<()>;

    fn get_key_blob_by_id(&self, id: &str) -> Result<Option<KeyBlob>>;

    fn delete_key_blob(&self, id: &str) -> Result<()>;

    /// 생성 시각 오름차순
    fn list_key_blobs(&self) -> Result<Vec<KeyBlob>>;
}

fn lock_poisoned() -> VaultError {
    VaultError::Io(std::io::Error::other("database lock poisoned"))
}

/// SQLite 데이터베이스 래퍼
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// 새 데이터베이스 연결 생성
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 메모리 DB (테스트용)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 데이터베이스 스키마 초기화
    pub fn initialize(&self) -> Result<()> {
        self.conn()?.execute_batch(schema::CREATE_SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| lock_poisoned())
    }

    /// 호스트 저장 (있으면 덮어씀)
    pub fn save_host(&self, host: &HostRecord) -> Result<()> {
        let (pinned_algorithm, pinned_fingerprint) = match &host.pinned {
            Some(pin) => (Some(pin.algorithm.as_str()), Some(pin.fingerprint.as_str())),
            None => (None, None),
        };
        let connect_ms = timeout_column(host.timeouts.connect_ms)?;
        let read_ms = timeout_column(host.timeouts.read_ms)?;

        self.conn()?.execute(
            "INSERT OR REPLACE INTO hosts (id, hostname, port, username, pinned_algorithm,
                 pinned_fingerprint, key_blob_id, strict_host_key, connect_timeout_ms, read_timeout_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            (
                &host.id,
                &host.hostname,
                i64::from(host.port),
                &host.username,
                pinned_algorithm,
                pinned_fingerprint,
                host.key_blob_id.as_deref(),
                host.strict_host_key,
                connect_ms,
                read_ms,
            ),
        )?;
        Ok(())
    }

    /// 호스트 조회
    pub fn get_host(&self, id: &str) -> Result<Option<HostRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, hostname, port, username, pinned_algorithm, pinned_fingerprint,
                    key_blob_id, strict_host_key, connect_timeout_ms, read_timeout_ms
             FROM hosts WHERE id = ?1",
        )?;
        let host = stmt.query_row([id], host_from_row).optional()?;
        Ok(host)
    }

    /// 최초 접속(TOFU)에서 관측한 핀을 기준값으로 저장
    pub fn pin_host(&self, id: &str, pin: &HostPin) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE hosts SET pinned_algorithm = ?1, pinned_fingerprint = ?2 WHERE id = ?3",
            (&pin.algorithm, &pin.fingerprint, id),
        )?;
        if updated == 0 {
            return Err(VaultError::InvalidConfig(format!("unknown host: {}", id)));
        }
        Ok(())
    }
}

impl KeyBlobRepository for Database {
    fn insert_key_blob(&self, blob: &KeyBlob) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO key_blobs (id, algorithm, enc_ciphertext, enc_iv, enc_tag,
                 wrap_ciphertext, wrap_iv, wrap_tag, public_key_openssh, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            (
                &blob.id,
                &blob.algorithm,
                &blob.encrypted.ciphertext,
                &blob.encrypted.iv,
                &blob.encrypted.tag,
                &blob.wrapped_dek.ciphertext,
                &blob.wrapped_dek.iv,
                &blob.wrapped_dek.tag,
                &blob.public_key_openssh,
                blob.created_at,
            ),
        )?;
        Ok(())
    }

    fn get_key_blob_by_id(&self, id: &str) -> Result<Option<KeyBlob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, algorithm, enc_ciphertext, enc_iv, enc_tag, wrap_ciphertext, wrap_iv,
                    wrap_tag, public_key_openssh, created_at
             FROM key_blobs WHERE id = ?1",
        )?;
        let blob = stmt.query_row([id], key_blob_from_row).optional()?;
        Ok(blob)
    }

    fn delete_key_blob(&self, id: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM key_blobs WHERE id = ?1", [id])?;
        Ok(())
    }

    fn list_key_blobs(&self) -> Result<Vec<KeyBlob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, algorithm, enc_ciphertext, enc_iv, enc_tag, wrap_ciphertext, wrap_iv,
                    wrap_tag, public_key_openssh, created_at
             FROM key_blobs ORDER BY created_at, id",
        )?;
        let iter = stmt.query_map([], key_blob_from_row)?;
        let mut out = Vec::new();
        for blob in iter {
            out.push(blob?);
        }
        Ok(out)
    }
}

fn key_blob_from_row(row: &Row<'_>) -> rusqlite::Result<KeyBlob> {
    Ok(KeyBlob {
        id: row.get(0)?,
        algorithm: row.get(1)?,
        encrypted: SealedBox {
            ciphertext: row.get(2)?,
            iv: row.get(3)?,
            tag: row.get(4)?,
        },
        wrapped_dek: SealedBox {
            ciphertext: row.get(5)?,
            iv: row.get(6)?,
            tag: row.get(7)?,
        },
        public_key_openssh: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn timeout_column(ms: u64) -> Result<i64> {
    i64::try_from(ms)
        .map_err(|_| VaultError::InvalidConfig(format!("timeout out of range: {} ms", ms)))
}

/// INTEGER 컬럼을 범위 검사하며 읽기
fn integer_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: TryFrom<i64>,
    T::Error: std::error::Error + Send + Sync + 'static,
{
    let value: i64 = row.get(idx)?;
    T::try_from(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, Box::new(e))
    })
}

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<HostRecord> {
    let pinned_algorithm: Option<String> = row.get(4)?;
    let pinned_fingerprint: Option<String> = row.get(5)?;

    Ok(HostRecord {
        id: row.get(0)?,
        hostname: row.get(1)?,
        port: integer_column(row, 2)?,
        username: row.get(3)?,
        // 두 컬럼이 모두 있어야 유효한 핀
        pinned: match (pinned_algorithm, pinned_fingerprint) {
            (Some(algorithm), Some(fingerprint)) => Some(HostPin::new(algorithm, fingerprint)),
            _ => None,
        },
        key_blob_id: row.get(6)?,
        strict_host_key: row.get(7)?,
        timeouts: Timeouts {
            connect_ms: integer_column(row, 8)?,
            read_ms: integer_column(row, 9)?,
        },
    })
}

/// 메모리 저장소 (테스트 및 임시 세션용)
#[derive(Default)]
pub struct MemoryRepository {
    blobs: Mutex<HashMap<String, KeyBlob>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> Result<MutexGuard<'_, HashMap<String, KeyBlob>>> {
        self.blobs.lock().map_err(|_| lock_poisoned())
    }
}

impl KeyBlobRepository for MemoryRepository {
    fn insert_key_blob(&self, blob: &KeyBlob) -> Result<()> {
        let mut blobs = self.blobs()?;
        if blobs.contains_key(&blob.id) {
            return Err(VaultError::InvalidConfig(format!(
                "duplicate key blob id: {}",
                blob.id
            )));
        }
        blobs.insert(blob.id.clone(), blob.clone());
        Ok(())
    }

    fn get_key_blob_by_id(&self, id: &str) -> Result<Option<KeyBlob>> {
        Ok(self.blobs()?.get(id).cloned())
    }

    fn delete_key_blob(&self, id: &str) -> Result<()> {
        self.blobs()?.remove(id);
        Ok(())
    }

    fn list_key_blobs(&self) -> Result<Vec<KeyBlob>> {
        let mut out: Vec<KeyBlob> = self.blobs()?.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }
}
