//! Database Schema
//!
//! SQLite 테이블 스키마 정의

/// 데이터베이스 스키마 생성 SQL
pub const CREATE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- 암호화된 개인키 테이블
CREATE TABLE IF NOT EXISTS key_blobs (
    id TEXT PRIMARY KEY,
    algorithm TEXT NOT NULL,
    enc_ciphertext BLOB NOT NULL,
    enc_iv BLOB NOT NULL CHECK (length(enc_iv) = 12),
    enc_tag BLOB NOT NULL CHECK (length(enc_tag) = 16),
    wrap_ciphertext BLOB NOT NULL,
    wrap_iv BLOB NOT NULL CHECK (length(wrap_iv) = 12),
    wrap_tag BLOB NOT NULL CHECK (length(wrap_tag) = 16),
    public_key_openssh TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_key_blobs_created ON key_blobs(created_at);

-- 호스트 테이블
CREATE TABLE IF NOT EXISTS hosts (
    id TEXT PRIMARY KEY,
    hostname TEXT NOT NULL,
    port INTEGER NOT NULL DEFAULT 22,
    username TEXT NOT NULL,
    pinned_algorithm TEXT,      -- NULL이면 아직 핀 없음 (TOFU 대기)
    pinned_fingerprint TEXT,
    key_blob_id TEXT,
    strict_host_key INTEGER NOT NULL DEFAULT 1,
    connect_timeout_ms INTEGER NOT NULL,
    read_timeout_ms INTEGER NOT NULL,
    FOREIGN KEY (key_blob_id) REFERENCES key_blobs(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_hosts_key_blob ON hosts(key_blob_id);
"#;
