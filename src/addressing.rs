//! 内容寻址
//!
//! 从用户标识 + 服务身份派生稳定的存储键，并提供流式 SHA256
//! 校验和计算（大文件不整体读入内存）。

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

use crate::models::CheckpointError;

type Result<T> = std::result::Result<T, CheckpointError>;

/// 流式读取的分块大小
const CHUNK_SIZE: usize = 8 * 1024 * 1024; // 8MB per chunk

/// 派生用户检查点的存储键
///
/// `service_identity` 在服务生命周期内固定，因此 `user_id → storage_key`
/// 的映射稳定。单向哈希，定长十六进制。
pub fn storage_key(service_identity: &str, user_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(service_identity.as_bytes());
    hasher.update(b":");
    hasher.update(user_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// 计算内存数据的 SHA256 校验和
pub fn bytes_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// 流式计算文件的 SHA256 校验和
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| CheckpointError::file_system(format!("打开文件失败 {:?}: {}", path, e)))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| CheckpointError::file_system(format!("读取文件失败 {:?}: {}", path, e)))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// 将用户 ID 转成文件系统安全的目录名
///
/// 保留 `[A-Za-z0-9._-]`；出现替换或结果不安全时追加存储键前缀
/// 保证唯一。注意：有损转换的目录无法从目录名反推用户 ID，重启
/// 扫描依赖元数据行归属（见 seed_local_files）。
pub fn sanitize_user_dir(user_id: &str, storage_key: &str) -> String {
    let mut sanitized = String::with_capacity(user_id.len());
    let mut lossy = false;

    for c in user_id.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            sanitized.push(c);
        } else {
            sanitized.push('-');
            lossy = true;
        }
    }

    if sanitized.is_empty() || sanitized.starts_with('.') {
        lossy = true;
    }

    if lossy {
        let prefix = &storage_key[..storage_key.len().min(8)];
        format!("{}-{}", sanitized.trim_matches('.'), prefix)
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_storage_key_stability() {
        let a = storage_key("svc-1", "@alice:example.org");
        let b = storage_key("svc-1", "@alice:example.org");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        // 服务身份或用户任一变化都必须改变存储键
        assert_ne!(a, storage_key("svc-2", "@alice:example.org"));
        assert_ne!(a, storage_key("svc-1", "@bob:example.org"));
    }

    #[test]
    fn test_file_checksum_matches_bytes_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let payload = b"checkpoint payload".repeat(1000);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&payload)
            .unwrap();

        assert_eq!(file_checksum(&path).unwrap(), bytes_checksum(&payload));
    }

    #[test]
    fn test_sanitize_user_dir() {
        let key = storage_key("svc", "@alice:example.org");

        // 干净 ID 原样保留
        assert_eq!(sanitize_user_dir("alice_01", &key), "alice_01");

        // Matrix 风格 ID 含 @ 和 :，有损转换追加键前缀
        let dir = sanitize_user_dir("@alice:example.org", &key);
        assert!(dir.contains("alice-example.org"));
        assert!(dir.ends_with(&key[..8]));

        // 空 ID 不产生空目录名
        assert!(!sanitize_user_dir("", &key).is_empty());
    }
}
