//! 校验和描述符
//!
//! 远程系统保存的校验和有两种格式：`sha2:` 前缀加 base64 编码的 SHA-256，
//! 或者不带前缀的 32 位小写十六进制 md5。

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use md5::Md5;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 读取本地文件的块大小
const READ_CHUNK: usize = 128 * 1024;

const SHA2_PREFIX: &str = "sha2:";

/// 校验算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Md5,
    Unknown,
}

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("空的校验和")]
    Empty,
    #[error("无效的 sha2 校验和: {0}")]
    InvalidSha2(String),
    #[error("无法计算未知算法的本地校验和")]
    UnsupportedAlgorithm,
    #[error("读取本地文件失败 {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 校验和描述符
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChecksumDescriptor {
    pub algorithm: HashAlgorithm,
    pub digest: Vec<u8>,
}

impl ChecksumDescriptor {
    pub fn sha256(digest: Vec<u8>) -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256,
            digest,
        }
    }

    pub fn md5(digest: Vec<u8>) -> Self {
        Self {
            algorithm: HashAlgorithm::Md5,
            digest,
        }
    }

    /// 解析远程系统返回的描述符字符串
    ///
    /// 既不是 `sha2:` 也不是 32 位十六进制的值归为 `Unknown`，原样保留字节。
    pub fn parse(raw: &str) -> Result<Self, ChecksumError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ChecksumError::Empty);
        }

        if let Some(encoded) = raw.strip_prefix(SHA2_PREFIX) {
            let digest = STANDARD
                .decode(encoded)
                .map_err(|_| ChecksumError::InvalidSha2(raw.to_string()))?;
            if digest.len() != 32 {
                return Err(ChecksumError::InvalidSha2(raw.to_string()));
            }
            return Ok(Self::sha256(digest));
        }

        if let Some(digest) = decode_md5_hex(raw) {
            return Ok(Self::md5(digest));
        }

        Ok(Self {
            algorithm: HashAlgorithm::Unknown,
            digest: raw.as_bytes().to_vec(),
        })
    }

    /// 解析可选描述符，空值和无效值都视为没有校验和
    pub fn parse_optional(raw: Option<&str>) -> Option<Self> {
        let raw = raw?;
        match Self::parse(raw) {
            Ok(desc) => Some(desc),
            Err(ChecksumError::Empty) => None,
            Err(e) => {
                tracing::debug!("忽略无法解析的校验和 {:?}: {}", raw, e);
                None
            }
        }
    }

    /// 计算本地文件在指定算法下的描述符
    pub async fn of_local_file(
        path: &Path,
        algorithm: HashAlgorithm,
    ) -> Result<Self, ChecksumError> {
        let path = path.to_path_buf();
        // 哈希计算放到阻塞线程池，避免占用 async runtime
        tokio::task::spawn_blocking(move || Self::of_local_file_blocking(&path, algorithm))
            .await
            .map_err(|e| ChecksumError::Io {
                path: PathBuf::new(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?
    }

    fn of_local_file_blocking(path: &Path, algorithm: HashAlgorithm) -> Result<Self, ChecksumError> {
        let io_err = |source| ChecksumError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = std::fs::File::open(path).map_err(io_err)?;

        match algorithm {
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                stream_into(&mut file, |chunk| hasher.update(chunk)).map_err(io_err)?;
                Ok(Self::sha256(hasher.finalize().to_vec()))
            }
            HashAlgorithm::Md5 => {
                let mut hasher = Md5::new();
                stream_into(&mut file, |chunk| hasher.update(chunk)).map_err(io_err)?;
                Ok(Self::md5(hasher.finalize().to_vec()))
            }
            HashAlgorithm::Unknown => Err(ChecksumError::UnsupportedAlgorithm),
        }
    }

    /// 本地文件内容是否与描述符一致
    pub async fn matches_local_file(&self, path: &Path) -> Result<bool, ChecksumError> {
        if self.algorithm == HashAlgorithm::Unknown {
            return Ok(false);
        }
        let local = Self::of_local_file(path, self.algorithm).await?;
        Ok(local.digest == self.digest)
    }

    /// 十六进制形式（md5 比较使用小写十六进制）
    pub fn hex(&self) -> String {
        to_hex(&self.digest)
    }
}

impl fmt::Display for ChecksumDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.algorithm {
            HashAlgorithm::Sha256 => write!(f, "{}{}", SHA2_PREFIX, STANDARD.encode(&self.digest)),
            HashAlgorithm::Md5 => write!(f, "{}", self.hex()),
            HashAlgorithm::Unknown => write!(f, "{}", String::from_utf8_lossy(&self.digest)),
        }
    }
}

/// 对内存数据计算 `sha2:` 描述符
pub fn sha256_descriptor(data: &[u8]) -> String {
    ChecksumDescriptor::sha256(Sha256::digest(data).to_vec()).to_string()
}

fn stream_into(file: &mut std::fs::File, mut update: impl FnMut(&[u8])) -> std::io::Result<()> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        update(&buf[..n]);
    }
}

fn decode_md5_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() != 32 || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..32)
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn test_parse_sha2_descriptor() {
        let digest = Sha256::digest(b"hello").to_vec();
        let raw = format!("sha2:{}", STANDARD.encode(&digest));

        let desc = ChecksumDescriptor::parse(&raw).unwrap();
        assert_eq!(desc.algorithm, HashAlgorithm::Sha256);
        assert_eq!(desc.digest, digest);
        assert_eq!(desc.to_string(), raw);
    }

    #[test]
    fn test_parse_md5_descriptor() {
        // md5("hello")
        let raw = "5d41402abc4b2a76b9719d911017c592";
        let desc = ChecksumDescriptor::parse(raw).unwrap();
        assert_eq!(desc.algorithm, HashAlgorithm::Md5);
        assert_eq!(desc.digest.len(), 16);
        assert_eq!(desc.hex(), raw);
    }

    #[test]
    fn test_parse_unknown_and_invalid() {
        let desc = ChecksumDescriptor::parse("adler32:1234").unwrap();
        assert_eq!(desc.algorithm, HashAlgorithm::Unknown);

        assert!(matches!(
            ChecksumDescriptor::parse("sha2:not base64!"),
            Err(ChecksumError::InvalidSha2(_))
        ));
        // 长度不对的 sha2 也是无效的
        let short = format!("sha2:{}", STANDARD.encode([1u8, 2, 3]));
        assert!(ChecksumDescriptor::parse(&short).is_err());

        assert!(matches!(ChecksumDescriptor::parse("  "), Err(ChecksumError::Empty)));
        assert!(ChecksumDescriptor::parse_optional(Some("")).is_none());
        assert!(ChecksumDescriptor::parse_optional(None).is_none());
    }

    #[tokio::test]
    async fn test_local_file_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"hello");

        let sha = ChecksumDescriptor::of_local_file(&path, HashAlgorithm::Sha256)
            .await
            .unwrap();
        assert_eq!(sha.to_string(), sha256_descriptor(b"hello"));

        let md5 = ChecksumDescriptor::of_local_file(&path, HashAlgorithm::Md5)
            .await
            .unwrap();
        assert_eq!(md5.hex(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[tokio::test]
    async fn test_matches_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.bin", &vec![7u8; 300 * 1024]);

        let desc = ChecksumDescriptor::parse(&sha256_descriptor(&vec![7u8; 300 * 1024])).unwrap();
        assert!(desc.matches_local_file(&path).await.unwrap());

        let mut changed = vec![7u8; 300 * 1024];
        changed[150_000] = 8;
        write_file(dir.path(), "a.bin", &changed);
        assert!(!desc.matches_local_file(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_local_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result =
            ChecksumDescriptor::of_local_file(&dir.path().join("nope"), HashAlgorithm::Sha256).await;
        assert!(matches!(result, Err(ChecksumError::Io { .. })));
    }
}
