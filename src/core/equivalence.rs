//! 内容等价判断

use crate::core::catalog::PathEntry;
use crate::core::checksum::{ChecksumDescriptor, ChecksumError, HashAlgorithm};
use crate::remote::{join_remote, Connection, RemoteError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

/// 等价判断策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquivalencePolicy {
    /// 只比较大小
    #[default]
    Size,
    /// 比较内容校验和
    Checksum,
}

impl FromStr for EquivalencePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "size" => Ok(Self::Size),
            "checksum" => Ok(Self::Checksum),
            other => Err(format!("未知的比较策略: {} (可选 size, checksum)", other)),
        }
    }
}

impl fmt::Display for EquivalencePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Size => write!(f, "size"),
            Self::Checksum => write!(f, "checksum"),
        }
    }
}

/// 无法判断是否等价（路径将被报告为未分类）
#[derive(Debug, Error)]
pub enum EquivalenceError {
    #[error("计算远程校验和失败: {0}")]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Local(#[from] ChecksumError),
}

/// 只比较大小
pub fn equivalent_by_size(local: &PathEntry, remote: &PathEntry) -> bool {
    local.size == remote.size
}

/// 等价判断器
///
/// 校验和策略下，远程对象没有校验和时会触发远程计算并保存，
/// 这是一次对远程仓库的写操作，方法名里明确写出。
#[derive(Clone)]
pub struct EquivalenceChecker {
    conn: Connection,
    local_root: PathBuf,
    remote_root: String,
    policy: EquivalencePolicy,
}

impl EquivalenceChecker {
    pub fn new(
        conn: Connection,
        local_root: impl Into<PathBuf>,
        remote_root: impl Into<String>,
        policy: EquivalencePolicy,
    ) -> Self {
        Self {
            conn,
            local_root: local_root.into(),
            remote_root: remote_root.into(),
            policy,
        }
    }

    pub fn policy(&self) -> EquivalencePolicy {
        self.policy
    }

    /// 判断本地文件和远程对象内容是否等价，必要时回填远程校验和
    ///
    /// - 大小策略：大小相等即等价，不做任何 IO
    /// - 校验和策略：远程没有校验和时先在远程计算；sha2 比较摘要字节，
    ///   md5 比较十六进制；计算后仍拿不到可用的校验和视为不等价
    ///
    /// 可重试的远程错误（超时）和本地读取失败返回 `Err`，调用方应把该路径视为无法分类。
    pub async fn equivalent_and_backfill_checksum(
        &self,
        local: &PathEntry,
        remote: &PathEntry,
    ) -> Result<bool, EquivalenceError> {
        match self.policy {
            EquivalencePolicy::Size => Ok(equivalent_by_size(local, remote)),
            EquivalencePolicy::Checksum => self.equivalent_by_checksum(local, remote).await,
        }
    }

    async fn equivalent_by_checksum(
        &self,
        local: &PathEntry,
        remote: &PathEntry,
    ) -> Result<bool, EquivalenceError> {
        let descriptor = match &remote.checksum {
            Some(desc) => desc.clone(),
            None => match self.backfill(&remote.path).await? {
                Some(desc) => desc,
                None => return Ok(false),
            },
        };

        if descriptor.algorithm == HashAlgorithm::Unknown {
            debug!("{}: 远程校验和算法未知, 视为不同", remote.path);
            return Ok(false);
        }

        let local_path = self.local_root.join(&local.path);
        Ok(descriptor.matches_local_file(&local_path).await?)
    }

    /// 在远程计算并保存校验和
    ///
    /// 超时类错误向上返回；其它失败（权限、对象已消失等）返回 None，按不等价处理。
    async fn backfill(&self, relative: &str) -> Result<Option<ChecksumDescriptor>, RemoteError> {
        let remote_path = join_remote(&self.remote_root, relative);
        debug!("远程对象没有校验和, 开始计算: {}", remote_path);

        match self.conn.compute_checksum(&remote_path).await {
            Ok(raw) => Ok(ChecksumDescriptor::parse_optional(Some(&raw))),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                warn!("计算远程校验和失败, 视为不同: {} - {}", remote_path, e);
                Ok(None)
            }
        }
    }
}
