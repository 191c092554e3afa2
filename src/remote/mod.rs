pub mod icommands;
pub mod operator;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use icommands::IcommandsRepository;
pub use operator::OperatorRepository;
pub use registry::{ChecksumRegistry, ObjectVersion};

// ============ 公共常量 ============

/// 默认的单次远程调用超时（秒）
pub const OP_TIMEOUT_SECS: u64 = 60;
/// 默认的 IO 操作超时（秒）- put, get 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 远程调用超时设置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// 列举、查询、计算校验和等单次调用
    pub call: Duration,
    /// put/get 整个文件
    pub io: Duration,
}

/// 远程调用错误
///
/// 每个远程操作的失败都在这里归类，调用方据此决定重试还是放弃。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("远程路径不存在: {0}")]
    NotFound(String),
    #[error("没有访问权限: {0}")]
    PermissionDenied(String),
    #[error("远程调用超时或连接中断: {0}")]
    NetworkTimeout(String),
    #[error("远程调用失败: {0}")]
    Unknown(String),
}

impl RemoteError {
    /// 超时和连接中断可以重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::NetworkTimeout(_))
    }

    /// 将本地 IO 错误归类（put/get 读写本地文件时使用）
    pub fn from_io(path: &Path, err: &std::io::Error) -> Self {
        let what = format!("{}: {}", path.display(), err);
        match err.kind() {
            std::io::ErrorKind::NotFound => RemoteError::NotFound(what),
            std::io::ErrorKind::PermissionDenied => RemoteError::PermissionDenied(what),
            std::io::ErrorKind::TimedOut => RemoteError::NetworkTimeout(what),
            _ => RemoteError::Unknown(what),
        }
    }
}

/// 远程数据对象（集合中的叶子条目）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteObject {
    pub name: String,
    pub size: u64,
    /// 原始校验和描述符，例如 `sha2:<base64>` 或 32 位 md5 十六进制
    pub checksum: Option<String>,
}

/// 一个集合的直接子项
#[derive(Debug, Clone, Default)]
pub struct Children {
    /// 子集合的绝对路径
    pub collections: Vec<String>,
    pub objects: Vec<RemoteObject>,
}

/// 远程仓库抽象接口
///
/// 命令行（icommands）和 API（opendal）两种后端都实现这个接口，
/// 差异引擎和校验逻辑只依赖这里。
#[async_trait]
pub trait Repository: Send + Sync {
    /// 列出集合的直接子集合和数据对象
    async fn list_children(&self, path: &str) -> Result<Children, RemoteError>;

    async fn object_exists(&self, path: &str) -> Result<bool, RemoteError>;

    async fn collection_exists(&self, path: &str) -> Result<bool, RemoteError>;

    /// 计算并保存对象的校验和，返回描述符。已有校验和时直接返回。
    async fn compute_checksum(&self, path: &str) -> Result<String, RemoteError>;

    /// 创建集合（包括缺失的上级集合），已存在时不报错
    async fn create_collection(&self, path: &str) -> Result<(), RemoteError>;

    /// 上传本地文件，覆盖已有对象
    async fn put(&self, local: &Path, remote: &str, resource: Option<&str>)
        -> Result<(), RemoteError>;

    /// 下载对象到本地文件，覆盖已有文件
    async fn get(&self, remote: &str, local: &Path) -> Result<(), RemoteError>;

    /// 资源剩余空间（字节），None 表示资源没有报告剩余空间
    async fn free_space(&self, resource: Option<&str>) -> Result<Option<u64>, RemoteError>;

    /// 获取仓库名称（用于日志）
    fn name(&self) -> &str;
}

/// 仓库连接句柄
///
/// 显式传给目录扫描、差异分析和传输执行，所有远程调用都经过这里的超时控制。
#[derive(Clone)]
pub struct Connection {
    repo: Arc<dyn Repository>,
    timeout: Duration,
    /// put/get 的超时，默认与 `timeout` 相同
    io_timeout: Duration,
}

impl Connection {
    pub fn new(repo: Arc<dyn Repository>, timeout: Duration) -> Self {
        Self {
            repo,
            timeout,
            io_timeout: timeout,
        }
    }

    pub fn with_timeouts(repo: Arc<dyn Repository>, timeouts: Timeouts) -> Self {
        Self::new(repo, timeouts.call).with_io_timeout(timeouts.io)
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn name(&self) -> &str {
        self.repo.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub async fn list_children(&self, path: &str) -> Result<Children, RemoteError> {
        self.guard(path, self.repo.list_children(path)).await
    }

    pub async fn object_exists(&self, path: &str) -> Result<bool, RemoteError> {
        self.guard(path, self.repo.object_exists(path)).await
    }

    pub async fn collection_exists(&self, path: &str) -> Result<bool, RemoteError> {
        self.guard(path, self.repo.collection_exists(path)).await
    }

    pub async fn compute_checksum(&self, path: &str) -> Result<String, RemoteError> {
        self.guard(path, self.repo.compute_checksum(path)).await
    }

    pub async fn create_collection(&self, path: &str) -> Result<(), RemoteError> {
        self.guard(path, self.repo.create_collection(path)).await
    }

    pub async fn put(
        &self,
        local: &Path,
        remote: &str,
        resource: Option<&str>,
    ) -> Result<(), RemoteError> {
        with_timeout(self.io_timeout, remote, self.repo.put(local, remote, resource)).await
    }

    pub async fn get(&self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        with_timeout(self.io_timeout, remote, self.repo.get(remote, local)).await
    }

    pub async fn free_space(&self, resource: Option<&str>) -> Result<Option<u64>, RemoteError> {
        let what = resource.unwrap_or("默认资源");
        self.guard(what, self.repo.free_space(resource)).await
    }

    async fn guard<T>(
        &self,
        what: &str,
        fut: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        with_timeout(self.timeout, what, fut).await
    }
}

async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::NetworkTimeout(format!(
            "{} ({}s)",
            what,
            limit.as_secs_f64()
        ))),
    }
}

/// 拼接远程路径：根集合 + 相对路径
pub fn join_remote(root: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    let root = root.trim_end_matches('/');
    if relative.is_empty() {
        if root.is_empty() {
            "/".to_string()
        } else {
            root.to_string()
        }
    } else {
        format!("{}/{}", root, relative)
    }
}

/// 远程路径的上级集合，根路径返回 None
pub fn parent_remote(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        if trimmed.len() > 1 {
            Some("/")
        } else {
            None
        }
    } else {
        Some(&trimmed[..idx])
    }
}

/// 根据配置创建仓库实例
pub async fn create_repository(
    config: &crate::config::RepositoryConfig,
    state_dir: &Path,
    timeouts: Timeouts,
) -> Result<Arc<dyn Repository>> {
    use crate::config::RepositoryConfig;

    match config {
        RepositoryConfig::Icommands { default_resource } => {
            tracing::info!("使用 icommands 后端, 默认资源: {:?}", default_resource);
            Ok(Arc::new(IcommandsRepository::new(default_resource.clone())?)
                as Arc<dyn Repository>)
        }
        RepositoryConfig::Fs { root, capacity_bytes } => {
            let registry = ChecksumRegistry::open(&state_dir.join("checksums.db")).await?;
            tracing::info!("使用本地目录仓库: {}", root);
            Ok(Arc::new(OperatorRepository::fs(root, registry, *capacity_bytes, timeouts)?)
                as Arc<dyn Repository>)
        }
        RepositoryConfig::S3 {
            bucket,
            region,
            access_key,
            secret_key,
            endpoint,
            prefix,
            capacity_bytes,
        } => {
            let registry = ChecksumRegistry::open(&state_dir.join("checksums.db")).await?;
            tracing::info!("初始化S3仓库: bucket={}, region={}", bucket, region);
            Ok(Arc::new(OperatorRepository::s3(
                bucket,
                region,
                access_key,
                secret_key,
                endpoint.clone(),
                prefix.clone(),
                registry,
                *capacity_bytes,
                timeouts,
            )?) as Arc<dyn Repository>)
        }
        RepositoryConfig::Webdav {
            endpoint,
            username,
            password,
            root,
            capacity_bytes,
        } => {
            let registry = ChecksumRegistry::open(&state_dir.join("checksums.db")).await?;
            tracing::info!("创建WebDAV仓库: endpoint={}, root={:?}", endpoint, root);
            Ok(Arc::new(OperatorRepository::webdav(
                endpoint,
                username,
                password,
                root.clone(),
                registry,
                *capacity_bytes,
                timeouts,
            )?) as Arc<dyn Repository>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeRepository;
    use super::*;

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/zone/home", "a/b.txt"), "/zone/home/a/b.txt");
        assert_eq!(join_remote("/zone/home/", "/a"), "/zone/home/a");
        assert_eq!(join_remote("/zone/home", ""), "/zone/home");
        assert_eq!(join_remote("/", "a"), "/a");
    }

    #[test]
    fn test_parent_remote() {
        assert_eq!(parent_remote("/zone/home/a.txt"), Some("/zone/home"));
        assert_eq!(parent_remote("/zone"), Some("/"));
        assert_eq!(parent_remote("/"), None);
    }

    #[tokio::test]
    async fn test_connection_times_out_slow_calls() {
        let fake = Arc::new(FakeRepository::new("/zone").with_latency(Duration::from_millis(200)));
        let conn = Connection::new(fake, Duration::from_millis(20));

        let err = conn.list_children("/zone").await.unwrap_err();
        assert!(matches!(err, RemoteError::NetworkTimeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_transfers_use_configured_io_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"a").unwrap();
        let fake = Arc::new(FakeRepository::new("/zone").with_latency(Duration::from_millis(300)));

        // 没有单独设置时 put/get 使用同一个超时
        let conn = Connection::new(fake.clone(), Duration::from_millis(20));
        let err = conn.put(&local, "/zone/a.txt", None).await.unwrap_err();
        assert!(matches!(err, RemoteError::NetworkTimeout(_)));
        let err = conn.get("/zone/a.txt", &dir.path().join("b.txt")).await.unwrap_err();
        assert!(matches!(err, RemoteError::NetworkTimeout(_)));

        let conn = Connection::with_timeouts(
            fake.clone(),
            Timeouts {
                call: Duration::from_millis(20),
                io: Duration::from_secs(5),
            },
        );
        assert_eq!(conn.io_timeout(), Duration::from_secs(5));
        conn.put(&local, "/zone/a.txt", None).await.unwrap();
        assert!(matches!(
            conn.list_children("/zone").await,
            Err(RemoteError::NetworkTimeout(_))
        ));
    }

    #[test]
    fn test_io_errors_are_classified() {
        let path = Path::new("/tmp/x");
        let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(
            RemoteError::from_io(path, &err),
            RemoteError::PermissionDenied(_)
        ));
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(matches!(RemoteError::from_io(path, &err), RemoteError::NotFound(_)));
    }
}
