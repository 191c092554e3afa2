//! 基于 opendal 的仓库后端
//!
//! 目录当作集合，文件当作数据对象。这些存储没有校验和属性，
//! 计算出的校验和保存在 [`ChecksumRegistry`] 中。

use super::{
    parent_remote, ChecksumRegistry, Children, ObjectVersion, RemoteError, RemoteObject,
    Repository, Timeouts,
};
use crate::core::checksum::ChecksumDescriptor;
use async_trait::async_trait;
use opendal::{layers::TimeoutLayer, Metadata, Metakey, Operator, Writer};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// 读写对象时每次传输的块大小，也是分段上传的段大小
const STREAM_CHUNK: usize = 8 * 1024 * 1024;

pub struct OperatorRepository {
    operator: Operator,
    name: String,
    registry: ChecksumRegistry,
    /// 声明的容量，None 表示未知
    capacity: Option<u64>,
    /// S3 单段上传的 ETag 就是内容 md5
    etag_is_md5: bool,
}

impl OperatorRepository {
    /// 本地目录作为仓库（测试和离线环境使用）
    pub fn fs(
        root: &str,
        registry: ChecksumRegistry,
        capacity: Option<u64>,
        timeouts: Timeouts,
    ) -> Result<Self, RemoteError> {
        use opendal::services::Fs;

        let builder = Fs::default().root(root);
        let operator = finish(Operator::new(builder).map_err(classify)?, timeouts);

        Ok(Self {
            operator,
            name: format!("fs://{}", root),
            registry,
            capacity,
            etag_is_md5: false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn s3(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<String>,
        prefix: Option<String>,
        registry: ChecksumRegistry,
        capacity: Option<u64>,
        timeouts: Timeouts,
    ) -> Result<Self, RemoteError> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        if let Some(ref p) = prefix {
            builder = builder.root(p);
        }

        let operator = finish(Operator::new(builder).map_err(classify)?, timeouts);

        let name = format!(
            "s3://{}{}",
            bucket,
            prefix
                .as_deref()
                .map(|p| format!("/{}", p))
                .unwrap_or_default()
        );

        Ok(Self {
            operator,
            name,
            registry,
            capacity,
            etag_is_md5: true,
        })
    }

    pub fn webdav(
        endpoint: &str,
        username: &str,
        password: &str,
        root: Option<String>,
        registry: ChecksumRegistry,
        capacity: Option<u64>,
        timeouts: Timeouts,
    ) -> Result<Self, RemoteError> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default()
            .endpoint(endpoint)
            .username(username)
            .password(password);

        if let Some(ref r) = root {
            builder = builder.root(r);
        }

        let operator = finish(Operator::new(builder).map_err(classify)?, timeouts);

        let name = format!(
            "webdav://{}{}",
            endpoint.trim_end_matches('/'),
            root.as_deref()
                .map(|r| format!("/{}", r.trim_start_matches('/')))
                .unwrap_or_default()
        );

        Ok(Self {
            operator,
            name,
            registry,
            capacity,
            etag_is_md5: false,
        })
    }

    /// 已知的校验和：登记表优先，其次是可信的 ETag
    async fn known_checksum(
        &self,
        path: &str,
        version: &ObjectVersion,
    ) -> Result<Option<String>, RemoteError> {
        let recorded = self
            .registry
            .lookup(&self.name, path, version)
            .await
            .map_err(|e| RemoteError::Unknown(format!("读取校验和登记表失败: {}", e)))?;
        if recorded.is_some() {
            return Ok(recorded);
        }
        Ok(version.etag.as_deref().and_then(|e| self.md5_etag(e)))
    }

    fn md5_etag(&self, etag: &str) -> Option<String> {
        if !self.etag_is_md5 {
            return None;
        }
        // 分段上传的 ETag 带 `-N` 后缀，不是内容 md5
        let etag = etag.trim_matches('"').to_ascii_lowercase();
        (etag.len() == 32 && etag.bytes().all(|b| b.is_ascii_hexdigit())).then_some(etag)
    }
}

fn finish<A: opendal::raw::Access>(
    builder: opendal::OperatorBuilder<A>,
    timeouts: Timeouts,
) -> Operator {
    builder
        .layer(
            TimeoutLayer::default()
                .with_timeout(timeouts.call)
                .with_io_timeout(timeouts.io),
        )
        .finish()
}

fn object_version(meta: &Metadata) -> ObjectVersion {
    ObjectVersion {
        size: meta.content_length(),
        etag: meta.etag().map(str::to_string),
        modified: meta.last_modified().and_then(|t| t.timestamp_nanos_opt()),
    }
}

/// 把本地文件分块写入对象
async fn copy_into(
    file: &mut tokio::fs::File,
    writer: &mut Writer,
    local: &Path,
) -> Result<(), RemoteError> {
    let mut buf = vec![0u8; STREAM_CHUNK];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| RemoteError::from_io(local, &e))?;
        if n == 0 {
            return Ok(());
        }
        writer.write(buf[..n].to_vec()).await.map_err(classify)?;
    }
}

/// opendal 错误归类
fn classify(err: opendal::Error) -> RemoteError {
    let what = err.to_string();
    match err.kind() {
        opendal::ErrorKind::NotFound => RemoteError::NotFound(what),
        opendal::ErrorKind::PermissionDenied => RemoteError::PermissionDenied(what),
        opendal::ErrorKind::RateLimited => RemoteError::NetworkTimeout(what),
        _ if err.is_temporary() => RemoteError::NetworkTimeout(what),
        _ => RemoteError::Unknown(what),
    }
}

/// 远程绝对路径 -> opendal 文件路径
fn file_key(path: &str) -> String {
    path.trim_matches('/').to_string()
}

/// 远程绝对路径 -> opendal 目录路径（以 `/` 结尾，根目录为 `/`）
fn dir_key(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("{}/", trimmed)
    }
}

#[async_trait]
impl Repository for OperatorRepository {
    async fn list_children(&self, path: &str) -> Result<Children, RemoteError> {
        let dir = dir_key(path);
        let entries = self
            .operator
            .list_with(&dir)
            .metakey(
                Metakey::ContentLength | Metakey::Mode | Metakey::Etag | Metakey::LastModified,
            )
            .await
            .map_err(classify)?;

        let mut children = Children::default();
        for entry in entries {
            let entry_path = entry.path();
            // 列表结果包含目录自身
            if entry_path == dir || entry_path.is_empty() || entry_path == "/" {
                continue;
            }

            let meta = entry.metadata();
            let absolute = format!("/{}", entry_path.trim_end_matches('/'));
            if meta.is_dir() {
                children.collections.push(absolute);
            } else {
                let version = object_version(meta);
                let checksum = self.known_checksum(&absolute, &version).await?;
                children.objects.push(RemoteObject {
                    name: entry.name().trim_end_matches('/').to_string(),
                    size: version.size,
                    checksum,
                });
            }
        }

        debug!(
            "列举 {}: {} 个子集合, {} 个对象",
            path,
            children.collections.len(),
            children.objects.len()
        );
        Ok(children)
    }

    async fn object_exists(&self, path: &str) -> Result<bool, RemoteError> {
        match self.operator.stat(&file_key(path)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }

    async fn collection_exists(&self, path: &str) -> Result<bool, RemoteError> {
        let dir = dir_key(path);
        if dir == "/" {
            return Ok(true);
        }
        match self.operator.stat(&dir).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }

    async fn compute_checksum(&self, path: &str) -> Result<String, RemoteError> {
        let key = file_key(path);
        let version = object_version(&self.operator.stat(&key).await.map_err(classify)?);
        if let Some(known) = self.known_checksum(path, &version).await? {
            return Ok(known);
        }

        let reader = self.operator.reader(&key).await.map_err(classify)?;
        let mut hasher = Sha256::new();
        let mut offset = 0u64;
        while offset < version.size {
            let end = version.size.min(offset + STREAM_CHUNK as u64);
            let chunk = reader.read(offset..end).await.map_err(classify)?.to_bytes();
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            hasher.update(&chunk);
        }
        let checksum = ChecksumDescriptor::sha256(hasher.finalize().to_vec()).to_string();

        // 读取期间被其它客户端改写时，算出的值不对应任何一个版本
        let after = object_version(&self.operator.stat(&key).await.map_err(classify)?);
        if after != version || offset != version.size {
            return Err(RemoteError::Unknown(format!("计算校验和期间对象被修改: {}", path)));
        }

        self.registry
            .record(&self.name, path, &version, &checksum)
            .await
            .map_err(|e| RemoteError::Unknown(format!("写入校验和登记表失败: {}", e)))?;

        debug!("计算远程校验和: {} = {}", path, checksum);
        Ok(checksum)
    }

    async fn create_collection(&self, path: &str) -> Result<(), RemoteError> {
        let dir = dir_key(path);
        if dir == "/" {
            return Ok(());
        }
        // 对象存储没有真正的目录，逐级写入目录占位
        let mut ancestors = Vec::new();
        let mut current = Some(path);
        while let Some(p) = current {
            if dir_key(p) == "/" {
                break;
            }
            ancestors.push(dir_key(p));
            current = parent_remote(p);
        }
        for dir in ancestors.into_iter().rev() {
            self.operator.create_dir(&dir).await.map_err(classify)?;
        }
        Ok(())
    }

    async fn put(
        &self,
        local: &Path,
        remote: &str,
        resource: Option<&str>,
    ) -> Result<(), RemoteError> {
        if let Some(resource) = resource {
            debug!("{} 不区分存储资源, 忽略资源 {}", self.name, resource);
        }

        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| RemoteError::from_io(local, &e))?;
        let mut writer = self
            .operator
            .writer_with(&file_key(remote))
            .chunk(STREAM_CHUNK)
            .await
            .map_err(classify)?;
        if let Err(e) = copy_into(&mut file, &mut writer, local).await {
            if let Err(abort) = writer.abort().await {
                warn!("取消上传失败 {}: {}", remote, abort);
            }
            return Err(e);
        }
        writer.close().await.map_err(classify)?;

        // 内容已变，旧的校验和记录作废
        if let Err(e) = self.registry.forget(&self.name, remote).await {
            warn!("清除校验和记录失败 {}: {}", remote, e);
        }
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        let key = file_key(remote);
        let size = self.operator.stat(&key).await.map_err(classify)?.content_length();
        let reader = self.operator.reader(&key).await.map_err(classify)?;

        // 先写临时文件再改名，失败时不留下半截文件
        let part = part_path(local);
        let guard = scopeguard::guard(part.clone(), |p| {
            let _ = std::fs::remove_file(p);
        });
        let io_err = |e: std::io::Error| RemoteError::from_io(&part, &e);
        let mut file = tokio::fs::File::create(&part).await.map_err(io_err)?;
        let mut offset = 0u64;
        while offset < size {
            let end = size.min(offset + STREAM_CHUNK as u64);
            let chunk = reader.read(offset..end).await.map_err(classify)?.to_bytes();
            if chunk.is_empty() {
                return Err(RemoteError::Unknown(format!(
                    "下载中断: {} 只读到 {}/{} 字节",
                    remote, offset, size
                )));
            }
            offset += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(io_err)?;
        }
        file.flush().await.map_err(io_err)?;
        drop(file);

        tokio::fs::rename(&part, local)
            .await
            .map_err(|e| RemoteError::from_io(local, &e))?;
        scopeguard::ScopeGuard::into_inner(guard);
        Ok(())
    }

    async fn free_space(&self, _resource: Option<&str>) -> Result<Option<u64>, RemoteError> {
        Ok(self.capacity)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn part_path(local: &Path) -> PathBuf {
    let mut name = local
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    local.with_file_name(name)
}
