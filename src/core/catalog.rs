use crate::core::checksum::ChecksumDescriptor;
use crate::core::task::{report, Progress};
use crate::remote::{join_remote, Connection, RemoteError};
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 目录扫描配置
#[derive(Debug, Clone)]
pub struct CatalogOptions {
    /// 最大层级，1 表示只包含根目录下的文件，None 表示不限制
    pub max_level: Option<usize>,
    /// 远程并发列举数
    pub max_concurrent: usize,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            max_level: None,
            max_concurrent: 4,
        }
    }
}

impl CatalogOptions {
    fn file_in_range(&self, depth: usize) -> bool {
        self.max_level.map_or(true, |max| depth <= max)
    }

    fn dir_in_range(&self, depth: usize) -> bool {
        self.max_level.map_or(true, |max| depth < max)
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("本地路径不是目录: {0}")]
    NotADirectory(PathBuf),
    #[error("远程集合不存在: {0}")]
    RemoteCollectionMissing(String),
    #[error("没有读取权限: {0}")]
    PermissionDenied(String),
    #[error("读取本地目录失败 {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("操作已取消")]
    Cancelled,
}

/// 目录中的一个文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    /// 相对根目录的路径，使用 `/` 分隔
    pub path: String,
    pub size: u64,
    pub checksum: Option<ChecksumDescriptor>,
}

impl PathEntry {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            checksum: None,
        }
    }

    pub fn with_checksum(mut self, checksum: Option<ChecksumDescriptor>) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/')
    }

    /// 路径深度，根目录下的文件为 1
    pub fn depth(&self) -> usize {
        self.segments().count()
    }
}

/// 扫描失败的远程子树
#[derive(Debug, Clone)]
pub struct FailedSubtree {
    /// 相对路径前缀
    pub prefix: String,
    pub error: RemoteError,
}

/// 文件目录：相对路径 -> 文件条目
///
/// 每次差异分析构建一次，构建后不再修改。
#[derive(Debug, Clone, Default)]
pub struct PathCatalog {
    root: String,
    entries: HashMap<String, PathEntry>,
    /// 目录/集合的相对路径（包括空目录）
    collections: BTreeSet<String>,
    failed: Vec<FailedSubtree>,
}

impl PathCatalog {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// 从条目列表构建（用于测试和外部清单）
    pub fn from_entries(root: impl Into<String>, entries: impl IntoIterator<Item = PathEntry>) -> Self {
        let mut catalog = Self::new(root);
        for entry in entries {
            catalog.insert(entry);
        }
        catalog
    }

    pub fn with_collection(mut self, path: impl Into<String>) -> Self {
        self.collections.insert(path.into());
        self
    }

    fn insert(&mut self, entry: PathEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&PathEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PathEntry> {
        self.entries.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn collections(&self) -> &BTreeSet<String> {
        &self.collections
    }

    pub fn is_collection(&self, path: &str) -> bool {
        self.collections.contains(path)
    }

    /// 列举失败的子树（只有远程目录会出现）
    pub fn failed_subtrees(&self) -> &[FailedSubtree] {
        &self.failed
    }

    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    /// 扫描本地目录
    ///
    /// 每个普通文件一个条目，大小为文件长度，校验和留空（需要时再计算）。
    /// 符号链接不跟随。空目录不产生条目，只记录在目录集合中。
    pub async fn build_local(root: &Path, options: &CatalogOptions) -> Result<Self, CatalogError> {
        let root = root.to_path_buf();
        let options = options.clone();

        // 使用 spawn_blocking 避免阻塞 async runtime
        tokio::task::spawn_blocking(move || Self::build_local_blocking(&root, &options))
            .await
            .map_err(|e| CatalogError::Io {
                path: PathBuf::new(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?
    }

    fn build_local_blocking(root: &Path, options: &CatalogOptions) -> Result<Self, CatalogError> {
        match std::fs::metadata(root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(CatalogError::NotADirectory(root.to_path_buf())),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(CatalogError::PermissionDenied(root.display().to_string()))
            }
            Err(_) => return Err(CatalogError::NotADirectory(root.to_path_buf())),
        }
        if let Err(e) = std::fs::read_dir(root) {
            return Err(local_error(root, e));
        }

        info!("开始扫描本地目录: {}", root.display());

        let mut catalog = Self::new(root.display().to_string());
        let mut walker = WalkDir::new(root).follow_links(false).min_depth(1);
        if let Some(max) = options.max_level {
            walker = walker.max_depth(max.max(1));
        }

        let mut skipped = 0usize;
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let path = e.path().unwrap_or(root).to_path_buf();
                    return Err(match e.into_io_error() {
                        Some(io) => local_error(&path, io),
                        None => CatalogError::Io {
                            path,
                            source: std::io::Error::new(
                                std::io::ErrorKind::Other,
                                "文件系统循环链接",
                            ),
                        },
                    });
                }
            };

            let Some(relative) = relative_path(root, entry.path()) else {
                warn!("跳过无法表示为 UTF-8 的路径: {}", entry.path().display());
                skipped += 1;
                continue;
            };
            let depth = entry.depth();
            let file_type = entry.file_type();

            if file_type.is_dir() {
                if options.dir_in_range(depth) {
                    catalog.collections.insert(relative);
                }
            } else if file_type.is_file() {
                if !options.file_in_range(depth) {
                    continue;
                }
                let size = entry
                    .metadata()
                    .map_err(|e| match e.into_io_error() {
                        Some(io) => local_error(entry.path(), io),
                        None => CatalogError::NotADirectory(entry.path().to_path_buf()),
                    })?
                    .len();
                catalog.insert(PathEntry::new(relative, size));
            } else {
                debug!("跳过非普通文件: {}", entry.path().display());
                skipped += 1;
            }
        }

        info!(
            "本地扫描完成: {} 个文件, {} 个目录, {} 个被跳过",
            catalog.len(),
            catalog.collections.len(),
            skipped
        );
        Ok(catalog)
    }

    /// 扫描远程集合
    ///
    /// 只有数据对象产生条目，集合本身只记录在目录集合中。
    /// 子集合列举失败不会中止扫描，失败的子树记录在 `failed_subtrees` 中，
    /// 由差异分析报告为无法分类的路径。
    pub async fn build_remote(
        conn: &Connection,
        root: &str,
        options: &CatalogOptions,
        cancel: &CancellationToken,
        progress: Option<&mpsc::Sender<Progress>>,
    ) -> Result<Self, CatalogError> {
        if cancel.is_cancelled() {
            return Err(CatalogError::Cancelled);
        }

        match conn.collection_exists(root).await {
            Ok(true) => {}
            Ok(false) | Err(RemoteError::NotFound(_)) => {
                return Err(CatalogError::RemoteCollectionMissing(root.to_string()))
            }
            Err(RemoteError::PermissionDenied(_)) => {
                return Err(CatalogError::PermissionDenied(root.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        info!("开始扫描远程集合: {} ({})", root, conn.name());

        let mut catalog = Self::new(root);
        let max_concurrent = options.max_concurrent.max(1);
        // (相对前缀, 深度)，根集合深度为 0
        let mut frontier: Vec<(String, usize)> = vec![(String::new(), 0)];
        let mut listed = 0usize;

        while !frontier.is_empty() {
            if cancel.is_cancelled() {
                return Err(CatalogError::Cancelled);
            }

            let results: Vec<_> = futures::stream::iter(frontier.drain(..))
                .map(|(prefix, depth)| async move {
                    if cancel.is_cancelled() {
                        return (prefix, depth, Err(None));
                    }
                    let path = join_remote(root, &prefix);
                    let children = conn.list_children(&path).await.map_err(Some);
                    (prefix, depth, children)
                })
                .buffer_unordered(max_concurrent)
                .collect()
                .await;

            let mut next = Vec::new();
            for (prefix, depth, children) in results {
                let children = match children {
                    Ok(c) => c,
                    Err(None) => return Err(CatalogError::Cancelled),
                    Err(Some(e)) if prefix.is_empty() => {
                        // 根集合都列不出来，没有部分结果可言
                        return Err(match e {
                            RemoteError::NotFound(_) => {
                                CatalogError::RemoteCollectionMissing(root.to_string())
                            }
                            RemoteError::PermissionDenied(_) => {
                                CatalogError::PermissionDenied(root.to_string())
                            }
                            other => other.into(),
                        });
                    }
                    Err(Some(e)) => {
                        warn!("列举远程集合失败: {} - {}", join_remote(root, &prefix), e);
                        catalog.failed.push(FailedSubtree { prefix, error: e });
                        continue;
                    }
                };
                listed += 1;

                for object in children.objects {
                    let relative = join_relative(&prefix, &object.name);
                    if !options.file_in_range(depth + 1) {
                        continue;
                    }
                    let checksum = ChecksumDescriptor::parse_optional(object.checksum.as_deref());
                    catalog.insert(PathEntry::new(relative, object.size).with_checksum(checksum));
                }

                for collection in children.collections {
                    let Some(name) = collection.trim_end_matches('/').rsplit('/').next() else {
                        continue;
                    };
                    if name.is_empty() {
                        continue;
                    }
                    let relative = join_relative(&prefix, name);
                    if options.dir_in_range(depth + 1) {
                        catalog.collections.insert(relative.clone());
                        next.push((relative, depth + 1));
                    }
                }
            }

            report(
                progress,
                Progress::Listed {
                    collections: listed,
                    objects: catalog.len(),
                },
            );
            // 按路径排序，保证列举顺序稳定
            next.sort();
            frontier = next;
        }

        info!(
            "远程扫描完成: {} 个对象, {} 个集合, {} 个子树失败",
            catalog.len(),
            catalog.collections.len(),
            catalog.failed.len()
        );
        Ok(catalog)
    }
}

fn local_error(path: &Path, err: std::io::Error) -> CatalogError {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        CatalogError::PermissionDenied(path.display().to_string())
    } else {
        CatalogError::Io {
            path: path.to_path_buf(),
            source: err,
        }
    }
}

/// 本地路径转为相对路径，统一使用 `/` 分隔
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    let joined = parts?.join("/");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

fn join_relative(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}
