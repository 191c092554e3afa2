use crate::core::catalog::{CatalogError, PathCatalog};
use crate::core::equivalence::EquivalenceChecker;
use crate::core::task::{report, Progress};
use crate::core::transfer::SyncDirection;
use futures::StreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 一个路径两侧的大小
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SizePair {
    pub local: Option<u64>,
    pub remote: Option<u64>,
}

/// 差异结果
///
/// 四个集合互不相交，并集恰好是两侧目录的全部路径。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    /// 两侧都有但内容不同
    pub changed: BTreeSet<String>,
    pub local_only: BTreeSet<String>,
    pub remote_only: BTreeSet<String>,
    pub identical: BTreeSet<String>,
    /// 只在本地存在的目录
    pub local_only_dirs: BTreeSet<String>,
    /// 只在远程存在的集合
    pub remote_only_dirs: BTreeSet<String>,
    pub sizes: BTreeMap<String, SizePair>,
}

impl DiffResult {
    pub fn local_size(&self, path: &str) -> Option<u64> {
        self.sizes.get(path).and_then(|s| s.local)
    }

    pub fn remote_size(&self, path: &str) -> Option<u64> {
        self.sizes.get(path).and_then(|s| s.remote)
    }

    /// 需要更新的字节数：changed 中本地文件大小之和
    pub fn bytes_to_update(&self) -> u64 {
        self.changed.iter().filter_map(|p| self.local_size(p)).sum()
    }

    /// 需要新增的字节数：上传为 local_only 的本地大小，下载为 remote_only 的远程大小
    pub fn bytes_to_add(&self, direction: SyncDirection) -> u64 {
        match direction {
            SyncDirection::Upload => self.local_only.iter().filter_map(|p| self.local_size(p)).sum(),
            SyncDirection::Download => self
                .remote_only
                .iter()
                .filter_map(|p| self.remote_size(p))
                .sum(),
        }
    }

    /// 单侧独有的路径
    pub fn orphans(&self, direction: SyncDirection) -> &BTreeSet<String> {
        match direction {
            SyncDirection::Upload => &self.local_only,
            SyncDirection::Download => &self.remote_only,
        }
    }

    pub fn total_paths(&self) -> usize {
        self.changed.len() + self.local_only.len() + self.remote_only.len() + self.identical.len()
    }

    pub fn is_in_sync(&self) -> bool {
        self.changed.is_empty() && self.local_only.is_empty() && self.remote_only.is_empty()
    }
}

/// 无法分类的路径
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Unclassified {
    pub path: String,
    pub reason: String,
}

/// 部分完成的差异结果
#[derive(Debug, Clone)]
pub struct PartialDiff {
    /// 已经分类的路径
    pub result: DiffResult,
    pub unclassified: Vec<Unclassified>,
}

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("类型不一致: {0} 在一侧是文件, 在另一侧是目录")]
    TypeMismatch(String),
    #[error("差异分析不完整: {} 个路径无法分类", .0.unclassified.len())]
    Partial(Box<PartialDiff>),
    #[error("操作已取消")]
    Cancelled,
    #[error(transparent)]
    Catalog(CatalogError),
}

impl From<CatalogError> for DiffError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Cancelled => DiffError::Cancelled,
            other => DiffError::Catalog(other),
        }
    }
}

/// 差异引擎
pub struct DiffEngine {
    checker: EquivalenceChecker,
    /// 并发判断数
    workers: usize,
}

impl DiffEngine {
    pub fn new(checker: EquivalenceChecker, workers: usize) -> Self {
        Self {
            checker,
            workers: workers.max(1),
        }
    }

    /// 比较两个目录
    ///
    /// 等价判断并行执行，结果在全部完成后按路径合并，与完成顺序无关。
    pub async fn diff(
        &self,
        local: &PathCatalog,
        remote: &PathCatalog,
        cancel: &CancellationToken,
        progress: Option<&mpsc::Sender<Progress>>,
    ) -> Result<DiffResult, DiffError> {
        if let Some(path) = first_type_mismatch(local, remote) {
            warn!("类型不一致: {}", path);
            return Err(DiffError::TypeMismatch(path));
        }

        let mut result = DiffResult::default();
        let mut unclassified = Vec::new();
        let failed = remote.failed_subtrees();
        let failure_of = |path: &str| {
            failed
                .iter()
                .find(|f| is_under(path, &f.prefix))
                .map(|f| f.error.to_string())
        };

        let mut common = Vec::new();
        for entry in local.entries() {
            result.sizes.entry(entry.path.clone()).or_default().local = Some(entry.size);
            if let Some(reason) = failure_of(&entry.path) {
                unclassified.push(Unclassified {
                    path: entry.path.clone(),
                    reason,
                });
            } else if remote.contains(&entry.path) {
                common.push(entry.path.clone());
            } else {
                result.local_only.insert(entry.path.clone());
            }
        }
        for entry in remote.entries() {
            result.sizes.entry(entry.path.clone()).or_default().remote = Some(entry.size);
            if !local.contains(&entry.path) {
                result.remote_only.insert(entry.path.clone());
            }
        }

        for dir in local.collections() {
            if !remote.is_collection(dir) && failure_of(dir).is_none() {
                result.local_only_dirs.insert(dir.clone());
            }
        }
        for dir in remote.collections() {
            if !local.is_collection(dir) {
                result.remote_only_dirs.insert(dir.clone());
            }
        }

        common.sort();
        let total = common.len();
        debug!(
            "开始比较 {} 个共同路径 (策略: {}, 并发: {})",
            total,
            self.checker.policy(),
            self.workers
        );

        let mut checks = futures::stream::iter(common)
            .map(|path| async move {
                if cancel.is_cancelled() {
                    return (path, None);
                }
                let (Some(l), Some(r)) = (local.get(&path), remote.get(&path)) else {
                    return (path, None);
                };
                let outcome = self.checker.equivalent_and_backfill_checksum(l, r).await;
                (path, Some(outcome))
            })
            .buffer_unordered(self.workers);

        let mut done = 0usize;
        while let Some((path, outcome)) = checks.next().await {
            done += 1;
            match outcome {
                Some(Ok(true)) => {
                    result.identical.insert(path);
                }
                Some(Ok(false)) => {
                    result.changed.insert(path);
                }
                Some(Err(e)) => {
                    warn!("无法比较 {}: {}", path, e);
                    unclassified.push(Unclassified {
                        path,
                        reason: e.to_string(),
                    });
                }
                None => {}
            }
            report(progress, Progress::Classified { done, total });
        }

        if cancel.is_cancelled() {
            info!("差异分析已取消 ({}/{})", done, total);
            return Err(DiffError::Cancelled);
        }

        info!(
            "差异分析完成: {} 不同, {} 仅本地, {} 仅远程, {} 相同",
            result.changed.len(),
            result.local_only.len(),
            result.remote_only.len(),
            result.identical.len()
        );

        if unclassified.is_empty() {
            Ok(result)
        } else {
            unclassified.sort_by(|a, b| a.path.cmp(&b.path));
            Err(DiffError::Partial(Box::new(PartialDiff {
                result,
                unclassified,
            })))
        }
    }
}

/// 按路径排序的第一个类型不一致的路径
fn first_type_mismatch(local: &PathCatalog, remote: &PathCatalog) -> Option<String> {
    let local_files = local.paths().filter(|p| remote.is_collection(p));
    let remote_files = remote.paths().filter(|p| local.is_collection(p));
    local_files.chain(remote_files).min().cloned()
}

fn is_under(path: &str, prefix: &str) -> bool {
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'/')
}
