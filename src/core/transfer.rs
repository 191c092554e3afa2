use crate::core::checksum::{ChecksumDescriptor, ChecksumError, HashAlgorithm};
use crate::core::diff::DiffResult;
use crate::core::task::{report, Progress};
use crate::remote::{join_remote, parent_remote, Connection, RemoteError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 同步方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// 本地 -> 远程
    Upload,
    /// 远程 -> 本地
    Download,
}

impl FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            other => Err(format!("未知的同步方向: {} (可选 upload, download)", other)),
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
        }
    }
}

/// 单个文件失败时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// 第一个失败就停止，报告已完成的部分
    #[default]
    Abort,
    /// 继续传输其余文件，最后汇总所有失败
    Continue,
}

/// 从差异结果中选择要传输的部分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub changed: bool,
    /// 上传时为 local_only，下载时为 remote_only
    pub orphans: bool,
    /// 在目标端创建空目录/集合
    pub empty_directories: bool,
}

impl Default for Selection {
    fn default() -> Self {
        Self {
            changed: true,
            orphans: true,
            empty_directories: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedFile {
    pub path: String,
    /// 源端大小
    pub size: u64,
}

/// 传输计划，执行一次后丢弃
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPlan {
    pub direction: SyncDirection,
    pub local_root: PathBuf,
    pub remote_root: String,
    /// 按 (深度, 路径) 排序
    pub files: Vec<PlannedFile>,
    /// 需要在目标端创建的目录（相对路径）
    pub directories: Vec<String>,
    /// 上传使用的存储资源，None 为默认资源
    pub resource: Option<String>,
    pub total_bytes: u64,
}

impl TransferPlan {
    pub fn from_diff(
        diff: &DiffResult,
        direction: SyncDirection,
        selection: Selection,
        local_root: impl Into<PathBuf>,
        remote_root: impl Into<String>,
    ) -> Self {
        let size_of = |path: &str| match direction {
            SyncDirection::Upload => diff.local_size(path),
            SyncDirection::Download => diff.remote_size(path),
        };

        let mut paths: Vec<&String> = Vec::new();
        if selection.changed {
            paths.extend(diff.changed.iter());
        }
        if selection.orphans {
            paths.extend(diff.orphans(direction).iter());
        }

        let mut files: Vec<PlannedFile> = paths
            .into_iter()
            .map(|p| PlannedFile {
                path: p.clone(),
                size: size_of(p).unwrap_or(0),
            })
            .collect();
        files.sort_by(|a, b| depth(&a.path).cmp(&depth(&b.path)).then_with(|| a.path.cmp(&b.path)));

        let mut directories: Vec<String> = if selection.empty_directories {
            match direction {
                SyncDirection::Upload => diff.local_only_dirs.iter().cloned().collect(),
                SyncDirection::Download => diff.remote_only_dirs.iter().cloned().collect(),
            }
        } else {
            Vec::new()
        };
        directories.sort_by(|a, b| depth(a).cmp(&depth(b)).then_with(|| a.cmp(b)));

        let total_bytes = files.iter().map(|f| f.size).sum();
        Self {
            direction,
            local_root: local_root.into(),
            remote_root: remote_root.into(),
            files,
            directories,
            resource: None,
            total_bytes,
        }
    }

    pub fn with_resource(mut self, resource: Option<String>) -> Self {
        self.resource = resource;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }

    fn local_path(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .fold(self.local_root.clone(), |acc, seg| acc.join(seg))
    }

    fn remote_path(&self, relative: &str) -> String {
        join_remote(&self.remote_root, relative)
    }
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("本地文件操作失败 {path}: {source}")]
    Local {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("传输后校验和不一致: {0}")]
    ChecksumMismatch(String),
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
}

impl TransferError {
    fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Remote(e) if e.is_retryable())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum TransferStatus {
    Success,
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub error: String,
}

/// 传输结果，每个计划恰好产生一个
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub status: TransferStatus,
    pub message: String,
    pub files_total: usize,
    pub files_transferred: usize,
    pub bytes_transferred: u64,
    pub directories_created: usize,
    pub failures: Vec<FileFailure>,
    pub cancelled: bool,
    pub started_at: i64,
    pub finished_at: i64,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        self.status == TransferStatus::Success
    }
}

/// 执行配置
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub failure_policy: FailurePolicy,
    /// 传输后比较校验和
    pub verify: bool,
    /// 最大重试次数
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    pub retry_base_delay_ms: u64,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Abort,
            verify: true,
            max_retries: 3,
            retry_base_delay_ms: 500,
        }
    }
}

/// 传输执行器
///
/// 逐个文件调用 put/get。执行器本身不保存跨调用的状态，
/// 同一目标根目录的并发执行由调用方串行化。
pub struct TransferExecutor {
    conn: Connection,
    options: TransferOptions,
}

impl TransferExecutor {
    pub fn new(conn: Connection, options: TransferOptions) -> Self {
        Self { conn, options }
    }

    pub async fn execute(
        &self,
        plan: TransferPlan,
        cancel: &CancellationToken,
        progress: Option<&mpsc::Sender<Progress>>,
    ) -> TransferOutcome {
        let started_at = chrono::Utc::now().timestamp();
        let files_total = plan.files.len();
        let mut outcome = TransferOutcome {
            status: TransferStatus::Success,
            message: String::new(),
            files_total,
            files_transferred: 0,
            bytes_transferred: 0,
            directories_created: 0,
            failures: Vec::new(),
            cancelled: false,
            started_at,
            finished_at: started_at,
        };

        if plan.is_empty() {
            outcome.message = "没有需要传输的文件".to_string();
            return outcome;
        }

        info!(
            "开始{}: {} 个文件, {} 字节, {} 个目录",
            match plan.direction {
                SyncDirection::Upload => "上传",
                SyncDirection::Download => "下载",
            },
            files_total,
            plan.total_bytes,
            plan.directories.len()
        );

        let mut ensured: HashSet<String> = HashSet::new();

        for dir in &plan.directories {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            match self.create_directory(&plan, dir, &mut ensured, cancel).await {
                Ok(()) => outcome.directories_created += 1,
                Err(e) => {
                    error!("创建目录失败: {} - {}", dir, e);
                    outcome.failures.push(FileFailure {
                        path: dir.clone(),
                        error: e.to_string(),
                    });
                    if self.options.failure_policy == FailurePolicy::Abort {
                        break;
                    }
                }
            }
        }

        let aborted = |o: &TransferOutcome| {
            o.cancelled
                || (self.options.failure_policy == FailurePolicy::Abort && !o.failures.is_empty())
        };

        if !aborted(&outcome) {
            for file in &plan.files {
                if cancel.is_cancelled() {
                    outcome.cancelled = true;
                    break;
                }

                let result = match self.ensure_parent(&plan, file, &mut ensured, cancel).await {
                    Ok(()) => {
                        self.with_retry(&file.path, cancel, || self.transfer_one(&plan, file))
                            .await
                    }
                    Err(e) => Err(e),
                };

                match result {
                    Ok(()) => {
                        outcome.files_transferred += 1;
                        outcome.bytes_transferred += file.size;
                        debug!("已传输: {} ({} 字节)", file.path, file.size);
                        report(
                            progress,
                            Progress::Transferred {
                                files_done: outcome.files_transferred,
                                files_total,
                                bytes_done: outcome.bytes_transferred,
                                bytes_total: plan.total_bytes,
                                path: file.path.clone(),
                            },
                        );
                    }
                    Err(e) => {
                        error!("传输失败: {} - {}", file.path, e);
                        outcome.failures.push(FileFailure {
                            path: file.path.clone(),
                            error: e.to_string(),
                        });
                        if self.options.failure_policy == FailurePolicy::Abort {
                            break;
                        }
                    }
                }
            }
        }

        outcome.finished_at = chrono::Utc::now().timestamp();
        let progress_text = format!(
            "{}/{} 个文件, {} 字节",
            outcome.files_transferred, files_total, outcome.bytes_transferred
        );
        if outcome.cancelled {
            outcome.status = TransferStatus::Failure("传输已取消".to_string());
            outcome.message = format!("传输已取消, 已完成 {}", progress_text);
        } else if let Some(first) = outcome.failures.first() {
            outcome.status = TransferStatus::Failure(format!("{}: {}", first.path, first.error));
            outcome.message = match self.options.failure_policy {
                FailurePolicy::Abort => format!("传输中止于 {}, 已完成 {}", first.path, progress_text),
                FailurePolicy::Continue => format!(
                    "{} 个文件传输失败, 已完成 {}",
                    outcome.failures.len(),
                    progress_text
                ),
            };
        } else {
            outcome.message = format!("传输完成: {}", progress_text);
        }

        info!("{}", outcome.message);
        outcome
    }

    async fn create_directory(
        &self,
        plan: &TransferPlan,
        relative: &str,
        ensured: &mut HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        match plan.direction {
            SyncDirection::Upload => {
                let remote = plan.remote_path(relative);
                if ensured.contains(&remote) {
                    return Ok(());
                }
                self.with_retry(relative, cancel, || async {
                    self.conn.create_collection(&remote).await.map_err(TransferError::from)
                })
                .await?;
                ensured.insert(remote);
                Ok(())
            }
            SyncDirection::Download => {
                let local = plan.local_path(relative);
                tokio::fs::create_dir_all(&local)
                    .await
                    .map_err(|source| TransferError::Local { path: local, source })
            }
        }
    }

    /// 确保目标端的上级目录存在，每个远程集合只创建一次
    async fn ensure_parent(
        &self,
        plan: &TransferPlan,
        file: &PlannedFile,
        ensured: &mut HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        match plan.direction {
            SyncDirection::Upload => {
                let remote = plan.remote_path(&file.path);
                let Some(parent) = parent_remote(&remote) else {
                    return Ok(());
                };
                if ensured.contains(parent) {
                    return Ok(());
                }
                // 幂等：已存在时不报错
                self.with_retry(&file.path, cancel, || async {
                    self.conn.create_collection(parent).await.map_err(TransferError::from)
                })
                .await?;
                ensured.insert(parent.to_string());
                Ok(())
            }
            SyncDirection::Download => {
                let local = plan.local_path(&file.path);
                let Some(parent) = local.parent() else {
                    return Ok(());
                };
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| TransferError::Local {
                        path: parent.to_path_buf(),
                        source,
                    })
            }
        }
    }

    /// 传输单个文件（不含重试），覆盖目标端已有的文件
    async fn transfer_one(&self, plan: &TransferPlan, file: &PlannedFile) -> Result<(), TransferError> {
        let local = plan.local_path(&file.path);
        let remote = plan.remote_path(&file.path);

        match plan.direction {
            SyncDirection::Upload => {
                self.conn.put(&local, &remote, plan.resource.as_deref()).await?;
            }
            SyncDirection::Download => {
                self.conn.get(&remote, &local).await?;
            }
        }

        if self.options.verify {
            self.verify(&local, &remote).await?;
        }
        Ok(())
    }

    /// 比较传输后的本地文件和远程校验和
    async fn verify(&self, local: &Path, remote: &str) -> Result<(), TransferError> {
        let raw = self.conn.compute_checksum(remote).await?;
        let Some(descriptor) = ChecksumDescriptor::parse_optional(Some(&raw)) else {
            warn!("无法解析远程校验和, 跳过校验: {} ({})", remote, raw);
            return Ok(());
        };
        if descriptor.algorithm == HashAlgorithm::Unknown {
            warn!("远程校验和算法未知, 跳过校验: {} ({})", remote, raw);
            return Ok(());
        }

        if descriptor.matches_local_file(local).await? {
            Ok(())
        } else {
            Err(TransferError::ChecksumMismatch(remote.to_string()))
        }
    }

    /// 可重试错误按指数退避重试
    async fn with_retry<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let max_retries = self.options.max_retries;
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < max_retries && !cancel.is_cancelled() => {
                    // 指数退避
                    let delay = self.options.retry_base_delay_ms * 2_u64.pow(attempt);
                    attempt += 1;
                    warn!(
                        "操作失败，{}ms 后重试 ({}/{}): {} - {}",
                        delay, attempt, max_retries, what, e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        _ = cancel.cancelled() => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diff::SizePair;
    use crate::remote::testing::FakeRepository;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn options() -> TransferOptions {
        TransferOptions {
            retry_base_delay_ms: 1,
            ..Default::default()
        }
    }

    fn executor(fake: &Arc<FakeRepository>, options: TransferOptions) -> TransferExecutor {
        TransferExecutor::new(Connection::new(fake.clone(), Duration::from_secs(5)), options)
    }

    fn upload_plan(local_root: &Path, files: &[(&str, u64)]) -> TransferPlan {
        let mut diff = DiffResult::default();
        for (p, s) in files {
            diff.local_only.insert(p.to_string());
            diff.sizes.insert(
                p.to_string(),
                SizePair {
                    local: Some(*s),
                    remote: None,
                },
            );
        }
        TransferPlan::from_diff(&diff, SyncDirection::Upload, Selection::default(), local_root, "/zone/coll")
    }

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn test_plan_selection_and_order() {
        let mut diff = DiffResult::default();
        for (p, l, r) in [
            ("z.txt", Some(1), Some(2)),
            ("a/b/c.txt", Some(3), None),
            ("b.txt", Some(4), None),
            ("r.txt", None, Some(7)),
        ] {
            diff.sizes.insert(p.to_string(), SizePair { local: l, remote: r });
        }
        diff.changed.insert("z.txt".into());
        diff.local_only.insert("a/b/c.txt".into());
        diff.local_only.insert("b.txt".into());
        diff.remote_only.insert("r.txt".into());
        diff.local_only_dirs = BTreeSet::from(["empty".to_string(), "a".to_string(), "a/b".to_string()]);

        let plan = TransferPlan::from_diff(&diff, SyncDirection::Upload, Selection::default(), "/tmp/l", "/zone/coll");
        let order: Vec<&str> = plan.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(order, vec!["b.txt", "z.txt", "a/b/c.txt"]);
        assert_eq!(plan.total_bytes, 4 + 1 + 3);
        assert!(plan.directories.is_empty());

        let only_changed = Selection {
            orphans: false,
            ..Default::default()
        };
        let plan = TransferPlan::from_diff(&diff, SyncDirection::Download, only_changed, "/tmp/l", "/zone/coll");
        assert_eq!(plan.files.len(), 1);
        assert_eq!(plan.total_bytes, 2);

        let with_dirs = Selection {
            empty_directories: true,
            ..Default::default()
        };
        let plan = TransferPlan::from_diff(&diff, SyncDirection::Upload, with_dirs, "/tmp/l", "/zone/coll");
        assert_eq!(plan.directories, vec!["a", "empty", "a/b"]);
    }

    #[tokio::test]
    async fn test_empty_plan_is_success() {
        let fake = Arc::new(FakeRepository::new("/zone/coll"));
        let plan = upload_plan(Path::new("/nonexistent"), &[]);

        let outcome = executor(&fake, options())
            .execute(plan, &CancellationToken::new(), None)
            .await;
        assert_eq!(outcome.status, TransferStatus::Success);
        assert_eq!(outcome.files_transferred, 0);
        assert_eq!(fake.puts(), 0);
    }

    #[tokio::test]
    async fn test_upload_creates_parents_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"aaaa");
        write(dir.path(), "sub/deep/b.txt", b"bb");
        let fake = Arc::new(FakeRepository::new("/zone/coll"));

        let plan = upload_plan(dir.path(), &[("a.txt", 4), ("sub/deep/b.txt", 2)]);
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = executor(&fake, options())
            .execute(plan, &CancellationToken::new(), Some(&tx))
            .await;
        drop(tx);

        assert!(outcome.is_success(), "{}", outcome.message);
        assert_eq!(outcome.files_transferred, 2);
        assert_eq!(outcome.bytes_transferred, 6);
        assert_eq!(fake.object_data("/zone/coll/sub/deep/b.txt").unwrap(), b"bb");
        assert!(fake.has_collection("/zone/coll/sub"));
        // 校验时回填了远程校验和
        assert!(fake.stored_checksum("/zone/coll/a.txt").is_some());

        let mut events = 0;
        while rx.recv().await.is_some() {
            events += 1;
        }
        assert_eq!(events, 2);
    }

    #[tokio::test]
    async fn test_download_overwrites_local() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "x.txt", b"old content");
        let fake = Arc::new(
            FakeRepository::new("/zone/coll")
                .with_object("/zone/coll/x.txt", b"new")
                .with_object("/zone/coll/n/y.txt", b"yy"),
        );

        let mut diff = DiffResult::default();
        diff.changed.insert("x.txt".into());
        diff.remote_only.insert("n/y.txt".into());
        diff.sizes.insert("x.txt".into(), SizePair { local: Some(11), remote: Some(3) });
        diff.sizes.insert("n/y.txt".into(), SizePair { local: None, remote: Some(2) });
        let plan = TransferPlan::from_diff(&diff, SyncDirection::Download, Selection::default(), dir.path(), "/zone/coll");
        assert_eq!(plan.total_bytes, 5);

        let outcome = executor(&fake, options())
            .execute(plan, &CancellationToken::new(), None)
            .await;

        assert!(outcome.is_success(), "{}", outcome.message);
        assert_eq!(std::fs::read(dir.path().join("x.txt")).unwrap(), b"new");
        assert_eq!(std::fs::read(dir.path().join("n/y.txt")).unwrap(), b"yy");
    }

    #[tokio::test]
    async fn test_abort_on_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            write(dir.path(), name, b"x");
        }
        let fake = Arc::new(FakeRepository::new("/zone/coll").with_failure(
            "/zone/coll/b.txt",
            RemoteError::PermissionDenied("/zone/coll/b.txt".into()),
        ));

        let plan = upload_plan(dir.path(), &[("a.txt", 1), ("b.txt", 1), ("c.txt", 1)]);
        let outcome = executor(&fake, options())
            .execute(plan, &CancellationToken::new(), None)
            .await;

        assert!(matches!(&outcome.status, TransferStatus::Failure(r) if r.contains("b.txt")));
        assert_eq!(outcome.files_transferred, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert!(fake.object_data("/zone/coll/c.txt").is_none());
    }

    #[tokio::test]
    async fn test_continue_collects_failures() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            write(dir.path(), name, b"x");
        }
        let fake = Arc::new(
            FakeRepository::new("/zone/coll")
                .with_failure("/zone/coll/a.txt", RemoteError::Unknown("boom".into()))
                .with_failure("/zone/coll/c.txt", RemoteError::Unknown("boom".into())),
        );

        let plan = upload_plan(dir.path(), &[("a.txt", 1), ("b.txt", 1), ("c.txt", 1)]);
        let opts = TransferOptions {
            failure_policy: FailurePolicy::Continue,
            ..options()
        };
        let outcome = executor(&fake, opts)
            .execute(plan, &CancellationToken::new(), None)
            .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.files_transferred, 1);
        let failed: Vec<&str> = outcome.failures.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(failed, vec!["a.txt", "c.txt"]);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"data");
        let fake = Arc::new(FakeRepository::new("/zone/coll").with_transient_failure(
            "/zone/coll/a.txt",
            RemoteError::NetworkTimeout("/zone/coll/a.txt".into()),
            2,
        ));

        let plan = upload_plan(dir.path(), &[("a.txt", 4)]);
        let outcome = executor(&fake, options())
            .execute(plan, &CancellationToken::new(), None)
            .await;

        assert!(outcome.is_success(), "{}", outcome.message);
        assert_eq!(fake.puts(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"data");
        let fake = Arc::new(FakeRepository::new("/zone/coll").with_failure(
            "/zone/coll/a.txt",
            RemoteError::NetworkTimeout("/zone/coll/a.txt".into()),
        ));

        let plan = upload_plan(dir.path(), &[("a.txt", 4)]);
        let outcome = executor(&fake, options())
            .execute(plan, &CancellationToken::new(), None)
            .await;

        assert!(!outcome.is_success());
        // 首次 + 3 次重试
        assert_eq!(fake.puts(), 4);
    }

    #[tokio::test]
    async fn test_verification_mismatch_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"data");
        let fake = Arc::new(FakeRepository::new("/zone/coll").with_corrupt_uploads());

        let plan = upload_plan(dir.path(), &[("a.txt", 4)]);
        let outcome = executor(&fake, options())
            .execute(plan.clone(), &CancellationToken::new(), None)
            .await;
        assert!(matches!(&outcome.status, TransferStatus::Failure(r) if r.contains("校验和不一致")));

        // 关闭校验后同样的传输算成功
        let fake = Arc::new(FakeRepository::new("/zone/coll").with_corrupt_uploads());
        let opts = TransferOptions {
            verify: false,
            ..options()
        };
        let outcome = executor(&fake, opts)
            .execute(plan, &CancellationToken::new(), None)
            .await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"data");
        let fake = Arc::new(FakeRepository::new("/zone/coll"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let plan = upload_plan(dir.path(), &[("a.txt", 4)]);
        let outcome = executor(&fake, options()).execute(plan, &cancel, None).await;

        assert!(outcome.cancelled);
        assert!(!outcome.is_success());
        assert_eq!(outcome.files_transferred, 0);
        assert_eq!(fake.puts(), 0);
    }

    #[tokio::test]
    async fn test_empty_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeRepository::new("/zone/coll").with_collection("/zone/coll/remote_empty/inner"));

        let mut diff = DiffResult::default();
        diff.remote_only_dirs = BTreeSet::from(["remote_empty".to_string(), "remote_empty/inner".to_string()]);
        let selection = Selection {
            empty_directories: true,
            ..Default::default()
        };
        let plan = TransferPlan::from_diff(&diff, SyncDirection::Download, selection, dir.path(), "/zone/coll");

        let outcome = executor(&fake, options())
            .execute(plan, &CancellationToken::new(), None)
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.directories_created, 2);
        assert!(dir.path().join("remote_empty/inner").is_dir());
    }
}
