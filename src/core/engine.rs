use crate::core::admission::{AdmissionError, AdmissionPolicy};
use crate::core::catalog::{CatalogOptions, PathCatalog};
use crate::core::diff::{DiffEngine, DiffError, DiffResult};
use crate::core::equivalence::{EquivalenceChecker, EquivalencePolicy};
use crate::core::task::{Progress, TaskHandle};
use crate::core::transfer::{
    Selection, SyncDirection, TransferExecutor, TransferOptions, TransferOutcome, TransferPlan,
};
use crate::remote::{Connection, RemoteError};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 并发数（远程列举和等价判断）
    pub workers: usize,
    /// 上传使用的存储资源
    pub resource: Option<String>,
    pub admission: AdmissionPolicy,
    pub transfer: TransferOptions,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resource: None,
            admission: AdmissionPolicy::default(),
            transfer: TransferOptions::default(),
        }
    }
}

/// 一次比较的输入
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub local_root: PathBuf,
    pub remote_root: String,
    pub policy: EquivalencePolicy,
    /// 最大层级，None 表示不限制
    pub max_level: Option<usize>,
}

impl SyncRequest {
    pub fn new(local_root: impl Into<PathBuf>, remote_root: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            remote_root: remote_root.into().trim_end_matches('/').to_string(),
            policy: EquivalencePolicy::default(),
            max_level: None,
        }
    }

    pub fn with_policy(mut self, policy: EquivalencePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_level(mut self, max_level: Option<usize>) -> Self {
        self.max_level = max_level;
        self
    }
}

/// 同步引擎：扫描、比较、空间检查、传输
#[derive(Clone)]
pub struct SyncEngine {
    conn: Connection,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(conn: Connection) -> Self {
        Self::with_config(conn, SyncConfig::default())
    }

    pub fn with_config(conn: Connection, config: SyncConfig) -> Self {
        Self { conn, config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 扫描两侧并比较
    ///
    /// 校验和策略下可能在远程回填缺失的校验和。
    pub async fn analyze(
        &self,
        request: &SyncRequest,
        cancel: &CancellationToken,
        progress: Option<&mpsc::Sender<Progress>>,
    ) -> Result<DiffResult, DiffError> {
        info!(
            "开始比较: {} <-> {} ({}), 策略: {}",
            request.local_root.display(),
            request.remote_root,
            self.conn.name(),
            request.policy
        );

        let options = CatalogOptions {
            max_level: request.max_level,
            max_concurrent: self.config.workers,
        };

        // 两侧扫描互不依赖，同时进行
        let (local, remote) = tokio::try_join!(
            PathCatalog::build_local(&request.local_root, &options),
            PathCatalog::build_remote(&self.conn, &request.remote_root, &options, cancel, progress),
        )?;

        let checker = EquivalenceChecker::new(
            self.conn.clone(),
            &request.local_root,
            &request.remote_root,
            request.policy,
        );
        DiffEngine::new(checker, self.config.workers)
            .diff(&local, &remote, cancel, progress)
            .await
    }

    /// 根据差异结果生成传输计划
    pub fn plan(
        &self,
        request: &SyncRequest,
        diff: &DiffResult,
        direction: SyncDirection,
        selection: Selection,
    ) -> TransferPlan {
        TransferPlan::from_diff(
            diff,
            direction,
            selection,
            &request.local_root,
            &request.remote_root,
        )
        .with_resource(self.config.resource.clone())
    }

    /// 目标端剩余空间，None 表示目标没有报告
    ///
    /// 远程查询失败（包括超时）原样返回，不当作未知容量。
    pub async fn available_space(&self, plan: &TransferPlan) -> Result<Option<u64>, RemoteError> {
        match plan.direction {
            SyncDirection::Upload => self.conn.free_space(plan.resource.as_deref()).await,
            SyncDirection::Download => {
                let root = plan.local_root.clone();
                Ok(tokio::task::spawn_blocking(move || local_available_space(&root))
                    .await
                    .ok()
                    .flatten())
            }
        }
    }

    /// 空间检查
    pub async fn admit(&self, plan: &TransferPlan) -> Result<(), AdmissionError> {
        if plan.files.is_empty() {
            return Ok(());
        }
        // 强制传输不查询剩余空间
        if self.config.admission.force {
            info!("强制传输, 跳过空间检查");
            return Ok(());
        }
        let available = self.available_space(plan).await.map_err(|e| {
            warn!("查询剩余空间失败: {}", e);
            AdmissionError::CapacityQuery(e)
        })?;
        info!(
            "空间检查: 需要 {} 字节, 可用 {:?}, 保留 {} 字节, 强制: {}",
            plan.total_bytes, available, self.config.admission.buffer, self.config.admission.force
        );
        self.config.admission.admit(plan.total_bytes, available)
    }

    /// 空间检查通过后执行传输，检查不通过时不传输任何数据
    pub async fn transfer(
        &self,
        plan: TransferPlan,
        cancel: &CancellationToken,
        progress: Option<&mpsc::Sender<Progress>>,
    ) -> Result<TransferOutcome, AdmissionError> {
        self.admit(&plan).await?;
        let executor = TransferExecutor::new(self.conn.clone(), self.config.transfer.clone());
        Ok(executor.execute(plan, cancel, progress).await)
    }

    /// 在后台执行比较
    pub fn spawn_analyze(&self, request: SyncRequest) -> TaskHandle<DiffResult, DiffError> {
        let engine = self.clone();
        TaskHandle::spawn(move |cancel, tx| async move {
            engine.analyze(&request, &cancel, Some(&tx)).await
        })
    }

    /// 在后台执行传输
    pub fn spawn_transfer(&self, plan: TransferPlan) -> TaskHandle<TransferOutcome, AdmissionError> {
        let engine = self.clone();
        TaskHandle::spawn(move |cancel, tx| async move {
            engine.transfer(plan, &cancel, Some(&tx)).await
        })
    }
}

/// 本地磁盘剩余空间；目录还不存在时查询最近的已存在上级目录
fn local_available_space(root: &Path) -> Option<u64> {
    let existing = root.ancestors().find(|p| p.exists())?;
    match fs2::available_space(existing) {
        Ok(space) => Some(space),
        Err(e) => {
            warn!("查询本地剩余空间失败 {}: {}", existing.display(), e);
            None
        }
    }
}
