//! 后台任务：取消令牌 + 进度通道 + 唯一的终止结果

use serde::Serialize;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 进度通道容量，满了之后丢弃新的进度事件
const PROGRESS_CAPACITY: usize = 256;

/// 进度事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Progress {
    /// 远程扫描进度
    Listed { collections: usize, objects: usize },
    /// 差异分类进度
    Classified { done: usize, total: usize },
    /// 传输进度
    Transferred {
        files_done: usize,
        files_total: usize,
        bytes_done: u64,
        bytes_total: u64,
        path: String,
    },
}

/// 发送进度，不等待接收方
pub fn report(progress: Option<&mpsc::Sender<Progress>>, event: Progress) {
    if let Some(tx) = progress {
        let _ = tx.try_send(event);
    }
}

/// 任务的终止结果，每个任务恰好产生一个
#[derive(Debug)]
pub enum TaskResult<T, E> {
    Completed(T),
    Failed(E),
    /// 已取消；如果任务在取消后仍返回了部分结果，一并带回
    Cancelled(Option<T>),
    /// 任务崩溃
    Panicked(String),
}

impl<T, E> TaskResult<T, E> {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskResult::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskResult::Cancelled(_))
    }
}

/// 后台任务句柄
pub struct TaskHandle<T, E> {
    id: Uuid,
    cancel: CancellationToken,
    progress: Option<mpsc::Receiver<Progress>>,
    handle: JoinHandle<Result<T, E>>,
}

impl<T, E> TaskHandle<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// 在 tokio 运行时上启动任务
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken, mpsc::Sender<Progress>) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(PROGRESS_CAPACITY);
        let handle = tokio::spawn(f(cancel.clone(), tx));
        tracing::debug!("启动后台任务 {}", id);

        Self {
            id,
            cancel,
            progress: Some(rx),
            handle,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 请求取消，任务在下一个工作单元之前停止
    pub fn cancel(&self) {
        tracing::info!("取消后台任务 {}", self.id);
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 取走进度接收端（只能取一次）
    pub fn take_progress(&mut self) -> Option<mpsc::Receiver<Progress>> {
        self.progress.take()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// 等待任务结束
    pub async fn join(self) -> TaskResult<T, E> {
        let cancelled = || self.cancel.is_cancelled();
        match self.handle.await {
            Ok(Ok(value)) if cancelled() => TaskResult::Cancelled(Some(value)),
            Ok(Ok(value)) => TaskResult::Completed(value),
            Ok(Err(_)) if cancelled() => TaskResult::Cancelled(None),
            Ok(Err(e)) => TaskResult::Failed(e),
            Err(e) => {
                tracing::error!("后台任务 {} 异常退出: {}", self.id, e);
                TaskResult::Panicked(e.to_string())
            }
        }
    }
}
