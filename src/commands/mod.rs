//! 命令行子命令

pub mod check;
pub mod diff;
pub mod log;
pub mod sync;

use crate::core::diff::{DiffError, DiffResult, PartialDiff, Unclassified};
use crate::core::task::{Progress, TaskHandle, TaskResult};
use crate::core::{SyncDirection, SyncEngine, SyncRequest};
use serde::Serialize;
use std::io::{IsTerminal, Write};

/// 等待后台任务结束
///
/// Ctrl-C 会取消任务，任务仍然返回唯一的终止结果。
pub(crate) async fn watch_task<T, E>(mut task: TaskHandle<T, E>, show_progress: bool) -> TaskResult<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let show_progress = show_progress && std::io::stderr().is_terminal();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut printed = false;

    if let Some(mut rx) = task.take_progress() {
        loop {
            tokio::select! {
                res = &mut ctrl_c, if !interrupted => {
                    interrupted = true;
                    if res.is_ok() {
                        eprintln!("\n正在取消...");
                        task.cancel();
                    }
                }
                event = rx.recv() => match event {
                    Some(event) if show_progress => {
                        eprint!("\r\x1b[2K{}", describe_progress(&event));
                        let _ = std::io::stderr().flush();
                        printed = true;
                    }
                    Some(_) => {}
                    // 发送端随任务一起释放
                    None => break,
                }
            }
        }
    }
    if printed {
        eprintln!();
    }

    task.join().await
}

fn describe_progress(event: &Progress) -> String {
    match event {
        Progress::Listed {
            collections,
            objects,
        } => format!("扫描远程: {} 个集合, {} 个数据对象", collections, objects),
        Progress::Classified { done, total } => format!("比较: {}/{}", done, total),
        Progress::Transferred {
            files_done,
            files_total,
            bytes_done,
            bytes_total,
            path,
        } => format!(
            "传输: {}/{} 个文件, {}/{} {}",
            files_done,
            files_total,
            format_file_size(*bytes_done),
            format_file_size(*bytes_total),
            path
        ),
    }
}

/// 格式化文件大小
pub(crate) fn format_file_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = size as f64;
    let mut unit_idx = 0;

    while value >= 1024.0 && unit_idx < UNITS.len() - 1 {
        value /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} B", size)
    } else {
        format!("{:.2} {}", value, UNITS[unit_idx])
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// 差异报告（JSON 输出）
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DiffReport<'a> {
    #[serde(flatten)]
    result: &'a DiffResult,
    bytes_to_update: u64,
    bytes_to_upload: u64,
    bytes_to_download: u64,
    in_sync: bool,
    #[serde(skip_serializing_if = "no_unclassified")]
    unclassified: &'a [Unclassified],
}

fn no_unclassified(items: &&[Unclassified]) -> bool {
    items.is_empty()
}

impl<'a> DiffReport<'a> {
    fn new(result: &'a DiffResult, unclassified: &'a [Unclassified]) -> Self {
        Self {
            result,
            bytes_to_update: result.bytes_to_update(),
            bytes_to_upload: result.bytes_to_add(SyncDirection::Upload),
            bytes_to_download: result.bytes_to_add(SyncDirection::Download),
            in_sync: result.is_in_sync(),
            unclassified,
        }
    }
}

pub(crate) fn print_diff(result: &DiffResult, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&DiffReport::new(result, &[]));
    }

    let size = |s: Option<u64>| s.map(format_file_size).unwrap_or_else(|| "-".to_string());

    println!("已修改 ({}):", result.changed.len());
    for path in &result.changed {
        println!(
            "  {}  本地 {}  远程 {}",
            path,
            size(result.local_size(path)),
            size(result.remote_size(path))
        );
    }
    println!("仅本地 ({}):", result.local_only.len());
    for path in &result.local_only {
        println!("  {}  {}", path, size(result.local_size(path)));
    }
    println!("仅远程 ({}):", result.remote_only.len());
    for path in &result.remote_only {
        println!("  {}  {}", path, size(result.remote_size(path)));
    }
    if !result.local_only_dirs.is_empty() || !result.remote_only_dirs.is_empty() {
        println!(
            "空目录: 仅本地 {} 个, 仅远程 {} 个",
            result.local_only_dirs.len(),
            result.remote_only_dirs.len()
        );
    }
    println!("相同: {} 个文件", result.identical.len());
    println!(
        "需要更新 {}, 上传新增 {}, 下载新增 {}",
        format_file_size(result.bytes_to_update()),
        format_file_size(result.bytes_to_add(SyncDirection::Upload)),
        format_file_size(result.bytes_to_add(SyncDirection::Download))
    );
    if result.is_in_sync() {
        println!("两侧已同步");
    }
    Ok(())
}

fn print_partial(partial: &PartialDiff, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&DiffReport::new(&partial.result, &partial.unclassified));
    }
    print_diff(&partial.result, false)?;
    println!("无法分类 ({}):", partial.unclassified.len());
    for item in &partial.unclassified {
        println!("  {}  {}", item.path, item.reason);
    }
    Ok(())
}

/// 在后台执行比较并等待结果
///
/// 结果不完整时打印已分类的部分和无法分类的路径，然后返回错误。
pub(crate) async fn analyze(
    engine: &SyncEngine,
    request: SyncRequest,
    json: bool,
) -> anyhow::Result<DiffResult> {
    match watch_task(engine.spawn_analyze(request), !json).await {
        TaskResult::Completed(result) => Ok(result),
        TaskResult::Failed(DiffError::Partial(partial)) => {
            print_partial(&partial, json)?;
            anyhow::bail!(
                "差异分析不完整: {} 个路径无法分类",
                partial.unclassified.len()
            )
        }
        TaskResult::Failed(e) => Err(anyhow::Error::new(e).context("差异分析失败")),
        TaskResult::Cancelled(_) => anyhow::bail!("差异分析已取消"),
        TaskResult::Panicked(msg) => anyhow::bail!("差异分析异常退出: {}", msg),
    }
}
