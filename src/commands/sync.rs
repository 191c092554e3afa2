//! sync 子命令：比较后上传或下载

use super::{format_file_size, print_json, watch_task};
use crate::core::task::TaskResult;
use crate::core::{
    EquivalencePolicy, FailurePolicy, Selection, SyncDirection, SyncEngine, SyncRequest,
    TransferOutcome, TransferPlan,
};
use crate::AppState;
use clap::{Args, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// 本地目录
    pub local: PathBuf,

    /// 远程集合的绝对路径
    pub remote: String,

    /// 同步方向: upload 或 download
    #[arg(short, long)]
    pub direction: SyncDirection,

    /// 要传输的部分，逗号分隔（默认 changed 加当前方向的独有文件）
    #[arg(long, value_enum, value_delimiter = ',', value_name = "SET")]
    pub select: Vec<SelectPart>,

    /// 跳过空间检查
    #[arg(long)]
    pub force: bool,

    /// 保留空间（字节）
    #[arg(long, value_name = "BYTES", allow_negative_numbers = true)]
    pub buffer: Option<i64>,

    /// 只打印传输计划
    #[arg(long)]
    pub dry_run: bool,

    /// 单个文件失败后继续传输其余文件
    #[arg(long)]
    pub continue_on_error: bool,

    /// 在目标端创建空目录
    #[arg(long)]
    pub copy_empty_folders: bool,

    /// 传输后不比较校验和
    #[arg(long)]
    pub no_verify: bool,

    /// 比较策略: size 或 checksum（默认取配置文件）
    #[arg(long)]
    pub policy: Option<EquivalencePolicy>,

    /// 最大层级，1 表示只同步根目录下的文件
    #[arg(long, value_name = "N")]
    pub max_level: Option<usize>,

    /// 以 JSON 输出
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SelectPart {
    Changed,
    LocalOnly,
    RemoteOnly,
}

/// 把 --select 转换为传输选择
///
/// 上传只能选 local-only，下载只能选 remote-only。
fn selection(
    parts: &[SelectPart],
    direction: SyncDirection,
    copy_empty_folders: bool,
) -> anyhow::Result<Selection> {
    let mut selection = Selection {
        empty_directories: copy_empty_folders,
        ..Selection::default()
    };
    if parts.is_empty() {
        return Ok(selection);
    }

    let (wanted, opposite) = match direction {
        SyncDirection::Upload => (SelectPart::LocalOnly, SelectPart::RemoteOnly),
        SyncDirection::Download => (SelectPart::RemoteOnly, SelectPart::LocalOnly),
    };
    if parts.contains(&opposite) {
        anyhow::bail!(
            "{} 方向不能选择 {}",
            direction,
            opposite.to_possible_value().map(|v| v.get_name().to_string()).unwrap_or_default()
        );
    }
    selection.changed = parts.contains(&SelectPart::Changed);
    selection.orphans = parts.contains(&wanted);
    Ok(selection)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DryRunReport<'a> {
    plan: &'a TransferPlan,
    admitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rejection: Option<String>,
}

fn print_plan(plan: &TransferPlan) {
    println!(
        "传输计划 ({}): {} -> {}",
        plan.direction,
        match plan.direction {
            SyncDirection::Upload => plan.local_root.display().to_string(),
            SyncDirection::Download => plan.remote_root.clone(),
        },
        match plan.direction {
            SyncDirection::Upload => plan.remote_root.clone(),
            SyncDirection::Download => plan.local_root.display().to_string(),
        }
    );
    for dir in &plan.directories {
        println!("  创建目录 {}/", dir);
    }
    for file in &plan.files {
        println!("  {}  {}", file.path, format_file_size(file.size));
    }
    println!(
        "共 {} 个文件, {}",
        plan.files.len(),
        format_file_size(plan.total_bytes)
    );
}

fn print_outcome(outcome: &TransferOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(outcome);
    }
    println!("{}", outcome.message);
    println!(
        "已传输 {}/{} 个文件, {}",
        outcome.files_transferred,
        outcome.files_total,
        format_file_size(outcome.bytes_transferred)
    );
    if outcome.directories_created > 0 {
        println!("已创建 {} 个目录", outcome.directories_created);
    }
    for failure in &outcome.failures {
        println!("  失败 {}: {}", failure.path, failure.error);
    }
    Ok(())
}

pub async fn run(state: &AppState, args: SyncArgs) -> anyhow::Result<()> {
    let selection = selection(&args.select, args.direction, args.copy_empty_folders)?;

    // 命令行参数覆盖配置文件
    let mut defaults = state.config.sync.clone();
    if let Some(policy) = args.policy {
        defaults.policy = policy;
    }
    if let Some(buffer) = args.buffer {
        defaults.buffer_bytes = buffer;
    }
    defaults.force |= args.force;
    if args.continue_on_error {
        defaults.failure_policy = FailurePolicy::Continue;
    }
    if args.no_verify {
        defaults.verify = false;
    }

    let conn = state.connect().await?;
    let engine = SyncEngine::with_config(conn, defaults.to_sync_config());
    let request = SyncRequest::new(args.local, args.remote)
        .with_policy(defaults.policy)
        .with_max_level(args.max_level);

    let diff = super::analyze(&engine, request.clone(), args.json).await?;
    let plan = engine.plan(&request, &diff, args.direction, selection);

    if args.dry_run {
        let admission = engine.admit(&plan).await;
        if args.json {
            return print_json(&DryRunReport {
                plan: &plan,
                admitted: admission.is_ok(),
                rejection: admission.err().map(|e| e.to_string()),
            });
        }
        print_plan(&plan);
        match admission {
            Ok(()) => println!("空间检查通过 (试运行, 未传输)"),
            Err(e) => println!("空间检查未通过: {}", e),
        }
        return Ok(());
    }

    if plan.is_empty() {
        if !args.json {
            println!("没有需要传输的文件");
        }
        return Ok(());
    }

    match watch_task(engine.spawn_transfer(plan), !args.json).await {
        TaskResult::Completed(outcome) => {
            print_outcome(&outcome, args.json)?;
            if !outcome.is_success() {
                anyhow::bail!("传输未完成: {} 个文件失败", outcome.failures.len());
            }
            Ok(())
        }
        TaskResult::Failed(e) => {
            Err(anyhow::Error::new(e).context("空间检查未通过, 未传输任何数据"))
        }
        TaskResult::Cancelled(outcome) => {
            if let Some(outcome) = outcome {
                print_outcome(&outcome, args.json)?;
            }
            anyhow::bail!("传输已取消")
        }
        TaskResult::Panicked(msg) => anyhow::bail!("传输异常退出: {}", msg),
    }
}
