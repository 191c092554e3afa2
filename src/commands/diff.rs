//! diff 子命令：只比较，不传输

use crate::core::{EquivalencePolicy, SyncRequest};
use crate::AppState;
use clap::Args;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct DiffArgs {
    /// 本地目录
    pub local: PathBuf,

    /// 远程集合的绝对路径
    pub remote: String,

    /// 比较策略: size 或 checksum（默认取配置文件）
    #[arg(long)]
    pub policy: Option<EquivalencePolicy>,

    /// 最大层级，1 表示只比较根目录下的文件
    #[arg(long, value_name = "N")]
    pub max_level: Option<usize>,

    /// 以 JSON 输出
    #[arg(long)]
    pub json: bool,
}

pub async fn run(state: &AppState, args: DiffArgs) -> anyhow::Result<()> {
    let conn = state.connect().await?;
    let engine = state.engine(conn);

    let policy = args.policy.unwrap_or(state.config.sync.policy);
    let request = SyncRequest::new(args.local, args.remote)
        .with_policy(policy)
        .with_max_level(args.max_level);

    let result = super::analyze(&engine, request, args.json).await?;
    super::print_diff(&result, args.json)
}
