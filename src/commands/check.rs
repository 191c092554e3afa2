//! check 子命令：测试远程仓库连接

use super::format_file_size;
use crate::AppState;
use anyhow::Context;
use clap::Args;

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// 用于测试列举的集合
    #[arg(long, default_value = "/")]
    pub path: String,

    /// 查询剩余空间的存储资源（默认取配置文件）
    #[arg(long)]
    pub resource: Option<String>,
}

pub async fn run(state: &AppState, args: CheckArgs) -> anyhow::Result<()> {
    let conn = state.connect().await?;
    println!("仓库: {} ({})", conn.name(), state.config.repository.kind());

    let children = conn
        .list_children(&args.path)
        .await
        .with_context(|| format!("列举 {} 失败", args.path))?;
    println!(
        "连接成功: {} 下有 {} 个集合, {} 个数据对象",
        args.path,
        children.collections.len(),
        children.objects.len()
    );

    let resource = args.resource.or_else(|| state.config.sync.resource.clone());
    match conn.free_space(resource.as_deref()).await {
        Ok(Some(space)) => println!("剩余空间: {} ({} 字节)", format_file_size(space), space),
        Ok(None) => println!("剩余空间: 未知"),
        Err(e) => {
            tracing::warn!("查询剩余空间失败: {}", e);
            println!("剩余空间: 查询失败 ({})", e);
        }
    }
    Ok(())
}
