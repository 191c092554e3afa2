//! 日志相关命令

use crate::logging::{LogConfig, RotatingFile};
use crate::AppState;
use anyhow::Context;
use clap::Subcommand;

#[derive(Debug, Subcommand)]
pub enum LogCommand {
    /// 显示日志配置
    Show,
    /// 修改日志配置
    Set {
        /// 是否写日志文件
        #[arg(long)]
        enabled: Option<bool>,
        /// 日志文件大小上限（MB，1-100）
        #[arg(long)]
        max_size_mb: Option<u32>,
        /// 日志级别: error, warn, info, debug, trace
        #[arg(long)]
        level: Option<String>,
    },
}

pub fn run(state: &AppState, command: LogCommand) -> anyhow::Result<()> {
    let config = match command {
        LogCommand::Show => LogConfig::load(&state.config_dir),
        LogCommand::Set {
            enabled,
            max_size_mb,
            level,
        } => {
            let mut config = LogConfig::load(&state.config_dir);
            config
                .apply(enabled, max_size_mb, level.as_deref())
                .map_err(anyhow::Error::msg)?;
            config
                .save(&state.config_dir)
                .context("保存日志配置失败")?;
            tracing::info!("日志配置已更新: {:?}", config);
            config
        }
    };

    super::print_json(&config)?;
    println!(
        "日志文件: {}",
        state.config_dir.join(RotatingFile::FILE_NAME).display()
    );
    Ok(())
}
