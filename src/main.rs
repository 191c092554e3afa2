use clap::{Parser, Subcommand};
use collsync_lib::commands::{self, check::CheckArgs, diff::DiffArgs, log::LogCommand, sync::SyncArgs};
use collsync_lib::logging::{LogConfig, RotatingFile};
use collsync_lib::AppState;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "collsync")]
#[command(version)]
#[command(about = "比较并同步本地目录与远程集合")]
#[command(long_about = r#"
比较本地目录与远程集合（iRODS 或 opendal 存储），并按需上传或下载差异。

示例:
  collsync diff ./data /tempZone/home/rods/data             比较大小
  collsync diff ./data /tempZone/home/rods/data --policy checksum
  collsync sync ./data /tempZone/home/rods/data --direction upload --dry-run
  collsync check                                            测试仓库连接
"#)]
struct Cli {
    /// 在控制台输出日志
    #[arg(short, long, global = true)]
    verbose: bool,

    /// 配置目录（默认为系统配置目录下的 collsync）
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 比较本地目录和远程集合，不传输数据
    Diff(DiffArgs),
    /// 比较后上传或下载差异
    Sync(SyncArgs),
    /// 测试远程仓库连接
    Check(CheckArgs),
    /// 查看或修改日志配置
    #[command(subcommand)]
    Log(LogCommand),
}

/// 初始化日志系统
///
/// 返回的 guard 需要保持到进程结束，否则缓冲中的日志会丢失。
fn init_logging(log_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    let config = LogConfig::load(log_dir);
    let console = cfg!(debug_assertions) || verbose;

    if !config.enabled {
        if console {
            let _ = tracing_subscriber::registry()
                .with(config.env_filter())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
                .try_init();
        }
        return None;
    }

    let console_layer = console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
    });

    match RotatingFile::new(log_dir, config.max_size_mb) {
        Ok(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            // 文件日志层 - 始终输出到文件
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false);

            let _ = tracing_subscriber::registry()
                .with(config.env_filter())
                .with(file_layer)
                .with(console_layer)
                .try_init();
            Some(guard)
        }
        Err(e) => {
            // 文件日志创建失败，回退到控制台
            eprintln!("无法创建日志文件 {}: {}", log_dir.display(), e);
            let _ = tracing_subscriber::registry()
                .with(config.env_filter())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
                .try_init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let state = match AppState::load(cli.config_dir) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("错误: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let _guard = init_logging(&state.config_dir, cli.verbose);

    let result = match cli.command {
        Command::Diff(args) => commands::diff::run(&state, args).await,
        Command::Sync(args) => commands::sync::run(&state, args).await,
        Command::Check(args) => commands::check::run(&state, args).await,
        Command::Log(cmd) => commands::log::run(&state, cmd),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("错误: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
