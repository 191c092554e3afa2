use anyhow::Context;
use std::path::PathBuf;

pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod remote;

pub use config::{AppConfig, RepositoryConfig, SyncDefaults};
pub use core::{SyncConfig, SyncEngine, SyncRequest};
pub use remote::{Connection, RemoteError, Repository, Timeouts};

/// 应用状态，在命令之间共享
#[derive(Clone)]
pub struct AppState {
    pub config_dir: PathBuf,
    pub config: AppConfig,
}

impl AppState {
    /// 加载配置，`config_dir` 为 None 时使用默认配置目录
    pub fn load(config_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let config_dir = config_dir.unwrap_or_else(config::config_dir);
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("无法创建配置目录 {}", config_dir.display()))?;

        let config = AppConfig::load(&config_dir);
        tracing::debug!(
            "配置目录: {}, 仓库类型: {}",
            config_dir.display(),
            config.repository.kind()
        );

        Ok(Self { config_dir, config })
    }

    /// 按配置连接远程仓库
    pub async fn connect(&self) -> anyhow::Result<Connection> {
        let timeouts = self.config.sync.timeouts();
        let repo = remote::create_repository(&self.config.repository, &self.config_dir, timeouts)
            .await
            .context("远程仓库连接失败")?;
        Ok(Connection::with_timeouts(repo, timeouts))
    }

    /// 使用配置文件中的同步默认参数创建引擎
    pub fn engine(&self, conn: Connection) -> SyncEngine {
        SyncEngine::with_config(conn, self.config.sync.to_sync_config())
    }
}

/// 各平台的系统配置目录
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux：优先 XDG_CONFIG_HOME
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
