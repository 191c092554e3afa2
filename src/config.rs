//! 应用配置模块
//!
//! 所有配置保存在配置目录的 `config.json` 中，每个模块占一个顶层键。

use crate::core::admission::{AdmissionPolicy, UnknownCapacity, DEFAULT_BUFFER_BYTES};
use crate::core::engine::SyncConfig;
use crate::core::equivalence::EquivalencePolicy;
use crate::core::transfer::{FailurePolicy, TransferOptions};
use crate::remote::Timeouts;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "collsync";
const CONFIG_FILE: &str = "config.json";

/// 配置目录
///
/// 默认在系统配置目录下；默认目录的 config.json 中 `data_path` 指向已存在的目录时使用该目录。
pub fn config_dir() -> PathBuf {
    let default_config_dir = crate::dirs::config_dir()
        .map(|p| p.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(format!(".{}", APP_DIR)));

    fs::read_to_string(default_config_dir.join(CONFIG_FILE))
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|config| config.get("data_path")?.as_str().map(PathBuf::from))
        .filter(|p| p.is_dir())
        .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
        .unwrap_or(default_config_dir)
}

fn read_document(config_dir: &Path) -> serde_json::Value {
    fs::read_to_string(config_dir.join(CONFIG_FILE))
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_else(|| serde_json::json!({}))
}

/// 读取一个配置段，缺失或格式错误时使用默认值
pub fn read_section<T: DeserializeOwned + Default>(config_dir: &Path, key: &str) -> T {
    read_document(config_dir)
        .get(key)
        .and_then(|section| match serde_json::from_value::<T>(section.clone()) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("配置段 {} 格式错误, 使用默认值: {}", key, e);
                None
            }
        })
        .unwrap_or_default()
}

/// 写入一个配置段，保留其它配置段
pub fn write_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> io::Result<()> {
    fs::create_dir_all(config_dir)?;
    let mut config = read_document(config_dir);
    if !config.is_object() {
        config = serde_json::json!({});
    }

    config[key] = serde_json::to_value(value).map_err(io::Error::other)?;

    let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
    fs::write(config_dir.join(CONFIG_FILE), content)
}

/// 同步默认参数（`sync` 段）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncDefaults {
    pub policy: EquivalencePolicy,
    /// 保留空间（字节）
    pub buffer_bytes: i64,
    pub force: bool,
    pub unknown_capacity: UnknownCapacity,
    /// 单次远程调用超时（秒）
    pub timeout_secs: u64,
    /// 单个文件上传或下载的超时（秒）
    pub io_timeout_secs: u64,
    pub workers: usize,
    pub failure_policy: FailurePolicy,
    pub verify: bool,
    pub max_retries: u32,
    /// 上传使用的存储资源
    pub resource: Option<String>,
}

impl Default for SyncDefaults {
    fn default() -> Self {
        Self {
            policy: EquivalencePolicy::Size,
            buffer_bytes: DEFAULT_BUFFER_BYTES,
            force: false,
            unknown_capacity: UnknownCapacity::Reject,
            timeout_secs: crate::remote::OP_TIMEOUT_SECS,
            io_timeout_secs: crate::remote::IO_TIMEOUT_SECS,
            workers: 4,
            failure_policy: FailurePolicy::Abort,
            verify: true,
            max_retries: 3,
            resource: None,
        }
    }
}

impl SyncDefaults {
    pub fn load(config_dir: &Path) -> Self {
        read_section(config_dir, "sync")
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_section(config_dir, "sync", self)
    }

    /// 远程调用超时，0 按 1 秒处理
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            call: Duration::from_secs(self.timeout_secs.max(1)),
            io: Duration::from_secs(self.io_timeout_secs.max(1)),
        }
    }

    pub fn to_sync_config(&self) -> SyncConfig {
        SyncConfig {
            workers: self.workers.max(1),
            resource: self.resource.clone(),
            admission: AdmissionPolicy {
                buffer: self.buffer_bytes,
                force: self.force,
                unknown: self.unknown_capacity,
            },
            transfer: TransferOptions {
                failure_policy: self.failure_policy,
                verify: self.verify,
                max_retries: self.max_retries,
                ..Default::default()
            },
        }
    }
}

/// 远程仓库配置（`repository` 段）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum RepositoryConfig {
    /// 通过 icommands 命令行访问 iRODS，连接信息来自 iRODS 环境文件
    Icommands {
        #[serde(default)]
        default_resource: Option<String>,
    },
    /// 本地目录
    Fs {
        root: String,
        #[serde(default)]
        capacity_bytes: Option<u64>,
    },
    S3 {
        bucket: String,
        region: String,
        access_key: String,
        secret_key: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        capacity_bytes: Option<u64>,
    },
    Webdav {
        endpoint: String,
        username: String,
        password: String,
        #[serde(default)]
        root: Option<String>,
        #[serde(default)]
        capacity_bytes: Option<u64>,
    },
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        RepositoryConfig::Icommands {
            default_resource: None,
        }
    }
}

impl RepositoryConfig {
    pub fn load(config_dir: &Path) -> Self {
        read_section(config_dir, "repository")
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_section(config_dir, "repository", self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RepositoryConfig::Icommands { .. } => "icommands",
            RepositoryConfig::Fs { .. } => "fs",
            RepositoryConfig::S3 { .. } => "s3",
            RepositoryConfig::Webdav { .. } => "webdav",
        }
    }
}

/// 完整配置
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub sync: SyncDefaults,
    pub repository: RepositoryConfig,
}

impl AppConfig {
    pub fn load(config_dir: &Path) -> Self {
        Self {
            sync: SyncDefaults::load(config_dir),
            repository: RepositoryConfig::load(config_dir),
        }
    }
}
