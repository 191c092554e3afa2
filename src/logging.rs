//! 日志模块 - 提供文件日志和大小管理功能

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "collsync.log";
const VALID_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 从配置文件加载日志配置
    pub fn load(config_dir: &Path) -> Self {
        crate::config::read_section(config_dir, "log")
    }

    /// 保存日志配置
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        crate::config::write_section(config_dir, "log", self)
    }

    /// 修改配置，大小限制在 1-100 MB
    pub fn apply(
        &mut self,
        enabled: Option<bool>,
        max_size_mb: Option<u32>,
        level: Option<&str>,
    ) -> Result<(), String> {
        if let Some(l) = level {
            let l = l.to_lowercase();
            if !VALID_LEVELS.contains(&l.as_str()) {
                return Err(format!("无效的日志级别: {}", l));
            }
            self.level = l;
        }
        if let Some(e) = enabled {
            self.enabled = e;
        }
        if let Some(size) = max_size_mb {
            self.max_size_mb = size.clamp(1, 100);
        }
        Ok(())
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    /// 日志过滤器：配置的级别 + RUST_LOG，依赖库的日志压到 warn
    pub fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::from_default_env().add_directive(self.tracing_level().into());
        for noisy in ["opendal=warn", "sqlx=warn", "hyper=warn", "reqwest=warn"] {
            if let Ok(directive) = noisy.parse() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }
}

/// 带大小限制的日志文件
///
/// 超过上限时把当前文件改名为 `collsync.log.old`（覆盖旧的备份）再重新打开。
/// 由 tracing-appender 的后台线程独占写入。
pub struct RotatingFile {
    file_path: PathBuf,
    max_size: u64,
    file: Option<File>,
    written: u64,
}

impl RotatingFile {
    pub const FILE_NAME: &'static str = LOG_FILE;

    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        Self::with_limit(log_dir, (max_size_mb.max(1) as u64) * 1024 * 1024)
    }

    /// 指定字节上限
    pub fn with_limit(log_dir: &Path, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let file_path = log_dir.join(LOG_FILE);

        let mut this = Self {
            file_path,
            max_size,
            file: None,
            written: 0,
        };
        // 启动时已超限则先轮转
        if fs::metadata(&this.file_path).map(|m| m.len() > max_size).unwrap_or(false) {
            this.rotate()?;
        }
        this.open()?;
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn backup_path(&self) -> PathBuf {
        self.file_path.with_extension("log.old")
    }

    fn open(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        self.written = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.file = Some(file);
        Ok(())
    }

    /// 轮转日志文件
    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut f) = self.file.take() {
            let _ = f.flush();
        }

        let backup_path = self.backup_path();
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        if self.file_path.exists() {
            fs::rename(&self.file_path, &backup_path)?;
        }
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        if self.file.is_none() {
            self.open()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("日志文件不可用"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}
