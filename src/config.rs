//! 应用配置
//!
//! 从 YAML 文件加载，文件不存在时使用默认值；
//! `WEBBLY_DATA_DIR` / `WEBBLY_MAX_PACKAGE_SIZE` 环境变量优先于文件

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::package::DEFAULT_MAX_PACKAGE_SIZE;

/// 数据目录环境变量
pub const ENV_DATA_DIR: &str = "WEBBLY_DATA_DIR";
/// 上传大小限制环境变量
pub const ENV_MAX_PACKAGE_SIZE: &str = "WEBBLY_MAX_PACKAGE_SIZE";

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("无法读取配置文件 {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("配置文件格式错误: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("配置项 {key} 无效: {reason}")]
    Invalid { key: String, reason: String },
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// 是否写入日志文件
    pub enabled: bool,
    /// 日志级别
    pub level: String,
    /// 日志保留天数
    pub retention_days: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            retention_days: 7,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// 数据目录，主题和插件安装在其下的 `themes/` 与 `plugins/`
    pub data_dir: PathBuf,
    /// 数据库路径，未设置时为 `<data_dir>/webbly.db`
    pub database_path: Option<PathBuf>,
    /// 上传大小限制（字节）
    pub max_package_size: u64,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_path: None,
            max_package_size: DEFAULT_MAX_PACKAGE_SIZE,
            logging: LoggingConfig::default(),
        }
    }
}

/// 默认数据目录: ~/.webbly
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".webbly")
}

impl AppConfig {
    /// 以指定数据目录构造默认配置
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// 加载配置文件并应用环境变量
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// 仅加载配置文件，文件不存在时返回默认值
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("[Config] 配置文件不存在，使用默认配置: {:?}", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&content)?)
    }

    /// 应用环境变量覆盖
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir.trim());
        }

        if let Some(raw) = lookup(ENV_MAX_PACKAGE_SIZE) {
            self.max_package_size = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: ENV_MAX_PACKAGE_SIZE.to_string(),
                reason: format!("需要正整数，实际为 {}", raw),
            })?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_package_size == 0 {
            return Err(ConfigError::Invalid {
                key: "max_package_size".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::Invalid {
                key: "logging.level".to_string(),
                reason: format!("未知的日志级别: {}", self.logging.level),
            });
        }
        Ok(())
    }

    /// 数据库文件路径
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("webbly.db"))
    }

    /// 日志目录
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}
