//! 主题/插件包类型定义
//!
//! 定义包种类、清单、已安装包记录、错误类型和安装进度

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// 包错误类型
///
/// 覆盖校验、冲突和 IO 三类失败
#[derive(Error, Debug)]
pub enum PackageError {
    /// 无法作为压缩包打开
    #[error("包格式无效: {0}")]
    MalformedArchive(String),

    /// 压缩包根目录缺少清单文件
    #[error("压缩包中未找到 {0}")]
    MissingManifest(String),

    /// 清单字段缺失或无效
    #[error("清单字段 {field} 无效: {reason}")]
    InvalidManifestField { field: String, reason: String },

    /// 条目路径会解压到安装目录之外
    #[error("不安全的路径: {0}")]
    UnsafePath(String),

    /// 上传文件超过大小限制
    #[error("包大小 {size} 字节超过限制 {limit} 字节")]
    PackageTooLarge { size: u64, limit: u64 },

    /// 解压后的总大小超过限制
    #[error("解压后内容超过限制 {limit} 字节")]
    ExtractedTooLarge { limit: u64 },

    /// 校验和不匹配
    #[error("校验和不匹配: 期望 {expected}, 实际 {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// 包不存在
    #[error("包不存在: {0}")]
    PackageNotFound(String),

    /// 包处于启用状态
    #[error("包 {0} 正在使用中，请先停用再删除")]
    PackageActive(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(String),

    /// JSON 解析错误
    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for PackageError {
    fn from(e: rusqlite::Error) -> Self {
        PackageError::Database(e.to_string())
    }
}

impl PackageError {
    /// 构造清单字段错误
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        PackageError::InvalidManifestField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 错误分类
    pub fn category(&self) -> ErrorCategory {
        match self {
            PackageError::MalformedArchive(_)
            | PackageError::MissingManifest(_)
            | PackageError::InvalidManifestField { .. }
            | PackageError::UnsafePath(_)
            | PackageError::PackageTooLarge { .. }
            | PackageError::ExtractedTooLarge { .. }
            | PackageError::ChecksumMismatch { .. }
            | PackageError::Json(_) => ErrorCategory::Validation,
            PackageError::PackageNotFound(_) | PackageError::PackageActive(_) => {
                ErrorCategory::Conflict
            }
            PackageError::Io(_) | PackageError::Database(_) => ErrorCategory::Io,
        }
    }
}

/// 错误分类
///
/// 校验和冲突类错误可以直接展示给管理员，IO 类只展示通用失败信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Validation,
    Conflict,
    Io,
}

/// 包种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    /// 主题：同一时间最多一个启用
    Theme,
    /// 插件：各自独立启用
    Plugin,
}

impl PackageKind {
    /// 清单文件名
    pub fn manifest_file(&self) -> &'static str {
        match self {
            PackageKind::Theme => "theme.json",
            PackageKind::Plugin => "plugin.json",
        }
    }

    /// 安装根目录名
    pub fn dir_name(&self) -> &'static str {
        match self {
            PackageKind::Theme => "themes",
            PackageKind::Plugin => "plugins",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageKind::Theme => "theme",
            PackageKind::Plugin => "plugin",
        }
    }

    /// 首字母大写的显示名
    pub fn label(&self) -> &'static str {
        match self {
            PackageKind::Theme => "Theme",
            PackageKind::Plugin => "Plugin",
        }
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "theme" | "themes" => Ok(PackageKind::Theme),
            "plugin" | "plugins" => Ok(PackageKind::Plugin),
            other => Err(format!("未知的包种类: {}", other)),
        }
    }
}

/// 包清单 (theme.json / plugin.json)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageManifest {
    /// 包名称
    #[serde(default)]
    pub name: String,
    /// 版本
    #[serde(default = "default_version")]
    pub version: String,
    /// 作者
    #[serde(default = "default_author")]
    pub author: String,
    /// 描述
    #[serde(default)]
    pub description: String,
    /// 入口 (相对于包目录)
    #[serde(default, alias = "entry")]
    pub entry_point: String,
    /// 截图 (仅主题)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    /// 主页
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    /// 许可证
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// 插件声明的钩子
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_author() -> String {
    "Unknown".to_string()
}

/// 已安装包
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstalledPackage {
    /// 稳定 ID
    pub id: String,
    /// 种类
    pub kind: PackageKind,
    /// 安装目录名 (由 name 规范化而来)
    pub directory: String,
    /// 清单
    pub manifest: PackageManifest,
    /// 是否启用
    pub active: bool,
    /// 截图路径 (相对于包目录，仅主题)
    pub screenshot_path: Option<String>,
    /// 安装路径
    pub install_path: PathBuf,
    /// 安装时间
    pub installed_at: DateTime<Utc>,
    /// 最近一次上传时间
    pub updated_at: DateTime<Utc>,
}

impl InstalledPackage {
    /// 创建新的已安装包记录，初始为未启用
    pub fn new(
        kind: PackageKind,
        directory: impl Into<String>,
        manifest: PackageManifest,
        install_path: PathBuf,
    ) -> Self {
        let now = now_micros();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            directory: directory.into(),
            manifest,
            active: false,
            screenshot_path: None,
            install_path,
            installed_at: now,
            updated_at: now,
        }
    }

    /// 设置截图
    pub fn with_screenshot(mut self, screenshot: Option<String>) -> Self {
        self.screenshot_path = screenshot;
        self
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }
}

/// 当前时间，截断到微秒以便与持久化的时间戳精确比较
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// 包格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFormat {
    /// ZIP 格式
    Zip,
    /// tar.gz 格式
    TarGz,
}

impl PackageFormat {
    /// 从文件头魔数检测格式
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [0x50, 0x4B, ..] => Some(PackageFormat::Zip),
            [0x1f, 0x8b, ..] => Some(PackageFormat::TarGz),
            _ => None,
        }
    }
}

/// 上传安装经过的阶段，按顺序推进，任意阶段都可能转为 Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStage {
    Validating,
    Extracting,
    Installing,
    Registering,
    Complete,
    Failed,
}

impl InstallStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallStage::Validating => "validating",
            InstallStage::Extracting => "extracting",
            InstallStage::Installing => "installing",
            InstallStage::Registering => "registering",
            InstallStage::Complete => "complete",
            InstallStage::Failed => "failed",
        }
    }

    /// 进入该阶段时报告的百分比
    pub fn base_percent(&self) -> u8 {
        match self {
            InstallStage::Validating | InstallStage::Failed => 0,
            InstallStage::Extracting => 10,
            InstallStage::Installing => 80,
            InstallStage::Registering => 90,
            InstallStage::Complete => 100,
        }
    }
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 安装进度
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallProgress {
    pub stage: InstallStage,
    /// 0-100
    pub percent: u8,
    pub message: String,
}

impl InstallProgress {
    /// 进入某个阶段
    pub fn at(stage: InstallStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            percent: stage.base_percent(),
            message: message.into(),
        }
    }

    /// 解压了 `done` 个条目
    ///
    /// 百分比落在解压与安装阶段之间；tar 流无法预知条目总数，`total` 为 None 时停在中点
    pub fn extracted(done: usize, total: Option<usize>) -> Self {
        let start = InstallStage::Extracting.base_percent() as usize;
        let span = (InstallStage::Installing.base_percent() - InstallStage::Extracting.base_percent())
            as usize;

        let (percent, message) = match total {
            Some(total) => (
                start + span * done.min(total) / total.max(1),
                format!("解压中 ({}/{})", done, total),
            ),
            None => (start + span / 2, format!("解压中 ({})", done)),
        };

        Self {
            stage: InstallStage::Extracting,
            percent: percent as u8,
            message,
        }
    }
}

/// 安装进度回调，闭包 `Fn(InstallProgress)` 可直接使用
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, progress: InstallProgress);
}

impl<F> ProgressCallback for F
where
    F: Fn(InstallProgress) + Send + Sync,
{
    fn on_progress(&self, progress: InstallProgress) {
        self(progress)
    }
}

/// 忽略所有进度
pub struct NoopProgressCallback;

impl ProgressCallback for NoopProgressCallback {
    fn on_progress(&self, _progress: InstallProgress) {}
}
