//! 主题/插件包管理
//!
//! 提供包的上传安装、启用切换和删除：
//! - 压缩包验证（格式、清单、路径安全）
//! - 暂存目录 + 原子重命名的文件存储
//! - 主题单一启用、插件独立启用的状态注册表
//! - 按种类串行化的管理后台工作流
//! - 插件钩子绑定

mod hooks;
mod registry;
mod store;
mod theme;
mod types;
mod validator;
mod workflow;

#[cfg(test)]
mod tests;

pub use hooks::{HookContext, HookError, HookRegistry, PluginHook};
pub use registry::{ActivationRegistry, Transition};
pub use store::{find_screenshot, AssetStore, PendingInstall, ScannedPackage};
pub use theme::{available_templates, ActiveThemeAssets, DEFAULT_TEMPLATE};
pub use types::{
    now_micros, ErrorCategory, InstallProgress, InstallStage,
    InstalledPackage, NoopProgressCallback, PackageError, PackageFormat, PackageKind,
    PackageManifest, ProgressCallback,
};
pub use validator::{
    is_safe_relative_path, sanitize_directory_name, PackageValidator, ValidatedPackage,
    DEFAULT_MAX_PACKAGE_SIZE,
};
pub use workflow::{AdminWorkflow, KindLocks};
