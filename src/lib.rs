//! Webbly 主题/插件包管理
//!
//! 管理后台上传、启用、停用和删除主题与插件：
//! 同一时间最多一个主题启用，插件各自独立，上传的包在解压前完成验证。

pub mod commands;
pub mod config;
pub mod database;
pub mod logger;
pub mod package;

pub use config::AppConfig;
pub use package::{AdminWorkflow, InstalledPackage, PackageError, PackageKind, PackageManifest};
