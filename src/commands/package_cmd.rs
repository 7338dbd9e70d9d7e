//! 主题/插件管理命令
//!
//! - upload_package: 上传并安装
//! - activate_package / deactivate_package / toggle_plugin: 切换启用状态
//! - delete_package: 删除
//! - list_packages: 列出已安装的包
//!
//! 失败不会以 Err 返回，而是放在 `CommandResult.error` 中，附带错误分类

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::logger::SharedLogStore;
use crate::package::{
    AdminWorkflow, ErrorCategory, InstalledPackage, PackageError, PackageKind, ProgressCallback,
    Transition,
};

/// 命令层共享状态
#[derive(Clone)]
pub struct AdminState {
    pub workflow: Arc<AdminWorkflow>,
    pub logs: SharedLogStore,
}

impl AdminState {
    pub fn new(workflow: Arc<AdminWorkflow>, logs: SharedLogStore) -> Self {
        Self { workflow, logs }
    }

    async fn record(&self, level: &str, message: &str) {
        self.logs.write().await.add(level, message);
    }
}

/// 命令执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult<T> {
    pub success: bool,
    pub data: Option<T>,
    /// 展示给管理员的消息，成功时为提示信息
    pub message: Option<String>,
    pub error: Option<String>,
    pub category: Option<ErrorCategory>,
}

impl<T> CommandResult<T> {
    fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
            error: None,
            category: None,
        }
    }

    fn err(error: &PackageError) -> Self {
        let category = error.category();
        // IO 类错误不暴露内部路径
        let message = match category {
            ErrorCategory::Io => "操作失败，请稍后重试".to_string(),
            _ => error.to_string(),
        };
        Self {
            success: false,
            data: None,
            message: None,
            error: Some(message),
            category: Some(category),
        }
    }
}

/// 管理页面列表项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageListItem {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub directory: String,
    pub screenshot: Option<String>,
    pub active: bool,
    pub installed_at: String,
}

impl From<&InstalledPackage> for PackageListItem {
    fn from(package: &InstalledPackage) -> Self {
        Self {
            id: package.id.clone(),
            name: package.manifest.name.clone(),
            version: package.manifest.version.clone(),
            author: package.manifest.author.clone(),
            description: package.manifest.description.clone(),
            directory: package.directory.clone(),
            screenshot: package
                .screenshot_path
                .as_ref()
                .map(|s| format!("{}/{}/{}", package.kind.dir_name(), package.directory, s)),
            active: package.active,
            installed_at: package.installed_at.to_rfc3339(),
        }
    }
}

fn parse_kind(kind: &str) -> Result<PackageKind, PackageError> {
    kind.parse::<PackageKind>()
        .map_err(|e| PackageError::invalid_field("kind", e))
}

/// 启用/停用后的提示信息
fn transition_message(transition: &Transition, active: bool) -> String {
    let package = &transition.package;
    let status = if active { "activated" } else { "deactivated" };
    if !transition.changed {
        return format!(
            "{} \"{}\" is already {}.",
            package.kind.label(),
            package.manifest.name,
            status
        );
    }
    format!(
        "{} \"{}\" {} successfully!",
        package.kind.label(),
        package.manifest.name,
        status
    )
}

/// 上传并安装包
pub async fn upload_package(
    state: &AdminState,
    kind: &str,
    bytes: &[u8],
    checksum: Option<&str>,
    progress: &dyn ProgressCallback,
) -> CommandResult<PackageListItem> {
    let result = match parse_kind(kind) {
        Ok(kind) => {
            state
                .workflow
                .upload_and_install(kind, bytes, checksum, progress)
                .await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(package) => {
            let message = format!(
                "{} \"{}\" uploaded successfully!",
                package.kind.label(),
                package.manifest.name
            );
            state.record("info", &message).await;
            CommandResult::ok(PackageListItem::from(&package), message)
        }
        Err(e) => {
            state
                .record("warn", &format!("Upload rejected: {}", e))
                .await;
            CommandResult::err(&e)
        }
    }
}

/// 启用包
pub async fn activate_package(
    state: &AdminState,
    kind: &str,
    id: &str,
) -> CommandResult<PackageListItem> {
    let result = match parse_kind(kind) {
        Ok(kind) => state.workflow.activate(kind, id).await,
        Err(e) => Err(e),
    };
    finish_transition(state, result, true).await
}

/// 停用包
pub async fn deactivate_package(
    state: &AdminState,
    kind: &str,
    id: &str,
) -> CommandResult<PackageListItem> {
    let result = match parse_kind(kind) {
        Ok(kind) => state.workflow.deactivate(kind, id).await,
        Err(e) => Err(e),
    };
    finish_transition(state, result, false).await
}

/// 切换插件启用状态
pub async fn toggle_plugin(state: &AdminState, id: &str) -> CommandResult<PackageListItem> {
    let current = match state.workflow.registry().require(PackageKind::Plugin, id) {
        Ok(package) => package,
        Err(e) => return CommandResult::err(&e),
    };

    if current.active {
        let result = state.workflow.deactivate(PackageKind::Plugin, id).await;
        finish_transition(state, result, false).await
    } else {
        let result = state.workflow.activate(PackageKind::Plugin, id).await;
        finish_transition(state, result, true).await
    }
}

async fn finish_transition(
    state: &AdminState,
    result: Result<Transition, PackageError>,
    active: bool,
) -> CommandResult<PackageListItem> {
    match result {
        Ok(transition) => {
            let message = transition_message(&transition, active);
            if transition.changed {
                state.record("info", &message).await;
            }
            CommandResult::ok(PackageListItem::from(&transition.package), message)
        }
        Err(e) => CommandResult::err(&e),
    }
}

/// 删除包，启用中的包需先停用
pub async fn delete_package(state: &AdminState, kind: &str, id: &str) -> CommandResult<String> {
    let result = match parse_kind(kind) {
        Ok(kind) => state.workflow.delete(kind, id).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(package) => {
            let message = format!(
                "{} \"{}\" deleted successfully!",
                package.kind.label(),
                package.manifest.name
            );
            state.record("info", &message).await;
            CommandResult::ok(package.id, message)
        }
        Err(e) => CommandResult::err(&e),
    }
}

/// 列出已安装的包，按安装时间升序
pub async fn list_packages(state: &AdminState, kind: &str) -> CommandResult<Vec<PackageListItem>> {
    let result = parse_kind(kind).and_then(|kind| state.workflow.list(kind));

    match result {
        Ok(packages) => {
            let count = packages.len();
            let items = packages.iter().map(PackageListItem::from).collect();
            CommandResult::ok(items, format!("{} package(s)", count))
        }
        Err(e) => CommandResult::err(&e),
    }
}
