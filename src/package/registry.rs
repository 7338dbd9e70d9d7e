//! 启用状态注册表
//!
//! 持久化已安装包记录并管理启用状态：
//! - 主题：同一时间最多一个启用，切换在单个事务内完成
//! - 插件：各自独立启用/停用
//!
//! 重复切换到当前状态是无操作，不视为错误

use std::sync::MutexGuard;

use rusqlite::Connection;
use tracing::{debug, info};

use super::types::{InstalledPackage, PackageError, PackageKind};
use crate::database::dao::InstalledPackagesDao;
use crate::database::DbConnection;

/// 一次状态切换的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// 切换后的包
    pub package: InstalledPackage,
    /// 状态是否发生变化，false 表示重复请求
    pub changed: bool,
    /// 被替换下来的主题
    pub previous: Option<InstalledPackage>,
}

impl Transition {
    fn unchanged(package: InstalledPackage) -> Self {
        Self {
            package,
            changed: false,
            previous: None,
        }
    }
}

/// 启用状态注册表
#[derive(Clone)]
pub struct ActivationRegistry {
    db: DbConnection,
}

impl ActivationRegistry {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PackageError> {
        self.db
            .lock()
            .map_err(|e| PackageError::Database(format!("数据库锁获取失败: {}", e)))
    }

    /// 写入包记录
    pub fn register(&self, package: &InstalledPackage) -> Result<(), PackageError> {
        let conn = self.conn()?;
        InstalledPackagesDao::upsert(&conn, package)?;
        debug!(
            "[ActivationRegistry] 已注册 {} {} ({})",
            package.kind, package.manifest.name, package.id
        );
        Ok(())
    }

    /// 删除包记录
    pub fn unregister(&self, id: &str) -> Result<bool, PackageError> {
        let conn = self.conn()?;
        InstalledPackagesDao::delete(&conn, id)
    }

    pub fn get(&self, id: &str) -> Result<Option<InstalledPackage>, PackageError> {
        let conn = self.conn()?;
        InstalledPackagesDao::get(&conn, id)
    }

    pub fn get_by_directory(
        &self,
        kind: PackageKind,
        directory: &str,
    ) -> Result<Option<InstalledPackage>, PackageError> {
        let conn = self.conn()?;
        InstalledPackagesDao::get_by_directory(&conn, kind, directory)
    }

    /// 获取指定种类的包，ID 不存在或种类不符时返回 PackageNotFound
    pub fn require(&self, kind: PackageKind, id: &str) -> Result<InstalledPackage, PackageError> {
        self.get(id)?
            .filter(|package| package.kind == kind)
            .ok_or_else(|| PackageError::PackageNotFound(id.to_string()))
    }

    /// 按 ID、目录名或名称查找包（名称不区分大小写）
    pub fn find(&self, kind: PackageKind, key: &str) -> Result<InstalledPackage, PackageError> {
        if let Some(package) = self.get(key)?.filter(|p| p.kind == kind) {
            return Ok(package);
        }
        if let Some(package) = self.get_by_directory(kind, key)? {
            return Ok(package);
        }

        self.list(kind)?
            .into_iter()
            .find(|p| p.manifest.name.eq_ignore_ascii_case(key.trim()))
            .ok_or_else(|| PackageError::PackageNotFound(key.to_string()))
    }

    /// 列出某种类的包，按安装时间升序
    pub fn list(&self, kind: PackageKind) -> Result<Vec<InstalledPackage>, PackageError> {
        let conn = self.conn()?;
        InstalledPackagesDao::list(&conn, kind)
    }

    /// 当前启用的主题
    pub fn active_theme(&self) -> Result<Option<InstalledPackage>, PackageError> {
        let conn = self.conn()?;
        InstalledPackagesDao::active_theme(&conn)
    }

    /// 启用主题
    ///
    /// 在同一事务内停用之前的主题，任何时刻都不会出现两个启用的主题
    pub fn activate_theme(&self, id: &str) -> Result<Transition, PackageError> {
        let mut conn = self.conn()?;
        let package = InstalledPackagesDao::get(&conn, id)?
            .filter(|p| p.kind == PackageKind::Theme)
            .ok_or_else(|| PackageError::PackageNotFound(id.to_string()))?;

        if package.active {
            debug!("[ActivationRegistry] 主题 {} 已启用，跳过", package.manifest.name);
            return Ok(Transition::unchanged(package));
        }

        let previous_id = InstalledPackagesDao::set_active_theme(&mut conn, id)?;
        let previous = match previous_id {
            Some(prev) => InstalledPackagesDao::get(&conn, &prev)?,
            None => None,
        };
        let package = InstalledPackagesDao::get(&conn, id)?
            .ok_or_else(|| PackageError::PackageNotFound(id.to_string()))?;

        info!(
            "[ActivationRegistry] 已启用主题 {}{}",
            package.manifest.name,
            previous
                .as_ref()
                .map(|p| format!("，替换 {}", p.manifest.name))
                .unwrap_or_default()
        );

        Ok(Transition {
            package,
            changed: true,
            previous,
        })
    }

    /// 停用主题，站点回到没有启用主题的状态
    pub fn deactivate_theme(&self, id: &str) -> Result<Transition, PackageError> {
        self.set_flag(PackageKind::Theme, id, false)
    }

    /// 启用插件，不影响其他插件和主题
    pub fn activate_plugin(&self, id: &str) -> Result<Transition, PackageError> {
        self.set_flag(PackageKind::Plugin, id, true)
    }

    /// 停用插件
    pub fn deactivate_plugin(&self, id: &str) -> Result<Transition, PackageError> {
        self.set_flag(PackageKind::Plugin, id, false)
    }

    fn set_flag(
        &self,
        kind: PackageKind,
        id: &str,
        active: bool,
    ) -> Result<Transition, PackageError> {
        let conn = self.conn()?;
        let mut package = InstalledPackagesDao::get(&conn, id)?
            .filter(|p| p.kind == kind)
            .ok_or_else(|| PackageError::PackageNotFound(id.to_string()))?;

        if package.active == active {
            return Ok(Transition::unchanged(package));
        }

        InstalledPackagesDao::set_active(&conn, id, active)?;
        package.active = active;

        info!(
            "[ActivationRegistry] {} {} 已{}",
            kind,
            package.manifest.name,
            if active { "启用" } else { "停用" }
        );

        Ok(Transition {
            package,
            changed: true,
            previous: None,
        })
    }
}
