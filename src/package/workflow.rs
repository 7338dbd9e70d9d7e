//! 管理后台操作编排
//!
//! 串联 验证 → 解压 → 注册，以及启用、停用、删除：
//! - 同种类的所有写操作持有该种类的锁，主题和插件互不阻塞
//! - 读操作不加锁，依赖原子重命名和事务化的状态切换看到一致快照
//! - 任意失败都不留下半安装的包

use std::fs;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use super::hooks::HookRegistry;
use super::registry::{ActivationRegistry, Transition};
use super::store::AssetStore;
use super::theme::ActiveThemeAssets;
use super::types::{
    now_micros, InstallProgress, InstallStage, InstalledPackage, PackageError, PackageKind,
    ProgressCallback,
};
use super::validator::PackageValidator;
use crate::config::AppConfig;
use crate::database::{self, DbConnection};

/// 按包种类划分的写锁
#[derive(Default)]
pub struct KindLocks {
    theme: Mutex<()>,
    plugin: Mutex<()>,
}

impl KindLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取种类锁，守卫释放即解锁
    pub async fn lock(&self, kind: PackageKind) -> MutexGuard<'_, ()> {
        match kind {
            PackageKind::Theme => self.theme.lock().await,
            PackageKind::Plugin => self.plugin.lock().await,
        }
    }
}

/// 管理后台工作流
pub struct AdminWorkflow {
    validator: PackageValidator,
    store: AssetStore,
    registry: ActivationRegistry,
    hooks: Arc<HookRegistry>,
    locks: KindLocks,
}

impl AdminWorkflow {
    /// 使用已有数据库连接创建工作流
    pub fn new(config: &AppConfig, db: DbConnection) -> Self {
        Self {
            validator: PackageValidator::new().with_max_size(config.max_package_size),
            store: AssetStore::new(config.data_dir.clone()),
            registry: ActivationRegistry::new(db),
            hooks: Arc::new(HookRegistry::new()),
            locks: KindLocks::new(),
        }
    }

    /// 按配置打开数据目录和数据库，并清理遗留的暂存目录
    pub fn open(config: &AppConfig) -> Result<Self, PackageError> {
        for kind in [PackageKind::Theme, PackageKind::Plugin] {
            fs::create_dir_all(config.data_dir.join(kind.dir_name()))?;
        }
        let db = database::init_database(&config.database_path()).map_err(PackageError::Database)?;

        let workflow = Self::new(config, db);
        workflow.store.discard_staging()?;
        Ok(workflow)
    }

    /// 替换钩子注册表，供宿主共享同一个实例
    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    pub fn registry(&self) -> &ActivationRegistry {
        &self.registry
    }

    /// 上传并安装包，新包初始为未启用
    ///
    /// 同种类同目录的包已存在时替换文件和清单，保留 ID、启用状态和安装时间
    pub async fn upload_and_install(
        &self,
        kind: PackageKind,
        bytes: &[u8],
        checksum: Option<&str>,
        progress: &dyn ProgressCallback,
    ) -> Result<InstalledPackage, PackageError> {
        let _guard = self.locks.lock(kind).await;

        let result = self.install_locked(kind, bytes, checksum, progress);
        if let Err(e) = &result {
            warn!("[AdminWorkflow] {} 上传被拒绝: {}", kind, e);
            progress.on_progress(InstallProgress::at(InstallStage::Failed, e.to_string()));
        }
        result
    }

    fn install_locked(
        &self,
        kind: PackageKind,
        bytes: &[u8],
        checksum: Option<&str>,
        progress: &dyn ProgressCallback,
    ) -> Result<InstalledPackage, PackageError> {
        progress.on_progress(InstallProgress::at(InstallStage::Validating, "验证包格式..."));
        self.validator.validate_checksum(bytes, checksum)?;
        let validated = self.validator.validate(bytes, kind)?;

        let existing = self.registry.get_by_directory(kind, &validated.directory)?;
        let pending = self.store.install(&validated, bytes, progress)?;

        progress.on_progress(InstallProgress::at(InstallStage::Registering, "注册包..."));
        let mut package = pending.package().clone();
        if let Some(existing) = &existing {
            package.id = existing.id.clone();
            package.active = existing.active;
            package.installed_at = existing.installed_at;
        }

        if let Err(e) = self.registry.register(&package) {
            warn!(
                "[AdminWorkflow] 注册 {} 失败，撤销文件变更: {}",
                package.manifest.name, e
            );
            if let Err(rollback) = pending.rollback() {
                warn!("[AdminWorkflow] 撤销安装失败: {}", rollback);
            }
            return Err(e);
        }
        pending.commit();

        // 启用中的插件重新上传后按新清单重新绑定钩子
        if package.kind == PackageKind::Plugin && package.active {
            self.hooks.bind(&package);
        }

        info!(
            "[AdminWorkflow] {} {} v{} {}",
            kind,
            package.manifest.name,
            package.manifest.version,
            if existing.is_some() { "已更新" } else { "已安装" }
        );
        progress.on_progress(InstallProgress::at(
            InstallStage::Complete,
            format!(
                "{} {} v{} 安装成功",
                kind.label(),
                package.manifest.name,
                package.manifest.version
            ),
        ));

        Ok(package)
    }

    /// 启用包
    ///
    /// 主题会替换当前启用的主题；插件只切换自身。重复启用是无操作
    pub async fn activate(&self, kind: PackageKind, id: &str) -> Result<Transition, PackageError> {
        let _guard = self.locks.lock(kind).await;

        match kind {
            PackageKind::Theme => self.registry.activate_theme(id),
            PackageKind::Plugin => {
                let transition = self.registry.activate_plugin(id)?;
                self.hooks.bind(&transition.package);
                Ok(transition)
            }
        }
    }

    /// 停用包
    pub async fn deactivate(
        &self,
        kind: PackageKind,
        id: &str,
    ) -> Result<Transition, PackageError> {
        let _guard = self.locks.lock(kind).await;

        match kind {
            PackageKind::Theme => self.registry.deactivate_theme(id),
            PackageKind::Plugin => {
                let transition = self.registry.deactivate_plugin(id)?;
                self.hooks.unbind(&transition.package.directory);
                Ok(transition)
            }
        }
    }

    /// 删除包
    ///
    /// 启用中的包返回 PackageActive，需先停用
    pub async fn delete(
        &self,
        kind: PackageKind,
        id: &str,
    ) -> Result<InstalledPackage, PackageError> {
        let _guard = self.locks.lock(kind).await;

        let package = self.registry.require(kind, id)?;
        if package.active {
            return Err(PackageError::PackageActive(package.manifest.name.clone()));
        }

        self.store.remove(&package)?;
        self.registry.unregister(&package.id)?;
        if kind == PackageKind::Plugin {
            self.hooks.unbind(&package.directory);
        }

        info!("[AdminWorkflow] {} {} 已删除", kind, package.manifest.name);
        Ok(package)
    }

    /// 列出某种类的包，按安装时间升序
    pub fn list(&self, kind: PackageKind) -> Result<Vec<InstalledPackage>, PackageError> {
        self.registry.list(kind)
    }

    pub fn get(&self, id: &str) -> Result<Option<InstalledPackage>, PackageError> {
        self.registry.get(id)
    }

    /// 按 ID、目录名或名称查找
    pub fn find(&self, kind: PackageKind, key: &str) -> Result<InstalledPackage, PackageError> {
        self.registry.find(kind, key)
    }

    /// 当前启用主题的资源位置
    pub fn active_theme_assets(&self) -> Result<Option<ActiveThemeAssets>, PackageError> {
        Ok(self
            .registry
            .active_theme()?
            .and_then(ActiveThemeAssets::from_package))
    }

    /// 重新绑定所有启用插件的钩子，宿主提供钩子实现后调用
    pub fn rebind_active_plugins(&self) -> Result<usize, PackageError> {
        let mut count = 0;
        for package in self.registry.list(PackageKind::Plugin)? {
            if package.active {
                self.hooks.bind(&package);
                count += 1;
            }
        }
        Ok(count)
    }

    /// 扫描磁盘并同步注册表
    ///
    /// 未注册的目录登记为未启用；已注册的更新清单和截图。
    /// 目录名与清单名称不对应的目录被跳过。返回新登记的包
    pub async fn rescan(&self, kind: PackageKind) -> Result<Vec<InstalledPackage>, PackageError> {
        let _guard = self.locks.lock(kind).await;

        let mut added = Vec::new();
        for scanned in self.store.scan(kind)? {
            // 目录名必须由清单名称生成，否则同名的包可能以不同目录重复登记
            match self.validator.validate_manifest(&scanned.manifest, kind) {
                Ok(directory) if directory == scanned.directory => {}
                Ok(directory) => {
                    warn!(
                        "[AdminWorkflow] 跳过 {:?}: {} 的目录应为 {}",
                        scanned.install_path, scanned.manifest.name, directory
                    );
                    continue;
                }
                Err(e) => {
                    warn!("[AdminWorkflow] 跳过 {:?}: {}", scanned.install_path, e);
                    continue;
                }
            }

            match self.registry.get_by_directory(kind, &scanned.directory)? {
                Some(mut existing) => {
                    if existing.manifest != scanned.manifest
                        || existing.screenshot_path != scanned.screenshot_path
                    {
                        existing.manifest = scanned.manifest;
                        existing.screenshot_path = scanned.screenshot_path;
                        existing.install_path = scanned.install_path;
                        existing.updated_at = now_micros();
                        self.registry.register(&existing)?;
                    }
                }
                None => {
                    let package = InstalledPackage::new(
                        kind,
                        scanned.directory,
                        scanned.manifest,
                        scanned.install_path,
                    )
                    .with_screenshot(scanned.screenshot_path);
                    self.registry.register(&package)?;
                    info!("[AdminWorkflow] 发现 {} {}", kind, package.manifest.name);
                    added.push(package);
                }
            }
        }

        Ok(added)
    }
}
