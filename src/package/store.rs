//! 包文件存储
//!
//! 负责已安装包在磁盘上的布局：
//! - 解压到同一文件系统下的暂存目录，再原子重命名到位
//! - 删除包目录
//! - 扫描磁盘上已有的包
//!
//! 目录结构：`<root>/themes/<slug>/`、`<root>/plugins/<slug>/`，
//! 暂存目录位于 `<root>/<kind>/.staging/`

use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::types::{
    InstallProgress, InstallStage, InstalledPackage, PackageError, PackageFormat, PackageKind,
    PackageManifest, ProgressCallback,
};
use super::validator::{
    is_metadata_entry, is_tar_extension_header, normalize_entry_path, strip_root,
    ValidatedPackage,
};

/// 暂存目录名
const STAGING_DIR: &str = ".staging";

/// 截图候选扩展名
const SCREENSHOT_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

/// 磁盘上扫描到的包
#[derive(Debug, Clone)]
pub struct ScannedPackage {
    pub kind: PackageKind,
    pub directory: String,
    pub manifest: PackageManifest,
    pub install_path: PathBuf,
    pub screenshot_path: Option<String>,
}

/// 文件已放到位、等待确认的安装
///
/// 替换已有目录时旧目录暂存在 `.staging/trash-*`：`commit` 删除旧目录，
/// `rollback` 移走新目录并放回旧目录。两者都未调用时旧目录留在暂存区，
/// 下次启动时由 `discard_staging` 清理
#[must_use = "需要 commit 或 rollback"]
#[derive(Debug)]
pub struct PendingInstall {
    package: InstalledPackage,
    staging_root: PathBuf,
    previous: Option<PathBuf>,
}

impl PendingInstall {
    pub fn package(&self) -> &InstalledPackage {
        &self.package
    }

    /// 是否替换了磁盘上已有的目录
    pub fn replaces_existing(&self) -> bool {
        self.previous.is_some()
    }

    /// 确认安装，删除被替换的旧目录
    pub fn commit(self) -> InstalledPackage {
        if let Some(previous) = &self.previous {
            discard_dir(previous);
        }
        self.package
    }

    /// 撤销安装，磁盘恢复到安装前的状态
    pub fn rollback(self) -> Result<(), PackageError> {
        let target = &self.package.install_path;
        let discarded = self
            .staging_root
            .join(format!("trash-{}", uuid::Uuid::new_v4()));
        fs::rename(target, &discarded)?;

        if let Some(previous) = &self.previous {
            if let Err(e) = fs::rename(previous, target) {
                // 旧目录放不回去时保留新目录，不让安装目录空着
                if let Err(restore) = fs::rename(&discarded, target) {
                    warn!("[AssetStore] 无法恢复 {:?}: {}", target, restore);
                }
                return Err(e.into());
            }
        }

        discard_dir(&discarded);
        info!(
            "[AssetStore] 已撤销 {} 的安装{}",
            self.package.directory,
            if self.previous.is_some() { "，恢复旧版本" } else { "" }
        );
        Ok(())
    }
}

/// 包文件存储
#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 某种类包的根目录
    pub fn kind_root(&self, kind: PackageKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// 包的安装目录
    pub fn package_dir(&self, kind: PackageKind, directory: &str) -> PathBuf {
        self.kind_root(kind).join(directory)
    }

    fn staging_root(&self, kind: PackageKind) -> PathBuf {
        self.kind_root(kind).join(STAGING_DIR)
    }

    /// 解压已验证的包并原子替换到安装目录
    ///
    /// 返回的记录尚未注册，初始为未启用；调用方注册成功后 `commit`，失败时 `rollback`。
    /// 解压失败时暂存目录被清理，原有安装保持不变
    pub fn install(
        &self,
        validated: &ValidatedPackage,
        bytes: &[u8],
        progress: &dyn ProgressCallback,
    ) -> Result<PendingInstall, PackageError> {
        let kind = validated.kind;
        let staging_root = self.staging_root(kind);
        fs::create_dir_all(&staging_root)?;

        let staging = staging_root.join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&staging)?;

        debug!(
            "[AssetStore] 解压 {} 到暂存目录 {:?}",
            validated.directory, staging
        );

        if let Err(e) = self.extract_into(validated, bytes, &staging, progress) {
            warn!("[AssetStore] 解压 {} 失败，丢弃暂存目录: {}", validated.directory, e);
            discard_dir(&staging);
            return Err(e);
        }

        progress.on_progress(InstallProgress::at(InstallStage::Installing, "替换安装目录..."));
        let target = self.package_dir(kind, &validated.directory);
        let previous = match self.swap_into_place(&staging, &target) {
            Ok(previous) => previous,
            Err(e) => {
                discard_dir(&staging);
                return Err(e);
            }
        };

        info!(
            "[AssetStore] 已安装 {} {} v{} 到 {:?}",
            kind, validated.manifest.name, validated.manifest.version, target
        );

        let screenshot = match kind {
            PackageKind::Theme => find_screenshot(&target, &validated.manifest),
            PackageKind::Plugin => None,
        };

        let package = InstalledPackage::new(
            kind,
            validated.directory.clone(),
            validated.manifest.clone(),
            target,
        )
        .with_screenshot(screenshot);

        Ok(PendingInstall {
            package,
            staging_root,
            previous,
        })
    }

    /// 删除包目录
    ///
    /// 先重命名到暂存区再删除，删除中途失败也不会在安装目录留下残缺的包
    pub fn remove(&self, package: &InstalledPackage) -> Result<(), PackageError> {
        if package.active {
            return Err(PackageError::PackageActive(package.manifest.name.clone()));
        }
        self.remove_dir(package.kind, &package.directory)
    }

    /// 按目录名删除包文件，目录不存在时视为成功
    pub fn remove_dir(&self, kind: PackageKind, directory: &str) -> Result<(), PackageError> {
        let target = self.package_dir(kind, directory);
        if !target.exists() {
            debug!("[AssetStore] 目录不存在，跳过删除: {:?}", target);
            return Ok(());
        }

        let staging_root = self.staging_root(kind);
        fs::create_dir_all(&staging_root)?;
        let trash = staging_root.join(format!("trash-{}", uuid::Uuid::new_v4()));

        fs::rename(&target, &trash)?;
        fs::remove_dir_all(&trash)?;

        info!("[AssetStore] 已删除 {:?}", target);
        Ok(())
    }

    /// 清理上次运行遗留的暂存目录
    pub fn discard_staging(&self) -> Result<usize, PackageError> {
        let mut removed = 0;
        for kind in [PackageKind::Theme, PackageKind::Plugin] {
            let staging_root = self.staging_root(kind);
            if !staging_root.exists() {
                continue;
            }
            for entry in fs::read_dir(&staging_root)? {
                let path = entry?.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
                removed += 1;
            }
        }

        if removed > 0 {
            info!("[AssetStore] 已清理 {} 个遗留暂存目录", removed);
        }
        Ok(removed)
    }

    /// 扫描磁盘上已有的包
    ///
    /// 跳过以 `.` 开头的目录；清单缺失或无法解析的目录记录警告后跳过
    pub fn scan(&self, kind: PackageKind) -> Result<Vec<ScannedPackage>, PackageError> {
        let kind_root = self.kind_root(kind);
        if !kind_root.exists() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in fs::read_dir(&kind_root)? {
            let entry = entry?;
            let path = entry.path();
            let directory = entry.file_name().to_string_lossy().into_owned();
            if directory.starts_with('.') || !path.is_dir() {
                continue;
            }

            let manifest_path = path.join(kind.manifest_file());
            let manifest = match read_manifest(&manifest_path) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!("[AssetStore] 跳过 {:?}: {}", path, e);
                    continue;
                }
            };

            let screenshot_path = match kind {
                PackageKind::Theme => find_screenshot(&path, &manifest),
                PackageKind::Plugin => None,
            };

            found.push(ScannedPackage {
                kind,
                directory,
                manifest,
                install_path: path,
                screenshot_path,
            });
        }

        found.sort_by(|a, b| a.directory.cmp(&b.directory));
        Ok(found)
    }

    fn extract_into(
        &self,
        validated: &ValidatedPackage,
        bytes: &[u8],
        dest: &Path,
        progress: &dyn ProgressCallback,
    ) -> Result<(), PackageError> {
        progress.on_progress(InstallProgress::at(InstallStage::Extracting, "解压包文件..."));
        let mut budget = ExtractBudget::new(validated.max_extracted_size);
        let root_prefix = validated.root_prefix.as_deref();
        match validated.format {
            PackageFormat::Zip => extract_zip(bytes, dest, root_prefix, &mut budget, progress),
            PackageFormat::TarGz => extract_targz(bytes, dest, root_prefix, &mut budget, progress),
        }
    }

    /// 用暂存目录替换目标目录，返回被移走的旧目录
    fn swap_into_place(
        &self,
        staging: &Path,
        target: &Path,
    ) -> Result<Option<PathBuf>, PackageError> {
        if !target.exists() {
            fs::rename(staging, target)?;
            return Ok(None);
        }

        let trash = staging
            .parent()
            .unwrap_or(staging)
            .join(format!("trash-{}", uuid::Uuid::new_v4()));
        fs::rename(target, &trash)?;

        if let Err(e) = fs::rename(staging, target) {
            // 放回原目录
            if let Err(restore) = fs::rename(&trash, target) {
                warn!(
                    "[AssetStore] 无法恢复原目录 {:?}: {}",
                    target, restore
                );
            }
            return Err(e.into());
        }

        Ok(Some(trash))
    }
}

/// 查找主题截图
///
/// 优先使用清单中的 `screenshot`（文件存在时），否则查找根目录下的 `screenshot.*`
pub fn find_screenshot(dir: &Path, manifest: &PackageManifest) -> Option<String> {
    if let Some(declared) = manifest.screenshot.as_deref() {
        if let Ok(Some(relative)) = normalize_entry_path(declared) {
            if dir.join(&relative).is_file() {
                return Some(relative);
            }
        }
    }

    SCREENSHOT_EXTENSIONS
        .iter()
        .map(|ext| format!("screenshot.{}", ext))
        .find(|name| dir.join(name).is_file())
}

fn read_manifest(path: &Path) -> Result<PackageManifest, PackageError> {
    if !path.is_file() {
        return Err(PackageError::MissingManifest(path.display().to_string()));
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn discard_dir(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("[AssetStore] 无法删除目录 {:?}: {}", path, e);
        }
    }
}

/// 计算条目在暂存目录中的输出路径，返回 None 表示跳过该条目
fn output_path(
    raw_name: &str,
    dest: &Path,
    root_prefix: Option<&str>,
) -> Result<Option<PathBuf>, PackageError> {
    let Some(path) = normalize_entry_path(raw_name)? else {
        return Ok(None);
    };
    if is_metadata_entry(&path) {
        return Ok(None);
    }
    Ok(strip_root(&path, root_prefix).map(|relative| dest.join(relative)))
}

/// 解压写出的剩余字节配额
struct ExtractBudget {
    limit: u64,
    remaining: u64,
}

impl ExtractBudget {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            remaining: limit,
        }
    }
}

fn write_file(
    outpath: &Path,
    reader: &mut impl io::Read,
    budget: &mut ExtractBudget,
) -> Result<(), PackageError> {
    if let Some(parent) = outpath.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut outfile = File::create(outpath)?;

    // 多读一个字节用于判断是否超出配额
    let mut limited = io::Read::take(&mut *reader, budget.remaining.saturating_add(1));
    let written = io::copy(&mut limited, &mut outfile)?;
    if written > budget.remaining {
        return Err(PackageError::ExtractedTooLarge {
            limit: budget.limit,
        });
    }
    budget.remaining -= written;
    Ok(())
}

fn extract_zip(
    bytes: &[u8],
    dest: &Path,
    root_prefix: Option<&str>,
    budget: &mut ExtractBudget,
    progress: &dyn ProgressCallback,
) -> Result<(), PackageError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| PackageError::MalformedArchive(format!("无法读取 ZIP 文件: {}", e)))?;

    let total = archive.len();
    for i in 0..total {
        let mut file = archive.by_index(i).map_err(|e| {
            PackageError::MalformedArchive(format!("无法读取 ZIP 条目 {}: {}", i, e))
        })?;

        let Some(outpath) = output_path(file.name(), dest, root_prefix)? else {
            continue;
        };

        if file.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            write_file(&outpath, &mut file, budget)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = file.unix_mode() {
                    if mode & 0o111 != 0 {
                        fs::set_permissions(&outpath, fs::Permissions::from_mode(0o755))?;
                    }
                }
            }
        }

        progress.on_progress(InstallProgress::extracted(i + 1, Some(total)));
    }

    Ok(())
}

fn extract_targz(
    bytes: &[u8],
    dest: &Path,
    root_prefix: Option<&str>,
    budget: &mut ExtractBudget,
    progress: &dyn ProgressCallback,
) -> Result<(), PackageError> {
    let gz = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(gz);

    let mut count = 0;
    for entry in archive
        .entries()
        .map_err(|e| PackageError::MalformedArchive(format!("无法读取 tar.gz 文件: {}", e)))?
    {
        let mut entry =
            entry.map_err(|e| PackageError::MalformedArchive(format!("tar.gz 条目读取失败: {}", e)))?;

        let entry_type = entry.header().entry_type();
        if is_tar_extension_header(entry_type) {
            continue;
        }

        let raw_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let Some(outpath) = output_path(&raw_name, dest, root_prefix)? else {
            continue;
        };

        if entry_type.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else if entry_type.is_file() {
            write_file(&outpath, &mut entry, budget)?;
        } else {
            return Err(PackageError::UnsafePath(format!(
                "{} (不支持的条目类型)",
                raw_name
            )));
        }

        count += 1;
        progress.on_progress(InstallProgress::extracted(count, None));
    }

    Ok(())
}
