//! 主题/插件包验证器
//!
//! 在解压前检查上传的压缩包：
//! - 验证包格式（zip/tar.gz）和大小限制
//! - 验证每个条目路径都留在安装目录内
//! - 定位并验证清单文件必需字段
//! - 可选的 SHA256 校验和
//!
//! 验证不产生任何文件系统副作用

use std::collections::{BTreeSet, HashMap};
use std::io::{Cursor, Read};
use std::path::{Component, Path};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::types::{PackageError, PackageFormat, PackageKind, PackageManifest};

/// 默认上传大小限制 (16 MiB)
pub const DEFAULT_MAX_PACKAGE_SIZE: u64 = 16 * 1024 * 1024;

/// 解压后总大小相对上传大小限制的倍数
const EXTRACTED_SIZE_RATIO: u64 = 8;

/// 清单文件读取上限
const MAX_MANIFEST_SIZE: u64 = 1024 * 1024;

/// 目录名最大长度
const MAX_DIRECTORY_LEN: usize = 64;

/// 名称最大长度
const MAX_NAME_LEN: usize = 100;

static NON_SLUG_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// 验证通过的包
#[derive(Debug, Clone)]
pub struct ValidatedPackage {
    /// 包种类
    pub kind: PackageKind,
    /// 解析后的清单
    pub manifest: PackageManifest,
    /// 压缩包格式
    pub format: PackageFormat,
    /// 安装目录名
    pub directory: String,
    /// 单一外层目录（如 `aurora-1.0/`），清单位于根目录时为 None
    pub root_prefix: Option<String>,
    /// 包内文件数
    pub file_count: usize,
    /// 解压后允许写出的总字节数
    pub max_extracted_size: u64,
}

/// 压缩包条目
#[derive(Debug, Clone)]
struct ArchiveEntry {
    path: String,
    is_dir: bool,
}

/// 压缩包目录结构
#[derive(Debug, Default)]
struct ArchiveListing {
    entries: Vec<ArchiveEntry>,
    manifests: HashMap<String, String>,
}

/// 包验证器
#[derive(Debug, Clone)]
pub struct PackageValidator {
    max_package_size: u64,
}

impl PackageValidator {
    /// 创建新的验证器
    pub fn new() -> Self {
        Self {
            max_package_size: DEFAULT_MAX_PACKAGE_SIZE,
        }
    }

    /// 设置上传大小限制
    pub fn with_max_size(mut self, limit: u64) -> Self {
        self.max_package_size = limit;
        self
    }

    pub fn max_package_size(&self) -> u64 {
        self.max_package_size
    }

    /// 验证上传的压缩包
    ///
    /// 成功时返回解析后的清单以及解压所需的信息
    pub fn validate(
        &self,
        bytes: &[u8],
        kind: PackageKind,
    ) -> Result<ValidatedPackage, PackageError> {
        let format = self.validate_format(bytes)?;
        let listing = read_listing(bytes, format, kind.manifest_file())?;

        if listing.entries.iter().all(|e| e.is_dir) {
            return Err(PackageError::MalformedArchive("压缩包为空".to_string()));
        }

        let root_prefix = locate_root(&listing, kind.manifest_file())?;
        let manifest_path = match &root_prefix {
            Some(prefix) => format!("{}/{}", prefix, kind.manifest_file()),
            None => kind.manifest_file().to_string(),
        };
        let content = listing
            .manifests
            .get(&manifest_path)
            .ok_or_else(|| PackageError::MissingManifest(kind.manifest_file().to_string()))?;

        let manifest: PackageManifest = serde_json::from_str(content).map_err(|e| {
            PackageError::invalid_field(
                "manifest",
                format!("{} 解析失败: {}", kind.manifest_file(), e),
            )
        })?;

        let directory = self.validate_manifest(&manifest, kind)?;

        let files: BTreeSet<String> = listing
            .entries
            .iter()
            .filter(|e| !e.is_dir)
            .filter_map(|e| strip_root(&e.path, root_prefix.as_deref()))
            .collect();

        if kind == PackageKind::Theme {
            let entry = normalize_entry_path(&manifest.entry_point)?.unwrap_or_default();
            if !files.contains(&entry) {
                return Err(PackageError::invalid_field(
                    "entry_point",
                    format!("主题入口文件不存在: {}", manifest.entry_point),
                ));
            }
        }

        Ok(ValidatedPackage {
            kind,
            manifest,
            format,
            directory,
            root_prefix,
            file_count: files.len(),
            max_extracted_size: self.max_package_size.saturating_mul(EXTRACTED_SIZE_RATIO),
        })
    }

    /// 验证大小和文件魔数
    pub fn validate_format(&self, bytes: &[u8]) -> Result<PackageFormat, PackageError> {
        if bytes.is_empty() {
            return Err(PackageError::MalformedArchive("文件为空".to_string()));
        }

        let size = bytes.len() as u64;
        if size > self.max_package_size {
            return Err(PackageError::PackageTooLarge {
                size,
                limit: self.max_package_size,
            });
        }

        PackageFormat::detect(bytes).ok_or_else(|| {
            PackageError::MalformedArchive("不支持的包格式，仅支持 .zip 和 .tar.gz".to_string())
        })
    }

    /// 验证清单必需字段，返回安装目录名
    pub fn validate_manifest(
        &self,
        manifest: &PackageManifest,
        kind: PackageKind,
    ) -> Result<String, PackageError> {
        let name = manifest.name.trim();
        if name.is_empty() {
            return Err(PackageError::invalid_field("name", "不能为空"));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(PackageError::invalid_field(
                "name",
                format!("长度不能超过 {} 个字符", MAX_NAME_LEN),
            ));
        }
        let directory = sanitize_directory_name(name);
        if directory.is_empty() {
            return Err(PackageError::invalid_field(
                "name",
                "必须包含至少一个字母或数字",
            ));
        }

        if !Self::is_valid_version(&manifest.version) {
            return Err(PackageError::invalid_field(
                "version",
                format!("无效的版本格式: {}，期望 semver 格式如 1.0.0", manifest.version),
            ));
        }

        if manifest.entry_point.trim().is_empty() {
            return Err(PackageError::invalid_field("entry_point", "不能为空"));
        }
        if !is_safe_relative_path(&manifest.entry_point) {
            return Err(PackageError::invalid_field(
                "entry_point",
                format!("必须是包目录内的相对路径: {}", manifest.entry_point),
            ));
        }

        if let Some(screenshot) = &manifest.screenshot {
            if !screenshot.is_empty() && !is_safe_relative_path(screenshot) {
                return Err(PackageError::invalid_field(
                    "screenshot",
                    format!("必须是包目录内的相对路径: {}", screenshot),
                ));
            }
        }

        if kind == PackageKind::Plugin {
            for hook in &manifest.hooks {
                if !Self::is_valid_hook_name(hook) {
                    return Err(PackageError::invalid_field(
                        "hooks",
                        format!("无效的钩子名称: {}", hook),
                    ));
                }
            }
        }

        Ok(directory)
    }

    /// 验证版本格式
    pub fn is_valid_version(version: &str) -> bool {
        if version.is_empty() {
            return false;
        }

        // 允许 x.y 或 x.y.z，以及 -suffix
        let version_part = version.split('-').next().unwrap_or_default();
        let numbers: Vec<&str> = version_part.split('.').collect();
        if numbers.len() < 2 || numbers.len() > 3 {
            return false;
        }

        numbers.iter().all(|n| n.parse::<u32>().is_ok())
    }

    /// 验证钩子名称格式
    pub fn is_valid_hook_name(hook: &str) -> bool {
        !hook.is_empty()
            && hook
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
    }

    /// 验证 SHA256 校验和，未提供时跳过
    pub fn validate_checksum(
        &self,
        bytes: &[u8],
        checksum: Option<&str>,
    ) -> Result<(), PackageError> {
        let Some(expected) = checksum else {
            return Ok(());
        };

        let actual = format!("{:x}", Sha256::digest(bytes));
        if actual != expected.trim().to_lowercase() {
            return Err(PackageError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }

        Ok(())
    }
}

impl Default for PackageValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// 由包名生成安装目录名
///
/// 小写 ASCII，非字母数字字符合并为 `-`
pub fn sanitize_directory_name(name: &str) -> String {
    let lower = name.to_lowercase();
    let slug = NON_SLUG_CHARS.replace_all(&lower, "-");
    let slug = slug.trim_matches('-');
    let mut truncated: String = slug.chars().take(MAX_DIRECTORY_LEN).collect();
    while truncated.ends_with('-') {
        truncated.pop();
    }
    truncated
}

/// 检查相对路径不会逃逸出包目录
pub fn is_safe_relative_path(raw: &str) -> bool {
    matches!(normalize_entry_path(raw), Ok(Some(_)))
}

/// 规范化压缩包条目路径
///
/// 反斜杠视为分隔符，去掉 `.` 组件；出现 `..`、根目录或盘符时返回 UnsafePath。
/// 规范化后为空（如 `./`）返回 None
pub(crate) fn normalize_entry_path(raw: &str) -> Result<Option<String>, PackageError> {
    let unsafe_path = || PackageError::UnsafePath(raw.to_string());

    if raw.contains('\0') {
        return Err(unsafe_path());
    }

    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(unsafe_path());
    }

    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                if part.contains(':') {
                    return Err(unsafe_path());
                }
                parts.push(part.into_owned());
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path());
            }
        }
    }

    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parts.join("/")))
    }
}

/// 去掉外层目录前缀，得到相对于包根目录的路径
pub(crate) fn strip_root(path: &str, root_prefix: Option<&str>) -> Option<String> {
    match root_prefix {
        None => Some(path.to_string()),
        Some(prefix) => path
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
            .map(str::to_string),
    }
}

/// PAX 和 GNU 扩展头只携带元数据，不对应包内文件
///
/// `git archive` 生成的包以 `pax_global_header` 开头
pub(crate) fn is_tar_extension_header(entry_type: tar::EntryType) -> bool {
    matches!(
        entry_type,
        tar::EntryType::XGlobalHeader
            | tar::EntryType::XHeader
            | tar::EntryType::GNULongName
            | tar::EntryType::GNULongLink
    )
}

/// macOS 打包时附带的元数据
pub(crate) fn is_metadata_entry(path: &str) -> bool {
    path == "__MACOSX" || path.starts_with("__MACOSX/")
}

/// 清单候选：位于根目录或一级子目录
fn is_manifest_candidate(path: &str, manifest_file: &str) -> bool {
    match path.split_once('/') {
        None => path == manifest_file,
        Some((_, rest)) => rest == manifest_file,
    }
}

/// 确定包根目录
fn locate_root(listing: &ArchiveListing, manifest_file: &str) -> Result<Option<String>, PackageError> {
    if listing.manifests.contains_key(manifest_file) {
        return Ok(None);
    }

    let mut tops: BTreeSet<&str> = BTreeSet::new();
    let mut has_root_file = false;
    for entry in &listing.entries {
        match entry.path.split_once('/') {
            Some((top, _)) => {
                tops.insert(top);
            }
            None if entry.is_dir => {
                tops.insert(entry.path.as_str());
            }
            None => has_root_file = true,
        }
    }

    if !has_root_file && tops.len() == 1 {
        if let Some(top) = tops.into_iter().next() {
            if listing
                .manifests
                .contains_key(&format!("{}/{}", top, manifest_file))
            {
                return Ok(Some(top.to_string()));
            }
        }
    }

    Err(PackageError::MissingManifest(manifest_file.to_string()))
}

fn read_listing(
    bytes: &[u8],
    format: PackageFormat,
    manifest_file: &str,
) -> Result<ArchiveListing, PackageError> {
    match format {
        PackageFormat::Zip => read_zip_listing(bytes, manifest_file),
        PackageFormat::TarGz => read_targz_listing(bytes, manifest_file),
    }
}

fn read_manifest_content(reader: impl Read, path: &str) -> Result<String, PackageError> {
    let mut content = String::new();
    reader
        .take(MAX_MANIFEST_SIZE)
        .read_to_string(&mut content)
        .map_err(|e| PackageError::invalid_field("manifest", format!("无法读取 {}: {}", path, e)))?;
    Ok(content)
}

fn read_zip_listing(bytes: &[u8], manifest_file: &str) -> Result<ArchiveListing, PackageError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| PackageError::MalformedArchive(format!("无法读取 ZIP 文件: {}", e)))?;

    let mut listing = ArchiveListing::default();
    for i in 0..archive.len() {
        let file = archive.by_index(i).map_err(|e| {
            PackageError::MalformedArchive(format!("ZIP 文件损坏，无法读取条目 {}: {}", i, e))
        })?;

        let raw_name = file.name().to_string();
        let Some(path) = normalize_entry_path(&raw_name)? else {
            continue;
        };
        if is_metadata_entry(&path) {
            continue;
        }

        let is_dir = file.is_dir();
        if !is_dir && is_manifest_candidate(&path, manifest_file) {
            let content = read_manifest_content(file, &path)?;
            listing.manifests.insert(path.clone(), content);
        }
        listing.entries.push(ArchiveEntry { path, is_dir });
    }

    Ok(listing)
}

fn read_targz_listing(bytes: &[u8], manifest_file: &str) -> Result<ArchiveListing, PackageError> {
    let gz = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(gz);

    let mut listing = ArchiveListing::default();
    for entry in archive
        .entries()
        .map_err(|e| PackageError::MalformedArchive(format!("无法读取 tar.gz 文件: {}", e)))?
    {
        let entry =
            entry.map_err(|e| PackageError::MalformedArchive(format!("tar.gz 文件损坏: {}", e)))?;

        let entry_type = entry.header().entry_type();
        if is_tar_extension_header(entry_type) {
            continue;
        }

        let raw_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let Some(path) = normalize_entry_path(&raw_name)? else {
            continue;
        };
        if is_metadata_entry(&path) {
            continue;
        }

        // 链接和设备文件都可能指向包目录之外
        let is_dir = entry_type.is_dir();
        if !is_dir && !entry_type.is_file() {
            return Err(PackageError::UnsafePath(format!(
                "{} (不支持的条目类型)",
                raw_name
            )));
        }

        if !is_dir && is_manifest_candidate(&path, manifest_file) {
            let content = read_manifest_content(entry, &path)?;
            listing.manifests.insert(path.clone(), content);
        }
        listing.entries.push(ArchiveEntry { path, is_dir });
    }

    Ok(listing)
}
