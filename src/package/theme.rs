//! 启用主题的资源解析
//!
//! 渲染层通过这里拿到当前主题的目录和入口模板，具体如何渲染不在本模块范围内

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::types::InstalledPackage;
use super::validator::normalize_entry_path;

/// 默认页面模板
pub const DEFAULT_TEMPLATE: (&str, &str) = ("default", "Default Template");

/// 页面模板文件名前缀
const PAGE_TEMPLATE_PREFIX: &str = "page-";

/// 当前启用主题的资源位置
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveThemeAssets {
    pub package: InstalledPackage,
    /// 主题根目录
    pub root: PathBuf,
    /// 入口模板的绝对路径
    pub entry_point: PathBuf,
}

impl ActiveThemeAssets {
    /// 从已安装的主题构造，入口路径始终位于主题目录内
    pub fn from_package(package: InstalledPackage) -> Option<Self> {
        let relative = normalize_entry_path(&package.manifest.entry_point).ok()??;
        let root = package.install_path.clone();
        let entry_point = root.join(relative);
        Some(Self {
            package,
            root,
            entry_point,
        })
    }

    /// 主题内模板的路径，越出主题目录时返回 None
    pub fn template_path(&self, template_name: &str) -> Option<PathBuf> {
        let relative = normalize_entry_path(template_name).ok()??;
        Some(self.entry_dir().join(relative))
    }

    /// 截图的绝对路径
    pub fn screenshot(&self) -> Option<PathBuf> {
        self.package
            .screenshot_path
            .as_ref()
            .map(|relative| self.root.join(relative))
    }

    /// 入口模板所在目录
    fn entry_dir(&self) -> &Path {
        self.entry_point.parent().unwrap_or(&self.root)
    }
}

/// 可选的页面模板列表
///
/// 第一项总是默认模板，之后是主题根目录和入口模板目录下的 `page-*.html`，
/// 例如 `page-about-us.html` 对应 `("page-about-us", "About Us")`
pub fn available_templates(assets: Option<&ActiveThemeAssets>) -> Vec<(String, String)> {
    let mut templates = vec![(
        DEFAULT_TEMPLATE.0.to_string(),
        DEFAULT_TEMPLATE.1.to_string(),
    )];

    let Some(assets) = assets else {
        return templates;
    };

    let mut stems = BTreeSet::new();
    for dir in [assets.root.as_path(), assets.entry_dir()] {
        match fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let file_name = entry.file_name().to_string_lossy().into_owned();
                    if let Some(stem) = file_name.strip_suffix(".html") {
                        if stem.starts_with(PAGE_TEMPLATE_PREFIX) && stem.len() > PAGE_TEMPLATE_PREFIX.len() {
                            stems.insert(stem.to_string());
                        }
                    }
                }
            }
            Err(e) => {
                warn!("[Theme] 无法读取主题目录 {:?}: {}", dir, e);
                return templates;
            }
        }
    }

    templates.extend(stems.into_iter().map(|stem| {
        let label = title_case(&stem[PAGE_TEMPLATE_PREFIX.len()..]);
        (stem, label)
    }));
    templates
}

/// `about-us` -> `About Us`
fn title_case(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
