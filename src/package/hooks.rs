//! 插件钩子
//!
//! 插件代码不会被动态加载。宿主为每个插件目录提供 `PluginHook` 实现，
//! 插件启用时只绑定清单中声明且宿主提供了的钩子

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use super::types::{InstalledPackage, PackageKind};

/// 钩子错误
#[derive(Error, Debug)]
pub enum HookError {
    #[error("钩子执行失败: {0}")]
    Failed(String),

    #[error("钩子参数无效: {0}")]
    InvalidPayload(String),
}

/// 钩子调用上下文
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookContext {
    /// 钩子名称
    pub hook: String,
    /// 调用参数
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl HookContext {
    pub fn new(hook: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            hook: hook.into(),
            payload,
        }
    }
}

/// 插件钩子 trait
#[async_trait]
pub trait PluginHook: Send + Sync {
    /// 钩子名称，需与清单 `hooks` 中的声明一致
    fn name(&self) -> &str;

    /// 执行钩子，返回 None 表示没有输出
    async fn call(&self, ctx: &HookContext) -> Result<Option<serde_json::Value>, HookError>;
}

/// 已绑定的钩子
#[derive(Clone)]
struct BoundHook {
    plugin: String,
    hook: Arc<dyn PluginHook>,
}

/// 钩子注册表
pub struct HookRegistry {
    /// 宿主提供的实现：插件目录 -> 钩子名 -> 实现
    provided: RwLock<HashMap<String, HashMap<String, Arc<dyn PluginHook>>>>,
    /// 已绑定的钩子：钩子名 -> 按绑定顺序排列
    bound: RwLock<HashMap<String, Vec<BoundHook>>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            provided: RwLock::new(HashMap::new()),
            bound: RwLock::new(HashMap::new()),
        }
    }

    /// 为插件目录提供钩子实现
    pub fn provide(&self, plugin_directory: &str, hook: Arc<dyn PluginHook>) {
        let name = hook.name().to_string();
        debug!("[HookRegistry] {} 提供钩子 {}", plugin_directory, name);
        self.provided
            .write()
            .entry(plugin_directory.to_string())
            .or_default()
            .insert(name, hook);
    }

    /// 绑定插件声明的钩子，返回实际绑定的钩子名
    pub fn bind(&self, package: &InstalledPackage) -> Vec<String> {
        if package.kind != PackageKind::Plugin {
            return Vec::new();
        }

        // 重复绑定先解绑，保证同一插件的钩子只出现一次
        self.unbind(&package.directory);

        let provided = self.provided.read();
        let Some(available) = provided.get(&package.directory) else {
            if !package.manifest.hooks.is_empty() {
                warn!(
                    "[HookRegistry] 插件 {} 声明了钩子但宿主未提供实现",
                    package.manifest.name
                );
            }
            return Vec::new();
        };

        let mut bound = self.bound.write();
        let mut names = Vec::new();
        for declared in &package.manifest.hooks {
            match available.get(declared) {
                Some(hook) => {
                    bound.entry(declared.clone()).or_default().push(BoundHook {
                        plugin: package.directory.clone(),
                        hook: Arc::clone(hook),
                    });
                    names.push(declared.clone());
                }
                None => warn!(
                    "[HookRegistry] 插件 {} 的钩子 {} 没有可用实现",
                    package.manifest.name, declared
                ),
            }
        }

        debug!(
            "[HookRegistry] 插件 {} 绑定钩子: {:?}",
            package.manifest.name, names
        );
        names
    }

    /// 解绑插件的所有钩子
    pub fn unbind(&self, plugin_directory: &str) {
        let mut bound = self.bound.write();
        for hooks in bound.values_mut() {
            hooks.retain(|h| h.plugin != plugin_directory);
        }
        bound.retain(|_, hooks| !hooks.is_empty());
    }

    /// 某个钩子当前绑定的插件
    pub fn bound_plugins(&self, hook_name: &str) -> Vec<String> {
        self.bound
            .read()
            .get(hook_name)
            .map(|hooks| hooks.iter().map(|h| h.plugin.clone()).collect())
            .unwrap_or_default()
    }

    /// 依次执行绑定到该名称的钩子，收集非空结果
    ///
    /// 单个钩子失败只记录错误，不影响其他钩子
    pub async fn execute(&self, hook_name: &str, ctx: &HookContext) -> Vec<serde_json::Value> {
        // 执行期间不持有锁
        let hooks = self.bound.read().get(hook_name).cloned().unwrap_or_default();

        let mut results = Vec::new();
        for bound in hooks {
            match bound.hook.call(ctx).await {
                Ok(Some(value)) => results.push(value),
                Ok(None) => {}
                Err(e) => error!(
                    "[HookRegistry] 插件 {} 的钩子 {} 执行失败: {}",
                    bound.plugin, hook_name, e
                ),
            }
        }
        results
    }
}
