//! 日志管理模块
//!
//! - `init_tracing`: 安装 tracing-subscriber fmt 订阅者
//! - `LogStore`: 记录管理后台操作，保留最近的条目并追加到日志文件，
//!   超过大小限制时轮转，旧文件压缩后按保留天数清理
use chrono::{Duration, Local, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::LoggingConfig;

/// 日志文件名
pub const LOG_FILE_NAME: &str = "webbly.log";

/// 单条日志最大长度
const MAX_MESSAGE_LEN: usize = 2000;

static CONTROL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0B-\x1F\x7F\u{202A}-\u{202E}]").unwrap());

static LINE_BREAKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\r\n\t]+").unwrap());

/// 安装全局 tracing 订阅者，重复调用时忽略
pub fn init_tracing(logging: &LoggingConfig) {
    let level = logging
        .level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

#[derive(Debug, Clone)]
pub struct LogStoreConfig {
    pub max_logs: usize,
    pub retention_days: u32,
    pub max_file_size: u64,
    pub enable_file_logging: bool,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            max_logs: 1000,
            retention_days: 7,
            max_file_size: 10 * 1024 * 1024,
            enable_file_logging: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

pub struct LogStore {
    logs: VecDeque<LogEntry>,
    config: LogStoreConfig,
    log_file_path: Option<PathBuf>,
}

impl LogStore {
    /// 仅保存在内存中的日志
    pub fn in_memory() -> Self {
        Self {
            logs: VecDeque::new(),
            config: LogStoreConfig {
                enable_file_logging: false,
                ..LogStoreConfig::default()
            },
            log_file_path: None,
        }
    }

    /// 写入 `<log_dir>/webbly.log` 的日志
    pub fn new(log_dir: &Path, config: LogStoreConfig) -> Self {
        if config.enable_file_logging {
            if let Err(e) = fs::create_dir_all(log_dir) {
                tracing::warn!("[LogStore] 无法创建日志目录 {:?}: {}", log_dir, e);
            }
        }

        Self {
            logs: VecDeque::new(),
            config,
            log_file_path: Some(log_dir.join(LOG_FILE_NAME)),
        }
    }

    pub fn with_config(log_dir: &Path, logging: &LoggingConfig) -> Self {
        let config = LogStoreConfig {
            retention_days: logging.retention_days,
            enable_file_logging: logging.enabled,
            ..LogStoreConfig::default()
        };
        Self::new(log_dir, config)
    }

    pub fn add(&mut self, level: &str, message: &str) {
        let sanitized = sanitize_log_message(message);
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            message: sanitized.clone(),
        };

        self.logs.push_back(entry);

        if self.config.enable_file_logging {
            if let Some(path) = self.log_file_path.clone() {
                self.rotate_log_file_if_needed(&path);
                let local_time = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                let log_line = format!("{} [{}] {}\n", local_time, level.to_uppercase(), sanitized);

                if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
                    let _ = file.write_all(log_line.as_bytes());
                }
            }
        }

        while self.logs.len() > self.config.max_logs {
            self.logs.pop_front();
        }
    }

    pub fn get_logs(&self) -> Vec<LogEntry> {
        self.logs.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.logs.clear();
    }

    pub fn get_log_file_path(&self) -> Option<String> {
        self.log_file_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    fn rotate_log_file_if_needed(&self, path: &Path) {
        let Ok(metadata) = fs::metadata(path) else {
            return;
        };

        if metadata.len() <= self.config.max_file_size {
            return;
        }

        let suffix = Local::now().format("%Y%m%d-%H%M%S%.3f");
        let rotated = path.with_file_name(format!(
            "{}.{}",
            path.file_name().unwrap_or_default().to_string_lossy(),
            suffix
        ));

        let _ = fs::rename(path, &rotated);
        self.prune_old_logs(path);
    }

    /// 压缩轮转出的日志，删除超过保留期的文件
    fn prune_old_logs(&self, path: &Path) {
        let Some(dir) = path.parent() else {
            return;
        };
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        let cutoff = Utc::now() - Duration::days(self.config.retention_days as i64);
        let prefix = format!(
            "{}.",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if !file_name.starts_with(&prefix) {
                continue;
            }
            let rotated = entry.path();
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            let modified = chrono::DateTime::<Utc>::from(modified);

            if modified < cutoff {
                let _ = fs::remove_file(&rotated);
            } else if !file_name.ends_with(".gz") {
                compress_file(&rotated);
            }
        }
    }
}

/// gzip 压缩并删除原文件
fn compress_file(path: &Path) {
    let mut input = Vec::new();
    match fs::File::open(path) {
        Ok(mut file) => {
            if file.read_to_end(&mut input).is_err() {
                return;
            }
        }
        Err(_) => return,
    }

    let gz_path = PathBuf::from(format!("{}.gz", path.to_string_lossy()));
    if let Ok(gz_file) = fs::File::create(&gz_path) {
        let mut encoder = GzEncoder::new(gz_file, Compression::default());
        if encoder.write_all(&input).is_ok() && encoder.finish().is_ok() {
            let _ = fs::remove_file(path);
        }
    }
}

pub type SharedLogStore = Arc<RwLock<LogStore>>;

/// 清理不可信文本（如清单中的名称、描述）后再写入日志
///
/// 换行和制表符折叠为空格，去掉其他控制字符和双向文本控制符，超长时截断
pub fn sanitize_log_message(message: &str) -> String {
    let flattened = LINE_BREAKS.replace_all(message, " ");
    let cleaned = CONTROL_CHARS.replace_all(&flattened, "");

    if cleaned.chars().count() > MAX_MESSAGE_LEN {
        let truncated: String = cleaned.chars().take(MAX_MESSAGE_LEN).collect();
        format!("{}...", truncated)
    } else {
        cleaned.into_owned()
    }
}
