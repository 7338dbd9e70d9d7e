use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::RwLock;

use webbly_lib::commands::package_cmd::{self, AdminState, CommandResult, PackageListItem};
use webbly_lib::config::AppConfig;
use webbly_lib::logger::{init_tracing, LogStore};
use webbly_lib::package::{available_templates, InstallProgress, PackageKind};
use webbly_lib::AdminWorkflow;

#[derive(Parser, Debug)]
#[command(name = "webbly", version)]
#[command(about = "Manage Webbly themes and plugins")]
struct Cli {
    /// 配置文件路径
    #[arg(long, global = true, env = "WEBBLY_CONFIG", default_value = "webbly.yaml")]
    config: PathBuf,

    /// 数据目录，覆盖配置文件和环境变量
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// 以 JSON 输出结果
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 上传并安装主题或插件包
    Install {
        #[arg(value_enum)]
        kind: KindArg,
        archive: PathBuf,
        /// 期望的 SHA256 校验和
        #[arg(long)]
        checksum: Option<String>,
    },
    /// 列出已安装的包
    List {
        #[arg(value_enum)]
        kind: KindArg,
    },
    /// 启用包（ID、目录名或名称）
    Activate {
        #[arg(value_enum)]
        kind: KindArg,
        package: String,
    },
    /// 停用包
    Deactivate {
        #[arg(value_enum)]
        kind: KindArg,
        package: String,
    },
    /// 删除未启用的包
    Delete {
        #[arg(value_enum)]
        kind: KindArg,
        package: String,
    },
    /// 扫描数据目录，登记手动放入的包
    Scan {
        #[arg(value_enum)]
        kind: Option<KindArg>,
    },
    /// 列出当前主题可用的页面模板
    Templates,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    #[value(alias = "themes")]
    Theme,
    #[value(alias = "plugins")]
    Plugin,
}

impl From<KindArg> for PackageKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Theme => PackageKind::Theme,
            KindArg::Plugin => PackageKind::Plugin,
        }
    }
}

fn print_result<T: serde::Serialize>(result: &CommandResult<T>, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else if result.success {
        if let Some(message) = &result.message {
            println!("{}", message);
        }
    } else {
        eprintln!("{}", result.error.as_deref().unwrap_or("unknown error"));
    }

    if result.success {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn print_table(items: &[PackageListItem]) {
    if items.is_empty() {
        println!("(none)");
        return;
    }
    for item in items {
        println!(
            "{} {:<24} {:<12} {:<20} {}",
            if item.active { "*" } else { " " },
            item.name,
            item.version,
            item.author,
            item.id
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(&cli.config)
        .with_context(|| format!("无法加载配置 {:?}", cli.config))?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    init_tracing(&config.logging);

    let workflow = AdminWorkflow::open(&config).context("无法打开数据目录")?;
    let logs = LogStore::with_config(&config.log_dir(), &config.logging);
    let state = AdminState::new(Arc::new(workflow), Arc::new(RwLock::new(logs)));
    let json = cli.json;

    match cli.command {
        Command::Install {
            kind,
            archive,
            checksum,
        } => {
            let bytes = std::fs::read(&archive)
                .with_context(|| format!("无法读取 {:?}", archive))?;
            let progress = |p: InstallProgress| {
                tracing::debug!("[{}] {}% {}", p.stage, p.percent, p.message);
            };
            let kind = PackageKind::from(kind);
            let result = package_cmd::upload_package(
                &state,
                kind.as_str(),
                &bytes,
                checksum.as_deref(),
                &progress,
            )
            .await;
            print_result(&result, json)
        }
        Command::List { kind } => {
            let result = package_cmd::list_packages(&state, PackageKind::from(kind).as_str()).await;
            if !json && result.success {
                print_table(result.data.as_deref().unwrap_or_default());
                return Ok(());
            }
            print_result(&result, json)
        }
        Command::Activate { kind, package } => {
            let kind = PackageKind::from(kind);
            let id = state.workflow.find(kind, &package)?.id;
            let result = package_cmd::activate_package(&state, kind.as_str(), &id).await;
            print_result(&result, json)
        }
        Command::Deactivate { kind, package } => {
            let kind = PackageKind::from(kind);
            let id = state.workflow.find(kind, &package)?.id;
            let result = package_cmd::deactivate_package(&state, kind.as_str(), &id).await;
            print_result(&result, json)
        }
        Command::Delete { kind, package } => {
            let kind = PackageKind::from(kind);
            let id = state.workflow.find(kind, &package)?.id;
            let result = package_cmd::delete_package(&state, kind.as_str(), &id).await;
            print_result(&result, json)
        }
        Command::Scan { kind } => {
            let kinds = match kind {
                Some(kind) => vec![PackageKind::from(kind)],
                None => vec![PackageKind::Theme, PackageKind::Plugin],
            };
            for kind in kinds {
                let added = state.workflow.rescan(kind).await?;
                println!("{}: {} new", kind, added.len());
                for package in added {
                    println!("  + {} v{}", package.manifest.name, package.manifest.version);
                }
            }
            Ok(())
        }
        Command::Templates => {
            let assets = state.workflow.active_theme_assets()?;
            for (value, label) in available_templates(assets.as_ref()) {
                println!("{:<24} {}", value, label);
            }
            Ok(())
        }
    }
}
