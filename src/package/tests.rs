//! 工作流端到端测试
//!
//! 覆盖主题单一启用、幂等、插件独立、安装原子性、删除保护、
//! 路径穿越拒绝和清单往返

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use super::validator::test_archives::*;
use super::*;
use crate::config::AppConfig;

fn open_workflow(temp_dir: &TempDir) -> AdminWorkflow {
    AdminWorkflow::open(&AppConfig::with_data_dir(temp_dir.path())).unwrap()
}

async fn upload(
    workflow: &AdminWorkflow,
    kind: PackageKind,
    bytes: &[u8],
) -> Result<InstalledPackage, PackageError> {
    workflow
        .upload_and_install(kind, bytes, None, &NoopProgressCallback)
        .await
}

fn active_ids(workflow: &AdminWorkflow, kind: PackageKind) -> Vec<String> {
    workflow
        .list(kind)
        .unwrap()
        .into_iter()
        .filter(|p| p.active)
        .map(|p| p.id)
        .collect()
}

/// 目录下的所有文件（递归）
fn files_under(dir: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(files_under(&path));
        } else {
            files.push(path.to_string_lossy().into_owned());
        }
    }
    files
}

#[tokio::test]
async fn test_aurora_borealis_scenario() {
    let temp_dir = TempDir::new().unwrap();
    let workflow = open_workflow(&temp_dir);

    let aurora = upload(&workflow, PackageKind::Theme, &theme_zip("Aurora", "1.0.0"))
        .await
        .unwrap();
    assert!(!aurora.active);
    assert!(active_ids(&workflow, PackageKind::Theme).is_empty());

    let t = workflow.activate(PackageKind::Theme, &aurora.id).await.unwrap();
    assert!(t.changed);
    assert_eq!(active_ids(&workflow, PackageKind::Theme), vec![aurora.id.clone()]);

    let borealis = upload(&workflow, PackageKind::Theme, &theme_zip("Borealis", "1.0.0"))
        .await
        .unwrap();
    assert!(!borealis.active);
    assert_eq!(active_ids(&workflow, PackageKind::Theme), vec![aurora.id.clone()]);

    let t = workflow
        .activate(PackageKind::Theme, &borealis.id)
        .await
        .unwrap();
    assert_eq!(t.previous.map(|p| p.id), Some(aurora.id.clone()));
    assert_eq!(active_ids(&workflow, PackageKind::Theme), vec![borealis.id.clone()]);
    assert!(!workflow.get(&aurora.id).unwrap().unwrap().active);
}

#[tokio::test]
async fn test_activate_theme_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let workflow = open_workflow(&temp_dir);
    let aurora = upload(&workflow, PackageKind::Theme, &theme_zip("Aurora", "1.0.0"))
        .await
        .unwrap();
    upload(&workflow, PackageKind::Theme, &theme_zip("Borealis", "1.0.0"))
        .await
        .unwrap();

    workflow.activate(PackageKind::Theme, &aurora.id).await.unwrap();
    let once = workflow.list(PackageKind::Theme).unwrap();

    let t = workflow.activate(PackageKind::Theme, &aurora.id).await.unwrap();
    assert!(!t.changed);
    assert_eq!(workflow.list(PackageKind::Theme).unwrap(), once);
}

#[tokio::test]
async fn test_activate_unknown_id() {
    let temp_dir = TempDir::new().unwrap();
    let workflow = open_workflow(&temp_dir);

    for kind in [PackageKind::Theme, PackageKind::Plugin] {
        let result = workflow.activate(kind, "no-such-id").await;
        assert!(matches!(result, Err(PackageError::PackageNotFound(_))));
    }
}

#[tokio::test]
async fn test_plugin_independence() {
    let temp_dir = TempDir::new().unwrap();
    let workflow = open_workflow(&temp_dir);
    let theme = upload(&workflow, PackageKind::Theme, &theme_zip("Aurora", "1.0.0"))
        .await
        .unwrap();
    workflow.activate(PackageKind::Theme, &theme.id).await.unwrap();

    let seo = upload(&workflow, PackageKind::Plugin, &plugin_zip("SEO", &[]))
        .await
        .unwrap();
    let cache = upload(&workflow, PackageKind::Plugin, &plugin_zip("Cache", &[]))
        .await
        .unwrap();
    workflow.activate(PackageKind::Plugin, &cache.id).await.unwrap();

    workflow.activate(PackageKind::Plugin, &seo.id).await.unwrap();
    assert!(workflow.get(&cache.id).unwrap().unwrap().active);
    assert!(workflow.get(&theme.id).unwrap().unwrap().active);

    workflow.deactivate(PackageKind::Plugin, &seo.id).await.unwrap();
    assert!(!workflow.get(&seo.id).unwrap().unwrap().active);
    assert!(workflow.get(&cache.id).unwrap().unwrap().active);
    assert!(workflow.get(&theme.id).unwrap().unwrap().active);

    workflow.deactivate(PackageKind::Plugin, &cache.id).await.unwrap();
    assert!(active_ids(&workflow, PackageKind::Plugin).is_empty());
    assert_eq!(active_ids(&workflow, PackageKind::Theme), vec![theme.id]);
}

#[tokio::test]
async fn test_interrupted_install_leaves_no_directory() {
    let temp_dir = TempDir::new().unwrap();
    let workflow = open_workflow(&temp_dir);

    let manifest = theme_manifest("Halfway", "1.0.0");
    let mut bytes = zip_bytes(&[
        ("theme.json", manifest.as_bytes()),
        ("templates/index.html", b"<html></html>"),
        ("static/big.css", b"BREAK-HERE .a { color: red; }"),
    ]);
    let marker = b"BREAK-HERE";
    let pos = bytes.windows(marker.len()).position(|w| w == marker).unwrap();
    bytes[pos] ^= 0xFF;

    let result = upload(&workflow, PackageKind::Theme, &bytes).await;
    assert!(result.is_err());

    assert!(!temp_dir.path().join("themes").join("halfway").exists());
    assert!(files_under(&temp_dir.path().join("themes")).is_empty());
    assert!(workflow.list(PackageKind::Theme).unwrap().is_empty());
}

#[tokio::test]
async fn test_interrupted_reinstall_keeps_old_package() {
    let temp_dir = TempDir::new().unwrap();
    let workflow = open_workflow(&temp_dir);
    let original = upload(&workflow, PackageKind::Theme, &theme_zip("Aurora", "1.0.0"))
        .await
        .unwrap();
    workflow.activate(PackageKind::Theme, &original.id).await.unwrap();
    let before = files_under(&original.install_path);

    let manifest = theme_manifest("Aurora", "2.0.0");
    let mut bytes = zip_bytes(&[
        ("theme.json", manifest.as_bytes()),
        ("templates/index.html", b"<html>v2</html>"),
        ("static/v2.css", b"BREAK-HERE body {}"),
    ]);
    let marker = b"BREAK-HERE";
    let pos = bytes.windows(marker.len()).position(|w| w == marker).unwrap();
    bytes[pos] ^= 0xFF;

    assert!(upload(&workflow, PackageKind::Theme, &bytes).await.is_err());

    let mut after = files_under(&original.install_path);
    let mut before = before;
    before.sort();
    after.sort();
    assert_eq!(before, after);

    let current = workflow.get(&original.id).unwrap().unwrap();
    assert_eq!(current.manifest.version, "1.0.0");
    assert!(current.active);
}

#[tokio::test]
async fn test_delete_guard() {
    let temp_dir = TempDir::new().unwrap();
    let workflow = open_workflow(&temp_dir);
    let theme = upload(&workflow, PackageKind::Theme, &theme_zip("Aurora", "1.0.0"))
        .await
        .unwrap();
    let plugin = upload(&workflow, PackageKind::Plugin, &plugin_zip("SEO", &[]))
        .await
        .unwrap();
    workflow.activate(PackageKind::Theme, &theme.id).await.unwrap();
    workflow.activate(PackageKind::Plugin, &plugin.id).await.unwrap();

    for package in [&theme, &plugin] {
        let result = workflow.delete(package.kind, &package.id).await;
        assert!(matches!(result, Err(PackageError::PackageActive(_))));

        let current = workflow.get(&package.id).unwrap().unwrap();
        assert!(current.active);
        assert!(current.install_path.join(package.kind.manifest_file()).is_file());
    }

    // 停用后可以删除
    workflow.deactivate(PackageKind::Plugin, &plugin.id).await.unwrap();
    workflow.delete(PackageKind::Plugin, &plugin.id).await.unwrap();
    assert!(workflow.get(&plugin.id).unwrap().is_none());
    assert!(!plugin.install_path.exists());
}

#[tokio::test]
async fn test_path_traversal_rejected_nothing_written() {
    let data_dir = TempDir::new().unwrap();
    let workflow = open_workflow(&data_dir);

    let manifest = theme_manifest("Evil", "1.0.0");
    for bytes in [
        zip_bytes(&[
            ("theme.json", manifest.as_bytes()),
            ("templates/index.html", b"<html></html>"),
            ("../../etc/passwd", b"root:x:0:0"),
        ]),
        zip_bytes(&[
            ("theme.json", manifest.as_bytes()),
            ("templates/index.html", b"<html></html>"),
            ("templates/../../../escape.txt", b"x"),
        ]),
    ] {
        let result = upload(&workflow, PackageKind::Theme, &bytes).await;
        assert!(matches!(result, Err(PackageError::UnsafePath(_))));
    }

    let written: Vec<String> = files_under(data_dir.path())
        .into_iter()
        .filter(|f| !f.contains("webbly.db"))
        .collect();
    assert!(written.is_empty(), "意外写入: {:?}", written);
    assert!(!data_dir.path().parent().unwrap().join("etc/passwd").exists());
    assert!(workflow.list(PackageKind::Theme).unwrap().is_empty());
}

#[tokio::test]
async fn test_manifest_round_trip_through_list() {
    let temp_dir = TempDir::new().unwrap();
    let workflow = open_workflow(&temp_dir);

    let manifest_json = r#"{
        "name": "Borealis",
        "version": "2.3.1-beta",
        "author": "Northern Lights Studio",
        "description": "A cool theme with \"quotes\" and unicode ✓",
        "entry_point": "templates/index.html",
        "screenshot": "preview.png",
        "homepage": "https://example.com/borealis",
        "license": "MIT"
    }"#;
    let bytes = targz_bytes(&[
        ("borealis/theme.json", manifest_json.as_bytes()),
        ("borealis/templates/index.html", b"<html></html>"),
        ("borealis/preview.png", b"\x89PNG"),
    ]);

    upload(&workflow, PackageKind::Theme, &bytes).await.unwrap();

    let expected: PackageManifest = serde_json::from_str(manifest_json).unwrap();
    let listed = workflow.list(PackageKind::Theme).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].manifest, expected);
    assert_eq!(listed[0].directory, "borealis");
    assert_eq!(listed[0].screenshot_path.as_deref(), Some("preview.png"));
}

#[tokio::test]
async fn test_list_ordered_by_install_time() {
    let temp_dir = TempDir::new().unwrap();
    let workflow = open_workflow(&temp_dir);

    for name in ["Zeta", "Alpha", "Mid"] {
        upload(&workflow, PackageKind::Plugin, &plugin_zip(name, &[]))
            .await
            .unwrap();
    }

    let listed = workflow.list(PackageKind::Plugin).unwrap();
    let names: Vec<&str> = listed.iter().map(|p| p.manifest.name.as_str()).collect();
    assert_eq!(names, vec!["Zeta", "Alpha", "Mid"]);
    assert!(listed
        .windows(2)
        .all(|w| w[0].installed_at <= w[1].installed_at));
}

#[tokio::test]
async fn test_plugin_hooks_follow_activation() {
    use async_trait::async_trait;
    use serde_json::json;

    struct MetaTags;

    #[async_trait]
    impl PluginHook for MetaTags {
        fn name(&self) -> &str {
            "before_render"
        }

        async fn call(&self, ctx: &HookContext) -> Result<Option<serde_json::Value>, HookError> {
            Ok(Some(json!({ "seen": ctx.payload["page"] })))
        }
    }

    let temp_dir = TempDir::new().unwrap();
    let workflow = open_workflow(&temp_dir);
    workflow.hooks().provide("seo", Arc::new(MetaTags));

    let seo = upload(
        &workflow,
        PackageKind::Plugin,
        &plugin_zip("SEO", &["before_render"]),
    )
    .await
    .unwrap();
    let ctx = HookContext::new("before_render", json!({ "page": "home" }));
    assert!(workflow.hooks().execute("before_render", &ctx).await.is_empty());

    workflow.activate(PackageKind::Plugin, &seo.id).await.unwrap();
    assert_eq!(
        workflow.hooks().execute("before_render", &ctx).await,
        vec![json!({ "seen": "home" })]
    );

    workflow.deactivate(PackageKind::Plugin, &seo.id).await.unwrap();
    assert!(workflow.hooks().execute("before_render", &ctx).await.is_empty());

    // 重启后重新绑定
    workflow.activate(PackageKind::Plugin, &seo.id).await.unwrap();
    workflow.hooks().unbind("seo");
    assert_eq!(workflow.rebind_active_plugins().unwrap(), 1);
    assert_eq!(workflow.hooks().bound_plugins("before_render"), vec!["seo"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_theme_activations_serialize() {
    let temp_dir = TempDir::new().unwrap();
    let workflow = Arc::new(open_workflow(&temp_dir));

    let mut ids = Vec::new();
    for i in 0..8 {
        let theme = upload(
            &workflow,
            PackageKind::Theme,
            &theme_zip(&format!("Theme {}", i), "1.0.0"),
        )
        .await
        .unwrap();
        ids.push(theme.id);
    }

    let handles: Vec<_> = ids
        .iter()
        .cloned()
        .map(|id| {
            let workflow = Arc::clone(&workflow);
            tokio::spawn(async move { workflow.activate(PackageKind::Theme, &id).await })
        })
        .collect();

    let mut transitions = Vec::new();
    for handle in handles {
        transitions.push(handle.await.unwrap().unwrap());
    }

    // 每次切换都看到了上一次切换完成后的状态：previous 串成一条链
    let mut next_of: HashMap<Option<String>, String> = HashMap::new();
    for t in &transitions {
        assert!(t.changed);
        let previous = t.previous.as_ref().map(|p| p.id.clone());
        assert!(
            next_of.insert(previous, t.package.id.clone()).is_none(),
            "两次切换替换了同一个主题"
        );
    }
    let mut cursor = None;
    let mut chain = Vec::new();
    while let Some(next) = next_of.get(&cursor) {
        chain.push(next.clone());
        cursor = Some(next.clone());
    }
    assert_eq!(chain.len(), ids.len());

    let active = active_ids(&workflow, PackageKind::Theme);
    assert_eq!(active.len(), 1);
    assert_eq!(Some(&active[0]), chain.last());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_plugin_toggles() {
    let temp_dir = TempDir::new().unwrap();
    let workflow = Arc::new(open_workflow(&temp_dir));

    let mut ids = Vec::new();
    for i in 0..6 {
        let plugin = upload(
            &workflow,
            PackageKind::Plugin,
            &plugin_zip(&format!("Plugin {}", i), &[]),
        )
        .await
        .unwrap();
        ids.push(plugin.id);
    }

    // 偶数号启用，奇数号启用后再停用
    let handles: Vec<_> = ids
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, id)| {
            let workflow = Arc::clone(&workflow);
            tokio::spawn(async move {
                workflow.activate(PackageKind::Plugin, &id).await?;
                if i % 2 == 1 {
                    workflow.deactivate(PackageKind::Plugin, &id).await?;
                }
                Ok::<_, PackageError>(())
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for (i, id) in ids.iter().enumerate() {
        assert_eq!(workflow.get(id).unwrap().unwrap().active, i % 2 == 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_activate_racing_delete() {
    for _ in 0..10 {
        let temp_dir = TempDir::new().unwrap();
        let workflow = Arc::new(open_workflow(&temp_dir));
        let theme = upload(&workflow, PackageKind::Theme, &theme_zip("Aurora", "1.0.0"))
            .await
            .unwrap();

        let activate = {
            let workflow = Arc::clone(&workflow);
            let id = theme.id.clone();
            tokio::spawn(async move { workflow.activate(PackageKind::Theme, &id).await })
        };
        let delete = {
            let workflow = Arc::clone(&workflow);
            let id = theme.id.clone();
            tokio::spawn(async move { workflow.delete(PackageKind::Theme, &id).await })
        };

        let activated = activate.await.unwrap();
        let deleted = delete.await.unwrap();

        match (activated, deleted) {
            // 先启用：删除被拒绝，主题保持启用
            (Ok(_), Err(PackageError::PackageActive(_))) => {
                let current = workflow.get(&theme.id).unwrap().unwrap();
                assert!(current.active);
                assert!(current.install_path.exists());
            }
            // 先删除：启用找不到包，目录已清除
            (Err(PackageError::PackageNotFound(_)), Ok(_)) => {
                assert!(workflow.get(&theme.id).unwrap().is_none());
                assert!(!theme.install_path.exists());
            }
            other => panic!("不一致的结果: {:?}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_uploads_of_different_kinds() {
    let temp_dir = TempDir::new().unwrap();
    let workflow = Arc::new(open_workflow(&temp_dir));

    let mut handles = Vec::new();
    for i in 0..4 {
        let themes = Arc::clone(&workflow);
        handles.push(tokio::spawn(async move {
            let bytes = theme_zip(&format!("Theme {}", i), "1.0.0");
            upload(&themes, PackageKind::Theme, &bytes).await
        }));
        let plugins = Arc::clone(&workflow);
        handles.push(tokio::spawn(async move {
            let bytes = plugin_zip(&format!("Plugin {}", i), &[]);
            upload(&plugins, PackageKind::Plugin, &bytes).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(workflow.list(PackageKind::Theme).unwrap().len(), 4);
    assert_eq!(workflow.list(PackageKind::Plugin).unwrap().len(), 4);
    assert!(files_under(&temp_dir.path().join("themes/.staging")).is_empty());
    assert!(files_under(&temp_dir.path().join("plugins/.staging")).is_empty());
}

/// 属性测试模块
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_manifest() -> impl Strategy<Value = (String, String, String, String)> {
        (
            "[A-Z][a-z]{2,10}( [A-Z][a-z]{2,8})?",
            (0u32..20, 0u32..20, 0u32..50).prop_map(|(a, b, c)| format!("{}.{}.{}", a, b, c)),
            "[A-Za-z ]{1,20}",
            "[A-Za-z0-9 .,!]{0,40}",
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// 安装后列表中的清单与上传的清单完全一致
        #[test]
        fn prop_install_then_list_round_trips(
            (name, version, author, description) in arb_manifest()
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let temp_dir = TempDir::new().unwrap();
            let workflow = open_workflow(&temp_dir);

            let manifest = PackageManifest {
                name: name.clone(),
                version,
                author,
                description,
                entry_point: "__init__.py".to_string(),
                screenshot: None,
                homepage: None,
                license: None,
                hooks: vec!["before_render".to_string()],
            };
            let json = serde_json::to_string(&manifest).unwrap();
            let bytes = zip_bytes(&[
                ("plugin.json", json.as_bytes()),
                ("__init__.py", b"pass"),
            ]);

            let installed = runtime
                .block_on(upload(&workflow, PackageKind::Plugin, &bytes))
                .unwrap();
            let listed = workflow.list(PackageKind::Plugin).unwrap();

            prop_assert_eq!(listed.len(), 1);
            prop_assert_eq!(&listed[0].manifest, &manifest);
            prop_assert_eq!(&listed[0], &installed);
            prop_assert_eq!(listed[0].directory.clone(), sanitize_directory_name(&name));
        }

        /// 任意顺序的启用操作后只有最后启用的主题处于启用状态
        #[test]
        fn prop_last_activated_theme_wins(order in prop::collection::vec(0usize..3, 1..12)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let temp_dir = TempDir::new().unwrap();
            let workflow = open_workflow(&temp_dir);

            let ids: Vec<String> = runtime.block_on(async {
                let mut ids = Vec::new();
                for name in ["Aurora", "Borealis", "Corona"] {
                    let theme = upload(&workflow, PackageKind::Theme, &theme_zip(name, "1.0.0"))
                        .await
                        .unwrap();
                    ids.push(theme.id);
                }
                ids
            });

            for i in &order {
                runtime
                    .block_on(workflow.activate(PackageKind::Theme, &ids[*i]))
                    .unwrap();
                let active = active_ids(&workflow, PackageKind::Theme);
                prop_assert_eq!(active, vec![ids[*i].clone()]);
            }
        }
    }
}
