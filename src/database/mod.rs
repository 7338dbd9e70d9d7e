pub mod dao;
pub mod schema;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub type DbConnection = Arc<Mutex<Connection>>;

/// 初始化数据库连接
///
/// 父目录不存在时自动创建
pub fn init_database(db_path: &Path) -> Result<DbConnection, String> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("无法创建数据库目录 {:?}: {}", parent, e))?;
        }
    }

    let conn = Connection::open(db_path).map_err(|e| e.to_string())?;

    schema::create_tables(&conn).map_err(|e| e.to_string())?;
    tracing::info!("[数据库] 已初始化: {:?}", db_path);

    Ok(Arc::new(Mutex::new(conn)))
}

/// 内存数据库，用于测试和一次性命令
pub fn init_in_memory() -> Result<DbConnection, String> {
    let conn = Connection::open_in_memory().map_err(|e| e.to_string())?;
    schema::create_tables(&conn).map_err(|e| e.to_string())?;
    Ok(Arc::new(Mutex::new(conn)))
}
