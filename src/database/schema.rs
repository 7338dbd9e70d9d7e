use rusqlite::Connection;

/// 当前 schema 版本
pub const SCHEMA_VERSION: i32 = 1;

/// 创建表结构
pub fn create_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS installed_packages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            directory TEXT NOT NULL,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            author TEXT,
            description TEXT,
            entry_point TEXT NOT NULL,
            manifest_json TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 0,
            screenshot_path TEXT,
            install_path TEXT NOT NULL,
            installed_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(kind, directory)
        );

        -- 存储层兜底：最多一个启用的主题
        CREATE UNIQUE INDEX IF NOT EXISTS idx_installed_packages_active_theme
            ON installed_packages(kind) WHERE kind = 'theme' AND active = 1;

        CREATE INDEX IF NOT EXISTS idx_installed_packages_kind
            ON installed_packages(kind, installed_at);",
    )?;

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_second_active_theme_rejected_by_index() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        let insert = "INSERT INTO installed_packages
            (id, kind, directory, name, version, entry_point, manifest_json, active,
             install_path, installed_at, updated_at)
            VALUES (?1, ?2, ?1, ?1, '1.0.0', 'index.html', '{}', 1, '/tmp', 'now', 'now')";

        conn.execute(insert, ["a", "theme"]).unwrap();
        assert!(conn.execute(insert, ["b", "theme"]).is_err());

        // 插件不受限制
        conn.execute(insert, ["c", "plugin"]).unwrap();
        conn.execute(insert, ["d", "plugin"]).unwrap();
    }
}
