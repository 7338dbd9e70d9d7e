//! 已安装包数据访问对象
//!
//! 提供主题/插件记录的 CRUD 和启用状态切换

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;

use crate::package::{InstalledPackage, PackageError, PackageKind, PackageManifest};

const SELECT_COLUMNS: &str = "SELECT id, kind, directory, manifest_json, active, screenshot_path,
            install_path, installed_at, updated_at
     FROM installed_packages";

/// 数据库行结构
struct PackageRow {
    id: String,
    kind: String,
    directory: String,
    manifest_json: String,
    active: i32,
    screenshot_path: Option<String>,
    install_path: String,
    installed_at: String,
    updated_at: String,
}

impl PackageRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(PackageRow {
            id: row.get(0)?,
            kind: row.get(1)?,
            directory: row.get(2)?,
            manifest_json: row.get(3)?,
            active: row.get(4)?,
            screenshot_path: row.get(5)?,
            install_path: row.get(6)?,
            installed_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_package(self) -> Result<InstalledPackage, PackageError> {
        let kind: PackageKind = self.kind.parse().map_err(PackageError::Database)?;
        let manifest: PackageManifest = serde_json::from_str(&self.manifest_json)?;

        Ok(InstalledPackage {
            id: self.id,
            kind,
            directory: self.directory,
            manifest,
            active: self.active != 0,
            screenshot_path: self.screenshot_path,
            install_path: PathBuf::from(self.install_path),
            installed_at: parse_timestamp(&self.installed_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

/// 固定宽度的 RFC 3339，字符串顺序即时间顺序
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, PackageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| PackageError::Database(format!("无效的时间格式 {}: {}", raw, e)))
}

fn query_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<InstalledPackage>, PackageError> {
    let row = conn
        .query_row(sql, params, PackageRow::from_row)
        .optional()?;

    row.map(PackageRow::into_package).transpose()
}

pub struct InstalledPackagesDao;

impl InstalledPackagesDao {
    /// 写入包记录
    ///
    /// 同种类同目录已存在时原地更新，保留 seq 以维持列表顺序
    pub fn upsert(conn: &Connection, package: &InstalledPackage) -> Result<(), PackageError> {
        let manifest_json = serde_json::to_string(&package.manifest)?;

        conn.execute(
            "INSERT INTO installed_packages
             (id, kind, directory, name, version, author, description, entry_point,
              manifest_json, active, screenshot_path, install_path, installed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(kind, directory) DO UPDATE SET
                id = excluded.id,
                name = excluded.name,
                version = excluded.version,
                author = excluded.author,
                description = excluded.description,
                entry_point = excluded.entry_point,
                manifest_json = excluded.manifest_json,
                active = excluded.active,
                screenshot_path = excluded.screenshot_path,
                install_path = excluded.install_path,
                installed_at = excluded.installed_at,
                updated_at = excluded.updated_at",
            params![
                package.id,
                package.kind.as_str(),
                package.directory,
                package.manifest.name,
                package.manifest.version,
                package.manifest.author,
                package.manifest.description,
                package.manifest.entry_point,
                manifest_json,
                package.active as i32,
                package.screenshot_path,
                package.install_path.to_string_lossy().to_string(),
                format_timestamp(&package.installed_at),
                format_timestamp(&package.updated_at),
            ],
        )?;

        Ok(())
    }

    /// 删除包记录
    pub fn delete(conn: &Connection, id: &str) -> Result<bool, PackageError> {
        let rows_affected =
            conn.execute("DELETE FROM installed_packages WHERE id = ?1", params![id])?;

        Ok(rows_affected > 0)
    }

    /// 按 ID 获取
    pub fn get(conn: &Connection, id: &str) -> Result<Option<InstalledPackage>, PackageError> {
        query_one(
            conn,
            &format!("{} WHERE id = ?1", SELECT_COLUMNS),
            params![id],
        )
    }

    /// 按种类和目录名获取
    pub fn get_by_directory(
        conn: &Connection,
        kind: PackageKind,
        directory: &str,
    ) -> Result<Option<InstalledPackage>, PackageError> {
        query_one(
            conn,
            &format!("{} WHERE kind = ?1 AND directory = ?2", SELECT_COLUMNS),
            params![kind.as_str(), directory],
        )
    }

    /// 列出某种类的所有包，按安装时间升序
    pub fn list(conn: &Connection, kind: PackageKind) -> Result<Vec<InstalledPackage>, PackageError> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE kind = ?1 ORDER BY installed_at ASC, seq ASC",
            SELECT_COLUMNS
        ))?;

        let rows = stmt.query_map(params![kind.as_str()], PackageRow::from_row)?;

        let mut packages = Vec::new();
        for row in rows {
            packages.push(row?.into_package()?);
        }

        Ok(packages)
    }

    /// 当前启用的主题
    pub fn active_theme(conn: &Connection) -> Result<Option<InstalledPackage>, PackageError> {
        query_one(
            conn,
            &format!("{} WHERE kind = 'theme' AND active = 1", SELECT_COLUMNS),
            [],
        )
    }

    /// 更新单个包的启用状态
    pub fn set_active(conn: &Connection, id: &str, active: bool) -> Result<bool, PackageError> {
        let rows_affected = conn.execute(
            "UPDATE installed_packages SET active = ?1 WHERE id = ?2",
            params![active as i32, id],
        )?;

        Ok(rows_affected > 0)
    }

    /// 切换启用的主题
    ///
    /// 在同一事务内停用旧主题并启用新主题，返回被停用的主题 ID
    pub fn set_active_theme(conn: &mut Connection, id: &str) -> Result<Option<String>, PackageError> {
        let tx = conn.transaction()?;

        let previous: Option<String> = tx
            .query_row(
                "SELECT id FROM installed_packages WHERE kind = 'theme' AND active = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        tx.execute(
            "UPDATE installed_packages SET active = 0 WHERE kind = 'theme' AND active = 1",
            [],
        )?;
        let rows_affected = tx.execute(
            "UPDATE installed_packages SET active = 1 WHERE kind = 'theme' AND id = ?1",
            params![id],
        )?;

        if rows_affected == 0 {
            // 目标不存在，回滚以保留原主题
            tx.rollback()?;
            return Err(PackageError::PackageNotFound(id.to_string()));
        }

        tx.commit()?;
        Ok(previous.filter(|prev| prev != id))
    }
}
