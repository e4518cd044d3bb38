use anyhow::{Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::{thread, time::Duration};

/** \brief 生成配置（加密后的密钥随配置一起保存）。 */
pub const KEY_GENERATION_CONFIG: &str = "generation_config";
/** \brief 响应缓存条目列表。 */
pub const KEY_RESPONSE_CACHE: &str = "response_cache";
/** \brief 最近一次连接状态。 */
pub const KEY_CONNECTION_STATUS: &str = "connection_status";
/** \brief 遥测开关，取值 "1"/"0"。 */
pub const KEY_TELEMETRY_ENABLED: &str = "telemetry_enabled";

/**
 * \brief 本地键值存储。值一律为字符串（通常是 JSON）。
 */
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/**
 * \brief 基于 SQLite 的键值存储。
 */
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /**
     * \brief 打开（或创建）数据库文件并完成迁移。
     */
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn)
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM kv_store WHERE key=?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(Into::into)
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            retry_on_locked(|| {
                conn.execute(
                    "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                    params![key, value],
                )
            })?;
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            retry_on_locked(|| conn.execute("DELETE FROM kv_store WHERE key=?1", params![key]))?;
            Ok(())
        })
    }
}

/**
 * \brief 纯内存实现，用于测试与临时会话。
 */
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
        Ok(())
    }
}

/**
 * \brief 运行数据库迁移，创建键值表。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 读取布尔开关，未设置时返回默认值。
 */
pub fn get_bool(store: &dyn KvStore, key: &str, default: bool) -> Result<bool> {
    Ok(store.get(key)?.map(|s| s == "1").unwrap_or(default))
}

pub fn set_bool(store: &dyn KvStore, key: &str, value: bool) -> Result<()> {
    store.set(key, if value { "1" } else { "0" })
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 并线性退避，最多重试 5 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_store() -> SqliteStore {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        SqliteStore {
            conn: Mutex::new(conn),
        }
    }

    #[test]
    fn test_set_get_overwrite_remove() {
        let store = mem_store();
        assert_eq!(store.get("k").expect("get"), None);
        store.set("k", "v1").expect("set");
        store.set("k", "v2").expect("overwrite");
        assert_eq!(store.get("k").expect("get").as_deref(), Some("v2"));
        store.remove("k").expect("remove");
        assert_eq!(store.get("k").expect("get"), None);
        store.remove("k").expect("remove missing is a no-op");
    }

    #[test]
    fn test_bool_helpers() {
        let store = MemoryStore::default();
        assert!(!get_bool(&store, KEY_TELEMETRY_ENABLED, false).expect("default"));
        set_bool(&store, KEY_TELEMETRY_ENABLED, true).expect("set");
        assert!(get_bool(&store, KEY_TELEMETRY_ENABLED, false).expect("get"));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lifescroll.db");
        {
            let store = SqliteStore::open(&path).expect("open");
            store.set(KEY_GENERATION_CONFIG, "{\"model\":\"m\"}").expect("set");
        }
        let store = SqliteStore::open(&path).expect("reopen");
        assert_eq!(
            store.get(KEY_GENERATION_CONFIG).expect("get").as_deref(),
            Some("{\"model\":\"m\"}")
        );
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        migrate(&conn).expect("first");
        migrate(&conn).expect("second");
    }
}
