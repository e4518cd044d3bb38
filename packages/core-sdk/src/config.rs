use std::path::PathBuf;
use std::str::FromStr;

use time::Duration;
use tracing::warn;

use crate::cache;

/**
 * \brief 运行时设置，来自环境变量，缺省值可直接用于本地开发。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /** \brief SQLite 数据库路径。 */
    pub db_path: PathBuf,
    /** \brief 前端静态资源目录。 */
    pub ui_dir: Option<PathBuf>,
    pub ui_fallback_dir: Option<PathBuf>,
    /** \brief 遥测日志目录。 */
    pub log_dir: PathBuf,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    /** \brief 状态未知时，首次生成前是否先做连接校验。 */
    pub lazy_verify: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("lifescroll.db"),
            ui_dir: None,
            ui_fallback_dir: None,
            log_dir: PathBuf::from("logs"),
            cache_capacity: cache::DEFAULT_CAPACITY,
            cache_ttl: cache::DEFAULT_TTL,
            lazy_verify: false,
        }
    }
}

impl Settings {
    /**
     * \brief 读取 `LIFESCROLL_*` 环境变量。
     */
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 从任意来源读取设置，解析失败的值记录警告后回落到默认值。
     */
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            db_path: get("LIFESCROLL_DB").map(PathBuf::from).unwrap_or(defaults.db_path),
            ui_dir: get("LIFESCROLL_UI_DIR").map(PathBuf::from),
            ui_fallback_dir: get("LIFESCROLL_UI_FALLBACK").map(PathBuf::from),
            log_dir: get("LIFESCROLL_LOG_DIR").map(PathBuf::from).unwrap_or(defaults.log_dir),
            cache_capacity: parse_or(
                "LIFESCROLL_CACHE_CAPACITY",
                get("LIFESCROLL_CACHE_CAPACITY"),
                defaults.cache_capacity,
            ),
            cache_ttl: Duration::hours(parse_or(
                "LIFESCROLL_CACHE_TTL_HOURS",
                get("LIFESCROLL_CACHE_TTL_HOURS"),
                defaults.cache_ttl.whole_hours(),
            )),
            lazy_verify: get("LIFESCROLL_LAZY_VERIFY")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(defaults.lazy_verify),
        }
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparsable setting");
            default
        }),
    }
}
