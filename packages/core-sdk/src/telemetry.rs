use std::sync::atomic::{AtomicBool, Ordering};
use std::{fs::OpenOptions, io::Write, path::PathBuf};

use anyhow::Result;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::warn;

const LOG_FILE: &str = "lifescroll.log";

/**
 * \brief 可选的本地使用记录，默认关闭。只记录服务商、模型、耗时与错误类别，从不记录密钥。
 */
#[derive(Debug)]
pub struct Telemetry {
    enabled: AtomicBool,
    log_dir: PathBuf,
}

impl Telemetry {
    pub fn new(log_dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            log_dir: log_dir.into(),
        }
    }

    /**
     * \brief 更新遥测开关状态。
     */
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /**
     * \brief 查询当前遥测开关状态。
     */
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(LOG_FILE)
    }

    /**
     * \brief 记录常规事件。
     */
    pub fn log_event(&self, category: &str, message: &str) {
        self.record("INFO", category, message);
    }

    /**
     * \brief 记录错误事件。
     */
    pub fn log_error(&self, category: &str, message: &str) {
        self.record("ERROR", category, message);
    }

    fn record(&self, level: &str, category: &str, message: &str) {
        if !self.is_enabled() {
            return;
        }
        if let Err(err) = self.write_line(level, category, message) {
            warn!(error = %err, "telemetry write failed");
        }
    }

    fn write_line(&self, level: &str, category: &str, message: &str) -> Result<()> {
        if !self.log_dir.exists() {
            std::fs::create_dir_all(&self.log_dir)?;
        }
        let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        writeln!(file, "{} [{}] {} - {}", timestamp, level, category, message)?;
        Ok(())
    }
}
