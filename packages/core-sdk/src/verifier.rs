use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{ClassifiedError, ErrorClass};
use crate::llm::HttpTransport;
use crate::models::{GenerationConfig, Message};
use crate::pipeline;
use crate::registry::ProviderRegistry;

/** \brief 探测请求的输出上限，尽量压低成本。 */
pub const PROBE_MAX_TOKENS: u32 = 8;
const PROBE_PROMPT: &str = "ping";

/**
 * \brief 连接状态。没有终态，任意已完成状态都可再次进入 `testing`。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unknown,
    Testing,
    Connected,
    Disconnected,
}

/**
 * \brief 连接状态快照，只有校验器会修改它。
 * \details 调用统计与连接状态一同持久化：`lastCall` 为最近一次真实请求的时间，
 * `todayCalls` 为当天（UTC）发往服务商的请求数，跨天后从零计数。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_latency_ms: Option<u64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_checked_at: Option<OffsetDateTime>,
    pub last_error: Option<ClassifiedError>,
    #[serde(default, rename = "lastCall", with = "time::serde::rfc3339::option")]
    pub last_call_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub today_calls: u32,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Unknown,
            last_latency_ms: None,
            last_checked_at: None,
            last_error: None,
            last_call_at: None,
            today_calls: 0,
        }
    }
}

impl ConnectionStatus {
    /**
     * \brief 从持久化数据恢复：上次进程在探测途中退出时，状态回到 `unknown`。
     */
    pub fn restored(mut self) -> Self {
        if self.state == ConnectionState::Testing {
            self.state = ConnectionState::Unknown;
        }
        self
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /**
     * \brief 记录一次发往服务商的请求。
     */
    pub fn record_call(&mut self, now: OffsetDateTime) {
        self.today_calls = self.calls_on(now).saturating_add(1);
        self.last_call_at = Some(now);
    }

    /**
     * \brief `now` 所在日期的调用次数；最近一次调用不在同一天时为 0。
     */
    pub fn calls_on(&self, now: OffsetDateTime) -> u32 {
        match self.last_call_at {
            Some(last) if last.date() == now.date() => self.today_calls,
            _ => 0,
        }
    }
}

/**
 * \brief 连接校验器：持有连接状态并负责全部状态迁移。
 */
#[derive(Debug, Default)]
pub struct ConnectionVerifier {
    status: Mutex<ConnectionStatus>,
    in_flight: AtomicBool,
}

impl ConnectionVerifier {
    pub fn new(initial: ConnectionStatus) -> Self {
        Self {
            status: Mutex::new(initial.restored()),
            in_flight: AtomicBool::new(false),
        }
    }

    /**
     * \brief 当前状态的只读快照，`todayCalls` 按当天日期折算。
     */
    pub fn status(&self) -> ConnectionStatus {
        let mut status = self.lock().clone();
        status.today_calls = status.calls_on(OffsetDateTime::now_utc());
        status
    }

    /**
     * \brief 统计一次真实请求（探测或生成）。
     */
    pub fn record_call(&self) {
        self.lock().record_call(OffsetDateTime::now_utc());
    }

    /**
     * \brief 配置变更后重置为 `unknown`；探测进行中时不做任何修改。
     */
    pub fn invalidate(&self) {
        if self.in_flight.load(Ordering::Acquire) {
            return;
        }
        let mut status = self.lock();
        status.state = ConnectionState::Unknown;
        status.last_error = None;
        status.last_latency_ms = None;
    }

    /**
     * \brief 发起一次最小化的真实往返并更新状态。
     * \details 已有探测进行中时立即返回 false，不发出新请求。配置缺失时直接置为
     * `disconnected`，不访问网络。只有传输成功且响应中有非空文本才置为 `connected`。
     */
    pub async fn test_connection(
        &self,
        registry: &ProviderRegistry,
        transport: &HttpTransport,
        config: &GenerationConfig,
        secret: Option<&str>,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(_guard) = self.begin() else {
            info!("connection test already in flight");
            return false;
        };

        let request = match pipeline::build_request(
            registry,
            config,
            secret,
            &[Message::user(PROBE_PROMPT)],
            PROBE_MAX_TOKENS,
        ) {
            Ok(request) => request,
            Err(err) => {
                self.finish(None, Err(err.into()));
                return false;
            }
        };
        warn_on_prefix_mismatch(registry, config, secret);

        let started = Instant::now();
        let outcome = pipeline::execute(transport, &request, cancel).await;
        let latency = started.elapsed().as_millis() as u64;
        self.record_call();
        let connected = outcome.is_ok();
        match &outcome {
            Ok(_) => info!(
                provider = %config.provider_id,
                model = %config.model,
                latency_ms = latency,
                "connection verified"
            ),
            Err(err) => warn!(
                provider = %config.provider_id,
                class = %err.class,
                latency_ms = latency,
                "connection test failed"
            ),
        }
        self.finish(Some(latency), outcome.map(|_| ()));
        connected
    }

    /**
     * \brief 在发起探测之前就已确定失败（如解密失败）时记录错误。探测进行中时返回 false 且不改状态。
     */
    pub fn reject(&self, error: ClassifiedError) -> bool {
        let Some(_guard) = self.begin() else {
            return false;
        };
        self.finish(None, Err(error));
        false
    }

    fn begin(&self) -> Option<InFlight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.lock().state = ConnectionState::Testing;
        Some(InFlight { verifier: self })
    }

    fn finish(&self, latency_ms: Option<u64>, outcome: Result<(), ClassifiedError>) {
        let mut status = self.lock();
        status.last_checked_at = Some(OffsetDateTime::now_utc());
        status.last_latency_ms = latency_ms;
        match outcome {
            Ok(()) => {
                status.state = ConnectionState::Connected;
                status.last_error = None;
            }
            Err(err) => {
                status.state = ConnectionState::Disconnected;
                status.last_error = Some(err);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/* 探测被中途丢弃（调用方取消 future）时，状态不能停留在 testing。 */
struct InFlight<'a> {
    verifier: &'a ConnectionVerifier,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        {
            let mut status = self.verifier.lock();
            if status.state == ConnectionState::Testing {
                status.state = ConnectionState::Disconnected;
                status.last_checked_at = Some(OffsetDateTime::now_utc());
                status.last_error = Some(ClassifiedError::new(
                    ErrorClass::Timeout,
                    "connection test aborted",
                    "请求超时，请检查网络或稍后重试",
                ));
            }
        }
        self.verifier.in_flight.store(false, Ordering::Release);
    }
}

fn warn_on_prefix_mismatch(
    registry: &ProviderRegistry,
    config: &GenerationConfig,
    secret: Option<&str>,
) {
    let (Some(profile), Some(secret)) = (registry.get(&config.provider_id), secret) else {
        return;
    };
    if let Some(prefix) = profile.key_prefix.as_deref() {
        if !secret.trim().starts_with(prefix) {
            warn!(
                provider = %profile.id,
                expected_prefix = prefix,
                "credential does not look like a key for this provider"
            );
        }
    }
}
