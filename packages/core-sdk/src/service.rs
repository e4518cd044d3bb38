use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{cache_key, CacheEntry, ResponseCache};
use crate::config::Settings;
use crate::db::{
    self, KvStore, SqliteStore, KEY_CONNECTION_STATUS, KEY_GENERATION_CONFIG, KEY_RESPONSE_CACHE,
    KEY_TELEMETRY_ENABLED,
};
use crate::error::{ClassifiedError, ConfigError, ErrorClass, VaultError};
use crate::extract::extract;
use crate::fallback::{seed_for, synthesize};
use crate::llm::HttpTransport;
use crate::models::{
    ConfigPatch, ContentType, GenerationConfig, GenerationContext, GenerationResult, Payload,
};
use crate::pipeline;
use crate::prompts;
use crate::registry::{
    clamp_temperature, clamp_to, ProviderProfile, ProviderRegistry, PENALTY_RANGE, TOP_P_RANGE,
};
use crate::telemetry::Telemetry;
use crate::vault::{self, EncryptedSecret};
use crate::verifier::{ConnectionState, ConnectionStatus, ConnectionVerifier};

/**
 * \brief AI 服务门面：持有配置、连接状态与缓存，可独立构造多个实例。
 * \details `generate` 可并发调用；`test_connection` 自带防重入保护。
 */
pub struct AiService {
    registry: ProviderRegistry,
    settings: Settings,
    store: Arc<dyn KvStore>,
    transport: HttpTransport,
    config: Mutex<GenerationConfig>,
    /** \brief 会话内记住的口令，从不持久化。 */
    passphrase: Mutex<Option<String>>,
    verifier: ConnectionVerifier,
    cache: Mutex<ResponseCache>,
    telemetry: Telemetry,
    shutdown: CancellationToken,
}

impl AiService {
    /**
     * \brief 按设置打开 SQLite 存储并恢复上次的配置、缓存与连接状态。
     */
    pub fn open(settings: Settings) -> Result<Self> {
        let store = SqliteStore::open(&settings.db_path)?;
        Ok(Self::with_store(
            settings,
            ProviderRegistry::builtin(),
            Arc::new(store),
        ))
    }

    pub fn with_store(
        settings: Settings,
        registry: ProviderRegistry,
        store: Arc<dyn KvStore>,
    ) -> Self {
        let config: GenerationConfig =
            load_json(store.as_ref(), KEY_GENERATION_CONFIG).unwrap_or_default();
        let entries: Vec<CacheEntry> =
            load_json(store.as_ref(), KEY_RESPONSE_CACHE).unwrap_or_default();
        let status: ConnectionStatus =
            load_json(store.as_ref(), KEY_CONNECTION_STATUS).unwrap_or_default();
        let telemetry_enabled = db::get_bool(store.as_ref(), KEY_TELEMETRY_ENABLED, false)
            .unwrap_or_else(|err| {
                warn!(error = %err, "failed to read telemetry switch");
                false
            });
        debug!(
            provider = %config.provider_id,
            cached = entries.len(),
            "service state restored"
        );
        Self {
            cache: Mutex::new(ResponseCache::restore(
                settings.cache_capacity,
                settings.cache_ttl,
                entries,
            )),
            telemetry: Telemetry::new(settings.log_dir.clone(), telemetry_enabled),
            verifier: ConnectionVerifier::new(status),
            config: Mutex::new(config),
            passphrase: Mutex::new(None),
            transport: HttpTransport::default(),
            shutdown: CancellationToken::new(),
            registry,
            settings,
            store,
        }
    }

    /**
     * \brief 生成一段游戏内容，任何情况下都返回结果。
     * \details 顺序：缓存 → 密钥/配置 →（可选）连接校验 → 实时调用 → 失败时本地替代。
     * 只有配置类与解密类错误返回 `succeeded = false`，其余错误使用本地替代内容。
     */
    pub async fn generate(
        &self,
        content_type: ContentType,
        context: &GenerationContext,
    ) -> GenerationResult {
        let prompt = prompts::render(content_type, context);
        let config = self.current_config();
        let key = cache_key(&config.model, &config.system_prompt, &prompt.text);
        if let Some(payload) = self.cached(&key) {
            debug!(content_type = %content_type, "served from cache");
            return GenerationResult::cached(content_type, payload);
        }

        let secret = match self.resolve_secret(&config).await {
            Ok(secret) => secret,
            Err(err) => return self.settle(content_type, context, &prompt.text, &err),
        };
        let messages = pipeline::compose_messages(&config, &prompt.text);
        let request = match pipeline::build_request(
            &self.registry,
            &config,
            secret.as_deref(),
            &messages,
            config.max_tokens,
        ) {
            Ok(request) => request,
            Err(err) => {
                info!(content_type = %content_type, error = %err, "generation not attempted");
                let err = ClassifiedError::from(err);
                return self.settle(content_type, context, &prompt.text, &err);
            }
        };

        if self.settings.lazy_verify && self.verifier.status().state == ConnectionState::Unknown {
            let connected = self.run_verifier(&config, secret.as_deref()).await;
            if !connected {
                let err = self.verifier.status().last_error.unwrap_or_else(|| {
                    ClassifiedError::new(
                        ErrorClass::Network,
                        "connection not verified",
                        "请先完成连接测试",
                    )
                });
                return self.settle(content_type, context, &prompt.text, &err);
            }
        }

        let cancel = self.shutdown.child_token();
        let started = Instant::now();
        let outcome = pipeline::execute(&self.transport, &request, &cancel).await;
        let latency = started.elapsed().as_millis() as u64;
        self.verifier.record_call();
        self.persist_status().await;
        match outcome {
            Ok(text) => {
                let payload = extract(content_type, &text);
                self.remember(key, content_type, payload.clone()).await;
                self.telemetry.log_event(
                    "generate",
                    &format!(
                        "provider={} model={} type={} latency_ms={}",
                        config.provider_id, config.model, content_type, latency
                    ),
                );
                GenerationResult::live(content_type, payload)
            }
            Err(err) => {
                warn!(
                    provider = %config.provider_id,
                    content_type = %content_type,
                    class = %err.class,
                    "live generation failed, using fallback"
                );
                self.telemetry.log_error(
                    "generate",
                    &format!(
                        "provider={} model={} type={} class={}",
                        config.provider_id, config.model, content_type, err.class
                    ),
                );
                self.settle(content_type, context, &prompt.text, &err)
            }
        }
    }

    /**
     * \brief 用当前配置做一次连接校验，结果写入连接状态并持久化。
     */
    pub async fn test_connection(&self) -> bool {
        let config = self.current_config();
        match self.resolve_secret(&config).await {
            Ok(secret) => self.run_verifier(&config, secret.as_deref()).await,
            Err(err) => {
                let connected = self.verifier.reject(err);
                self.persist_status().await;
                connected
            }
        }
    }

    /**
     * \brief 连接状态快照。
     */
    pub fn status(&self) -> ConnectionStatus {
        self.verifier.status()
    }

    /**
     * \brief 当前配置（不含明文密钥）。
     */
    pub fn config(&self) -> GenerationConfig {
        GenerationConfig {
            plain_secret: None,
            ..self.current_config()
        }
    }

    pub fn providers(&self) -> Vec<ProviderProfile> {
        self.registry.profiles().cloned().collect()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /**
     * \brief 合并部分配置。温度按服务商区间截断；服务商、模型或地址变化时连接状态回到 `unknown`。
     */
    pub fn set_config(&self, patch: ConfigPatch) -> Result<GenerationConfig> {
        let (snapshot, invalidated) = {
            let mut config = lock(&self.config);
            let mut next = config.clone();

            if let Some(provider_id) = patch.provider_id.as_deref().map(str::trim) {
                self.registry.require(provider_id)?;
                next.provider_id = provider_id.to_string();
            }
            if let Some(models) = patch.custom_models {
                let mut cleaned: Vec<String> = Vec::new();
                for model in models.iter().map(|m| m.trim()).filter(|m| !m.is_empty()) {
                    if !cleaned.iter().any(|m| m == model) {
                        cleaned.push(model.to_string());
                    }
                }
                next.custom_models = cleaned;
            }
            let profile = self.registry.require(&next.provider_id)?;
            match patch.model.as_deref().map(str::trim) {
                Some(model) => next.model = model.to_string(),
                None if next.provider_id != config.provider_id
                    && !profile.supports_model(&next.model, &next.custom_models) =>
                {
                    next.model = profile.default_model.clone();
                }
                None => {}
            }
            if let Some(temperature) = patch.temperature {
                next.temperature = temperature;
            }
            next.temperature = clamp_temperature(profile, next.temperature);
            if let Some(max_tokens) = patch.max_tokens {
                next.max_tokens = max_tokens.max(1);
            }
            if let Some(top_p) = patch.top_p {
                next.top_p = clamp_to(TOP_P_RANGE, top_p, next.top_p);
            }
            if let Some(penalty) = patch.frequency_penalty {
                next.frequency_penalty = clamp_to(PENALTY_RANGE, penalty, next.frequency_penalty);
            }
            if let Some(penalty) = patch.presence_penalty {
                next.presence_penalty = clamp_to(PENALTY_RANGE, penalty, next.presence_penalty);
            }
            if let Some(organization_id) = patch.organization_id {
                let organization_id = organization_id.trim();
                next.organization_id =
                    (!organization_id.is_empty()).then(|| organization_id.to_string());
            }
            if let Some(system_prompt) = patch.system_prompt {
                next.system_prompt = system_prompt;
            }
            if let Some(endpoint) = patch.endpoint_override {
                let endpoint = endpoint.trim();
                next.endpoint_override = (!endpoint.is_empty()).then(|| endpoint.to_string());
            }

            let invalidated = next.provider_id != config.provider_id
                || next.model != config.model
                || next.endpoint_override != config.endpoint_override;
            *config = next.clone();
            (next, invalidated)
        };

        if invalidated {
            self.verifier.invalidate();
            self.persist_status_now();
        }
        save_json(self.store.as_ref(), KEY_GENERATION_CONFIG, &snapshot)?;
        info!(provider = %snapshot.provider_id, model = %snapshot.model, "configuration updated");
        Ok(GenerationConfig {
            plain_secret: None,
            ..snapshot
        })
    }

    /**
     * \brief 以口令加密并保存密钥；明文仅在本实例内存中保留。
     */
    pub async fn save_credential(&self, password: &str, secret: &str) -> Result<()> {
        let secret = secret.trim().to_string();
        if secret.is_empty() {
            return Err(ConfigError::MissingSecret.into());
        }
        if password.is_empty() {
            bail!("passphrase must not be empty");
        }
        let password = password.to_string();
        let plaintext = secret.clone();
        let encrypted = tokio::task::spawn_blocking(move || vault::encrypt(&password, &plaintext))
            .await
            .context("encryption task failed")??;

        let snapshot = {
            let mut config = lock(&self.config);
            config.encrypted_secret = Some(encrypted);
            config.plain_secret = Some(secret);
            config.clone()
        };
        self.verifier.invalidate();
        self.persist_status().await;
        save_blocking(self.store.clone(), KEY_GENERATION_CONFIG, &snapshot).await?;
        info!(provider = %snapshot.provider_id, "credential saved");
        Ok(())
    }

    /**
     * \brief 用口令解密已保存的密钥；成功后明文留在内存中供后续调用使用。
     */
    pub async fn load_credential(&self, password: &str) -> Result<String, VaultError> {
        let Some(encrypted) = lock(&self.config).encrypted_secret.clone() else {
            return Err(VaultError::Decryption("no stored credential"));
        };
        let plaintext = decrypt_blocking(password.to_string(), encrypted.clone()).await?;
        self.keep_plaintext(&encrypted, &plaintext);
        Ok(plaintext)
    }

    /**
     * \brief 仅在本次会话中使用的明文密钥，不加密也不持久化。
     */
    pub fn set_session_secret(&self, secret: &str) {
        lock(&self.config).plain_secret = Some(secret.trim().to_string());
        self.verifier.invalidate();
        self.persist_status_now();
    }

    /**
     * \brief 记住口令，之后的调用会按需解密已保存的密钥。
     */
    pub fn remember_passphrase(&self, passphrase: &str) {
        *lock(&self.passphrase) = Some(passphrase.to_string());
    }

    /**
     * \brief 忘记口令；若密钥有加密副本，同时丢弃内存中的明文。
     */
    pub fn forget_passphrase(&self) {
        *lock(&self.passphrase) = None;
        let mut config = lock(&self.config);
        if config.encrypted_secret.is_some() {
            config.plain_secret = None;
        }
    }

    /**
     * \brief 是否保存了密钥；`unlocked` 表示明文已在内存中。
     */
    pub fn credential_state(&self) -> (bool, bool) {
        let config = lock(&self.config);
        let unlocked = config.plain_secret.as_deref().is_some_and(|s| !s.is_empty());
        (config.has_credential(), unlocked)
    }

    pub fn telemetry_enabled(&self) -> bool {
        self.telemetry.is_enabled()
    }

    pub fn set_telemetry_enabled(&self, enabled: bool) -> Result<()> {
        db::set_bool(self.store.as_ref(), KEY_TELEMETRY_ENABLED, enabled)?;
        self.telemetry.set_enabled(enabled);
        Ok(())
    }

    /**
     * \brief 清空响应缓存（内存与持久化副本），返回被清除的条目数。
     */
    pub fn clear_cache(&self) -> Result<usize> {
        let removed = {
            let mut cache = lock(&self.cache);
            let removed = cache.len();
            cache.clear();
            removed
        };
        self.store.remove(KEY_RESPONSE_CACHE)?;
        info!(removed, "response cache cleared");
        Ok(removed)
    }

    /**
     * \brief 取消所有进行中的服务商调用，用于进程退出。
     */
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn current_config(&self) -> GenerationConfig {
        lock(&self.config).clone()
    }

    /* Ok(None) 表示没有可用密钥；解密失败必须上抛。 */
    async fn resolve_secret(
        &self,
        config: &GenerationConfig,
    ) -> Result<Option<String>, ClassifiedError> {
        if let Some(secret) = config.plain_secret.as_deref().filter(|s| !s.trim().is_empty()) {
            return Ok(Some(secret.to_string()));
        }
        let passphrase = lock(&self.passphrase).clone();
        let (Some(encrypted), Some(passphrase)) = (config.encrypted_secret.clone(), passphrase)
        else {
            return Ok(None);
        };
        let plaintext = decrypt_blocking(passphrase, encrypted.clone()).await?;
        self.keep_plaintext(&encrypted, &plaintext);
        Ok(Some(plaintext))
    }

    fn keep_plaintext(&self, encrypted: &EncryptedSecret, plaintext: &str) {
        let mut config = lock(&self.config);
        if config.encrypted_secret.as_ref() == Some(encrypted) {
            config.plain_secret = Some(plaintext.to_string());
        }
    }

    async fn run_verifier(&self, config: &GenerationConfig, secret: Option<&str>) -> bool {
        let cancel = self.shutdown.child_token();
        let connected = self
            .verifier
            .test_connection(&self.registry, &self.transport, config, secret, &cancel)
            .await;
        let status = self.persist_status().await;
        let detail = match (&status.last_error, status.last_latency_ms) {
            (Some(err), _) => format!("provider={} class={}", config.provider_id, err.class),
            (None, latency) => format!(
                "provider={} latency_ms={}",
                config.provider_id,
                latency.unwrap_or_default()
            ),
        };
        if connected {
            self.telemetry.log_event("verify", &detail);
        } else {
            self.telemetry.log_error("verify", &detail);
        }
        connected
    }

    fn cached(&self, key: &str) -> Option<Payload> {
        lock(&self.cache)
            .get(key, OffsetDateTime::now_utc())
            .map(|entry| entry.value.clone())
    }

    async fn remember(&self, key: String, content_type: ContentType, payload: Payload) {
        let snapshot = {
            let mut cache = lock(&self.cache);
            cache.insert(key, content_type, payload, OffsetDateTime::now_utc());
            cache.snapshot()
        };
        if let Err(err) = save_blocking(self.store.clone(), KEY_RESPONSE_CACHE, &snapshot).await {
            warn!(error = %err, "failed to persist response cache");
        }
    }

    /* 配置与解密错误直接上抛；其余错误改用本地替代内容。 */
    fn settle(
        &self,
        content_type: ContentType,
        context: &GenerationContext,
        prompt: &str,
        err: &ClassifiedError,
    ) -> GenerationResult {
        if err.class.is_surfaced() {
            return GenerationResult::failed(content_type, err.message.clone());
        }
        let payload = synthesize(content_type, context, seed_for(prompt));
        GenerationResult::fallback(content_type, payload, &err.to_string())
    }

    async fn persist_status(&self) -> ConnectionStatus {
        let status = self.verifier.status();
        if let Err(err) = save_blocking(self.store.clone(), KEY_CONNECTION_STATUS, &status).await {
            warn!(error = %err, "failed to persist connection status");
        }
        status
    }

    fn persist_status_now(&self) {
        let status = self.verifier.status();
        if let Err(err) = save_json(self.store.as_ref(), KEY_CONNECTION_STATUS, &status) {
            warn!(error = %err, "failed to persist connection status");
        }
    }
}

async fn decrypt_blocking(
    passphrase: String,
    secret: EncryptedSecret,
) -> Result<String, VaultError> {
    tokio::task::spawn_blocking(move || vault::decrypt(&passphrase, &secret))
        .await
        .unwrap_or_else(|_| Err(VaultError::Decryption("key derivation task failed")))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn load_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Option<T> {
    match store.get(key) {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "ignoring unreadable persisted value");
                None
            }
        },
        Ok(None) => None,
        Err(err) => {
            warn!(key, error = %err, "failed to read persisted value");
            None
        }
    }
}

fn save_json<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value).with_context(|| format!("failed to encode {}", key))?;
    store.set(key, &raw)
}

/* 存储可能因锁冲突而休眠重试，放到阻塞线程池执行。 */
async fn save_blocking<T: Serialize>(
    store: Arc<dyn KvStore>,
    key: &'static str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value).with_context(|| format!("failed to encode {}", key))?;
    tokio::task::spawn_blocking(move || store.set(key, &raw))
        .await
        .context("store task failed")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::ResultSource;
    use serde_json::json;

    fn mock_registry(url: &str) -> ProviderRegistry {
        ProviderRegistry::new([
            ProviderProfile::openai_compatible(
                "mock",
                "Mock",
                &format!("{}/v1/chat/completions", url),
                &["m1", "m2"],
            )
            .with_organization_header("OpenAI-Organization")
            .with_timeout_ms(3_000),
            ProviderProfile::openai_compatible("alt", "Alt", "http://127.0.0.1:9/v1", &["a1"])
                .with_temperature_range(0.0, 1.0),
        ])
    }

    fn service(url: &str, store: Arc<dyn KvStore>, settings: Settings) -> AiService {
        let service = AiService::with_store(settings, mock_registry(url), store);
        service
            .set_config(ConfigPatch {
                provider_id: Some("mock".into()),
                model: Some("m1".into()),
                ..ConfigPatch::default()
            })
            .expect("configure");
        service
    }

    fn live_service(url: &str) -> AiService {
        let service = service(url, Arc::new(MemoryStore::default()), Settings::default());
        service.set_session_secret("sk-test");
        service
    }

    fn refused_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        format!("http://{}", addr)
    }

    fn ctx(value: serde_json::Value) -> GenerationContext {
        value.as_object().cloned().expect("object")
    }

    fn chat_body(text: &str) -> String {
        json!({"choices": [{"message": {"role": "assistant", "content": text}}]}).to_string()
    }

    #[tokio::test]
    async fn test_server_error_reports_disconnected_and_persists() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(500)
            .with_body("internal error")
            .expect(1)
            .create_async()
            .await;
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::default());
        let service = service(&server.url(), store.clone(), Settings::default());
        service.set_session_secret("sk-test");

        assert!(!service.test_connection().await);
        let status = service.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(
            status.last_error.as_ref().map(|e| e.class),
            Some(ErrorClass::Server)
        );
        let persisted = store
            .get(KEY_CONNECTION_STATUS)
            .expect("read")
            .expect("status persisted");
        assert!(persisted.contains("ServerError"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_mail_twice_is_served_from_cache() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(chat_body("发信人：母亲\n见字如面，家中一切安好。\n时间：乾隆三年五月"))
            .expect(1)
            .create_async()
            .await;
        let service = live_service(&server.url());
        let context = ctx(json!({"characterName": "X"}));

        let first = service.generate(ContentType::Mail, &context).await;
        let second = service.generate(ContentType::Mail, &context).await;

        assert!(first.succeeded && second.succeeded);
        assert_eq!(first.source, ResultSource::Live);
        assert_eq!(second.source, ResultSource::Cache);
        assert_eq!(
            serde_json::to_vec(&first.payload).expect("encode"),
            serde_json::to_vec(&second.payload).expect("encode")
        );
        match first.payload {
            Some(Payload::Mail(mail)) => assert_eq!(mail.from, "母亲"),
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(service.status().today_calls, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_sampling_and_organization_reach_the_provider() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("openai-organization", "org-lifescroll")
            .match_body(mockito::Matcher::PartialJson(json!({
                "top_p": 0.9,
                "frequency_penalty": 2.0,
                "presence_penalty": -2.0
            })))
            .with_status(200)
            .with_body(chat_body("岁月静好"))
            .expect(1)
            .create_async()
            .await;
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::default());
        let service = service(&server.url(), store.clone(), Settings::default());
        service.set_session_secret("sk-test");
        let updated = service
            .set_config(ConfigPatch {
                top_p: Some(0.9),
                frequency_penalty: Some(7.0),
                presence_penalty: Some(-7.0),
                organization_id: Some(" org-lifescroll ".into()),
                ..ConfigPatch::default()
            })
            .expect("patch");
        assert_eq!(updated.frequency_penalty, 2.0);
        assert_eq!(updated.presence_penalty, -2.0);
        assert_eq!(updated.organization_id.as_deref(), Some("org-lifescroll"));

        let result = service.generate(ContentType::Note, &GenerationContext::new()).await;
        assert_eq!(result.source, ResultSource::Live);
        mock.assert_async().await;

        let persisted = store
            .get(KEY_CONNECTION_STATUS)
            .expect("read")
            .expect("status persisted");
        assert!(persisted.contains("\"todayCalls\":1"));
        assert!(persisted.contains("\"lastCall\""));

        let cleared = service
            .set_config(ConfigPatch {
                organization_id: Some(String::new()),
                ..ConfigPatch::default()
            })
            .expect("clear organization");
        assert_eq!(cleared.organization_id, None);
    }

    #[tokio::test]
    async fn test_clear_cache_drops_memory_and_store() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(chat_body("花开富贵"))
            .expect(2)
            .create_async()
            .await;
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::default());
        let service = service(&server.url(), store.clone(), Settings::default());
        service.set_session_secret("sk-test");

        let first = service.generate(ContentType::Note, &GenerationContext::new()).await;
        assert_eq!(first.source, ResultSource::Live);
        assert!(store.get(KEY_RESPONSE_CACHE).expect("read").is_some());

        assert_eq!(service.clear_cache().expect("clear"), 1);
        assert_eq!(store.get(KEY_RESPONSE_CACHE).expect("read"), None);

        let again = service.generate(ContentType::Note, &GenerationContext::new()).await;
        assert_eq!(again.source, ResultSource::Live);
        assert_eq!(service.status().today_calls, 2);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_network_failure_falls_back_for_every_type() {
        let service = live_service(&refused_url());
        for content_type in ContentType::ALL {
            let result = service.generate(content_type, &GenerationContext::new()).await;
            assert!(result.succeeded, "{} should fall back", content_type);
            assert_eq!(result.source, ResultSource::Fallback);
            assert!(result.payload.is_some());
            assert!(result.diagnostic_message.ends_with("fallback content used"));
            assert!(result.diagnostic_message.starts_with("NetworkError"));
        }
        assert!(lock(&service.cache).is_empty());
    }

    #[tokio::test]
    async fn test_fallback_is_deterministic() {
        let service = live_service(&refused_url());
        let context = ctx(json!({"speaker": "姐姐", "addressee": "妹妹"}));
        let a = service.generate(ContentType::Dialogue, &context).await;
        let b = service.generate(ContentType::Dialogue, &context).await;
        assert_eq!(a.payload, b.payload);
    }

    #[tokio::test]
    async fn test_missing_credential_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .expect(0)
            .create_async()
            .await;
        let service = service(&server.url(), Arc::new(MemoryStore::default()), Settings::default());
        for content_type in ContentType::ALL {
            let result = service.generate(content_type, &GenerationContext::new()).await;
            assert!(!result.succeeded);
            assert_eq!(result.source, ResultSource::None);
            assert!(result.payload.is_none());
            assert_eq!(result.diagnostic_message, "missing credential");
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unknown_model_is_surfaced_as_config_error() {
        let service = live_service(&refused_url());
        service
            .set_config(ConfigPatch {
                model: Some("m9".into()),
                ..ConfigPatch::default()
            })
            .expect("patch");
        let result = service.generate(ContentType::Note, &GenerationContext::new()).await;
        assert!(!result.succeeded);
        assert!(result.diagnostic_message.contains("m9"));
    }

    #[tokio::test]
    async fn test_saved_credential_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-saved")
            .with_status(200)
            .with_body(chat_body("春和景明"))
            .expect(1)
            .create_async()
            .await;
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::default());
        {
            let first = service(&server.url(), store.clone(), Settings::default());
            first.save_credential("hunter2", "sk-saved").await.expect("save");
            assert_eq!(first.credential_state(), (true, true));
        }
        let raw = store
            .get(KEY_GENERATION_CONFIG)
            .expect("read")
            .expect("config persisted");
        assert!(!raw.contains("sk-saved"));

        let second =
            AiService::with_store(Settings::default(), mock_registry(&server.url()), store);
        assert_eq!(second.credential_state(), (true, false));
        let locked = second.generate(ContentType::Note, &GenerationContext::new()).await;
        assert_eq!(locked.diagnostic_message, "missing credential");

        assert!(matches!(
            second.load_credential("wrong").await,
            Err(VaultError::Decryption(_))
        ));
        second.remember_passphrase("hunter2");
        let result = second.generate(ContentType::Note, &GenerationContext::new()).await;
        assert_eq!(result.source, ResultSource::Live);
        assert_eq!(second.credential_state(), (true, true));
        assert_eq!(second.load_credential("hunter2").await.expect("load"), "sk-saved");

        second.forget_passphrase();
        assert_eq!(second.credential_state(), (true, false));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_wrong_passphrase_is_a_decryption_error() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::default());
        let url = refused_url();
        {
            let first = service(&url, store.clone(), Settings::default());
            first.save_credential("right", "sk-1").await.expect("save");
        }
        let second = AiService::with_store(Settings::default(), mock_registry(&url), store);
        second.remember_passphrase("wrong");

        let result = second.generate(ContentType::Mail, &GenerationContext::new()).await;
        assert!(!result.succeeded);
        assert!(result.diagnostic_message.starts_with("decryption failed"));

        assert!(!second.test_connection().await);
        assert_eq!(
            second.status().last_error.map(|e| e.class),
            Some(ErrorClass::Decryption)
        );
    }

    #[tokio::test]
    async fn test_lazy_verify_checks_once_then_falls_back() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(429)
            .with_body("rate limit exceeded")
            .expect(1)
            .create_async()
            .await;
        let settings = Settings {
            lazy_verify: true,
            ..Settings::default()
        };
        let service = service(&server.url(), Arc::new(MemoryStore::default()), settings);
        service.set_session_secret("sk-test");

        let result = service.generate(ContentType::Event, &GenerationContext::new()).await;
        assert_eq!(result.source, ResultSource::Fallback);
        assert!(result.diagnostic_message.starts_with("RateLimitError"));
        assert_eq!(service.status().state, ConnectionState::Disconnected);
        mock.assert_async().await;
    }

    #[test]
    fn test_set_config_clamps_and_invalidates() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::default());
        let service = service("http://127.0.0.1:9", store.clone(), Settings::default());

        let updated = service
            .set_config(ConfigPatch {
                temperature: Some(5.0),
                custom_models: Some(vec![" x ".into(), "x".into(), "".into()]),
                ..ConfigPatch::default()
            })
            .expect("patch");
        assert_eq!(updated.temperature, 2.0);
        assert_eq!(updated.custom_models, vec!["x".to_string()]);

        service.verifier.reject(ClassifiedError::new(ErrorClass::Server, "boom", "retry"));
        let switched = service
            .set_config(ConfigPatch {
                provider_id: Some("alt".into()),
                ..ConfigPatch::default()
            })
            .expect("switch");
        assert_eq!(switched.model, "a1");
        assert_eq!(switched.temperature, 1.0);
        assert_eq!(service.status().state, ConnectionState::Unknown);

        assert!(service
            .set_config(ConfigPatch {
                provider_id: Some("nope".into()),
                ..ConfigPatch::default()
            })
            .is_err());

        let reopened =
            AiService::with_store(Settings::default(), mock_registry("http://127.0.0.1:9"), store);
        assert_eq!(reopened.config().provider_id, "alt");
        assert_eq!(reopened.config().custom_models, vec!["x".to_string()]);
    }

    #[test]
    fn test_telemetry_switch_is_persisted() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings {
            log_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let service =
            AiService::with_store(settings.clone(), ProviderRegistry::builtin(), store.clone());
        assert!(!service.telemetry_enabled());
        service.set_telemetry_enabled(true).expect("enable");
        let reopened = AiService::with_store(settings, ProviderRegistry::builtin(), store);
        assert!(reopened.telemetry_enabled());
    }
}
