use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::classify::{classify, TransportFailure};
use crate::error::{ClassifiedError, ConfigError};
use crate::llm::{build_body, extract_text, HttpTransport, ProviderRequest, Sampling};
use crate::models::{GenerationConfig, Message};
use crate::registry::{
    clamp_temperature, clamp_to, resolve_endpoint, ProviderProfile, ProviderRegistry,
    PENALTY_RANGE, TOP_P_RANGE,
};

/**
 * \brief 校验配置并定位服务商：密钥、服务商、模型、自定义地址缺一不可。
 */
pub fn validate<'a>(
    registry: &'a ProviderRegistry,
    config: &GenerationConfig,
    secret: Option<&str>,
) -> Result<(&'a ProviderProfile, String), ConfigError> {
    if secret.map(str::trim).filter(|s| !s.is_empty()).is_none() {
        return Err(ConfigError::MissingSecret);
    }
    let profile = registry.require(&config.provider_id)?;
    if !profile.supports_model(&config.model, &config.custom_models) {
        return Err(ConfigError::UnknownModel {
            provider: profile.id.clone(),
            model: config.model.clone(),
        });
    }
    let endpoint = resolve_endpoint(profile, config)?;
    Ok((profile, endpoint))
}

/**
 * \brief 构造服务商请求。温度按服务商区间截断，`max_tokens` 由调用方决定（探测请求取最小值）。
 * 组织 ID 只在服务商声明了组织请求头时发送。
 */
pub fn build_request(
    registry: &ProviderRegistry,
    config: &GenerationConfig,
    secret: Option<&str>,
    messages: &[Message],
    max_tokens: u32,
) -> Result<ProviderRequest, ConfigError> {
    let (profile, url) = validate(registry, config, secret)?;
    let secret = secret.map(str::trim).unwrap_or_default();
    let sampling = sampling_for(profile, config, max_tokens);
    let organization = profile.organization_header.as_ref().and_then(|header| {
        config
            .organization_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| (header.clone(), id.to_string()))
    });
    Ok(ProviderRequest {
        url,
        shape: profile.shape,
        auth: (
            profile.auth_header.clone(),
            format!("{}{}", profile.auth_scheme, secret),
        ),
        organization,
        body: build_body(profile.shape, &config.model, messages, &sampling),
        timeout: Duration::from_millis(profile.timeout_ms),
    })
}

fn sampling_for(profile: &ProviderProfile, config: &GenerationConfig, max_tokens: u32) -> Sampling {
    Sampling {
        temperature: clamp_temperature(profile, config.temperature),
        max_tokens: max_tokens.max(1),
        top_p: clamp_to(TOP_P_RANGE, config.top_p, 1.0),
        frequency_penalty: clamp_to(PENALTY_RANGE, config.frequency_penalty, 0.0),
        presence_penalty: clamp_to(PENALTY_RANGE, config.presence_penalty, 0.0),
    }
}

/**
 * \brief 组装一次生成所需的消息：系统提示 + 用户提示。系统提示为空时省略。
 */
pub fn compose_messages(config: &GenerationConfig, prompt: &str) -> Vec<Message> {
    let mut messages = Vec::with_capacity(2);
    if !config.system_prompt.trim().is_empty() {
        messages.push(Message::system(config.system_prompt.clone()));
    }
    messages.push(Message::user(prompt));
    messages
}

/**
 * \brief 发送请求并取出生成文本。
 * \details 传输成功且响应中有非空文本才算成功；否则按分类表归类。
 */
pub async fn execute(
    transport: &HttpTransport,
    request: &ProviderRequest,
    cancel: &CancellationToken,
) -> Result<String, ClassifiedError> {
    let value = transport
        .post(request, cancel)
        .await
        .map_err(|failure| classify(&failure))?;
    extract_text(request.shape, &value).ok_or_else(|| {
        debug!(url = %request.url, "provider response carried no generated text");
        classify(&TransportFailure::malformed(
            "response did not contain generated text",
        ))
    })
}
