use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::ConfigError;
use crate::models::GenerationConfig;

/** \brief 端点模板中的占位符，由用户配置的基础地址填充。 */
pub const BASE_URL_PLACEHOLDER: &str = "{base_url}";
pub const CUSTOM_PROVIDER_ID: &str = "custom";

/** \brief top_p 的取值区间。 */
pub const TOP_P_RANGE: (f32, f32) = (0.0, 1.0);
/** \brief frequency/presence 惩罚系数的取值区间。 */
pub const PENALTY_RANGE: (f32, f32) = (-2.0, 2.0);

/**
 * \brief 请求体形态。每种形态都有独立的序列化逻辑（见 `llm`）。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestShape {
    /** \brief OpenAI 兼容：messages 中包含 system + user。 */
    StandardChat,
    /** \brief 仅 user 消息，系统提示并入用户消息。 */
    MinimalChat,
    /** \brief Anthropic Messages：system 为顶层字段。 */
    AnthropicMessages,
}

/**
 * \brief 服务商描述，进程启动时定义，之后不再修改。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderProfile {
    pub id: String,
    /** \brief 显示名称 */
    pub name: String,
    /** \brief 端点模板，可包含 `{base_url}` 占位符。 */
    pub endpoint_template: String,
    pub models: Vec<String>,
    pub default_model: String,
    pub auth_header: String,
    /** \brief 认证前缀，如 `Bearer `；为空表示直接写入密钥。 */
    pub auth_scheme: String,
    pub timeout_ms: u64,
    /** \brief 允许的温度区间 `[lo, hi]`。 */
    pub temperature_range: (f32, f32),
    pub shape: RequestShape,
    /** \brief 密钥常见前缀，仅用于提示。 */
    pub key_prefix: Option<String>,
    /** \brief 组织 ID 请求头（如 `OpenAI-Organization`），None 表示不支持。 */
    pub organization_header: Option<String>,
}

impl ProviderProfile {
    /**
     * \brief 以 OpenAI 兼容格式创建描述，供内置表与测试使用。
     */
    pub fn openai_compatible(id: &str, name: &str, endpoint: &str, models: &[&str]) -> Self {
        let models: Vec<String> = models.iter().map(|m| m.to_string()).collect();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            endpoint_template: endpoint.to_string(),
            default_model: models.first().cloned().unwrap_or_default(),
            models,
            auth_header: "Authorization".to_string(),
            auth_scheme: "Bearer ".to_string(),
            timeout_ms: 30_000,
            temperature_range: (0.0, 2.0),
            shape: RequestShape::StandardChat,
            key_prefix: None,
            organization_header: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /**
     * \brief 设置温度区间；上下限写反时自动交换。
     */
    pub fn with_temperature_range(mut self, lo: f32, hi: f32) -> Self {
        self.temperature_range = if lo <= hi { (lo, hi) } else { (hi, lo) };
        self
    }

    pub fn with_shape(mut self, shape: RequestShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_organization_header(mut self, header: &str) -> Self {
        self.organization_header = Some(header.to_string());
        self
    }

    pub fn with_auth(mut self, header: &str, scheme: &str) -> Self {
        self.auth_header = header.to_string();
        self.auth_scheme = scheme.to_string();
        self
    }

    /**
     * \brief 端点是否需要用户提供基础地址。
     */
    pub fn requires_endpoint(&self) -> bool {
        self.endpoint_template.contains(BASE_URL_PLACEHOLDER)
    }

    /**
     * \brief 模型是否可用：在描述列表或调用方追加列表中。
     */
    pub fn supports_model(&self, model: &str, extra: &[String]) -> bool {
        !model.is_empty()
            && (self.models.iter().any(|m| m == model) || extra.iter().any(|m| m == model))
    }
}

/**
 * \brief 只读的服务商注册表。新增服务商只需新增条目。
 */
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    profiles: BTreeMap<String, ProviderProfile>,
}

impl ProviderRegistry {
    pub fn new(profiles: impl IntoIterator<Item = ProviderProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    /**
     * \brief 内置服务商表。
     */
    pub fn builtin() -> Self {
        Self::new([
            ProviderProfile::openai_compatible(
                "deepseek",
                "Deepseek",
                "https://api.deepseek.com/v1/chat/completions",
                &["deepseek-V3.2", "deepseek-chat"],
            )
            .with_key_prefix("sk-"),
            ProviderProfile::openai_compatible(
                "volcano",
                "火山引擎",
                "https://api.volcengine.com/v1/chat/completions",
                &["volcengine-gpt", "volcengine-4"],
            )
            .with_temperature_range(0.0, 1.0)
            .with_shape(RequestShape::MinimalChat)
            .with_key_prefix("volc-"),
            ProviderProfile::openai_compatible(
                "openai",
                "OpenAI",
                "https://api.openai.com/v1/chat/completions",
                &["gpt-3.5-turbo", "gpt-4", "gpt-4o-mini"],
            )
            .with_organization_header("OpenAI-Organization")
            .with_key_prefix("sk-"),
            ProviderProfile::openai_compatible(
                "siliconflow",
                "硅基流动",
                "https://api.siliconflow.com/v1/chat/completions",
                &["deepseek-V3.2", "llama3", "claude-3"],
            )
            .with_key_prefix("sk-"),
            ProviderProfile::openai_compatible(
                "anthropic",
                "Anthropic",
                "https://api.anthropic.com/v1/messages",
                &["claude-3-5-haiku-latest", "claude-3-5-sonnet-latest"],
            )
            .with_auth("x-api-key", "")
            .with_temperature_range(0.0, 1.0)
            .with_shape(RequestShape::AnthropicMessages)
            .with_key_prefix("sk-ant-"),
            ProviderProfile::openai_compatible(
                CUSTOM_PROVIDER_ID,
                "自定义",
                "{base_url}/chat/completions",
                &[],
            )
            .with_timeout_ms(60_000),
        ])
    }

    pub fn get(&self, id: &str) -> Option<&ProviderProfile> {
        self.profiles.get(id)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &ProviderProfile> {
        self.profiles.values()
    }

    /**
     * \brief 按 ID 取描述，未知服务商返回 `ConfigError`。
     */
    pub fn require(&self, id: &str) -> Result<&ProviderProfile, ConfigError> {
        self.get(id)
            .ok_or_else(|| ConfigError::UnknownProvider(id.to_string()))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/**
 * \brief 解析最终请求地址：需要时用用户地址填充模板，否则使用静态地址。
 */
pub fn resolve_endpoint(
    profile: &ProviderProfile,
    config: &GenerationConfig,
) -> Result<String, ConfigError> {
    if !profile.requires_endpoint() {
        return Ok(profile.endpoint_template.clone());
    }
    let base = config
        .endpoint_override
        .as_deref()
        .map(|s| s.trim().trim_end_matches('/'))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingEndpoint(profile.id.clone()))?;
    Ok(profile.endpoint_template.replace(BASE_URL_PLACEHOLDER, base))
}

/**
 * \brief 将温度限制到描述允许的区间内；越界值被静默截断，非数值取下限。
 */
pub fn clamp_temperature(profile: &ProviderProfile, requested: f32) -> f32 {
    let (lo, _) = profile.temperature_range;
    clamp_to(profile.temperature_range, requested, lo)
}

/**
 * \brief 将采样参数限制到 `range`，非数值取 `fallback`。
 */
pub fn clamp_to(range: (f32, f32), requested: f32, fallback: f32) -> f32 {
    let (lo, hi) = range;
    if requested.is_nan() {
        return fallback;
    }
    requested.max(lo).min(hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_profiles_are_complete() {
        let registry = ProviderRegistry::builtin();
        for id in ["deepseek", "volcano", "openai", "siliconflow", "anthropic", "custom"] {
            let profile = registry.get(id).expect("builtin profile");
            assert!(profile.timeout_ms > 0);
            let (lo, hi) = profile.temperature_range;
            assert!(lo <= hi);
            if id != CUSTOM_PROVIDER_ID {
                assert!(profile.models.contains(&profile.default_model));
            }
        }
        assert!(registry.require("nope").is_err());
    }

    #[test]
    fn test_clamp_temperature_bounds() {
        let registry = ProviderRegistry::builtin();
        let profile = registry.get("volcano").expect("volcano");
        assert_eq!(clamp_temperature(profile, -0.5), 0.0);
        assert_eq!(clamp_temperature(profile, 1.7), 1.0);
        assert_eq!(clamp_temperature(profile, 0.4), 0.4);
        assert_eq!(clamp_temperature(profile, f32::NAN), 0.0);
    }

    #[test]
    fn test_reversed_temperature_range_is_normalized() {
        let profile = ProviderProfile::openai_compatible("odd", "Odd", "http://localhost", &["m"])
            .with_temperature_range(1.5, 0.5);
        assert_eq!(profile.temperature_range, (0.5, 1.5));
        assert_eq!(clamp_temperature(&profile, 3.0), 1.5);
        assert_eq!(clamp_temperature(&profile, 0.0), 0.5);
    }

    #[test]
    fn test_sampling_clamps_and_organization_header() {
        assert_eq!(clamp_to(TOP_P_RANGE, 1.4, 1.0), 1.0);
        assert_eq!(clamp_to(PENALTY_RANGE, -3.0, 0.0), -2.0);
        assert_eq!(clamp_to(PENALTY_RANGE, f32::NAN, 0.0), 0.0);
        let registry = ProviderRegistry::builtin();
        let openai = registry.get("openai").expect("openai");
        assert_eq!(openai.organization_header.as_deref(), Some("OpenAI-Organization"));
        assert!(registry.get("deepseek").expect("deepseek").organization_header.is_none());
    }

    #[test]
    fn test_resolve_endpoint_static_and_custom() {
        let registry = ProviderRegistry::builtin();
        let mut config = GenerationConfig::default();

        let openai = registry.get("openai").expect("openai");
        config.endpoint_override = Some("https://ignored.example".into());
        assert_eq!(
            resolve_endpoint(openai, &config).expect("static"),
            "https://api.openai.com/v1/chat/completions"
        );

        let custom = registry.get(CUSTOM_PROVIDER_ID).expect("custom");
        config.endpoint_override = Some("https://llm.example.com/v1/".into());
        assert_eq!(
            resolve_endpoint(custom, &config).expect("custom"),
            "https://llm.example.com/v1/chat/completions"
        );

        config.endpoint_override = Some("   ".into());
        assert_eq!(
            resolve_endpoint(custom, &config),
            Err(ConfigError::MissingEndpoint("custom".into()))
        );
    }

    #[test]
    fn test_supports_model_includes_custom_models() {
        let registry = ProviderRegistry::builtin();
        let custom = registry.get(CUSTOM_PROVIDER_ID).expect("custom");
        assert!(!custom.supports_model("qwen-max", &[]));
        assert!(custom.supports_model("qwen-max", &["qwen-max".to_string()]));
        let openai = registry.get("openai").expect("openai");
        assert!(openai.supports_model("gpt-4", &[]));
        assert!(!openai.supports_model("", &[]));
    }
}
