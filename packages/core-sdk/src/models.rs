use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::vault::EncryptedSecret;

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/**
 * \brief 游戏层请求的内容类型（固定集合）。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    Event,
    Dialogue,
    Family,
    Character,
    Note,
    Mail,
    Relationship,
    AssetSkills,
    History,
    Explore,
}

impl ContentType {
    pub const ALL: [ContentType; 10] = [
        ContentType::Event,
        ContentType::Dialogue,
        ContentType::Family,
        ContentType::Character,
        ContentType::Note,
        ContentType::Mail,
        ContentType::Relationship,
        ContentType::AssetSkills,
        ContentType::History,
        ContentType::Explore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Event => "event",
            ContentType::Dialogue => "dialogue",
            ContentType::Family => "family",
            ContentType::Character => "character",
            ContentType::Note => "note",
            ContentType::Mail => "mail",
            ContentType::Relationship => "relationship",
            ContentType::AssetSkills => "asset-skills",
            ContentType::History => "history",
            ContentType::Explore => "explore",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ContentType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("unknown content type `{}`", s))
    }
}

/**
 * \brief 生成上下文：游戏层传入的任意字段（characterName、speaker 等）。
 */
pub type GenerationContext = Map<String, Value>;

/** \brief 默认系统提示词。 */
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "你是一款古风人生模拟游戏的文案助手，文风典雅简洁，只输出被要求的内容，不要附加解释。";

/**
 * \brief 生成配置。持久化时只保存加密后的密钥，明文仅存在于内存。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /** \brief 服务商 ID */
    pub provider_id: String,
    /** \brief 模型名 */
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /** \brief 核采样阈值 0-1。 */
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    #[serde(default)]
    pub presence_penalty: f32,
    pub system_prompt: String,
    /** \brief OpenAI 兼容服务商的组织 ID，仅对声明了组织请求头的服务商生效。 */
    #[serde(default)]
    pub organization_id: Option<String>,
    /** \brief 用户填写的接口地址（custom 服务商必填）。 */
    #[serde(default)]
    pub endpoint_override: Option<String>,
    /** \brief 调用方追加的模型名。 */
    #[serde(default)]
    pub custom_models: Vec<String>,
    /** \brief 保险箱中的加密密钥。 */
    #[serde(default)]
    pub encrypted_secret: Option<EncryptedSecret>,
    /** \brief 明文密钥，只在内存中保留，永不序列化。 */
    #[serde(skip)]
    pub plain_secret: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider_id: "deepseek".to_string(),
            model: "deepseek-V3.2".to_string(),
            temperature: 0.7,
            max_tokens: 800,
            top_p: default_top_p(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            organization_id: None,
            endpoint_override: None,
            custom_models: Vec::new(),
            encrypted_secret: None,
            plain_secret: None,
        }
    }
}

fn default_top_p() -> f32 {
    1.0
}

impl GenerationConfig {
    /**
     * \brief 是否存在任何形式的密钥（明文或加密）。
     */
    pub fn has_credential(&self) -> bool {
        self.plain_secret.as_deref().is_some_and(|s| !s.is_empty())
            || self.encrypted_secret.is_some()
    }
}

/**
 * \brief `setConfig` 的部分更新，未提供的字段保持原值。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /** \brief `Some("")` 表示清除组织 ID。 */
    #[serde(default)]
    pub organization_id: Option<String>,
    /** \brief `Some("")` 表示清除地址覆盖。 */
    #[serde(default)]
    pub endpoint_override: Option<String>,
    #[serde(default)]
    pub custom_models: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueLine {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailPayload {
    /** \brief 发信人，解析失败时为空。 */
    pub from: String,
    pub content: String,
    /** \brief 落款日期，解析失败时为空。 */
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyMember {
    pub name: String,
    pub personality: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyPayload {
    pub surname: String,
    pub style: String,
    pub status: String,
    pub assets: String,
    pub precept: String,
    #[serde(default)]
    pub members: Vec<FamilyMember>,
    #[serde(default)]
    pub dynamic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterSkills {
    pub poetry: u32,
    pub embroidery: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterPayload {
    pub name: String,
    pub age: u32,
    pub personality: String,
    pub appearance: String,
    pub skills: CharacterSkills,
    #[serde(default)]
    pub desc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipNode {
    pub id: String,
    pub name: String,
    pub role: String,
    /** \brief 亲密度 0-100 */
    pub intimacy: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipLink {
    pub from: String,
    pub to: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipPayload {
    pub nodes: Vec<RelationshipNode>,
    pub links: Vec<RelationshipLink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetChange {
    pub change: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillGrowth {
    pub name: String,
    pub before: u32,
    pub after: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSkillsPayload {
    pub asset: AssetChange,
    pub skills: Vec<SkillGrowth>,
    pub summary: String,
}

/**
 * \brief 按内容类型区分的结构化结果。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Summary {
        summary: String,
    },
    Dialogue {
        lines: Vec<DialogueLine>,
        #[serde(default)]
        effect: Option<String>,
    },
    Text {
        text: String,
    },
    Mail(MailPayload),
    Family(FamilyPayload),
    Character(CharacterPayload),
    Relationship(RelationshipPayload),
    AssetSkills(AssetSkillsPayload),
    History {
        entries: Vec<String>,
    },
}

/**
 * \brief 结果来源。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Live,
    Cache,
    Fallback,
    None,
}

/**
 * \brief `generate()` 的返回值，任何情况下都会返回。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub succeeded: bool,
    pub content_type: ContentType,
    pub payload: Option<Payload>,
    pub source: ResultSource,
    pub diagnostic_message: String,
}

impl GenerationResult {
    pub fn live(content_type: ContentType, payload: Payload) -> Self {
        Self {
            succeeded: true,
            content_type,
            payload: Some(payload),
            source: ResultSource::Live,
            diagnostic_message: "generated by provider".to_string(),
        }
    }

    pub fn cached(content_type: ContentType, payload: Payload) -> Self {
        Self {
            succeeded: true,
            content_type,
            payload: Some(payload),
            source: ResultSource::Cache,
            diagnostic_message: "served from cache".to_string(),
        }
    }

    pub fn fallback(content_type: ContentType, payload: Payload, reason: &str) -> Self {
        Self {
            succeeded: true,
            content_type,
            payload: Some(payload),
            source: ResultSource::Fallback,
            diagnostic_message: format!("{}, fallback content used", reason),
        }
    }

    pub fn failed(content_type: ContentType, diagnostic: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            content_type,
            payload: None,
            source: ResultSource::None,
            diagnostic_message: diagnostic.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_parses_wire_names() {
        assert_eq!("asset-skills".parse::<ContentType>(), Ok(ContentType::AssetSkills));
        assert_eq!(" Mail ".parse::<ContentType>(), Ok(ContentType::Mail));
        assert!("weather".parse::<ContentType>().is_err());
        let json = serde_json::to_string(&ContentType::AssetSkills).expect("serialize");
        assert_eq!(json, "\"asset-skills\"");
    }

    #[test]
    fn test_plain_secret_is_never_serialized() {
        let config = GenerationConfig {
            plain_secret: Some("sk-very-secret".to_string()),
            ..GenerationConfig::default()
        };
        let json = serde_json::to_string(&config).expect("serialize");
        assert!(!json.contains("sk-very-secret"));
        let back: GenerationConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.plain_secret, None);
        assert_eq!(back.provider_id, "deepseek");
    }

    #[test]
    fn test_config_without_sampling_fields_uses_defaults() {
        let raw = serde_json::json!({
            "providerId": "openai",
            "model": "gpt-4",
            "temperature": 0.3,
            "maxTokens": 100,
            "systemPrompt": ""
        });
        let config: GenerationConfig = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(config.top_p, 1.0);
        assert_eq!(config.frequency_penalty, 0.0);
        assert_eq!(config.presence_penalty, 0.0);
        assert_eq!(config.organization_id, None);
        let json = serde_json::to_value(&config).expect("serialize");
        assert_eq!(json["topP"], 1.0);
    }

    #[test]
    fn test_payload_is_tagged_by_kind() {
        let payload = Payload::Mail(MailPayload {
            from: "母亲".into(),
            content: "安好".into(),
            date: String::new(),
        });
        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(value["kind"], "mail");
        assert_eq!(value["from"], "母亲");
    }
}
