use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/**
 * \brief 错误分类，序列化名称即对外暴露的类名（如 `ServerError`）。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    #[serde(rename = "ConfigError")]
    Config,
    #[serde(rename = "DecryptionError")]
    Decryption,
    #[serde(rename = "TimeoutError")]
    Timeout,
    #[serde(rename = "NetworkError")]
    Network,
    #[serde(rename = "AuthError")]
    Auth,
    #[serde(rename = "NotFoundError")]
    NotFound,
    #[serde(rename = "RateLimitError")]
    RateLimit,
    #[serde(rename = "ServerError")]
    Server,
    #[serde(rename = "SchemaError")]
    Schema,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Config => "ConfigError",
            ErrorClass::Decryption => "DecryptionError",
            ErrorClass::Timeout => "TimeoutError",
            ErrorClass::Network => "NetworkError",
            ErrorClass::Auth => "AuthError",
            ErrorClass::NotFound => "NotFoundError",
            ErrorClass::RateLimit => "RateLimitError",
            ErrorClass::Server => "ServerError",
            ErrorClass::Schema => "SchemaError",
        }
    }

    /**
     * \brief 该类错误是否只能上抛给调用方（不存在可替代的本地内容）。
     */
    pub fn is_surfaced(&self) -> bool {
        matches!(self, ErrorClass::Config | ErrorClass::Decryption)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/**
 * \brief 已分类的错误，即连接状态中的 `lastError`。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{class}: {message}")]
pub struct ClassifiedError {
    /** \brief 错误分类。 */
    pub class: ErrorClass,
    /** \brief 原始错误描述（已截断）。 */
    pub message: String,
    /** \brief 给用户的处理建议。 */
    pub remediation: String,
}

impl ClassifiedError {
    pub fn new(
        class: ErrorClass,
        message: impl Into<String>,
        remediation: impl Into<String>,
    ) -> Self {
        Self {
            class,
            message: message.into(),
            remediation: remediation.into(),
        }
    }
}

/**
 * \brief 配置缺失或无效。不会重试，直接上抛。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing credential")]
    MissingSecret,
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),
    #[error("model `{model}` is not offered by provider `{provider}`")]
    UnknownModel { provider: String, model: String },
    #[error("provider `{0}` requires an endpoint")]
    MissingEndpoint(String),
}

impl From<ConfigError> for ClassifiedError {
    fn from(err: ConfigError) -> Self {
        let remediation = match &err {
            ConfigError::MissingSecret => "请先保存 API 密钥，或输入本地口令解锁已保存的密钥",
            ConfigError::UnknownProvider(_) => "请选择受支持的服务商",
            ConfigError::UnknownModel { .. } => "请选择该服务商提供的模型，或将模型名加入自定义模型列表",
            ConfigError::MissingEndpoint(_) => "自定义服务商需要填写 API 基础地址",
        };
        ClassifiedError::new(ErrorClass::Config, err.to_string(), remediation)
    }
}

/**
 * \brief 凭据保险箱错误。解密失败一律关闭失败，不返回任何部分明文。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    #[error("decryption failed: {0}")]
    Decryption(&'static str),
    #[error("random generator unavailable")]
    Random,
}

impl From<VaultError> for ClassifiedError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Decryption(_) => ClassifiedError::new(
                ErrorClass::Decryption,
                err.to_string(),
                "口令错误或密文已损坏，请重新输入口令或重新保存密钥",
            ),
            VaultError::Random => ClassifiedError::new(
                ErrorClass::Config,
                err.to_string(),
                "系统随机数源不可用，请稍后重试",
            ),
        }
    }
}
