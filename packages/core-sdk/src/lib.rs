pub mod cache;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod fallback;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod prompts;
pub mod registry;
pub mod server;
pub mod service;
pub mod telemetry;
pub mod vault;
pub mod verifier;

/**
 * \brief SDK 预导入集合，游戏层与 CLI 常用的类型。
 */
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::error::{ClassifiedError, ConfigError, ErrorClass, VaultError};
    pub use crate::models::{
        ConfigPatch, ContentType, GenerationConfig, GenerationContext, GenerationResult, Payload,
        ResultSource,
    };
    pub use crate::registry::{ProviderProfile, ProviderRegistry};
    pub use crate::server;
    pub use crate::service::AiService;
    pub use crate::verifier::{ConnectionState, ConnectionStatus};
}
