use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lifescroll_core_sdk::prelude::*;

/**
 * \brief CLI 程序入口：配置服务商、保存密钥、校验连接、生成内容、启动本地服务。
 */
#[derive(Parser, Debug)]
#[command(name = "lifescroll", version, about = "Lifescroll text generation toolkit")]
struct Cli {
    /** \brief 解锁已保存密钥的口令，仅本次进程有效。 */
    #[arg(long, global = true, env = "LIFESCROLL_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 初始化服务商配置，可选地加密保存 API 密钥。
     * \param provider 服务商 ID（deepseek/volcano/openai/siliconflow/anthropic/custom）
     * \param api_key  API 密钥，需配合 --passphrase 加密保存
     */
    Init {
        #[arg(long, default_value = "deepseek")]
        provider: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        top_p: Option<f32>,
        #[arg(long, allow_hyphen_values = true)]
        frequency_penalty: Option<f32>,
        #[arg(long, allow_hyphen_values = true)]
        presence_penalty: Option<f32>,
        /** \brief OpenAI 组织 ID，传空字符串可清除。 */
        #[arg(long)]
        organization: Option<String>,
        /** \brief custom 服务商的 API 基础地址。 */
        #[arg(long)]
        endpoint: Option<String>,
        /** \brief 追加的模型名，可重复。 */
        #[arg(long = "custom-model")]
        custom_models: Vec<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        enable_telemetry: Option<bool>,
    },

    /**
     * \brief 校验当前配置能否连通服务商。
     */
    Test,

    /**
     * \brief 显示配置与最近一次连接状态。
     */
    Status,

    /**
     * \brief 生成一段内容并以 JSON 输出。
     */
    Generate {
        #[arg(long = "type")]
        content_type: ContentType,
        /** \brief JSON 对象形式的上下文，如 '{"characterName":"沈清"}' */
        #[arg(long, default_value = "{}")]
        context: String,
    },

    /**
     * \brief 列出内置服务商。
     */
    Providers,

    /**
     * \brief 清空本地响应缓存。
     */
    ClearCache,

    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();
    let service = AiService::open(settings).context("open local store failed")?;
    if let Some(passphrase) = cli.passphrase.as_deref() {
        service.remember_passphrase(passphrase);
    }

    match cli.command {
        Commands::Init {
            provider,
            model,
            temperature,
            max_tokens,
            top_p,
            frequency_penalty,
            presence_penalty,
            organization,
            endpoint,
            custom_models,
            api_key,
            enable_telemetry,
        } => {
            let config = service
                .set_config(ConfigPatch {
                    provider_id: Some(provider),
                    model,
                    temperature,
                    max_tokens,
                    top_p,
                    frequency_penalty,
                    presence_penalty,
                    organization_id: organization,
                    endpoint_override: endpoint,
                    custom_models: (!custom_models.is_empty()).then_some(custom_models),
                    ..ConfigPatch::default()
                })
                .context("save configuration failed")?;
            if let Some(api_key) = api_key {
                let passphrase = cli
                    .passphrase
                    .as_deref()
                    .context("--passphrase is required to store an api key")?;
                service
                    .save_credential(passphrase, &api_key)
                    .await
                    .context("save credential failed")?;
            }
            if let Some(enabled) = enable_telemetry {
                service
                    .set_telemetry_enabled(enabled)
                    .context("save telemetry failed")?;
            }
            let (has_credential, _) = service.credential_state();
            println!(
                "Saved provider={} model={} temperature={} credential={}",
                config.provider_id,
                config.model,
                config.temperature,
                if has_credential { "stored" } else { "missing" }
            );
        }
        Commands::Test => {
            let connected = service.test_connection().await;
            let status = service.status();
            if connected {
                println!(
                    "connected ({} ms, {} calls today)",
                    status.last_latency_ms.unwrap_or_default(),
                    status.today_calls
                );
            } else {
                match status.last_error {
                    Some(err) => println!("disconnected: {}\n  hint: {}", err, err.remediation),
                    None => println!("disconnected"),
                }
            }
        }
        Commands::Status => {
            let (has_credential, unlocked) = service.credential_state();
            let view = serde_json::json!({
                "config": service.config(),
                "hasCredential": has_credential,
                "unlocked": unlocked,
                "status": service.status(),
                "telemetryEnabled": service.telemetry_enabled(),
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Generate {
            content_type,
            context,
        } => {
            let context: GenerationContext =
                serde_json::from_str(&context).context("--context must be a JSON object")?;
            let result = service.generate(content_type, &context).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.succeeded {
                std::process::exit(2);
            }
        }
        Commands::Providers => {
            for profile in service.providers() {
                println!(
                    "{:<12} {:<10} {}  models: {}",
                    profile.id,
                    profile.name,
                    profile.endpoint_template,
                    profile.models.join(", ")
                );
            }
        }
        Commands::ClearCache => {
            let removed = service.clear_cache().context("clear cache failed")?;
            println!("removed {} cached responses", removed);
        }
        Commands::Serve { addr } => {
            server::run(&addr, Arc::new(service)).await?;
        }
    }

    Ok(())
}
