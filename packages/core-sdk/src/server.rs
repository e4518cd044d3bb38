use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{delete, get, get_service, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;
use tracing::info;

use crate::error::{ClassifiedError, ConfigError};
use crate::models::{
    ConfigPatch, ContentType, GenerationConfig, GenerationContext, GenerationResult,
};
use crate::registry::ProviderProfile;
use crate::service::AiService;
use crate::verifier::ConnectionStatus;

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

/**
 * \brief 启动本地 HTTP 服务，提供静态前端与 API。Ctrl-C 时取消进行中的调用并退出。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, service: Arc<AiService>) -> Result<()> {
    let app = router(service.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            service.shutdown();
        })
        .await?;
    Ok(())
}

/**
 * \brief 构建路由。静态资源优先使用 `ui_dir`，不存在时使用备用目录。
 */
pub fn router(service: Arc<AiService>) -> Router {
    let settings = service.settings();
    let ui_root = settings
        .ui_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("ui/dist"));
    let fallback_root = settings
        .ui_fallback_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("web"));
    let static_handler = if ui_root.exists() {
        ServeDir::new(ui_root)
    } else {
        ServeDir::new(fallback_root)
    }
    .append_index_html_on_directories(true);

    Router::new()
        .route("/api/providers", get(get_providers))
        .route("/api/config", get(get_config).post(set_config))
        .route("/api/credential", post(save_credential))
        .route("/api/credential/unlock", post(unlock_credential))
        .route("/api/status", get(get_status))
        .route("/api/connection/test", post(test_connection))
        .route("/api/generate", post(generate))
        .route("/api/telemetry", get(get_telemetry).post(set_telemetry))
        .route("/api/cache", delete(clear_cache))
        .fallback_service(get_service(static_handler))
        .with_state(service)
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ConfigView {
    config: GenerationConfig,
    has_credential: bool,
    unlocked: bool,
}

#[derive(Deserialize, Debug)]
struct CredentialInput {
    password: String,
    secret: String,
}

#[derive(Deserialize, Debug)]
struct UnlockInput {
    password: String,
    /** \brief 本次会话内记住口令。 */
    #[serde(default)]
    remember: bool,
}

#[derive(Serialize, Debug)]
struct TestOutcome {
    connected: bool,
    status: ConnectionStatus,
}

#[derive(Deserialize, Debug)]
struct GenerateInput {
    #[serde(rename = "type")]
    content_type: ContentType,
    #[serde(default)]
    context: GenerationContext,
}

#[derive(Serialize, Debug)]
struct CacheCleared {
    removed: usize,
}

#[derive(Serialize, Deserialize, Debug)]
struct TelemetrySwitch {
    enabled: bool,
}

fn config_view(service: &AiService) -> ConfigView {
    let (has_credential, unlocked) = service.credential_state();
    ConfigView {
        config: service.config(),
        has_credential,
        unlocked,
    }
}

/**
 * \brief 内置服务商列表。
 */
async fn get_providers(State(service): State<Arc<AiService>>) -> Json<Vec<ProviderProfile>> {
    Json(service.providers())
}

async fn get_config(State(service): State<Arc<AiService>>) -> Json<ConfigView> {
    Json(config_view(&service))
}

/**
 * \brief 部分更新配置；配置错误返回 400。
 */
async fn set_config(
    State(service): State<Arc<AiService>>,
    Json(patch): Json<ConfigPatch>,
) -> ApiResult<ConfigView> {
    service.set_config(patch).map_err(client_or_internal)?;
    Ok(Json(config_view(&service)))
}

async fn save_credential(
    State(service): State<Arc<AiService>>,
    Json(input): Json<CredentialInput>,
) -> ApiResult<ConfigView> {
    service
        .save_credential(&input.password, &input.secret)
        .await
        .map_err(client_or_internal)?;
    Ok(Json(config_view(&service)))
}

/**
 * \brief 用口令解锁已保存的密钥。明文不会返回给前端。
 */
async fn unlock_credential(
    State(service): State<Arc<AiService>>,
    Json(input): Json<UnlockInput>,
) -> Result<Json<ConfigView>, (StatusCode, Json<ClassifiedError>)> {
    service
        .load_credential(&input.password)
        .await
        .map_err(|err| (StatusCode::UNAUTHORIZED, Json(ClassifiedError::from(err))))?;
    if input.remember {
        service.remember_passphrase(&input.password);
    }
    Ok(Json(config_view(&service)))
}

async fn get_status(State(service): State<Arc<AiService>>) -> Json<ConnectionStatus> {
    Json(service.status())
}

/**
 * \brief 连接校验：失败信息记录在状态的 lastError 中，接口本身总是 200。
 */
async fn test_connection(State(service): State<Arc<AiService>>) -> Json<TestOutcome> {
    let connected = service.test_connection().await;
    Json(TestOutcome {
        connected,
        status: service.status(),
    })
}

async fn generate(
    State(service): State<Arc<AiService>>,
    Json(input): Json<GenerateInput>,
) -> Json<GenerationResult> {
    Json(service.generate(input.content_type, &input.context).await)
}

async fn get_telemetry(State(service): State<Arc<AiService>>) -> Json<TelemetrySwitch> {
    Json(TelemetrySwitch {
        enabled: service.telemetry_enabled(),
    })
}

async fn set_telemetry(
    State(service): State<Arc<AiService>>,
    Json(input): Json<TelemetrySwitch>,
) -> ApiResult<TelemetrySwitch> {
    service
        .set_telemetry_enabled(input.enabled)
        .map_err(internal_err)?;
    Ok(Json(input))
}

async fn clear_cache(State(service): State<Arc<AiService>>) -> ApiResult<CacheCleared> {
    let removed = service.clear_cache().map_err(internal_err)?;
    Ok(Json(CacheCleared { removed }))
}

fn client_or_internal(e: anyhow::Error) -> (StatusCode, String) {
    if e.downcast_ref::<ConfigError>().is_some() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else {
        internal_err(e)
    }
}

fn internal_err<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
