use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::classify::{truncate, TransportFailure};
use crate::models::Message;
use crate::registry::RequestShape;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/**
 * \brief 已解析完毕、可直接发送的服务商请求。
 */
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub url: String,
    pub shape: RequestShape,
    /** \brief 认证头名称与取值（含前缀）。 */
    pub auth: (String, String),
    /** \brief 组织 ID 请求头，仅部分服务商支持。 */
    pub organization: Option<(String, String)>,
    pub body: Value,
    pub timeout: Duration,
}

/**
 * \brief 已截断到合法区间的采样参数。
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

/**
 * \brief 按请求形态序列化请求体。
 * \details 只有标准形态携带 top_p 与惩罚系数；精简形态与 Anthropic 只发送温度和长度上限。
 */
pub fn build_body(
    shape: RequestShape,
    model: &str,
    messages: &[Message],
    sampling: &Sampling,
) -> Value {
    match shape {
        RequestShape::StandardChat => json!({
            "model": model,
            "messages": messages,
            "temperature": sampling.temperature,
            "max_tokens": sampling.max_tokens,
            "top_p": sampling.top_p,
            "frequency_penalty": sampling.frequency_penalty,
            "presence_penalty": sampling.presence_penalty,
            "stream": false
        }),
        RequestShape::MinimalChat => json!({
            "model": model,
            "messages": [{"role": "user", "content": fold_system(messages)}],
            "temperature": sampling.temperature,
            "max_tokens": sampling.max_tokens
        }),
        RequestShape::AnthropicMessages => {
            let (system_prompt, payload_messages) = anthropic_payload(messages);
            let mut body = json!({
                "model": model,
                "max_tokens": sampling.max_tokens,
                "temperature": sampling.temperature,
                "messages": payload_messages,
            });
            if let Some(sys) = system_prompt {
                body["system"] = json!(sys);
            }
            body
        }
    }
}

/**
 * \brief 从成功响应中取出生成文本；结构不符或文本为空时返回 None。
 */
pub fn extract_text(shape: RequestShape, v: &Value) -> Option<String> {
    let text = match shape {
        RequestShape::StandardChat | RequestShape::MinimalChat => extract_openai_content(v),
        RequestShape::AnthropicMessages => extract_anthropic_content(v),
    }?;
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/**
 * \brief HTTP 传输层，封装 reqwest 客户端。每次调用都带超时与取消令牌。
 */
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /**
     * \brief 发送一次 POST，返回解析后的 JSON 响应体。
     * \details 超时到达时触发取消令牌，请求被中止并归类为超时；外部取消同样按超时处理。
     */
    pub async fn post(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, TransportFailure> {
        let headers = build_headers(request)?;
        let send = async {
            let resp = self
                .client
                .post(&request.url)
                .headers(headers)
                .json(&request.body)
                .send()
                .await
                .map_err(map_reqwest_error)?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(TransportFailure::status(status.as_u16(), &text));
            }
            let text = resp.text().await.map_err(map_reqwest_error)?;
            serde_json::from_str::<Value>(&text).map_err(|e| {
                TransportFailure::malformed(format!(
                    "response is not json ({}): {}",
                    e,
                    truncate(&text, 120)
                ))
            })
        };

        let timer = cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportFailure::timeout("request cancelled")),
            _ = tokio::time::sleep(request.timeout) => {
                timer.cancel();
                debug!(
                    url = %request.url,
                    timeout_ms = request.timeout.as_millis() as u64,
                    "provider call timed out"
                );
                Err(TransportFailure::timeout(format!(
                    "no response within {} ms",
                    request.timeout.as_millis()
                )))
            }
            result = send => result,
        }
    }
}

fn build_headers(request: &ProviderRequest) -> Result<HeaderMap, TransportFailure> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let (name, value) = &request.auth;
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| TransportFailure::network("invalid auth header name", false))?;
    let mut value = HeaderValue::from_str(value).map_err(|_| {
        TransportFailure::network("credential contains invalid header characters", false)
    })?;
    value.set_sensitive(true);
    headers.insert(name, value);
    if let Some((name, value)) = &request.organization {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportFailure::network("invalid organization header name", false))?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            TransportFailure::network("organization id contains invalid header characters", false)
        })?;
        headers.insert(name, value);
    }
    if request.shape == RequestShape::AnthropicMessages {
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
    }
    Ok(headers)
}

fn map_reqwest_error(err: reqwest::Error) -> TransportFailure {
    if err.is_timeout() {
        TransportFailure::timeout(err.to_string())
    } else {
        TransportFailure::network(err.to_string(), err.is_connect())
    }
}

fn fold_system(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn extract_openai_content(v: &Value) -> Option<String> {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
}

fn extract_anthropic_content(v: &Value) -> Option<String> {
    v.get("content").and_then(|arr| arr.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("")
    })
}

fn anthropic_payload(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut items = Vec::new();
    for msg in messages {
        match msg.role.as_str() {
            "system" => system_parts.push(msg.content.clone()),
            "assistant" => items.push(json!({
                "role": "assistant",
                "content": [{"type": "text", "text": msg.content}]
            })),
            _ => items.push(json!({
                "role": "user",
                "content": [{"type": "text", "text": msg.content}]
            })),
        }
    }
    let system_prompt = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system_prompt, items)
}
