use crate::error::{ClassifiedError, ErrorClass};

/**
 * \brief 传输层原始失败信息，交给分类表判定。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportFailure {
    /** \brief HTTP 状态码（若收到响应）。 */
    pub status: Option<u16>,
    /** \brief 超时或被取消。 */
    pub timed_out: bool,
    /** \brief 无法建立连接。 */
    pub connect: bool,
    /** \brief 响应成功但结构不符。 */
    pub malformed: bool,
    pub message: String,
}

impl TransportFailure {
    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status: Some(status),
            message: format!("HTTP {} - {}", status, truncate(body, 200)),
            ..Self::default()
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn network(message: impl Into<String>, connect: bool) -> Self {
        Self {
            connect,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            malformed: true,
            message: message.into(),
            ..Self::default()
        }
    }
}

const AUTH_HINT: &str = "API 密钥无效或已过期，请重新填写密钥";
const RATE_LIMIT_HINT: &str = "调用过于频繁或额度不足，请稍后重试或检查账户余额";

struct Rule {
    matches: fn(&TransportFailure) -> bool,
    class: ErrorClass,
    remediation: &'static str,
}

/* 自上而下匹配，首个命中的规则生效。状态码规则在前，关键词只在状态码无法判定时兜底。 */
static RULES: &[Rule] = &[
    Rule {
        matches: |f| f.timed_out,
        class: ErrorClass::Timeout,
        remediation: "请求超时，请检查网络或稍后重试",
    },
    Rule {
        matches: |f| matches!(f.status, Some(401) | Some(403)),
        class: ErrorClass::Auth,
        remediation: AUTH_HINT,
    },
    Rule {
        matches: |f| f.status == Some(404),
        class: ErrorClass::NotFound,
        remediation: "接口地址或模型不存在，请检查 API 地址与模型名称",
    },
    Rule {
        matches: |f| f.status == Some(429),
        class: ErrorClass::RateLimit,
        remediation: RATE_LIMIT_HINT,
    },
    Rule {
        matches: |f| matches!(f.status, Some(500..=599)),
        class: ErrorClass::Server,
        remediation: "服务商暂时不可用，请稍后重试",
    },
    Rule {
        matches: |f| mentions(f, &["invalid api key", "incorrect api key", "unauthorized"]),
        class: ErrorClass::Auth,
        remediation: AUTH_HINT,
    },
    Rule {
        matches: |f| mentions(f, &["rate limit", "quota"]),
        class: ErrorClass::RateLimit,
        remediation: RATE_LIMIT_HINT,
    },
    Rule {
        matches: |f| f.malformed,
        class: ErrorClass::Schema,
        remediation: "服务商返回的数据格式异常，请确认接口兼容 Chat Completions",
    },
    Rule {
        matches: |f| mentions(f, &["cors", "cross-origin"]),
        class: ErrorClass::Network,
        remediation: "请求可能被跨域策略拦截，请改用本地代理或允许跨域",
    },
    Rule {
        matches: |f| f.connect,
        class: ErrorClass::Network,
        remediation: "无法连接服务商，请检查网络与 API 地址",
    },
];

/**
 * \brief 按分类表判定错误类别，未命中任何规则时归为网络错误。
 */
pub fn classify(failure: &TransportFailure) -> ClassifiedError {
    let (class, remediation) = RULES
        .iter()
        .find(|rule| (rule.matches)(failure))
        .map(|rule| (rule.class, rule.remediation))
        .unwrap_or((ErrorClass::Network, "网络请求失败，请检查网络连接"));
    ClassifiedError::new(class, failure.message.clone(), remediation)
}

fn mentions(failure: &TransportFailure, needles: &[&str]) -> bool {
    let lower = failure.message.to_ascii_lowercase();
    needles.iter().any(|n| lower.contains(n))
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
