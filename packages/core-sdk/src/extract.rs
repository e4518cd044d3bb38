use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;

use crate::models::{ContentType, DialogueLine, MailPayload, Payload};

static MAIL_FROM: Lazy<Regex> =
    Lazy::new(|| literal_regex(r"(?:发信人|寄信人|来信人)[:：]?\s*([^;；，,\n]+)"));

static MAIL_DATE: Lazy<Regex> = Lazy::new(|| {
    literal_regex(r"(?:时间|日期)[:：]?\s*([\d〇一二三四五六七八九十百千年月日\- ]+)")
});

static FENCED_JSON: Lazy<Regex> = Lazy::new(|| literal_regex(r"(?s)```(?:json)?\s*(\{.*\})\s*```"));

fn literal_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(err) => panic!("extraction regex is invalid: {err}"),
    }
}

/**
 * \brief 将模型返回的原始文本解析为对应类型的结构化结果。
 * \details 记录类（家族、人物、关系、资产）优先按 JSON 解析，失败时退化为整段文本。
 */
pub fn extract(content_type: ContentType, raw: &str) -> Payload {
    let raw = raw.trim();
    match content_type {
        ContentType::Event | ContentType::Explore => Payload::Summary {
            summary: raw.to_string(),
        },
        ContentType::Dialogue => Payload::Dialogue {
            lines: non_empty_lines(raw)
                .map(|text| DialogueLine { text })
                .collect(),
            effect: None,
        },
        ContentType::History => Payload::History {
            entries: non_empty_lines(raw)
                .map(|line| {
                    line.trim_start_matches(|c: char| c == '-' || c == '*' || c == '•')
                        .trim()
                        .to_string()
                })
                .filter(|line| !line.is_empty())
                .collect(),
        },
        ContentType::Mail => Payload::Mail(extract_mail(raw)),
        ContentType::Family => parse_record(raw).map(Payload::Family).unwrap_or_else(|| text(raw)),
        ContentType::Character => parse_record(raw)
            .map(Payload::Character)
            .unwrap_or_else(|| text(raw)),
        ContentType::Relationship => parse_record(raw)
            .map(Payload::Relationship)
            .unwrap_or_else(|| text(raw)),
        ContentType::AssetSkills => parse_record(raw)
            .map(Payload::AssetSkills)
            .unwrap_or_else(|| text(raw)),
        ContentType::Note => text(raw),
    }
}

/**
 * \brief 从信件文本中提取发信人与日期；匹配失败时字段留空，整段文本作为正文。
 */
pub fn extract_mail(raw: &str) -> MailPayload {
    let from = MAIL_FROM
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    let date = MAIL_DATE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    MailPayload {
        from,
        content: raw.to_string(),
        date,
    }
}

fn parse_record<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let candidate = FENCED_JSON
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw);
    serde_json::from_str(candidate).ok()
}

fn non_empty_lines(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
}

fn text(raw: &str) -> Payload {
    Payload::Text {
        text: raw.to_string(),
    }
}
