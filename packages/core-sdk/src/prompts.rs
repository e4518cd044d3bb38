use serde_json::Value;

use crate::models::{ContentType, GenerationContext};

/**
 * \brief 渲染后的提示词。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
}

/**
 * \brief 按内容类型选择模板并填入上下文字段。
 */
pub fn render(content_type: ContentType, context: &GenerationContext) -> Prompt {
    let text = match content_type {
        ContentType::Event => format!(
            "请生成一个发生在{}{}{}的家庭/人生年度大事件，角色：{}，属性：{}，要求短篇叙述，突出事件影响与后续走向。",
            field(context, "dynasty", "明朝"),
            field(context, "yearName", ""),
            field(context, "year", ""),
            field(context, "characterName", "女主"),
            json_field(context, "characterAttr"),
        ),
        ContentType::Dialogue => format!(
            "请生成一段{}与{}之间的互动对话（性格：{}），每行一句，包含对话内容及情感变化、互动后果。",
            field(context, "speaker", "李昭华"),
            field(context, "addressee", "家人/姐妹"),
            field(context, "speakerPersonality", ""),
        ),
        ContentType::Family => format!(
            "请设定一个{}古风家族，以 JSON 对象输出：surname、style、status、assets、precept、members（name、personality）、dynamic。",
            surname_hint(context),
        ),
        ContentType::Character => "请生成一个女性NPC角色，以 JSON 对象输出：name、age、personality、appearance、skills（poetry、embroidery）、desc，背景符合古风。".to_string(),
        ContentType::Note => format!(
            "请为{}随机生成一篇年度个人心情手记，反映当年经历与成长感悟，三句话内。",
            field(context, "characterName", "女主"),
        ),
        ContentType::Mail => format!(
            "生成一份古风家书，用于{}收到来自亲友的信件。格式：第一行“发信人：某某”，随后是正文，最后一行“时间：某年某月某日”。",
            field(context, "characterName", "主角"),
        ),
        ContentType::Relationship => "输出家族及主要相关人物、身份及与主角的亲密度分数（0-100）、关系描述，以 JSON 对象输出：nodes（id、name、role、intimacy）、links（from、to、label）。".to_string(),
        ContentType::AssetSkills => "生成主角年度资产增减记录及技能成长情况，以 JSON 对象输出：asset（change、reason）、skills（name、before、after）、summary。".to_string(),
        ContentType::History => "请简要回顾并总结主角一年内所有大事件/家庭/互动/成长变化，每行一条，不要省略重要影响。".to_string(),
        ContentType::Explore => format!(
            "生成一次在家宅{}的探索事件描述，包括主角/家人/事件变化。",
            field(context, "area", "任意场所"),
        ),
    };
    Prompt { text }
}

/**
 * \brief 读取上下文字段：字符串原样返回，数字转为文本，缺失或为空时返回默认值。
 */
pub fn field(context: &GenerationContext, key: &str, default: &str) -> String {
    match context.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => default.to_string(),
    }
}

fn json_field(context: &GenerationContext, key: &str) -> String {
    match context.get(key) {
        Some(Value::Null) | None => "{}".to_string(),
        Some(value) => value.to_string(),
    }
}

fn surname_hint(context: &GenerationContext) -> String {
    match context.get("surname").and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => format!("姓{}的", s.trim()),
        _ => "随机".to_string(),
    }
}
