use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ring::digest;

use crate::models::{
    AssetChange, AssetSkillsPayload, CharacterPayload, CharacterSkills, ContentType, DialogueLine,
    FamilyMember, FamilyPayload, GenerationContext, MailPayload, Payload, RelationshipLink,
    RelationshipNode, RelationshipPayload, SkillGrowth,
};
use crate::prompts::field;

/**
 * \brief 由提示词文本计算随机种子，同一输入总是得到同一份替代内容。
 */
pub fn seed_for(prompt: &str) -> u64 {
    let hash = digest::digest(&digest::SHA256, prompt.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_ref()[..8]);
    u64::from_le_bytes(bytes)
}

/**
 * \brief 为指定类型合成本地替代内容，保证界面始终有可展示的结果。
 */
pub fn synthesize(content_type: ContentType, context: &GenerationContext, seed: u64) -> Payload {
    let mut rng = StdRng::seed_from_u64(seed);
    match content_type {
        ContentType::Event => event(context, &mut rng),
        ContentType::Character => character(&mut rng),
        ContentType::Dialogue => dialogue(context, &mut rng),
        ContentType::Family => family(context, &mut rng),
        ContentType::Note => Payload::Text {
            text: pick(
                &mut rng,
                &[
                    "春日阳光融融，姐妹共度欢喜时光。",
                    "岁岁年年，心境渐变，渐懂人生要义。",
                    "新知渐多，人情练达，颇有成长。",
                ],
            )
            .to_string(),
        },
        ContentType::Mail => mail(&mut rng),
        ContentType::Relationship => relationship(context),
        ContentType::AssetSkills => asset_skills(&mut rng),
        ContentType::History => Payload::History {
            entries: vec![
                "参加城中书会，收获友谊".to_string(),
                "家族搬迁，结识新邻".to_string(),
                "完成母亲交办家事".to_string(),
                "身体小恙，恢复如初".to_string(),
            ],
        },
        ContentType::Explore => Payload::Summary {
            summary: format!(
                "你在{}{}",
                field(context, "area", "后花园"),
                pick(
                    &mut rng,
                    &[
                        "发现一只慵懒的猫，每到傍晚便守在秋千下，偶遇妹妹，谈笑片刻，心情大好。",
                        "拾得一枚旧玉佩，母亲说是祖母当年的陪嫁，众人唏嘘良久。",
                        "听见丫鬟们低声议论府中近事，方知父亲即将外放。",
                    ],
                )
            ),
        },
    }
}

fn pick<'a>(rng: &mut StdRng, options: &[&'a str]) -> &'a str {
    options[rng.gen_range(0..options.len())]
}

fn event(context: &GenerationContext, rng: &mut StdRng) -> Payload {
    let name = field(context, "characterName", "你");
    let summaries = [
        format!("春日书会中，{}展现诗才，一时声名鹊起，结识新友。影响：诗词+5，社交圈扩展。", name),
        "家族遭遇小变故，父亲外放升任，家庭搬迁新地，需重新适应。影响：家族声望波动。".to_string(),
        "偶染小疾，卧床数日，母亲悉心照料，姐妹互动增多。影响：健康-10，好感提升。".to_string(),
        "遇贵人介绍，获上乘刺绣机巧，技艺大进。刺绣+8。".to_string(),
    ];
    let index = rng.gen_range(0..summaries.len());
    Payload::Summary {
        summary: summaries[index].clone(),
    }
}

fn character(rng: &mut StdRng) -> Payload {
    let name = format!(
        "{}{}",
        pick(rng, &["李", "王", "张", "刘", "赵", "陈", "杨", "黄"]),
        pick(rng, &["昭华", "昭宁", "昭仪", "昭媛", "昭容"])
    );
    let age = rng.gen_range(12..22);
    let gifted = rng.gen_bool(0.4);
    let hobby = pick(rng, &["爱好读书", "乐于交友", "思虑周密", "喜静好诗"]);
    Payload::Character(CharacterPayload {
        desc: format!(
            "{}，{}岁，{}{}",
            name,
            age,
            if gifted { "天赋异禀，" } else { "平凡出众，" },
            hobby
        ),
        name,
        age,
        personality: pick(rng, &["温柔贤淑", "活泼开朗", "内向细腻", "自信果断", "知书达理"]).to_string(),
        appearance: pick(rng, &["国色天香", "眉清目秀", "清新脱俗", "小家碧玉"]).to_string(),
        skills: CharacterSkills {
            poetry: rng.gen_range(0..80),
            embroidery: rng.gen_range(0..80),
        },
    })
}

fn dialogue(context: &GenerationContext, rng: &mut StdRng) -> Payload {
    let speaker = field(context, "speaker", "姐姐");
    let addressee = field(context, "addressee", "妹妹");
    let opening = pick(
        rng,
        &[
            "今天天气真好，不如去后花园走走吧？",
            "妹妹刺绣进步很快呢，要继续努力哦！",
            "今晚母亲可能会讲睡前故事，你来一起听吗？",
        ],
    );
    let reply = pick(
        rng,
        &["好的！我刚好也有新故事要分享~", "谢谢姐姐表扬！我会继续的。", "太好了，我们一起吧！"],
    );
    Payload::Dialogue {
        lines: vec![
            DialogueLine {
                text: format!("{}：“{}”", speaker, opening),
            },
            DialogueLine {
                text: format!("{}：“{}”", addressee, reply),
            },
        ],
        effect: Some(format!("{}与{}关系略升", speaker, addressee)),
    }
}

fn family(context: &GenerationContext, rng: &mut StdRng) -> Payload {
    let random_surname = pick(rng, &["李", "王", "张", "刘", "陈"]);
    Payload::Family(FamilyPayload {
        surname: field(context, "surname", random_surname),
        style: pick(rng, &["诗书传家", "乐善好施", "清正自守", "重商轻文"]).to_string(),
        status: pick(rng, &["官宦之家", "商贾巨富", "书香门第", "农家小康"]).to_string(),
        assets: pick(rng, &["富裕", "中等", "清贫"]).to_string(),
        precept: pick(rng, &["自强不息", "勤俭持家", "温良恭俭让", "敦亲睦邻"]).to_string(),
        members: [("父亲", "谨慎聪明"), ("母亲", "温婉贤淑"), ("主角", "善良正直")]
            .iter()
            .map(|(name, personality)| FamilyMember {
                name: name.to_string(),
                personality: personality.to_string(),
            })
            .collect(),
        dynamic: pick(
            rng,
            &["家有喜事，全体齐聚一堂", "近期风调雨顺，家业日隆", "长辈筹备家宴，热闹非常"],
        )
        .to_string(),
    })
}

fn mail(rng: &mut StdRng) -> Payload {
    let from = pick(rng, &["母亲", "父亲", "好友周兰儿", "表姐王素素"]).to_string();
    let content = pick(
        rng,
        &[
            "近来天气渐暖，记得添衣注意身体。母亲常念你，家中一切安好，无需挂怀。",
            "听说你最近诗艺精进，望能多加练习，勿负天分。记得来信。",
            "大家都很想你，有空常回家。",
        ],
    )
    .to_string();
    let date = format!(
        "{}年{}月{}日",
        2025 - rng.gen_range(0..10),
        rng.gen_range(1..=12),
        rng.gen_range(1..=25)
    );
    Payload::Mail(MailPayload { from, content, date })
}

fn relationship(context: &GenerationContext) -> Payload {
    let hero = field(context, "characterName", "李昭华");
    let nodes = [
        ("主角", hero.as_str(), "本人", 100),
        ("母", "母亲", "母亲", 90),
        ("父", "父亲", "父亲", 80),
        ("a", "昭仪", "二姐", 85),
        ("b", "昭媛", "三姐", 78),
        ("c", "昭宁", "四妹", 82),
    ]
    .iter()
    .map(|(id, name, role, intimacy)| RelationshipNode {
        id: id.to_string(),
        name: name.to_string(),
        role: role.to_string(),
        intimacy: *intimacy,
    })
    .collect();
    let links = [("主角", "母", "母女"), ("主角", "a", "姐妹"), ("母", "父", "夫妻")]
        .iter()
        .map(|(from, to, label)| RelationshipLink {
            from: from.to_string(),
            to: to.to_string(),
            label: label.to_string(),
        })
        .collect();
    Payload::Relationship(RelationshipPayload { nodes, links })
}

fn asset_skills(rng: &mut StdRng) -> Payload {
    let poetry_gain = rng.gen_range(1..=10);
    let embroidery_gain = rng.gen_range(1..=10);
    Payload::AssetSkills(AssetSkillsPayload {
        asset: AssetChange {
            change: format!("+{}两", rng.gen_range(5..=50)),
            reason: pick(rng, &["贩卖手工作品", "理财有方", "长辈赏赐"]).to_string(),
        },
        skills: vec![
            SkillGrowth {
                name: "诗词".to_string(),
                before: 60,
                after: 60 + poetry_gain,
            },
            SkillGrowth {
                name: "刺绣".to_string(),
                before: 70,
                after: 70 + embroidery_gain,
            },
        ],
        summary: "今年家中收支平衡，生活安稳，技能微有进步。".to_string(),
    })
}
