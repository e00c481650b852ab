//! 基于规则的商品属性分类
//!
//! 每个维度是一张有序规则表，首个命中的规则胜出:
//! - 类别: 生化组合 > 母酊 > 生化/研磨 > 稀释液效价 > 软膏 > 糖浆 > 滴剂 > 片剂/糖丸 > 油剂 > 默认专利药
//! - 效价: 按类别提取，缺省 NA
//! - 剂型: 类别固定映射
//! - 品牌: 别名表子串匹配 (不区分大小写) -> 纯字母的供应商品牌字段 -> unbranded

use regex::Regex;
use std::sync::LazyLock;

use crate::config::{default_brand_aliases, BrandAlias};
use crate::models::{Category, Potency, ProductAttributes, UNBRANDED};

/// 规则分类置信度 (不确定性在匹配阶段，不在分类阶段)
pub const CLASSIFICATION_CONFIDENCE: f64 = 0.95;

/// 类别规则
pub struct CategoryRule {
    pub name: &'static str,
    pub category: Category,
    pattern: Regex,
}

impl CategoryRule {
    fn new(name: &'static str, category: Category, pattern: &str) -> Self {
        Self {
            name,
            category,
            pattern: Regex::new(pattern).expect("Invalid regex"),
        }
    }

    /// 输入为小写后的干净名称
    pub fn matches(&self, lower_name: &str) -> bool {
        self.pattern.is_match(lower_name)
    }
}

static CATEGORY_RULES: LazyLock<Vec<CategoryRule>> = LazyLock::new(|| {
    vec![
        CategoryRule::new(
            "bio-combination-marker",
            Category::BioCombination,
            r"\b(?:bc\d*|bio\s*com(?:bination)?\d*)\b",
        ),
        CategoryRule::new(
            "mother-tincture-marker",
            Category::MotherTincture,
            r"\b(?:q|ø|mother\s*tincture)\b",
        ),
        CategoryRule::new(
            "biochemic-trituration-marker",
            Category::BiochemicTrituration,
            r"\b(?:\d+x|trituration)\b",
        ),
        CategoryRule::new(
            "dilution-potency",
            Category::Dilution,
            r"\b(?:\d+\s*(?:c|ch|ck)|1m|10m|50m|cm|lm\s*\d+)\b",
        ),
        CategoryRule::new(
            "ointment-keyword",
            Category::OintmentCream,
            r"\b(?:oint|ointment|cream|gel)\b",
        ),
        CategoryRule::new("syrup-keyword", Category::Syrup, r"\b(?:syrup|syp|tonic)\b"),
        CategoryRule::new("drops-keyword", Category::Drops, r"\b(?:drops?|drp)\b"),
        CategoryRule::new(
            "tablet-keyword",
            Category::TabletGlobule,
            r"\b(?:tabs?|tablets?|pills|globules?|glb)\b",
        ),
        CategoryRule::new("oil-keyword", Category::Oil, r"\b(?:oil|hair\s*oil)\b"),
    ]
});

/// 默认规则名
pub const DEFAULT_RULE: &str = "default-other-patent";

static RE_BC_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:BC|BIO\s*COM(?:BINATION)?)[\s\-]*(\d+)\b").expect("Invalid regex")
});
static RE_BC_TRAILING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bBC(\d+)\b").expect("Invalid regex"));
static RE_DILUTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\s*(CH|CK|C)\b").expect("Invalid regex"));
static RE_HIGH_POTENCY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(1M|10M|50M|CM|LM\s*\d+)\b").expect("Invalid regex"));
static RE_DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)X\b").expect("Invalid regex"));
static RE_PLAIN_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\b").expect("Invalid regex"));

/// 分类输入: 干净名称 + 原始描述 + 供应商品牌字段
#[derive(Debug, Clone, Copy)]
pub struct ClassifierInput<'a> {
    pub clean_name: &'a str,
    pub raw_description: &'a str,
    pub brand_field: Option<&'a str>,
}

/// 品牌别名规则: 两端不与字母数字相连 ("SBL" 不命中 "ASBLX")
struct BrandRule {
    pattern: Regex,
    brand: String,
}

/// 属性分类器
pub struct AttributeClassifier {
    /// 保持配置顺序
    brands: Vec<BrandRule>,
}

impl Default for AttributeClassifier {
    fn default() -> Self {
        Self::new(&default_brand_aliases())
    }
}

impl AttributeClassifier {
    pub fn new(aliases: &[BrandAlias]) -> Self {
        let brands = aliases
            .iter()
            .filter(|a| !a.alias.trim().is_empty())
            .filter_map(|a| {
                let pattern = format!(
                    r"(?i)(?:^|[^\p{{L}}\p{{N}}]){}(?:$|[^\p{{L}}\p{{N}}])",
                    regex::escape(a.alias.trim())
                );
                match Regex::new(&pattern) {
                    Ok(pattern) => Some(BrandRule {
                        pattern,
                        brand: a.brand.clone(),
                    }),
                    Err(e) => {
                        tracing::warn!("忽略无效的品牌别名 '{}': {}", a.alias, e);
                        None
                    }
                }
            })
            .collect();
        Self { brands }
    }

    pub fn classify(&self, input: ClassifierInput<'_>) -> ProductAttributes {
        let (category, rule) = Self::category(input.clean_name);
        let potency = Self::potency(input.clean_name, category);
        let brand = self.brand(input);

        ProductAttributes {
            clean_name: input.clean_name.to_string(),
            category,
            potency,
            form: category.dosage_form(),
            brand,
            confidence: CLASSIFICATION_CONFIDENCE,
            rule: rule.to_string(),
        }
    }

    /// 类别: 首个命中规则
    pub fn category(clean_name: &str) -> (Category, &'static str) {
        let lower = clean_name.to_lowercase();
        CATEGORY_RULES
            .iter()
            .find(|rule| rule.matches(&lower))
            .map(|rule| (rule.category, rule.name))
            .unwrap_or((Category::OtherPatent, DEFAULT_RULE))
    }

    /// 效价: 按类别提取
    pub fn potency(clean_name: &str, category: Category) -> Potency {
        let upper = clean_name.to_uppercase();
        let extracted = match category {
            Category::BioCombination => RE_BC_NUMBER
                .captures(&upper)
                .or_else(|| RE_BC_TRAILING.captures(&upper))
                .map(|c| c[1].to_string()),
            Category::MotherTincture => Some("Q".to_string()),
            Category::Dilution => Self::dilution_potency(&upper)
                .or_else(|| RE_PLAIN_NUMBER.captures(&upper).map(|c| c[1].to_string())),
            Category::BiochemicTrituration => {
                RE_DECIMAL.captures(&upper).map(|c| format!("{}X", &c[1]))
            }
            _ => Self::dilution_potency(&upper)
                .or_else(|| RE_DECIMAL.captures(&upper).map(|c| format!("{}X", &c[1]))),
        };
        extracted.map(Potency::new).unwrap_or_else(Potency::na)
    }

    fn dilution_potency(upper: &str) -> Option<String> {
        if let Some(c) = RE_DILUTION.captures(upper) {
            return Some(format!("{}{}", &c[1], &c[2]));
        }
        RE_HIGH_POTENCY
            .captures(upper)
            .map(|c| c[1].split_whitespace().collect::<String>())
    }

    /// 品牌: 别名表 -> 品牌字段 -> unbranded
    pub fn brand(&self, input: ClassifierInput<'_>) -> String {
        let haystack = format!(
            "{} {} {}",
            input.raw_description,
            input.clean_name,
            input.brand_field.unwrap_or("")
        );

        if let Some(rule) = self.brands.iter().find(|r| r.pattern.is_match(&haystack)) {
            return rule.brand.clone();
        }

        match input.brand_field.map(str::trim) {
            Some(field) if field.chars().count() > 2 && field.chars().all(char::is_alphabetic) => {
                field.to_string()
            }
            _ => UNBRANDED.to_string(),
        }
    }
}
