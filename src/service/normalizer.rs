//! 发票商品描述清洗
//!
//! 按固定顺序去除噪声: 括号内容 -> 数量规格 -> 行首单号 -> 点号拆分 -> 合并空白 -> 去尾部分隔符。
//! 整个流程重复到结果不再变化，保证对干净名称幂等。纯函数，任何输入都有输出。

use regex::Regex;
use std::sync::LazyLock;

static RE_BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^)]*\)|\[[^\]]*\]|\{[^}]*\}").expect("Invalid regex"));

/// 数量规格: 30ml, 450 gm, 1ltr, 2.5kg
static RE_QUANTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b\d+(?:\.\d+)?\s*(?:ml|gm|g|ltr|l|kg|oz)\b").expect("Invalid regex")
});

/// 行首单号: 至少含一位数字的字母数字串 (可带连字符段)，后接分隔符。如 "OO2987 -", "RWC-406 –"
static RE_LEADING_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[A-Za-z0-9]+[-/])*[A-Za-z]*\d[A-Za-z0-9]*(?:[-/][A-Za-z0-9]+)*\s*[-–—:]+\s*")
        .expect("Invalid regex")
});

static RE_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("Invalid regex"));

/// 每轮只删减字符，必然收敛
const MAX_PASSES: usize = 8;

static RE_TRAILING_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\-–—,;:/]+$").expect("Invalid regex"));

/// 文本清洗器
#[derive(Debug, Clone, Copy, Default)]
pub struct TextNormalizer;

impl TextNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// 原始描述 -> 干净商品名
    pub fn normalize(&self, raw: &str) -> String {
        let mut current = Self::single_pass(raw);
        for _ in 1..MAX_PASSES {
            let next = Self::single_pass(&current);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    fn single_pass(raw: &str) -> String {
        let text = RE_BRACKETED.replace_all(raw, " ");
        let text = RE_QUANTITY.replace_all(&text, " ");
        let text = RE_LEADING_CODE.replace(&text, "");
        let text = text.replace('.', " ");
        let text = RE_WHITESPACE.replace_all(&text, " ");
        let text = RE_TRAILING_SEPARATORS.replace(text.trim(), "");
        text.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean(raw: &str) -> String {
        TextNormalizer::new().normalize(raw)
    }

    #[test]
    fn test_strips_code_brackets_and_quantity() {
        assert_eq!(clean("OO2987 - Arnica Montana 30C (SBL) 30ml"), "Arnica Montana 30C");
        assert_eq!(clean("RWC-406 – Five Phos [Tonic] 450 gm"), "Five Phos");
    }

    #[test]
    fn test_dots_become_spaces() {
        assert_eq!(clean("BC.6 Biochemic Tablets"), "BC 6 Biochemic Tablets");
        assert_eq!(clean("Calc. Phos. 6X 20g"), "Calc Phos 6X");
    }

    #[test]
    fn test_keeps_codes_without_separator() {
        // R 系列专利药名本身带数字，不能被当作单号
        assert_eq!(clean("R89 Hair Oil 100ml"), "R89 Hair Oil");
        assert_eq!(clean("BC-6 Tablets"), "BC-6 Tablets");
    }

    #[test]
    fn test_trailing_separators_and_whitespace() {
        assert_eq!(clean("  Nux   Vomica 200CH  -  "), "Nux Vomica 200CH");
        assert_eq!(clean("Rhus Tox 1M, 30 ml /"), "Rhus Tox 1M");
    }

    #[test]
    fn test_total_on_empty_and_noise_only() {
        assert_eq!(clean(""), "");
        assert_eq!(clean("(SBL) 30ml"), "");
    }

    #[test]
    fn test_quantity_split_by_dot_and_stacked_codes() {
        assert_eq!(clean("Arnica Montana 30.ml"), "Arnica Montana");
        assert_eq!(clean("OO2987 - RWC-406 - Five Phos"), "Five Phos");
    }

    #[test]
    fn test_idempotent_on_clean_names() {
        let samples = [
            "OO2987 - Arnica Montana 30C (SBL) 30ml",
            "BC.6 Biochemic Tablets",
            "Calendula Q 30ml",
            "Thuja Occidentalis LM1",
            "R89 Hair Oil",
            "- Sulphur 200",
            "Arnica Montana 30.ml",
            "OO2987 - RWC-406 - Five Phos",
        ];
        for raw in samples {
            let once = clean(raw);
            assert_eq!(clean(&once), once, "not idempotent for {raw:?}");
        }
    }
}
