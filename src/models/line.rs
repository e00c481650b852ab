use bigdecimal::{BigDecimal, Zero};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::error::{ReconcileError, ReconcileResult};

/// 发票原始行 (RawLine)，入库后不可变
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct RawLine {
    pub line_id: i64,
    pub invoice_id: i64,
    pub line_number: i32,
    pub description: String,
    pub brand: Option<String>,           // 供应商提供的品牌字段
    pub quantity: Option<BigDecimal>,
    pub unit_price: Option<BigDecimal>,
    pub line_total: Option<BigDecimal>,
    pub batch_no: Option<String>,
    pub expiry: Option<String>,
}

impl RawLine {
    /// 校验必填字段 (描述、数量)
    pub fn validate(&self) -> ReconcileResult<()> {
        if self.description.trim().is_empty() {
            return Err(self.malformed("missing description"));
        }
        match &self.quantity {
            None => Err(self.malformed("missing quantity")),
            Some(q) if *q <= BigDecimal::zero() => Err(self.malformed("quantity must be positive")),
            Some(_) => Ok(()),
        }
    }

    pub fn malformed(&self, reason: &str) -> ReconcileError {
        ReconcileError::MalformedLine {
            line_id: self.line_id,
            reason: reason.to_string(),
        }
    }
}

/// 商品类别 (封闭集合)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    BioCombination,
    MotherTincture,
    BiochemicTrituration,
    Dilution,
    OintmentCream,
    Syrup,
    Drops,
    TabletGlobule,
    Oil,
    OtherPatent,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::BioCombination,
        Category::MotherTincture,
        Category::BiochemicTrituration,
        Category::Dilution,
        Category::OintmentCream,
        Category::Syrup,
        Category::Drops,
        Category::TabletGlobule,
        Category::Oil,
        Category::OtherPatent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::BioCombination => "bio-combination",
            Category::MotherTincture => "mother-tincture",
            Category::BiochemicTrituration => "biochemic-trituration",
            Category::Dilution => "dilution",
            Category::OintmentCream => "ointment-cream",
            Category::Syrup => "syrup",
            Category::Drops => "drops",
            Category::TabletGlobule => "tablet-globule",
            Category::Oil => "oil",
            Category::OtherPatent => "other-patent",
        }
    }

    /// 自动建档编码中的类别前缀
    pub fn code(&self) -> &'static str {
        match self {
            Category::BioCombination => "BCO",
            Category::MotherTincture => "MTQ",
            Category::BiochemicTrituration => "BCH",
            Category::Dilution => "DIL",
            Category::OintmentCream => "OIN",
            Category::Syrup => "SYR",
            Category::Drops => "DRP",
            Category::TabletGlobule => "TAB",
            Category::Oil => "OIL",
            Category::OtherPatent => "PAT",
        }
    }

    /// 类别 -> 剂型 固定映射
    pub fn dosage_form(&self) -> DosageForm {
        match self {
            Category::BioCombination => DosageForm::Tablet,
            Category::MotherTincture => DosageForm::Liquid,
            Category::BiochemicTrituration => DosageForm::Tablet,
            Category::Dilution => DosageForm::Dilution,
            Category::OintmentCream => DosageForm::Ointment,
            Category::Syrup => DosageForm::Syrup,
            Category::Drops => DosageForm::Drops,
            Category::TabletGlobule => DosageForm::Tablet,
            Category::Oil => DosageForm::Oil,
            // 剂型需由品牌/名称推断，此处不解决
            Category::OtherPatent => DosageForm::NotApplicable,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ReconcileError::Storage(format!("unknown category '{}'", s)))
    }
}

/// 剂型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DosageForm {
    Liquid,
    Dilution,
    Tablet,
    Ointment,
    Syrup,
    Drops,
    Oil,
    #[serde(rename = "NA")]
    NotApplicable,
}

impl DosageForm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DosageForm::Liquid => "liquid",
            DosageForm::Dilution => "dilution",
            DosageForm::Tablet => "tablet",
            DosageForm::Ointment => "ointment",
            DosageForm::Syrup => "syrup",
            DosageForm::Drops => "drops",
            DosageForm::Oil => "oil",
            DosageForm::NotApplicable => "NA",
        }
    }
}

impl fmt::Display for DosageForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DosageForm {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let form = match s {
            "liquid" => DosageForm::Liquid,
            "dilution" => DosageForm::Dilution,
            "tablet" => DosageForm::Tablet,
            "ointment" => DosageForm::Ointment,
            "syrup" => DosageForm::Syrup,
            "drops" => DosageForm::Drops,
            "oil" => DosageForm::Oil,
            "NA" => DosageForm::NotApplicable,
            other => return Err(ReconcileError::Storage(format!("unknown dosage form '{}'", other))),
        };
        Ok(form)
    }
}

/// 效价标记: 数字+刻度 (30C, 6X, 1M, LM1)、母酊 Q，或 NA
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Potency(String);

impl Potency {
    pub const NA: &'static str = "NA";

    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        if token.trim().is_empty() {
            Self::na()
        } else {
            Self(token.trim().to_uppercase())
        }
    }

    pub fn na() -> Self {
        Self(Self::NA.to_string())
    }

    pub fn is_na(&self) -> bool {
        self.0 == Self::NA
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Potency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 未识别品牌时的回退值
pub const UNBRANDED: &str = "unbranded";

/// 规则分类得到的商品属性，由 RawLine 确定性推导
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductAttributes {
    pub clean_name: String,
    pub category: Category,
    pub potency: Potency,
    pub form: DosageForm,
    pub brand: String,
    pub confidence: f64,
    /// 命中的类别规则名
    pub rule: String,
}
