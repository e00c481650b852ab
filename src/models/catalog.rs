use serde::{Deserialize, Serialize};

use super::line::{Category, DosageForm, Potency};

/// 税目分类 (HSN)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaxClass {
    /// 药品 5% GST
    Medicine,
    /// 化妆品/外用 18% GST
    Cosmetic,
}

impl TaxClass {
    pub fn for_category(category: Category) -> Self {
        match category {
            Category::OintmentCream | Category::Oil | Category::TabletGlobule => TaxClass::Cosmetic,
            Category::BioCombination
            | Category::MotherTincture
            | Category::BiochemicTrituration
            | Category::Dilution
            | Category::Syrup
            | Category::Drops
            | Category::OtherPatent => TaxClass::Medicine,
        }
    }

    pub fn hsn_code(&self) -> &'static str {
        match self {
            TaxClass::Medicine => "30049014",
            TaxClass::Cosmetic => "330499",
        }
    }
}

/// 商品目录条目，归外部目录存储所有；引擎只读或请求创建
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    pub category: Category,
    pub potency: Potency,
    pub form: DosageForm,
    pub brand: String,
    pub hsn_code: String,
}

/// 自动建档请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCatalogEntry {
    pub id: String,
    pub name: String,
    pub category: Category,
    pub potency: Potency,
    pub form: DosageForm,
    pub brand: String,
    pub tax_class: TaxClass,
}

impl NewCatalogEntry {
    pub fn into_entry(self) -> CatalogEntry {
        CatalogEntry {
            id: self.id,
            name: self.name,
            category: self.category,
            potency: self.potency,
            form: self.form,
            brand: self.brand,
            hsn_code: self.tax_class.hsn_code().to_string(),
        }
    }
}
