//! 自动建档
//!
//! 级联耗尽后为商品创建目录条目。同一名称在一次调用内只创建一次。

use chrono::{Datelike, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::error::{ReconcileError, ReconcileResult};
use crate::models::{CatalogEntry, Category, NewCatalogEntry, ProductAttributes, TaxClass};
use crate::store::CatalogStore;

pub const AUTO_CREATE_CONFIDENCE: f64 = 0.95;

/// 商品编码生成
pub trait SkuGenerator: Send + Sync {
    fn generate(&self, category: Category) -> String;
}

/// `{年份}-{类别码}-{4位随机数}`
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSkuGenerator;

impl SkuGenerator for RandomSkuGenerator {
    fn generate(&self, category: Category) -> String {
        let suffix: u16 = rand::thread_rng().gen_range(1000..10000);
        format!("{}-{}-{}", Utc::now().year(), category.code(), suffix)
    }
}

/// 单次调用内按名称去重的建档缓存
#[derive(Default)]
pub struct AutoCreateCache {
    cells: DashMap<String, Arc<OnceCell<CatalogEntry>>>,
}

impl AutoCreateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, name: &str) -> Arc<OnceCell<CatalogEntry>> {
        self.cells
            .entry(name.to_lowercase())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }
}

pub struct CatalogAutoCreator {
    catalog: Arc<dyn CatalogStore>,
    skus: Box<dyn SkuGenerator>,
}

impl CatalogAutoCreator {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self::with_generator(catalog, Box::new(RandomSkuGenerator))
    }

    pub fn with_generator(catalog: Arc<dyn CatalogStore>, skus: Box<dyn SkuGenerator>) -> Self {
        Self { catalog, skus }
    }

    pub fn request(&self, attrs: &ProductAttributes) -> NewCatalogEntry {
        NewCatalogEntry {
            id: self.skus.generate(attrs.category),
            name: attrs.clean_name.clone(),
            category: attrs.category,
            potency: attrs.potency.clone(),
            form: attrs.form,
            brand: attrs.brand.clone(),
            tax_class: TaxClass::for_category(attrs.category),
        }
    }

    /// 建档；并发的同名请求共享同一结果
    pub async fn create(&self, attrs: &ProductAttributes, cache: &AutoCreateCache) -> ReconcileResult<CatalogEntry> {
        let cell = cache.cell(&attrs.clean_name);
        let entry = cell.get_or_try_init(|| self.create_with_retry(attrs)).await?;
        Ok(entry.clone())
    }

    /// 编码冲突时重新生成一次
    async fn create_with_retry(&self, attrs: &ProductAttributes) -> ReconcileResult<CatalogEntry> {
        let first = self.request(attrs);
        match self.catalog.create(&first).await {
            Ok(entry) => {
                tracing::info!("自动建档: '{}' -> {}", entry.name, entry.id);
                Ok(entry)
            }
            Err(ReconcileError::DuplicateKey(key)) => {
                tracing::warn!("SKU {} already exists, regenerating for '{}'", key, attrs.clean_name);
                let retry = self.request(attrs);
                self.catalog.create(&retry).await.map_err(|e| ReconcileError::CatalogWriteFailure {
                    name: attrs.clean_name.clone(),
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(ReconcileError::CatalogWriteFailure {
                name: attrs.clean_name.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
