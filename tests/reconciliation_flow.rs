use async_trait::async_trait;
use bigdecimal::BigDecimal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use invoice_reconcile::config::{AppConfig, SemanticConfig};
use invoice_reconcile::models::{
    CatalogEntry, Category, InvoiceStatus, LineStatus, MatchStage, Potency, RawLine,
};
use invoice_reconcile::semantic::{SemanticMatcher, SemanticQuery, SemanticVerdict};
use invoice_reconcile::service::SkuGenerator;
use invoice_reconcile::store::{
    MemoryCatalog, MemoryInventory, MemoryRepository, ReconciliationRepository,
};
use invoice_reconcile::{ReconcileError, ReconcileResult, ReconciliationService};

const INVOICE: i64 = 100;

fn line(line_id: i64, description: &str) -> RawLine {
    RawLine {
        line_id,
        invoice_id: INVOICE,
        line_number: line_id as i32,
        description: description.to_string(),
        brand: None,
        quantity: Some(BigDecimal::from(2)),
        unit_price: Some(BigDecimal::from(85)),
        line_total: Some(BigDecimal::from(170)),
        batch_no: Some(format!("B{}", line_id)),
        expiry: Some("2028-06".to_string()),
    }
}

fn entry(id: &str, name: &str, category: Category, potency: &str) -> CatalogEntry {
    CatalogEntry {
        id: id.to_string(),
        name: name.to_string(),
        category,
        potency: Potency::new(potency),
        form: category.dosage_form(),
        brand: "SBL".to_string(),
        hsn_code: "30049014".to_string(),
    }
}

fn homeopathy_catalog() -> Vec<CatalogEntry> {
    vec![
        entry("SKU-ARN30", "Arnica Montana 30C", Category::Dilution, "30C"),
        entry("SKU-NUX200", "Nux Vomica 200C", Category::Dilution, "200C"),
        entry("SKU-BELL30", "Belladonna Dilution 30C", Category::Dilution, "30C"),
        entry("SKU-ALF", "Alfalfa Malt Sf", Category::OtherPatent, "NA"),
        entry("SKU-CAL", "Cal Tone Kid Sf", Category::OtherPatent, "NA"),
        entry("SKU-SUL", "Sulphur Hahnemann 200C", Category::Dilution, "200C"),
    ]
}

struct Fixture {
    service: ReconciliationService,
    catalog: Arc<MemoryCatalog>,
    repository: Arc<MemoryRepository>,
    inventory: Arc<MemoryInventory>,
}

async fn fixture(lines: Vec<RawLine>, catalog: Vec<CatalogEntry>) -> Fixture {
    let catalog = Arc::new(MemoryCatalog::with_entries(catalog));
    let repository = Arc::new(MemoryRepository::new());
    let inventory = Arc::new(MemoryInventory::new());
    repository.ingest(lines).await;

    let service = ReconciliationService::new(
        &AppConfig::default(),
        catalog.clone(),
        repository.clone(),
        inventory.clone(),
    );
    Fixture {
        service,
        catalog,
        repository,
        inventory,
    }
}

/// 固定返回结论，可选延迟
struct FakeSemantic {
    verdict: SemanticVerdict,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeSemantic {
    fn new(verdict: SemanticVerdict, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            verdict,
            delay,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SemanticMatcher for FakeSemantic {
    async fn resolve(&self, _query: &SemanticQuery<'_>) -> ReconcileResult<SemanticVerdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.verdict)
    }
}

fn semantic_config(timeout_ms: u64) -> SemanticConfig {
    SemanticConfig {
        enabled: true,
        api_key: Some("test".to_string()),
        timeout_ms,
        ..SemanticConfig::default()
    }
}

struct ScriptedSkus(Mutex<Vec<String>>);

impl SkuGenerator for ScriptedSkus {
    fn generate(&self, _category: Category) -> String {
        self.0.lock().unwrap().remove(0)
    }
}

#[tokio::test]
async fn test_parse_example_line() {
    let f = fixture(vec![line(1, "OO2987 - Arnica Montana 30C (SBL) 30ml")], homeopathy_catalog()).await;
    let results = f.service.parse_and_match(INVOICE).await.unwrap();

    let attrs = results[0].attributes.as_ref().unwrap();
    assert_eq!(attrs.clean_name, "Arnica Montana 30C");
    assert_eq!(attrs.category, Category::Dilution);
    assert_eq!(attrs.potency.as_str(), "30C");
    assert_eq!(attrs.brand, "SBL");
    assert_eq!(results[0].stage, Some(MatchStage::Exact));
    assert_eq!(results[0].confidence, 1.0);
    assert_eq!(results[0].status, LineStatus::Matched);
}

#[tokio::test]
async fn test_bio_combination_line_is_auto_created() {
    let f = fixture(vec![line(1, "BC.6 Biochemic Tablets")], homeopathy_catalog()).await;
    let results = f.service.parse_and_match(INVOICE).await.unwrap();

    let attrs = results[0].attributes.as_ref().unwrap();
    assert_eq!(attrs.category, Category::BioCombination);
    assert_eq!(attrs.potency.as_str(), "6");
    assert_eq!(results[0].stage, Some(MatchStage::AutoCreated));
    assert_eq!(results[0].confidence, 0.95);

    let created = results[0].entry.as_ref().unwrap();
    assert!(created.id.contains("-BCO-"));
    assert_eq!(f.catalog.create_count(), 1);
}

#[tokio::test]
async fn test_exact_match_regardless_of_case() {
    let lines = vec![
        line(1, "ARNICA MONTANA 30C"),
        line(2, "nux vomica 200c"),
        line(3, "Belladonna DILUTION 30c"),
    ];
    let f = fixture(lines, homeopathy_catalog()).await;
    let results = f.service.parse_and_match(INVOICE).await.unwrap();

    for result in &results {
        assert_eq!(result.stage, Some(MatchStage::Exact), "line {}", result.line_id);
        assert_eq!(result.confidence, 1.0);
    }
    assert_eq!(f.catalog.create_count(), 0);
}

#[tokio::test]
async fn test_bulk_auto_match_commits_only_high_confidence() {
    let lines = vec![
        line(1, "OO2987 - Arnica Montana 30C (SBL) 30ml"),
        line(2, "Nux Vomica 200 C"),
        line(3, "Belladonna 30C 30ml"),
        line(4, "Alfalfa Malt"),
        line(5, "Cal Tone Kid"),
    ];
    let f = fixture(lines, homeopathy_catalog()).await;

    let summary = f.service.auto_match_high_confidence(INVOICE).await.unwrap();
    assert_eq!(summary.matched_count, 3);
    assert_eq!(summary.needs_review, 2);
    assert_eq!(summary.still_unmatched, 0);

    let rec = f.service.reconciliation(INVOICE).await.unwrap();
    let stages: Vec<_> = rec.lines.iter().map(|l| l.result.stage).collect();
    assert_eq!(
        stages,
        vec![
            Some(MatchStage::Exact),
            Some(MatchStage::Normalized),
            Some(MatchStage::AttributeFuzzy),
            Some(MatchStage::FuzzySimilarity),
            Some(MatchStage::FuzzySimilarity),
        ]
    );
    assert_eq!(rec.lines[3].result.status, LineStatus::NeedsReview);
    assert_eq!(rec.lines[3].result.confidence, 0.80);
    assert_eq!(f.catalog.create_count(), 0);
}

#[tokio::test]
async fn test_bulk_commit_uses_similarity_before_rounding() {
    let mut catalog = homeopathy_catalog();
    catalog.push(entry("SKU-ALFT", "Alfalfa Tonic Special", Category::Syrup, "NA"));
    let f = fixture(vec![line(1, "Alfalfa Tonic Specixx")], catalog).await;

    let summary = f.service.auto_match_high_confidence(INVOICE).await.unwrap();
    assert_eq!(summary.matched_count, 1);
    assert_eq!(summary.needs_review, 0);

    let rec = f.service.reconciliation(INVOICE).await.unwrap();
    let result = &rec.lines[0].result;
    assert_eq!(result.stage, Some(MatchStage::FuzzySimilarity));
    assert_eq!(result.confidence, 0.90);
    assert_eq!(result.status, LineStatus::Matched);
    assert_eq!(result.entry.as_ref().unwrap().id, "SKU-ALFT");
}

#[tokio::test]
async fn test_catalog_search_for_manual_override() {
    let f = fixture(vec![line(1, "Sulfur Hahnemann")], homeopathy_catalog()).await;

    let found = f.service.search_catalog("Sulphur Hahnemann", None).await.unwrap();
    assert_eq!(found[0].id, "SKU-SUL");

    let ranked = f.service.search_catalog("arnica 30c", Some(2)).await.unwrap();
    let ids: Vec<_> = ranked.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["SKU-ARN30", "SKU-BELL30"]);

    assert!(f.service.search_catalog(" x ", None).await.unwrap().is_empty());

    let chosen = found[0].id.clone();
    let result = f.service.override_match(1, &chosen).await.unwrap();
    assert_eq!(result.entry.unwrap().id, "SKU-SUL");
    assert_eq!(result.status, LineStatus::Matched);
}

#[tokio::test]
async fn test_auto_create_is_deduplicated_within_a_run() {
    let lines = vec![line(1, "Five Phos Tonic 450 gm"), line(2, "FIVE PHOS TONIC")];
    let f = fixture(lines, Vec::new()).await;
    let results = f.service.parse_and_match(INVOICE).await.unwrap();

    assert_eq!(f.catalog.create_count(), 1);
    let first = results[0].entry.as_ref().unwrap();
    let second = results[1].entry.as_ref().unwrap();
    assert_eq!(first.id, second.id);
    assert!(results.iter().all(|r| r.status == LineStatus::Matched));
}

#[tokio::test]
async fn test_confirm_rejected_with_one_line_under_review() {
    let lines = vec![
        line(1, "Arnica Montana 30C"),
        line(2, "Five Phos"),
        line(3, "Sulfur Hahnemann"),
    ];
    let f = fixture(lines, homeopathy_catalog()).await;
    let semantic = FakeSemantic::new(SemanticVerdict::Candidate(0), Duration::ZERO);
    let service = f.service.with_semantic(semantic.clone(), &semantic_config(1000));

    let results = service.parse_and_match(INVOICE).await.unwrap();
    assert_eq!(results[0].status, LineStatus::Matched);
    assert_eq!(results[1].stage, Some(MatchStage::AutoCreated));
    assert_eq!(results[2].stage, Some(MatchStage::SemanticFallback));
    assert_eq!(results[2].status, LineStatus::NeedsReview);
    assert_eq!(semantic.calls.load(Ordering::SeqCst), 1);

    assert_eq!(
        service.confirm(INVOICE).await,
        Err(ReconcileError::ConfirmPrecondition {
            invoice_id: INVOICE,
            unresolved: 1
        })
    );
    let rec = service.reconciliation(INVOICE).await.unwrap();
    assert_eq!(rec.status, InvoiceStatus::InProgress);
    assert_eq!(f.inventory.receipt_count().await, 0);

    // 人工确认后可以入库
    let overridden = service.override_match(3, "SKU-SUL").await.unwrap();
    assert_eq!(overridden.stage, Some(MatchStage::Manual));
    assert_eq!(overridden.confidence, 1.0);

    let receipt_id = service.confirm(INVOICE).await.unwrap();
    let receipt = f.inventory.receipt_for(INVOICE).await.unwrap();
    assert_eq!(receipt.lines.len(), 3);
    assert_eq!(receipt.total_quantity(), BigDecimal::from(6));
    assert_eq!(receipt.lines[2].entry.id, "SKU-SUL");
    assert_eq!(receipt.lines[2].line.batch_no.as_deref(), Some("B3"));

    let rec = service.reconciliation(INVOICE).await.unwrap();
    assert_eq!(rec.status, InvoiceStatus::Confirmed);
    assert_eq!(rec.receipt_id, Some(receipt_id));
}

#[tokio::test]
async fn test_confirm_is_terminal() {
    let f = fixture(vec![line(1, "Arnica Montana 30C")], homeopathy_catalog()).await;
    f.service.parse_and_match(INVOICE).await.unwrap();
    f.service.confirm(INVOICE).await.unwrap();

    assert_eq!(f.service.confirm(INVOICE).await, Err(ReconcileError::AlreadyConfirmed(INVOICE)));
    assert_eq!(
        f.service.override_match(1, "SKU-NUX200").await,
        Err(ReconcileError::AlreadyConfirmed(INVOICE))
    );
    assert_eq!(
        f.service.auto_match_high_confidence(INVOICE).await,
        Err(ReconcileError::AlreadyConfirmed(INVOICE))
    );
    assert_eq!(f.inventory.receipt_count().await, 1);
}

#[tokio::test]
async fn test_empty_invoice_cannot_be_confirmed() {
    let f = fixture(Vec::new(), homeopathy_catalog()).await;
    let empty = invoice_reconcile::models::InvoiceReconciliation::new(INVOICE, Vec::new());
    f.repository.save(&empty).await.unwrap();

    assert_eq!(f.service.confirm(INVOICE).await, Err(ReconcileError::EmptyInvoice(INVOICE)));
}

#[tokio::test]
async fn test_receipt_failure_keeps_invoice_open_and_retry_succeeds() {
    let f = fixture(vec![line(1, "Arnica Montana 30C"), line(2, "Nux Vomica 200C")], homeopathy_catalog()).await;
    f.service.parse_and_match(INVOICE).await.unwrap();

    f.inventory.fail_next(1);
    let err = f.service.confirm(INVOICE).await.unwrap_err();
    assert!(matches!(err, ReconcileError::ReceiptCommitFailure(_)));

    let rec = f.service.reconciliation(INVOICE).await.unwrap();
    assert_eq!(rec.status, InvoiceStatus::InProgress);
    assert!(rec.receipt_id.is_none());
    assert_eq!(f.inventory.receipt_count().await, 0);

    f.service.confirm(INVOICE).await.unwrap();
    assert_eq!(f.inventory.receipt_count().await, 1);
}

#[tokio::test]
async fn test_semantic_timeout_falls_through_to_auto_create() {
    let f = fixture(vec![line(1, "Sulfur Hahnemann")], homeopathy_catalog()).await;
    let semantic = FakeSemantic::new(SemanticVerdict::Candidate(0), Duration::from_millis(500));
    let service = f.service.with_semantic(semantic.clone(), &semantic_config(20));

    let results = service.parse_and_match(INVOICE).await.unwrap();
    assert_eq!(semantic.calls.load(Ordering::SeqCst), 1);
    assert_eq!(results[0].stage, Some(MatchStage::AutoCreated));
    assert_eq!(results[0].status, LineStatus::Matched);
}

#[tokio::test]
async fn test_duplicate_sku_regenerated_once_then_fails() {
    let taken = entry("2026-OTH-0001", "Existing Product", Category::OtherPatent, "NA");

    let f = fixture(vec![line(1, "Kalium Kit")], vec![taken.clone()]).await;
    let service = f.service.with_sku_generator(Box::new(ScriptedSkus(Mutex::new(vec![
        "2026-OTH-0001".to_string(),
        "2026-OTH-0002".to_string(),
    ]))));
    let results = service.parse_and_match(INVOICE).await.unwrap();
    assert_eq!(results[0].entry.as_ref().unwrap().id, "2026-OTH-0002");

    let f = fixture(vec![line(1, "Kalium Kit")], vec![taken]).await;
    let service = f.service.with_sku_generator(Box::new(ScriptedSkus(Mutex::new(vec![
        "2026-OTH-0001".to_string(),
        "2026-OTH-0001".to_string(),
    ]))));
    let results = service.parse_and_match(INVOICE).await.unwrap();
    assert_eq!(results[0].status, LineStatus::Unmatched);
    assert!(results[0].entry.is_none());
    let diagnostic = results[0].diagnostic.as_deref().unwrap();
    assert!(diagnostic.contains("No candidate"));
    assert!(diagnostic.contains("Catalog write failed"));
}

#[tokio::test]
async fn test_override_lookups() {
    let f = fixture(vec![line(1, "Arnica Montana 30C")], homeopathy_catalog()).await;

    assert_eq!(
        f.service.override_match(1, "NOPE").await,
        Err(ReconcileError::CatalogEntryNotFound("NOPE".to_string()))
    );
    assert_eq!(
        f.service.override_match(77, "SKU-ARN30").await,
        Err(ReconcileError::LineNotFound(77))
    );

    // 未解析过的行也可以直接指定，属性同时补齐
    let result = f.service.override_match(1, "SKU-NUX200").await.unwrap();
    assert_eq!(result.status, LineStatus::Matched);
    assert_eq!(result.attributes.unwrap().clean_name, "Arnica Montana 30C");
}

#[tokio::test]
async fn test_state_survives_service_restart() {
    let lines = vec![line(1, "Arnica Montana 30C"), line(2, "Alfalfa Malt")];
    let f = fixture(lines, homeopathy_catalog()).await;
    f.service.auto_match_high_confidence(INVOICE).await.unwrap();

    let restarted = ReconciliationService::new(
        &AppConfig::default(),
        f.catalog.clone(),
        f.repository.clone(),
        f.inventory.clone(),
    );
    let rec = restarted.reconciliation(INVOICE).await.unwrap();
    let counts = rec.counts();
    assert_eq!(counts.matched, 1);
    assert_eq!(counts.needs_review, 1);

    // 重新解析只处理未 matched 的行
    let results = restarted.parse_and_match(INVOICE).await.unwrap();
    assert_eq!(results[0].stage, Some(MatchStage::Exact));
    assert_eq!(results[1].stage, Some(MatchStage::AutoCreated));
}

#[tokio::test]
async fn test_export_csv_lists_every_line() {
    let f = fixture(vec![line(1, "Arnica Montana 30C"), line(2, "Nux Vomica 200C")], homeopathy_catalog()).await;
    f.service.parse_and_match(INVOICE).await.unwrap();

    let csv = String::from_utf8(f.service.export_csv(INVOICE).await.unwrap()).unwrap();
    let rows: Vec<_> = csv.lines().collect();
    assert_eq!(rows.len(), 3);
    assert!(rows[1].contains("SKU-ARN30"));
    assert!(rows[2].contains("exact"));
}
