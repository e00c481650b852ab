use std::sync::Arc;
use invoice_reconcile::db::{PgCatalog, PgInventory, PgRepository};
use invoice_reconcile::semantic::HttpSemanticMatcher;
use invoice_reconcile::{api, create_pool, AppConfig, ReconciliationService};
use tower::ServiceBuilder;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志 - 使用本地时间格式
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(true)
        .with_level(true)
        .init();

    // 加载配置
    let config = AppConfig::load()?;
    info!(
        "Starting server on {}:{}, thresholds: {:?}",
        config.server.host, config.server.port, config.matching
    );

    // 创建数据库连接池
    let pool = create_pool(&config.database).await?;
    info!("Database pool created");

    let mut service = ReconciliationService::new(
        &config,
        Arc::new(PgCatalog::new(pool.clone())),
        Arc::new(PgRepository::new(pool.clone())),
        Arc::new(PgInventory::new(pool)),
    );

    // 语义匹配兜底 (可选)
    if config.semantic.is_active() {
        let matcher = HttpSemanticMatcher::from_config(&config.semantic)?;
        service = service.with_semantic(Arc::new(matcher), &config.semantic);
        info!("Semantic fallback enabled: {} ({})", config.semantic.endpoint, config.semantic.model);
    } else if config.semantic.enabled {
        warn!("semantic.enabled is set but no api key configured, fallback disabled");
    }

    let app = api::router(Arc::new(service)).layer(ServiceBuilder::new());

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /api/invoices/:id/parse-match  - parse and match all lines");
    info!("  POST /api/invoices/:id/auto-match   - bulk high-confidence match");
    info!("  POST /api/lines/:line_id/match      - manual override");
    info!("  GET  /api/catalog/search?q=         - catalog lookup for overrides");
    info!("  POST /api/invoices/:id/confirm      - confirm and commit goods receipt");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
