use {
    anyhow::Context as _,
    kernel_service::{
        idempotency::IdempotencyLayer,
        routes,
        stream::{HttpArchive, StreamStats, StreamWorker},
        AppState,
    },
    kernel_sdk::{
        audit::{AuditStore, MemoryAuditStore, PgAuditStore},
        config::KernelConfig,
        entity::{EntityStore, MemoryEntityStore, PgEntityStore},
        idempotency::{IdempotencyStore, MemoryIdempotencyStore, PgIdempotencyStore},
        kernel::Kernel,
        manifest::{ManifestRegistry, MemoryManifestRegistry, PgManifestRegistry},
        registry::SignerRegistry,
        signer::build_signer,
        upgrade::{MemoryUpgradeStore, PgUpgradeStore, UpgradeStore},
    },
    sqlx::postgres::PgPoolOptions,
    std::sync::Arc,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = KernelConfig::load().context("invalid configuration")?;
    let config = KernelConfig::init(config).clone();

    let signer =
        build_signer(&config.signing, config.env).context("signer startup check failed")?;

    let (audit, manifests, entities, upgrades, idempotency): (
        Arc<dyn AuditStore>,
        Arc<dyn ManifestRegistry>,
        Arc<dyn EntityStore>,
        Arc<dyn UpgradeStore>,
        Arc<dyn IdempotencyStore>,
    ) = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(16)
                .connect(url)
                .await
                .context("cannot connect to database")?;
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("database migration failed")?;
            (
                Arc::new(PgAuditStore::new(pool.clone(), signer.clone())),
                Arc::new(PgManifestRegistry::new(pool.clone())),
                Arc::new(PgEntityStore::new(pool.clone())),
                Arc::new(PgUpgradeStore::new(pool.clone())),
                Arc::new(PgIdempotencyStore::new(pool)),
            )
        }
        None => {
            log::warn!("DATABASE_URL is not set; running on in-memory stores");
            (
                Arc::new(MemoryAuditStore::new(signer.clone())),
                Arc::new(MemoryManifestRegistry::new()),
                Arc::new(MemoryEntityStore::new()),
                Arc::new(MemoryUpgradeStore::new()),
                Arc::new(MemoryIdempotencyStore::new()),
            )
        }
    };

    let approver_keys = match &config.registry_path {
        Some(path) => SignerRegistry::from_path(path)
            .with_context(|| format!("cannot load signer registry from {}", path.display()))?,
        None => {
            if !config.upgrade.approver_ids.is_empty() {
                log::warn!(
                    "UPGRADE_APPROVER_IDS is set but KERNEL_SIGNER_REGISTRY is not; \
                     approvals cannot be verified"
                );
            }
            SignerRegistry::default()
        }
    };

    let kernel = Kernel::new(
        signer,
        audit.clone(),
        manifests,
        entities,
        upgrades,
        approver_keys,
        config.upgrade.clone(),
    );

    let stream_stats = Arc::new(StreamStats::new());
    match &config.archive {
        Some(archive) => {
            let worker = StreamWorker::new(
                audit,
                Arc::new(HttpArchive::new(archive)),
                stream_stats.clone(),
                config.stream_batch_size,
                config.stream_interval,
            );
            worker.spawn();
            log::info!("streaming worker started (archive: {})", archive.url);
        }
        None => log::info!("ARCHIVE_URL is not set; audit streaming is disabled"),
    }

    let layer = IdempotencyLayer::new(
        idempotency,
        config.idempotency_body_limit,
        config.idempotency_ttl,
    );
    let addr = config.listen_addr();
    let state = Arc::new(AppState::new(kernel, layer, config, stream_stats));

    log::info!("kernel listening on {addr}");
    warp::serve(routes(state)).run(addr).await;
    Ok(())
}
